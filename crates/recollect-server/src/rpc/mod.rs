//! JSON-RPC 2.0 over a line-oriented transport.
//!
//! One message (or batch) per line in, one response line out. Notifications
//! and all-notification batches produce no output.

pub mod dispatch;
pub mod types;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::state::AppState;
use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};

/// Serve requests until EOF.
pub async fn serve<R, W>(state: &AppState, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(response) = handle_line(state, trimmed).await {
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }

    tracing::debug!("Input closed");
    Ok(())
}

/// Handle one line; `None` means nothing is written back.
pub async fn handle_line(state: &AppState, line: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return encode(&JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::parse_error(e),
            ));
        }
    };

    match value {
        Value::Array(items) if items.is_empty() => encode(&JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::invalid_request("empty batch"),
        )),
        Value::Array(items) => {
            let mut responses = Vec::with_capacity(items.len());
            for item in items {
                if let Some(response) = handle_message(state, item).await {
                    responses.push(response);
                }
            }
            if responses.is_empty() {
                None
            } else {
                encode(&responses)
            }
        }
        single => match handle_message(state, single).await {
            Some(response) => encode(&response),
            None => None,
        },
    }
}

/// Validate and dispatch one message.
async fn handle_message(state: &AppState, message: Value) -> Option<JsonRpcResponse> {
    let Value::Object(object) = message else {
        return Some(JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::invalid_request("request must be an object"),
        ));
    };

    let request = match validate(object) {
        Ok(request) => request,
        Err((id, error)) => return Some(JsonRpcResponse::failure(id, error)),
    };
    let JsonRpcRequest {
        id, method, params, ..
    } = request;

    let outcome = dispatch::dispatch(state, &method, params).await;

    let Some(id) = id else {
        if let Err(error) = &outcome {
            tracing::debug!(method = %method, code = error.code, error = %error.message, "Notification failed");
        }
        return None;
    };

    Some(match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => {
            tracing::debug!(method = %method, code = error.code, error = %error.message, "Request failed");
            JsonRpcResponse::failure(id, error)
        }
    })
}

fn validate(mut object: Map<String, Value>) -> Result<JsonRpcRequest, (Value, JsonRpcError)> {
    let id = object.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);

    let jsonrpc = match object.remove("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => version,
        _ => {
            return Err((
                reply_id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }
    };
    if !matches!(
        id,
        None | Some(Value::Null | Value::String(_) | Value::Number(_))
    ) {
        return Err((
            Value::Null,
            JsonRpcError::invalid_request("id must be a string or number"),
        ));
    }
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err((
                reply_id,
                JsonRpcError::invalid_request("method must be a string"),
            ));
        }
    };

    Ok(JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params: object.remove("params"),
    })
}

fn encode<T: serde::Serialize>(response: &T) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode response");
            None
        }
    }
}
