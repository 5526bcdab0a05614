//! Service layer for recollect-server
//!
//! Background work that runs alongside the request loop.

pub mod maintenance;

pub use maintenance::MaintenanceService;
