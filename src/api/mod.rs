//! API module
//!
//! HTTP surface: transaction producers and read-side queries.

pub mod routes;

pub use routes::{create_router, AppState};
