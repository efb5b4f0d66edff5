//! Account aggregate
//!
//! The in-memory object whose state is the fold of its events, and the loader
//! that reconstructs it. Only the pipeline's apply stage mutates a live
//! aggregate; everything else reads a reconstruction or the cached instance.

mod account;
mod loader;

pub use account::Account;
pub use loader::{AggregateLoader, SharedAccount};
