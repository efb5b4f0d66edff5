//! Domain module
//!
//! Value objects and facts shared by every layer of the write side.

pub mod amount;
pub mod error;
pub mod event;

pub use amount::{Amount, AmountError, Balance};
pub use error::DomainError;
pub use event::{stream_for_account, tags, AccountEvent, EventKind};
