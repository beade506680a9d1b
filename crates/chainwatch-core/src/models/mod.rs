//! Data models for Chainwatch

mod alert;
mod snapshot;
mod target;

pub use alert::*;
pub use snapshot::*;
pub use target::*;
