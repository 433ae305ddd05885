//! Data model shared by every Brain component.
//!
//! Internal bookkeeping (leases, store versions) is kept out of these types
//! and lives in the [`domain`](crate::domain) module.

pub mod event;
pub mod schedule;
pub mod task;

pub use event::*;
pub use schedule::*;
pub use task::*;
