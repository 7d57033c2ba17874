//! # fleet-events
//!
//! Event records emitted by the fleet controller against the objects it
//! manages.
//!
//! ## Design Principles
//!
//! - Events are the user-visible trail of what the controller decided
//! - Every event names exactly one involved object
//! - Reasons come from a closed catalogue so they can be filtered on
//! - Events are informational; losing one never changes reconcile outcomes

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
