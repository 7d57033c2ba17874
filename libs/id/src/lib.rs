//! # fleet-id
//!
//! Typed object UIDs for the fleet reconciliation engine.
//!
//! Names are user-controlled and may be reused after an object is deleted;
//! UIDs are system-generated and never reused. Ownership between an instance
//! and its fleet is expressed by UID so that a fleet recreated under the same
//! name is never confused with its predecessor.
//!
//! ## UID Format
//!
//! All UIDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `flt_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The ULID half keeps UIDs sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::{IdError, IdProblem};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
