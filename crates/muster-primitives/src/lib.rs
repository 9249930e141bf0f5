//! # muster-primitives
//!
//! Core primitive types shared by every crate in the Muster runtime:
//! object identifiers, process descriptors, and federation descriptors.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod object_id;
mod process;

pub use error::{PrimitiveError, PrimitiveResult};
pub use object_id::ObjectId;
pub use process::{FederationType, ObjectChange, ProcessAddr, ProcessAuth, ProcessType};
