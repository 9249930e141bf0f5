//! # muster-value
//!
//! The self-describing tagged value used as the replication payload and the
//! session wire format. Values are cheap to clone (shared buffers), preserve
//! document field order, and round-trip through a length-prefixed binary
//! codec.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod builder;
mod codec;
mod error;
mod reason;
mod value;

pub use builder::{Arr, Doc};
pub use codec::{decode_value, encode_value};
pub use error::{ValueError, ValueResult};
pub use reason::{reason, Reason};
pub use value::{for_each_object_id, Value};
