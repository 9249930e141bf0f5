//! Rejection payloads
//!
//! Service and session rejections carry a `Reason`: a document with `name`,
//! `message` and `status` fields flowing through the rejection channel.

use crate::builder::Doc;
use crate::value::Value;
use std::fmt;

/// Build a rejection payload document
pub fn reason(status: i32, message: impl Into<String>) -> Value {
    Doc::new()
        .field("name", "Reason")
        .field("message", message.into())
        .field("status", status)
        .build()
}

/// A rejection payload wrapped as an error
#[derive(Clone, PartialEq)]
pub struct Reason(pub Value);

impl Reason {
    /// Build from a status code and message
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Reason(reason(status, message))
    }

    /// The status code, 500 when absent
    pub fn status(&self) -> i32 {
        self.0.get("status").as_i32().unwrap_or(500)
    }

    /// The message text
    pub fn message(&self) -> &str {
        self.0.get("message").as_str().unwrap_or("")
    }

    /// The underlying value
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Reason {
    fn from(value: Value) -> Self {
        Reason(value)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reason({:?})", self.0)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.status())
    }
}

impl std::error::Error for Reason {}
