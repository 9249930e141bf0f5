//! Document and array builders

use crate::value::Value;
use std::sync::Arc;

/// Builder for document values
///
/// ```
/// use muster_value::Doc;
/// let packet = Doc::new().field("m", 1).field("id", "abc").build();
/// assert_eq!(packet.get("m").as_i32(), Some(1));
/// ```
#[derive(Default)]
pub struct Doc {
    fields: Vec<(String, Value)>,
}

impl Doc {
    /// Start an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Append a field only when `value` is `Some`
    pub fn field_opt(self, name: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    /// Finish into a `Value::Document`
    pub fn build(self) -> Value {
        Value::Document(Arc::new(self.fields))
    }
}

/// Builder for array values
#[derive(Default)]
pub struct Arr {
    items: Vec<Value>,
}

impl Arr {
    /// Start an empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item
    pub fn item(mut self, value: impl Into<Value>) -> Self {
        self.items.push(value.into());
        self
    }

    /// Append every item from an iterator
    pub fn items(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.items.extend(values);
        self
    }

    /// Finish into a `Value::Array`
    pub fn build(self) -> Value {
        Value::Array(Arc::new(self.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_builder() {
        let doc = Doc::new().field("a", 1).field("b", true).build();
        assert_eq!(doc.get("a").as_i32(), Some(1));
        assert_eq!(doc.get("b").as_bool(), Some(true));
    }

    #[test]
    fn test_doc_field_opt() {
        let doc = Doc::new()
            .field_opt("present", Some(1))
            .field_opt("absent", None::<i32>)
            .build();
        assert!(doc.get("present").has_value());
        assert!(doc.get("absent").is_undefined());
    }

    #[test]
    fn test_arr_builder() {
        let arr = Arr::new().item(1).item("two").build();
        assert_eq!(arr.items().len(), 2);
        assert_eq!(arr.items()[0].as_i32(), Some(1));
        assert_eq!(arr.items()[1].as_str(), Some("two"));
    }

    #[test]
    fn test_arr_items_extend() {
        let arr = Arr::new()
            .items((0..3).map(Value::Int32))
            .build();
        assert_eq!(arr.items().len(), 3);
    }

    #[test]
    fn test_empty_builders() {
        assert!(Doc::new().build().fields().is_empty());
        assert!(Arr::new().build().items().is_empty());
    }

    #[test]
    fn test_nested() {
        let doc = Doc::new()
            .field("list", Arr::new().item(Doc::new().field("x", 1).build()).build())
            .build();
        assert_eq!(doc.get("list").items()[0].get("x").as_i32(), Some(1));
    }
}
