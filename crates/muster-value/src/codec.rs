//! Binary value codec
//!
//! Wire format: one tag byte per value, scalars in little-endian, strings and
//! binary length-prefixed with a u32, documents and arrays prefixed with
//! their total encoded byte length so a reader can skip unknown content.
//! Document entries are a u16 key length, the key bytes, then the value.

use crate::error::{ValueError, ValueResult};
use crate::value::Value;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use muster_primitives::ObjectId;
use std::sync::Arc;

const TAG_UNDEFINED: u8 = 0;
const TAG_NULL: u8 = 1;
const TAG_BOOLEAN: u8 = 2;
const TAG_INT32: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_OBJECT_ID: u8 = 6;
const TAG_BINARY: u8 = 7;
const TAG_DOCUMENT: u8 = 8;
const TAG_ARRAY: u8 = 9;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// Encode a value to bytes
pub fn encode_value(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    write_value(&mut buf, value);
    buf.freeze()
}

fn write_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Undefined => buf.put_u8(TAG_UNDEFINED),
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Boolean(b) => {
            buf.put_u8(TAG_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        Value::Int32(i) => {
            buf.put_u8(TAG_INT32);
            buf.put_i32_le(*i);
        }
        Value::Double(d) => {
            buf.put_u8(TAG_DOUBLE);
            buf.put_f64_le(*d);
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::ObjectId(id) => {
            buf.put_u8(TAG_OBJECT_ID);
            buf.put_slice(id.as_bytes());
        }
        Value::Binary(b) => {
            buf.put_u8(TAG_BINARY);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Document(fields) => {
            buf.put_u8(TAG_DOCUMENT);
            let mut body = BytesMut::new();
            for (key, value) in fields.iter() {
                body.put_u16_le(key.len() as u16);
                body.put_slice(key.as_bytes());
                write_value(&mut body, value);
            }
            buf.put_u32_le(body.len() as u32);
            buf.put_slice(&body);
        }
        Value::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            let mut body = BytesMut::new();
            for value in items.iter() {
                write_value(&mut body, value);
            }
            buf.put_u32_le(body.len() as u32);
            buf.put_slice(&body);
        }
    }
}

/// Decode a value from bytes
pub fn decode_value(mut data: Bytes) -> ValueResult<Value> {
    read_value(&mut data, 0)
}

fn need(data: &Bytes, len: usize) -> ValueResult<()> {
    if data.remaining() < len {
        Err(ValueError::Truncated {
            needed: len - data.remaining(),
        })
    } else {
        Ok(())
    }
}

fn read_value(data: &mut Bytes, depth: usize) -> ValueResult<Value> {
    if depth > MAX_DEPTH {
        return Err(ValueError::BadLength);
    }
    need(data, 1)?;
    let tag = data.get_u8();
    match tag {
        TAG_UNDEFINED => Ok(Value::Undefined),
        TAG_NULL => Ok(Value::Null),
        TAG_BOOLEAN => {
            need(data, 1)?;
            Ok(Value::Boolean(data.get_u8() != 0))
        }
        TAG_INT32 => {
            need(data, 4)?;
            Ok(Value::Int32(data.get_i32_le()))
        }
        TAG_DOUBLE => {
            need(data, 8)?;
            Ok(Value::Double(data.get_f64_le()))
        }
        TAG_STRING => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            let bytes = data.split_to(len);
            let s = std::str::from_utf8(&bytes).map_err(|_| ValueError::InvalidUtf8)?;
            Ok(Value::String(Arc::from(s)))
        }
        TAG_OBJECT_ID => {
            need(data, ObjectId::LEN)?;
            let bytes = data.split_to(ObjectId::LEN);
            Ok(Value::ObjectId(
                ObjectId::from_slice(&bytes).map_err(|_| ValueError::BadLength)?,
            ))
        }
        TAG_BINARY => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            Ok(Value::Binary(data.split_to(len)))
        }
        TAG_DOCUMENT => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            let mut body = data.split_to(len);
            let mut fields = Vec::new();
            while body.has_remaining() {
                need(&body, 2)?;
                let key_len = body.get_u16_le() as usize;
                need(&body, key_len)?;
                let key_bytes = body.split_to(key_len);
                let key = std::str::from_utf8(&key_bytes)
                    .map_err(|_| ValueError::InvalidUtf8)?
                    .to_owned();
                let value = read_value(&mut body, depth + 1)?;
                fields.push((key, value));
            }
            Ok(Value::Document(Arc::new(fields)))
        }
        TAG_ARRAY => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            let mut body = data.split_to(len);
            let mut items = Vec::new();
            while body.has_remaining() {
                items.push(read_value(&mut body, depth + 1)?);
            }
            Ok(Value::Array(Arc::new(items)))
        }
        other => Err(ValueError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Arr, Doc};

    fn round_trip(value: Value) -> Value {
        decode_value(encode_value(&value)).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(round_trip(Value::Undefined), Value::Undefined);
        assert_eq!(round_trip(Value::Null), Value::Null);
        assert_eq!(round_trip(Value::Boolean(true)), Value::Boolean(true));
        assert_eq!(round_trip(Value::Int32(-7)), Value::Int32(-7));
        assert_eq!(round_trip(Value::Double(2.25)), Value::Double(2.25));
        assert_eq!(round_trip(Value::from("alpha")), Value::from("alpha"));
    }

    #[test]
    fn test_object_id_and_binary() {
        let id = ObjectId::create();
        assert_eq!(round_trip(Value::from(id)).as_object_id(), Some(id));
        let blob = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(round_trip(Value::Binary(blob.clone())).as_binary(), Some(&blob));
    }

    #[test]
    fn test_document() {
        let doc = Doc::new()
            .field("m", 3)
            .field("x", "federation")
            .field("t", 0.125)
            .build();
        let decoded = round_trip(doc);
        assert_eq!(decoded.get("m").as_i32(), Some(3));
        assert_eq!(decoded.get("x").as_str(), Some("federation"));
        assert_eq!(decoded.get("t").as_f64(), Some(0.125));
    }

    #[test]
    fn test_nested_envelope() {
        let packet = Doc::new()
            .field("i", 1)
            .field("r", 0)
            .field("t", 250)
            .field(
                "p",
                Doc::new()
                    .field("m", 3)
                    .field("mm", Arr::new().item(Doc::new().field("m", 1).build()).build())
                    .build(),
            )
            .build();
        let decoded = round_trip(packet);
        let messages = decoded.get("p").get("mm");
        assert_eq!(messages.items().len(), 1);
        assert_eq!(messages.items()[0].get("m").as_i32(), Some(1));
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(round_trip(Doc::new().build()).fields().len(), 0);
        assert_eq!(round_trip(Arr::new().build()).items().len(), 0);
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode_value(&Doc::new().field("k", "value").build());
        let cut = encoded.slice(..encoded.len() - 3);
        assert!(decode_value(cut).is_err());
    }

    #[test]
    fn test_decode_unknown_tag() {
        let data = Bytes::from_static(&[0x42]);
        assert!(matches!(
            decode_value(data),
            Err(ValueError::UnknownTag(0x42))
        ));
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode_value(Bytes::new()).is_err());
    }

    #[test]
    fn test_decode_bad_utf8() {
        // string of length 2 with invalid utf-8 bytes
        let data = Bytes::from_static(&[TAG_STRING, 2, 0, 0, 0, 0xFF, 0xFE]);
        assert!(matches!(decode_value(data), Err(ValueError::InvalidUtf8)));
    }
}
