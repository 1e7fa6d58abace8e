//! Wire encoding for raw series records.
//!
//! A write-raw-series payload is a concatenation of records, each
//! `[series id: u32 | payload len: u32 | timestamp: i64 | payload]`.
//! The payload encodes fields as `[field id: u8 | type tag: u8 | value]`
//! so a decoder can skip field ids it does not know. All integers are
//! big-endian; the choice is fixed for a deployment and both ends of
//! every topic use this module.

use std::collections::HashMap;

use common::time::UnixNano;
use common::{FieldType, FieldValue};

use crate::catalog::Measurement;
use crate::error::{Error, Result};

/// Size of the fixed record header.
pub const POINT_HEADER_SIZE: usize = 4 + 4 + 8;

const TAG_FLOAT: u8 = 0x00;
const TAG_INTEGER: u8 = 0x01;
const TAG_BOOLEAN: u8 = 0x02;
const TAG_STRING: u8 = 0x03;

/// Encodes a record header.
pub fn marshal_point_header(series_id: u32, payload_len: u32, timestamp: UnixNano) -> Vec<u8> {
    let mut buf = Vec::with_capacity(POINT_HEADER_SIZE);
    buf.extend_from_slice(&series_id.to_be_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Decodes a record header. The slice must hold at least
/// `POINT_HEADER_SIZE` bytes.
pub fn unmarshal_point_header(buf: &[u8]) -> Result<(u32, u32, UnixNano)> {
    if buf.len() < POINT_HEADER_SIZE {
        return Err(Error::InvalidPointRecord);
    }
    let series_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let payload_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let timestamp = i64::from_be_bytes(buf[8..16].try_into().unwrap());
    Ok((series_id, payload_len, timestamp))
}

/// Per-measurement codec translating between field names and the
/// compact id-keyed on-disk representation.
pub struct FieldCodec {
    fields_by_id: HashMap<u8, (String, FieldType)>,
    fields_by_name: HashMap<String, (u8, FieldType)>,
}

impl FieldCodec {
    pub fn new(measurement: &Measurement) -> FieldCodec {
        let mut fields_by_id = HashMap::new();
        let mut fields_by_name = HashMap::new();
        for f in &measurement.fields {
            fields_by_id.insert(f.id, (f.name.clone(), f.field_type));
            fields_by_name.insert(f.name.clone(), (f.id, f.field_type));
        }
        FieldCodec {
            fields_by_id,
            fields_by_name,
        }
    }

    /// Encodes a name-keyed value map. Fields are emitted in id order so
    /// equal maps always encode identically.
    pub fn encode_fields(&self, values: &HashMap<String, FieldValue>) -> Result<Vec<u8>> {
        let mut entries: Vec<(u8, &FieldValue)> = Vec::with_capacity(values.len());
        for (name, value) in values {
            let (id, field_type) = self
                .fields_by_name
                .get(name)
                .ok_or_else(|| Error::FieldUnmapped(name.clone()))?;
            if value.field_type() != *field_type {
                return Err(Error::FieldTypeConflict {
                    field: name.clone(),
                    existing: *field_type,
                    given: value.field_type(),
                });
            }
            entries.push((*id, value));
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut buf = Vec::new();
        for (id, value) in entries {
            buf.push(id);
            match value {
                FieldValue::Float(v) => {
                    buf.push(TAG_FLOAT);
                    buf.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                FieldValue::Integer(v) => {
                    buf.push(TAG_INTEGER);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                FieldValue::Boolean(v) => {
                    buf.push(TAG_BOOLEAN);
                    buf.push(u8::from(*v));
                }
                FieldValue::String(v) => {
                    buf.push(TAG_STRING);
                    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    buf.extend_from_slice(v.as_bytes());
                }
            }
        }
        Ok(buf)
    }

    /// Decodes a payload into an id-keyed value map. Field ids not known
    /// to this measurement are skipped.
    pub fn decode_fields(&self, mut buf: &[u8]) -> Result<HashMap<u8, FieldValue>> {
        let mut values = HashMap::new();
        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(Error::InvalidPointRecord);
            }
            let id = buf[0];
            let tag = buf[1];
            buf = &buf[2..];

            let (value, size) = match tag {
                TAG_FLOAT => {
                    if buf.len() < 8 {
                        return Err(Error::InvalidPointRecord);
                    }
                    let bits = u64::from_be_bytes(buf[0..8].try_into().unwrap());
                    (FieldValue::Float(f64::from_bits(bits)), 8)
                }
                TAG_INTEGER => {
                    if buf.len() < 8 {
                        return Err(Error::InvalidPointRecord);
                    }
                    (
                        FieldValue::Integer(i64::from_be_bytes(buf[0..8].try_into().unwrap())),
                        8,
                    )
                }
                TAG_BOOLEAN => {
                    if buf.is_empty() {
                        return Err(Error::InvalidPointRecord);
                    }
                    (FieldValue::Boolean(buf[0] != 0), 1)
                }
                TAG_STRING => {
                    if buf.len() < 2 {
                        return Err(Error::InvalidPointRecord);
                    }
                    let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
                    if buf.len() < 2 + len {
                        return Err(Error::InvalidPointRecord);
                    }
                    let s = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
                    (FieldValue::String(s), 2 + len)
                }
                _ => return Err(Error::InvalidPointRecord),
            };
            buf = &buf[size..];

            if self.fields_by_id.contains_key(&id) {
                values.insert(id, value);
            }
        }
        Ok(values)
    }

    /// Decodes a payload into a name-keyed value map.
    pub fn decode_fields_by_name(&self, buf: &[u8]) -> Result<HashMap<String, FieldValue>> {
        let raw = self.decode_fields(buf)?;
        let mut values = HashMap::with_capacity(raw.len());
        for (id, value) in raw {
            if let Some((name, _)) = self.fields_by_id.get(&id) {
                values.insert(name.clone(), value);
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement() -> Measurement {
        let mut m = Measurement::new("cpu");
        m.create_field_if_not_exists("value", FieldType::Float).unwrap();
        m.create_field_if_not_exists("count", FieldType::Integer)
            .unwrap();
        m.create_field_if_not_exists("up", FieldType::Boolean).unwrap();
        m.create_field_if_not_exists("note", FieldType::String).unwrap();
        m
    }

    #[test]
    fn header_round_trip() {
        let buf = marshal_point_header(42, 9, -1_000_000_007);
        assert_eq!(buf.len(), POINT_HEADER_SIZE);
        let (series, len, ts) = unmarshal_point_header(&buf).unwrap();
        assert_eq!((series, len, ts), (42, 9, -1_000_000_007));
    }

    #[test]
    fn fields_round_trip() {
        let m = measurement();
        let codec = FieldCodec::new(&m);

        let mut values = HashMap::new();
        values.insert("value".to_string(), FieldValue::Float(0.64));
        values.insert("count".to_string(), FieldValue::Integer(-3));
        values.insert("up".to_string(), FieldValue::Boolean(true));
        values.insert("note".to_string(), FieldValue::String("ok".into()));

        let encoded = codec.encode_fields(&values).unwrap();
        let decoded = codec.decode_fields_by_name(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let full = measurement();
        let codec = FieldCodec::new(&full);
        let mut values = HashMap::new();
        values.insert("value".to_string(), FieldValue::Float(1.0));
        values.insert("note".to_string(), FieldValue::String("x".into()));
        let encoded = codec.encode_fields(&values).unwrap();

        // A measurement that only knows "value" skips the string field.
        let mut narrow = Measurement::new("cpu");
        narrow
            .create_field_if_not_exists("value", FieldType::Float)
            .unwrap();
        let narrow_codec = FieldCodec::new(&narrow);
        let decoded = narrow_codec.decode_fields_by_name(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["value"], FieldValue::Float(1.0));
    }

    #[test]
    fn encode_rejects_unmapped_and_mistyped_fields() {
        let m = measurement();
        let codec = FieldCodec::new(&m);

        let mut values = HashMap::new();
        values.insert("missing".to_string(), FieldValue::Float(1.0));
        assert!(matches!(
            codec.encode_fields(&values),
            Err(Error::FieldUnmapped(_))
        ));

        let mut values = HashMap::new();
        values.insert("count".to_string(), FieldValue::Float(1.0));
        assert!(matches!(
            codec.encode_fields(&values),
            Err(Error::FieldTypeConflict { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let m = measurement();
        let codec = FieldCodec::new(&m);
        let mut values = HashMap::new();
        values.insert("value".to_string(), FieldValue::Float(1.0));
        let encoded = codec.encode_fields(&values).unwrap();
        assert!(codec.decode_fields(&encoded[..encoded.len() - 1]).is_err());
    }
}
