// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Turns JSON messages into protobuf encoded rows of a [`RowSchema`].
//!
//! Values are validated against the schema while encoding; fields are always
//! written in column order, independent of the key order of the input.

use crate::{
    gbq::schema::{Field, Fields, RowSchema},
    output::{Message, Payload},
};
use base64::Engine;
use googapis::google::cloud::bigquery::storage::v1::table_field_schema::Type as TableType;
use prost::encoding::WireType;
use simd_json::{OwnedValue, StaticNode};

/// Why a single message could not be turned into a row
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// the payload bytes couldn't be obtained
    #[error("invalid payload: {0}")]
    Payload(String),
    /// the payload isn't a single JSON document
    #[error("invalid JSON: {0}")]
    Json(String),
    /// rows have to be JSON objects
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    /// a key that isn't a column of the table
    #[error("field {0} is not part of the table schema")]
    UnknownField(String),
    /// a REQUIRED column is missing or null
    #[error("required field {0} is missing")]
    MissingRequired(String),
    /// the JSON value doesn't fit the column type
    #[error("field {field}: expected {expected}, got {got}")]
    TypeMismatch {
        /// dotted path of the field
        field: String,
        /// what the column accepts
        expected: &'static str,
        /// what we got
        got: &'static str,
    },
    /// a BYTES column with a value that isn't valid base64
    #[error("field {field}: invalid base64: {error}")]
    InvalidBase64 {
        /// dotted path of the field
        field: String,
        /// decoder error
        error: String,
    },
}

/// Converts messages into rows with the configured leniency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowConverter {
    allow_partial: bool,
    discard_unknown: bool,
}

impl RowConverter {
    /// `allow_partial` tolerates missing required fields, `discard_unknown`
    /// drops keys that aren't columns instead of rejecting the row.
    #[must_use]
    pub fn new(allow_partial: bool, discard_unknown: bool) -> Self {
        Self {
            allow_partial,
            discard_unknown,
        }
    }

    /// Converts a message into an encoded row
    ///
    /// # Errors
    /// if the message isn't a single JSON object matching the schema
    pub fn convert(&self, schema: &RowSchema, msg: &Message) -> Result<Vec<u8>, ConversionError> {
        match msg.payload() {
            Payload::Structured(value) => self.encode(schema, value),
            Payload::Raw(_) => {
                let mut data = msg
                    .as_bytes()
                    .map_err(|e| ConversionError::Payload(e.to_string()))?
                    .into_owned();
                let value = parse(&mut data)?;
                self.encode(schema, &value)
            }
        }
    }

    /// Encodes a JSON object as a row
    ///
    /// # Errors
    /// if the value doesn't match the schema
    pub fn encode(&self, schema: &RowSchema, value: &OwnedValue) -> Result<Vec<u8>, ConversionError> {
        let mut result = Vec::new();
        self.encode_object(value, schema.fields(), "", &mut result)?;
        Ok(result)
    }

    fn encode_object(
        &self,
        value: &OwnedValue,
        fields: &Fields,
        prefix: &str,
        result: &mut Vec<u8>,
    ) -> Result<(), ConversionError> {
        let OwnedValue::Object(obj) = value else {
            return Err(ConversionError::NotAnObject(type_name(value)));
        };

        if !self.discard_unknown {
            if let Some(key) = obj.keys().find(|k| fields.get(k.as_str()).is_none()) {
                return Err(ConversionError::UnknownField(path(prefix, key)));
            }
        }

        for field in fields.iter() {
            match obj.get(field.name.as_str()) {
                None | Some(OwnedValue::Static(StaticNode::Null)) => {
                    if field.is_required() && !self.allow_partial {
                        return Err(ConversionError::MissingRequired(path(prefix, &field.name)));
                    }
                }
                Some(val) if field.is_repeated() => {
                    let OwnedValue::Array(values) = val else {
                        return Err(mismatch(prefix, field, "array", val));
                    };
                    for v in values.iter() {
                        self.encode_field(v, field, prefix, result)?;
                    }
                }
                Some(val) => self.encode_field(val, field, prefix, result)?,
            }
        }
        Ok(())
    }

    fn encode_field(
        &self,
        val: &OwnedValue,
        field: &Field,
        prefix: &str,
        result: &mut Vec<u8>,
    ) -> Result<(), ConversionError> {
        let tag = field.tag;

        match field.table_type {
            TableType::Double => {
                let v = match val {
                    OwnedValue::Static(StaticNode::F64(f)) => *f,
                    #[allow(clippy::cast_precision_loss)]
                    OwnedValue::Static(StaticNode::I64(i)) => *i as f64,
                    #[allow(clippy::cast_precision_loss)]
                    OwnedValue::Static(StaticNode::U64(u)) => *u as f64,
                    other => return Err(mismatch(prefix, field, "number", other)),
                };
                prost::encoding::double::encode(tag, &v, result);
            }
            TableType::Int64 => {
                let v = match val {
                    OwnedValue::Static(StaticNode::I64(i)) => Some(*i),
                    OwnedValue::Static(StaticNode::U64(u)) => i64::try_from(*u).ok(),
                    OwnedValue::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| mismatch(prefix, field, "integer", val))?;
                prost::encoding::int64::encode(tag, &v, result);
            }
            TableType::Bool => {
                let OwnedValue::Static(StaticNode::Bool(b)) = val else {
                    return Err(mismatch(prefix, field, "bool", val));
                };
                prost::encoding::bool::encode(tag, b, result);
            }
            TableType::String
            | TableType::Date
            | TableType::Time
            | TableType::Datetime
            | TableType::Timestamp
            | TableType::Numeric
            | TableType::Bignumeric
            | TableType::Geography
            | TableType::Interval => {
                let OwnedValue::String(s) = val else {
                    return Err(mismatch(prefix, field, "string", val));
                };
                prost::encoding::string::encode(tag, s, result);
            }
            TableType::Json => {
                let s = match val {
                    OwnedValue::String(s) => s.clone(),
                    other => simd_json::to_string(other)
                        .map_err(|e| ConversionError::Json(e.to_string()))?,
                };
                prost::encoding::string::encode(tag, &s, result);
            }
            TableType::Bytes => {
                let OwnedValue::String(s) = val else {
                    return Err(mismatch(prefix, field, "base64 string", val));
                };
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| ConversionError::InvalidBase64 {
                        field: path(prefix, &field.name),
                        error: e.to_string(),
                    })?;
                prost::encoding::bytes::encode(tag, &bytes, result);
            }
            TableType::Struct => {
                if !matches!(val, OwnedValue::Object(_)) {
                    return Err(mismatch(prefix, field, "object", val));
                }
                let mut struct_buf: Vec<u8> = vec![];
                self.encode_object(
                    val,
                    &field.subfields,
                    &path(prefix, &field.name),
                    &mut struct_buf,
                )?;
                prost::encoding::encode_key(tag, WireType::LengthDelimited, result);
                prost::encoding::encode_varint(struct_buf.len() as u64, result);
                result.append(&mut struct_buf);
            }
            // rejected when deriving the schema
            TableType::Unspecified => {
                return Err(mismatch(prefix, field, "a supported column type", val));
            }
        }

        Ok(())
    }
}

/// parses exactly one JSON document, surrounding whitespace is ignored
fn parse(data: &mut [u8]) -> Result<OwnedValue, ConversionError> {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    let doc = data
        .get_mut(start..end)
        .ok_or_else(|| ConversionError::Json("empty payload".to_string()))?;
    if doc.is_empty() {
        return Err(ConversionError::Json("empty payload".to_string()));
    }
    simd_json::to_owned_value(doc).map_err(|e| ConversionError::Json(e.to_string()))
}

fn path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn mismatch(
    prefix: &str,
    field: &Field,
    expected: &'static str,
    got: &OwnedValue,
) -> ConversionError {
    ConversionError::TypeMismatch {
        field: path(prefix, &field.name),
        expected,
        got: type_name(got),
    }
}

fn type_name(value: &OwnedValue) -> &'static str {
    match value {
        OwnedValue::Static(StaticNode::Null) => "null",
        OwnedValue::Static(StaticNode::Bool(_)) => "bool",
        OwnedValue::Static(StaticNode::F64(_)) => "float",
        OwnedValue::Static(_) => "integer",
        OwnedValue::String(_) => "string",
        OwnedValue::Array(_) => "array",
        OwnedValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbq::schema::tests::{field, record};
    use googapis::google::cloud::bigquery::storage::v1::{
        table_field_schema::Mode, TableFieldSchema, TableSchema,
    };
    use pretty_assertions::assert_eq;
    use simd_json::json;
    use test_case::test_case;

    fn schema(fields: Vec<TableFieldSchema>) -> anyhow::Result<RowSchema> {
        Ok(RowSchema::derive(&TableSchema { fields })?)
    }

    fn id_and_name() -> anyhow::Result<RowSchema> {
        schema(vec![
            field("id", TableType::Int64, Mode::Required),
            field("name", TableType::String, Mode::Nullable),
        ])
    }

    #[test]
    fn can_map_json_to_protobuf() -> anyhow::Result<()> {
        let schema = schema(vec![
            field("a", TableType::Int64, Mode::Nullable),
            field("b", TableType::Int64, Mode::Nullable),
        ])?;
        let converter = RowConverter::new(true, true);
        let result = converter.convert(&schema, &Message::from(r#"{"a": 12, "b": 21, "c": 33}"#))?;

        assert_eq!([8_u8, 12, 16, 21], result[..]);
        Ok(())
    }

    #[test]
    fn fields_are_written_in_column_order() -> anyhow::Result<()> {
        let schema = id_and_name()?;
        let converter = RowConverter::new(true, true);
        let a = converter.convert(&schema, &Message::from(r#"{"id": 1, "name": "x"}"#))?;
        let b = converter.convert(&schema, &Message::from(r#"{"name": "x", "id": 1}"#))?;
        assert_eq!(a, b);
        assert_eq!(vec![8_u8, 1, 18, 1, b'x'], a);
        Ok(())
    }

    #[test_case(TableType::Int64, json!(12), &[8, 12] ; "int")]
    #[test_case(TableType::Int64, json!("-1"), &[8, 255, 255, 255, 255, 255, 255, 255, 255, 255, 1] ; "int from string")]
    #[test_case(TableType::Double, json!(1.0), &[9, 0, 0, 0, 0, 0, 0, 240, 63] ; "double")]
    #[test_case(TableType::Double, json!(1), &[9, 0, 0, 0, 0, 0, 0, 240, 63] ; "double from int")]
    #[test_case(TableType::Bool, json!(true), &[8, 1] ; "bool")]
    #[test_case(TableType::String, json!("I"), &[10, 1, 73] ; "string")]
    #[test_case(TableType::Timestamp, json!("I"), &[10, 1, 73] ; "timestamp")]
    #[test_case(TableType::Numeric, json!("I"), &[10, 1, 73] ; "numeric")]
    #[test_case(TableType::Bytes, json!("SQ=="), &[10, 1, 73] ; "bytes")]
    #[test_case(TableType::Json, json!("I"), &[10, 1, 73] ; "json string")]
    #[test_case(TableType::Json, json!([1]), &[10, 3, b'[', b'1', b']'] ; "json array")]
    fn can_encode_scalars(t: TableType, value: OwnedValue, expected: &[u8]) -> anyhow::Result<()> {
        let schema = schema(vec![field("f", t, Mode::Nullable)])?;
        let result = RowConverter::new(true, true).encode(&schema, &json!({ "f": value }))?;
        assert_eq!(expected, &result[..]);
        Ok(())
    }

    #[test_case(TableType::Int64, json!(1.5), "integer" ; "int from float")]
    #[test_case(TableType::Int64, json!("one"), "integer" ; "int from text")]
    #[test_case(TableType::Double, json!("1.0"), "number" ; "double from string")]
    #[test_case(TableType::Bool, json!(1), "bool" ; "bool from int")]
    #[test_case(TableType::String, json!(1), "string" ; "string from int")]
    #[test_case(TableType::Struct, json!("x"), "object" ; "struct from string")]
    fn rejects_mismatched_types(t: TableType, value: OwnedValue, expected: &str) -> anyhow::Result<()> {
        let fields = if t == TableType::Struct {
            vec![record("f", Mode::Nullable, vec![field("x", TableType::Int64, Mode::Nullable)])]
        } else {
            vec![field("f", t, Mode::Nullable)]
        };
        let schema = schema(fields)?;
        let err = RowConverter::new(true, true).encode(&schema, &json!({ "f": value }));
        match err {
            Err(ConversionError::TypeMismatch { field, expected: e, .. }) => {
                assert_eq!("f", field);
                assert_eq!(expected, e);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn invalid_base64_is_rejected() -> anyhow::Result<()> {
        let schema = schema(vec![field("b", TableType::Bytes, Mode::Nullable)])?;
        let err = RowConverter::new(true, true).encode(&schema, &json!({"b": "not base64!"}));
        assert!(matches!(err, Err(ConversionError::InvalidBase64 { .. })));
        Ok(())
    }

    #[test]
    fn can_encode_a_struct() -> anyhow::Result<()> {
        let schema = schema(vec![record(
            "test",
            Mode::Nullable,
            vec![
                field("a", TableType::Int64, Mode::Nullable),
                field("b", TableType::Int64, Mode::Nullable),
            ],
        )])?;
        let result = RowConverter::new(true, true)
            .encode(&schema, &json!({"test": {"a": 12, "b": 21, "c": 33}}))?;

        assert_eq!([10_u8, 4, 8, 12, 16, 21], result[..]);
        Ok(())
    }

    #[test]
    fn repeated_fields_are_unpacked() -> anyhow::Result<()> {
        let schema = schema(vec![field("tags", TableType::String, Mode::Repeated)])?;
        let converter = RowConverter::new(true, true);
        let result = converter.encode(&schema, &json!({"tags": ["a", "b"]}))?;
        assert_eq!(vec![10_u8, 1, b'a', 10, 1, b'b'], result);

        let err = converter.encode(&schema, &json!({"tags": "a"}));
        assert!(matches!(
            err,
            Err(ConversionError::TypeMismatch { expected: "array", .. })
        ));
        Ok(())
    }

    #[test]
    fn partial_rows_depend_on_allow_partial() -> anyhow::Result<()> {
        let schema = id_and_name()?;
        let msg = Message::from(r#"{"name":"x"}"#);

        assert_eq!(
            vec![18_u8, 1, b'x'],
            RowConverter::new(true, true).convert(&schema, &msg)?
        );
        assert_eq!(
            Err(ConversionError::MissingRequired("id".to_string())),
            RowConverter::new(false, true).convert(&schema, &msg)
        );
        // null counts as missing
        assert_eq!(
            Err(ConversionError::MissingRequired("id".to_string())),
            RowConverter::new(false, true).convert(&schema, &Message::from(r#"{"id": null}"#))
        );
        Ok(())
    }

    #[test]
    fn unknown_fields_depend_on_discard_unknown() -> anyhow::Result<()> {
        let schema = id_and_name()?;
        let msg = Message::from(r#"{"id":1,"foo":2}"#);

        assert_eq!(
            vec![8_u8, 1],
            RowConverter::new(true, true).convert(&schema, &msg)?
        );
        assert_eq!(
            Err(ConversionError::UnknownField("foo".to_string())),
            RowConverter::new(true, false).convert(&schema, &msg)
        );
        Ok(())
    }

    #[test]
    fn flags_apply_to_nested_records() -> anyhow::Result<()> {
        let schema = schema(vec![record(
            "r",
            Mode::Nullable,
            vec![field("id", TableType::Int64, Mode::Required)],
        )])?;

        assert_eq!(
            Err(ConversionError::UnknownField("r.x".to_string())),
            RowConverter::new(true, false).encode(&schema, &json!({"r": {"id": 1, "x": 1}}))
        );
        assert_eq!(
            Err(ConversionError::MissingRequired("r.id".to_string())),
            RowConverter::new(false, true).encode(&schema, &json!({"r": {}}))
        );
        Ok(())
    }

    #[test]
    fn payload_must_be_one_object() -> anyhow::Result<()> {
        let schema = id_and_name()?;
        let converter = RowConverter::new(true, true);

        assert_eq!(
            vec![8_u8, 7],
            converter.convert(&schema, &Message::from("  {\"id\": 7}\n"))?
        );
        assert!(matches!(
            converter.convert(&schema, &Message::from("{\"id\": 7} {\"id\": 8}")),
            Err(ConversionError::Json(_))
        ));
        assert!(matches!(
            converter.convert(&schema, &Message::from("\n")),
            Err(ConversionError::Json(_))
        ));
        assert!(matches!(
            converter.convert(&schema, &Message::from("{\"id\": ")),
            Err(ConversionError::Json(_))
        ));
        assert_eq!(
            Err(ConversionError::NotAnObject("array")),
            converter.convert(&schema, &Message::from("[1]"))
        );
        Ok(())
    }

    #[test]
    fn structured_payloads_skip_parsing() -> anyhow::Result<()> {
        let schema = id_and_name()?;
        let result =
            RowConverter::new(true, true).convert(&schema, &Message::structured(json!({"id": 3})))?;
        assert_eq!(vec![8_u8, 3], result);
        Ok(())
    }
}
