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

use googapis::google::cloud::bigquery::storage::v1::{
    table_field_schema::{Mode, Type as TableType},
    TableFieldSchema, TableSchema,
};
use prost_types::{
    field_descriptor_proto::{Label, Type as ProtoType},
    DescriptorProto, FieldDescriptorProto,
};
use std::collections::HashMap;

/// BigQuery doesn't allow RECORD columns nested deeper than this
const MAX_NESTING: usize = 15;

/// Errors deriving a row schema
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The table has no columns
    #[error("table schema has no fields")]
    Empty,
    /// A RECORD column without sub fields
    #[error("record field {0} has no fields")]
    EmptyRecord(String),
    /// A column of a type we can't write
    #[error("field {0} has an unsupported type")]
    UnsupportedType(String),
    /// Records nested too deep
    #[error("field {0} exceeds the maximum nesting depth of {MAX_NESTING}")]
    TooDeep(String),
}

/// A column of the row schema
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) table_type: TableType,
    pub(crate) mode: Mode,
    pub(crate) tag: u32,
    // empty unless the table_type is struct
    pub(crate) subfields: Fields,
}

impl Field {
    pub(crate) fn is_required(&self) -> bool {
        self.mode == Mode::Required
    }

    pub(crate) fn is_repeated(&self) -> bool {
        self.mode == Mode::Repeated
    }
}

/// Columns in table order with a name index
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fields {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl Fields {
    fn push(&mut self, field: Field) {
        self.index.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Field> {
        self.index.get(name).and_then(|i| self.fields.get(*i))
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.fields.len()
    }
}

/// The protobuf shape of a table row: the descriptor sent along with the
/// rows and the mapping used to encode JSON into it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSchema {
    descriptor: DescriptorProto,
    fields: Fields,
}

impl RowSchema {
    /// Derives the row schema from a table schema
    ///
    /// # Errors
    /// if the table has no columns or a column type can't be mapped
    pub fn derive(schema: &TableSchema) -> Result<Self, SchemaError> {
        if schema.fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        let (descriptor, fields) = map_fields("table", &schema.fields, 0)?;
        Ok(Self { descriptor, fields })
    }

    /// the protobuf descriptor of a row
    #[must_use]
    pub fn descriptor(&self) -> &DescriptorProto {
        &self.descriptor
    }

    pub(crate) fn fields(&self) -> &Fields {
        &self.fields
    }
}

fn proto_type(table_type: TableType) -> Option<ProtoType> {
    Some(match table_type {
        TableType::Int64 => ProtoType::Int64,
        TableType::Double => ProtoType::Double,
        TableType::Bool => ProtoType::Bool,
        TableType::Bytes => ProtoType::Bytes,
        TableType::String
        // YYYY-[M]M-[D]D
        | TableType::Date
        // [H]H:[M]M:[S]S[.DDDDDD|.F]
        | TableType::Time
        // YYYY-[M]M-[D]D[( |T)[H]H:[M]M:[S]S[.F]]
        | TableType::Datetime
        // YYYY-[M]M-[D]D[( |T)[H]H:[M]M:[S]S[.F]][time zone]
        | TableType::Timestamp
        | TableType::Geography
        // String, because it has decimal precision, f32/f64 would lose precision
        | TableType::Numeric
        | TableType::Bignumeric
        // [sign]Y-M [sign]D [sign]H:M:S[.F]
        | TableType::Interval
        | TableType::Json => ProtoType::String,
        TableType::Struct => ProtoType::Message,
        TableType::Unspecified => return None,
    })
}

fn label(mode: Mode) -> Label {
    match mode {
        Mode::Required => Label::Required,
        Mode::Repeated => Label::Repeated,
        Mode::Nullable | Mode::Unspecified => Label::Optional,
    }
}

fn map_fields(
    schema_name: &str,
    raw_fields: &[TableFieldSchema],
    depth: usize,
) -> Result<(DescriptorProto, Fields), SchemaError> {
    // The capacity for nested_types isn't known here, as it depends on the number of fields that have the struct type
    let mut nested_types = vec![];
    let mut proto_fields = Vec::with_capacity(raw_fields.len());
    let mut fields = Fields::default();

    for (raw_field, tag) in raw_fields.iter().zip(1_u32..) {
        let table_type = TableType::from_i32(raw_field.r#type)
            .and_then(|t| proto_type(t).map(|p| (t, p)));
        let Some((table_type, grpc_type)) = table_type else {
            return Err(SchemaError::UnsupportedType(raw_field.name.clone()));
        };
        let mode = Mode::from_i32(raw_field.mode).unwrap_or(Mode::Nullable);

        let mut type_name = None;
        let mut subfields = Fields::default();
        if table_type == TableType::Struct {
            if depth + 1 >= MAX_NESTING {
                return Err(SchemaError::TooDeep(raw_field.name.clone()));
            }
            if raw_field.fields.is_empty() {
                return Err(SchemaError::EmptyRecord(raw_field.name.clone()));
            }
            let type_name_for_field = format!("struct_{}", raw_field.name);
            let (nested, nested_fields) =
                map_fields(&type_name_for_field, &raw_field.fields, depth + 1)?;
            nested_types.push(nested);
            subfields = nested_fields;
            type_name = Some(type_name_for_field);
        }

        proto_fields.push(FieldDescriptorProto {
            name: Some(raw_field.name.clone()),
            number: Some(i32::try_from(tag).unwrap_or(i32::MAX)),
            label: Some(i32::from(label(mode))),
            r#type: Some(i32::from(grpc_type)),
            type_name,
            ..FieldDescriptorProto::default()
        });

        fields.push(Field {
            name: raw_field.name.clone(),
            table_type,
            mode,
            tag,
            subfields,
        });
    }

    Ok((
        DescriptorProto {
            name: Some(schema_name.to_string()),
            field: proto_fields,
            nested_type: nested_types,
            ..DescriptorProto::default()
        },
        fields,
    ))
}
