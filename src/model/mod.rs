//! The closed set of value variants produced by a parse: atomic integers,
//! arrays of atomics, and (arrays of) nested structures, each carrying its
//! name metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::io::BitWidth;

/// Name metadata of a field: full dotted path, local name, struct depth.
///
/// Depth -1 is reserved for the synthetic root struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedFieldInfo {
    pub path: String,
    pub name: String,
    pub depth: i32,
}

impl NamedFieldInfo {
    pub fn new(path: &str, name: &str, depth: i32) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            depth,
        }
    }

    /// The synthetic root struct info.
    pub fn root() -> Self {
        Self::new("", "", -1)
    }
}

impl fmt::Display for NamedFieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// A parsed field: optional name metadata plus its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub info: Option<NamedFieldInfo>,
    pub value: FieldValue,
}

/// The value variants a field can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bit { width: BitWidth, value: u8 },
    Bool(bool),
    Byte(i8),
    UByte(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    Long(i64),
    /// Numeric payload produced by a var field processor.
    Var(i64),
    /// Opaque payload produced by a custom field type processor.
    Custom(Vec<u8>),
    Array(ArrayValue),
    Struct(Vec<Field>),
    /// Each element is a `Struct` field sharing this field's name info.
    StructArray(Vec<Field>),
}

/// Array payloads, one vector variant per atomic kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayValue {
    Bit { width: BitWidth, values: Vec<u8> },
    Bool(Vec<bool>),
    Byte(Vec<i8>),
    UByte(Vec<u8>),
    Short(Vec<i16>),
    UShort(Vec<u16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Var(Vec<i64>),
    Custom(Vec<Vec<u8>>),
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bit { values, .. } => values.len(),
            ArrayValue::Bool(v) => v.len(),
            ArrayValue::Byte(v) => v.len(),
            ArrayValue::UByte(v) => v.len(),
            ArrayValue::Short(v) => v.len(),
            ArrayValue::UShort(v) => v.len(),
            ArrayValue::Int(v) => v.len(),
            ArrayValue::Long(v) => v.len(),
            ArrayValue::Var(v) => v.len(),
            ArrayValue::Custom(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` widened to i64, for integer element kinds.
    pub fn element_as_long(&self, index: usize) -> Option<i64> {
        match self {
            ArrayValue::Bit { values, .. } => values.get(index).map(|v| *v as i64),
            ArrayValue::Bool(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::Byte(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::UByte(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::Short(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::UShort(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::Int(v) => v.get(index).map(|v| *v as i64),
            ArrayValue::Long(v) => v.get(index).copied(),
            ArrayValue::Var(v) => v.get(index).copied(),
            ArrayValue::Custom(_) => None,
        }
    }
}

impl FieldValue {
    /// Numeric view of integer atomics; `None` for custom, array and struct
    /// variants.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Bit { value, .. } => Some(*value as i64),
            FieldValue::Bool(b) => Some(*b as i64),
            FieldValue::Byte(v) => Some(*v as i64),
            FieldValue::UByte(v) => Some(*v as i64),
            FieldValue::Short(v) => Some(*v as i64),
            FieldValue::UShort(v) => Some(*v as i64),
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Long(v) => Some(*v),
            FieldValue::Var(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        self.as_long().map(|v| v as i32)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldValue::Array(_) | FieldValue::StructArray(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, FieldValue::Struct(_))
    }
}

impl Field {
    pub fn new(info: Option<NamedFieldInfo>, value: FieldValue) -> Self {
        Self { info, value }
    }

    /// The field path or an empty string for unnamed fields.
    pub fn path(&self) -> &str {
        self.info.as_ref().map(|i| i.path.as_str()).unwrap_or("")
    }

    /// The local field name or an empty string for unnamed fields.
    pub fn name(&self) -> &str {
        self.info.as_ref().map(|i| i.name.as_str()).unwrap_or("")
    }

    /// Child fields of a struct, empty for everything else.
    pub fn fields(&self) -> &[Field] {
        match &self.value {
            FieldValue::Struct(fields) => fields,
            _ => &[],
        }
    }

    /// Struct elements of a struct array, empty for everything else.
    pub fn elements(&self) -> &[Field] {
        match &self.value {
            FieldValue::StructArray(items) => items,
            _ => &[],
        }
    }

    /// Find a direct child by local name, case-insensitive.
    pub fn find_by_name(&self, name: &str) -> Option<&Field> {
        self.fields()
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// Find a descendant by dotted path relative to this struct,
    /// case-insensitive.
    pub fn find_by_path(&self, path: &str) -> Option<&Field> {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            current = current.find_by_name(segment)?;
            if segments.peek().is_some() && !current.value.is_struct() {
                return None;
            }
        }
        Some(current)
    }

    /// Numeric view of this field's value.
    pub fn as_long(&self) -> Option<i64> {
        self.value.as_long()
    }

    pub fn as_int(&self) -> Option<i32> {
        self.value.as_int()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bit { value, .. } => write!(f, "{}", value),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Byte(v) => write!(f, "{}", v),
            FieldValue::UByte(v) => write!(f, "{}", v),
            FieldValue::Short(v) => write!(f, "{}", v),
            FieldValue::UShort(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Var(v) => write!(f, "{}", v),
            FieldValue::Custom(bytes) => write!(f, "<custom:{} bytes>", bytes.len()),
            FieldValue::Array(arr) => write!(f, "<array:{}>", arr.len()),
            FieldValue::Struct(fields) => write!(f, "<struct:{} fields>", fields.len()),
            FieldValue::StructArray(items) => write!(f, "<struct array:{}>", items.len()),
        }
    }
}
