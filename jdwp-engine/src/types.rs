// JDWP type definitions
//
// Common types used across the JDWP protocol and the event engine

use serde::{Deserialize, Serialize};

// Object IDs are 8 bytes in JDWP
pub type ObjectId = u64;
pub type ThreadId = ObjectId;

pub type ReferenceTypeId = u64;

pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    pub fn new(class_id: ReferenceTypeId, method_id: MethodId, index: u64) -> Self {
        Self {
            type_tag: 1,
            class_id,
            method_id,
            index,
        }
    }
}

/// A wire location enriched with the names the metadata layer knows about.
///
/// `declaring_type` is the dotted class name (`com.example.Foo`), which is
/// what class filters are matched against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLocation {
    pub location: Location,
    pub declaring_type: String,
    pub method: String,
    pub line: Option<i32>,
    pub source_name: Option<String>,
}

impl EventLocation {
    pub fn new(location: Location, declaring_type: impl Into<String>) -> Self {
        Self {
            location,
            declaring_type: declaring_type.into(),
            method: String::new(),
            line: None,
            source_name: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_line(mut self, line: i32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }
}

/// Convert a JNI signature (`Lcom/example/Foo;`) to a dotted class name.
///
/// Array and primitive signatures are returned unchanged.
pub fn signature_to_class_name(signature: &str) -> String {
    match signature
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
    {
        Some(inner) => inner.replace('/', "."),
        None => signature.to_string(),
    }
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: u8,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ObjectId),
    Void,
}

impl Value {
    /// Format value for display
    pub fn format(&self) -> String {
        match &self.data {
            ValueData::Byte(v) => format!("(byte) {}", v),
            ValueData::Char(v) => format!("(char) '{}'", char::from_u32(*v as u32).unwrap_or('?')),
            ValueData::Float(v) => format!("(float) {}", v),
            ValueData::Double(v) => format!("(double) {}", v),
            ValueData::Int(v) => format!("(int) {}", v),
            ValueData::Long(v) => format!("(long) {}", v),
            ValueData::Short(v) => format!("(short) {}", v),
            ValueData::Boolean(v) => format!("(boolean) {}", v),
            ValueData::Object(id) => {
                if *id == 0 {
                    "(object) null".to_string()
                } else {
                    format!("(object) @{:x}", id)
                }
            }
            ValueData::Void => "(void)".to_string(),
        }
    }
}
