#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Attribute {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    String(String),
}

impl Attribute {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
        }
    }
}

/// Typed access to an [`Attribute`] payload.
pub trait AttrValue: Sized {
    const KIND: &'static str;

    fn from_attr(attr: &Attribute) -> Option<Self>;

    fn into_attr(self) -> Attribute;
}

macro_rules! impl_attr_value {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl AttrValue for $ty {
            const KIND: &'static str = $kind;

            fn from_attr(attr: &Attribute) -> Option<Self> {
                match attr {
                    Attribute::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }

            fn into_attr(self) -> Attribute {
                Attribute::$variant(self)
            }
        }
    };
}

impl_attr_value!(i32, Int, "int");
impl_attr_value!(i64, Long, "long");
impl_attr_value!(f32, Float, "float");
impl_attr_value!(bool, Bool, "bool");
impl_attr_value!(String, String, "string");

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OpDescError {
    #[error("op '{op_type}' has no attribute '{name}'")]
    MissingAttr { op_type: String, name: String },
    #[error("attribute '{name}' is {actual}, requested {expected}")]
    AttrKindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("op '{op_type}' has no {direction} slot '{slot}'")]
    MissingSlot {
        op_type: String,
        direction: &'static str,
        slot: String,
    },
    #[error("invalid op description json: {0}")]
    Json(String),
}

/// Structural description of one operator invocation: type tag, argument
/// slot -> variable name bindings, and attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    #[serde(rename = "type")]
    op_type: String,
    inputs: BTreeMap<String, Vec<String>>,
    outputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    attrs: BTreeMap<String, Attribute>,
}

impl OpDesc {
    #[must_use]
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn set_type(&mut self, op_type: impl Into<String>) {
        self.op_type = op_type.into();
    }

    pub fn set_input<I, S>(&mut self, slot: impl Into<String>, vars: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs
            .insert(slot.into(), vars.into_iter().map(Into::into).collect());
    }

    pub fn set_output<I, S>(&mut self, slot: impl Into<String>, vars: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs
            .insert(slot.into(), vars.into_iter().map(Into::into).collect());
    }

    /// Variables bound to input `slot`; empty when the slot is absent.
    #[must_use]
    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map_or(&[], Vec::as_slice)
    }

    pub fn single_input(&self, slot: &str) -> Result<&str, OpDescError> {
        self.input(slot)
            .first()
            .map(String::as_str)
            .ok_or_else(|| OpDescError::MissingSlot {
                op_type: self.op_type.clone(),
                direction: "input",
                slot: slot.to_owned(),
            })
    }

    pub fn single_output(&self, slot: &str) -> Result<&str, OpDescError> {
        self.output(slot)
            .first()
            .map(String::as_str)
            .ok_or_else(|| OpDescError::MissingSlot {
                op_type: self.op_type.clone(),
                direction: "output",
                slot: slot.to_owned(),
            })
    }

    #[must_use]
    pub fn has_input(&self, slot: &str) -> bool {
        self.inputs.contains_key(slot)
    }

    #[must_use]
    pub fn input_argument_names(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn output_argument_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn input_vars(&self) -> Vec<&str> {
        self.inputs.values().flatten().map(String::as_str).collect()
    }

    #[must_use]
    pub fn output_vars(&self) -> Vec<&str> {
        self.outputs.values().flatten().map(String::as_str).collect()
    }

    pub fn set_attr<T: AttrValue>(&mut self, name: impl Into<String>, value: T) {
        self.attrs.insert(name.into(), value.into_attr());
    }

    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    #[must_use]
    pub fn attr_names(&self) -> Vec<&str> {
        self.attrs.keys().map(String::as_str).collect()
    }

    pub fn attr<T: AttrValue>(&self, name: &str) -> Result<T, OpDescError> {
        let attr = self
            .attrs
            .get(name)
            .ok_or_else(|| OpDescError::MissingAttr {
                op_type: self.op_type.clone(),
                name: name.to_owned(),
            })?;
        T::from_attr(attr).ok_or_else(|| OpDescError::AttrKindMismatch {
            name: name.to_owned(),
            expected: T::KIND,
            actual: attr.kind(),
        })
    }

    pub fn attr_or<T: AttrValue>(&self, name: &str, default: T) -> Result<T, OpDescError> {
        if self.has_attr(name) {
            self.attr(name)
        } else {
            Ok(default)
        }
    }

    pub fn to_json(&self) -> Result<String, OpDescError> {
        serde_json::to_string(self).map_err(|error| OpDescError::Json(error.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, OpDescError> {
        serde_json::from_str(raw).map_err(|error| OpDescError::Json(error.to_string()))
    }
}
