// src/resource/attribute.rs

//! Typed attribute schema shared by all instances of a resource type.
//!
//! Each resource type declares its attributes once (see
//! [`ResourceType::attributes`](crate::resource::ResourceType::attributes));
//! every instance gets its own copy holding the per-instance values.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use crate::errors::{ExpctlError, Result};
use crate::types::ResourceState;

/// Declared value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    String,
    Bool,
    /// A string restricted to [`Attribute::allowed`] values.
    Enum,
    Double,
    Integer,
}

/// A concrete attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Bool(bool),
    Double(f64),
    Integer(i64),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Doubles, and integers widened to doubles.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            AttrValue::Double(d) => Some(*d),
            AttrValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Parse a textual value (e.g. from the command line) as `ty`.
    pub fn parse_as(ty: AttrType, raw: &str) -> Option<AttrValue> {
        match ty {
            AttrType::String | AttrType::Enum => Some(AttrValue::String(raw.to_string())),
            AttrType::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(AttrValue::Bool(true)),
                "false" | "no" | "0" => Some(AttrValue::Bool(false)),
                _ => None,
            },
            AttrType::Double => raw.trim().parse().ok().map(AttrValue::Double),
            AttrType::Integer => raw.trim().parse().ok().map(AttrValue::Integer),
        }
    }

    /// Coerce this value to `ty`, if the types are compatible.
    fn coerce(self, ty: AttrType) -> Option<AttrValue> {
        match (ty, self) {
            (AttrType::String | AttrType::Enum, v @ AttrValue::String(_)) => Some(v),
            (AttrType::Bool, v @ AttrValue::Bool(_)) => Some(v),
            (AttrType::Integer, v @ AttrValue::Integer(_)) => Some(v),
            (AttrType::Double, v @ AttrValue::Double(_)) => Some(v),
            (AttrType::Double, AttrValue::Integer(i)) => Some(AttrValue::Double(i as f64)),
            (ty, AttrValue::String(s)) => AttrValue::parse_as(ty, &s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Double(d) => write!(f, "{d}"),
            AttrValue::Integer(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Integer(i)
    }
}

impl From<f64> for AttrValue {
    fn from(d: f64) -> Self {
        AttrValue::Double(d)
    }
}

/// Attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0x00);
    /// Never modifiable by the user.
    pub const READ_ONLY: Flags = Flags(0x01);
    /// Not modifiable by the user once the resource is deployed.
    pub const EXEC_READ_ONLY: Flags = Flags(0x02);
    /// Access credential; its value is never logged or printed.
    pub const CREDENTIAL: Flags = Flags(0x04);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Declaration plus current value of one attribute.
#[derive(Clone)]
pub struct Attribute {
    name: String,
    help: String,
    ty: AttrType,
    flags: Flags,
    allowed: Vec<String>,
    default: Option<AttrValue>,
    value: Option<AttrValue>,
    modified: bool,
}

impl Attribute {
    /// A string attribute with no flags and no default.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            ty: AttrType::String,
            flags: Flags::NONE,
            allowed: Vec::new(),
            default: None,
            value: None,
            modified: false,
        }
    }

    pub fn with_type(mut self, ty: AttrType) -> Self {
        self.ty = ty;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Restrict values to `allowed`; implies [`AttrType::Enum`].
    pub fn with_allowed<S: AsRef<str>>(mut self, allowed: &[S]) -> Self {
        self.ty = AttrType::Enum;
        self.allowed = allowed.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_default(mut self, default: impl Into<AttrValue>) -> Self {
        let default = default.into();
        self.value = Some(default.clone());
        self.default = Some(default);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn attr_type(&self) -> AttrType {
        self.ty
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn default_value(&self) -> Option<&AttrValue> {
        self.default.as_ref()
    }

    pub fn value(&self) -> Option<&AttrValue> {
        self.value.as_ref()
    }

    /// Whether the value was explicitly set since creation.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Validate and store `value`, ignoring flags.
    pub fn set_value(&mut self, value: AttrValue) -> Result<()> {
        let invalid = |v: &AttrValue| ExpctlError::InvalidAttributeValue {
            name: self.name.clone(),
            value: v.to_string(),
        };

        let coerced = value.clone().coerce(self.ty).ok_or_else(|| invalid(&value))?;

        if self.ty == AttrType::Enum {
            let ok = coerced
                .as_str()
                .is_some_and(|s| self.allowed.iter().any(|a| a == s));
            if !ok {
                return Err(invalid(&value));
            }
        }

        self.value = Some(coerced);
        self.modified = true;
        Ok(())
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Attribute");
        d.field("name", &self.name).field("type", &self.ty);
        if self.has_flag(Flags::CREDENTIAL) {
            d.field("value", &"<hidden>");
        } else {
            d.field("value", &self.value);
        }
        d.field("flags", &self.flags).finish_non_exhaustive()
    }
}

/// Per-instance attribute set of one resource.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    rtype: String,
    attrs: BTreeMap<String, Attribute>,
}

impl Attributes {
    pub fn from_schema(rtype: &str, schema: &[Attribute]) -> Self {
        let attrs = schema
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();
        Self {
            rtype: rtype.to_string(),
            attrs,
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<&AttrValue>> {
        self.attr(name).map(|a| a.value())
    }

    /// Set on behalf of a user, honouring `READ_ONLY` and `EXEC_READ_ONLY`.
    pub fn set(&mut self, name: &str, value: AttrValue, state: ResourceState) -> Result<()> {
        let rtype = self.rtype.clone();
        let attr = self
            .attrs
            .get_mut(name)
            .ok_or_else(|| ExpctlError::UnknownAttribute {
                rtype,
                name: name.to_string(),
            })?;

        let locked = attr.has_flag(Flags::READ_ONLY)
            || (attr.has_flag(Flags::EXEC_READ_ONLY)
                && (state.reached(ResourceState::Ready) || state.is_failed()));
        if locked {
            return Err(ExpctlError::ReadOnlyAttribute {
                name: name.to_string(),
                state,
            });
        }

        attr.set_value(value)
    }

    /// Set on behalf of the driver itself; flags are not checked.
    pub fn set_internal(&mut self, name: &str, value: AttrValue) -> Result<()> {
        let rtype = self.rtype.clone();
        self.attrs
            .get_mut(name)
            .ok_or_else(|| ExpctlError::UnknownAttribute {
                rtype,
                name: name.to_string(),
            })?
            .set_value(value)
    }

    pub fn attr(&self, name: &str) -> Result<&Attribute> {
        self.attrs
            .get(name)
            .ok_or_else(|| ExpctlError::UnknownAttribute {
                rtype: self.rtype.clone(),
                name: name.to_string(),
            })
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.attrs
            .get(name)?
            .value()?
            .as_str()
            .map(str::to_string)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.attrs.get(name)?.value()?.as_bool()
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.attrs.get(name)?.value()?.as_integer()
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        self.attrs.get(name)?.value()?.as_double()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    /// Names of attributes explicitly set on this instance.
    pub fn modified(&self) -> Vec<&str> {
        self.attrs
            .values()
            .filter(|a| a.is_modified())
            .map(|a| a.name())
            .collect()
    }
}
