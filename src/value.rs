//! Plain values stored inside targets, property keys, and the comparator
//! used by both write triggering and view validation.

use std::fmt;

use crate::arena::Target;
use crate::reactive::Reactive;

/// A value held by a record field or sequence slot.
///
/// Composite values are never stored inline. A [`Value::Ref`] points at
/// another raw [`Target`]; a [`Value::Wrapped`] keeps a read-only or shallow
/// wrapper exactly as it was written so later reads hand the same wrapper
/// back.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent or explicitly empty.
    #[default]
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar.
    Number(f64),
    /// String scalar.
    Str(String),
    /// Reference to a raw composite target.
    Ref(Target),
    /// A wrapper stored as-is (only read-only and shallow wrappers survive a
    /// write without being unwrapped).
    Wrapped(Reactive),
}

impl Value {
    /// Numeric content, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The raw target behind a reference or stored wrapper.
    pub fn as_target(&self) -> Option<Target> {
        match self {
            Value::Ref(target) => Some(*target),
            Value::Wrapped(wrapper) => Some(wrapper.target()),
            _ => None,
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for references and stored wrappers.
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::Ref(_) | Value::Wrapped(_))
    }

    /// True when this holds a wrapper that must be stored without unwrapping.
    pub(crate) fn is_sealed_wrapper(&self) -> bool {
        matches!(self, Value::Wrapped(w) if w.is_readonly() || w.is_shallow())
    }
}

/// Strict identity: numbers by `==`, strings by content, composites by
/// target (references) or wrapper instance (stored wrappers).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Wrapped(a), Value::Wrapped(b)) => Reactive::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The "changed" test: strict inequality, except that NaN equals itself.
pub fn has_changed(value: &Value, old: &Value) -> bool {
    match (value, old) {
        (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => false,
        _ => value != old,
    }
}

/// Strips a stored wrapper down to the reference it wraps.
pub fn to_raw(value: &Value) -> Value {
    match value {
        Value::Wrapped(wrapper) => Value::Ref(wrapper.target()),
        other => other.clone(),
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Target> for Value {
    fn from(target: Target) -> Self {
        Value::Ref(target)
    }
}

impl From<Reactive> for Value {
    fn from(wrapper: Reactive) -> Self {
        Value::Wrapped(wrapper)
    }
}

impl From<&Reactive> for Value {
    fn from(wrapper: &Reactive) -> Self {
        Value::Wrapped(wrapper.clone())
    }
}

/// A property key.
///
/// `Length` and `Iterate` are sentinels: `Length` is a sequence's length
/// (and the key enumeration of a sequence is tracked under it), `Iterate`
/// stands for "the set of keys" of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// Named record field.
    Field(String),
    /// Sequence position.
    Index(usize),
    /// Sequence length.
    Length,
    /// Record key enumeration.
    Iterate,
}

impl Key {
    /// Keys that are never recorded as dependencies.
    pub(crate) fn is_non_trackable(&self) -> bool {
        matches!(self, Key::Field(name) if name == "__proto__")
    }

    pub(crate) fn for_record(self) -> Key {
        match self {
            Key::Index(i) => Key::Field(i.to_string()),
            Key::Length => Key::Field("length".to_owned()),
            other => other,
        }
    }

    pub(crate) fn for_sequence(self) -> Key {
        match self {
            Key::Field(name) if name == "length" => Key::Length,
            Key::Field(name) => match name.parse::<usize>() {
                Ok(i) => Key::Index(i),
                Err(_) => Key::Field(name),
            },
            other => other,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Field(name) => f.write_str(name),
            Key::Index(i) => write!(f, "{i}"),
            Key::Length => f.write_str("length"),
            Key::Iterate => f.write_str("<iterate>"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Field(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Field(name)
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_not_a_change() {
        assert!(!has_changed(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
        assert!(has_changed(&Value::Number(1.0), &Value::Number(2.0)));
        assert!(!has_changed(&Value::from("a"), &Value::from("a")));
        assert!(has_changed(&Value::Null, &Value::Bool(false)));
    }

    #[test]
    fn keys_normalise_per_node_kind() {
        assert_eq!(Key::from("3").for_sequence(), Key::Index(3));
        assert_eq!(Key::from("length").for_sequence(), Key::Length);
        assert_eq!(Key::Index(2).for_record(), Key::from("2"));
        assert_eq!(Key::from("name").for_sequence(), Key::from("name"));
    }

    #[test]
    fn proto_key_is_never_tracked() {
        assert!(Key::from("__proto__").is_non_trackable());
        assert!(!Key::from("proto").is_non_trackable());
    }
}
