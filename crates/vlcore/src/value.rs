//! The uniform tagged value manipulated by the stack, the globals map, and
//! the constant-string pool.

use crate::vlstr::VlStr;
use std::fmt;
use std::rc::Rc;

/// Opaque handle to a host-registered native function record.
///
/// `vlcore` does not know how to call a native — that is `vlvm`'s job — it
/// only needs to move the handle around without double-freeing it, which an
/// `Rc` gives for free.
pub type NativeHandle = Rc<dyn std::any::Any>;

/// The tagged value type.
///
/// `Array`, `Map`, and `Func` are reserved for future extension (spec'd to
/// round-trip through push/pop and stack copy without data loss) but carry
/// no payload this core interprets.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(VlStr),
    Array,
    Map,
    Func,
    Native(NativeHandle),
}

impl Value {
    /// The debug/print type name: `"nil" | "bool" | "int" | "float" | "str"
    /// | "array" | "map" | "func" | "native"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array => "array",
            Value::Map => "map",
            Value::Func => "func",
            Value::Native(_) => "native",
        }
    }

    /// Canonical textual form used by the `Print` opcode: `nil`, `true` /
    /// `false`, a decimal integer, the shortest round-trippable float, the
    /// string's own bytes (lossily, as UTF-8), or `"<typename>"` for
    /// anything else.
    pub fn display_canonical(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => s.as_str_lossy().into_owned(),
            other => format!("<{}>", other.type_name()),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Numeric value as `f64` for arithmetic/comparison promotion. `None`
    /// for non-numeric tags.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Shortest round-trippable `%g`-style formatting.
///
/// `f64`'s `Display` impl already produces the shortest decimal string that
/// round-trips to the same bit pattern (`3.0` -> `"3"`, `0.1` -> `"0.1"`),
/// which is exactly the spec's requirement, so non-special values defer to
/// it directly.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    // `{}` on f64 already yields the shortest decimal that round-trips
    // (e.g. 3.0 -> "3", 0.1 -> "0.1"), matching the spec's `%g` requirement.
    format!("{}", f)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Array => write!(f, "Array"),
            Value::Map => write!(f, "Map"),
            Value::Func => write!(f, "Func"),
            Value::Native(_) => write!(f, "Native(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::Bool(true).type_name(), "bool");
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Float(1.0).type_name(), "float");
        assert_eq!(Value::Str(VlStr::new(b"x")).type_name(), "str");
        assert_eq!(Value::Array.type_name(), "array");
        assert_eq!(Value::Map.type_name(), "map");
        assert_eq!(Value::Func.type_name(), "func");
    }

    #[test]
    fn print_forms() {
        assert_eq!(Value::Nil.display_canonical(), "nil");
        assert_eq!(Value::Bool(true).display_canonical(), "true");
        assert_eq!(Value::Bool(false).display_canonical(), "false");
        assert_eq!(Value::Int(-7).display_canonical(), "-7");
        assert_eq!(Value::Float(3.0).display_canonical(), "3");
        assert_eq!(Value::Float(0.5).display_canonical(), "0.5");
        assert_eq!(
            Value::Str(VlStr::new(b"hi")).display_canonical(),
            "hi"
        );
        assert_eq!(Value::Array.display_canonical(), "<array>");
    }

    #[test]
    fn nan_and_infinity_print() {
        assert_eq!(Value::Float(f64::NAN).display_canonical(), "nan");
        assert_eq!(Value::Float(f64::INFINITY).display_canonical(), "inf");
        assert_eq!(Value::Float(f64::NEG_INFINITY).display_canonical(), "-inf");
    }

    #[test]
    fn as_f64_promotion() {
        assert_eq!(Value::Int(2).as_f64(), Some(2.0));
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Nil.as_f64(), None);
    }
}
