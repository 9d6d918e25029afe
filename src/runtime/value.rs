//! Dynamic value representation
//!
//! Values are a tagged variant. Small integers (`Smi`) and doubles are both
//! "numbers"; arithmetic results are normalized back to `Smi` whenever the
//! value is integral, fits in 32 bits and is not negative zero.

use super::object::{ArrayRef, ObjectRef};
use crate::bytecode::FunctionId;
use std::fmt;
use std::rc::Rc;

/// A runtime value
#[derive(Clone)]
pub enum Value {
    /// undefined
    Undefined,
    /// null
    Null,
    /// Boolean value
    Bool(bool),
    /// Small integer
    Smi(i32),
    /// IEEE 754 double
    Number(f64),
    /// Immutable string
    Str(Rc<str>),
    /// Shaped object
    Object(ObjectRef),
    /// Array with possible holes
    Array(ArrayRef),
    /// Reference to a function in the program
    Function(FunctionId),
}

impl Value {
    /// Build a number, preferring the small-integer representation
    pub fn number(n: f64) -> Value {
        if n.fract() == 0.0
            && n >= i32::MIN as f64
            && n <= i32::MAX as f64
            && !(n == 0.0 && n.is_sign_negative())
        {
            Value::Smi(n as i32)
        } else {
            Value::Number(n)
        }
    }

    pub fn string(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Smi(_) | Value::Number(_))
    }

    /// Numeric payload without coercion
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Smi(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert to boolean (truthiness)
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Smi(i) => *i != 0,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) | Value::Array(_) | Value::Function(_) => true,
        }
    }

    /// Convert to number
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Smi(i) => *i as f64,
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(arr) => {
                let arr = arr.borrow();
                match arr.len() {
                    0 => 0.0,
                    1 => arr.get(0).map(|v| v.to_number()).unwrap_or(0.0),
                    _ => f64::NAN,
                }
            }
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// ToInt32 as used by the bitwise operators
    pub fn to_int32(&self) -> i32 {
        match self {
            Value::Smi(i) => *i,
            other => f64_to_int32(other.to_number()),
        }
    }

    /// Convert to the string shown by `+` concatenation
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Smi(i) => i.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Array(arr) => {
                let arr = arr.borrow();
                (0..arr.len())
                    .map(|i| match arr.get(i) {
                        Some(v) if !v.is_nullish() => v.to_js_string(),
                        _ => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Function(id) => format!("function {}", id),
        }
    }

    /// Name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Smi(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
        }
    }

    /// Strict equality (===)
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Smi(a), Value::Smi(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => {
                a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }

    /// Loose equality (==)
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, _) | (_, a) if a.is_nullish() => false,
            (a, b) if a.is_number() || b.is_number() || matches!(a, Value::Bool(_)) || matches!(b, Value::Bool(_)) => {
                let (x, y) = (a.to_number(), b.to_number());
                match (a, b) {
                    (Value::Object(_), _) | (_, Value::Object(_)) => false,
                    _ => x == y,
                }
            }
            (a, b) => a.strict_equals(b),
        }
    }

    /// Bit-identical comparison, used to check deterministic reconstruction.
    /// Unlike `==` this distinguishes `Smi(1)` from `Number(1.0)` and compares
    /// doubles by their bits.
    pub fn bit_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Smi(a), Value::Smi(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Smi(_), _) | (Value::Number(_), _) => false,
            (a, b) => a.strict_equals(b),
        }
    }
}

/// Test-friendly equality: numbers compare by value with NaN equal to NaN,
/// strings by content, objects and arrays by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Smi(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(obj) => write!(f, "Object(shape {})", obj.borrow().shape()),
            Value::Array(arr) => write!(f, "Array(len {})", arr.borrow().len()),
            Value::Function(id) => write!(f, "Function({})", id),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Smi(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

/// ToInt32 on a double
pub fn f64_to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let truncated = n.trunc();
    let modulo = truncated.rem_euclid(4_294_967_296.0);
    if modulo >= 2_147_483_648.0 {
        (modulo - 4_294_967_296.0) as i32
    } else {
        modulo as i32
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == 0.0 {
        "0".to_string()
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_normalizes_to_smi() {
        assert!(matches!(Value::number(42.0), Value::Smi(42)));
        assert!(matches!(Value::number(42.5), Value::Number(_)));
        assert!(matches!(Value::number(-0.0), Value::Number(_)));
        assert!(matches!(Value::number(4_294_967_296.0), Value::Number(_)));
    }

    #[test]
    fn test_to_number_coercion() {
        assert!(Value::string("abc").to_number().is_nan());
        assert_eq!(Value::string(" 12 ").to_number(), 12.0);
        assert_eq!(Value::string("").to_number(), 0.0);
        assert!(Value::Undefined.to_number().is_nan());
        assert_eq!(Value::Null.to_number(), 0.0);
        assert_eq!(Value::Bool(true).to_number(), 1.0);
    }

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(f64_to_int32(4_294_967_297.0), 1);
        assert_eq!(f64_to_int32(2_147_483_648.0), i32::MIN);
        assert_eq!(f64_to_int32(f64::NAN), 0);
        assert_eq!(f64_to_int32(-1.5), -1);
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::Smi(3), Value::Number(3.0));
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
        assert!(Value::Undefined.loose_equals(&Value::Null));
        assert!(Value::string("5").loose_equals(&Value::Smi(5)));
        assert!(!Value::string("5").strict_equals(&Value::Smi(5)));
    }

    #[test]
    fn test_bit_identical_distinguishes_representation() {
        assert!(Value::Smi(1).bit_identical(&Value::Smi(1)));
        assert!(!Value::Smi(1).bit_identical(&Value::Number(1.0)));
        assert!(Value::Number(f64::NAN).bit_identical(&Value::Number(f64::NAN)));
        assert!(!Value::Number(0.0).bit_identical(&Value::Number(-0.0)));
    }

    #[test]
    fn test_to_js_string() {
        assert_eq!(Value::Number(2.5).to_js_string(), "2.5");
        assert_eq!(Value::Number(f64::NAN).to_js_string(), "NaN");
        assert_eq!(Value::Smi(-7).to_js_string(), "-7");
    }
}
