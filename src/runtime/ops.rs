//! Generic operation semantics
//!
//! The fully dynamic implementation of every operator and property access.
//! The interpreter uses these directly; compiled code falls back to them
//! wherever feedback did not justify a specialized representation, so both
//! tiers agree on results by construction.

use super::object::{JsArray, JsObject, ShapeTable};
use super::{Abrupt, Completion, Value};
use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};
use crate::error::messages;
use std::sync::Arc;

/// Evaluate a binary operator
pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::Add => add(lhs, rhs),
        BinaryOp::Sub => Value::number(lhs.to_number() - rhs.to_number()),
        BinaryOp::Mul => Value::number(lhs.to_number() * rhs.to_number()),
        BinaryOp::Div => Value::number(lhs.to_number() / rhs.to_number()),
        BinaryOp::Mod => Value::number(lhs.to_number() % rhs.to_number()),
        BinaryOp::Exp => Value::number(pow(lhs.to_number(), rhs.to_number())),
        BinaryOp::BitOr => Value::Smi(lhs.to_int32() | rhs.to_int32()),
        BinaryOp::BitAnd => Value::Smi(lhs.to_int32() & rhs.to_int32()),
        BinaryOp::BitXor => Value::Smi(lhs.to_int32() ^ rhs.to_int32()),
        BinaryOp::Shl => Value::Smi(lhs.to_int32().wrapping_shl(shift_count(rhs))),
        BinaryOp::Sar => Value::Smi(lhs.to_int32() >> shift_count(rhs)),
        BinaryOp::Shr => Value::number(((lhs.to_int32() as u32) >> shift_count(rhs)) as f64),
    }
}

fn add(lhs: &Value, rhs: &Value) -> Value {
    match (lhs, rhs) {
        (Value::Smi(a), Value::Smi(b)) => match a.checked_add(*b) {
            Some(sum) => Value::Smi(sum),
            None => Value::Number(*a as f64 + *b as f64),
        },
        (a, b) if is_string_like(a) || is_string_like(b) => {
            let mut s = a.to_js_string();
            s.push_str(&b.to_js_string());
            Value::string(&s)
        }
        (a, b) => Value::number(a.to_number() + b.to_number()),
    }
}

/// Values whose primitive conversion for `+` is a string
fn is_string_like(v: &Value) -> bool {
    matches!(v, Value::Str(_) | Value::Object(_) | Value::Array(_) | Value::Function(_))
}

fn shift_count(v: &Value) -> u32 {
    (v.to_int32() as u32) & 31
}

fn pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        f64::NAN
    } else {
        base.powf(exponent)
    }
}

/// Evaluate a unary operator
pub fn unary(op: UnaryOp, operand: &Value) -> Value {
    match op {
        UnaryOp::Neg => match operand {
            Value::Smi(i) if *i != 0 && *i != i32::MIN => Value::Smi(-i),
            other => Value::number(-other.to_number()),
        },
        UnaryOp::Inc => match operand {
            Value::Smi(i) if *i < i32::MAX => Value::Smi(i + 1),
            other => Value::number(other.to_number() + 1.0),
        },
        UnaryOp::Dec => match operand {
            Value::Smi(i) if *i > i32::MIN => Value::Smi(i - 1),
            other => Value::number(other.to_number() - 1.0),
        },
        UnaryOp::BitNot => Value::Smi(!operand.to_int32()),
        UnaryOp::Not => Value::Bool(!operand.to_boolean()),
        UnaryOp::ToNumber => Value::number(operand.to_number()),
    }
}

/// Evaluate a comparison
pub fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => lhs.loose_equals(rhs),
        CompareOp::Ne => !lhs.loose_equals(rhs),
        CompareOp::StrictEq => lhs.strict_equals(rhs),
        CompareOp::StrictNe => !lhs.strict_equals(rhs),
        relational => {
            if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
                return match relational {
                    CompareOp::Lt => a < b,
                    CompareOp::Le => a <= b,
                    CompareOp::Gt => a > b,
                    _ => a >= b,
                };
            }
            let (a, b) = (lhs.to_number(), rhs.to_number());
            match relational {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                _ => a >= b,
            }
        }
    }
}

/// `object.key`
pub fn get_named(shapes: &ShapeTable, object: &Value, key: &str) -> Completion<Value> {
    match object {
        Value::Object(obj) => Ok(obj.borrow().get(shapes, key)),
        Value::Array(arr) if key == "length" => Ok(Value::Smi(arr.borrow().len() as i32)),
        Value::Str(s) if key == "length" => Ok(Value::Smi(s.chars().count() as i32)),
        v if v.is_nullish() => Err(Abrupt::type_error(messages::cannot_read_property(
            key,
            v.type_name(),
        ))),
        _ => Ok(Value::Undefined),
    }
}

/// `object.key = value`
pub fn set_named(
    shapes: &mut ShapeTable,
    object: &Value,
    key: &Arc<str>,
    value: Value,
) -> Completion<()> {
    match object {
        Value::Object(obj) => {
            obj.borrow_mut().set(shapes, key, value);
            Ok(())
        }
        v if v.is_nullish() => Err(Abrupt::type_error(messages::cannot_set_property(
            key,
            v.type_name(),
        ))),
        _ => Ok(()),
    }
}

/// Integer element index, if `index` denotes one
pub fn element_index(index: &Value) -> Option<usize> {
    match index {
        Value::Smi(i) if *i >= 0 => Some(*i as usize),
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < u32::MAX as f64 => {
            Some(*n as usize)
        }
        _ => None,
    }
}

/// `object[index]`
pub fn get_indexed(shapes: &ShapeTable, object: &Value, index: &Value) -> Completion<Value> {
    match (object, element_index(index)) {
        (Value::Array(arr), Some(i)) => Ok(arr.borrow().get(i).unwrap_or(Value::Undefined)),
        (Value::Str(s), Some(i)) => Ok(s
            .chars()
            .nth(i)
            .map(|c| Value::string(&c.to_string()))
            .unwrap_or(Value::Undefined)),
        (v, _) if v.is_nullish() => Err(Abrupt::type_error(messages::cannot_read_property(
            &index.to_js_string(),
            v.type_name(),
        ))),
        (v, _) => get_named(shapes, v, &index.to_js_string()),
    }
}

/// `object[index] = value`
pub fn set_indexed(
    shapes: &mut ShapeTable,
    object: &Value,
    index: &Value,
    value: Value,
) -> Completion<()> {
    match (object, element_index(index)) {
        (Value::Array(arr), Some(i)) => {
            arr.borrow_mut().set(i, value);
            Ok(())
        }
        (v, _) if v.is_nullish() => Err(Abrupt::type_error(messages::cannot_set_property(
            &index.to_js_string(),
            v.type_name(),
        ))),
        (v, _) => {
            let key: Arc<str> = Arc::from(index.to_js_string());
            set_named(shapes, v, &key, value)
        }
    }
}

/// Allocate an object literal; later duplicate keys overwrite earlier ones
pub fn new_object(shapes: &mut ShapeTable, keys: &[Arc<str>], values: Vec<Value>) -> Value {
    let mut object = JsObject::empty();
    for (key, value) in keys.iter().zip(values) {
        object.set(shapes, key, value);
    }
    Value::Object(object.into_ref())
}

/// Allocate an array literal
pub fn new_array(elements: Vec<Option<Value>>) -> Value {
    Value::Array(JsArray::new(elements).into_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_semantics() {
        assert_eq!(binary(BinaryOp::Add, &Value::Smi(1), &Value::Smi(2)), Value::Smi(3));
        assert!(matches!(
            binary(BinaryOp::Add, &Value::Smi(i32::MAX), &Value::Smi(1)),
            Value::Number(_)
        ));
        assert_eq!(
            binary(BinaryOp::Add, &Value::string("a"), &Value::Smi(1)),
            Value::string("a1")
        );
        assert_eq!(
            binary(BinaryOp::Add, &Value::Smi(1), &Value::Number(0.5)),
            Value::Number(1.5)
        );
    }

    #[test]
    fn test_numeric_coercion_of_junk_string_is_nan() {
        let result = binary(BinaryOp::Mul, &Value::string("abc"), &Value::Smi(2));
        assert!(result.to_number().is_nan());
        let result = binary(BinaryOp::Sub, &Value::Undefined, &Value::Smi(1));
        assert!(result.to_number().is_nan());
    }

    #[test]
    fn test_division_produces_doubles() {
        assert_eq!(binary(BinaryOp::Div, &Value::Smi(6), &Value::Smi(3)), Value::Smi(2));
        assert_eq!(binary(BinaryOp::Div, &Value::Smi(1), &Value::Smi(2)), Value::Number(0.5));
        assert!(matches!(
            binary(BinaryOp::Div, &Value::Smi(-1), &Value::Smi(0)),
            Value::Number(n) if n == f64::NEG_INFINITY
        ));
    }

    #[test]
    fn test_bitwise_semantics() {
        assert_eq!(binary(BinaryOp::Shr, &Value::Smi(-1), &Value::Smi(0)), Value::Number(4294967295.0));
        assert_eq!(binary(BinaryOp::Sar, &Value::Smi(-8), &Value::Smi(1)), Value::Smi(-4));
        assert_eq!(binary(BinaryOp::Shl, &Value::Smi(1), &Value::Smi(33)), Value::Smi(2));
        assert_eq!(unary(UnaryOp::BitNot, &Value::Smi(0)), Value::Smi(-1));
    }

    #[test]
    fn test_negation_of_zero_is_negative_zero() {
        assert!(matches!(unary(UnaryOp::Neg, &Value::Smi(0)), Value::Number(n) if n.is_sign_negative()));
    }

    #[test]
    fn test_compare() {
        assert!(compare(CompareOp::Lt, &Value::Smi(10), &Value::Smi(20)));
        assert!(compare(CompareOp::Ge, &Value::Smi(15), &Value::Smi(15)));
        assert!(!compare(CompareOp::Lt, &Value::Number(f64::NAN), &Value::Smi(1)));
        assert!(compare(CompareOp::Lt, &Value::string("a"), &Value::string("b")));
        assert!(compare(CompareOp::Eq, &Value::string("1"), &Value::Smi(1)));
        assert!(!compare(CompareOp::StrictEq, &Value::string("1"), &Value::Smi(1)));
    }

    #[test]
    fn test_property_access() {
        let mut shapes = ShapeTable::new();
        let obj = Value::Object(JsObject::empty().into_ref());
        let x: Arc<str> = Arc::from("x");
        set_named(&mut shapes, &obj, &x, Value::Smi(42)).unwrap();
        assert_eq!(get_named(&shapes, &obj, "x").unwrap(), Value::Smi(42));
        assert_eq!(get_named(&shapes, &obj, "y").unwrap(), Value::Undefined);
        assert!(matches!(get_named(&shapes, &Value::Undefined, "x"), Err(Abrupt::Throw(_))));
    }

    #[test]
    fn test_element_access() {
        let shapes = ShapeTable::new();
        let arr = new_array(vec![Some(Value::Smi(1)), None]);
        assert_eq!(get_indexed(&shapes, &arr, &Value::Smi(0)).unwrap(), Value::Smi(1));
        assert_eq!(get_indexed(&shapes, &arr, &Value::Smi(1)).unwrap(), Value::Undefined);
        assert_eq!(get_indexed(&shapes, &arr, &Value::Smi(9)).unwrap(), Value::Undefined);
        assert_eq!(get_named(&shapes, &arr, "length").unwrap(), Value::Smi(2));
    }
}
