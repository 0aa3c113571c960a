use std::{cell::RefCell, rc::Rc};

use itertools::Itertools;

use crate::runtime::{Fault, FaultKind};

/// A runtime value.
///
/// Lists and struct instances are reference values: cloning a `Value` clones
/// the handle, so a list held in a register and in a variable share storage
/// and `xs.push(v)` is visible through both.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    List(Rc<RefCell<Vec<Value>>>),
    Struct(Rc<StructInstance>),
}

#[derive(Debug)]
pub struct StructInstance {
    pub type_name: String,
    /// Declared field order is preserved for listings and display
    pub fields: RefCell<Vec<(String, Value)>>,
}

impl Value {
    pub fn list(values: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::List(l) => !l.borrow().is_empty(),
            Value::Struct(_) => true,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::List(_) => "list",
            Value::Struct(instance) => &instance.type_name,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::List(a), Value::List(b)) => *a.borrow() == *b.borrow(),
            (Value::Struct(a), Value::Struct(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::List(elements) => {
                write!(
                    f,
                    "[{}]",
                    elements.borrow().iter().map(|e| e.to_string()).join(", ")
                )
            }
            Value::Struct(instance) => {
                write!(
                    f,
                    "{} {{ {} }}",
                    instance.type_name,
                    instance
                        .fields
                        .borrow()
                        .iter()
                        .map(|(name, value)| format!("{name}: {value}"))
                        .join(", ")
                )
            }
        }
    }
}

fn type_mismatch(operator: &str, lhs: &Value, rhs: &Value) -> Fault {
    Fault::new(
        FaultKind::TypeMismatch,
        format!(
            "Operator '{operator}' not supported between {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ),
    )
}

pub fn add(lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut joined = a.borrow().clone();
            joined.extend(b.borrow().iter().cloned());
            Ok(Value::list(joined))
        }
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a + b)),
            _ => Err(type_mismatch("+", lhs, rhs)),
        },
    }
}

pub fn sub(lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a - b)),
            _ => Err(type_mismatch("-", lhs, rhs)),
        },
    }
}

pub fn mul(lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a * b)),
            _ => Err(type_mismatch("*", lhs, rhs)),
        },
    }
}

/// True division: the result is always a float, as in the original runtime
pub fn div(lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(type_mismatch("/", lhs, rhs));
    };

    if b == 0.0 {
        return Err(Fault::new(FaultKind::DivisionByZero, "Division by zero"));
    }

    Ok(Value::Float(a / b))
}

pub fn pow(lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) if *b >= 0 && *b <= u32::MAX as i64 => {
            Ok(Value::Int(a.wrapping_pow(*b as u32)))
        }
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
            _ => Err(type_mismatch("^", lhs, rhs)),
        },
    }
}

pub fn neg(operand: &Value) -> Result<Value, Fault> {
    match operand {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(Fault::new(
            FaultKind::TypeMismatch,
            format!("Cannot negate {}", operand.type_name()),
        )),
    }
}

pub fn not(operand: &Value) -> Value {
    Value::Bool(!operand.truthy())
}

/// Ordering comparison shared by `LT`/`GT`/`LE`/`GE`: numbers compare
/// numerically (mixed int/float allowed), strings lexicographically
pub fn ordering(operator: &str, lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, Fault> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| {
                Fault::new(FaultKind::TypeMismatch, "Comparison with NaN is unordered")
            }),
            _ => Err(type_mismatch(operator, lhs, rhs)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        assert_eq!(add(&Value::Int(1), &Value::Float(2.5)).unwrap(), Value::Float(3.5));
        assert_eq!(mul(&Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(6));
    }

    #[test]
    fn division_always_floats() {
        assert_eq!(div(&Value::Int(5), &Value::Int(2)).unwrap(), Value::Float(2.5));
        assert_eq!(div(&Value::Int(6), &Value::Int(3)).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn division_by_zero_faults() {
        let fault = div(&Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(fault.kind, FaultKind::DivisionByZero);
    }

    #[test]
    fn integer_power_stays_integral() {
        assert_eq!(pow(&Value::Int(2), &Value::Int(10)).unwrap(), Value::Int(1024));
        assert_eq!(
            pow(&Value::Int(2), &Value::Int(-1)).unwrap(),
            Value::Float(0.5)
        );
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            add(&Value::Str("ab".into()), &Value::Str("cd".into())).unwrap(),
            Value::Str("abcd".into())
        );
    }

    #[test]
    fn adding_string_to_number_faults() {
        let fault = add(&Value::Str("x".into()), &Value::Int(1)).unwrap_err();
        assert_eq!(fault.kind, FaultKind::TypeMismatch);
    }

    #[test]
    fn lists_share_storage_through_clones() {
        let list = Value::list(vec![Value::Int(1)]);
        let alias = list.clone();

        if let Value::List(cells) = &alias {
            cells.borrow_mut().push(Value::Int(2));
        }

        assert_eq!(list, Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn truthiness_follows_the_original_runtime() {
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::list(vec![]).truthy());
    }
}
