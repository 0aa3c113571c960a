//! Builtin member dispatch for non-struct receivers, resolved by the
//! runtime type of the value: string, list, and number methods. `GET_ATTR`
//! reaches here too for zero-argument members (`.len` works uniformly).

use itertools::Itertools;

use crate::runtime::{value, value::Value, Fault, FaultKind};

pub fn resolve_member(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, Fault> {
    match receiver {
        Value::Str(s) => string_member(s, name, args),
        Value::List(_) => list_member(receiver, name, args),
        Value::Int(_) | Value::Float(_) => number_member(receiver, name, args),
        _ => None,
    }
    .unwrap_or_else(|| {
        Err(Fault::new(
            FaultKind::AttributeNotFound,
            format!(
                "'{}' has no attribute or method '{name}'",
                receiver.type_name()
            ),
        ))
    })
}

fn require_args(name: &str, args: &[Value], count: usize) -> Result<(), Fault> {
    if args.len() != count {
        return Err(Fault::new(
            FaultKind::ArityMismatch,
            format!("'{name}' takes {count} argument(s), got {}", args.len()),
        ));
    }

    Ok(())
}

/// Resolves a possibly-negative index against a length, Python-style
fn resolve_index(value: &Value, length: usize) -> Result<usize, Fault> {
    let raw = match value {
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        other => {
            return Err(Fault::new(
                FaultKind::TypeMismatch,
                format!("Index must be a number, got {}", other.type_name()),
            ))
        }
    };

    let index = if raw < 0 { raw + length as i64 } else { raw };

    if index < 0 || index as usize >= length {
        return Err(Fault::new(
            FaultKind::IndexOutOfBounds,
            format!("Index {raw} out of bounds for length {length}"),
        ));
    }

    Ok(index as usize)
}

fn string_member(s: &str, name: &str, args: &[Value]) -> Option<Result<Value, Fault>> {
    let result = match name {
        "len" => Ok(Value::Int(s.chars().count() as i64)),
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "contains" => require_args("contains", args, 1).and_then(|_| match &args[0] {
            Value::Str(needle) => Ok(Value::Bool(s.contains(needle.as_str()))),
            other => Err(Fault::new(
                FaultKind::TypeMismatch,
                format!("'contains' takes a string, got {}", other.type_name()),
            )),
        }),
        "replace" => require_args("replace", args, 2).and_then(|_| match (&args[0], &args[1]) {
            (Value::Str(from), Value::Str(to)) => {
                Ok(Value::Str(s.replace(from.as_str(), to.as_str())))
            }
            _ => Err(Fault::new(
                FaultKind::TypeMismatch,
                "'replace' takes two strings",
            )),
        }),
        "split" => match args {
            [] => Ok(Value::list(
                s.split_whitespace()
                    .map(|part| Value::Str(part.to_owned()))
                    .collect(),
            )),
            [Value::Str(sep)] => Ok(Value::list(
                s.split(sep.as_str())
                    .map(|part| Value::Str(part.to_owned()))
                    .collect(),
            )),
            _ => Err(Fault::new(
                FaultKind::TypeMismatch,
                "'split' takes an optional string separator",
            )),
        },
        "chars" => Ok(Value::list(
            s.chars().map(|c| Value::Str(c.to_string())).collect(),
        )),
        "reverse" => Ok(Value::Str(s.chars().rev().collect())),
        "at" => require_args("at", args, 1).and_then(|_| {
            let chars: Vec<char> = s.chars().collect();
            let index = resolve_index(&args[0], chars.len())?;
            Ok(Value::Str(chars[index].to_string()))
        }),
        _ => return None,
    };

    Some(result)
}

fn list_member(receiver: &Value, name: &str, args: &[Value]) -> Option<Result<Value, Fault>> {
    let Value::List(elements) = receiver else {
        return None;
    };

    let result = match name {
        "len" => Ok(Value::Int(elements.borrow().len() as i64)),
        "push" => require_args("push", args, 1).map(|_| {
            elements.borrow_mut().push(args[0].clone());
            receiver.clone()
        }),
        // Removes the last element, or the one at the given index, and
        // yields the list itself (matching `push`)
        "pop" => {
            let length = elements.borrow().len();

            match args {
                [] if length > 0 => {
                    elements.borrow_mut().pop();
                    Ok(receiver.clone())
                }
                [] => Err(Fault::new(
                    FaultKind::IndexOutOfBounds,
                    "'pop' on an empty list",
                )),
                [index] => resolve_index(index, length).map(|index| {
                    elements.borrow_mut().remove(index);
                    receiver.clone()
                }),
                _ => Err(Fault::new(
                    FaultKind::ArityMismatch,
                    format!("'pop' takes at most 1 argument, got {}", args.len()),
                )),
            }
        }
        "first" => elements.borrow().first().cloned().ok_or_else(|| {
            Fault::new(FaultKind::IndexOutOfBounds, "'first' on an empty list")
        }),
        "last" => elements.borrow().last().cloned().ok_or_else(|| {
            Fault::new(FaultKind::IndexOutOfBounds, "'last' on an empty list")
        }),
        "at" => require_args("at", args, 1).and_then(|_| {
            let borrowed = elements.borrow();
            let index = resolve_index(&args[0], borrowed.len())?;
            Ok(borrowed[index].clone())
        }),
        "reverse" => Ok(Value::list(
            elements.borrow().iter().rev().cloned().collect(),
        )),
        "join" => {
            let separator = match args {
                [] => String::new(),
                [Value::Str(sep)] => sep.clone(),
                _ => {
                    return Some(Err(Fault::new(
                        FaultKind::TypeMismatch,
                        "'join' takes an optional string separator",
                    )))
                }
            };

            Ok(Value::Str(
                elements
                    .borrow()
                    .iter()
                    .map(|element| element.to_string())
                    .join(&separator),
            ))
        }
        _ => return None,
    };

    Some(result)
}

fn number_member(receiver: &Value, name: &str, args: &[Value]) -> Option<Result<Value, Fault>> {
    let as_f64 = match receiver {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => return None,
    };

    let result = match name {
        "abs" => Ok(match receiver {
            Value::Int(i) => Value::Int(i.wrapping_abs()),
            _ => Value::Float(as_f64.abs()),
        }),
        "sqrt" => {
            if as_f64 < 0.0 {
                Err(Fault::new(
                    FaultKind::TypeMismatch,
                    "'sqrt' of a negative number",
                ))
            } else {
                Ok(Value::Float(as_f64.sqrt()))
            }
        }
        "floor" => Ok(Value::Int(as_f64.floor() as i64)),
        "ceil" => Ok(Value::Int(as_f64.ceil() as i64)),
        "round" => match args {
            [] => Ok(Value::Int(as_f64.round() as i64)),
            [digits] => match digits {
                Value::Int(d) => {
                    let factor = 10f64.powi(*d as i32);
                    Ok(Value::Float((as_f64 * factor).round() / factor))
                }
                other => Err(Fault::new(
                    FaultKind::TypeMismatch,
                    format!("'round' takes a number, got {}", other.type_name()),
                )),
            },
            _ => Err(Fault::new(
                FaultKind::ArityMismatch,
                format!("'round' takes at most 1 argument, got {}", args.len()),
            )),
        },
        "pow" => require_args("pow", args, 1).and_then(|_| value::pow(receiver, &args[0])),
        "str" => Ok(Value::Str(receiver.to_string())),
        "int" => Ok(Value::Int(as_f64 as i64)),
        "float" => Ok(Value::Float(as_f64)),
        _ => return None,
    };

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_members() {
        let s = Value::Str("hello".into());

        assert_eq!(resolve_member(&s, "len", &[]).unwrap(), Value::Int(5));
        assert_eq!(
            resolve_member(&s, "upper", &[]).unwrap(),
            Value::Str("HELLO".into())
        );
        assert_eq!(
            resolve_member(&s, "at", &[Value::Int(-1)]).unwrap(),
            Value::Str("o".into())
        );
    }

    #[test]
    fn list_push_mutates_shared_storage() {
        let list = Value::list(vec![Value::Int(1)]);

        resolve_member(&list, "push", &[Value::Int(2)]).unwrap();

        assert_eq!(list, Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn list_at_faults_out_of_bounds() {
        let list = Value::list(vec![Value::Int(1)]);

        let fault = resolve_member(&list, "at", &[Value::Int(3)]).unwrap_err();
        assert_eq!(fault.kind, FaultKind::IndexOutOfBounds);
    }

    #[test]
    fn list_reverse_leaves_the_original_alone() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let reversed = resolve_member(&list, "reverse", &[]).unwrap();

        assert_eq!(reversed, Value::list(vec![Value::Int(2), Value::Int(1)]));
        assert_eq!(list, Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn number_members() {
        assert_eq!(
            resolve_member(&Value::Int(-3), "abs", &[]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            resolve_member(&Value::Float(2.25), "sqrt", &[]).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            resolve_member(&Value::Float(2.7), "floor", &[]).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn unknown_member_is_an_attribute_fault() {
        let fault = resolve_member(&Value::Int(1), "meow", &[]).unwrap_err();

        assert_eq!(fault.kind, FaultKind::AttributeNotFound);
        assert!(fault.message.contains("'number'"));
    }
}
