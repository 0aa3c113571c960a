//! The builtin function registry: a fixed name → (handler, arity) table
//! built once at load time and read-only afterwards. The generator
//! consults it to decide between `CALL` and `CALL_BUILTIN`; the VM
//! dispatches through it.

use std::io::Write;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::runtime::{value::Value, Fault, FaultKind};

pub type BuiltinHandler = fn(&mut dyn Write, &[Value]) -> Result<Value, Fault>;

pub struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    handler: BuiltinHandler,
}

impl Builtin {
    pub fn call(&self, out: &mut dyn Write, args: &[Value]) -> Result<Value, Fault> {
        if args.len() < self.min_args || args.len() > self.max_args {
            return Err(Fault::new(
                FaultKind::ArityMismatch,
                format!(
                    "Builtin '{}' expected {}-{} args, got {}",
                    self.name,
                    self.min_args,
                    self.max_args,
                    args.len()
                ),
            ));
        }

        (self.handler)(out, args)
    }
}

pub struct Registry {
    table: HashMap<&'static str, Builtin>,
}

impl Registry {
    pub fn new() -> Self {
        let mut table = HashMap::new();

        for builtin in [
            Builtin {
                name: "print",
                min_args: 0,
                max_args: 999,
                handler: builtin_print,
            },
            Builtin {
                name: "println",
                min_args: 0,
                max_args: 999,
                handler: builtin_println,
            },
            Builtin {
                name: "len",
                min_args: 1,
                max_args: 1,
                handler: builtin_len,
            },
        ] {
            table.insert(builtin.name, builtin);
        }

        Self { table }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.table.get(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_print(out: &mut dyn Write, args: &[Value]) -> Result<Value, Fault> {
    let _ = write!(out, "{}", args.iter().map(|a| a.to_string()).join(" "));
    Ok(Value::Null)
}

fn builtin_println(out: &mut dyn Write, args: &[Value]) -> Result<Value, Fault> {
    let _ = writeln!(out, "{}", args.iter().map(|a| a.to_string()).join(" "));
    Ok(Value::Null)
}

fn builtin_len(_out: &mut dyn Write, args: &[Value]) -> Result<Value, Fault> {
    match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(elements) => Ok(Value::Int(elements.borrow().len() as i64)),
        other => Err(Fault::new(
            FaultKind::TypeMismatch,
            format!("len() is not defined for {}", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_joins_arguments_with_spaces() {
        let registry = Registry::new();
        let mut out = Vec::new();

        registry
            .get("println")
            .unwrap()
            .call(&mut out, &[Value::Int(1), Value::Str("a".into())])
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "1 a\n");
    }

    #[test]
    fn arity_violations_fault_with_a_count() {
        let registry = Registry::new();
        let mut out = Vec::new();

        let fault = registry
            .get("len")
            .unwrap()
            .call(&mut out, &[])
            .unwrap_err();

        assert_eq!(fault.kind, FaultKind::ArityMismatch);
        assert!(fault.message.contains("expected 1-1 args, got 0"));
    }

    #[test]
    fn len_counts_strings_and_lists() {
        let registry = Registry::new();
        let mut out = Vec::new();
        let len = registry.get("len").unwrap();

        assert_eq!(
            len.call(&mut out, &[Value::Str("abc".into())]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            len.call(&mut out, &[Value::list(vec![Value::Int(1)])])
                .unwrap(),
            Value::Int(1)
        );
    }
}
