//! End-to-end tests: full Rill programs through the library pipeline
//! (parse, resolve, fold, lower, optimize, allocate) and executed on the
//! VM, asserting on final variable bindings and captured output.
//!
//! Binding assertions run the unoptimized pipeline: dead-store elimination
//! is free to drop a store whose variable is never read, so the final
//! environment is only a faithful observation surface without it. The
//! optimized pipeline is exercised through printed output, which survives
//! every pass.

use std::{cell::RefCell, io::Write, rc::Rc};

use indoc::indoc;

use rillc::{
    compile,
    frontend::SourceFile,
    runtime::{builtins::Registry, value::Value, vm::Vm, Fault, FaultKind},
    CompileOptions,
};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Run {
    variables: hashbrown::HashMap<String, Value>,
    output: String,
}

fn run_configured(text: &str, num_regs: usize, optimize: bool) -> Result<Run, Fault> {
    let source = SourceFile::from_memory(text);
    let builtins = Registry::new();

    let code = compile(&source, &builtins, &CompileOptions { num_regs, optimize })
        .expect("semantic analysis failed");

    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(num_regs, &builtins, Box::new(buffer.clone()));
    let result = vm.run(&code);

    let output = String::from_utf8(buffer.0.borrow().clone()).unwrap();

    result.map(|_| Run {
        variables: vm.variables.clone(),
        output,
    })
}

fn run(text: &str) -> Run {
    run_configured(text, 16, false).expect("program faulted")
}

fn run_expr(text: &str) -> Value {
    run(text).variables["result"].clone()
}

/* Whole-pipeline smoke programs */

#[test]
fn print_of_folded_arithmetic() {
    let run = run_configured("x = 4 + 3 print(2 + x)", 16, true).unwrap();
    assert_eq!(run.output, "9");
}

#[test]
fn recursive_factorial() {
    let result = run_expr(indoc! {"
        fn fact(n) {
            if n <= 1 { return 1 } else { return n * fact(n - 1) }
        }
        result = fact(5)
    "});

    assert_eq!(result, Value::Int(120));
}

#[test]
fn while_with_continue_and_break() {
    let run = run_configured(
        indoc! {"
            i = 0
            while i < 10 {
                i = i + 1
                if i == 3 { continue }
                if i == 7 { break }
                println(i)
            }
        "},
        16,
        true,
    )
    .unwrap();

    let lines: Vec<&str> = run.output.lines().collect();
    assert_eq!(lines, vec!["1", "2", "4", "5", "6"]);
}

#[test]
fn list_summation_through_methods() {
    let result = run_expr(indoc! {"
        nums = [1, 2, 3, 4, 5]
        i = 0
        total = 0
        while i < nums.len() {
            total = total + nums.at(i)
            i = i + 1
        }
        result = total
    "});

    assert_eq!(result, Value::Int(15));
}

#[test]
fn maximal_register_pressure_matches_a_roomy_bank() {
    // Three values live at once; a single allocatable register forces
    // everything through spill slots
    let program = indoc! {"
        a = 2
        b = 3
        c = 4
        result = a + b * c - a * 2
    "};

    let roomy = run_configured(program, 1024, false).unwrap();
    let tight = run_configured(program, 1, false).unwrap();

    assert_eq!(roomy.variables["result"], Value::Int(10));
    assert_eq!(tight.variables["result"], roomy.variables["result"]);
}

/* Round-trip: straight-line programs against hand-evaluated bindings.
 * Matches the unoptimized chain: lowering -> flattening -> allocation ->
 * execution. */

#[test]
fn straight_line_round_trips() {
    let cases: Vec<(&str, Value)> = vec![
        ("result = 1 + 2 * 3", Value::Int(7)),
        ("result = (1 + 2) * 3", Value::Int(9)),
        ("result = 2 ^ 10", Value::Int(1024)),
        ("result = 7 / 2", Value::Float(3.5)),
        ("result = -3 + 5", Value::Int(2)),
        ("result = not true", Value::Bool(false)),
        ("x = 5 y = x result = x + y", Value::Int(10)),
        ("result = 1 < 2", Value::Bool(true)),
        ("result = 1 < 2 < 3", Value::Bool(true)),
        ("result = 3 < 2 < 1", Value::Bool(false)),
        ("result = 1 == 1.0", Value::Bool(true)),
        ("result = 'ab' + 'cd'", Value::Str("abcd".into())),
        ("x = 1 if x > 0 { result = 'pos' } else { result = 'neg' }", Value::Str("pos".into())),
        ("result = 5 and 7", Value::Int(7)),
        ("result = 0 or 9", Value::Int(9)),
    ];

    for (program, expected) in cases {
        let run = run(program);
        assert_eq!(run.variables["result"], expected, "program: {program}");
    }
}

/* The optimized pipeline, observed through output */

#[test]
fn optimization_does_not_change_printed_results() {
    let programs = [
        indoc! {"
            fn fib(n) {
                if n < 2 { return n }
                return fib(n - 1) + fib(n - 2)
            }
            println(fib(10))
        "},
        indoc! {"
            total = 0
            unused = 999
            for i in 0..10 {
                if i == 5 { continue }
                total = total + i
            }
            println(total)
        "},
        indoc! {"
            words = ['stream', 'of', 'spills']
            println(words.join(' ').upper())
        "},
        indoc! {"
            struct Rect {
                w, h
                fn area(self) { return self.w * self.h }
            }
            println(Rect(3, 4).area())
        "},
    ];

    for program in programs {
        let plain = run_configured(program, 16, false).unwrap();

        for num_regs in [1, 2, 3, 16, 1024] {
            let optimized = run_configured(program, num_regs, true).unwrap();
            assert_eq!(optimized.output, plain.output, "num_regs={num_regs}");
        }
    }
}

/* Register pressure battery */

#[test]
fn results_are_stable_across_bank_sizes() {
    let programs = [
        indoc! {"
            fn fib(n) {
                if n < 2 { return n }
                return fib(n - 1) + fib(n - 2)
            }
            result = fib(10)
        "},
        indoc! {"
            total = 0
            for i in 0..10 {
                if i == 5 { continue }
                total = total + i
            }
            result = total
        "},
        indoc! {"
            words = ['stream', 'of', 'spills']
            result = words.join(' ').upper()
        "},
    ];

    let expected = [
        Value::Int(55),
        Value::Int(40),
        Value::Str("STREAM OF SPILLS".into()),
    ];

    for (program, expected) in programs.iter().zip(&expected) {
        for num_regs in [1, 2, 3, 16, 1024] {
            let run = run_configured(program, num_regs, false).unwrap();
            assert_eq!(&run.variables["result"], expected, "num_regs={num_regs}");
        }
    }
}

#[test]
fn recursion_under_spilling_pressure() {
    let program = indoc! {"
        fn fact(n) {
            if n <= 1 { return 1 } else { return n * fact(n - 1) }
        }
        result = fact(6)
    "};

    for num_regs in [1, 2, 16] {
        let run = run_configured(program, num_regs, false).unwrap();
        assert_eq!(run.variables["result"], Value::Int(720), "num_regs={num_regs}");
    }
}

/* Language features */

#[test]
fn for_loop_counts_the_half_open_range() {
    let run = run("total = 0 for i in 1..5 { total = total + i }");
    assert_eq!(run.variables["total"], Value::Int(10));
    // The loop variable remains at the bound after the loop
    assert_eq!(run.variables["i"], Value::Int(5));
}

#[test]
fn nested_loops_break_only_the_inner_one() {
    let result = run_expr(indoc! {"
        hits = 0
        for i in 0..3 {
            j = 0
            while true {
                j = j + 1
                if j == 2 { break }
            }
            hits = hits + j
        }
        result = hits
    "});

    assert_eq!(result, Value::Int(6));
}

#[test]
fn short_circuit_skips_the_right_side() {
    // The right side would fault if evaluated
    let result = run_expr(indoc! {"
        fn boom() { return 1 / 0 }
        result = false and boom()
    "});

    assert_eq!(result, Value::Bool(false));
}

#[test]
fn short_circuit_or_keeps_the_left_value() {
    let result = run_expr(indoc! {"
        fn boom() { return 1 / 0 }
        result = 'left' or boom()
    "});

    assert_eq!(result, Value::Str("left".into()));
}

#[test]
fn function_environments_are_fresh_per_call() {
    let run = run(indoc! {"
        x = 1
        fn f() {
            x = 99
            return x
        }
        y = f()
    "});

    assert_eq!(run.variables["x"], Value::Int(1));
    assert_eq!(run.variables["y"], Value::Int(99));
}

#[test]
fn mutual_recursion() {
    let result = run_expr(indoc! {"
        fn is_even(n) {
            if n == 0 { return true }
            return is_odd(n - 1)
        }
        fn is_odd(n) {
            if n == 0 { return false }
            return is_even(n - 1)
        }
        result = is_even(10)
    "});

    assert_eq!(result, Value::Bool(true));
}

#[test]
fn falling_off_a_function_returns_zero() {
    let result = run_expr("fn nothing() { x = 1 } result = nothing()");
    assert_eq!(result, Value::Int(0));
}

#[test]
fn structs_with_methods() {
    let run = run(indoc! {"
        struct Rect {
            w, h
            fn area(self) { return self.w * self.h }
            fn scaled(self, k) { return Rect(self.w * k, self.h * k) }
        }
        r = Rect(3, 4)
        a = r.area()
        big = r.scaled(2)
        ba = big.area()
        w = big.w
    "});

    assert_eq!(run.variables["a"], Value::Int(12));
    assert_eq!(run.variables["ba"], Value::Int(48));
    assert_eq!(run.variables["w"], Value::Int(6));
}

#[test]
fn lists_are_reference_values() {
    let run = run(indoc! {"
        xs = [1]
        ys = xs
        ys.push(2)
        n = xs.len()
    "});

    assert_eq!(run.variables["n"], Value::Int(2));
}

#[test]
fn string_members_chain() {
    let result = run_expr("result = 'level up'.replace('up', 'down').upper()");
    assert_eq!(result, Value::Str("LEVEL DOWN".into()));
}

#[test]
fn number_members() {
    let run = run(indoc! {"
        a = 2.25.sqrt()
        b = (0 - 7).abs()
        c = 2.7.floor()
    "});

    assert_eq!(run.variables["a"], Value::Float(1.5));
    assert_eq!(run.variables["b"], Value::Int(7));
    assert_eq!(run.variables["c"], Value::Int(2));
}

#[test]
fn len_works_uniformly_as_attribute_and_builtin() {
    let run = run(indoc! {"
        a = len('four')
        b = 'four'.len
        c = [1, 2].len
    "});

    assert_eq!(run.variables["a"], Value::Int(4));
    assert_eq!(run.variables["b"], Value::Int(4));
    assert_eq!(run.variables["c"], Value::Int(2));
}

/* Faults */

#[test]
fn division_by_zero_is_a_fatal_fault_with_an_ip() {
    let fault = run_configured("x = 5 y = x - 5 z = 1 / y", 16, false).unwrap_err();

    assert_eq!(fault.kind, FaultKind::DivisionByZero);
    assert!(fault.ip.is_some());
}

#[test]
fn observed_faults_survive_optimization() {
    // The division feeds a print, so dead-store elimination keeps it
    let fault = run_configured("x = 5 y = x - 5 print(1 / y)", 16, true).unwrap_err();
    assert_eq!(fault.kind, FaultKind::DivisionByZero);
}

#[test]
fn out_of_bounds_indexing_is_fatal() {
    let fault = run_configured("xs = [1, 2] x = xs.at(5)", 16, false).unwrap_err();
    assert_eq!(fault.kind, FaultKind::IndexOutOfBounds);
}

#[test]
fn unknown_member_is_fatal() {
    let fault = run_configured("x = 'hi'.explode()", 16, false).unwrap_err();
    assert_eq!(fault.kind, FaultKind::AttributeNotFound);
}

#[test]
fn faults_survive_tight_register_banks() {
    let fault = run_configured("a = 1 b = 0 c = a / b", 1, false).unwrap_err();
    assert_eq!(fault.kind, FaultKind::DivisionByZero);
}

/* Output formatting */

#[test]
fn println_separates_arguments_with_spaces() {
    let run = run_configured("println(1, 'and', 2)", 16, true).unwrap();
    assert_eq!(run.output, "1 and 2\n");
}

#[test]
fn floats_print_with_a_decimal_point() {
    let run = run_configured("print(6 / 3)", 16, true).unwrap();
    assert_eq!(run.output, "2.0");
}

#[test]
fn lists_and_structs_print_readably() {
    let run = run_configured(
        indoc! {"
            struct P { x, y }
            println([1, 'two', true])
            println(P(1, 2))
        "},
        16,
        true,
    )
    .unwrap();

    assert_eq!(run.output, "[1, two, true]\nP { x: 1, y: 2 }\n");
}
