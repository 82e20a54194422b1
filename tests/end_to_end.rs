//! End-to-end tests: Von source in, printed output out.
//!
//! These drive the whole pipeline (scanner → compiler → VM) through the
//! public API, the same way the `von` binary does.

use von::error::InterpretationError;
use von::vm::Vm;

/// Interpret a program and return what it printed.
fn run(source: &str) -> String {
    let mut vm = Vm::with_output(Vec::new());
    vm.interpret(source).expect("program should run cleanly");
    String::from_utf8(vm.into_output()).expect("output should be UTF-8")
}

fn run_err(source: &str) -> InterpretationError {
    let mut vm = Vm::with_output(Vec::new());
    vm.interpret(source)
        .expect_err("program should fail to interpret")
}

#[test]
fn arithmetic_with_precedence() {
    assert_eq!("7\n", run("print 1 + 2 * 3;"));
}

#[test]
fn shadowing_in_blocks() {
    assert_eq!("2\n1\n", run("var a = 1; { var a = 2; print a; } print a;"));
}

#[test]
fn closures_capture_arguments() {
    assert_eq!(
        "42\n",
        run("fun mk(x){ fun f(){ return x; } return f; } var c = mk(42); print c();")
    );
}

#[test]
fn counters_increment_shared_state() {
    assert_eq!(
        "1\n2\n3\n",
        run("fun cnt(){ var n = 0; fun inc(){ n = n + 1; return n; } return inc; } \
             var c = cnt(); print c(); print c(); print c();")
    );
}

#[test]
fn if_else_takes_the_right_branch() {
    assert_eq!("y\n", run("if (1 < 2) print \"y\"; else print \"n\";"));
    assert_eq!("n\n", run("if (1 > 2) print \"y\"; else print \"n\";"));
}

#[test]
fn while_loops_count() {
    assert_eq!("0\n1\n2\n", run("var i = 0; while (i < 3) { print i; i = i + 1; }"));
}

#[test]
fn instances_hold_fields() {
    assert_eq!("7\n", run("class P { } var p = P(); p.x = 7; print p.x;"));
}

#[test]
fn strings_concatenate() {
    assert_eq!("abc\n", run("print \"a\" + \"bc\";"));
}

#[test]
fn mixed_addition_is_a_runtime_error() {
    assert!(matches!(
        run_err("1 + \"x\";"),
        InterpretationError::RuntimeError
    ));
}

#[test]
fn self_referential_initializer_is_a_compile_error() {
    assert!(matches!(
        run_err("{ var a = a; }"),
        InterpretationError::CompileError
    ));
}

#[test]
fn comments_and_whitespace_are_ignored() {
    assert_eq!(
        "3\n",
        run("# leading comment\nvar a = 1 + 2; # trailing comment\nprint a;\n")
    );
}

#[test]
fn fibonacci_end_to_end() {
    assert_eq!(
        "0\n1\n1\n2\n3\n5\n8\n13\n",
        run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } \
             for (var i = 0; i < 8; i = i + 1) { print fib(i); }")
    );
}

#[test]
fn methods_and_initializers_compose() {
    assert_eq!(
        "12\n",
        run("class Rect { \
                 init(w, h) { this.w = w; this.h = h; } \
                 area() { return this.w * this.h; } \
             } \
             print Rect(3, 4).area();")
    );
}

#[test]
fn repl_style_sessions_share_globals() {
    let mut vm = Vm::with_output(Vec::new());
    vm.interpret("var total = 0;").unwrap();
    vm.interpret("fun bump(by) { total = total + by; }").unwrap();
    vm.interpret("bump(3); bump(4);").unwrap();
    vm.interpret("print total;").unwrap();
    assert_eq!("7\n", String::from_utf8(vm.into_output()).unwrap());
}

#[test]
fn errors_do_not_poison_the_session() {
    let mut vm = Vm::with_output(Vec::new());
    vm.interpret("var greeting = \"hello\";").unwrap();
    assert!(vm.interpret("greeting();").is_err());
    assert!(vm.interpret("print oops;").is_err());
    vm.interpret("print greeting;").unwrap();
    assert_eq!("hello\n", String::from_utf8(vm.into_output()).unwrap());
}

#[test]
fn garbage_heavy_programs_run_to_completion() {
    // Builds and discards many intermediate strings; exercises the
    // collector's rooting of operands during concatenation.
    assert_eq!(
        "done\n",
        run("var s = \"\"; \
             for (var i = 0; i < 200; i = i + 1) { s = s + \"xyzzy\"; } \
             var keep = s + \"!\"; \
             if (keep == s + \"!\") print \"done\";")
    );
}
