//! Language semantics: operators, control flow, collections, errors.

use ape_runtime::{Ape, ErrorKind, Value};

fn eval(source: &str) -> (Ape, Value) {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    let result = ape.execute(source);
    (ape, result)
}

fn eval_ok(source: &str) -> Value {
    let (ape, result) = eval(source);
    assert!(
        !ape.has_errors(),
        "unexpected errors for {:?}: {}",
        source,
        ape.error_at(0).map(|e| e.to_string()).unwrap_or_default()
    );
    result
}

fn eval_number(source: &str) -> f64 {
    match eval_ok(source) {
        Value::Number(n) => n,
        other => panic!("expected number from {:?}, got {:?}", source, other),
    }
}

fn eval_bool(source: &str) -> bool {
    match eval_ok(source) {
        Value::Bool(b) => b,
        other => panic!("expected bool from {:?}, got {:?}", source, other),
    }
}

fn eval_string(source: &str) -> String {
    let (ape, result) = eval(source);
    assert!(!ape.has_errors(), "{:?}", ape.error_at(0).map(|e| e.to_string()));
    ape.str_of(result).expect("string result").to_string()
}

fn eval_runtime_error(source: &str) -> String {
    let (ape, result) = eval(source);
    assert!(result.is_null());
    let err = ape.error_at(0).unwrap_or_else(|| panic!("no error for {:?}", source));
    assert_eq!(err.kind, ErrorKind::Runtime);
    err.message.clone()
}

// ----------------------------------------------------------------------
// arithmetic and comparison
// ----------------------------------------------------------------------

#[test]
fn arithmetic_follows_ieee_754() {
    // operands kept out of literal position so the optimiser stays out
    // of the way and the opcodes themselves are exercised
    assert_eq!(eval_number("var a = 7; var b = 2; a / b"), 3.5);
    assert_eq!(eval_number("var a = 7; var b = 2; a % b"), 1.0);
    assert_eq!(eval_number("var a = 1.5; var b = 2.5; a + b"), 4.0);
    assert!(eval_number("var z = 0; 1 / z").is_infinite());
    assert!(eval_number("var z = 0; z / z").is_nan());
}

#[test]
fn bitwise_truncates_to_integers() {
    assert_eq!(eval_number("var a = 5; var b = 3; a & b"), 1.0);
    assert_eq!(eval_number("var a = 5; var b = 3; a | b"), 7.0);
    assert_eq!(eval_number("var a = 5; var b = 3; a ^ b"), 6.0);
    assert_eq!(eval_number("var a = 1; var b = 4; a << b"), 16.0);
    assert_eq!(eval_number("var a = 32; var b = 2; a >> b"), 8.0);
    assert_eq!(eval_number("var a = 5.9; var b = 3; a & b"), 1.0);
}

#[test]
fn bools_are_numeric_in_arithmetic() {
    assert_eq!(eval_number("var t = true; t + 1"), 2.0);
    assert_eq!(eval_number("var f = false; f * 10"), 0.0);
}

#[test]
fn comparisons() {
    assert!(eval_bool("var a = 1; var b = 2; a < b"));
    assert!(eval_bool("var a = 2; var b = 2; a <= b"));
    assert!(eval_bool("var a = 3; var b = 2; a > b"));
    assert!(!eval_bool("var a = 1; var b = 2; a == b"));
    assert!(eval_bool("var a = 1; var b = 2; a != b"));
    // the numeric family is mutually comparable
    assert!(eval_bool("var t = true; t == 1"));
    assert!(eval_bool("var n = null; n == 0"));
}

#[test]
fn nan_equals_itself() {
    // canonical NaN compares bit-identical
    assert!(eval_bool("var z = 0; var nan = z / z; nan == nan"));
}

#[test]
fn strings_compare_by_content() {
    assert!(eval_bool(r#"var a = "ab"; var b = "a" + "b"; a == b"#));
    assert!(eval_bool(r#"var a = "ab"; var b = "ac"; a != b"#));
}

#[test]
fn heap_values_compare_by_identity() {
    assert!(!eval_bool("var a = [1]; var b = [1]; a == b"));
    assert!(eval_bool("var a = [1]; var b = a; a == b"));
    assert!(!eval_bool("var a = {x: 1}; var b = {x: 1}; a == b"));
}

#[test]
fn equality_tolerates_type_mixes_but_ordering_does_not() {
    assert!(!eval_bool("var a = []; var b = 1; a == b"));
    let message = eval_runtime_error("var a = []; var b = 1; a < b");
    assert!(message.contains("Cannot compare"), "got {:?}", message);
}

#[test]
fn mixed_operand_type_errors_name_the_opcode() {
    let message = eval_runtime_error(r#"var a = "x"; var b = 1; a - b"#);
    assert!(message.contains("Invalid operand types for SUB"), "got {:?}", message);
}

// ----------------------------------------------------------------------
// strings
// ----------------------------------------------------------------------

#[test]
fn string_concat_and_indexing() {
    assert_eq!(eval_string(r#"var a = "foo"; var b = "bar"; a + b"#), "foobar");
    assert_eq!(eval_string(r#"var s = "abc"; s[1]"#), "b");
    assert!(eval_ok(r#"var s = "abc"; s[10]"#).is_null());
    assert_eq!(eval_number(r#"len("hello")"#), 5.0);
}

#[test]
fn template_strings_interpolate() {
    assert_eq!(
        eval_string(r#"var name = "world"; "hello {name}!""#),
        "hello world!"
    );
    assert_eq!(
        eval_string(r#"var a = 1; var b = 2; "{a} and {b}""#),
        "1 and 2"
    );
    assert_eq!(eval_string(r#""sum: {1 + 2}""#), "sum: 3");
}

#[test]
fn strings_are_immutable_through_set_index() {
    let (ape, result) = eval(r#"var s = "abc"; s[0] = "x"; s"#);
    assert!(result.is_null());
    assert!(ape.has_errors());
    assert!(ape.error_at(0).unwrap().message.contains("not indexable"));
}

// ----------------------------------------------------------------------
// arrays and maps
// ----------------------------------------------------------------------

#[test]
fn array_literals_indexing_and_negative_wrap() {
    assert_eq!(eval_number("var a = [1, 2, 3]; a[0]"), 1.0);
    assert_eq!(eval_number("var a = [1, 2, 3]; a[-1]"), 3.0);
    assert!(eval_ok("var a = [1, 2, 3]; a[5]").is_null());
    assert_eq!(eval_number("var a = [1, 2, 3]; len(a)"), 3.0);
}

#[test]
fn adding_to_an_array_appends() {
    assert_eq!(eval_number("var a = []; a + 1; a + 2; len(a)"), 2.0);
}

#[test]
fn array_set_out_of_bounds_is_an_error() {
    let message = eval_runtime_error("var a = [1]; a[3] = 9");
    assert!(message.contains("out of bounds"), "got {:?}", message);
}

#[test]
fn map_literals_and_member_sugar() {
    assert_eq!(eval_number("var m = {a: 1, b: 2}; m.a + m[\"b\"]"), 3.0);
    assert_eq!(eval_number("var m = {}; m.x = 41; m.x + 1"), 42.0);
    assert!(eval_ok("var m = {a: 1}; m.missing").is_null());
    assert_eq!(eval_number("var m = {1: \"one\", true: 2}; m[true]"), 2.0);
}

#[test]
fn map_keys_must_be_hashable() {
    let message = eval_runtime_error("var m = {}; m[[1]] = 2");
    assert!(message.contains("not hashable"), "got {:?}", message);
}

#[test]
fn maps_may_hold_themselves() {
    // cycles through the heap must construct and collect cleanly
    let n = eval_number(
        r#"
        var m = {}
        m.self = m
        len(keys(m))
        "#,
    );
    assert_eq!(n, 1.0);
}

#[test]
fn this_refers_to_the_enclosing_map_literal() {
    let n = eval_number(
        r#"
        var m = { a: 41, next: function() { return this.a + 1 } }
        m.next()
        "#,
    );
    assert_eq!(n, 42.0);
}

// ----------------------------------------------------------------------
// control flow
// ----------------------------------------------------------------------

#[test]
fn if_else_if_else() {
    let pick = |n: i32| {
        eval_string(&format!(
            r#"
            var n = {}
            var out = ""
            if (n < 0) {{ out = "neg" }} else if (n == 0) {{ out = "zero" }} else {{ out = "pos" }}
            out
            "#,
            n
        ))
    };
    assert_eq!(pick(-5), "neg");
    assert_eq!(pick(0), "zero");
    assert_eq!(pick(3), "pos");
}

#[test]
fn truthiness_in_tests() {
    assert_eq!(eval_number("var x = 0; if (1) { x = 1 } x"), 1.0);
    assert_eq!(eval_number("var x = 0; if (\"\") { x = 1 } x"), 1.0);
    assert_eq!(eval_number("var x = 0; if (null) { x = 1 } x"), 0.0);
    assert_eq!(eval_number("var zero = 0; var x = 0; if (zero) { x = 1 } x"), 0.0);
}

#[test]
fn while_for_break_continue() {
    assert_eq!(
        eval_number("var n = 0; while (n < 5) { n = n + 1 } n"),
        5.0
    );
    assert_eq!(
        eval_number(
            r#"
            var sum = 0
            for (var i = 0; i < 10; i = i + 1) {
                if (i == 3) { continue }
                if (i == 6) { break }
                sum = sum + i
            }
            sum
            "#
        ),
        12.0
    );
    // for with empty clauses
    assert_eq!(
        eval_number("var i = 0; for (;;) { i = i + 1; if (i == 4) { break } } i"),
        4.0
    );
}

#[test]
fn foreach_over_arrays_and_maps() {
    assert_eq!(
        eval_number("var sum = 0; for (x in [1, 2, 3]) { sum = sum + x } sum"),
        6.0
    );
    assert_eq!(
        eval_string(
            r#"
            var m = { a: 1, b: 2 }
            var out = ""
            for (kv in m) { out = out + kv["key"] + to_str(kv["value"]) }
            out
            "#
        ),
        "a1b2"
    );
}

#[test]
fn ternary_and_logical_short_circuit() {
    assert_eq!(eval_number("var t = true; t ? 1 : 2"), 1.0);
    assert_eq!(eval_number("var f = false; f ? 1 : 2"), 2.0);
    // the right side must not run
    assert_eq!(eval_ok(r#"var f = false; f && crash("no")"#), Value::Bool(false));
    assert_eq!(eval_ok(r#"var t = true; t || crash("no")"#), Value::Bool(true));
    // non-bool operands pass through
    assert_eq!(eval_number("var x = null; x || 5"), 5.0);
}

#[test]
fn increment_decrement() {
    assert_eq!(eval_number("var x = 1; x++; x"), 2.0);
    assert_eq!(eval_number("var x = 1; ++x"), 2.0);
    // postfix evaluates to the pre-increment value
    assert_eq!(eval_number("var x = 1; var y = x++; y * 10 + x"), 12.0);
    assert_eq!(eval_number("var x = 5; x--; x"), 4.0);
}

#[test]
fn compound_assignment_operators() {
    assert_eq!(eval_number("var x = 8; x += 2; x -= 1; x *= 3; x /= 9; x"), 3.0);
    assert_eq!(eval_number("var x = 5; x %= 3; x"), 2.0);
    assert_eq!(eval_number("var x = 1; x <<= 4; x >>= 2; x"), 4.0);
    assert_eq!(eval_number("var x = 5; x &= 3; x |= 8; x ^= 1; x"), 8.0);
}

// ----------------------------------------------------------------------
// functions
// ----------------------------------------------------------------------

#[test]
fn function_statements_and_recursion() {
    assert_eq!(
        eval_number(
            r#"
            function fib(n) {
                if (n < 2) { return n }
                return fib(n - 1) + fib(n - 2)
            }
            fib(10)
            "#
        ),
        55.0
    );
}

#[test]
fn functions_are_first_class() {
    assert_eq!(
        eval_number(
            r#"
            var apply = function(f, x) { return f(x) }
            apply(function(n) { return n * 2 }, 21)
            "#
        ),
        42.0
    );
}

#[test]
fn call_arity_is_exact() {
    let message = eval_runtime_error("var f = function(a) { return a }; f(1, 2)");
    assert!(
        message.contains("Invalid number of arguments"),
        "got {:?}",
        message
    );
    assert!(message.contains("expected 1, got 2"));
}

#[test]
fn calling_a_non_callable_fails() {
    let message = eval_runtime_error("var x = 1; x(2)");
    assert!(message.contains("not callable"), "got {:?}", message);
}

#[test]
fn implicit_definition_on_assignment() {
    // an unresolved bare identifier on the left of `=` defines itself
    assert_eq!(eval_number("y = 5; y"), 5.0);
}

#[test]
fn cross_type_reassignment_is_allowed() {
    assert_eq!(eval_string(r#"var x = 1; x = "now a string"; x"#), "now a string");
}

// ----------------------------------------------------------------------
// errors
// ----------------------------------------------------------------------

#[test]
fn error_values_are_first_class() {
    assert!(eval_bool(r#"var e = error("oops"); is_error(e)"#));
    let s = eval_string(r#"var e = error("oops"); to_str(e)"#);
    assert!(s.contains("oops"));
}

#[test]
fn unrecovered_errors_carry_tracebacks() {
    let (ape, _) = eval(
        r#"
        var g = function() { crash("deep") }
        var f = function() { g() }
        f()
        "#,
    );
    assert_eq!(ape.errors_count(), 1);
    let err = ape.error_at(0).unwrap();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "deep");
    let tb = err.traceback.as_ref().expect("traceback");
    let names: Vec<_> = tb.items.iter().map(|i| i.function_name.as_str()).collect();
    assert_eq!(names, vec!["g", "f", "main"]);
}

#[test]
fn native_errors_name_the_native_in_the_traceback() {
    let (ape, _) = eval("len(1)");
    let err = ape.error_at(0).unwrap();
    assert!(err.message.contains("Cannot get length"));
    let tb = err.traceback.as_ref().expect("traceback");
    assert!(tb.items.iter().any(|i| i.function_name == "len"));
}

#[test]
fn recover_resumes_the_caller_not_the_crasher() {
    let n = eval_number(
        r#"
        var inner = function() { crash("kaboom") }
        var outer = function() {
            recover (e) { return -1 }
            inner()
            return 1
        }
        outer()
        "#,
    );
    assert_eq!(n, -1.0);
}

#[test]
fn errors_after_recovery_propagate_again() {
    // a frame only recovers once; a crash inside the handler escapes
    let (ape, _) = eval(
        r#"
        var f = function() {
            recover (e) { return crash("second") }
            crash("first")
        }
        f()
        "#,
    );
    assert_eq!(ape.errors_count(), 1);
    assert_eq!(ape.error_at(0).unwrap().message, "second");
}

#[test]
fn runtime_errors_report_positions() {
    let (ape, _) = eval("var a = []\nvar b = 1\na < b");
    let err = ape.error_at(0).unwrap();
    assert_eq!(err.pos.line, 2);
}

// ----------------------------------------------------------------------
// builtins
// ----------------------------------------------------------------------

#[test]
fn collection_builtins() {
    assert_eq!(eval_number("first([7, 8])"), 7.0);
    assert_eq!(eval_number("last([7, 8])"), 8.0);
    assert_eq!(eval_number("len(rest([1, 2, 3]))"), 2.0);
    assert_eq!(eval_number("reverse([1, 2, 3])[0]"), 3.0);
    assert_eq!(eval_string(r#"reverse("abc")"#), "cba");
    assert_eq!(eval_number("len(array(4))"), 4.0);
    assert_eq!(eval_number("var a = [1]; append(a, 2); a[1]"), 2.0);
    assert_eq!(eval_number("len(range(5))"), 5.0);
    assert_eq!(eval_number("range(2, 10, 2)[1]"), 4.0);
    assert_eq!(eval_string("keys({a: 1})[0]"), "a");
    assert_eq!(eval_number("values({a: 5})[0]"), 5.0);
    assert!(eval_bool("var a = [1, 2]; remove(a, 1)"));
    assert_eq!(eval_number("var a = [1, 2, 3]; remove_at(a, 0); a[0]"), 2.0);
    assert_eq!(eval_number("slice([1, 2, 3], 1)[0]"), 2.0);
    assert_eq!(eval_string(r#"slice("hello", -3)"#), "llo");
    assert_eq!(eval_number("var a = [1]; concat(a, [2, 3]); len(a)"), 3.0);
}

#[test]
fn copy_is_shallow_and_deep_copy_is_not() {
    assert_eq!(
        eval_number("var a = [[1]]; var b = copy(a); b[0][0] = 9; a[0][0]"),
        9.0
    );
    assert_eq!(
        eval_number("var a = [[1]]; var b = deep_copy(a); b[0][0] = 9; a[0][0]"),
        1.0
    );
}

#[test]
fn conversion_builtins() {
    assert_eq!(eval_string("to_str(1.5)"), "1.5");
    assert_eq!(eval_string("to_str(2)"), "2");
    assert_eq!(eval_string("to_str(true)"), "true");
    assert_eq!(eval_string("to_str(null)"), "null");
    assert_eq!(eval_string("to_str([1, \"a\"])"), "[1, \"a\"]");
    assert_eq!(eval_number(r#"to_num("42")"#), 42.0);
    assert_eq!(eval_number(r#"to_num("-1.5")"#), -1.5);
    assert_eq!(eval_string("chr(97)"), "a");
    let (ape, _) = eval(r#"to_num("not a number")"#);
    assert!(ape.has_errors());
}

#[test]
fn type_predicates() {
    assert!(eval_bool(r#"is_string("x")"#));
    assert!(eval_bool("is_array([])"));
    assert!(eval_bool("is_map({})"));
    assert!(eval_bool("is_number(1)"));
    assert!(eval_bool("is_bool(false)"));
    assert!(eval_bool("is_null(null)"));
    assert!(eval_bool("is_function(function() { return 1 })"));
    assert!(eval_bool("is_native_function(len)"));
    assert!(!eval_bool("is_error(1)"));
}

#[test]
fn math_builtins() {
    assert_eq!(eval_number("sqrt(16)"), 4.0);
    assert_eq!(eval_number("pow(2, 10)"), 1024.0);
    assert_eq!(eval_number("ceil(1.1)"), 2.0);
    assert_eq!(eval_number("floor(1.9)"), 1.0);
    assert_eq!(eval_number("abs(-3)"), 3.0);
    assert!((eval_number("sin(0)")).abs() < 1e-12);
    // seeded random is deterministic
    assert!(eval_bool(
        "random_seed(7); var a = random(); random_seed(7); var b = random(); a == b"
    ));
    assert!(eval_bool("var r = random(5, 10); r >= 5 && r < 10"));
}

#[test]
fn assert_builtin() {
    assert!(eval_bool("assert(true)"));
    let message = eval_runtime_error("assert(false)");
    assert!(message.contains("assertion failed"));
}

// ----------------------------------------------------------------------
// GC under pressure
// ----------------------------------------------------------------------

#[test]
fn heavy_allocation_survives_sweeps() {
    let n = eval_number(
        r#"
        var acc = []
        for (var i = 0; i < 1000; i = i + 1) {
            acc = acc + to_str(i)
        }
        len(acc)
        "#,
    );
    assert_eq!(n, 1000.0);
}

#[test]
fn long_lived_structures_keep_their_contents() {
    let s = eval_string(
        r#"
        var m = {}
        for (var i = 0; i < 300; i = i + 1) {
            m[to_str(i)] = "value " + to_str(i)
        }
        m["299"]
        "#,
    );
    assert_eq!(s, "value 299");
}
