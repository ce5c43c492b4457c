//! The embedding surface: hooks, natives, host calls, error queue.

use ape_runtime::{Ape, ErrorKind, NativeError, Value};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

#[test]
fn stdout_hook_captures_print_output() {
    let captured: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    let mut ape = Ape::new();
    ape.set_stdout_write(move |bytes| {
        sink.borrow_mut().extend_from_slice(bytes);
        bytes.len()
    });
    ape.execute(r#"print("a"); println("b", 1); print(2)"#);
    assert!(!ape.has_errors());
    assert_eq!(String::from_utf8_lossy(&captured.borrow()), "ab1\n2");
}

#[test]
fn execute_file_reads_through_the_default_hook() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.ape");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "var result = 6 * 7").unwrap();
    drop(f);

    let mut ape = Ape::new();
    ape.execute_file(&path.to_string_lossy());
    assert!(!ape.has_errors(), "{:?}", ape.error_at(0).map(|e| e.to_string()));
    assert_eq!(ape.get_object("result"), Value::Number(42.0));
}

#[test]
fn imports_resolve_relative_to_the_importing_file() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("lib");
    std::fs::create_dir(&sub).unwrap();
    std::fs::write(sub.join("helper.ape"), "var value = 40").unwrap();
    std::fs::write(
        dir.path().join("main.ape"),
        "import \"lib/helper\"\nvar out = helper::value + 2",
    )
    .unwrap();

    let mut ape = Ape::new();
    ape.execute_file(&dir.path().join("main.ape").to_string_lossy());
    assert!(!ape.has_errors(), "{:?}", ape.error_at(0).map(|e| e.to_string()));
    assert_eq!(ape.get_object("out"), Value::Number(42.0));
}

#[test]
fn file_write_hook_receives_host_writes() {
    let written: Rc<RefCell<Vec<(String, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = written.clone();
    let mut ape = Ape::new();
    ape.set_file_write(move |path, bytes| {
        sink.borrow_mut().push((path.to_string(), bytes.to_vec()));
        bytes.len()
    });
    let n = ape.write_file("out.txt", b"payload");
    assert_eq!(n, 7);
    let written = written.borrow();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, "out.txt");
    assert_eq!(written[0].1, b"payload");
}

#[test]
fn file_write_defaults_to_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.txt");
    let ape = Ape::new();
    let n = ape.write_file(&path.to_string_lossy(), b"hello");
    assert_eq!(n, 5);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    // the matching read path goes through the same hook table
    assert_eq!(ape.read_file(&path.to_string_lossy()).as_deref(), Some("hello"));
}

#[test]
fn missing_file_queues_a_compilation_error() {
    let mut ape = Ape::new();
    ape.set_file_read(|_| None);
    let result = ape.execute_file("ghost.ape");
    assert!(result.is_null());
    let err = ape.error_at(0).unwrap();
    assert_eq!(err.kind, ErrorKind::Compilation);
    assert!(err.message.contains("ghost.ape"));
}

#[test]
fn natives_receive_arguments_and_build_values() {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    ape.set_native_function("make_pair", |heap, args| {
        Ok(heap.make_array_from(vec![args[0], args[1]]))
    });
    let result = ape.execute("make_pair(1, 2)[1]");
    assert_eq!(result, Value::Number(2.0));
}

#[test]
fn native_raised_errors_are_recoverable() {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    ape.set_native_function("explode", |_heap, _args| {
        Err(NativeError::runtime("host says no"))
    });
    let result = ape.execute(
        r#"
        var f = function() { recover (e) { return to_str(e) } explode() }
        f()
        "#,
    );
    let s = ape.str_of(result).unwrap();
    assert!(s.contains("host says no"));
    assert!(!ape.has_errors());
}

#[test]
fn natives_returning_error_values_do_not_halt() {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    ape.set_native_function("maybe", |heap, _args| Ok(heap.make_error("soft failure")));
    let result = ape.execute("var e = maybe(); is_error(e)");
    assert_eq!(result, Value::Bool(true));
    assert!(!ape.has_errors());
}

#[test]
fn host_calls_script_functions() {
    let mut ape = Ape::new();
    ape.execute("var double = function(x) { return x * 2 }");
    let result = ape.call("double", &[Value::Number(21.0)]);
    assert_eq!(result, Value::Number(42.0));
    assert!(!ape.has_errors());

    // arity is checked on the host path too
    ape.call("double", &[]);
    assert!(ape.has_errors());
}

#[test]
fn host_calls_native_functions() {
    let mut ape = Ape::new();
    let result = ape.call("to_str", &[Value::Number(7.0)]);
    assert_eq!(ape.str_of(result), Some("7"));
}

#[test]
fn global_constants_are_not_reassignable() {
    let mut ape = Ape::new();
    ape.set_global_constant("limit", Value::Number(10.0));
    ape.execute("limit = 5");
    assert!(ape.has_errors());
    assert!(ape
        .error_at(0)
        .unwrap()
        .message
        .contains("not assignable"));
}

#[test]
fn shadowing_a_builtin_is_rejected() {
    let mut ape = Ape::new();
    ape.execute("var len = 1");
    assert!(ape.has_errors());
    assert_eq!(ape.error_at(0).unwrap().kind, ErrorKind::Compilation);
}

#[test]
fn error_queue_exposes_positions_and_serialization() {
    let mut ape = Ape::new();
    ape.execute("var x = 1\nvar y = missing");
    let err = ape.error_at(0).unwrap();
    assert_eq!(err.kind, ErrorKind::Compilation);
    assert_eq!(err.pos.line, 1);
    let rendered = err.serialize();
    assert!(rendered.contains("COMPILATION ERROR"));
    assert!(rendered.contains("missing"));
}

#[test]
fn repl_state_persists_across_executes() {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    ape.execute("var counter = 0");
    ape.execute("counter = counter + 1");
    ape.execute("counter = counter + 1");
    let result = ape.execute("counter");
    assert_eq!(result, Value::Number(2.0));
}

#[test]
fn values_returned_to_the_host_can_be_pinned() {
    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    let v = ape.execute(r#""keep me around""#);
    assert!(ape.pin_object(v));
    // allocation churn forces several sweeps
    ape.execute("for (var i = 0; i < 600; i = i + 1) { var s = to_str(i) + \"!\" }");
    assert_eq!(ape.str_of(v), Some("keep me around"));
    ape.unpin_object(v);
}

#[test]
fn externals_round_trip_opaque_host_data() {
    #[derive(Debug, PartialEq)]
    struct HostThing(u32);

    let mut ape = Ape::new();
    ape.set_repl_mode(true);
    let ext = ape.external(Rc::new(HostThing(7)));
    ape.set_global_constant("thing", ext);
    let got = ape.execute("thing");
    let handle = got.handle().unwrap();
    let data = ape.heap().external_ref(handle).unwrap();
    let thing = data.data.downcast_ref::<HostThing>().unwrap();
    assert_eq!(*thing, HostThing(7));
    assert_eq!(ape.execute("is_external(thing)"), Value::Bool(true));
}

#[test]
fn disassembly_lists_instructions() {
    let mut ape = Ape::new();
    let listing = ape.disassemble("var x = 1 + 2").unwrap();
    assert!(listing.contains("NUMBER"));
    assert!(listing.contains("DEFINE_MODULE_GLOBAL"));
}
