use std::cell::RefCell;
use std::rc::Rc;

use botscript::{run_source, Arity, BotScriptError, Engine, NativeRegistry, RuntimeErrorKind, Value};

fn runtime_kind(src: &str) -> RuntimeErrorKind {
    match run_source(src) {
        Err(BotScriptError::Runtime(e)) => e.kind,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

/// Registry with a `SAY` that records its output.
fn recording_natives() -> (NativeRegistry, Rc<RefCell<Vec<String>>>) {
    let out = Rc::new(RefCell::new(Vec::new()));
    let sink = out.clone();
    let mut reg = NativeRegistry::with_prelude();
    reg.register("SAY", Arity::AtLeast(1), move |args| {
        let line: Vec<String> = args.iter().map(Value::to_string).collect();
        sink.borrow_mut().push(line.join(" "));
        Ok(Value::Null)
    });
    (reg, out)
}

#[test]
fn arithmetic_keeps_integers_when_exact() {
    assert_eq!(run_source("10 / 2").unwrap(), Value::Int(5));
    assert_eq!(run_source("7 / 2").unwrap(), Value::Float(3.5));
    assert_eq!(run_source("2 + 3 * 4 - 1").unwrap(), Value::Int(13));
    assert_eq!(run_source("1 + 0.5").unwrap(), Value::Float(1.5));
}

#[test]
fn string_concatenation() {
    let src = r#"
        DEF $hp = 20
        "HP: " + $hp
    "#;
    assert_eq!(run_source(src).unwrap(), Value::string("HP: 20"));
}

#[test]
fn keywords_ignore_case() {
    let src = r#"
        def $x = 1
        If $x == 1 and not FALSE
            $x = 2
        endif
        $x
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(2));
}

#[test]
fn elseif_chain_and_switch() {
    let src = r#"
        DEF $n = 15
        DEF $label = ""
        IF $n % 15 == 0
            $label = "fizzbuzz"
        ELSEIF $n % 3 == 0
            $label = "fizz"
        ELSE
            $label = "other"
        ENDIF
        DEF $code = 0
        SWITCH $label
        CASE "fizz":
            $code = 1
        CASE "fizzbuzz":
            $code = 2
        DEFAULT:
            $code = 3
        ENDSWITCH
        $code
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(2));
}

#[test]
fn loops_accumulate() {
    let src = r#"
        DEF $sum = 0
        DEF $i = 0
        WHILE $i < 10
            $i += 1
            IF $i == 3
                CONTINUE
            ENDIF
            $sum += $i
        ENDWHILE
        REPEAT 2
            $sum *= 2
        ENDREPEAT
        $sum
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(208));
}

#[test]
fn functions_return_null_without_return() {
    let src = r#"
        FUNCTION noop($a)
            DEF $b = $a
        ENDFUNCTION
        noop(1)
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Null);
}

#[test]
fn commands_and_calls_reach_natives() {
    let (natives, out) = recording_natives();
    let mut engine = Engine::new(natives).strict(true);
    let src = r#"
        DEF $hp = 7
        SAY "hello", $hp
        SAY ("HP: " + $hp)
        SAY(MAX(1, $hp, 3))
    "#;
    let report = engine.run_source(src).unwrap();
    assert!(report.result.is_ok());
    assert_eq!(*out.borrow(), vec!["hello 7", "HP: 7", "7"]);
}

#[test]
fn host_globals_are_read_only_but_refreshable() {
    let mut engine = Engine::new(NativeRegistry::with_prelude()).strict(true);
    engine
        .interpreter_mut()
        .define_global("$health", Value::Int(20))
        .unwrap();
    let report = engine.run_source("$health - 5").unwrap();
    assert_eq!(report.result, Ok(Value::Int(15)));

    engine
        .interpreter_mut()
        .set_global("$health", Value::Int(3))
        .unwrap();
    let report = engine.run_source("$health").unwrap();
    assert_eq!(report.result, Ok(Value::Int(3)));

    let report = engine.run_source("$health = 1").unwrap();
    let err = report.result.unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::ImmutableBinding("$health".into()));
}

#[test]
fn runtime_errors_carry_kind_and_line() {
    match run_source("DEF $a = 1\nDEF $b = $a / 0") {
        Err(BotScriptError::Runtime(e)) => {
            assert_eq!(e.kind, RuntimeErrorKind::DivisionByZero);
            assert_eq!(e.line, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        runtime_kind("$missing + 1"),
        RuntimeErrorKind::UndefinedVariable("$missing".into())
    );
    assert!(matches!(
        runtime_kind("CONST $c = 1\n$c = 2"),
        RuntimeErrorKind::ImmutableBinding(_)
    ));
    assert!(matches!(runtime_kind("\"a\" - \"b\""), RuntimeErrorKind::UnknownOperator(_)));
    assert!(matches!(runtime_kind("TRUE * 2"), RuntimeErrorKind::TypeMismatch(_)));
}

#[test]
fn try_catch_exposes_error_details() {
    let src = r#"
        DEF $kind = ""
        DEF $msg = ""
        TRY
            FAIL("out of arrows")
        CATCH $e
            $kind = ERROR_KIND($e)
            $msg = ERROR_MESSAGE($e)
        ENDTRY
        $kind + ": " + $msg
    "#;
    let v = run_source(src).unwrap();
    let s = v.to_string();
    assert!(s.starts_with("NativeError: "), "{}", s);
    assert!(s.contains("out of arrows"), "{}", s);
}

#[test]
fn halt_stops_the_script() {
    let (natives, out) = recording_natives();
    let mut engine = Engine::new(natives);
    let src = r#"
        SAY "before"
        HALT "done"
        SAY "after"
    "#;
    let report = engine.run_source(src).unwrap();
    let err = report.result.unwrap_err();
    assert!(err.kind.is_host_failure());
    assert_eq!(err.kind.name(), "Halted");
    assert_eq!(*out.borrow(), vec!["before"]);
}

#[test]
fn recursion_limit_is_reported() {
    let src = r#"
        FUNCTION down($n)
            RETURN down($n + 1)
        ENDFUNCTION
        down(0)
    "#;
    assert!(matches!(runtime_kind(src), RuntimeErrorKind::StackOverflow { .. }));
}
