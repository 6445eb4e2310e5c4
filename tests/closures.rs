use botscript::{run_source, Engine, NativeRegistry, RuntimeErrorKind, Value};

#[test]
fn returned_function_captures_by_value() {
    let src = r#"
        FUNCTION adder($n)
            FUNCTION add($x)
                RETURN $x + $n
            ENDFUNCTION
            RETURN add
        ENDFUNCTION
        DEF $add5 = adder(5)
        DEF $add7 = adder(7)
        $add5(10) * 100 + $add7(1)
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(1508));
}

#[test]
fn captured_names_cannot_be_reassigned() {
    let src = r#"
        FUNCTION make()
            DEF $count = 0
            FUNCTION bump()
                $count += 1
                RETURN $count
            ENDFUNCTION
            RETURN bump
        ENDFUNCTION
        DEF $b = make()
        $b()
    "#;
    match run_source(src) {
        Err(botscript::BotScriptError::Runtime(e)) => {
            assert_eq!(e.kind, RuntimeErrorKind::ImmutableBinding("$count".into()));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn closures_see_the_value_at_scope_exit() {
    let src = r#"
        FUNCTION make()
            DEF $v = 1
            FUNCTION get()
                RETURN $v
            ENDFUNCTION
            $v = 2
            RETURN get
        ENDFUNCTION
        DEF $g = make()
        $g()
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(2));
}

#[test]
fn returned_function_can_recurse() {
    let src = r#"
        FUNCTION make()
            FUNCTION fact($n)
                IF $n <= 1
                    RETURN 1
                ENDIF
                RETURN $n * fact($n - 1)
            ENDFUNCTION
            RETURN fact
        ENDFUNCTION
        DEF $f = make()
        $f(5)
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(120));
}

#[test]
fn inner_declarations_shadow_outer_ones() {
    let src = r#"
        DEF $x = 1
        DEF $seen = 0
        IF TRUE
            DEF $x = 10
            $seen = $x
        ENDIF
        $seen * 100 + $x
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(1001));
}

#[test]
fn global_functions_see_later_updates() {
    let mut engine = Engine::new(NativeRegistry::with_prelude()).strict(true);
    let first = engine
        .run_in_global("DEF $base = 1\nFUNCTION read()\nRETURN $base\nENDFUNCTION")
        .unwrap();
    assert!(first.result.is_ok());
    let second = engine.run_in_global("$base = 10\nread()").unwrap();
    assert_eq!(second.result, Ok(Value::Int(10)));
}

#[test]
fn functions_are_values() {
    let src = r#"
        FUNCTION twice($f, $x)
            RETURN $f($f($x))
        ENDFUNCTION
        FUNCTION inc($v)
            RETURN $v + 1
        ENDFUNCTION
        twice(inc, 3)
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(5));
}

#[test]
fn scopes_are_released_after_a_run() {
    let mut engine = Engine::new(NativeRegistry::with_prelude());
    let before = engine.interpreter().scopes().live_count();
    let report = engine
        .run_source("FUNCTION f($a)\nRETURN $a\nENDFUNCTION\nREPEAT 3\nf(1)\nENDREPEAT")
        .unwrap();
    assert!(report.result.is_ok());
    assert_eq!(engine.interpreter().scopes().live_count(), before);
}

#[test]
fn top_level_definitions_stay_live_in_both_run_modes() {
    let src = r#"
        DEF $count = 0
        FUNCTION make()
            FUNCTION bump()
                $count += 1
                RETURN $count
            ENDFUNCTION
            RETURN bump
        ENDFUNCTION
        DEF $b = make()
        $b()
        $b()
    "#;
    assert_eq!(run_source(src).unwrap(), Value::Int(2));

    let mut engine = Engine::new(NativeRegistry::with_prelude());
    let report = engine.run_in_global(src).unwrap();
    assert_eq!(report.result, Ok(Value::Int(2)));
    assert_eq!(engine.interpreter().global("$count"), Some(Value::Int(2)));
}
