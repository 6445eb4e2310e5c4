// Property tests for the front end and the optimizer.
//
// Printing a parsed program and parsing it again must give the same tree,
// the optimizer must reach a fixed point in one pass and must not change
// what a program over integer variables computes, and no token soup may
// panic the parser.

use botscript::lexer::tokenize;
use botscript::optimizer::optimize;
use botscript::parser::parse;
use botscript::{compile, Arity, Engine, EngineConfig, NativeRegistry, Program, Value};
use proptest::prelude::*;

fn natives() -> NativeRegistry {
    let mut natives = NativeRegistry::with_prelude();
    natives.register("SAY", Arity::AtLeast(1), |_| Ok(Value::Null));
    natives
}

fn parse_clean(src: &str) -> Program {
    let natives = natives();
    let (program, diags) = parse(tokenize(src).expect("tokenize"), &natives);
    assert!(diags.is_empty(), "{}\n{:?}", src, diags);
    program
}

/// Fully parenthesized expressions over ints, bools, strings and variables.
fn arb_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        (0i64..1000).prop_map(|n| n.to_string()),
        Just("TRUE".to_string()),
        Just("FALSE".to_string()),
        Just("NULL".to_string()),
        "[a-z]{0,4}".prop_map(|s| format!("\"{}\"", s)),
        prop::sample::select(vec!["$a", "$b", "$hp"]).prop_map(String::from),
    ];
    leaf.prop_recursive(4, 24, 3, |inner| {
        let op = prop::sample::select(vec![
            "+", "-", "*", "/", "%", "==", "!=", "<", "<=", ">", ">=", "&&", "||",
        ]);
        prop_oneof![
            (inner.clone(), op, inner.clone()).prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
            inner.clone().prop_map(|e| format!("-{}", e)),
            inner.clone().prop_map(|e| format!("!{}", e)),
            prop::collection::vec(inner, 0..3).prop_map(|args| format!("f({})", args.join(", "))),
        ]
    })
}

/// Mixed-type expressions over integer variables. Folding must not change
/// what they evaluate to, runtime errors included.
fn arb_mixed_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        4 => (0i64..50).prop_map(|n| n.to_string()),
        3 => prop::sample::select(vec!["$a", "$b", "$k"]).prop_map(String::from),
        1 => prop::sample::select(vec!["TRUE", "FALSE", "NULL", "\"\"", "\"ab\""]).prop_map(String::from),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        let op = prop::sample::select(vec!["+", "-", "*", "/", "%", "==", "<", "&&", "||"]);
        prop_oneof![
            4 => (inner.clone(), op, inner.clone()).prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
            1 => inner.clone().prop_map(|e| format!("-{}", e)),
            1 => inner.prop_map(|e| format!("!{}", e)),
        ]
    })
}

fn arb_program() -> impl Strategy<Value = String> {
    (arb_expr(), arb_expr(), arb_expr()).prop_map(|(a, b, c)| {
        format!(
            "DEF $a = {}\nIF {}\nSAY {} 1\nELSE\nDEF $b = f({})\nENDIF",
            a, b, c, a
        )
    })
}

fn run(src: &str, optimize: bool) -> Result<Value, String> {
    let config = EngineConfig {
        optimize,
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(NativeRegistry::with_prelude(), config).strict(true);
    let report = engine.run_source(src).map_err(|e| e.to_string())?;
    report.result.map_err(|e| e.kind.name().to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn print_then_parse_is_stable(src in arb_program()) {
        let first = parse_clean(&src);
        let printed = first.to_string();
        let second = parse_clean(&printed);
        prop_assert_eq!(first, second, "printed:\n{}", printed);
    }

    #[test]
    fn optimizer_reaches_fixed_point(src in arb_program()) {
        let once = optimize(&parse_clean(&src));
        let twice = optimize(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn optimizer_preserves_results(e in arb_mixed_expr()) {
        let src = format!("DEF $a = 7\nDEF $b = -3\nCONST $k = 4\n{}", e);
        prop_assert_eq!(run(&src, true), run(&src, false), "source:\n{}", src);
    }

    #[test]
    fn token_soup_never_panics(words in prop::collection::vec(
        prop::sample::select(vec![
            "DEF", "CONST", "FUNCTION", "ENDFUNCTION", "IF", "ELSEIF", "ELSE", "ENDIF",
            "WHILE", "ENDWHILE", "REPEAT", "ENDREPEAT", "SWITCH", "CASE", "DEFAULT",
            "ENDSWITCH", "TRY", "CATCH", "ENDTRY", "RETURN", "BREAK", "CONTINUE",
            "$x", "f", "SAY", "1", "2.5", "\"s\"", "(", ")", ",", ":", ";", "=",
            "+=", "+", "-", "*", "/", "==", "&&", "!", "@", "\n", "\n",
        ]),
        0..60,
    )) {
        let src = words.join(" ");
        let _ = compile(&src, &EngineConfig::default(), &natives());
    }
}
