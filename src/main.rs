//! BotScript runner: execute a script file or start a REPL.
//!
//! Usage:
//!   botscript <script.bot>
//!   botscript                 # REPL, `;q` quits

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use sysinfo::{Pid, System};

use botscript::lexer::{tokenize_with, TokenKind};
use botscript::{Arity, Compiled, Diagnostic, Engine, EngineConfig, Keywords, NativeRegistry, Value};

/// Runs BotScript automation scripts against a demo bot that prints what
/// it would do.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Script to run. Starts a REPL when omitted.
    script: Option<PathBuf>,

    /// Print phase timings and memory usage after the run.
    #[arg(long)]
    performance: bool,

    /// Skip constant folding and dead code removal.
    #[arg(long)]
    no_optimize: bool,

    /// Refuse to run a script that has error diagnostics.
    #[arg(long)]
    strict: bool,

    /// Maximum user-function call depth.
    #[arg(long, default_value_t = 128)]
    max_call_depth: usize,

    /// Maximum block and expression nesting accepted by the parser.
    #[arg(long, default_value_t = 64)]
    max_depth: usize,

    /// Treat keywords as case-sensitive (uppercase only).
    #[arg(long)]
    case_sensitive: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig {
        max_call_depth: args.max_call_depth,
        max_nesting_depth: args.max_depth,
        optimize: !args.no_optimize,
        case_insensitive_keywords: !args.case_sensitive,
    };
    let mut engine = Engine::with_config(bot_natives(), config).strict(args.strict);
    define_bot_state(&mut engine)?;

    if let Some(path) = &args.script {
        let src = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        run_with_engine(&mut engine, &src, args.strict, args.performance);
        return Ok(());
    }

    repl(&mut engine)
}

fn repl(engine: &mut Engine) -> anyhow::Result<()> {
    println!("[ repl mode on ]\nfor quitting repl mode use \";q\" command");
    let mut rl = Editor::<(), DefaultHistory>::new().context("failed to start line editor")?;
    let history_path = repl_history_path();
    if let Some(ref path) = history_path {
        let _ = rl.load_history(path);
    }
    let keywords = Keywords::from(engine.interpreter().config());

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                if buffer.is_empty() {
                    break;
                }
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("repl error: {}", e);
                break;
            }
        };
        let line = line.trim_end();

        if buffer.is_empty() && line.is_empty() {
            continue;
        }
        if buffer.is_empty() && line.starts_with(";q") {
            println!("Quitting repl mode");
            break;
        }
        let _ = rl.add_history_entry(line);
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(line);
        if needs_more_input(&buffer, &keywords) {
            continue;
        }
        match engine.run_in_global(&buffer) {
            Ok(report) => {
                print_diagnostics(&report.diagnostics);
                match report.result {
                    Ok(Value::Null) => {}
                    Ok(v) => println!("{}", v),
                    Err(e) => eprintln!("{}", e),
                }
            }
            Err(e) => eprintln!("{}", e),
        }
        buffer.clear();
    }

    if let Some(ref path) = history_path {
        let _ = rl.save_history(path);
    }
    Ok(())
}

fn run_with_engine(engine: &mut Engine, src: &str, strict: bool, performance: bool) {
    let perf_start = Instant::now();
    let mem_start = rss_kb();

    let t0 = Instant::now();
    let compiled: Compiled = match engine.compile(src) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return;
        }
    };
    let compile_dur = t0.elapsed();
    let mem_after_compile = rss_kb();

    print_diagnostics(&compiled.diagnostics);
    if strict && compiled.has_errors() {
        eprintln!("not running: script has errors");
        return;
    }

    let t1 = Instant::now();
    let run_res = engine.interpreter_mut().run(&compiled.program);
    let run_dur = t1.elapsed();
    let mem_after_run = rss_kb();
    if let Err(e) = run_res {
        eprintln!("{}", e);
    }

    if performance {
        print_perf(
            perf_start.elapsed(),
            compile_dur,
            run_dur,
            mem_start,
            mem_after_compile,
            mem_after_run,
        );
    }
}

fn print_diagnostics(diags: &[Diagnostic]) {
    for d in diags {
        eprintln!("{}", d);
    }
}

/// Demo verbs: each prints the action a real bot would perform.
fn bot_natives() -> NativeRegistry {
    let mut reg = NativeRegistry::with_prelude();
    reg.register("SAY", Arity::AtLeast(1), |args| {
        let text: Vec<String> = args.iter().map(Value::to_string).collect();
        println!("[bot] says: {}", text.join(" "));
        Ok(Value::Null)
    });
    let verbs: [(&'static str, Arity); 11] = [
        ("MOVE", Arity::Range(1, 2)),
        ("GOTO", Arity::Exact(3)),
        ("ATTACK", Arity::Range(0, 1)),
        ("DIG", Arity::Exact(3)),
        ("PLACE", Arity::Range(1, 4)),
        ("DROP", Arity::Range(1, 2)),
        ("EQUIP", Arity::Exact(1)),
        ("WAIT", Arity::Exact(1)),
        ("FOLLOW", Arity::Exact(1)),
        ("MINE", Arity::Range(1, 2)),
        ("FARM", Arity::Range(0, 1)),
    ];
    for (verb, arity) in verbs {
        reg.register(verb, arity, move |args| {
            let shown: Vec<String> = args.iter().map(Value::to_string).collect();
            println!("[bot] {} {}", verb.to_lowercase(), shown.join(" "));
            Ok(Value::Bool(true))
        });
    }
    reg
}

fn define_bot_state(engine: &mut Engine) -> anyhow::Result<()> {
    let interp = engine.interpreter_mut();
    interp.define_global("$name", Value::string("bot"))?;
    interp.define_global("$health", Value::Int(20))?;
    interp.define_global("$food", Value::Int(20))?;
    Ok(())
}

fn repl_history_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".botscript_history"))
}

fn rss_kb() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid).map(|p| p.memory() / 1024)
}

fn print_perf(
    total: Duration,
    compile: Duration,
    runtime: Duration,
    mem_start: Option<u64>,
    mem_after_compile: Option<u64>,
    mem_after_run: Option<u64>,
) {
    eprintln!("[performance]");
    eprintln!("  total:     {}", fmt_duration(total));
    eprintln!("  compile:   {}", fmt_duration(compile));
    eprintln!("  runtime:   {}", fmt_duration(runtime));
    if let (Some(a), Some(b), Some(c)) = (mem_start, mem_after_compile, mem_after_run) {
        eprintln!("  mem:");
        eprintln!("    start:   {}", fmt_mem(a));
        eprintln!("    compile: {}", fmt_mem(b));
        eprintln!("    runtime: {}", fmt_mem(c));
    } else {
        eprintln!("  mem: unavailable");
    }
}

fn fmt_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.2}ms", micros as f64 / 1000.0)
    } else {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    }
}

fn fmt_mem(kb: u64) -> String {
    if kb < 1024 {
        return format!("{} KB", kb);
    }
    format!("{:.2} MB", kb as f64 / 1024.0)
}

/// Whether the REPL should keep reading: an open string, an unclosed `(`,
/// or a block opener without its terminator.
fn needs_more_input(src: &str, keywords: &Keywords) -> bool {
    let Ok(tokens) = tokenize_with(src, keywords) else {
        return true;
    };
    let mut paren = 0i32;
    let mut blocks = 0i32;
    for t in &tokens {
        match t.kind {
            TokenKind::LParen => paren += 1,
            TokenKind::RParen => paren -= 1,
            TokenKind::Function
            | TokenKind::If
            | TokenKind::While
            | TokenKind::Repeat
            | TokenKind::Switch
            | TokenKind::Try => blocks += 1,
            TokenKind::EndFunction
            | TokenKind::EndIf
            | TokenKind::EndWhile
            | TokenKind::EndRepeat
            | TokenKind::EndSwitch
            | TokenKind::EndTry => blocks -= 1,
            _ => {}
        }
    }
    paren > 0 || blocks > 0
}
