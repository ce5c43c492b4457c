//! The `ape` command line: run a script file, dump its bytecode, or start
//! an interactive session.

use ape_runtime::Ape;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ape", about = "The Ape scripting language", version)]
struct Args {
    /// Script to run; omit for an interactive session
    file: Option<PathBuf>,

    /// Wall-clock execution limit in milliseconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    dump_bytecode: bool,

    /// Verbose logging (-v for debug, -vv for trace); APE_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("APE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut ape = Ape::new();
    if let Some(timeout) = args.timeout {
        ape.set_timeout_ms(timeout);
    }

    match args.file {
        Some(file) => run_file(&mut ape, &file, args.dump_bytecode),
        None => repl(&mut ape),
    }
}

fn print_errors(ape: &Ape) {
    for err in ape.errors() {
        eprint!("{}", err.serialize());
    }
}

fn run_file(ape: &mut Ape, file: &PathBuf, dump_bytecode: bool) -> ExitCode {
    let path = file.to_string_lossy();
    if dump_bytecode {
        match ape.disassemble_file(&path) {
            Some(listing) => {
                print!("{}", listing);
                ExitCode::SUCCESS
            }
            None => {
                print_errors(ape);
                ExitCode::FAILURE
            }
        }
    } else {
        ape.execute_file(&path);
        if ape.has_errors() {
            print_errors(ape);
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

fn repl(ape: &mut Ape) -> ExitCode {
    ape.set_repl_mode(true);
    let Ok(mut editor) = DefaultEditor::new() else {
        eprintln!("Cannot open terminal");
        return ExitCode::FAILURE;
    };
    println!("ape {} - ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                let result = ape.execute(&line);
                if ape.has_errors() {
                    print_errors(ape);
                    ape.clear_errors();
                } else {
                    println!("{}", ape.value_to_string(result));
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }
    ExitCode::SUCCESS
}
