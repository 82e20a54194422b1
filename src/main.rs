//! The `von` executable: script runner and interactive REPL.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::debug;

use von::prelude::*;

// sysexits(3) codes.
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "von")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Von programming language", long_about = None)]
struct Cli {
    /// Script to run (conventionally a .von file); omit it for an
    /// interactive session.
    script: Option<PathBuf>,
}

fn main() {
    // Diagnostics go to stderr so they never mix with program output.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|error| {
        let _ = error.print();
        use clap::error::ErrorKind;
        match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
            _ => std::process::exit(EX_USAGE),
        }
    });

    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

/// Interpret a whole file, exiting with the conventional code on failure.
fn run_file(path: &Path) {
    let source = fs::read_to_string(path).unwrap_or_else(|error| {
        eprintln!("Could not open file \"{}\": {error}.", path.display());
        std::process::exit(EX_IOERR);
    });

    debug!(path = %path.display(), bytes = source.len(), "running script");
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretationError::CompileError) => std::process::exit(EX_DATAERR),
        Err(InterpretationError::RuntimeError) => std::process::exit(EX_SOFTWARE),
    }
}

/// One line, one interpretation. The VM — and with it globals, interned
/// strings, and the heap — lives for the whole session, and errors only
/// unwind the current line.
fn repl() {
    println!("Von Programming Language");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Type '.help' for information");
    println!();

    let mut vm = Vm::new();
    let stdin = io::stdin();

    loop {
        print!(">> ");
        io::stdout().flush().expect("failed to flush the prompt");

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                // End of input.
                println!();
                break;
            }
            Ok(_) => {}
            Err(error) => {
                eprintln!("Could not read input: {error}.");
                std::process::exit(EX_IOERR);
            }
        }

        match line.trim() {
            "" => continue,
            ".exit" => break,
            ".help" => {
                print_help();
                continue;
            }
            _ => {}
        }

        // Errors were already reported on stderr; the session carries on.
        let _ = vm.interpret(&line);
    }
}

fn print_help() {
    println!("Enter Von statements to run them, e.g.: print 1 + 2;");
    println!();
    println!(".help    show this message");
    println!(".exit    leave the session");
}
