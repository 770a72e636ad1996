use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use clap::Parser as ClapParser;

use bytelox::debug::disassemble_chunk;
use bytelox::prelude::*;

/// The conventional exit code in BSD Unixes.
/// See: man 3 sysexits
mod ex {
    /// The conventional exit code for usage error.
    pub const USAGE: i32 = 64;
    /// An error occured while doing I/O on a file.
    pub const IOERR: i32 = 74;
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The .lox file to execute. Starts a REPL when omitted
    #[arg(required = false)]
    path: Option<String>,

    /// Dump bytecode + constant pool instead of executing
    #[arg(long)]
    dump: bool,
}

fn main() {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version end up here too.
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            process::exit(ex::USAGE);
        }
    };

    let status = match cli.path {
        Some(path) => run_file(&path, cli.dump),
        None => repl(cli.dump),
    };

    process::exit(status);
}

/// Use Lox interactively using the read-execute-print loop.
///
/// Errors are reported, but never end the session. Globals persist between lines.
fn repl(dump: bool) -> i32 {
    let mut vm = VM::default();
    let mut line = String::with_capacity(1024);
    let mut stdin = io::stdin().lock();

    loop {
        line.clear();

        print!("> ");
        if io::stdout().flush().is_err() {
            return ex::IOERR;
        }

        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                return 0;
            }
            // Errors were already reported on stderr.
            Ok(_) if dump => {
                let _ = dump_source(&mut vm, &line, "repl");
            }
            Ok(_) => {
                let _ = vm.interpret(&line);
            }
        }
    }
}

fn run_file(filename: &str, dump: bool) -> i32 {
    let source = match fs::read_to_string(filename) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Could not read file \"{filename}\": {err}");
            return ex::IOERR;
        }
    };
    let mut vm = VM::default();

    if dump {
        return match dump_source(&mut vm, &source, filename) {
            Ok(()) => 0,
            Err(err) => err.exit_code(),
        };
    }

    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(err) => {
            log::debug!("{filename}: {err}");
            err.exit_code()
        }
    }
}

/// Compiles without running, and prints the listing to stdout.
fn dump_source(vm: &mut VM, source: &str, name: &str) -> bytelox::Result<()> {
    match vm.compile(source) {
        Ok(chunk) => {
            print!("{}", disassemble_chunk(&chunk, vm.heap(), name));
            Ok(())
        }
        Err(failure) => {
            for diagnostic in failure.diagnostics.iter() {
                eprintln!("{diagnostic}");
            }
            Err(failure.into())
        }
    }
}
