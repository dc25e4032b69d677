//! Ember: a clap-driven CLI wrapping `ember-compiler` and `ember-vm`.
//! Two modes, matching `original_source/src/main.c`: no arguments opens a
//! line-editing REPL; one positional argument runs a script file.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use ember_compiler::{CompilerConfig, Compiler};
use ember_core::error::InterpretResult;
use ember_core::heap::Heap;
use ember_vm::{Vm, VmConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Exit code used for I/O failures reading a script file, matching
/// `original_source`'s `readFile`.
const EXIT_IO_ERROR: u8 = 74;
/// Exit code for a script that fails to compile.
const EXIT_COMPILE_ERROR: u8 = 65;
/// Exit code for a script that compiles but fails at runtime.
const EXIT_RUNTIME_ERROR: u8 = 70;
/// Exit code for a malformed invocation (unknown flag, extra positional
/// argument, etc.), matching `original_source`'s usage-error path.
const EXIT_USAGE_ERROR: u8 = 64;

#[derive(Parser)]
#[command(name = "ember", about = "Bytecode interpreter for the Ember language")]
struct Cli {
    /// Script to run. Omit to start an interactive REPL.
    script: Option<PathBuf>,

    /// Method name treated as a class's initializer.
    #[arg(long, default_value = "constructor")]
    initializer_name: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap exits 0 itself for `--help`/`--version`; anything else
            // is a genuine usage error and must report 64.
            let code = match e.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
                _ => EXIT_USAGE_ERROR,
            };
            e.print().expect("clap error prints to stderr/stdout");
            return ExitCode::from(code);
        }
    };
    let compiler_config = CompilerConfig::new().initializer_name(cli.initializer_name.clone());
    let vm_config = VmConfig::new().initializer_name(cli.initializer_name);

    match cli.script {
        Some(path) => run_file(&path, &compiler_config, vm_config),
        None => {
            run_repl(&compiler_config, vm_config);
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &PathBuf, compiler_config: &CompilerConfig, vm_config: VmConfig) -> ExitCode {
    let source = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {e}", path.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let heap = Heap::new();
    let mut vm = Vm::new(&heap, vm_config, io::stdout());
    match interpret(&heap, compiler_config, &mut vm, &source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}

fn run_repl(compiler_config: &CompilerConfig, vm_config: VmConfig) {
    let heap = Heap::new();
    let mut vm = Vm::new(&heap, vm_config, io::stdout());
    let mut editor = DefaultEditor::new().expect("terminal supports line editing");

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let _ = interpret(&heap, compiler_config, &mut vm, line.as_bytes());
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }
}

/// Compiles `source` and, on success, runs it to completion. Diagnostics
/// and runtime stack traces print to stderr here rather than inside
/// `ember-compiler`/`ember-vm`, which stay embeddable and testable
/// without capturing process-wide streams.
fn interpret(
    heap: &Heap,
    compiler_config: &CompilerConfig,
    vm: &mut Vm<impl Write>,
    source: &[u8],
) -> InterpretResult {
    let function = match Compiler::new(source, heap, compiler_config).compile() {
        Ok(f) => f,
        Err(compile_error) => {
            eprint!("{compile_error}");
            return InterpretResult::CompileError;
        }
    };
    match vm.interpret(function) {
        Ok(()) => InterpretResult::Ok,
        Err(runtime_error) => {
            eprint!("{runtime_error}");
            InterpretResult::RuntimeError
        }
    }
}
