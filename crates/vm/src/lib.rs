//! Ember VM: the bytecode interpreter, garbage collector hookup, and
//! native function catalogue.
//!
//! # Modules
//!
//! - `config`: frame/stack limits and the initializer method name.
//! - `vm`: the `Vm` struct and its opcode dispatch loop.
//! - `natives`: the built-in native function catalogue (`clock`, `sleep`,
//!   `system`, `random`, `gc`).
//! - `disassemble`: bytecode disassembly, used by `EMBER_TRACE_EXECUTION`.
//! - `error`: `RuntimeError`/`NativeError`.
//!
//! This crate depends only on `ember-core`, not on `ember-compiler` — an
//! embedder links both and hands the compiler's output `NonNull<Obj>`
//! straight into `Vm::interpret`.

pub mod config;
pub mod disassemble;
pub mod error;
pub mod natives;
pub mod vm;

pub use config::VmConfig;
pub use error::{NativeError, RuntimeError};
pub use vm::Vm;
