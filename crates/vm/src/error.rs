//! Error types at the VM's crate boundary. No `anyhow`/`thiserror`,
//! matching the hand-written `CodeGenError` pattern used throughout this
//! workspace.

use std::fmt;

/// A runtime error: the message plus a pre-rendered stack trace, built at
/// the point of failure so unwinding the VM's call frames doesn't lose
/// the information needed to print `[line L] at <name>()`.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The error a native function body returns; converted into a
/// `RuntimeError` (with trace attached) at the call site in `VM::call`.
#[derive(Debug, Clone)]
pub struct NativeError(pub String);

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NativeError {}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        NativeError(message)
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        NativeError(message.to_string())
    }
}
