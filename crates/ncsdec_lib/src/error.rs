use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::NcsType;

/// Errors that abort the decompilation of a whole program.
#[derive(Debug, Error)]
pub enum NcsError {
    #[error("unexpected end of input")]
    Eof,

    #[error("invalid NCS header")]
    InvalidHeader,

    #[error("invalid opcode: 0x{op:02x} at pos={pos}")]
    InvalidOpcode { pos: usize, op: u8 },

    #[error("invalid type qualifier 0x{qual:02x} for {name} at pos={pos}")]
    InvalidQualifier { pos: usize, name: &'static str, qual: u8 },

    #[error("truncated instruction at pos={pos} (remaining={remaining})")]
    TruncatedInstruction { pos: usize, remaining: usize },

    #[error("file size field says {declared} bytes, input has {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("invalid string constant at pos={pos}")]
    InvalidString { pos: usize },

    #[error("constant at pos={pos} has type {found}, expected {expected}")]
    ConstantKind { pos: usize, expected: NcsType, found: NcsType },

    #[error("{name} at pos={pos} carries an operand of the wrong shape")]
    OperandMismatch { pos: usize, name: &'static str },

    #[error("subroutine at pos={start} has no return instruction")]
    MissingReturn { start: usize },

    #[error("unsupported operator {name} at pos={pos}")]
    UnsupportedOperator { pos: usize, name: &'static str },

    #[error("empty instruction stream")]
    Empty,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors scoped to a single subroutine. The routine is replaced by a
/// placeholder and the rest of the program is still emitted.
#[derive(Debug, Error)]
pub enum SubroutineError {
    #[error("stack underflow at pos={pos}")]
    StackUnderflow { pos: usize },

    #[error("unresolvable variable at pos={pos} (offset={offset})")]
    UnresolvedVariable { pos: usize, offset: i32 },

    #[error("stack access at pos={pos} splits a {width}-slot value")]
    SplitValue { pos: usize, width: usize },

    #[error("call at pos={pos} targets {target}, which starts no subroutine")]
    UnknownSubroutine { pos: usize, target: usize },

    #[error("signature of subroutine at {start} depends on itself")]
    RecursiveSignature { start: usize },

    #[error("unexpected {what} at pos={pos}")]
    Unexpected { pos: usize, what: &'static str },

    #[error(transparent)]
    Query(#[from] NcsError),
}

/// Failures of the external compiler used for round trips.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to spawn compiler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("compiler exited with {status}: {diagnostics}")]
    Failed { status: String, diagnostics: String },

    #[error("compiler produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("compiler did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("source cannot be recompiled: {0}")]
    Inexpressible(&'static str),

    #[error("recompiled output does not decode: {0}")]
    Undecodable(#[source] NcsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Problems reading an action table listing.
#[derive(Debug, Error)]
pub enum ActionTableError {
    #[error("line {line}: unknown type `{ty}`")]
    UnknownType { line: usize, ty: String },

    #[error("line {line}: malformed prototype `{text}`")]
    Malformed { line: usize, text: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
