use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line-level parse failures surfaced to session callers. Parsing itself
/// never has a fatal path; these describe why a pargv is not executable.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ParseFailure {
    #[error("no command matches {line:?}")]
    NoMatch { line: String },
    #[error("incomplete command {line:?}")]
    Incomplete { line: String },
    #[error("ambiguous command {line:?}")]
    AmbiguousMatch { line: String },
    #[error("token rejected by its parameter type in {line:?}")]
    BadPtype { line: String },
    #[error("unbalanced quoting in {line:?}")]
    UnbalancedQuotes { line: String },
    #[error("pipe segment {index} is not a filter command")]
    NonFilterSegment { index: usize },
    #[error("empty command line")]
    EmptyLine,
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExecError {
    #[error("lock {0:?} denied")]
    LockDenied(String),
    #[error("symbol {sym:?} failed with status {status}")]
    SymbolFailed { sym: String, status: i32 },
    #[error("io error: {0}")]
    Io(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error("blocked by dry-run policy")]
    DryRunBlocked,
    #[error("action has no bound symbol: {0}")]
    UnboundSymbol(String),
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unexpected opcode {opcode:?} in state {state}")]
    UnexpectedOpcode { opcode: char, state: String },
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("keepalive timeout")]
    KeepaliveTimeout,
    #[error("io error: {0}")]
    Io(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("starting entry {0:?} not found in scheme")]
    StartEntryNotFound(String),
    #[error("view {0:?} not found in scheme")]
    ViewNotFound(String),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
}
