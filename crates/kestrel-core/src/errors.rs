//! Runtime error taxonomy.
//!
//! Every fallible operation in the engine returns [`Error`], a value that
//! pairs an [`ErrorKind`] with the place it originated: the module and symbol
//! being executed (when known) and a source line. The rendering is
//! deterministic so embedders can match on it in tests and diagnostics.

use std::fmt;
use std::io;

use thiserror::Error as ThisError;

/// Classification of a runtime failure.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ErrorKind {
    /// Arguments passed to a function do not match its signature.
    #[error("invalid parameters: {0}")]
    Parameter(String),

    /// An entity exists but may not be used this way (re-export clash,
    /// write to a protected attribute, and so on).
    #[error("access violation: {0}")]
    Access(String),

    /// A structural program error: undefined symbol, module not found,
    /// malformed declaration.
    #[error("code error: {0}")]
    Code(String),

    /// A precompiled stream is malformed, truncated or internally
    /// inconsistent.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// An operator was applied to a type pair that does not support it.
    #[error("unsupported operand: {0}")]
    Operand(String),
}

/// A runtime error with its point of origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    module: Option<String>,
    symbol: Option<String>,
    line: u32,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            module: None,
            symbol: None,
            line: 0,
        }
    }

    pub fn param(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Parameter(msg.into()))
    }

    pub fn access(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Access(msg.into()))
    }

    pub fn code(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Code(msg.into()))
    }

    pub fn deser(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Deserialization(msg.into()))
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Io(msg.into()))
    }

    pub fn operand(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Operand(msg.into()))
    }

    /// Attaches the module the error originated in.
    #[must_use]
    pub fn in_module(mut self, name: impl Into<String>) -> Self {
        self.module = Some(name.into());
        self
    }

    /// Attaches the symbol (function or mantra name) being executed.
    #[must_use]
    pub fn in_symbol(mut self, name: impl Into<String>) -> Self {
        self.symbol = Some(name.into());
        self
    }

    /// Attaches the source line the error originated at.
    #[must_use]
    pub fn at_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        let has_origin = self.module.is_some() || self.symbol.is_some() || self.line != 0;
        if has_origin {
            write!(f, " [")?;
            let mut sep = "";
            if let Some(m) = &self.module {
                write!(f, "module {m}")?;
                sep = ", ";
            }
            if let Some(s) = &self.symbol {
                write!(f, "{sep}symbol {s}")?;
                sep = ", ";
            }
            if self.line != 0 {
                write!(f, "{sep}line {}", self.line)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::deser("unexpected end of stream")
        } else {
            Error::io(e.to_string())
        }
    }
}

/// Shorthand result type used throughout the engine.
pub type RunResult<T> = Result<T, Error>;
