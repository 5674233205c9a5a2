//! Error taxonomy.
//!
//! Three layers of failure exist and never mix:
//! - [`CompileError`]: the transformer was handed a body it cannot lower.
//! - [`VmError`]: a fatal interpreter condition the managed program never sees.
//! - [`LoadError`]: a program file or assembly listing could not be loaded.
//!
//! Managed exceptions (null reference, overflow, explicit `throw`, ...) are
//! heap objects delivered through the unwinder, not Rust errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::vm::ObjRef;

/// Malformed input to the transformer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{method}: stack underflow at IL_{offset:04}: need {needed}, have {height}")]
    StackUnderflow {
        method: String,
        offset: usize,
        needed: usize,
        height: usize,
    },
    #[error("{method}: stack shape mismatch at IL_{offset:04}: expected [{expected}], found [{found}]")]
    StackShapeMismatch {
        method: String,
        offset: usize,
        expected: String,
        found: String,
    },
    #[error("{method}: value-type stack mismatch at IL_{offset:04}: expected {expected} bytes, found {found}")]
    VtStackMismatch {
        method: String,
        offset: usize,
        expected: u32,
        found: u32,
    },
    #[error("{method}: branch at IL_{offset:04} targets {target}, outside the body")]
    InvalidBranchTarget {
        method: String,
        offset: usize,
        target: usize,
    },
    #[error("{method}: forward branch to IL_{offset:04} does not fit its short form")]
    BranchOutOfRange { method: String, offset: usize },
    #[error("{method}: operand types [{types}] are not valid for {instr} at IL_{offset:04}")]
    TypeMismatch {
        method: String,
        offset: usize,
        instr: String,
        types: String,
    },
    #[error("{method}: unsupported arity {arity} for {what}")]
    UnsupportedArity {
        method: String,
        what: String,
        arity: usize,
    },
    #[error("{method}: unresolved token at IL_{offset:04}: {token}")]
    UnresolvedToken {
        method: String,
        offset: usize,
        token: String,
    },
    #[error("{method}: data item table exceeds 65536 entries")]
    TooManyDataItems { method: String },
    #[error("{method}: frame layout exceeds 65535 bytes")]
    FrameTooLarge { method: String },
    #[error("{method}: method has no body to compile")]
    EmptyBody { method: String },
    #[error("{method}: control falls off the end of the body")]
    UnreachableEnd { method: String },
    #[error("{method}: malformed exception clause #{index}")]
    InvalidClause { method: String, index: usize },
}

/// Details of a managed exception nobody caught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledException {
    pub object: ObjRef,
    pub class: String,
    pub message: Option<String>,
}

impl std::fmt::Display for UnhandledException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class, message),
            None => write!(f, "{}", self.class),
        }
    }
}

/// Fatal interpreter conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("invalid opcode {word:#06x} at {offset:04x} in {method}")]
    InvalidOpcode {
        method: String,
        offset: usize,
        word: u16,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("stack imbalance in {method} at {offset:04x}: expected height {expected}/{expected_vt}, found {found}/{found_vt}")]
    StackImbalance {
        method: String,
        offset: usize,
        expected: usize,
        expected_vt: usize,
        found: usize,
        found_vt: usize,
    },
    #[error("evaluation stack underflow at {offset:04x} in {method}")]
    StackUnderflow { method: String, offset: usize },
    #[error("endfinally at {offset:04x} in {method} with no pending continuation")]
    EndFinallyWithoutContinuation { method: String, offset: usize },
    #[error("invalid program at {offset:04x} in {method}: {reason}")]
    InvalidProgram {
        method: String,
        offset: usize,
        reason: String,
    },
    #[error("unhandled exception: {0}")]
    Unhandled(UnhandledException),
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error("argument mismatch calling {method}: {reason}")]
    ArgumentMismatch { method: String, reason: String },
    #[error("native call failed: {0}")]
    Native(String),
    #[error("thread failed: {0}")]
    Thread(String),
}

/// Failure loading a program description.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("duplicate definition of `{0}`")]
    Duplicate(String),
    #[error("{method}: line {line}: {message}")]
    Asm {
        method: String,
        line: usize,
        message: String,
    },
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T, E = VmError> = std::result::Result<T, E>;
