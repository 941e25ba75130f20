use thiserror::Error;

use crate::native::{RawHandle, VmId};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("native module has not finished starting")]
    NotReady,

    #[error("vm {0} has been freed")]
    Freed(VmId),

    #[error("vm {0} is busy with another operation")]
    Busy(VmId),

    #[error("handle {handle} is not live on vm {vm}")]
    StaleHandle { vm: VmId, handle: RawHandle },

    #[error("vm {vm} still has {count} live handles")]
    LiveHandles { vm: VmId, count: usize },

    #[error("native module returned unknown result code {0}")]
    UnknownResult(i32),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("interpret task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("text contains an interior nul byte at offset {0}")]
    InteriorNul(usize),

    #[error("{0} values cannot be written to a slot")]
    NotWritable(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("foreign method {class_name}.{signature} (static: {is_static}) in `{module}` is already registered")]
    DuplicateMethod {
        module: String,
        class_name: String,
        is_static: bool,
        signature: String,
    },

    #[error("foreign class {class_name} in `{module}` is already registered")]
    DuplicateClass { module: String, class_name: String },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module `{0}` was not found")]
    NotFound(String),

    #[error("module `{0}` is not on the allow list")]
    NotAllowed(String),

    #[error("failed to read module `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("core prelude failed to compile at line {line}: {message}")]
    Prelude { line: usize, message: String },
}
