//! Host bindings for an embedded Wren-shaped VM.
//!
//! A [`Runtime`] owns the native module and hands out [`Vm`]s once it has
//! started. Each VM routes engine callbacks (output, errors, foreign
//! binding, module loading) back to itself through the process-wide
//! [`registry`], reads and writes values through the slot API on a
//! [`Frame`], and resolves imports from a cache filled ahead of time by an
//! [`ImportResolver`].

mod constants;
pub mod dispatch;
pub mod engine;
mod error;
mod handles;
mod imports;
pub mod native;
mod notifier;
pub mod registry;
mod runtime;
mod slots;
mod vm;

pub use constants::*;
pub use dispatch::{
    ClassKey, DispatchRegistry, ForeignClass, ForeignFinalizer, ForeignMethod, MethodKey,
};
pub use error::*;
pub use handles::{CallHandle, Handle, HandleKind, HandleTable, HandleToken, signature_arity};
pub use imports::*;
pub use native::{ForeignStorage, VmId};
pub use notifier::*;
pub use registry::registry;
pub use runtime::Runtime;
pub use slots::{ForeignCall, MAX_LIST_DEPTH, SlotAccess, SlotValue};
pub use vm::*;
