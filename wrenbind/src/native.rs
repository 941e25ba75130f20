//! The native boundary.
//!
//! These traits mirror the C embedding API of a Wren-shaped VM: every VM
//! is addressed through a numeric [`VmId`], results and types cross as raw
//! `i32` codes (decoded through [`crate::ConstantTable`]), strings cross
//! as NUL-terminated [`CStr`]s and byte sequences as length-delimited
//! slices. The engine calls back into the host only through
//! [`HostCallbacks`], passing the id it was created with.

use std::{ffi::CStr, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};

use crate::{ConstantTable, StartupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque engine-side handle; 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A foreign method or allocator as seen by the engine. It runs with the
/// call frame's arguments in the slots, receiver in slot 0, and leaves its
/// return value in slot 0.
pub type ForeignFn = Arc<dyn Fn(&mut dyn NativeVm) + Send + Sync>;

/// Runs when the engine reclaims a foreign object. Only the storage the
/// allocator attached is visible, never the slots.
pub type FinalizerFn = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

#[derive(Clone)]
pub struct ForeignClassFns {
    pub allocate: ForeignFn,
    pub finalize: Option<FinalizerFn>,
}

impl fmt::Debug for ForeignClassFns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClassFns")
            .field("finalize", &self.finalize.is_some())
            .finish_non_exhaustive()
    }
}

/// Byte storage attached to a foreign object.
#[derive(Debug, Clone, Default)]
pub struct ForeignStorage(Arc<Mutex<Vec<u8>>>);

impl ForeignStorage {
    pub fn zeroed(size: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; size])))
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Two storages are the same if they belong to the same object.
    pub fn same(&self, other: &ForeignStorage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Reverse callbacks from the engine into the host. Implementations must
/// not unwind; a missing answer is `None`.
pub trait HostCallbacks: Send + Sync {
    fn write(&self, vm: VmId, text: &str);

    fn error(&self, vm: VmId, kind: i32, module: Option<&str>, line: i32, message: &str);

    fn bind_foreign_method(
        &self,
        vm: VmId,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<ForeignFn>;

    fn bind_foreign_class(&self, vm: VmId, module: &str, class_name: &str)
    -> Option<ForeignClassFns>;

    fn load_module(&self, vm: VmId, name: &str) -> Option<String>;
}

/// One embedded VM. Dropping it is native teardown.
pub trait NativeVm: Send {
    fn id(&self) -> VmId;

    fn interpret(&mut self, module: &CStr, source: &CStr) -> i32;

    fn ensure_slots(&mut self, count: usize);
    fn slot_count(&self) -> usize;
    fn slot_type(&self, slot: usize) -> i32;

    fn get_slot_bool(&self, slot: usize) -> Option<bool>;
    fn set_slot_bool(&mut self, slot: usize, value: bool);
    fn get_slot_double(&self, slot: usize) -> Option<f64>;
    fn set_slot_double(&mut self, slot: usize, value: f64);
    /// Text up to the first NUL.
    fn get_slot_string(&self, slot: usize) -> Option<&[u8]>;
    fn set_slot_string(&mut self, slot: usize, text: &CStr);
    fn get_slot_bytes(&self, slot: usize) -> Option<&[u8]>;
    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]);
    fn set_slot_null(&mut self, slot: usize);
    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignStorage>;
    /// Creates an instance of the foreign class in `class_slot`.
    fn set_slot_new_foreign(
        &mut self,
        slot: usize,
        class_slot: usize,
        size: usize,
    ) -> Option<ForeignStorage>;

    fn set_slot_new_list(&mut self, slot: usize);
    fn get_list_count(&self, slot: usize) -> Option<usize>;
    fn get_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize);
    fn set_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize);
    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize);

    fn get_variable(&mut self, module: &CStr, name: &CStr, slot: usize) -> bool;

    fn get_slot_handle(&mut self, slot: usize) -> Option<RawHandle>;
    fn set_slot_handle(&mut self, slot: usize, handle: RawHandle);
    fn make_call_handle(&mut self, signature: &CStr) -> RawHandle;
    fn release_handle(&mut self, handle: RawHandle);
    fn call(&mut self, method: RawHandle) -> i32;

    fn collect_garbage(&mut self);
    fn abort_fiber(&mut self, slot: usize);
}

#[async_trait]
pub trait NativeModule: Send + Sync {
    /// Asynchronous startup: loading code, building constant tables.
    async fn load(&self) -> Result<(), StartupError>;

    fn constants(&self) -> ConstantTable;

    fn new_vm(&self, id: VmId, host: Arc<dyn HostCallbacks>) -> Box<dyn NativeVm>;
}
