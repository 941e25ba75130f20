use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{
    ClassKey, ErrorReport, MethodKey, VMShared,
    dispatch,
    native::{ForeignClassFns, ForeignFn, HostCallbacks, VmId},
};

/// Process-wide map from VM id to the instance the engine should call back
/// into. Ids are never reused.
#[derive(Debug, Default)]
pub struct VmRegistry {
    vms: RwLock<HashMap<VmId, Arc<VMShared>>>,
    next_id: AtomicU32,
}

static REGISTRY: LazyLock<VmRegistry> = LazyLock::new(VmRegistry::default);

pub fn registry() -> &'static VmRegistry {
    &REGISTRY
}

impl VmRegistry {
    pub fn allocate_id(&self) -> VmId {
        VmId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, shared: Arc<VMShared>) {
        let id = shared.id();
        if self.vms.write().insert(id, shared).is_some() {
            log::warn!("vm {id} registered twice");
        }
        log::debug!("vm {id} registered");
    }

    pub fn deregister(&self, id: VmId) -> Option<Arc<VMShared>> {
        let shared = self.vms.write().remove(&id);
        if shared.is_some() {
            log::debug!("vm {id} deregistered");
        }
        shared
    }

    /// Takes only a read lock, so callbacks that arrive while the host is
    /// inside a VM operation can use it.
    pub fn lookup(&self, id: VmId) -> Option<Arc<VMShared>> {
        self.vms.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes engine callbacks to the right VM through the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trampoline;

impl Trampoline {
    fn with_vm<R>(id: VmId, what: &str, f: impl FnOnce(&VMShared) -> Option<R>) -> Option<R> {
        let Some(shared) = registry().lookup(id) else {
            log::trace!("{what} callback for unknown vm {id} ignored");
            return None;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| f(&shared))) {
            Ok(answer) => answer,
            Err(_) => {
                log::error!("vm {id}: {what} callback panicked");
                None
            }
        }
    }
}

impl HostCallbacks for Trampoline {
    fn write(&self, vm: VmId, text: &str) {
        Self::with_vm(vm, "write", |shared| {
            shared.write_output(text);
            Some(())
        });
    }

    fn error(&self, vm: VmId, kind: i32, module: Option<&str>, line: i32, message: &str) {
        Self::with_vm(vm, "error", |shared| {
            let Some(kind) = shared.constants().error_kind(kind) else {
                log::warn!("vm {vm}: unknown error kind {kind}");
                return None;
            };
            shared.report_error(&ErrorReport {
                kind,
                module: module.map(str::to_owned),
                line,
                message: message.to_owned(),
            });
            Some(())
        });
    }

    fn bind_foreign_method(
        &self,
        vm: VmId,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<ForeignFn> {
        Self::with_vm(vm, "bind method", |shared| {
            let key = MethodKey::new(module, class_name, is_static, signature);
            let method = shared.dispatch().resolve(&key);
            log::trace!("vm {vm}: bind {key:?} -> {}", method.is_some());
            method.map(dispatch::native_method)
        })
    }

    fn bind_foreign_class(
        &self,
        vm: VmId,
        module: &str,
        class_name: &str,
    ) -> Option<ForeignClassFns> {
        Self::with_vm(vm, "bind class", |shared| {
            let key = ClassKey::new(module, class_name);
            let class = shared.dispatch().resolve_class(&key);
            log::trace!("vm {vm}: bind {key:?} -> {}", class.is_some());
            class.map(dispatch::native_class)
        })
    }

    fn load_module(&self, vm: VmId, name: &str) -> Option<String> {
        Self::with_vm(vm, "load module", |shared| {
            shared.imports().lookup(name).map(|source| source.to_string())
        })
    }
}
