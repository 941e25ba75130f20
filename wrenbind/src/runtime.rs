use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::{
    ConstantTable, ListenerId, Notifier, READY, StartupError, Vm, VMCreateInfo, VmError, VMShared,
    engine::{Engine, EngineCreateInfo},
    native::NativeModule,
    registry::{Trampoline, registry},
};

/// Owns the native module. VMs can only be created once [`Runtime::start`]
/// has completed.
pub struct Runtime {
    module: Arc<dyn NativeModule>,
    constants: OnceLock<ConstantTable>,
    notifier: Notifier,
    starting: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("constants", &self.constants.get())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(module: Arc<dyn NativeModule>) -> Self {
        Self {
            module,
            constants: OnceLock::new(),
            notifier: Notifier::new(),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// A runtime over the bundled interpreter.
    pub fn with_engine() -> Self {
        Self::new(Arc::new(Engine::new(EngineCreateInfo::default())))
    }

    pub async fn start(&self) -> Result<(), StartupError> {
        let _starting = self.starting.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.module.load().await?;
        let constants = self.module.constants();
        log::debug!("native module started: {constants:?}");
        let _ = self.constants.set(constants);
        self.notifier.latch(READY);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.constants.get().is_some()
    }

    pub fn constants(&self) -> Option<ConstantTable> {
        self.constants.get().copied()
    }

    /// Runs `listener` once startup completes, or immediately if it
    /// already has.
    pub fn on_ready(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.notifier.on(READY, listener)
    }

    pub fn off_ready(&self, id: ListenerId) -> bool {
        self.notifier.off(READY, id)
    }

    pub async fn wait_ready(&self) {
        if self.is_ready() {
            return;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.on_ready(move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });
        let _ = rx.await;
        self.off_ready(id);
    }

    pub fn new_vm(&self, info: VMCreateInfo) -> Result<Vm, VmError> {
        let constants = self.constants().ok_or(VmError::NotReady)?;
        let id = registry().allocate_id();
        let shared = Arc::new(VMShared::new(id, constants, info));
        let native = self.module.new_vm(id, Arc::new(Trampoline));
        log::debug!("created vm {id}");
        Ok(Vm::new(shared, native))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::native::{HostCallbacks, NativeVm, VmId};

    struct Broken;

    #[async_trait]
    impl NativeModule for Broken {
        async fn load(&self) -> Result<(), StartupError> {
            Err(StartupError::Prelude {
                line: 1,
                message: "broken on purpose".to_owned(),
            })
        }

        fn constants(&self) -> ConstantTable {
            unreachable!("constants of a module that never loaded")
        }

        fn new_vm(&self, _id: VmId, _host: Arc<dyn HostCallbacks>) -> Box<dyn NativeVm> {
            unreachable!("vm from a module that never loaded")
        }
    }

    #[tokio::test]
    async fn new_vm_before_start_is_refused() {
        let runtime = Runtime::with_engine();
        assert!(matches!(
            runtime.new_vm(VMCreateInfo::default()),
            Err(VmError::NotReady)
        ));
        runtime.start().await.unwrap();
        let vm = runtime.new_vm(VMCreateInfo::default()).unwrap();
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let runtime = Runtime::with_engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        runtime.on_ready(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.constants().map(|c| c.result_success), Some(0));
    }

    #[tokio::test]
    async fn late_ready_listener_runs_immediately() {
        let runtime = Runtime::with_engine();
        runtime.start().await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let id = runtime.on_ready(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(runtime.off_ready(id));
    }

    #[tokio::test]
    async fn wait_ready_resolves_after_start() {
        let runtime = Arc::new(Runtime::with_engine());
        let waiter = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.wait_ready().await }
        });
        runtime.start().await.unwrap();
        waiter.await.unwrap();
        assert!(runtime.is_ready());
        // and returns straight away afterwards
        runtime.wait_ready().await;
    }

    #[tokio::test]
    async fn failed_startup_leaves_the_runtime_unready() {
        let runtime = Runtime::new(Arc::new(Broken));
        assert!(matches!(
            runtime.start().await,
            Err(StartupError::Prelude { line: 1, .. })
        ));
        assert!(!runtime.is_ready());
        assert!(matches!(
            runtime.new_vm(VMCreateInfo::default()),
            Err(VmError::NotReady)
        ));
    }
}
