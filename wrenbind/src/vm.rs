use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{
    CallHandle, ClassKey, ConstantTable, DispatchRegistry, ErrorKind, ForeignCall, ForeignClass,
    ForeignFinalizer, FsLoader, HandleTable, HandleToken, ImportResolver, InterpretResult,
    LoadError, MethodKey, RegisterError, ResourceLoader, SlotAccess, VmError,
    native::{NativeVm, VmId},
    registry::registry,
    slots::marshal_text,
};

pub type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// One error callback from the engine. Runtime errors arrive as a
/// `Runtime` report without a module, followed by one `StackTrace` report
/// per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub module: Option<String>,
    pub line: i32,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.module.as_deref().unwrap_or("?");
        match self.kind {
            ErrorKind::Compile => write!(f, "[{module} line {}] {}", self.line, self.message),
            ErrorKind::Runtime => f.write_str(&self.message),
            ErrorKind::StackTrace => write!(f, "[{module} line {}] in {}", self.line, self.message),
        }
    }
}

pub struct VMCreateInfo {
    pub on_output: OutputFn,
    pub on_error: ErrorFn,
    pub loader: Arc<dyn ResourceLoader>,
}

impl Default for VMCreateInfo {
    fn default() -> Self {
        Self {
            on_output: Arc::new(|_: &str| {}),
            on_error: Arc::new(|_: &ErrorReport| {}),
            loader: Arc::new(FsLoader::default()),
        }
    }
}

/// The part of a VM the registry hands to callbacks. Nothing in here
/// touches the native VM, so it is safe to reach while the VM is busy.
pub struct VMShared {
    id: VmId,
    constants: ConstantTable,
    on_output: OutputFn,
    on_error: ErrorFn,
    dispatch: DispatchRegistry,
    imports: ImportResolver,
    handles: HandleTable,
    slot_high_water: AtomicUsize,
}

impl fmt::Debug for VMShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VMShared")
            .field("id", &self.id)
            .field("dispatch", &self.dispatch)
            .field("imports", &self.imports)
            .field("handles", &self.handles.live())
            .finish_non_exhaustive()
    }
}

impl VMShared {
    pub(crate) fn new(id: VmId, constants: ConstantTable, info: VMCreateInfo) -> Self {
        Self {
            id,
            constants,
            on_output: info.on_output,
            on_error: info.on_error,
            dispatch: DispatchRegistry::new(),
            imports: ImportResolver::new(info.loader),
            handles: HandleTable::new(id),
            slot_high_water: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn constants(&self) -> &ConstantTable {
        &self.constants
    }

    pub fn dispatch(&self) -> &DispatchRegistry {
        &self.dispatch
    }

    pub fn imports(&self) -> &ImportResolver {
        &self.imports
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn note_slots(&self, count: usize) {
        self.slot_high_water.fetch_max(count, Ordering::Relaxed);
    }

    pub fn slot_high_water(&self) -> usize {
        self.slot_high_water.load(Ordering::Relaxed)
    }

    pub fn write_output(&self, text: &str) {
        (self.on_output)(text);
    }

    pub fn report_error(&self, report: &ErrorReport) {
        log::debug!("vm {}: {report}", self.id);
        (self.on_error)(report);
    }

    fn decode(&self, raw: i32) -> Result<InterpretResult, VmError> {
        self.constants
            .interpret_result(raw)
            .ok_or(VmError::UnknownResult(raw))
    }
}

struct VmInner {
    shared: Arc<VMShared>,
    native: Mutex<Option<Box<dyn NativeVm>>>,
}

impl Drop for VmInner {
    fn drop(&mut self) {
        let Some(mut native) = self.native.get_mut().take() else {
            return;
        };
        let id = self.shared.id;
        let leaked = self.shared.handles.drain();
        log::warn!(
            "vm {id} dropped without free ({} live handles)",
            leaked.len()
        );
        for raw in leaked {
            native.release_handle(raw);
        }
        registry().deregister(id);
    }
}

/// A VM instance. Clones share the same VM.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("shared", &self.inner.shared)
            .finish_non_exhaustive()
    }
}

impl Vm {
    pub(crate) fn new(shared: Arc<VMShared>, native: Box<dyn NativeVm>) -> Self {
        registry().register(shared.clone());
        Self {
            inner: Arc::new(VmInner {
                shared,
                native: Mutex::new(Some(native)),
            }),
        }
    }

    pub fn id(&self) -> VmId {
        self.inner.shared.id
    }

    pub fn shared(&self) -> &VMShared {
        &self.inner.shared
    }

    /// Exclusive slot access between calls. Fails instead of waiting if
    /// another operation holds the VM.
    pub fn frame(&self) -> Result<Frame<'_>, VmError> {
        let id = self.id();
        let guard = self.inner.native.try_lock().ok_or(VmError::Busy(id))?;
        let native = MutexGuard::try_map(guard, |native| native.as_deref_mut())
            .map_err(|_| VmError::Freed(id))?;
        Ok(Frame {
            shared: &self.inner.shared,
            native,
        })
    }

    /// Compiles and runs `source` as `module` on the blocking pool.
    pub async fn interpret(&self, module: &str, source: &str) -> Result<InterpretResult, VmError> {
        let id = self.id();
        let module = marshal_text(module)?;
        let source = marshal_text(source)?;
        let inner = self.inner.clone();
        log::debug!("vm {id}: interpret {:?}", module);
        let raw = tokio::task::spawn_blocking(move || -> Result<i32, VmError> {
            let mut guard = inner.native.try_lock().ok_or(VmError::Busy(id))?;
            let native = guard.as_mut().ok_or(VmError::Freed(id))?;
            Ok(native.interpret(&module, &source))
        })
        .await??;
        self.inner.shared.decode(raw)
    }

    pub fn call(&self, method: &CallHandle) -> Result<InterpretResult, VmError> {
        self.frame()?.call(method)
    }

    pub fn make_call_handle(&self, signature: &str) -> Result<CallHandle, VmError> {
        self.frame()?.make_call_handle(signature)
    }

    pub fn release_handle(&self, handle: &impl HandleToken) -> Result<(), VmError> {
        self.frame()?.release_handle(handle)
    }

    pub fn ensure_slots(&self, count: usize) -> Result<(), VmError> {
        self.frame()?.ensure_slots(count);
        Ok(())
    }

    pub fn slot_count(&self) -> Result<usize, VmError> {
        Ok(self.frame()?.slot_count())
    }

    pub fn register_method<F>(
        &self,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
        method: F,
    ) -> Result<(), RegisterError>
    where
        F: Fn(&mut ForeignCall<'_>) + Send + Sync + 'static,
    {
        self.inner.shared.dispatch.register_method(
            MethodKey::new(module, class_name, is_static, signature),
            Arc::new(method),
        )
    }

    pub fn register_class<F>(
        &self,
        module: &str,
        class_name: &str,
        allocate: F,
        finalize: Option<ForeignFinalizer>,
    ) -> Result<(), RegisterError>
    where
        F: Fn(&mut ForeignCall<'_>) + Send + Sync + 'static,
    {
        self.inner.shared.dispatch.register_class(
            ClassKey::new(module, class_name),
            ForeignClass {
                allocate: Arc::new(allocate),
                finalize,
            },
        )
    }

    pub async fn prefetch(&self, name: &str) -> Result<(), LoadError> {
        self.inner.shared.imports.prefetch(name).await
    }

    pub async fn prefetch_all<S: AsRef<str>>(&self, names: &[S]) -> Result<(), LoadError> {
        self.inner.shared.imports.prefetch_all(names).await
    }

    pub fn collect_garbage(&self) -> Result<(), VmError> {
        self.frame()?.native.collect_garbage();
        Ok(())
    }

    pub fn live_handles(&self) -> usize {
        self.inner.shared.handles.live()
    }

    pub fn slot_high_water(&self) -> usize {
        self.inner.shared.slot_high_water()
    }

    pub fn is_freed(&self) -> bool {
        self.inner.native.lock().is_none()
    }

    /// Tears down the native VM. Refused while handles are live; other
    /// clones of this `Vm` see `Freed` afterwards.
    pub fn free(&self) -> Result<(), VmError> {
        let id = self.id();
        let mut guard = self.inner.native.try_lock().ok_or(VmError::Busy(id))?;
        if guard.is_none() {
            return Err(VmError::Freed(id));
        }
        let count = self.inner.shared.handles.live();
        if count > 0 {
            return Err(VmError::LiveHandles { vm: id, count });
        }
        let native = guard.take();
        registry().deregister(id);
        drop(native);
        log::debug!("vm {id} freed");
        Ok(())
    }
}

/// Exclusive access to a live VM, holding its lock until dropped.
pub struct Frame<'vm> {
    shared: &'vm VMShared,
    native: MappedMutexGuard<'vm, dyn NativeVm>,
}

impl Frame<'_> {
    /// Runs a call handle against the receiver in slot 0 and the arguments
    /// in the slots after it. The return value is left in slot 0.
    pub fn call(&mut self, method: &CallHandle) -> Result<InterpretResult, VmError> {
        self.shared.handles.check(method)?;
        let raw = self.native.call(method.raw());
        self.shared.decode(raw)
    }

    pub fn make_call_handle(&mut self, signature: &str) -> Result<CallHandle, VmError> {
        let text = marshal_text(signature)?;
        let raw = self.native.make_call_handle(&text);
        Ok(self.shared.handles.track_call(raw, signature))
    }

    pub fn release_handle(&mut self, handle: &impl HandleToken) -> Result<(), VmError> {
        self.shared.handles.untrack(handle)?;
        self.native.release_handle(handle.raw());
        Ok(())
    }
}

impl SlotAccess for Frame<'_> {
    fn native(&self) -> &dyn NativeVm {
        &*self.native
    }

    fn native_mut(&mut self) -> &mut dyn NativeVm {
        &mut *self.native
    }

    fn shared(&self) -> &VMShared {
        self.shared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{MemoryLoader, Runtime, SlotType};

    struct Capture {
        output: Arc<Mutex<Vec<String>>>,
        errors: Arc<Mutex<Vec<ErrorReport>>>,
    }

    async fn vm_with(loader: Arc<dyn ResourceLoader>) -> (Vm, Capture) {
        let runtime = Runtime::with_engine();
        runtime.start().await.unwrap();
        let output = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (out, err) = (output.clone(), errors.clone());
        let vm = runtime
            .new_vm(VMCreateInfo {
                on_output: Arc::new(move |text: &str| out.lock().push(text.to_owned())),
                on_error: Arc::new(move |report: &ErrorReport| err.lock().push(report.clone())),
                loader,
            })
            .unwrap();
        (vm, Capture { output, errors })
    }

    async fn vm() -> (Vm, Capture) {
        vm_with(Arc::new(MemoryLoader::new())).await
    }

    #[tokio::test]
    async fn print_writes_a_single_chunk() {
        let (vm, capture) = vm().await;
        let result = vm.interpret("main", "System.print(1 + 1)").await.unwrap();
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(*capture.output.lock(), vec!["2\n".to_owned()]);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn malformed_source_reports_a_compile_error() {
        let (vm, capture) = vm().await;
        let result = vm.interpret("main", "<<<malformed>>>").await.unwrap();
        assert_eq!(result, InterpretResult::CompileError);
        let errors = capture.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Compile);
        assert_eq!(errors[0].module.as_deref(), Some("main"));
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[0].message, "Error at '<<': Expected expression.");
        drop(errors);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn deeply_nested_source_is_a_compile_error() {
        let (vm, capture) = vm().await;
        let depth = 1000;
        let source = format!("var x = {}1{}", "(".repeat(depth), ")".repeat(depth));
        let result = vm.interpret("main", &source).await.unwrap();
        assert_eq!(result, InterpretResult::CompileError);
        assert_eq!(
            capture.errors.lock()[0].message,
            "Error at '(': Expression nesting too deep."
        );
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn recursion_up_to_the_call_depth_limit() {
        let (vm, capture) = vm().await;
        let limit = crate::engine::EngineCreateInfo::default().max_call_depth;
        let class = "class R {\n  static f(n) {\n    if (n == 0) return 0\n    return 1 + R.f(n - 1)\n  }\n}\n";
        vm.interpret("main", class).await.unwrap();

        // the module body plus n + 1 calls of f
        let deepest = limit - 2;
        let result = vm
            .interpret("main", &format!("System.print(R.f({deepest}))"))
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(*capture.output.lock(), vec![format!("{deepest}\n")]);
        assert!(capture.errors.lock().is_empty());

        let result = vm
            .interpret("main", &format!("System.print(R.f({}))", deepest + 1))
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::RuntimeError);
        assert_eq!(capture.errors.lock()[0].message, "Stack overflow.");
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn foreign_static_method_through_a_call_handle() {
        let (vm, _capture) = vm().await;
        vm.register_method("main", "Math", true, "add(_,_)", |call| {
            let a = call.get_slot_double(1).unwrap_or(0.0);
            let b = call.get_slot_double(2).unwrap_or(0.0);
            call.set_slot_double(0, a + b);
        })
        .unwrap();
        let result = vm
            .interpret("main", "class Math {\n  foreign static add(a, b)\n}")
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::Success);

        let mut frame = vm.frame().unwrap();
        let add = frame.make_call_handle("add(_,_)").unwrap();
        assert_eq!(add.arity(), 2);
        frame.ensure_slots(3);
        assert!(frame.get_variable("main", "Math", 0).unwrap());
        frame.set_slot_double(1, 2.0);
        frame.set_slot_double(2, 3.0);
        assert_eq!(frame.call(&add).unwrap(), InterpretResult::Success);
        assert_eq!(frame.get_slot_double(0), Some(5.0));

        frame.release_handle(&add).unwrap();
        assert!(matches!(
            frame.call(&add),
            Err(VmError::StaleHandle { .. })
        ));
        drop(frame);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn script_calls_into_a_registered_method() {
        let (vm, capture) = vm().await;
        vm.register_method("main", "Host", true, "greet(_)", |call| {
            let name = call.get_slot_string(1).unwrap_or_default();
            call.set_slot_string(0, &format!("hello {name}")).unwrap();
        })
        .unwrap();
        let source = "class Host {\n  foreign static greet(name)\n}\nSystem.print(Host.greet(\"wren\"))";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            InterpretResult::Success
        );
        assert_eq!(*capture.output.lock(), vec!["hello wren\n".to_owned()]);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn unbound_foreign_method_is_a_runtime_error() {
        let (vm, capture) = vm().await;
        let result = vm
            .interpret("main", "class Math {\n  foreign static add(a, b)\n}")
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::RuntimeError);
        let errors = capture.errors.lock();
        assert_eq!(errors[0].kind, ErrorKind::Runtime);
        assert!(errors[0].message.contains("add(_,_)"), "{}", errors[0].message);
        drop(errors);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn runtime_errors_carry_a_stack_trace() {
        let (vm, capture) = vm().await;
        let source = "class A {\n  static fail() {\n    Fiber.abort(\"bad\")\n  }\n}\nA.fail()";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            InterpretResult::RuntimeError
        );
        let errors = capture.errors.lock();
        assert_eq!(errors[0].kind, ErrorKind::Runtime);
        assert_eq!(errors[0].module, None);
        assert_eq!(errors[0].line, -1);
        assert_eq!(errors[0].message, "bad");
        assert!(errors[1..].iter().all(|e| e.kind == ErrorKind::StackTrace));
        assert_eq!(errors[1].line, 3);
        assert_eq!(errors[1].message, "static A.fail()");
        drop(errors);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn panicking_foreign_method_aborts_the_fiber() {
        let (vm, capture) = vm().await;
        vm.register_method("main", "Bad", true, "boom()", |_| panic!("host bug"))
            .unwrap();
        let source = "class Bad {\n  foreign static boom()\n}\nBad.boom()";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            InterpretResult::RuntimeError
        );
        assert_eq!(capture.errors.lock()[0].message, "foreign method panicked");
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn imports_resolve_from_the_prefetched_cache() {
        let loader = MemoryLoader::new().with("util", "class Util {\n  static twice(n) { n * 2 }\n}");
        let (vm, capture) = vm_with(Arc::new(loader)).await;

        let result = vm
            .interpret("main", "import \"util\" for Util\nSystem.print(Util.twice(21))")
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::CompileError);
        assert_eq!(
            capture.errors.lock()[0].message,
            "Could not load module 'util'."
        );

        vm.prefetch("util").await.unwrap();
        let result = vm
            .interpret("main", "import \"util\" for Util\nSystem.print(Util.twice(21))")
            .await
            .unwrap();
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(*capture.output.lock(), vec!["42\n".to_owned()]);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn free_is_refused_while_handles_are_live() {
        let (vm, _capture) = vm().await;
        vm.interpret("main", "var Answer = 42").await.unwrap();
        let handle = {
            let mut frame = vm.frame().unwrap();
            frame.ensure_slots(1);
            assert!(frame.get_variable("main", "Answer", 0).unwrap());
            frame.get_slot_handle(0).unwrap()
        };
        assert_eq!(vm.live_handles(), 1);
        assert!(matches!(
            vm.free(),
            Err(VmError::LiveHandles { count: 1, .. })
        ));

        {
            let mut frame = vm.frame().unwrap();
            frame.set_slot_null(0);
            frame.set_slot_handle(0, &handle).unwrap();
            assert_eq!(frame.get_slot_double(0), Some(42.0));
        }

        vm.release_handle(&handle).unwrap();
        assert!(vm.release_handle(&handle).is_err());
        vm.free().unwrap();
        assert!(matches!(vm.free(), Err(VmError::Freed(_))));
        assert!(matches!(vm.frame(), Err(VmError::Freed(_))));
        assert!(vm.is_freed());
    }

    #[tokio::test]
    async fn busy_vm_fails_fast() {
        let (vm, _capture) = vm().await;
        let frame = vm.frame().unwrap();
        assert!(matches!(vm.frame(), Err(VmError::Busy(_))));
        assert!(matches!(vm.ensure_slots(1), Err(VmError::Busy(_))));
        assert!(matches!(
            vm.interpret("main", "1").await,
            Err(VmError::Busy(_))
        ));
        drop(frame);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn foreign_class_finalizer_runs_once_unreferenced() {
        let (vm, _capture) = vm().await;
        let finalized = Arc::new(AtomicUsize::new(0));
        let seen = finalized.clone();
        vm.register_class(
            "main",
            "Counter",
            |call| {
                if let Some(storage) = call.set_slot_new_foreign(0, 0, 8) {
                    storage.lock()[0] = 7;
                }
            },
            Some(Arc::new(move |bytes: &mut [u8]| {
                assert_eq!(bytes[0], 7);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        vm.register_method("main", "Counter", false, "value", |call| {
            let value = call.get_slot_foreign(0).map_or(0, |s| s.lock()[0]);
            call.set_slot_double(0, value as f64);
        })
        .unwrap();

        let source = "foreign class Counter {\n  construct new() {}\n  foreign value\n}\nvar c = Counter.new()\nSystem.print(c.value)";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            InterpretResult::Success
        );
        {
            let mut frame = vm.frame().unwrap();
            frame.ensure_slots(1);
            frame.get_variable("main", "c", 0).unwrap();
            assert_eq!(frame.slot_type(0), SlotType::Foreign);
            frame.set_slot_null(0);
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        vm.interpret("main", "c = null").await.unwrap();
        vm.collect_garbage().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn free_finalizes_objects_held_by_cycles() {
        let (vm, _capture) = vm().await;
        let finalized = Arc::new(AtomicUsize::new(0));
        let seen = finalized.clone();
        vm.register_class(
            "main",
            "Res",
            |call| {
                call.set_slot_new_foreign(0, 0, 1);
            },
            Some(Arc::new(move |_: &mut [u8]| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        let source = "foreign class Res {\n  construct new() {}\n}\nclass Holder {\n  construct new(r) {\n    _r = r\n    _me = this\n  }\n}\nvar l = [Res.new()]\nl.add(l)\nl = null\nHolder.new(Res.new())";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            InterpretResult::Success
        );
        vm.collect_garbage().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        vm.free().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_an_unfreed_vm_deregisters_it() {
        let (vm, _capture) = vm().await;
        let id = vm.id();
        let clone = vm.clone();
        drop(vm);
        assert!(registry().lookup(id).is_some());
        drop(clone);
        assert!(registry().lookup(id).is_none());
    }
}
