use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    ForeignCall, RegisterError, SlotAccess,
    native::{self, NativeVm},
    registry::registry,
};

/// A host function bound to a `foreign` method declaration.
pub type ForeignMethod = Arc<dyn Fn(&mut ForeignCall<'_>) + Send + Sync>;

/// Receives the storage attached by the class allocator when the engine
/// reclaims the object.
pub type ForeignFinalizer = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub module: String,
    pub class_name: String,
    pub is_static: bool,
    pub signature: String,
}

impl MethodKey {
    pub fn new(module: &str, class_name: &str, is_static: bool, signature: &str) -> Self {
        Self {
            module: module.to_owned(),
            class_name: class_name.to_owned(),
            is_static,
            signature: signature.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pub module: String,
    pub class_name: String,
}

impl ClassKey {
    pub fn new(module: &str, class_name: &str) -> Self {
        Self {
            module: module.to_owned(),
            class_name: class_name.to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct ForeignClass {
    pub allocate: ForeignMethod,
    pub finalize: Option<ForeignFinalizer>,
}

/// Per-VM table the engine consults when it links `foreign` declarations.
/// Linking happens once per class definition, so everything has to be
/// registered before the interpret call that defines the class.
#[derive(Default)]
pub struct DispatchRegistry {
    methods: RwLock<HashMap<MethodKey, ForeignMethod>>,
    classes: RwLock<HashMap<ClassKey, ForeignClass>>,
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("methods", &self.methods.read().len())
            .field("classes", &self.classes.read().len())
            .finish()
    }
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first registration of a key wins.
    pub fn register_method(&self, key: MethodKey, method: ForeignMethod) -> Result<(), RegisterError> {
        match self.methods.write().entry(key) {
            Entry::Vacant(slot) => {
                log::trace!("registered foreign method {:?}", slot.key());
                slot.insert(method);
                Ok(())
            }
            Entry::Occupied(slot) => {
                let key = slot.key().clone();
                log::warn!(
                    "foreign method {}.{} in `{}` defined twice, keeping the first",
                    key.class_name,
                    key.signature,
                    key.module
                );
                Err(RegisterError::DuplicateMethod {
                    module: key.module,
                    class_name: key.class_name,
                    is_static: key.is_static,
                    signature: key.signature,
                })
            }
        }
    }

    pub fn register_class(&self, key: ClassKey, class: ForeignClass) -> Result<(), RegisterError> {
        match self.classes.write().entry(key) {
            Entry::Vacant(slot) => {
                log::trace!("registered foreign class {:?}", slot.key());
                slot.insert(class);
                Ok(())
            }
            Entry::Occupied(slot) => {
                let key = slot.key().clone();
                log::warn!(
                    "foreign class {} in `{}` defined twice, keeping the first",
                    key.class_name,
                    key.module
                );
                Err(RegisterError::DuplicateClass {
                    module: key.module,
                    class_name: key.class_name,
                })
            }
        }
    }

    pub fn resolve(&self, key: &MethodKey) -> Option<ForeignMethod> {
        self.methods.read().get(key).cloned()
    }

    pub fn resolve_class(&self, key: &ClassKey) -> Option<ForeignClass> {
        self.classes.read().get(key).cloned()
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }
}

/// Adapts a host method to the engine's calling convention. The VM is
/// found again through the registry by the id the engine passes in, and a
/// panic in host code becomes a fiber abort instead of unwinding into the
/// engine.
pub(crate) fn native_method(method: ForeignMethod) -> native::ForeignFn {
    Arc::new(move |native: &mut dyn NativeVm| {
        let id = native.id();
        let Some(shared) = registry().lookup(id) else {
            log::warn!("foreign call on unregistered vm {id}");
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut call = ForeignCall::new(native, &shared);
            method(&mut call);
        }));
        if outcome.is_err() {
            log::error!("vm {id}: foreign method panicked");
            let mut call = ForeignCall::new(native, &shared);
            call.ensure_slots(1);
            let _ = call.set_slot_string(0, "foreign method panicked");
            call.abort_fiber(0);
        }
    })
}

pub(crate) fn native_finalizer(finalize: ForeignFinalizer) -> native::FinalizerFn {
    Arc::new(move |storage: &mut [u8]| {
        if panic::catch_unwind(AssertUnwindSafe(|| finalize(storage))).is_err() {
            log::error!("foreign finalizer panicked");
        }
    })
}

pub(crate) fn native_class(class: ForeignClass) -> native::ForeignClassFns {
    native::ForeignClassFns {
        allocate: native_method(class.allocate),
        finalize: class.finalize.map(native_finalizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(tag: f64) -> ForeignMethod {
        Arc::new(move |call: &mut ForeignCall<'_>| call.set_slot_double(0, tag))
    }

    #[test]
    fn first_registration_wins() {
        let registry = DispatchRegistry::new();
        let key = MethodKey::new("main", "Math", true, "add(_,_)");
        let first = method(1.0);
        registry.register_method(key.clone(), first.clone()).unwrap();

        let err = registry.register_method(key.clone(), method(2.0)).unwrap_err();
        assert!(matches!(err, RegisterError::DuplicateMethod { ref signature, .. } if signature == "add(_,_)"));

        let resolved = registry.resolve(&key).unwrap();
        assert!(Arc::ptr_eq(&resolved, &first));
        assert_eq!(registry.method_count(), 1);
    }

    #[test]
    fn unregistered_lookups_return_none() {
        let registry = DispatchRegistry::new();
        registry
            .register_method(MethodKey::new("main", "Math", true, "add(_,_)"), method(1.0))
            .unwrap();
        // the static flag is part of the key
        assert!(registry.resolve(&MethodKey::new("main", "Math", false, "add(_,_)")).is_none());
        assert!(registry.resolve(&MethodKey::new("other", "Math", true, "add(_,_)")).is_none());
        assert!(registry.resolve_class(&ClassKey::new("main", "Math")).is_none());
    }

    #[test]
    fn duplicate_classes_keep_the_first() {
        let registry = DispatchRegistry::new();
        let key = ClassKey::new("main", "Point");
        let first = ForeignClass {
            allocate: method(0.0),
            finalize: None,
        };
        registry.register_class(key.clone(), first.clone()).unwrap();
        assert!(
            registry
                .register_class(
                    key.clone(),
                    ForeignClass {
                        allocate: method(1.0),
                        finalize: Some(Arc::new(|_: &mut [u8]| {})),
                    },
                )
                .is_err()
        );
        let resolved = registry.resolve_class(&key).unwrap();
        assert!(Arc::ptr_eq(&resolved.allocate, &first.allocate));
        assert!(resolved.finalize.is_none());
    }
}
