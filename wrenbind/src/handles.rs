use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    VmError,
    native::{RawHandle, VmId},
};

/// A VM value kept alive across calls, obtained with
/// [`SlotAccess::get_slot_handle`](crate::SlotAccess::get_slot_handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    vm: VmId,
    raw: RawHandle,
}

/// A compiled method signature, invoked with
/// [`Frame::call`](crate::Frame::call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle {
    vm: VmId,
    raw: RawHandle,
    arity: usize,
}

/// Anything that can be handed back with `release_handle`.
pub trait HandleToken {
    fn vm(&self) -> VmId;
    fn raw(&self) -> RawHandle;
}

impl HandleToken for Handle {
    fn vm(&self) -> VmId {
        self.vm
    }

    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl HandleToken for CallHandle {
    fn vm(&self) -> VmId {
        self.vm
    }

    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl CallHandle {
    /// Number of arguments the signature takes, not counting the receiver.
    pub fn arity(&self) -> usize {
        self.arity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleKind {
    Value,
    Call { signature: String },
}

/// Host-side guard over the handles one VM has handed out. The engine is
/// not obliged to detect stale handles, so every use is checked here
/// before it crosses the boundary.
#[derive(Debug)]
pub struct HandleTable {
    vm: VmId,
    live: Mutex<HashMap<RawHandle, HandleKind>>,
}

impl HandleTable {
    pub fn new(vm: VmId) -> Self {
        Self {
            vm,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn track_value(&self, raw: RawHandle) -> Handle {
        self.live.lock().insert(raw, HandleKind::Value);
        Handle { vm: self.vm, raw }
    }

    pub fn track_call(&self, raw: RawHandle, signature: &str) -> CallHandle {
        self.live.lock().insert(
            raw,
            HandleKind::Call {
                signature: signature.to_owned(),
            },
        );
        CallHandle {
            vm: self.vm,
            raw,
            arity: signature_arity(signature),
        }
    }

    pub fn check(&self, handle: &impl HandleToken) -> Result<(), VmError> {
        if handle.vm() == self.vm && self.live.lock().contains_key(&handle.raw()) {
            Ok(())
        } else {
            Err(self.stale(handle))
        }
    }

    pub fn untrack(&self, handle: &impl HandleToken) -> Result<HandleKind, VmError> {
        if handle.vm() != self.vm {
            return Err(self.stale(handle));
        }
        self.live
            .lock()
            .remove(&handle.raw())
            .ok_or_else(|| self.stale(handle))
    }

    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    /// Empties the table, returning what was still live.
    pub fn drain(&self) -> Vec<RawHandle> {
        self.live.lock().drain().map(|(raw, _)| raw).collect()
    }

    fn stale(&self, handle: &impl HandleToken) -> VmError {
        log::warn!(
            "vm {}: rejected handle {} (issued by vm {})",
            self.vm,
            handle.raw(),
            handle.vm()
        );
        VmError::StaleHandle {
            vm: self.vm,
            handle: handle.raw(),
        }
    }
}

/// `name(_,_)` has arity 2, getters have 0, `[_]=(_)` has 2.
pub fn signature_arity(signature: &str) -> usize {
    let bytes = signature.as_bytes();
    (1..bytes.len())
        .filter(|&i| {
            bytes[i] == b'_'
                && matches!(bytes[i - 1], b'(' | b',' | b'[')
                && matches!(bytes.get(i + 1), Some(b')' | b',' | b']'))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_counts_only_parameter_placeholders() {
        assert_eq!(signature_arity("add(_,_)"), 2);
        assert_eq!(signature_arity("call()"), 0);
        assert_eq!(signature_arity("count"), 0);
        assert_eq!(signature_arity("value=(_)"), 1);
        assert_eq!(signature_arity("[_]=(_)"), 2);
        assert_eq!(signature_arity("write_bytes_(_)"), 1);
    }

    #[test]
    fn released_handles_are_rejected() {
        let table = HandleTable::new(VmId(1));
        let h = table.track_call(RawHandle(5), "add(_,_)");
        assert_eq!(h.arity(), 2);
        assert!(table.check(&h).is_ok());

        assert!(matches!(
            table.untrack(&h),
            Ok(HandleKind::Call { signature }) if signature == "add(_,_)"
        ));
        assert!(matches!(
            table.check(&h),
            Err(VmError::StaleHandle { handle: RawHandle(5), .. })
        ));
        assert!(table.untrack(&h).is_err());
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn handles_from_another_vm_are_rejected() {
        let a = HandleTable::new(VmId(1));
        let b = HandleTable::new(VmId(2));
        let h = a.track_value(RawHandle(9));
        b.track_value(RawHandle(9));
        assert!(b.check(&h).is_err());
        assert!(b.untrack(&h).is_err());
        assert_eq!(b.live(), 1);
    }
}
