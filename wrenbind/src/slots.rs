use std::ffi::CString;

use crate::{
    ForeignStorage, Handle, HandleToken, SlotError, SlotType, VmError, VmId, VMShared,
    native::NativeVm,
};

/// A value read out of, or about to be written into, a slot.
#[derive(Debug, Clone)]
pub enum SlotValue {
    Null,
    Bool(bool),
    Num(f64),
    String(String),
    /// A string-kind value that is not clean UTF-8 text.
    Bytes(Vec<u8>),
    List(Vec<SlotValue>),
    Foreign(ForeignStorage),
    Unknown,
}

impl PartialEq for SlotValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::Unknown, Self::Unknown) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Num(a), Self::Num(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Foreign(a), Self::Foreign(b)) => a.same(b),
            _ => false,
        }
    }
}

impl From<bool> for SlotValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for SlotValue {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<&str> for SlotValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Vec<SlotValue>> for SlotValue {
    fn from(value: Vec<SlotValue>) -> Self {
        Self::List(value)
    }
}

pub(crate) fn marshal_text(text: &str) -> Result<CString, SlotError> {
    CString::new(text).map_err(|e| SlotError::InteriorNul(e.nul_position()))
}

/// The slot protocol. Everything is provided on top of the three
/// accessors, so the host-side [`Frame`](crate::Frame) and the
/// [`ForeignCall`] context share one implementation.
pub trait SlotAccess {
    fn native(&self) -> &dyn NativeVm;
    fn native_mut(&mut self) -> &mut dyn NativeVm;
    fn shared(&self) -> &VMShared;

    fn vm_id(&self) -> VmId {
        self.shared().id()
    }

    fn ensure_slots(&mut self, count: usize) {
        self.native_mut().ensure_slots(count);
        self.shared().note_slots(count);
    }

    fn slot_count(&self) -> usize {
        self.native().slot_count()
    }

    fn slot_type(&self, slot: usize) -> SlotType {
        let raw = self.native().slot_type(slot);
        self.shared().constants().slot_type(raw)
    }

    fn get_slot_bool(&self, slot: usize) -> Option<bool> {
        self.native().get_slot_bool(slot)
    }

    fn set_slot_bool(&mut self, slot: usize, value: bool) {
        self.native_mut().set_slot_bool(slot, value);
    }

    fn get_slot_double(&self, slot: usize) -> Option<f64> {
        self.native().get_slot_double(slot)
    }

    fn set_slot_double(&mut self, slot: usize, value: f64) {
        self.native_mut().set_slot_double(slot, value);
    }

    /// Text up to the first NUL, with invalid UTF-8 replaced.
    fn get_slot_string(&self, slot: usize) -> Option<String> {
        self.native()
            .get_slot_string(slot)
            .map(|text| String::from_utf8_lossy(text).into_owned())
    }

    fn set_slot_string(&mut self, slot: usize, text: &str) -> Result<(), SlotError> {
        let text = marshal_text(text)?;
        self.native_mut().set_slot_string(slot, &text);
        Ok(())
    }

    fn get_slot_bytes(&self, slot: usize) -> Option<Vec<u8>> {
        self.native().get_slot_bytes(slot).map(<[u8]>::to_vec)
    }

    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        self.native_mut().set_slot_bytes(slot, bytes);
    }

    fn set_slot_null(&mut self, slot: usize) {
        self.native_mut().set_slot_null(slot);
    }

    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignStorage> {
        self.native().get_slot_foreign(slot)
    }

    /// Only meaningful inside an allocator, where slot 0 holds the class.
    fn set_slot_new_foreign(
        &mut self,
        slot: usize,
        class_slot: usize,
        size: usize,
    ) -> Option<ForeignStorage> {
        self.native_mut().set_slot_new_foreign(slot, class_slot, size)
    }

    fn set_slot_new_list(&mut self, slot: usize) {
        self.native_mut().set_slot_new_list(slot);
    }

    fn get_list_count(&self, slot: usize) -> Option<usize> {
        self.native().get_list_count(slot)
    }

    fn get_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        self.native_mut()
            .get_list_element(list_slot, index, element_slot);
    }

    fn set_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        self.native_mut()
            .set_list_element(list_slot, index, element_slot);
    }

    /// `-1` appends.
    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        self.native_mut().insert_in_list(list_slot, index, element_slot);
    }

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> Result<bool, SlotError> {
        let module = marshal_text(module)?;
        let name = marshal_text(name)?;
        Ok(self.native_mut().get_variable(&module, &name, slot))
    }

    fn get_slot_handle(&mut self, slot: usize) -> Option<Handle> {
        let raw = self.native_mut().get_slot_handle(slot)?;
        Some(self.shared().handles().track_value(raw))
    }

    fn set_slot_handle(&mut self, slot: usize, handle: &Handle) -> Result<(), VmError> {
        self.shared().handles().check(handle)?;
        self.native_mut().set_slot_handle(slot, handle.raw());
        Ok(())
    }

    fn abort_fiber(&mut self, slot: usize) {
        self.native_mut().abort_fiber(slot);
    }

    /// Reads a slot recursively, using slots past the current count as
    /// scratch space for list elements. A list nested deeper than
    /// [`MAX_LIST_DEPTH`], which includes any list that contains itself,
    /// reads as [`SlotValue::Unknown`].
    fn read_slot(&mut self, slot: usize) -> SlotValue {
        read_value(self, slot, 0).unwrap_or_else(|TooDeep| {
            log::warn!(
                "vm {}: list in slot {slot} nests deeper than {MAX_LIST_DEPTH} levels",
                self.vm_id()
            );
            SlotValue::Unknown
        })
    }

    fn write_slot(&mut self, slot: usize, value: &SlotValue) -> Result<(), SlotError> {
        match value {
            SlotValue::Null => self.set_slot_null(slot),
            SlotValue::Bool(b) => self.set_slot_bool(slot, *b),
            SlotValue::Num(n) => self.set_slot_double(slot, *n),
            SlotValue::String(text) => self.set_slot_string(slot, text)?,
            SlotValue::Bytes(bytes) => self.set_slot_bytes(slot, bytes),
            SlotValue::List(items) => {
                self.set_slot_new_list(slot);
                let scratch = self.slot_count().max(slot + 1);
                self.ensure_slots(scratch + 1);
                for item in items {
                    self.write_slot(scratch, item)?;
                    self.insert_in_list(slot, -1, scratch);
                }
            }
            SlotValue::Foreign(_) => return Err(SlotError::NotWritable("foreign")),
            SlotValue::Unknown => return Err(SlotError::NotWritable("unknown")),
        }
        Ok(())
    }
}

pub const MAX_LIST_DEPTH: usize = 64;

struct TooDeep;

fn read_value<S: SlotAccess + ?Sized>(
    access: &mut S,
    slot: usize,
    depth: usize,
) -> Result<SlotValue, TooDeep> {
    Ok(match access.slot_type(slot) {
        SlotType::Null => SlotValue::Null,
        SlotType::Bool => access
            .get_slot_bool(slot)
            .map_or(SlotValue::Unknown, SlotValue::Bool),
        SlotType::Num => access
            .get_slot_double(slot)
            .map_or(SlotValue::Unknown, SlotValue::Num),
        SlotType::String => match access.get_slot_bytes(slot) {
            Some(bytes) if !bytes.contains(&0) => match String::from_utf8(bytes) {
                Ok(text) => SlotValue::String(text),
                Err(e) => SlotValue::Bytes(e.into_bytes()),
            },
            Some(bytes) => SlotValue::Bytes(bytes),
            None => SlotValue::Unknown,
        },
        SlotType::Foreign => access
            .get_slot_foreign(slot)
            .map_or(SlotValue::Unknown, SlotValue::Foreign),
        SlotType::List => {
            if depth == MAX_LIST_DEPTH {
                return Err(TooDeep);
            }
            let count = access.get_list_count(slot).unwrap_or(0);
            let scratch = access.slot_count().max(slot + 1);
            access.ensure_slots(scratch + 1);
            let mut items = Vec::with_capacity(count);
            for index in 0..count {
                access.get_list_element(slot, index as isize, scratch);
                items.push(read_value(access, scratch, depth + 1)?);
            }
            SlotValue::List(items)
        }
        SlotType::Unknown => SlotValue::Unknown,
    })
}

/// Slot access from inside a foreign method or allocator. Arguments start
/// at slot 0 (the receiver), and whatever is left in slot 0 is returned.
pub struct ForeignCall<'a> {
    native: &'a mut dyn NativeVm,
    shared: &'a VMShared,
}

impl<'a> ForeignCall<'a> {
    pub(crate) fn new(native: &'a mut dyn NativeVm, shared: &'a VMShared) -> Self {
        Self { native, shared }
    }

    /// Arguments including the receiver.
    pub fn arg_count(&self) -> usize {
        self.native.slot_count()
    }

    /// Aborts the current fiber with `message` as its error.
    pub fn abort(&mut self, message: &str) {
        self.ensure_slots(1);
        if self.set_slot_string(0, message).is_err() {
            let _ = self.set_slot_string(0, "foreign method aborted");
        }
        self.abort_fiber(0);
    }
}

impl SlotAccess for ForeignCall<'_> {
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
    use super::*;
    use crate::{Runtime, VMCreateInfo};

    async fn vm() -> crate::Vm {
        let runtime = Runtime::with_engine();
        runtime.start().await.unwrap();
        runtime.new_vm(VMCreateInfo::default()).unwrap()
    }

    #[test]
    fn interior_nul_is_rejected_before_the_boundary() {
        assert_eq!(marshal_text("ab\0c"), Err(SlotError::InteriorNul(2)));
        assert!(marshal_text("plain").is_ok());
    }

    #[tokio::test]
    async fn bytes_round_trip_with_embedded_zeros() {
        let vm = vm().await;
        let mut frame = vm.frame().unwrap();
        frame.ensure_slots(1);
        frame.set_slot_bytes(0, &[104, 0, 105]);
        assert_eq!(frame.slot_type(0), SlotType::String);
        assert_eq!(frame.get_slot_bytes(0), Some(vec![104, 0, 105]));
        // terminator semantics stop at the zero
        assert_eq!(frame.get_slot_string(0).as_deref(), Some("h"));
        assert_eq!(frame.read_slot(0), SlotValue::Bytes(vec![104, 0, 105]));
        drop(frame);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn nested_lists_marshal_through_scratch_slots() {
        let vm = vm().await;
        let mut frame = vm.frame().unwrap();
        frame.ensure_slots(1);
        let value = SlotValue::List(vec![
            1.0.into(),
            "two".into(),
            SlotValue::List(vec![true.into(), SlotValue::Null]),
        ]);
        frame.write_slot(0, &value).unwrap();
        assert_eq!(frame.slot_type(0), SlotType::List);
        assert_eq!(frame.get_list_count(0), Some(3));
        assert_eq!(frame.read_slot(0), value);
        assert!(frame.slot_count() > 1);
        drop(frame);
        assert!(vm.slot_high_water() >= 2);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn self_containing_list_reads_as_unknown() {
        let vm = vm().await;
        let source = "var L = [1]\nL.add(L)\nL.add(L)\nvar Deep = [2]\nfor (i in 1..10) Deep = [Deep]";
        assert_eq!(
            vm.interpret("main", source).await.unwrap(),
            crate::InterpretResult::Success
        );
        let mut frame = vm.frame().unwrap();
        frame.ensure_slots(1);
        assert!(frame.get_variable("main", "L", 0).unwrap());
        assert_eq!(frame.read_slot(0), SlotValue::Unknown);

        assert!(frame.get_variable("main", "Deep", 0).unwrap());
        let mut value = frame.read_slot(0);
        let mut depth = 0;
        while let SlotValue::List(mut items) = value {
            assert_eq!(items.len(), 1);
            value = items.remove(0);
            depth += 1;
        }
        assert_eq!(depth, 11);
        assert_eq!(value, SlotValue::Num(2.0));
        drop(frame);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn wrong_kind_reads_answer_none() {
        let vm = vm().await;
        let mut frame = vm.frame().unwrap();
        frame.ensure_slots(2);
        frame.set_slot_double(0, 4.5);
        assert_eq!(frame.get_slot_bool(0), None);
        assert_eq!(frame.get_slot_string(0), None);
        assert_eq!(frame.get_slot_double(0), Some(4.5));
        assert_eq!(frame.slot_type(1), SlotType::Null);
        assert!(frame.write_slot(1, &SlotValue::Unknown).is_err());
        drop(frame);
        vm.free().unwrap();
    }

    #[tokio::test]
    async fn insert_with_negative_index_counts_from_the_end() {
        let vm = vm().await;
        let mut frame = vm.frame().unwrap();
        frame.ensure_slots(2);
        frame.set_slot_new_list(0);
        for n in [1.0, 3.0] {
            frame.set_slot_double(1, n);
            frame.insert_in_list(0, -1, 1);
        }
        frame.set_slot_double(1, 2.0);
        frame.insert_in_list(0, -2, 1);
        assert_eq!(
            frame.read_slot(0),
            SlotValue::List(vec![1.0.into(), 2.0.into(), 3.0.into()])
        );
        frame.get_list_element(0, -1, 1);
        assert_eq!(frame.get_slot_double(1), Some(3.0));
        drop(frame);
        vm.free().unwrap();
    }
}
