/// Raw codes the native module uses for results, slot types and error
/// kinds. Queried once when the module finishes starting and cached by the
/// runtime; every VM copies the table at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantTable {
    pub result_success: i32,
    pub result_compile_error: i32,
    pub result_runtime_error: i32,
    pub type_bool: i32,
    pub type_num: i32,
    pub type_foreign: i32,
    pub type_list: i32,
    pub type_null: i32,
    pub type_string: i32,
    pub type_unknown: i32,
    pub error_compile: i32,
    pub error_runtime: i32,
    pub error_stack_trace: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    Bool,
    Num,
    Foreign,
    List,
    Null,
    String,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Compile,
    Runtime,
    StackTrace,
}

impl ConstantTable {
    pub fn interpret_result(&self, raw: i32) -> Option<InterpretResult> {
        match raw {
            r if r == self.result_success => Some(InterpretResult::Success),
            r if r == self.result_compile_error => Some(InterpretResult::CompileError),
            r if r == self.result_runtime_error => Some(InterpretResult::RuntimeError),
            _ => None,
        }
    }

    pub fn result_code(&self, result: InterpretResult) -> i32 {
        match result {
            InterpretResult::Success => self.result_success,
            InterpretResult::CompileError => self.result_compile_error,
            InterpretResult::RuntimeError => self.result_runtime_error,
        }
    }

    /// Codes the table does not know collapse to `SlotType::Unknown`.
    pub fn slot_type(&self, raw: i32) -> SlotType {
        match raw {
            r if r == self.type_bool => SlotType::Bool,
            r if r == self.type_num => SlotType::Num,
            r if r == self.type_foreign => SlotType::Foreign,
            r if r == self.type_list => SlotType::List,
            r if r == self.type_null => SlotType::Null,
            r if r == self.type_string => SlotType::String,
            _ => SlotType::Unknown,
        }
    }

    pub fn type_code(&self, ty: SlotType) -> i32 {
        match ty {
            SlotType::Bool => self.type_bool,
            SlotType::Num => self.type_num,
            SlotType::Foreign => self.type_foreign,
            SlotType::List => self.type_list,
            SlotType::Null => self.type_null,
            SlotType::String => self.type_string,
            SlotType::Unknown => self.type_unknown,
        }
    }

    pub fn error_kind(&self, raw: i32) -> Option<ErrorKind> {
        match raw {
            r if r == self.error_compile => Some(ErrorKind::Compile),
            r if r == self.error_runtime => Some(ErrorKind::Runtime),
            r if r == self.error_stack_trace => Some(ErrorKind::StackTrace),
            _ => None,
        }
    }

    pub fn error_code(&self, kind: ErrorKind) -> i32 {
        match kind {
            ErrorKind::Compile => self.error_compile,
            ErrorKind::Runtime => self.error_runtime,
            ErrorKind::StackTrace => self.error_stack_trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // deliberately not the bundled engine's numbering
    fn shuffled() -> ConstantTable {
        ConstantTable {
            result_success: 7,
            result_compile_error: 3,
            result_runtime_error: 11,
            type_bool: 40,
            type_num: 41,
            type_foreign: 42,
            type_list: 43,
            type_null: 44,
            type_string: 45,
            type_unknown: 46,
            error_compile: -1,
            error_runtime: -2,
            error_stack_trace: -3,
        }
    }

    #[test]
    fn results_follow_the_table_not_the_enum_order() {
        let table = shuffled();
        assert_eq!(table.interpret_result(7), Some(InterpretResult::Success));
        assert_eq!(table.interpret_result(3), Some(InterpretResult::CompileError));
        assert_eq!(table.interpret_result(11), Some(InterpretResult::RuntimeError));
        assert_eq!(table.interpret_result(0), None);
        assert_eq!(table.result_code(InterpretResult::RuntimeError), 11);
    }

    #[test]
    fn unknown_type_codes_collapse() {
        let table = shuffled();
        assert_eq!(table.slot_type(43), SlotType::List);
        assert_eq!(table.slot_type(999), SlotType::Unknown);
        assert_eq!(table.type_code(SlotType::String), 45);
    }

    #[test]
    fn error_kinds() {
        let table = shuffled();
        assert_eq!(table.error_kind(-3), Some(ErrorKind::StackTrace));
        assert_eq!(table.error_kind(0), None);
        assert_eq!(table.error_code(ErrorKind::Compile), -1);
    }
}
