use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::native::{FinalizerFn, ForeignClassFns, ForeignFn, ForeignStorage};

use super::{
    ast::{Body, MethodKind},
    interp::{RuntimeError, WrenVm},
};

/// A built-in method: receiver and arguments in, result out.
pub type Primitive = fn(&mut WrenVm, &Value, &[Value]) -> Result<Value, RuntimeError>;

#[derive(Clone)]
pub enum Method {
    Primitive(Primitive),
    Script(Arc<ScriptMethod>),
    /// Allocates an instance, then runs the body as its initializer.
    Constructor(Arc<ScriptMethod>),
    Foreign(ForeignFn),
}

/// What a method body can see of the class it was declared in.
#[derive(Debug)]
pub struct ClassScope {
    pub name: String,
    pub superclass: Option<Arc<Class>>,
    pub static_fields: Mutex<HashMap<String, Value>>,
}

pub struct ScriptMethod {
    pub scope: Arc<ClassScope>,
    pub module: String,
    pub kind: MethodKind,
    /// Bare name, used by `super(...)`.
    pub name: String,
    pub signature: String,
    pub params: Vec<String>,
    pub body: Arc<Body>,
    pub line: usize,
}

impl ScriptMethod {
    /// Name shown in stack traces.
    pub fn debug_name(&self) -> String {
        let class = &self.scope.name;
        match self.kind {
            MethodKind::Instance => format!("{class}.{}", self.signature),
            MethodKind::Static => format!("static {class}.{}", self.signature),
            MethodKind::Construct => format!("{class}.init {}", self.signature),
        }
    }
}

pub struct Class {
    pub name: String,
    pub module: String,
    pub superclass: Option<Arc<Class>>,
    pub methods: HashMap<String, Method>,
    pub statics: HashMap<String, Method>,
    pub foreign: Option<ForeignClassFns>,
    pub scope: Arc<ClassScope>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("methods", &self.methods.len())
            .field("statics", &self.statics.len())
            .finish_non_exhaustive()
    }
}

impl Class {
    pub fn find_method(&self, signature: &str) -> Option<&Method> {
        let mut class = self;
        loop {
            if let Some(method) = class.methods.get(signature) {
                return Some(method);
            }
            class = class.superclass.as_deref()?;
        }
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        let mut class = self;
        loop {
            if std::ptr::eq(class, other) {
                return true;
            }
            match class.superclass.as_deref() {
                Some(superclass) => class = superclass,
                None => return false,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub from: f64,
    pub to: f64,
    pub inclusive: bool,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Arc<Class>,
    pub fields: Mutex<HashMap<String, Value>>,
}

pub struct ForeignObject {
    pub class: Arc<Class>,
    pub storage: ForeignStorage,
    finalize: Option<FinalizerFn>,
}

impl ForeignObject {
    pub fn new(class: Arc<Class>, size: usize) -> Self {
        let finalize = class.foreign.as_ref().and_then(|fns| fns.finalize.clone());
        Self {
            class,
            storage: ForeignStorage::zeroed(size),
            finalize,
        }
    }
}

impl Drop for ForeignObject {
    fn drop(&mut self) {
        if let Some(finalize) = &self.finalize {
            let mut bytes = self.storage.lock();
            finalize(&mut bytes[..]);
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(Arc<[u8]>),
    List(Arc<Mutex<Vec<Value>>>),
    Range(Range),
    Class(Arc<Class>),
    Instance(Arc<Instance>),
    Foreign(Arc<ForeignObject>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => f.write_str(&fmt_num(*n)),
            Value::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Value::List(items) => f.debug_list().entries(items.lock().iter()).finish(),
            Value::Range(r) => write!(f, "{}{}{}", fmt_num(r.from), if r.inclusive { ".." } else { "..." }, fmt_num(r.to)),
            Value::Class(class) => f.write_str(&class.name),
            Value::Instance(instance) => write!(f, "instance of {}", instance.class.name),
            Value::Foreign(object) => write!(f, "instance of {}", object.class.name),
        }
    }
}

impl Value {
    pub fn string(text: &str) -> Self {
        Value::Str(Arc::from(text.as_bytes()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    /// Value equality for the immutable kinds, identity for the rest.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Foreign(a), Value::Foreign(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Formats like `%.14g`, with integers printed without a fraction.
pub fn fmt_num(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "infinity" } else { "-infinity" }.to_owned();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        if n == 0.0 && n.is_sign_negative() {
            return "-0".to_owned();
        }
        return format!("{}", n as i64);
    }

    let sci = format!("{n:.13e}");
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..14).contains(&exponent) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (13 - exponent).max(0) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_owned()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_print_like_the_reference_vm() {
        assert_eq!(fmt_num(2.0), "2");
        assert_eq!(fmt_num(-7.0), "-7");
        assert_eq!(fmt_num(1.5), "1.5");
        assert_eq!(fmt_num(0.1 + 0.2), "0.3");
        assert_eq!(fmt_num(1e15), "1e+15");
        assert_eq!(fmt_num(0.00001), "1e-05");
        assert_eq!(fmt_num(f64::NAN), "nan");
        assert_eq!(fmt_num(f64::NEG_INFINITY), "-infinity");
        assert_eq!(fmt_num(-0.0), "-0");
    }

    #[test]
    fn equality_is_by_value_for_strings_and_identity_for_lists() {
        assert!(Value::string("a").equals(&Value::string("a")));
        assert!(!Value::list(vec![]).equals(&Value::list(vec![])));
        let list = Value::list(vec![Value::Num(1.0)]);
        assert!(list.equals(&list.clone()));
        assert!(Value::Null.is_falsy());
        assert!(!Value::Num(0.0).is_falsy());
    }
}
