//! Built-in classes and their primitive methods.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    interp::{RuntimeError, WrenVm, list_index},
    value::{Class, ClassScope, Method, Primitive, Range, Value, fmt_num},
};

/// Source of the `System` class and anything else written in the language
/// itself.
pub const PRELUDE: &str = include_str!("core.wren");

static NULL: Value = Value::Null;

pub struct CoreClasses {
    pub object: Arc<Class>,
    pub class: Arc<Class>,
    pub bool: Arc<Class>,
    pub null: Arc<Class>,
    pub num: Arc<Class>,
    pub string: Arc<Class>,
    pub list: Arc<Class>,
    pub range: Arc<Class>,
    pub fiber: Arc<Class>,
}

impl CoreClasses {
    /// Variables of the core module before the prelude runs.
    pub fn globals(&self) -> HashMap<String, Value> {
        [
            &self.object,
            &self.class,
            &self.bool,
            &self.null,
            &self.num,
            &self.string,
            &self.list,
            &self.range,
            &self.fiber,
        ]
        .into_iter()
        .map(|class| (class.name.clone(), Value::Class(class.clone())))
        .collect()
    }

    /// Built-ins other than `Object` cannot be subclassed.
    pub fn is_sealed(&self, class: &Arc<Class>) -> bool {
        [
            &self.class,
            &self.bool,
            &self.null,
            &self.num,
            &self.string,
            &self.list,
            &self.range,
            &self.fiber,
        ]
        .into_iter()
        .any(|sealed| Arc::ptr_eq(sealed, class))
    }
}

fn table(entries: &[(&str, Primitive)]) -> HashMap<String, Method> {
    entries
        .iter()
        .map(|(signature, primitive)| ((*signature).to_owned(), Method::Primitive(*primitive)))
        .collect()
}

fn class(
    name: &str,
    superclass: Option<&Arc<Class>>,
    methods: &[(&str, Primitive)],
    statics: &[(&str, Primitive)],
) -> Arc<Class> {
    let superclass = superclass.cloned();
    Arc::new(Class {
        name: name.to_owned(),
        module: String::new(),
        superclass: superclass.clone(),
        methods: table(methods),
        statics: table(statics),
        foreign: None,
        scope: Arc::new(ClassScope {
            name: name.to_owned(),
            superclass,
            static_fields: Mutex::new(HashMap::new()),
        }),
    })
}

pub fn bootstrap() -> CoreClasses {
    let object = class(
        "Object",
        None,
        &[
            ("==(_)", object_eq),
            ("!=(_)", object_ne),
            ("!", object_not),
            ("is(_)", object_is),
            ("toString", object_to_string),
            ("type", object_type),
        ],
        &[],
    );
    let base = Some(&object);
    let class_class = class(
        "Class",
        base,
        &[
            ("name", class_name),
            ("supertype", class_supertype),
            ("toString", class_name),
        ],
        &[],
    );
    let bool_class = class(
        "Bool",
        base,
        &[("!", bool_not), ("toString", bool_to_string)],
        &[],
    );
    let null_class = class(
        "Null",
        base,
        &[("!", null_not), ("toString", null_to_string)],
        &[],
    );
    let num = class(
        "Num",
        base,
        &[
            ("+(_)", num_add),
            ("-(_)", num_sub),
            ("*(_)", num_mul),
            ("/(_)", num_div),
            ("%(_)", num_rem),
            ("<(_)", num_lt),
            (">(_)", num_gt),
            ("<=(_)", num_le),
            (">=(_)", num_ge),
            ("&(_)", num_bit_and),
            ("|(_)", num_bit_or),
            ("^(_)", num_bit_xor),
            ("<<(_)", num_shl),
            (">>(_)", num_shr),
            ("..(_)", num_range_inclusive),
            ("...(_)", num_range_exclusive),
            ("-", num_negate),
            ("~", num_bit_not),
            ("abs", num_abs),
            ("ceil", num_ceil),
            ("floor", num_floor),
            ("round", num_round),
            ("sqrt", num_sqrt),
            ("isInteger", num_is_integer),
            ("isNan", num_is_nan),
            ("min(_)", num_min),
            ("max(_)", num_max),
            ("toString", num_to_string),
        ],
        &[("fromString(_)", num_from_string), ("pi", num_pi)],
    );
    let string = class(
        "String",
        base,
        &[
            ("+(_)", string_plus),
            ("count", string_count),
            ("contains(_)", string_contains),
            ("startsWith(_)", string_starts_with),
            ("endsWith(_)", string_ends_with),
            ("indexOf(_)", string_index_of),
            ("[_]", string_subscript),
            ("iterate(_)", string_iterate),
            ("iteratorValue(_)", string_iterator_value),
            ("toString", identity),
        ],
        &[],
    );
    let list = class(
        "List",
        base,
        &[
            ("add(_)", list_add),
            ("clear()", list_clear),
            ("count", list_count),
            ("indexOf(_)", list_index_of),
            ("insert(_,_)", list_insert),
            ("removeAt(_)", list_remove_at),
            ("[_]", list_subscript),
            ("[_]=(_)", list_subscript_set),
            ("iterate(_)", list_iterate),
            ("iteratorValue(_)", list_iterator_value),
            ("toString", list_to_string),
        ],
        &[("new()", list_new), ("filled(_,_)", list_filled)],
    );
    let range = class(
        "Range",
        base,
        &[
            ("from", range_from),
            ("to", range_to),
            ("isInclusive", range_is_inclusive),
            ("iterate(_)", range_iterate),
            ("iteratorValue(_)", identity_arg),
            ("toString", range_to_string),
        ],
        &[],
    );
    let fiber = class("Fiber", base, &[], &[("abort(_)", fiber_abort)]);

    CoreClasses {
        object,
        class: class_class,
        bool: bool_class,
        null: null_class,
        num,
        string,
        list,
        range,
        fiber,
    }
}

/// Primitives merged into a class the prelude declares, as
/// `(instance, static)` method tables.
pub fn primitives_for(class_name: &str) -> (HashMap<String, Method>, HashMap<String, Method>) {
    match class_name {
        "System" => (
            HashMap::new(),
            table(&[
                ("writeString_(_)", system_write_string),
                ("clock", system_clock),
                ("gc()", system_gc),
            ]),
        ),
        _ => (HashMap::new(), HashMap::new()),
    }
}

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn this_num(vm: &WrenVm, receiver: &Value) -> Result<f64, RuntimeError> {
    match receiver {
        Value::Num(n) => Ok(*n),
        _ => Err(vm.error("Receiver must be a number.")),
    }
}

fn arg_num(vm: &WrenVm, args: &[Value], what: &str) -> Result<f64, RuntimeError> {
    match arg(args, 0) {
        Value::Num(n) => Ok(*n),
        _ => Err(vm.error(format!("{what} must be a number."))),
    }
}

fn this_bytes(vm: &WrenVm, receiver: &Value) -> Result<Arc<[u8]>, RuntimeError> {
    match receiver {
        Value::Str(bytes) => Ok(bytes.clone()),
        _ => Err(vm.error("Receiver must be a string.")),
    }
}

fn arg_bytes(vm: &WrenVm, args: &[Value]) -> Result<Arc<[u8]>, RuntimeError> {
    match arg(args, 0) {
        Value::Str(bytes) => Ok(bytes.clone()),
        _ => Err(vm.error("Argument must be a string.")),
    }
}

fn this_list(vm: &WrenVm, receiver: &Value) -> Result<Arc<Mutex<Vec<Value>>>, RuntimeError> {
    match receiver {
        Value::List(list) => Ok(list.clone()),
        _ => Err(vm.error("Receiver must be a list.")),
    }
}

fn this_range(vm: &WrenVm, receiver: &Value) -> Result<Range, RuntimeError> {
    match receiver {
        Value::Range(range) => Ok(*range),
        _ => Err(vm.error("Receiver must be a range.")),
    }
}

/// An integral index argument.
fn arg_index(vm: &WrenVm, args: &[Value], index: usize, what: &str) -> Result<isize, RuntimeError> {
    match arg(args, index) {
        Value::Num(n) if n.fract() == 0.0 => Ok(*n as isize),
        Value::Num(_) => Err(vm.error(format!("{what} must be an integer."))),
        _ => Err(vm.error(format!("{what} must be a number."))),
    }
}

fn identity(_vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(receiver.clone())
}

fn identity_arg(_vm: &mut WrenVm, _receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(arg(args, 0).clone())
}

fn object_eq(_vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(receiver.equals(arg(args, 0))))
}

fn object_ne(_vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(!receiver.equals(arg(args, 0))))
}

fn object_not(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(false))
}

fn object_is(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let Value::Class(target) = arg(args, 0) else {
        return Err(vm.error("Right operand must be a class."));
    };
    Ok(Value::Bool(vm.class_of(receiver).is_subclass_of(target)))
}

fn object_to_string(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(&format!("instance of {}", vm.class_of(receiver).name)))
}

fn object_type(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Class(vm.class_of(receiver)))
}

fn class_name(_vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match receiver {
        Value::Class(class) => Value::string(&class.name),
        _ => Value::Null,
    })
}

fn class_supertype(_vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match receiver {
        Value::Class(class) => class.superclass.clone().map_or(Value::Null, Value::Class),
        _ => Value::Null,
    })
}

fn bool_not(_vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(matches!(receiver, Value::Bool(false))))
}

fn bool_to_string(_vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(if matches!(receiver, Value::Bool(true)) {
        "true"
    } else {
        "false"
    }))
}

fn null_not(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(true))
}

fn null_to_string(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string("null"))
}

macro_rules! num_binary {
    ($name:ident, |$a:ident, $b:ident| $body:expr) => {
        fn $name(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
            let $a = this_num(vm, receiver)?;
            let $b = arg_num(vm, args, "Right operand")?;
            Ok($body)
        }
    };
}

macro_rules! num_unary {
    ($name:ident, |$a:ident| $body:expr) => {
        fn $name(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
            let $a = this_num(vm, receiver)?;
            Ok($body)
        }
    };
}

num_binary!(num_add, |a, b| Value::Num(a + b));
num_binary!(num_sub, |a, b| Value::Num(a - b));
num_binary!(num_mul, |a, b| Value::Num(a * b));
num_binary!(num_div, |a, b| Value::Num(a / b));
num_binary!(num_rem, |a, b| Value::Num(a % b));
num_binary!(num_lt, |a, b| Value::Bool(a < b));
num_binary!(num_gt, |a, b| Value::Bool(a > b));
num_binary!(num_le, |a, b| Value::Bool(a <= b));
num_binary!(num_ge, |a, b| Value::Bool(a >= b));
num_binary!(num_bit_and, |a, b| Value::Num(f64::from(a as u32 & b as u32)));
num_binary!(num_bit_or, |a, b| Value::Num(f64::from(a as u32 | b as u32)));
num_binary!(num_bit_xor, |a, b| Value::Num(f64::from(a as u32 ^ b as u32)));
num_binary!(num_shl, |a, b| Value::Num(f64::from((a as u32).wrapping_shl(b as u32))));
num_binary!(num_shr, |a, b| Value::Num(f64::from((a as u32).wrapping_shr(b as u32))));
num_binary!(num_min, |a, b| Value::Num(a.min(b)));
num_binary!(num_max, |a, b| Value::Num(a.max(b)));
num_binary!(num_range_inclusive, |a, b| Value::Range(Range {
    from: a,
    to: b,
    inclusive: true
}));
num_binary!(num_range_exclusive, |a, b| Value::Range(Range {
    from: a,
    to: b,
    inclusive: false
}));

num_unary!(num_negate, |a| Value::Num(-a));
num_unary!(num_bit_not, |a| Value::Num(f64::from(!(a as u32))));
num_unary!(num_abs, |a| Value::Num(a.abs()));
num_unary!(num_ceil, |a| Value::Num(a.ceil()));
num_unary!(num_floor, |a| Value::Num(a.floor()));
num_unary!(num_round, |a| Value::Num(a.round()));
num_unary!(num_sqrt, |a| Value::Num(a.sqrt()));
num_unary!(num_is_integer, |a| Value::Bool(a.is_finite() && a.fract() == 0.0));
num_unary!(num_is_nan, |a| Value::Bool(a.is_nan()));
num_unary!(num_to_string, |a| Value::string(&fmt_num(a)));

fn num_from_string(vm: &mut WrenVm, _receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let text = arg_bytes(vm, args)?;
    let parsed = std::str::from_utf8(&text)
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok());
    Ok(parsed.map_or(Value::Null, Value::Num))
}

fn num_pi(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Num(std::f64::consts::PI))
}

fn string_plus(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let left = this_bytes(vm, receiver)?;
    let Value::Str(right) = arg(args, 0) else {
        return Err(vm.error("Right operand must be a string."));
    };
    let mut joined = Vec::with_capacity(left.len() + right.len());
    joined.extend_from_slice(&left);
    joined.extend_from_slice(right);
    Ok(Value::Str(joined.into()))
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xc0 == 0x80
}

fn string_count(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let bytes = this_bytes(vm, receiver)?;
    let count = bytes.iter().filter(|&&b| !is_continuation(b)).count();
    Ok(Value::Num(count as f64))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn string_contains(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (text, needle) = (this_bytes(vm, receiver)?, arg_bytes(vm, args)?);
    Ok(Value::Bool(find(&text, &needle).is_some()))
}

fn string_starts_with(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (text, prefix) = (this_bytes(vm, receiver)?, arg_bytes(vm, args)?);
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn string_ends_with(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (text, suffix) = (this_bytes(vm, receiver)?, arg_bytes(vm, args)?);
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn string_index_of(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (text, needle) = (this_bytes(vm, receiver)?, arg_bytes(vm, args)?);
    Ok(Value::Num(find(&text, &needle).map_or(-1.0, |i| i as f64)))
}

/// The code point starting at byte `index`, as a string.
fn code_point_at(bytes: &[u8], index: usize) -> Value {
    let end = bytes[index + 1..]
        .iter()
        .position(|&b| !is_continuation(b))
        .map_or(bytes.len(), |offset| index + 1 + offset);
    Value::Str(bytes[index..end].into())
}

fn string_subscript(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let bytes = this_bytes(vm, receiver)?;
    let index = arg_index(vm, args, 0, "Subscript")?;
    match list_index(bytes.len(), index) {
        Some(i) => Ok(code_point_at(&bytes, i)),
        None => Err(vm.error("Subscript out of bounds.")),
    }
}

fn string_iterate(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let bytes = this_bytes(vm, receiver)?;
    let next = match arg(args, 0) {
        Value::Null => 0,
        _ => {
            let current = arg_index(vm, args, 0, "Iterator")?.max(0) as usize;
            (current + 1..bytes.len())
                .find(|&i| !is_continuation(bytes[i]))
                .unwrap_or(bytes.len())
        }
    };
    Ok(if next < bytes.len() {
        Value::Num(next as f64)
    } else {
        Value::Bool(false)
    })
}

fn string_iterator_value(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    string_subscript(vm, receiver, args)
}

fn list_new(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::list(Vec::new()))
}

fn list_filled(vm: &mut WrenVm, _receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let size = arg_index(vm, args, 0, "Size")?;
    if size < 0 {
        return Err(vm.error("Size cannot be negative."));
    }
    Ok(Value::list(vec![arg(args, 1).clone(); size as usize]))
}

fn list_add(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let item = arg(args, 0).clone();
    this_list(vm, receiver)?.lock().push(item.clone());
    Ok(item)
}

fn list_clear(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    this_list(vm, receiver)?.lock().clear();
    Ok(Value::Null)
}

fn list_count(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Num(this_list(vm, receiver)?.lock().len() as f64))
}

fn list_index_of(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = this_list(vm, receiver)?;
    let needle = arg(args, 0);
    let position = list.lock().iter().position(|item| item.equals(needle));
    Ok(Value::Num(position.map_or(-1.0, |i| i as f64)))
}

fn list_insert(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = this_list(vm, receiver)?;
    let index = arg_index(vm, args, 0, "Index")?;
    let item = arg(args, 1).clone();
    let mut items = list.lock();
    let count = items.len();
    let resolved = if index < 0 { count as isize + 1 + index } else { index };
    if !(0..=count as isize).contains(&resolved) {
        drop(items);
        return Err(vm.error("Index out of bounds."));
    }
    items.insert(resolved as usize, item.clone());
    Ok(item)
}

fn list_remove_at(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = this_list(vm, receiver)?;
    let index = arg_index(vm, args, 0, "Index")?;
    let mut items = list.lock();
    match list_index(items.len(), index) {
        Some(i) => Ok(items.remove(i)),
        None => {
            drop(items);
            Err(vm.error("Index out of bounds."))
        }
    }
}

fn list_subscript(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = this_list(vm, receiver)?;
    let index = arg_index(vm, args, 0, "Subscript")?;
    let items = list.lock();
    match list_index(items.len(), index) {
        Some(i) => Ok(items[i].clone()),
        None => {
            drop(items);
            Err(vm.error("Subscript out of bounds."))
        }
    }
}

fn list_subscript_set(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = this_list(vm, receiver)?;
    let index = arg_index(vm, args, 0, "Subscript")?;
    let value = arg(args, 1).clone();
    let mut items = list.lock();
    match list_index(items.len(), index) {
        Some(i) => {
            items[i] = value.clone();
            Ok(value)
        }
        None => {
            drop(items);
            Err(vm.error("Subscript out of bounds."))
        }
    }
}

fn list_iterate(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let count = this_list(vm, receiver)?.lock().len();
    let next = match arg(args, 0) {
        Value::Null => 0,
        _ => arg_index(vm, args, 0, "Iterator")? + 1,
    };
    Ok(if next >= 0 && (next as usize) < count {
        Value::Num(next as f64)
    } else {
        Value::Bool(false)
    })
}

fn list_iterator_value(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    list_subscript(vm, receiver, args)
}

fn list_to_string(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let items = this_list(vm, receiver)?.lock().clone();
    let mut text = vec![b'['];
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            text.extend_from_slice(b", ");
        }
        text.extend_from_slice(&vm.stringify(item)?);
    }
    text.push(b']');
    Ok(Value::Str(text.into()))
}

fn range_from(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Num(this_range(vm, receiver)?.from))
}

fn range_to(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Num(this_range(vm, receiver)?.to))
}

fn range_is_inclusive(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(this_range(vm, receiver)?.inclusive))
}

fn range_iterate(vm: &mut WrenVm, receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let range = this_range(vm, receiver)?;
    if range.from == range.to && !range.inclusive {
        return Ok(Value::Bool(false));
    }
    let current = match arg(args, 0) {
        Value::Null => return Ok(Value::Num(range.from)),
        _ => arg_num(vm, args, "Iterator")?,
    };
    let next = if range.from < range.to {
        current + 1.0
    } else {
        current - 1.0
    };
    let past_end = if range.from < range.to {
        next > range.to
    } else {
        next < range.to
    };
    if past_end || (!range.inclusive && next == range.to) {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Num(next))
}

fn range_to_string(vm: &mut WrenVm, receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let range = this_range(vm, receiver)?;
    let dots = if range.inclusive { ".." } else { "..." };
    Ok(Value::string(&format!("{}{dots}{}", fmt_num(range.from), fmt_num(range.to))))
}

fn fiber_abort(vm: &mut WrenVm, _receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0) {
        Value::Null => Ok(Value::Null),
        value => Err(vm.abort_with(value.clone())),
    }
}

fn system_write_string(vm: &mut WrenVm, _receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let text = arg_bytes(vm, args)?;
    vm.write(&String::from_utf8_lossy(&text));
    Ok(arg(args, 0).clone())
}

fn system_clock(vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Num(vm.started.elapsed().as_secs_f64()))
}

fn system_gc(_vm: &mut WrenVm, _receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_sealed_but_object_is_not() {
        let core = bootstrap();
        assert!(core.is_sealed(&core.num));
        assert!(!core.is_sealed(&core.object));
        assert!(core.num.is_subclass_of(&core.object));
        assert_eq!(core.globals().len(), 9);
    }

    #[test]
    fn code_points_span_continuation_bytes() {
        let bytes = "aé!".as_bytes();
        assert!(matches!(code_point_at(bytes, 1), Value::Str(s) if &*s == "é".as_bytes()));
        assert!(matches!(code_point_at(bytes, 3), Value::Str(s) if &*s == b"!"));
    }

    #[test]
    fn system_gets_its_primitives() {
        let (methods, statics) = primitives_for("System");
        assert!(methods.is_empty());
        assert!(statics.contains_key("writeString_(_)"));
        assert!(primitives_for("Other").1.is_empty());
    }
}
