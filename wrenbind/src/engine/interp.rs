use std::{collections::HashMap, ffi::CStr, sync::Arc, time::Instant};

use parking_lot::Mutex;

use crate::{
    handles::signature_arity,
    native::{ForeignClassFns, ForeignFn, ForeignStorage, HostCallbacks, NativeVm, RawHandle, VmId},
};

use super::{
    EngineCreateInfo, with_stack,
    ast::{self, Body, ClassDecl, Expr, ImportName, MethodKind, Program, SignatureKind, Stmt, StmtKind},
    codes,
    builtins::{self, CoreClasses},
    parser::{CompileError, parse},
    value::{Class, ClassScope, ForeignObject, Instance, Method, ScriptMethod, Value},
};

/// Module that holds the prelude. Its frames never show up in traces.
pub const CORE_MODULE: &str = "";

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub module: String,
    pub line: usize,
    pub name: String,
}

/// A fiber abort: the error value plus the frames active when it was raised,
/// innermost first.
#[derive(Debug)]
pub struct RuntimeError {
    pub value: Value,
    pub trace: Vec<TraceFrame>,
}

enum Flow {
    Next,
    Break,
    Continue,
    Return(Value),
}

#[derive(Clone)]
enum HandleEntry {
    Value(Value),
    Call(String),
}

/// Evaluation state for one module body or method invocation.
struct Ctx {
    module: String,
    this: Option<Value>,
    method: Option<Arc<ScriptMethod>>,
    scopes: Vec<Vec<(String, Value)>>,
}

impl Ctx {
    fn module(module: &str) -> Self {
        Self {
            module: module.to_owned(),
            this: None,
            method: None,
            scopes: Vec::new(),
        }
    }
}

pub struct WrenVm {
    id: VmId,
    host: Arc<dyn HostCallbacks>,
    info: EngineCreateInfo,
    pub(super) core: CoreClasses,
    modules: HashMap<String, HashMap<String, Value>>,
    /// Parsed imports that have not run yet.
    compiled: HashMap<String, Arc<Program>>,
    slots: Vec<Value>,
    handles: HashMap<RawHandle, HandleEntry>,
    next_handle: u64,
    frames: Vec<TraceFrame>,
    /// Nesting of `call_method`.
    calls: usize,
    abort: Option<Value>,
    pub(super) started: Instant,
}

impl WrenVm {
    pub fn new(id: VmId, host: Arc<dyn HostCallbacks>, info: EngineCreateInfo) -> Self {
        let core = builtins::bootstrap();
        let mut modules = HashMap::new();
        modules.insert(CORE_MODULE.to_owned(), core.globals());
        Self {
            id,
            host,
            info,
            core,
            modules,
            compiled: HashMap::new(),
            slots: Vec::new(),
            handles: HashMap::new(),
            next_handle: 0,
            frames: Vec::new(),
            calls: 0,
            abort: None,
            started: Instant::now(),
        }
    }

    /// Runs the prelude into the core module.
    pub fn load_prelude(&mut self, prelude: &Program) -> Result<(), RuntimeError> {
        self.run_module(CORE_MODULE, prelude)
    }

    pub(super) fn write(&self, text: &str) {
        self.host.write(self.id, text);
    }

    pub(super) fn error(&self, message: impl AsRef<str>) -> RuntimeError {
        RuntimeError {
            value: Value::string(message.as_ref()),
            trace: self.trace(),
        }
    }

    pub(super) fn abort_with(&self, value: Value) -> RuntimeError {
        RuntimeError {
            value,
            trace: self.trace(),
        }
    }

    fn trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .filter(|frame| frame.module != CORE_MODULE)
            .cloned()
            .collect()
    }

    pub(super) fn class_of(&self, value: &Value) -> Arc<Class> {
        let core = &self.core;
        match value {
            Value::Null => core.null.clone(),
            Value::Bool(_) => core.bool.clone(),
            Value::Num(_) => core.num.clone(),
            Value::Str(_) => core.string.clone(),
            Value::List(_) => core.list.clone(),
            Value::Range(_) => core.range.clone(),
            Value::Class(_) => core.class.clone(),
            Value::Instance(instance) => instance.class.clone(),
            Value::Foreign(object) => object.class.clone(),
        }
    }

    fn find_method(&self, receiver: &Value, signature: &str) -> Option<Method> {
        if let Value::Class(class) = receiver
            && let Some(method) = class.statics.get(signature)
        {
            return Some(method.clone());
        }
        self.class_of(receiver).find_method(signature).cloned()
    }

    pub(super) fn call_method(
        &mut self,
        receiver: Value,
        signature: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        // Primitives recurse without pushing frames, so calls are counted
        // separately against the same limit.
        if self.calls >= self.info.max_call_depth {
            return Err(self.error("Stack overflow."));
        }
        self.calls += 1;
        let result = with_stack(|| self.dispatch(receiver, signature, args));
        self.calls -= 1;
        result
    }

    fn dispatch(
        &mut self,
        receiver: Value,
        signature: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let Some(method) = self.find_method(&receiver, signature) else {
            let message = match &receiver {
                Value::Class(class) => {
                    format!("{} metaclass does not implement '{signature}'.", class.name)
                }
                other => format!(
                    "{} does not implement '{signature}'.",
                    self.class_of(other).name
                ),
            };
            return Err(self.error(message));
        };
        self.invoke(method, receiver, args)
    }

    fn invoke(
        &mut self,
        method: Method,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        match method {
            Method::Primitive(primitive) => primitive(self, &receiver, args),
            Method::Script(method) => self.run_method(&method, receiver, args),
            Method::Constructor(method) => self.construct(&method, receiver, args),
            Method::Foreign(foreign) => self.call_foreign(&foreign, receiver, args),
        }
    }

    fn run_method(
        &mut self,
        method: &Arc<ScriptMethod>,
        this: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        if self.frames.len() >= self.info.max_call_depth {
            return Err(self.error("Stack overflow."));
        }
        let params = method
            .params
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), args.get(i).cloned().unwrap_or(Value::Null)))
            .collect();
        let mut ctx = Ctx {
            module: method.module.clone(),
            this: Some(this),
            method: Some(method.clone()),
            scopes: vec![params],
        };
        self.frames.push(TraceFrame {
            module: method.module.clone(),
            line: method.line,
            name: method.debug_name(),
        });
        let result = match &*method.body {
            Body::Expr(expr) => self.eval(&mut ctx, expr),
            Body::Block(statements) => {
                self.exec_all(&mut ctx, statements).map(|flow| match flow {
                    Flow::Return(value) => value,
                    _ => Value::Null,
                })
            }
        };
        self.frames.pop();
        result
    }

    fn construct(
        &mut self,
        initializer: &Arc<ScriptMethod>,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let Value::Class(class) = &receiver else {
            return Err(self.error("Constructors must be called on a class."));
        };
        let object = match &class.foreign {
            Some(fns) => {
                let allocate = fns.allocate.clone();
                let class_name = class.name.clone();
                match self.call_foreign(&allocate, receiver.clone(), args)? {
                    object @ Value::Foreign(_) => object,
                    _ => {
                        return Err(self.error(format!(
                            "Allocator for foreign class {class_name} did not create an object."
                        )));
                    }
                }
            }
            None => Value::Instance(Arc::new(Instance {
                class: class.clone(),
                fields: Mutex::new(HashMap::new()),
            })),
        };
        self.run_method(initializer, object.clone(), args)?;
        Ok(object)
    }

    /// Runs `foreign` with `receiver` and `args` as its slot window. Slots
    /// belonging to the caller are restored afterwards.
    fn call_foreign(
        &mut self,
        foreign: &ForeignFn,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let mut window = Vec::with_capacity(args.len() + 1);
        window.push(receiver);
        window.extend_from_slice(args);
        let saved_slots = std::mem::replace(&mut self.slots, window);
        let saved_abort = self.abort.take();

        let native: &mut dyn NativeVm = self;
        foreign(native);

        let window = std::mem::replace(&mut self.slots, saved_slots);
        if let Some(value) = std::mem::replace(&mut self.abort, saved_abort) {
            return Err(self.abort_with(value));
        }
        Ok(window.into_iter().next().unwrap_or(Value::Null))
    }

    fn call_super(
        &mut self,
        ctx: &mut Ctx,
        signature: Option<&str>,
        args: &[Expr],
    ) -> Result<Value, RuntimeError> {
        let (Some(method), Some(this)) = (ctx.method.clone(), ctx.this.clone()) else {
            return Err(self.error("Cannot use 'super' outside of a method."));
        };
        let Some(superclass) = method.scope.superclass.clone() else {
            return Err(self.error(format!("{} has no superclass.", method.scope.name)));
        };
        let args = self.eval_args(ctx, args)?;
        // A bare `super(...)` in a constructor chains to the superclass
        // initializer of the same name.
        let chains_initializer = signature.is_none() && method.kind == MethodKind::Construct;
        let signature = match signature {
            Some(signature) => signature.to_owned(),
            None => ast::signature(&method.name, args.len(), SignatureKind::Method),
        };

        let found = if chains_initializer || method.kind == MethodKind::Static {
            superclass.statics.get(&signature).cloned()
        } else {
            superclass.find_method(&signature).cloned()
        };
        match found {
            Some(Method::Constructor(initializer)) => self.run_method(&initializer, this, &args),
            Some(method) => self.invoke(method, this, &args),
            None => Err(self.error(format!(
                "{} does not implement '{signature}'.",
                superclass.name
            ))),
        }
    }

    fn eval_args(&mut self, ctx: &mut Ctx, args: &[Expr]) -> Result<Vec<Value>, RuntimeError> {
        args.iter().map(|arg| self.eval(ctx, arg)).collect()
    }

    fn eval(&mut self, ctx: &mut Ctx, expr: &Expr) -> Result<Value, RuntimeError> {
        with_stack(|| self.eval_expr(ctx, expr))
    }

    fn eval_expr(&mut self, ctx: &mut Ctx, expr: &Expr) -> Result<Value, RuntimeError> {
        Ok(match expr {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Num(n) => Value::Num(*n),
            Expr::Str(bytes) => Value::Str(bytes.clone()),
            Expr::Interpolation(parts) => {
                let mut text = Vec::new();
                for part in parts {
                    let value = self.eval(ctx, part)?;
                    text.extend_from_slice(&self.stringify(value)?);
                }
                Value::Str(text.into())
            }
            Expr::List(items) => Value::list(self.eval_args(ctx, items)?),
            Expr::This => match &ctx.this {
                Some(this) => this.clone(),
                None => return Err(self.error("Cannot use 'this' outside of a method.")),
            },
            Expr::Name(name) => self.lookup(ctx, name)?,
            Expr::Field(name) => {
                let instance = self.this_instance(ctx)?;
                let fields = instance.fields.lock();
                fields.get(name).cloned().unwrap_or(Value::Null)
            }
            Expr::StaticField(name) => {
                let scope = self.class_scope(ctx)?;
                let fields = scope.static_fields.lock();
                fields.get(name).cloned().unwrap_or(Value::Null)
            }
            Expr::Call {
                receiver,
                signature,
                args,
            } => {
                let receiver = self.eval(ctx, receiver)?;
                let args = self.eval_args(ctx, args)?;
                self.call_method(receiver, signature, &args)?
            }
            Expr::SelfCall { signature, args } => {
                let Some(this) = ctx.this.clone() else {
                    return Err(self.error(format!(
                        "Cannot call '{signature}' outside of a class."
                    )));
                };
                let args = self.eval_args(ctx, args)?;
                self.call_method(this, signature, &args)?
            }
            Expr::SuperCall { signature, args } => {
                self.call_super(ctx, signature.as_deref(), args)?
            }
            Expr::Assign { target, value } => {
                let value = self.eval(ctx, value)?;
                self.assign(ctx, target, value.clone())?;
                value
            }
            Expr::And(left, right) => {
                let left = self.eval(ctx, left)?;
                if left.is_falsy() { left } else { self.eval(ctx, right)? }
            }
            Expr::Or(left, right) => {
                let left = self.eval(ctx, left)?;
                if left.is_falsy() { self.eval(ctx, right)? } else { left }
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if self.eval(ctx, condition)?.is_falsy() {
                    self.eval(ctx, otherwise)?
                } else {
                    self.eval(ctx, then)?
                }
            }
        })
    }

    /// `toString` of any value, as bytes.
    pub(super) fn stringify(&mut self, value: Value) -> Result<Arc<[u8]>, RuntimeError> {
        if let Value::Str(bytes) = value {
            return Ok(bytes);
        }
        match self.call_method(value, "toString", &[])? {
            Value::Str(bytes) => Ok(bytes),
            _ => Err(self.error("toString must return a string.")),
        }
    }

    fn this_instance(&self, ctx: &Ctx) -> Result<Arc<Instance>, RuntimeError> {
        match &ctx.this {
            Some(Value::Instance(instance)) => Ok(instance.clone()),
            Some(Value::Foreign(_)) => {
                Err(self.error("Foreign class instances do not have fields."))
            }
            _ => Err(self.error("Cannot use an instance field outside of an instance method.")),
        }
    }

    fn class_scope(&self, ctx: &Ctx) -> Result<Arc<ClassScope>, RuntimeError> {
        ctx.method
            .as_ref()
            .map(|method| method.scope.clone())
            .ok_or_else(|| self.error("Cannot use a static field outside of a class."))
    }

    fn module_var(&self, module: &str, name: &str) -> Option<Value> {
        self.modules
            .get(module)
            .and_then(|vars| vars.get(name))
            .or_else(|| self.modules.get(CORE_MODULE).and_then(|vars| vars.get(name)))
            .cloned()
    }

    fn lookup(&mut self, ctx: &mut Ctx, name: &str) -> Result<Value, RuntimeError> {
        for scope in ctx.scopes.iter().rev() {
            if let Some((_, value)) = scope.iter().rev().find(|(local, _)| local == name) {
                return Ok(value.clone());
            }
        }
        if ctx.method.is_some() && name.starts_with(|c: char| c.is_ascii_lowercase()) {
            let this = ctx.this.clone().unwrap_or(Value::Null);
            return self.call_method(this, name, &[]);
        }
        self.module_var(&ctx.module, name)
            .ok_or_else(|| self.error(format!("Variable '{name}' is not defined.")))
    }

    fn assign(&mut self, ctx: &mut Ctx, target: &Expr, value: Value) -> Result<(), RuntimeError> {
        match target {
            Expr::Name(name) => {
                for scope in ctx.scopes.iter_mut().rev() {
                    if let Some(slot) = scope.iter_mut().rev().find(|(local, _)| local == name) {
                        slot.1 = value;
                        return Ok(());
                    }
                }
                if ctx.method.is_some() && name.starts_with(|c: char| c.is_ascii_lowercase()) {
                    let this = ctx.this.clone().unwrap_or(Value::Null);
                    self.call_method(this, &format!("{name}=(_)"), &[value])?;
                    return Ok(());
                }
                match self.modules.get_mut(&ctx.module).and_then(|vars| vars.get_mut(name)) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(self.error(format!("Variable '{name}' is not defined."))),
                }
            }
            Expr::Field(name) => {
                let instance = self.this_instance(ctx)?;
                instance.fields.lock().insert(name.clone(), value);
                Ok(())
            }
            Expr::StaticField(name) => {
                let scope = self.class_scope(ctx)?;
                scope.static_fields.lock().insert(name.clone(), value);
                Ok(())
            }
            _ => Err(self.error("Invalid assignment target.")),
        }
    }

    fn define(&mut self, ctx: &mut Ctx, name: &str, value: Value) {
        match ctx.scopes.last_mut() {
            Some(scope) => scope.push((name.to_owned(), value)),
            None => {
                self.modules
                    .entry(ctx.module.clone())
                    .or_default()
                    .insert(name.to_owned(), value);
            }
        }
    }

    fn exec_all(&mut self, ctx: &mut Ctx, statements: &[Stmt]) -> Result<Flow, RuntimeError> {
        for stmt in statements {
            match self.exec(ctx, stmt)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, ctx: &mut Ctx, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        with_stack(|| self.exec_stmt(ctx, stmt))
    }

    fn exec_stmt(&mut self, ctx: &mut Ctx, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = stmt.line;
        }
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(ctx, expr)?;
                Ok(Flow::Next)
            }
            StmtKind::Var { name, init } => {
                let value = match init {
                    Some(init) => self.eval(ctx, init)?,
                    None => Value::Null,
                };
                self.define(ctx, name, value);
                Ok(Flow::Next)
            }
            StmtKind::Block(statements) => {
                ctx.scopes.push(Vec::new());
                let flow = self.exec_all(ctx, statements);
                ctx.scopes.pop();
                flow
            }
            StmtKind::If {
                condition,
                then,
                otherwise,
            } => {
                if !self.eval(ctx, condition)?.is_falsy() {
                    self.exec(ctx, then)
                } else if let Some(otherwise) = otherwise {
                    self.exec(ctx, otherwise)
                } else {
                    Ok(Flow::Next)
                }
            }
            StmtKind::While { condition, body } => {
                while !self.eval(ctx, condition)?.is_falsy() {
                    match self.exec(ctx, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                Ok(Flow::Next)
            }
            StmtKind::For {
                name,
                sequence,
                body,
            } => {
                let sequence = self.eval(ctx, sequence)?;
                ctx.scopes.push(vec![(name.clone(), Value::Null)]);
                let flow = self.run_for(ctx, sequence, body);
                ctx.scopes.pop();
                flow
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(ctx, value)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Class(decl) => {
                let class = self.define_class(ctx, decl)?;
                self.define(ctx, &decl.name, Value::Class(class));
                Ok(Flow::Next)
            }
            StmtKind::Import { module, names } => {
                self.import(ctx, module, names)?;
                Ok(Flow::Next)
            }
        }
    }

    /// Drives the `iterate(_)` / `iteratorValue(_)` protocol. The loop
    /// variable lives in the innermost scope.
    fn run_for(&mut self, ctx: &mut Ctx, sequence: Value, body: &Stmt) -> Result<Flow, RuntimeError> {
        let mut iterator = Value::Null;
        loop {
            iterator = self.call_method(sequence.clone(), "iterate(_)", &[iterator])?;
            if iterator.is_falsy() {
                return Ok(Flow::Next);
            }
            let value =
                self.call_method(sequence.clone(), "iteratorValue(_)", &[iterator.clone()])?;
            if let Some(slot) = ctx.scopes.last_mut().and_then(|scope| scope.first_mut()) {
                slot.1 = value;
            }
            match self.exec(ctx, body)? {
                Flow::Break => return Ok(Flow::Next),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Next | Flow::Continue => {}
            }
        }
    }

    fn define_class(&mut self, ctx: &mut Ctx, decl: &ClassDecl) -> Result<Arc<Class>, RuntimeError> {
        let superclass = match &decl.superclass {
            Some(expr) => match self.eval(ctx, expr)? {
                Value::Class(class) => class,
                _ => {
                    return Err(self.error(format!(
                        "Class '{}' cannot inherit from a non-class object.",
                        decl.name
                    )));
                }
            },
            None => self.core.object.clone(),
        };
        if self.core.is_sealed(&superclass) {
            return Err(self.error(format!(
                "Class '{}' cannot inherit from built-in class '{}'.",
                decl.name, superclass.name
            )));
        }
        if superclass.foreign.is_some() {
            return Err(self.error(format!(
                "Class '{}' cannot inherit from foreign class '{}'.",
                decl.name, superclass.name
            )));
        }

        let scope = Arc::new(ClassScope {
            name: decl.name.clone(),
            superclass: Some(superclass.clone()),
            static_fields: Mutex::new(HashMap::new()),
        });
        let (mut methods, mut statics) = if ctx.module == CORE_MODULE {
            builtins::primitives_for(&decl.name)
        } else {
            (HashMap::new(), HashMap::new())
        };

        let foreign = if decl.foreign {
            Some(self.bind_class(&ctx.module, &decl.name)?)
        } else {
            None
        };

        for method in &decl.methods {
            let bound = if method.foreign {
                let is_static = method.kind == MethodKind::Static;
                match self.host.bind_foreign_method(
                    self.id,
                    &ctx.module,
                    &decl.name,
                    is_static,
                    &method.signature,
                ) {
                    Some(foreign) => Method::Foreign(foreign),
                    None => {
                        return Err(self.error(format!(
                            "Could not find foreign method '{}' for class {} in module '{}'.",
                            method.signature, decl.name, ctx.module
                        )));
                    }
                }
            } else {
                let Some(body) = &method.body else {
                    continue;
                };
                let script = Arc::new(ScriptMethod {
                    scope: scope.clone(),
                    module: ctx.module.clone(),
                    kind: method.kind,
                    name: method.name.clone(),
                    signature: method.signature.clone(),
                    params: method.params.clone(),
                    body: body.clone(),
                    line: method.line,
                });
                match method.kind {
                    MethodKind::Construct => Method::Constructor(script),
                    _ => Method::Script(script),
                }
            };
            match method.kind {
                MethodKind::Instance => methods.insert(method.signature.clone(), bound),
                MethodKind::Static | MethodKind::Construct => {
                    statics.insert(method.signature.clone(), bound)
                }
            };
        }

        Ok(Arc::new(Class {
            name: decl.name.clone(),
            module: ctx.module.clone(),
            superclass: Some(superclass),
            methods,
            statics,
            foreign,
            scope,
        }))
    }

    fn bind_class(&self, module: &str, name: &str) -> Result<ForeignClassFns, RuntimeError> {
        self.host
            .bind_foreign_class(self.id, module, name)
            .ok_or_else(|| {
                self.error(format!(
                    "Could not find foreign allocator for class {name} in module '{module}'."
                ))
            })
    }

    fn import(&mut self, ctx: &mut Ctx, module: &str, names: &[ImportName]) -> Result<(), RuntimeError> {
        if !self.modules.contains_key(module) {
            let Some(program) = self.compiled.remove(module) else {
                return Err(self.error(format!("Could not load module '{module}'.")));
            };
            self.run_module(module, &program)?;
        }
        for ImportName { name, alias } in names {
            let Some(value) = self.modules.get(module).and_then(|vars| vars.get(name)).cloned()
            else {
                return Err(self.error(format!(
                    "Could not find a variable named '{name}' in module '{module}'."
                )));
            };
            self.define(ctx, alias.as_deref().unwrap_or(name), value);
        }
        Ok(())
    }

    /// Executes `program` at the top level of `module`, reusing the
    /// module's variables if it has run before.
    fn run_module(&mut self, module: &str, program: &Program) -> Result<(), RuntimeError> {
        self.modules.entry(module.to_owned()).or_default();
        let mut ctx = Ctx::module(module);
        self.frames.push(TraceFrame {
            module: module.to_owned(),
            line: 1,
            name: "(script)".to_owned(),
        });
        let result = self.exec_all(&mut ctx, &program.statements);
        self.frames.pop();
        result.map(|_| ())
    }

    /// Parses `source` and every module it imports that is not already
    /// known. Errors are reported through the host.
    fn compile(&mut self, module: &str, source: &str) -> Option<Arc<Program>> {
        let program = match parse(source) {
            Ok(program) => Arc::new(program),
            Err(err) => {
                self.report_compile(module, &err);
                return None;
            }
        };

        let mut fresh: HashMap<String, Arc<Program>> = HashMap::new();
        let mut queue = vec![(module.to_owned(), program.clone())];
        while let Some((importer, parsed)) = queue.pop() {
            for (name, line) in parsed.imports() {
                if name == module
                    || self.modules.contains_key(&name)
                    || self.compiled.contains_key(&name)
                    || fresh.contains_key(&name)
                {
                    continue;
                }
                let Some(source) = self.host.load_module(self.id, &name) else {
                    let err = CompileError::new(line, format!("Could not load module '{name}'."));
                    self.report_compile(&importer, &err);
                    return None;
                };
                match parse(&source) {
                    Ok(imported) => {
                        let imported = Arc::new(imported);
                        fresh.insert(name.clone(), imported.clone());
                        queue.push((name, imported));
                    }
                    Err(err) => {
                        self.report_compile(&name, &err);
                        return None;
                    }
                }
            }
        }
        self.compiled.extend(fresh);
        Some(program)
    }

    fn report_compile(&self, module: &str, err: &CompileError) {
        let line = i32::try_from(err.line).unwrap_or(i32::MAX);
        self.host
            .error(self.id, codes::ERROR_COMPILE, Some(module), line, &err.message);
    }

    fn report_runtime(&mut self, err: RuntimeError) {
        let message = match &err.value {
            Value::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => format!("{other:?}"),
        };
        self.host
            .error(self.id, codes::ERROR_RUNTIME, None, -1, &message);
        for frame in &err.trace {
            let line = i32::try_from(frame.line).unwrap_or(i32::MAX);
            self.host.error(
                self.id,
                codes::ERROR_STACK_TRACE,
                Some(&frame.module),
                line,
                &frame.name,
            );
        }
    }

    fn slot(&self, slot: usize) -> Option<&Value> {
        let value = self.slots.get(slot);
        if value.is_none() {
            log::warn!("vm {}: slot {slot} is out of range ({})", self.id, self.slots.len());
        }
        value
    }

    fn store(&mut self, slot: usize, value: Value) {
        match self.slots.get_mut(slot) {
            Some(target) => *target = value,
            None => log::warn!("vm {}: write to slot {slot} is out of range", self.id),
        }
    }

    fn list_in(&self, slot: usize) -> Option<Arc<Mutex<Vec<Value>>>> {
        match self.slot(slot)? {
            Value::List(list) => Some(list.clone()),
            _ => None,
        }
    }
}

/// Element index for `index` in a list of `count`, counting from the end
/// when negative.
pub(super) fn list_index(count: usize, index: isize) -> Option<usize> {
    let resolved = if index < 0 {
        count as isize + index
    } else {
        index
    };
    (0..count as isize)
        .contains(&resolved)
        .then_some(resolved as usize)
}

/// Insertion point for `index`; `-1` appends.
fn insert_index(count: usize, index: isize) -> Option<usize> {
    let resolved = if index < 0 {
        count as isize + 1 + index
    } else {
        index
    };
    (0..=count as isize)
        .contains(&resolved)
        .then_some(resolved as usize)
}

impl NativeVm for WrenVm {
    fn id(&self) -> VmId {
        self.id
    }

    fn interpret(&mut self, module: &CStr, source: &CStr) -> i32 {
        let module = module.to_string_lossy().into_owned();
        let source = source.to_string_lossy();
        let Some(program) = self.compile(&module, &source) else {
            return codes::RESULT_COMPILE_ERROR;
        };
        match self.run_module(&module, &program) {
            Ok(()) => codes::RESULT_SUCCESS,
            Err(err) => {
                self.report_runtime(err);
                codes::RESULT_RUNTIME_ERROR
            }
        }
    }

    fn ensure_slots(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize(count, Value::Null);
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_type(&self, slot: usize) -> i32 {
        match self.slot(slot) {
            Some(Value::Bool(_)) => codes::TYPE_BOOL,
            Some(Value::Num(_)) => codes::TYPE_NUM,
            Some(Value::Foreign(_)) => codes::TYPE_FOREIGN,
            Some(Value::List(_)) => codes::TYPE_LIST,
            Some(Value::Null) => codes::TYPE_NULL,
            Some(Value::Str(_)) => codes::TYPE_STRING,
            _ => codes::TYPE_UNKNOWN,
        }
    }

    fn get_slot_bool(&self, slot: usize) -> Option<bool> {
        match self.slot(slot)? {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn set_slot_bool(&mut self, slot: usize, value: bool) {
        self.store(slot, Value::Bool(value));
    }

    fn get_slot_double(&self, slot: usize) -> Option<f64> {
        match self.slot(slot)? {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    fn set_slot_double(&mut self, slot: usize, value: f64) {
        self.store(slot, Value::Num(value));
    }

    fn get_slot_string(&self, slot: usize) -> Option<&[u8]> {
        match self.slot(slot)? {
            Value::Str(bytes) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Some(&bytes[..end])
            }
            _ => None,
        }
    }

    fn set_slot_string(&mut self, slot: usize, text: &CStr) {
        self.store(slot, Value::Str(text.to_bytes().into()));
    }

    fn get_slot_bytes(&self, slot: usize) -> Option<&[u8]> {
        match self.slot(slot)? {
            Value::Str(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }

    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        self.store(slot, Value::Str(bytes.into()));
    }

    fn set_slot_null(&mut self, slot: usize) {
        self.store(slot, Value::Null);
    }

    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignStorage> {
        match self.slot(slot)? {
            Value::Foreign(object) => Some(object.storage.clone()),
            _ => None,
        }
    }

    fn set_slot_new_foreign(
        &mut self,
        slot: usize,
        class_slot: usize,
        size: usize,
    ) -> Option<ForeignStorage> {
        let class = match self.slot(class_slot)? {
            Value::Class(class) if class.foreign.is_some() => class.clone(),
            _ => {
                log::warn!("vm {}: slot {class_slot} does not hold a foreign class", self.id);
                return None;
            }
        };
        if slot >= self.slots.len() {
            log::warn!("vm {}: write to slot {slot} is out of range", self.id);
            return None;
        }
        let object = Arc::new(ForeignObject::new(class, size));
        let storage = object.storage.clone();
        self.store(slot, Value::Foreign(object));
        Some(storage)
    }

    fn set_slot_new_list(&mut self, slot: usize) {
        self.store(slot, Value::list(Vec::new()));
    }

    fn get_list_count(&self, slot: usize) -> Option<usize> {
        self.list_in(slot).map(|list| list.lock().len())
    }

    fn get_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        let Some(list) = self.list_in(list_slot) else {
            return;
        };
        let element = {
            let items = list.lock();
            list_index(items.len(), index).map(|i| items[i].clone())
        };
        match element {
            Some(element) => self.store(element_slot, element),
            None => log::warn!("vm {}: list index {index} is out of bounds", self.id),
        }
    }

    fn set_list_element(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        let (Some(list), Some(element)) = (self.list_in(list_slot), self.slot(element_slot).cloned())
        else {
            return;
        };
        let mut items = list.lock();
        match list_index(items.len(), index) {
            Some(i) => items[i] = element,
            None => log::warn!("vm {}: list index {index} is out of bounds", self.id),
        }
    }

    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        let (Some(list), Some(element)) = (self.list_in(list_slot), self.slot(element_slot).cloned())
        else {
            return;
        };
        let mut items = list.lock();
        match insert_index(items.len(), index) {
            Some(i) => items.insert(i, element),
            None => log::warn!("vm {}: list index {index} is out of bounds", self.id),
        }
    }

    fn get_variable(&mut self, module: &CStr, name: &CStr, slot: usize) -> bool {
        let module = module.to_string_lossy();
        let name = name.to_string_lossy();
        let Some(value) = self.modules.get(module.as_ref()).and_then(|vars| vars.get(name.as_ref()))
        else {
            return false;
        };
        if slot >= self.slots.len() {
            log::warn!("vm {}: write to slot {slot} is out of range", self.id);
            return false;
        }
        let value = value.clone();
        self.store(slot, value);
        true
    }

    fn get_slot_handle(&mut self, slot: usize) -> Option<RawHandle> {
        let value = self.slot(slot)?.clone();
        self.next_handle += 1;
        let raw = RawHandle(self.next_handle);
        self.handles.insert(raw, HandleEntry::Value(value));
        Some(raw)
    }

    fn set_slot_handle(&mut self, slot: usize, handle: RawHandle) {
        match self.handles.get(&handle) {
            Some(HandleEntry::Value(value)) => {
                let value = value.clone();
                self.store(slot, value);
            }
            Some(HandleEntry::Call(_)) => {
                log::warn!("vm {}: {handle} is a call handle, not a value", self.id)
            }
            None => log::warn!("vm {}: unknown handle {handle}", self.id),
        }
    }

    fn make_call_handle(&mut self, signature: &CStr) -> RawHandle {
        self.next_handle += 1;
        let raw = RawHandle(self.next_handle);
        let signature = signature.to_string_lossy().into_owned();
        self.handles.insert(raw, HandleEntry::Call(signature));
        raw
    }

    fn release_handle(&mut self, handle: RawHandle) {
        if self.handles.remove(&handle).is_none() {
            log::warn!("vm {}: released unknown handle {handle}", self.id);
        }
    }

    fn call(&mut self, method: RawHandle) -> i32 {
        let Some(HandleEntry::Call(signature)) = self.handles.get(&method).cloned() else {
            log::warn!("vm {}: {method} is not a call handle", self.id);
            return codes::RESULT_RUNTIME_ERROR;
        };
        let arity = signature_arity(&signature);
        if self.slots.len() <= arity {
            let err = self.error(format!(
                "Calling '{signature}' needs {} slots.",
                arity + 1
            ));
            self.report_runtime(err);
            return codes::RESULT_RUNTIME_ERROR;
        }
        let receiver = self.slots[0].clone();
        let args = self.slots[1..=arity].to_vec();
        match self.call_method(receiver, &signature, &args) {
            Ok(result) => {
                self.slots[0] = result;
                codes::RESULT_SUCCESS
            }
            Err(err) => {
                self.report_runtime(err);
                codes::RESULT_RUNTIME_ERROR
            }
        }
    }

    fn collect_garbage(&mut self) {
        // Objects are reference counted and already reclaimed; only the
        // parsed-but-unrun imports are dropped here.
        let pending = self.compiled.len();
        self.compiled.clear();
        log::trace!("vm {}: collect_garbage dropped {pending} pending modules", self.id);
    }

    fn abort_fiber(&mut self, slot: usize) {
        let value = self.slot(slot).cloned().unwrap_or(Value::Null);
        self.abort = Some(value);
    }
}

impl WrenVm {
    /// Empties every list, field table and static field table reachable
    /// from the VM, so objects caught in reference cycles drop and their
    /// finalizers run.
    fn release_all(&mut self) {
        let mut pending: Vec<Value> = self
            .modules
            .drain()
            .flat_map(|(_, vars)| vars.into_values())
            .collect();
        pending.append(&mut self.slots);
        pending.extend(self.handles.drain().filter_map(|(_, entry)| match entry {
            HandleEntry::Value(value) => Some(value),
            HandleEntry::Call(_) => None,
        }));
        pending.extend(self.abort.take());

        // Containers are emptied on first visit, so cycles end the walk.
        while let Some(value) = pending.pop() {
            match value {
                Value::List(list) => pending.append(&mut list.lock()),
                Value::Instance(instance) => {
                    let fields = std::mem::take(&mut *instance.fields.lock());
                    pending.extend(fields.into_values());
                    pending.push(Value::Class(instance.class.clone()));
                }
                Value::Foreign(object) => pending.push(Value::Class(object.class.clone())),
                Value::Class(class) => {
                    let statics = std::mem::take(&mut *class.scope.static_fields.lock());
                    pending.extend(statics.into_values());
                    if let Some(superclass) = &class.superclass {
                        pending.push(Value::Class(superclass.clone()));
                    }
                }
                _ => {}
            }
        }
    }
}

impl Drop for WrenVm {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            log::debug!(
                "vm {}: torn down with {} engine handles",
                self.id,
                self.handles.len()
            );
        }
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        output: Mutex<String>,
        errors: Mutex<Vec<(i32, Option<String>, i32, String)>>,
        modules: HashMap<String, String>,
    }

    impl HostCallbacks for Recorder {
        fn write(&self, _vm: VmId, text: &str) {
            self.output.lock().push_str(text);
        }

        fn error(&self, _vm: VmId, kind: i32, module: Option<&str>, line: i32, message: &str) {
            self.errors
                .lock()
                .push((kind, module.map(str::to_owned), line, message.to_owned()));
        }

        fn bind_foreign_method(
            &self,
            _vm: VmId,
            _module: &str,
            _class_name: &str,
            _is_static: bool,
            _signature: &str,
        ) -> Option<ForeignFn> {
            None
        }

        fn bind_foreign_class(&self, _vm: VmId, _module: &str, _class_name: &str) -> Option<ForeignClassFns> {
            None
        }

        fn load_module(&self, _vm: VmId, name: &str) -> Option<String> {
            self.modules.get(name).cloned()
        }
    }

    fn engine_vm(host: Arc<Recorder>) -> WrenVm {
        let mut vm = WrenVm::new(VmId(0), host, EngineCreateInfo::default());
        let prelude = parse(builtins::PRELUDE).unwrap();
        vm.load_prelude(&prelude).unwrap();
        vm
    }

    fn run(source: &str) -> (i32, String, Vec<(i32, Option<String>, i32, String)>) {
        let host = Arc::new(Recorder::default());
        let mut vm = engine_vm(host.clone());
        let source = CString::new(source).unwrap();
        let result = vm.interpret(c"main", &source);
        let output = host.output.lock().clone();
        let errors = host.errors.lock().clone();
        (result, output, errors)
    }

    #[test]
    fn classes_fields_and_inheritance() {
        let source = r#"
class Animal {
  construct new(name) { _name = name }
  name { _name }
  speak() { "..." }
  describe() { name + " says " + speak() }
}
class Dog is Animal {
  construct new(name) { super(name) }
  speak() { "woof" }
}
System.print(Dog.new("rex").describe())
System.print(Dog.new("rex") is Animal)
"#;
        let (result, output, errors) = run(source);
        assert_eq!(result, codes::RESULT_SUCCESS, "{errors:?}");
        assert_eq!(output, "rex says woof\ntrue\n");
    }

    #[test]
    fn loops_and_lists() {
        let source = r#"
var total = 0
for (i in 1..4) total = total + i
var items = []
var n = 0
while (true) {
  n = n + 1
  if (n > 3) break
  items.add(n * n)
}
System.print("%(total) %(items)")
"#;
        let (result, output, _) = run(source);
        assert_eq!(result, codes::RESULT_SUCCESS);
        assert_eq!(output, "10 [1, 4, 9]\n");
    }

    #[test]
    fn static_fields_are_shared_by_the_class() {
        let source = r#"
class Counter {
  static bump() {
    __count = (__count == null ? 0 : __count) + 1
    return __count
  }
}
Counter.bump()
System.print(Counter.bump())
"#;
        let (_, output, _) = run(source);
        assert_eq!(output, "2\n");
    }

    #[test]
    fn undefined_variables_fail_at_runtime() {
        let (result, _, errors) = run("System.print(missing)");
        assert_eq!(result, codes::RESULT_RUNTIME_ERROR);
        assert_eq!(errors[0].3, "Variable 'missing' is not defined.");
        assert_eq!(errors[0].2, -1);
    }

    #[test]
    fn unknown_methods_name_the_receiver_class() {
        let (_, _, errors) = run("true.frob");
        assert_eq!(errors[0].3, "Bool does not implement 'frob'.");
    }

    #[test]
    fn deep_recursion_overflows() {
        let source = "class R {\n  static go(n) { R.go(n + 1) }\n}\nR.go(0)";
        let (result, _, errors) = run(source);
        assert_eq!(result, codes::RESULT_RUNTIME_ERROR);
        assert_eq!(errors[0].3, "Stack overflow.");
    }

    #[test]
    fn printing_a_self_containing_list_overflows() {
        let (result, _, errors) = run("var l = [1]\nl.add(l)\nSystem.print(l)");
        assert_eq!(result, codes::RESULT_RUNTIME_ERROR);
        assert_eq!(errors[0].3, "Stack overflow.");
    }

    #[test]
    fn compile_errors_in_imports_name_the_imported_module() {
        let mut modules = HashMap::new();
        modules.insert("bad".to_owned(), "var = ".to_owned());
        let host = Arc::new(Recorder {
            modules,
            ..Recorder::default()
        });
        let mut vm = engine_vm(host.clone());
        let result = vm.interpret(c"main", c"import \"bad\"");
        assert_eq!(result, codes::RESULT_COMPILE_ERROR);
        let errors = host.errors.lock();
        assert_eq!(errors[0].0, codes::ERROR_COMPILE);
        assert_eq!(errors[0].1.as_deref(), Some("bad"));
    }

    #[test]
    fn imported_modules_run_once() {
        let mut modules = HashMap::new();
        modules.insert("once".to_owned(), "System.print(\"loaded\")\nvar X = 1".to_owned());
        let host = Arc::new(Recorder {
            modules,
            ..Recorder::default()
        });
        let mut vm = engine_vm(host.clone());
        assert_eq!(vm.interpret(c"a", c"import \"once\" for X"), codes::RESULT_SUCCESS);
        assert_eq!(vm.interpret(c"b", c"import \"once\" for X as Y\nSystem.print(Y)"), codes::RESULT_SUCCESS);
        assert_eq!(*host.output.lock(), "loaded\n1\n");
    }

    #[test]
    fn list_indices_count_from_the_end() {
        assert_eq!(list_index(3, -1), Some(2));
        assert_eq!(list_index(3, 3), None);
        assert_eq!(list_index(3, -4), None);
        assert_eq!(insert_index(2, -1), Some(2));
        assert_eq!(insert_index(2, -3), Some(0));
        assert_eq!(insert_index(2, 3), None);
    }
}
