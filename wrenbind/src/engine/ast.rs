use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(Arc<[u8]>),
    /// Literal pieces interleaved with expressions, joined via `toString`.
    Interpolation(Vec<Expr>),
    List(Vec<Expr>),
    This,
    /// A bare name: local, implicit `this` call, or module variable.
    Name(String),
    Field(String),
    StaticField(String),
    Call {
        receiver: Box<Expr>,
        signature: String,
        args: Vec<Expr>,
    },
    /// A bare `name(args)` inside a class body, sent to `this`.
    SelfCall {
        signature: String,
        args: Vec<Expr>,
    },
    /// `super.name(args)`, or `super(args)` with the enclosing method's
    /// name.
    SuperCall {
        signature: Option<String>,
        args: Vec<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Var {
        name: String,
        init: Option<Expr>,
    },
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    For {
        name: String,
        sequence: Expr,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Class(Arc<ClassDecl>),
    Import {
        module: String,
        names: Vec<ImportName>,
    },
}

#[derive(Debug, Clone)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<Expr>,
    pub foreign: bool,
    pub methods: Vec<MethodDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Instance,
    Static,
    Construct,
}

#[derive(Debug)]
pub struct MethodDecl {
    pub kind: MethodKind,
    pub foreign: bool,
    /// Bare name as written, e.g. `add` or `+` or `[_]`.
    pub name: String,
    pub signature: String,
    pub params: Vec<String>,
    pub body: Option<Arc<Body>>,
    pub line: usize,
}

#[derive(Debug)]
pub enum Body {
    /// A one-line body whose value is returned.
    Expr(Expr),
    Block(Vec<Stmt>),
}

/// A parsed module, in source order.
#[derive(Debug, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    /// Modules named by `import` statements anywhere in the program, with
    /// the line of the first import of each.
    pub fn imports(&self) -> Vec<(String, usize)> {
        let mut found = Vec::new();
        collect_imports(&self.statements, &mut found);
        found
    }
}

fn collect_imports(statements: &[Stmt], found: &mut Vec<(String, usize)>) {
    for stmt in statements {
        match &stmt.kind {
            StmtKind::Import { module, .. } => {
                if !found.iter().any(|(name, _)| name == module) {
                    found.push((module.clone(), stmt.line));
                }
            }
            StmtKind::Block(inner) => collect_imports(inner, found),
            StmtKind::If { then, otherwise, .. } => {
                collect_imports(std::slice::from_ref(then), found);
                if let Some(otherwise) = otherwise {
                    collect_imports(std::slice::from_ref(otherwise), found);
                }
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
                collect_imports(std::slice::from_ref(body), found)
            }
            _ => {}
        }
    }
}

/// `name`, `name(_,_)`, `name=(_)`, `[_,_]`, `[_]=(_)`.
pub fn signature(name: &str, arity: usize, kind: SignatureKind) -> String {
    let params = vec!["_"; arity].join(",");
    match kind {
        SignatureKind::Getter => name.to_owned(),
        SignatureKind::Method => format!("{name}({params})"),
        SignatureKind::Setter => format!("{name}=(_)"),
        SignatureKind::Subscript => format!("[{params}]"),
        SignatureKind::SubscriptSetter => format!("[{params}]=(_)"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Getter,
    Method,
    Setter,
    Subscript,
    SubscriptSetter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures() {
        assert_eq!(signature("add", 2, SignatureKind::Method), "add(_,_)");
        assert_eq!(signature("call", 0, SignatureKind::Method), "call()");
        assert_eq!(signature("count", 0, SignatureKind::Getter), "count");
        assert_eq!(signature("value", 1, SignatureKind::Setter), "value=(_)");
        assert_eq!(signature("", 2, SignatureKind::Subscript), "[_,_]");
        assert_eq!(signature("", 1, SignatureKind::SubscriptSetter), "[_]=(_)");
    }
}
