//! Reconstructed statements and expressions.

use crate::types::NcsType;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i32),
    Float(f32),
    String(String),
    Object(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Literal),
    Var { name: String, ty: NcsType },
    /// Component `x`, `y` or `z` of a vector.
    Member { base: Box<Expr>, field: &'static str },
    Unary { op: &'static str, expr: Box<Expr> },
    Binary { op: &'static str, lhs: Box<Expr>, rhs: Box<Expr> },
    Logical { op: &'static str, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { name: String, args: Vec<Expr>, ty: NcsType },
    /// `[x, y, z]`
    Vector(Vec<Expr>),
    Assign { target: Box<Expr>, value: Box<Expr> },
    IncDec { target: Box<Expr>, op: &'static str },
    /// Statements run later, passed as an `action` argument.
    Deferred(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Decl { ty: NcsType, name: String, init: Option<Expr> },
    Assign { target: Expr, value: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    If { cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    DoWhile { body: Vec<Stmt>, cond: Expr },
    For { init: Box<Stmt>, cond: Expr, update: Box<Stmt>, body: Vec<Stmt> },
    Block(Vec<Stmt>),
    Break,
    Continue,
    Goto(usize),
    Label(usize),
}

impl Expr {
    pub fn int(v: i32) -> Expr {
        Expr::Const(Literal::Int(v))
    }

    pub fn var(name: impl Into<String>, ty: NcsType) -> Expr {
        Expr::Var { name: name.into(), ty }
    }

    pub fn not(self) -> Expr {
        match self {
            Expr::Unary { op: "!", expr } => *expr,
            e => Expr::Unary {
                op: "!",
                expr: Box::new(e),
            },
        }
    }

    /// Whether evaluating the expression can have an effect beyond its value.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Expr::Const(_) | Expr::Var { .. } => false,
            Expr::Member { base, .. } => base.has_side_effects(),
            Expr::Unary { expr, .. } => expr.has_side_effects(),
            Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
                lhs.has_side_effects() || rhs.has_side_effects()
            }
            Expr::Vector(items) => items.iter().any(Expr::has_side_effects),
            Expr::Call { .. } | Expr::Assign { .. } | Expr::IncDec { .. } | Expr::Deferred(_) => true,
        }
    }

    pub fn contains_call(&self) -> bool {
        match self {
            Expr::Call { .. } => true,
            Expr::Const(_) | Expr::Var { .. } | Expr::Deferred(_) => false,
            Expr::Member { base, .. } => base.contains_call(),
            Expr::Unary { expr, .. } => expr.contains_call(),
            Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => lhs.contains_call() || rhs.contains_call(),
            Expr::Vector(items) => items.iter().any(Expr::contains_call),
            Expr::Assign { target, value } => target.contains_call() || value.contains_call(),
            Expr::IncDec { target, .. } => target.contains_call(),
        }
    }

    pub fn references(&self, name: &str) -> bool {
        match self {
            Expr::Var { name: n, .. } => n == name,
            Expr::Const(_) | Expr::Deferred(_) => false,
            Expr::Member { base, .. } => base.references(name),
            Expr::Unary { expr, .. } => expr.references(name),
            Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => lhs.references(name) || rhs.references(name),
            Expr::Call { args, .. } | Expr::Vector(args) => args.iter().any(|a| a.references(name)),
            Expr::Assign { target, value } => target.references(name) || value.references(name),
            Expr::IncDec { target, .. } => target.references(name),
        }
    }

    /// Name of the variable an lvalue expression designates.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Expr::Var { name, .. } => Some(name),
            Expr::Member { base, .. } => base.target_name(),
            _ => None,
        }
    }
}

impl Stmt {
    /// Variable updated by a statement usable as a `for` increment.
    pub fn counter_update(&self) -> Option<&str> {
        match self {
            Stmt::Expr(Expr::IncDec { target, .. }) => target.target_name(),
            Stmt::Assign { target, value } => {
                let name = target.target_name()?;
                value.references(name).then_some(name)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stmt::Return(_) | Stmt::Break | Stmt::Continue | Stmt::Goto(_))
    }
}

/// Folds an operator over two integer literals, or returns `None` when the
/// operands are not both integer literals or the result is undefined.
pub fn fold_int(op: &str, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
    let (Expr::Const(Literal::Int(a)), Expr::Const(Literal::Int(b))) = (lhs, rhs) else {
        return None;
    };
    let (a, b) = (*a, *b);
    let v = match op {
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "*" => a.wrapping_mul(b),
        "/" if b != 0 => a.wrapping_div(b),
        "%" if b != 0 => a.wrapping_rem(b),
        "<<" => a.wrapping_shl(b as u32),
        ">>" => a.wrapping_shr(b as u32),
        "&" => a & b,
        "|" => a | b,
        "^" => a ^ b,
        "==" => (a == b) as i32,
        "!=" => (a != b) as i32,
        "<" => (a < b) as i32,
        "<=" => (a <= b) as i32,
        ">" => (a > b) as i32,
        ">=" => (a >= b) as i32,
        _ => return None,
    };
    Some(Expr::int(v))
}

/// Merges `T x;` directly followed by `x = v;` into `T x = v;` and folds a
/// counter loop into `for` when the statement before a `while` initializes
/// the variable its body's last statement updates. Applied recursively.
pub fn tidy(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
    for s in stmts {
        let s = tidy_nested(s);
        match s {
            Stmt::Assign { target: Expr::Var { name, .. }, value }
                if matches!(out.last(), Some(Stmt::Decl { name: n, init: None, .. }) if *n == name) =>
            {
                if let Some(Stmt::Decl { init, .. }) = out.last_mut() {
                    *init = Some(value);
                }
            }
            Stmt::While { cond, mut body } => {
                let update_var = body.last().and_then(|u| u.counter_update()).map(str::to_string);
                let cond_uses = update_var.as_deref().is_some_and(|v| cond.references(v));
                let init = match (&update_var, out.last_mut()) {
                    (Some(v), Some(last)) if cond_uses && !body_continues(&body) => take_init(last, v),
                    _ => None,
                };
                match (init, body.pop()) {
                    (Some(init), Some(update)) => {
                        if matches!(out.last(), Some(Stmt::Assign { .. })) {
                            out.pop();
                        }
                        out.push(Stmt::For {
                            init: Box::new(init),
                            cond,
                            update: Box::new(update),
                            body,
                        });
                    }
                    (_, update) => {
                        body.extend(update);
                        out.push(Stmt::While { cond, body });
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// The `for` initializer for counter `var` taken from the statement before
/// the loop. A declaration keeps its name and gives up its initializer.
fn take_init(last: &mut Stmt, var: &str) -> Option<Stmt> {
    match last {
        Stmt::Assign { target, .. } if target.target_name() == Some(var) => Some(last.clone()),
        Stmt::Decl { ty, name, init } if name == var => init.take().map(|value| Stmt::Assign {
            target: Expr::var(name.clone(), *ty),
            value,
        }),
        _ => None,
    }
}

fn body_continues(body: &[Stmt]) -> bool {
    body.iter().any(|s| match s {
        Stmt::Continue => true,
        Stmt::If { then_body, else_body, .. } => body_continues(then_body) || body_continues(else_body),
        Stmt::Block(b) => body_continues(b),
        _ => false,
    })
}

fn tidy_nested(s: Stmt) -> Stmt {
    match s {
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => Stmt::If {
            cond,
            then_body: tidy(then_body),
            else_body: tidy(else_body),
        },
        Stmt::While { cond, body } => Stmt::While { cond, body: tidy(body) },
        Stmt::DoWhile { body, cond } => Stmt::DoWhile { body: tidy(body), cond },
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => Stmt::For {
            init,
            cond,
            update,
            body: tidy(body),
        },
        Stmt::Block(b) => Stmt::Block(tidy(b)),
        other => other,
    }
}

/// Goto targets referenced anywhere in `stmts`.
pub fn goto_targets(stmts: &[Stmt], out: &mut Vec<usize>) {
    for s in stmts {
        match s {
            Stmt::Goto(t) => out.push(*t),
            Stmt::If {
                then_body, else_body, ..
            } => {
                goto_targets(then_body, out);
                goto_targets(else_body, out);
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } | Stmt::Block(body) => {
                goto_targets(body, out)
            }
            _ => {}
        }
    }
}

/// Drops labels no goto refers to.
pub fn prune_labels(stmts: Vec<Stmt>, used: &[usize]) -> Vec<Stmt> {
    stmts
        .into_iter()
        .filter(|s| !matches!(s, Stmt::Label(l) if !used.contains(l)))
        .map(|s| match s {
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => Stmt::If {
                cond,
                then_body: prune_labels(then_body, used),
                else_body: prune_labels(else_body, used),
            },
            Stmt::While { cond, body } => Stmt::While {
                cond,
                body: prune_labels(body, used),
            },
            Stmt::DoWhile { body, cond } => Stmt::DoWhile {
                body: prune_labels(body, used),
                cond,
            },
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => Stmt::For {
                init,
                cond,
                update,
                body: prune_labels(body, used),
            },
            Stmt::Block(b) => Stmt::Block(prune_labels(b, used)),
            other => other,
        })
        .collect()
}
