//! NWScript source text for reconstructed programs.

use crate::ast::{Expr, Literal, Stmt};
use crate::reconstruct::{Program, Routine};

/// Text left in place of a routine that could not be reconstructed.
pub const FAILED_ROUTINE: &str = "decompilation failed for this routine";

/// Marks a deferred action holding more than one statement. The language
/// only accepts a single call there, so such output does not recompile.
pub const DEFERRED_BLOCK: &str = "/* deferred block */";

const INDENT: usize = 4;

const OBJECT_SELF: i32 = 0;
const OBJECT_INVALID: i32 = 0x7f00_0000;

fn binary_prec(op: &str) -> u8 {
    match op {
        "|" => 4,
        "^" => 5,
        "&" => 6,
        "==" | "!=" => 7,
        "<" | "<=" | ">" | ">=" => 8,
        "<<" | ">>" | ">>>" => 9,
        "+" | "-" => 10,
        "*" | "/" | "%" => 11,
        _ => 12,
    }
}

fn prec(e: &Expr) -> u8 {
    match e {
        Expr::Assign { .. } => 1,
        Expr::Logical { op, .. } => {
            if *op == "||" {
                2
            } else {
                3
            }
        }
        Expr::Binary { op, .. } => binary_prec(op),
        Expr::Unary { .. } | Expr::IncDec { .. } => 12,
        Expr::Const(Literal::Int(v)) if *v < 0 => 12,
        Expr::Const(Literal::Float(v)) if v.is_sign_negative() => 12,
        _ => 13,
    }
}

fn wrap(e: &Expr, min: u8) -> String {
    let s = expr(e);
    if prec(e) < min { format!("({s})") } else { s }
}

/// Largest finite `float`, standing in for infinities.
const FLOAT_MAX: &str = "3.4028235e38";

fn float(v: f32) -> String {
    if v.is_nan() {
        return "/* NaN */ 0.0".into();
    }
    if v.is_infinite() {
        let sign = if v < 0.0 { "-" } else { "" };
        return format!("/* {sign}inf */ {sign}{FLOAT_MAX}");
    }
    let s = v.to_string();
    if s.contains('.') { s } else { format!("{s}.0") }
}

fn string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn literal(l: &Literal) -> String {
    match l {
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) => float(*v),
        Literal::String(s) => string(s),
        Literal::Object(OBJECT_SELF) => "OBJECT_SELF".into(),
        Literal::Object(1 | OBJECT_INVALID) => "OBJECT_INVALID".into(),
        Literal::Object(v) => v.to_string(),
    }
}

fn deferred(body: &[Stmt]) -> String {
    match body {
        [Stmt::Expr(e)] => expr(e),
        _ => {
            let inner: Vec<String> = body.iter().map(|s| stmts_to_string(std::slice::from_ref(s), 0)).collect();
            format!("{DEFERRED_BLOCK} {{ {} }}", inner.concat().replace('\n', " ").trim_end())
        }
    }
}

/// Renders one expression.
pub fn expr(e: &Expr) -> String {
    match e {
        Expr::Const(l) => literal(l),
        Expr::Var { name, .. } => name.clone(),
        Expr::Member { base, field } => format!("{}.{field}", wrap(base, 13)),
        Expr::Unary { op, expr: inner } => {
            let s = wrap(inner, 12);
            if s.starts_with(op) { format!("{op}({s})") } else { format!("{op}{s}") }
        }
        Expr::Binary { op, lhs, rhs } | Expr::Logical { op, lhs, rhs } => {
            let p = prec(e);
            format!("{} {op} {}", wrap(lhs, p), wrap(rhs, p + 1))
        }
        Expr::Call { name, args, .. } => {
            let args: Vec<String> = args.iter().map(expr).collect();
            format!("{name}({})", args.join(", "))
        }
        Expr::Vector(items) => {
            let items: Vec<String> = items.iter().map(expr).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Assign { target, value } => format!("{} = {}", expr(target), wrap(value, 1)),
        Expr::IncDec { target, op } => format!("{}{op}", wrap(target, 13)),
        Expr::Deferred(body) => deferred(body),
    }
}

/// A statement that fits a `for` header, without its semicolon.
fn simple(s: &Stmt) -> String {
    match s {
        Stmt::Decl { ty, name, init: Some(v) } => format!("{ty} {name} = {}", expr(v)),
        Stmt::Decl { ty, name, init: None } => format!("{ty} {name}"),
        Stmt::Assign { target, value } => format!("{} = {}", expr(target), expr(value)),
        Stmt::Expr(e) => expr(e),
        other => stmts_to_string(std::slice::from_ref(other), 0).trim_end().trim_end_matches(';').to_string(),
    }
}

fn push_if(out: &mut String, pad: &str, indent: usize, cond: &Expr, then_body: &[Stmt], else_body: &[Stmt]) {
    out.push_str(&format!("if ({}) {{\n", expr(cond)));
    out.push_str(&stmts_to_string(then_body, indent + INDENT));
    match else_body {
        [] => out.push_str(&format!("{pad}}}\n")),
        [Stmt::If {
            cond,
            then_body,
            else_body,
        }] => {
            out.push_str(&format!("{pad}}} else "));
            push_if(out, pad, indent, cond, then_body, else_body);
        }
        _ => {
            out.push_str(&format!("{pad}}} else {{\n"));
            out.push_str(&stmts_to_string(else_body, indent + INDENT));
            out.push_str(&format!("{pad}}}\n"));
        }
    }
}

pub fn stmts_to_string(stmts: &[Stmt], indent: usize) -> String {
    let mut out = String::new();
    let pad = " ".repeat(indent);
    for (k, s) in stmts.iter().enumerate() {
        match s {
            Stmt::Decl { .. } | Stmt::Assign { .. } | Stmt::Expr(_) => out.push_str(&format!("{pad}{};\n", simple(s))),
            Stmt::Return(Some(v)) => out.push_str(&format!("{pad}return {};\n", expr(v))),
            Stmt::Return(None) => out.push_str(&format!("{pad}return;\n")),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                out.push_str(&pad);
                push_if(&mut out, &pad, indent, cond, then_body, else_body);
            }
            Stmt::While { cond, body } => {
                out.push_str(&format!("{pad}while ({}) {{\n", expr(cond)));
                out.push_str(&stmts_to_string(body, indent + INDENT));
                out.push_str(&format!("{pad}}}\n"));
            }
            Stmt::DoWhile { body, cond } => {
                out.push_str(&format!("{pad}do {{\n"));
                out.push_str(&stmts_to_string(body, indent + INDENT));
                out.push_str(&format!("{pad}}} while ({});\n", expr(cond)));
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                out.push_str(&format!(
                    "{pad}for ({}; {}; {}) {{\n",
                    simple(init),
                    expr(cond),
                    simple(update)
                ));
                out.push_str(&stmts_to_string(body, indent + INDENT));
                out.push_str(&format!("{pad}}}\n"));
            }
            Stmt::Block(body) => {
                out.push_str(&format!("{pad}{{\n"));
                out.push_str(&stmts_to_string(body, indent + INDENT));
                out.push_str(&format!("{pad}}}\n"));
            }
            Stmt::Break => out.push_str(&format!("{pad}break;\n")),
            Stmt::Continue => out.push_str(&format!("{pad}continue;\n")),
            Stmt::Goto(t) => out.push_str(&format!("{pad}goto L{t};\n")),
            // A label must precede a statement.
            Stmt::Label(t) if k + 1 == stmts.len() => out.push_str(&format!("{pad}L{t}: ;\n")),
            Stmt::Label(t) => out.push_str(&format!("{pad}L{t}:\n")),
        }
    }
    out
}

fn header(r: &Routine) -> String {
    let params: Vec<String> = r.params.iter().map(|(ty, name)| format!("{ty} {name}")).collect();
    format!("{} {}({})", r.returns, r.name, params.join(", "))
}

/// Renders a whole program: globals, prototypes, then every routine in
/// address order.
pub fn program(p: &Program) -> String {
    let mut out = String::new();
    if let Some(e) = &p.globals_error {
        out.push_str(&format!("// globals: {FAILED_ROUTINE} ({e})\n"));
    }
    if !p.globals.is_empty() {
        out.push_str(&stmts_to_string(&p.globals, 0));
        out.push('\n');
    }

    let prototypes: Vec<String> = p
        .routines
        .iter()
        .enumerate()
        .filter(|(k, _)| Some(*k) != p.main)
        .filter_map(|(_, r)| r.outcome.as_ref().ok())
        .map(|r| format!("{};\n", header(r)))
        .collect();
    if !prototypes.is_empty() {
        out.push_str(&prototypes.concat());
        out.push('\n');
    }

    for (k, r) in p.routines.iter().enumerate() {
        if k > 0 {
            out.push('\n');
        }
        match &r.outcome {
            Ok(routine) => {
                out.push_str(&format!("{} {{\n", header(routine)));
                out.push_str(&stmts_to_string(&routine.body, INDENT));
                out.push_str("}\n");
            }
            Err(e) => out.push_str(&format!("// {}: {FAILED_ROUTINE} ({e})\n", r.name)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NcsType;

    fn var(n: &str) -> Expr {
        Expr::var(n, NcsType::Int)
    }

    fn bin(op: &'static str, l: Expr, r: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(l),
            rhs: Box::new(r),
        }
    }

    #[test]
    fn parentheses_follow_precedence() {
        let e = bin("*", bin("+", var("a"), var("b")), var("c"));
        assert_eq!(expr(&e), "(a + b) * c");
        let e = bin("-", var("a"), bin("-", var("b"), var("c")));
        assert_eq!(expr(&e), "a - (b - c)");
        let e = bin("-", bin("-", var("a"), var("b")), var("c"));
        assert_eq!(expr(&e), "a - b - c");
        let e = Expr::Logical {
            op: "&&",
            lhs: Box::new(Expr::Logical {
                op: "||",
                lhs: Box::new(var("a")),
                rhs: Box::new(var("b")),
            }),
            rhs: Box::new(var("c").not()),
        };
        assert_eq!(expr(&e), "(a || b) && !c");
    }

    #[test]
    fn literals() {
        assert_eq!(expr(&Expr::Const(Literal::Float(2.0))), "2.0");
        assert_eq!(expr(&Expr::Const(Literal::Float(0.25))), "0.25");
        assert_eq!(expr(&Expr::Const(Literal::String("say \"hi\"\n".into()))), "\"say \\\"hi\\\"\\n\"");
        assert_eq!(expr(&Expr::Const(Literal::Object(0))), "OBJECT_SELF");
        assert_eq!(expr(&Expr::Const(Literal::Object(OBJECT_INVALID))), "OBJECT_INVALID");
        let neg = Expr::Unary {
            op: "-",
            expr: Box::new(Expr::int(-3)),
        };
        assert_eq!(expr(&neg), "-(-3)");
    }

    #[test]
    fn control_characters_are_escaped() {
        let s = Expr::Const(Literal::String("a\tb\rc\u{1}\u{85}".into()));
        assert_eq!(expr(&s), "\"a\\tb\\rc\\x01\\x85\"");
    }

    #[test]
    fn non_finite_floats_stay_compilable() {
        assert_eq!(expr(&Expr::Const(Literal::Float(f32::NAN))), "/* NaN */ 0.0");
        assert_eq!(expr(&Expr::Const(Literal::Float(f32::INFINITY))), "/* inf */ 3.4028235e38");
        assert_eq!(
            expr(&Expr::Const(Literal::Float(f32::NEG_INFINITY))),
            "/* -inf */ -3.4028235e38"
        );
    }

    #[test]
    fn deferred_bodies() {
        let call = |name: &str| Stmt::Expr(Expr::Call {
            name: name.into(),
            args: vec![],
            ty: NcsType::Void,
        });
        let delay = |body: Vec<Stmt>| Expr::Call {
            name: "DelayCommand".into(),
            args: vec![Expr::Const(Literal::Float(1.0)), Expr::Deferred(body)],
            ty: NcsType::Void,
        };
        assert_eq!(expr(&delay(vec![call("f")])), "DelayCommand(1.0, f())");
        let two = expr(&delay(vec![call("f"), call("g")]));
        assert!(two.starts_with(&format!("DelayCommand(1.0, {DEFERRED_BLOCK} {{")), "{two}");
    }

    #[test]
    fn else_if_chains_are_flattened() {
        let s = Stmt::If {
            cond: var("a"),
            then_body: vec![Stmt::Return(Some(Expr::int(1)))],
            else_body: vec![Stmt::If {
                cond: var("b"),
                then_body: vec![Stmt::Return(Some(Expr::int(2)))],
                else_body: vec![Stmt::Return(None)],
            }],
        };
        let text = stmts_to_string(&[s], 0);
        assert_eq!(
            text,
            "if (a) {\n    return 1;\n} else if (b) {\n    return 2;\n} else {\n    return;\n}\n"
        );
    }

    #[test]
    fn for_header_and_trailing_label() {
        let s = Stmt::For {
            init: Box::new(Stmt::Assign {
                target: var("i"),
                value: Expr::int(0),
            }),
            cond: bin("<", var("i"), Expr::int(3)),
            update: Box::new(Stmt::Expr(Expr::IncDec {
                target: Box::new(var("i")),
                op: "++",
            })),
            body: vec![Stmt::Goto(40), Stmt::Label(40)],
        };
        let text = stmts_to_string(&[s], 0);
        assert_eq!(text, "for (i = 0; i < 3; i++) {\n    goto L40;\n    L40: ;\n}\n");
    }
}
