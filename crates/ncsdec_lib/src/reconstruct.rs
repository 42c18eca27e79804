//! Lifts subroutines into statements.
//!
//! Each routine is walked once, left to right, with a symbolic copy of the
//! evaluation stack. Pushes become expressions, stores and pops become
//! statements, and recognized jump shapes become structured control flow.
//! Jumps that fit no shape fall back to `goto` and a label.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::DecompileOptions;
use crate::actions::ActionTable;
use crate::ast::{self, Expr, Literal, Stmt};
use crate::builder::NodeTree;
use crate::error::{NcsError, SubroutineError};
use crate::node::{Arena, BpOp, CmdKind, Command, CommandOp, CondKind, Constant, LogiiOp, NodeId, StackOpKind};
use crate::query;
use crate::stack::{self, Access, GlobalFrame, Signature, Slot, TypedStack};
use crate::traverse::{self, Handlers, Visit};
use crate::types::NcsType;

const FIELDS: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, Clone, PartialEq)]
enum Value {
    /// Named storage: a local, parameter or global.
    Var(String),
    Temp(Expr),
    ReturnSlot,
    SavedBp,
    /// Already consumed by a store; reading it is an error.
    Spent,
}

#[derive(Debug, Clone)]
struct State {
    stack: TypedStack<Value>,
    /// Deferred bodies waiting for the action that takes them.
    deferred: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Scope {
    brk: Option<usize>,
    cont: Option<usize>,
    /// Lifting an operand: no statements or labels may be produced.
    expr_only: bool,
}

enum Target {
    Var(Expr),
    Return,
}

/// A lifted routine.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub name: String,
    pub params: Vec<(NcsType, String)>,
    pub returns: NcsType,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub struct RoutineResult {
    pub name: String,
    pub start: usize,
    pub outcome: Result<Routine, SubroutineError>,
}

/// Everything the emitter needs for one program.
#[derive(Debug)]
pub struct Program {
    pub globals: Vec<Stmt>,
    pub globals_error: Option<SubroutineError>,
    /// Emitted routines in address order.
    pub routines: Vec<RoutineResult>,
    /// Index into `routines` of the entry routine.
    pub main: Option<usize>,
    pub conditional: bool,
}

/// Shared, read-only inputs of every routine lift.
struct Context<'a> {
    tree: &'a NodeTree,
    actions: &'a dyn ActionTable,
    signatures: &'a [Option<Signature>],
    names: &'a [String],
    globals: &'a TypedStack<Value>,
    fold_constants: bool,
}

fn command(arena: &Arena, id: NodeId) -> Option<&Command> {
    arena.unwrap_command(id)
}

fn read(slot: &Slot<Value>, pos: usize) -> Result<Expr, SubroutineError> {
    match &slot.value {
        Value::Var(name) => Ok(Expr::var(name.clone(), slot.ty)),
        Value::Temp(e) => Ok(e.clone()),
        _ => Err(SubroutineError::Unexpected {
            pos,
            what: "read of a reserved stack slot",
        }),
    }
}

fn literal(c: &Constant) -> Expr {
    Expr::Const(match c {
        Constant::Int(v) => Literal::Int(*v),
        Constant::Float(v) => Literal::Float(*v),
        Constant::String(s) => Literal::String(s.clone()),
        Constant::Object(v) => Literal::Object(*v),
    })
}

/// Reads the entries an access covers, as values to push.
fn copies(frame: &TypedStack<Value>, access: Access, pos: usize) -> Result<Vec<Slot<Value>>, SubroutineError> {
    match access {
        Access::Entries(r) => r
            .map(|i| {
                let s = frame.get(i).ok_or(SubroutineError::StackUnderflow { pos })?;
                Ok(Slot {
                    ty: s.ty,
                    width: s.width,
                    value: Value::Temp(read(s, pos)?),
                })
            })
            .collect(),
        Access::Part { entry, offset, len: 1 } => {
            let s = frame.get(entry).ok_or(SubroutineError::StackUnderflow { pos })?;
            if s.ty != NcsType::Vector {
                return Err(SubroutineError::SplitValue { pos, width: s.width });
            }
            Ok(vec![Slot {
                ty: NcsType::Float,
                width: 1,
                value: Value::Temp(Expr::Member {
                    base: Box::new(read(s, pos)?),
                    field: FIELDS[offset.min(2)],
                }),
            }])
        }
        Access::Part { entry, .. } => Err(SubroutineError::SplitValue {
            pos,
            width: frame.get(entry).map(|s| s.width).unwrap_or(0),
        }),
    }
}

/// Resolves the destination of a store.
fn target(frame: &TypedStack<Value>, access: Access, pos: usize) -> Result<Target, SubroutineError> {
    let (entry, field) = match access {
        Access::Entries(r) if r.len() == 1 => (r.start, None),
        Access::Part { entry, offset, len: 1 } => (entry, Some(FIELDS[offset.min(2)])),
        Access::Entries(r) => {
            return Err(SubroutineError::SplitValue { pos, width: r.len() });
        }
        Access::Part { entry, .. } => {
            return Err(SubroutineError::SplitValue {
                pos,
                width: frame.get(entry).map(|s| s.width).unwrap_or(0),
            });
        }
    };
    let slot = frame.get(entry).ok_or(SubroutineError::StackUnderflow { pos })?;
    match (&slot.value, field) {
        (Value::Var(name), None) => Ok(Target::Var(Expr::var(name.clone(), slot.ty))),
        (Value::Var(name), Some(field)) if slot.ty == NcsType::Vector => Ok(Target::Var(Expr::Member {
            base: Box::new(Expr::var(name.clone(), slot.ty)),
            field,
        })),
        (Value::ReturnSlot, None) => Ok(Target::Return),
        _ => Err(SubroutineError::Unexpected {
            pos,
            what: "store into a temporary",
        }),
    }
}

/// Pops `width` slots as one value. Three separate floats form a vector.
fn pop_value(st: &mut State, width: usize, pos: usize) -> Result<Expr, SubroutineError> {
    let slots = st.stack.pop_slots(width, pos)?;
    match slots.as_slice() {
        [one] => read(one, pos),
        [_, _, _] if width == 3 => Ok(Expr::Vector(
            slots.iter().map(|s| read(s, pos)).collect::<Result<_, _>>()?,
        )),
        _ => Err(SubroutineError::SplitValue { pos, width }),
    }
}

/// The top `width` slots as one value, without popping. Returns the entry
/// range they occupy.
fn peek_value(st: &State, width: usize, pos: usize) -> Result<(Expr, std::ops::Range<usize>), SubroutineError> {
    let start = st.stack.depth() as i64 - width as i64;
    match st.stack.locate(start, width, pos)? {
        Access::Entries(r) if r.len() == 1 => {
            let s = st.stack.get(r.start).ok_or(SubroutineError::StackUnderflow { pos })?;
            Ok((read(s, pos)?, r))
        }
        Access::Entries(r) if r.len() == 3 && width == 3 => {
            let items = r
                .clone()
                .map(|i| {
                    st.stack
                        .get(i)
                        .ok_or(SubroutineError::StackUnderflow { pos })
                        .and_then(|s| read(s, pos))
                })
                .collect::<Result<_, _>>()?;
            Ok((Expr::Vector(items), r))
        }
        _ => Err(SubroutineError::SplitValue { pos, width }),
    }
}

/// Keeps the side effects of discarded values as statements.
fn discard(slots: Vec<Slot<Value>>, out: &mut Vec<Stmt>) {
    for s in slots {
        if let Value::Temp(e) = s.value {
            if e.has_side_effects() {
                out.push(Stmt::Expr(e));
            }
        }
    }
}

/// Jump targets and loop back edges of one block, deferred bodies excluded.
#[derive(Debug, Default)]
struct Jumps {
    targets: HashSet<usize>,
    /// Loop head position to the position of its last back edge.
    loops: HashMap<usize, usize>,
}

fn scan_jumps(arena: &Arena, block: NodeId) -> Jumps {
    let found = RefCell::new(Jumps::default());
    let record = |a: &Arena, id: NodeId, c: &Command| {
        if let Some(t) = query::jump_destination(a, id) {
            let mut f = found.borrow_mut();
            f.targets.insert(t);
            // Reverse order: the first back edge seen is the outermost.
            if t <= c.pos {
                f.loops.entry(t).or_insert(c.pos);
            }
        }
        Visit::Continue
    };
    let mut handlers = Handlers::new()
        .on(CmdKind::StoreState, |_, _, _| Visit::SkipChildren)
        .on(CmdKind::Jump, record)
        .on(CmdKind::CondJump, record);
    traverse::walk_reversed(arena, block, &mut handlers);
    drop(handlers);
    found.into_inner()
}

struct Lifter<'a, 'c> {
    ctx: &'c Context<'a>,
    arena: &'a Arena,
    block: NodeId,
    cmds: Vec<NodeId>,
    positions: Vec<usize>,
    index: HashMap<usize, usize>,
    jumps: Jumps,
    active: HashSet<usize>,
    epilogue: usize,
    epilogue_pos: usize,
    counter: &'c Cell<u32>,
    global: bool,
}

impl<'a, 'c> Lifter<'a, 'c> {
    fn new(ctx: &'c Context<'a>, block: NodeId, counter: &'c Cell<u32>, global: bool) -> Self {
        let arena = &ctx.tree.arena;
        let cmds = arena.children(block).to_vec();
        let positions: Vec<usize> = cmds.iter().map(|id| arena.position(*id).unwrap_or(0)).collect();
        let index = positions.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        let jumps = scan_jumps(arena, block);
        let mut tail = cmds.len();
        while tail > 0 && (query::is_return(arena, cmds[tail - 1]) || query::is_kind(arena, cmds[tail - 1], CmdKind::MoveSp)) {
            tail -= 1;
        }
        // The epilogue begins where the exits land; stack fixups ahead of
        // that belong to the last branch and are lifted with it.
        let epilogue = (tail..cmds.len())
            .find(|&k| jumps.targets.contains(&positions[k]))
            .or_else(|| (tail..cmds.len()).find(|&k| query::is_return(arena, cmds[k])))
            .unwrap_or(cmds.len());
        let epilogue_pos = positions.get(epilogue).copied().unwrap_or(usize::MAX);
        Self {
            ctx,
            arena,
            block,
            jumps,
            cmds,
            positions,
            index,
            active: HashSet::new(),
            epilogue,
            epilogue_pos,
            counter,
            global,
        }
    }

    fn name_for(&self, ty: NcsType, n: u32) -> String {
        if self.global {
            format!("{}GLOB_{n}", ty.keyword())
        } else {
            format!("{}{n}", ty.keyword())
        }
    }

    fn fresh(&self, ty: NcsType) -> String {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        self.name_for(ty, n)
    }

    /// Returns the most recent name to the pool if `name` is it.
    fn release(&self, ty: NcsType, name: &str) {
        let n = self.counter.get();
        if n > 0 && self.name_for(ty, n) == name {
            self.counter.set(n - 1);
        }
    }

    fn cmd(&self, i: usize) -> Option<&'a Command> {
        self.cmds.get(i).and_then(|id| command(self.arena, *id))
    }

    fn dest(&self, i: usize) -> Option<usize> {
        self.cmds.get(i).and_then(|id| query::jump_destination(self.arena, *id))
    }

    fn is(&self, i: usize, kind: CmdKind) -> bool {
        self.cmds.get(i).is_some_and(|id| query::is_kind(self.arena, *id, kind))
    }

    fn goto(&self, t: usize, pos: usize) -> Stmt {
        if !self.index.contains_key(&t) {
            warn!(pos, target = t, "jump leaves its routine");
        } else {
            debug!(pos, target = t, "unstructured jump");
        }
        Stmt::Goto(t)
    }

    fn lift(&mut self, from: usize, to: usize, st: &mut State, scope: Scope) -> Result<Vec<Stmt>, SubroutineError> {
        let mut out = Vec::new();
        let mut i = from;
        while i < to {
            let pos = self.positions[i];
            if !scope.expr_only && !self.active.contains(&pos) && self.jumps.targets.contains(&pos) {
                out.push(Stmt::Label(pos));
            }
            if let Some(&back_pos) = self.jumps.loops.get(&pos) {
                let back = self.index.get(&back_pos).copied().unwrap_or(usize::MAX);
                if back < to && !self.active.contains(&pos) {
                    self.active.insert(pos);
                    let lifted = self.lift_loop(i, back, st, scope);
                    self.active.remove(&pos);
                    if let Some((stmt, next)) = lifted? {
                        out.push(stmt);
                        i = next;
                        continue;
                    }
                }
            }
            i = self.lift_one(i, to, st, scope, &mut out)?;
        }
        Ok(out)
    }

    fn lift_one(
        &mut self,
        i: usize,
        to: usize,
        st: &mut State,
        scope: Scope,
        out: &mut Vec<Stmt>,
    ) -> Result<usize, SubroutineError> {
        let id = self.cmds[i];
        if query::is_return(self.arena, id) {
            if !matches!(out.last(), Some(Stmt::Return(_))) {
                out.push(Stmt::Return(None));
            }
            return Ok(i + 1);
        }
        let Some(cmd) = command(self.arena, id) else {
            return Ok(i + 1);
        };
        let pos = cmd.pos;
        match &cmd.op {
            CommandOp::RsAdd(ty) => {
                if *ty == NcsType::Float && self.is_vector_decl(i, to, st) {
                    let name = self.fresh(NcsType::Vector);
                    st.stack.push(NcsType::Vector, Value::Var(name.clone()));
                    out.push(Stmt::Decl {
                        ty: NcsType::Vector,
                        name,
                        init: None,
                    });
                    return Ok(i + 3);
                }
                let name = self.fresh(*ty);
                st.stack.push(*ty, Value::Var(name.clone()));
                out.push(Stmt::Decl {
                    ty: *ty,
                    name,
                    init: None,
                });
            }
            CommandOp::Const(c) => st.stack.push(c.ty(), Value::Temp(literal(c))),
            CommandOp::CopyTopSp { offset, size } => {
                if *offset == -4 && *size == 4 {
                    if let Some(next) = self.short_circuit(i, to, st, scope)? {
                        return Ok(next);
                    }
                }
                let access = st.stack.locate_top(*offset, *size, pos)?;
                for s in copies(&st.stack, access, pos)? {
                    st.stack.push_slot(s);
                }
            }
            CommandOp::CopyTopBp { offset, size } => {
                let access = self.ctx.globals.locate_top(*offset, *size, pos)?;
                for s in copies(self.ctx.globals, access, pos)? {
                    st.stack.push_slot(s);
                }
            }
            CommandOp::CopyDownSp { offset, size } => {
                let access = st.stack.locate_top(*offset, *size, pos)?;
                let dest = target(&st.stack, access, pos)?;
                self.store(id, dest, *size as usize / 4, st, scope, out)?;
            }
            CommandOp::CopyDownBp { offset, size } => {
                let access = self.ctx.globals.locate_top(*offset, *size, pos)?;
                let dest = target(self.ctx.globals, access, pos)?;
                self.store(id, dest, *size as usize / 4, st, scope, out)?;
            }
            CommandOp::MoveSp { delta } => {
                if *delta > 0 {
                    return Err(SubroutineError::Unexpected {
                        pos,
                        what: "positive stack adjustment",
                    });
                }
                let popped = st.stack.pop_slots((-query::slot(*delta)) as usize, pos)?;
                discard(popped, out);
            }
            CommandOp::Action { id: action, argc } => self.action(*action, *argc, pos, st, out)?,
            CommandOp::Jsr { .. } => self.call(i, pos, st, out)?,
            CommandOp::Logii(op) => {
                let rhs = pop_value(st, 1, pos)?;
                let lhs = pop_value(st, 1, pos)?;
                let symbol = query::logii_symbol(*op);
                let expr = match op {
                    LogiiOp::And | LogiiOp::Or => Expr::Logical {
                        op: symbol,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    _ => self.binary(symbol, lhs, rhs, true),
                };
                st.stack.push(NcsType::Int, Value::Temp(expr));
            }
            CommandOp::Unary { op, ty } => {
                let value = pop_value(st, 1, pos)?;
                let symbol = query::unary_symbol(*op);
                let expr = match (&value, symbol) {
                    (Expr::Const(Literal::Int(v)), "-") if self.ctx.fold_constants => Expr::int(v.wrapping_neg()),
                    _ => Expr::Unary {
                        op: symbol,
                        expr: Box::new(value),
                    },
                };
                st.stack.push(*ty, Value::Temp(expr));
            }
            CommandOp::Binary { op, pair, size } => {
                let (lw, rw) = query::binary_operand_widths(*pair, *size);
                let rhs = pop_value(st, rw, pos)?;
                let lhs = pop_value(st, lw, pos)?;
                let symbol = query::binary_symbol(*op, pos)?;
                let (ty, width) = query::binary_result(*op, *pair);
                let foldable = matches!(pair, crate::types::OperandPair::II);
                let expr = self.binary(symbol, lhs, rhs, foldable);
                st.stack.push_slot(Slot {
                    ty,
                    width,
                    value: Value::Temp(expr),
                });
            }
            CommandOp::CondJump { .. } => return self.cond_jump(i, to, st, scope, out),
            CommandOp::Jump { .. } => {
                let t = self.dest(i).unwrap_or(usize::MAX);
                if Some(t) == scope.brk {
                    out.push(Stmt::Break);
                } else if Some(t) == scope.cont {
                    out.push(Stmt::Continue);
                } else if t >= self.epilogue_pos && self.index.contains_key(&t) {
                    if !matches!(out.last(), Some(Stmt::Return(_))) {
                        out.push(Stmt::Return(None));
                    }
                } else {
                    out.push(self.goto(t, pos));
                }
            }
            CommandOp::Destruct {
                size,
                exclude_offset,
                exclude_size,
            } => {
                let popped = st.stack.pop_slots(*size as usize / 4, pos)?;
                match (popped.as_slice(), *exclude_size) {
                    (_, 0) => discard(popped, out),
                    ([v], 4) if v.ty == NcsType::Vector => {
                        let base = read(v, pos)?;
                        let field = FIELDS[(*exclude_offset as usize / 4).min(2)];
                        st.stack.push(
                            NcsType::Float,
                            Value::Temp(Expr::Member {
                                base: Box::new(base),
                                field,
                            }),
                        );
                    }
                    _ => {
                        return Err(SubroutineError::Unexpected {
                            pos,
                            what: "structure destruction",
                        });
                    }
                }
            }
            CommandOp::Bp(BpOp::Save) => st.stack.push(NcsType::Int, Value::SavedBp),
            CommandOp::Bp(BpOp::Restore) => match st.stack.pop(pos)?.value {
                Value::SavedBp => {}
                _ => {
                    return Err(SubroutineError::Unexpected {
                        pos,
                        what: "base pointer restore without a save",
                    });
                }
            },
            CommandOp::StackOp { kind, offset } => {
                let bp = matches!(kind, StackOpKind::IncBp | StackOpKind::DecBp);
                let frame = if bp { self.ctx.globals } else { &st.stack };
                let access = frame.locate_top(*offset, 4, pos)?;
                let Target::Var(var) = target(frame, access, pos)? else {
                    return Err(SubroutineError::Unexpected {
                        pos,
                        what: "increment of the return slot",
                    });
                };
                let expr = Expr::IncDec {
                    target: Box::new(var.clone()),
                    op: query::stack_op_symbol(*kind),
                };
                let copied = i > 0
                    && self.is(i - 1, CmdKind::CopyTopSp)
                    && matches!(st.stack.top(), Some(Slot { value: Value::Temp(e), .. }) if *e == var);
                match st.stack.top_mut() {
                    Some(top) if copied => top.value = Value::Temp(expr),
                    _ => out.push(Stmt::Expr(expr)),
                }
            }
            CommandOp::StoreState { .. } => {
                let body = stack::deferred_body(self.arena, id).ok_or(SubroutineError::Unexpected {
                    pos,
                    what: "deferred action without a body",
                })?;
                let stmts = self.lift_closure(body, st)?;
                st.deferred.push(Expr::Deferred(stmts));
            }
        }
        Ok(i + 1)
    }

    fn binary(&self, symbol: &'static str, lhs: Expr, rhs: Expr, foldable: bool) -> Expr {
        if self.ctx.fold_constants && foldable {
            if let Some(folded) = ast::fold_int(symbol, &lhs, &rhs) {
                return folded;
            }
        }
        Expr::Binary {
            op: symbol,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn store(
        &self,
        id: NodeId,
        dest: Target,
        width: usize,
        st: &mut State,
        scope: Scope,
        out: &mut Vec<Stmt>,
    ) -> Result<(), SubroutineError> {
        let pos = self.arena.position(id).unwrap_or(0);
        let (value, range) = peek_value(st, width, pos)?;
        let single = range.len() == 1;
        match dest {
            Target::Return => {
                out.push(Stmt::Return(Some(value)));
                for i in range {
                    if let Some(s) = st.stack.get_mut(i) {
                        s.value = Value::Spent;
                    }
                }
            }
            Target::Var(var) => {
                let as_expr = scope.expr_only || !query::is_store_stack_node(self.arena, self.block, id);
                let replacement = if as_expr {
                    Value::Temp(Expr::Assign {
                        target: Box::new(var),
                        value: Box::new(value),
                    })
                } else {
                    out.push(Stmt::Assign {
                        target: var.clone(),
                        value,
                    });
                    Value::Temp(var)
                };
                if single {
                    if let Some(s) = st.stack.get_mut(range.start) {
                        s.value = replacement;
                    }
                } else {
                    for i in range {
                        if let Some(s) = st.stack.get_mut(i) {
                            s.value = Value::Spent;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn action(&self, action: u16, argc: u8, pos: usize, st: &mut State, out: &mut Vec<Stmt>) -> Result<(), SubroutineError> {
        let table = self.ctx.actions;
        let params: Vec<NcsType> = match table.param_types(action) {
            Some(p) => p.iter().copied().take(argc as usize).collect(),
            None => vec![NcsType::Int; argc as usize],
        };
        let mut args = Vec::with_capacity(params.len());
        for ty in params {
            if ty == NcsType::Action {
                args.push(st.deferred.pop().ok_or(SubroutineError::Unexpected {
                    pos,
                    what: "action argument without a deferred body",
                })?);
            } else {
                args.push(pop_value(st, ty.width(), pos)?);
            }
        }
        let name = match table.name(action) {
            Some(n) => n.to_string(),
            None => format!("action_{action}"),
        };
        let ty = table.return_type(action).unwrap_or(NcsType::Int);
        let call = Expr::Call { name, args, ty };
        if ty == NcsType::Void {
            out.push(Stmt::Expr(call));
        } else {
            st.stack.push(ty, Value::Temp(call));
        }
        Ok(())
    }

    fn call(&self, i: usize, pos: usize, st: &mut State, out: &mut Vec<Stmt>) -> Result<(), SubroutineError> {
        let target = self.dest(i).unwrap_or(usize::MAX);
        let callee = self
            .ctx
            .tree
            .subroutine_at(target)
            .ok_or(SubroutineError::UnknownSubroutine { pos, target })?;
        let sig = self
            .ctx
            .signatures
            .get(callee)
            .and_then(|s| s.as_ref())
            .ok_or(SubroutineError::Unexpected {
                pos,
                what: "call to a routine whose signature is unknown",
            })?;
        let mut args = Vec::with_capacity(sig.params.len());
        for ty in &sig.params {
            args.push(pop_value(st, ty.width(), pos)?);
        }
        let call = Expr::Call {
            name: self.ctx.names.get(callee).cloned().unwrap_or_default(),
            args,
            ty: sig.returns,
        };
        if sig.implicit_return {
            st.stack.push(sig.returns, Value::Temp(call));
        } else if sig.returns == NcsType::Void {
            out.push(Stmt::Expr(call));
        } else {
            // The caller reserved the result slot before the arguments.
            let top = st.stack.top_mut().ok_or(SubroutineError::StackUnderflow { pos })?;
            let Value::Var(name) = top.value.clone() else {
                return Err(SubroutineError::Unexpected {
                    pos,
                    what: "call result without a reserved slot",
                });
            };
            let ty = top.ty;
            top.value = Value::Temp(call);
            top.ty = sig.returns;
            if let Some(k) = out
                .iter()
                .rposition(|s| matches!(s, Stmt::Decl { name: n, init: None, .. } if *n == name))
            {
                out.remove(k);
                self.release(ty, &name);
            }
        }
        Ok(())
    }

    /// Three float reservations form a vector when the next access touching
    /// them covers all three at once.
    fn is_vector_decl(&self, i: usize, to: usize, st: &State) -> bool {
        let float = |k: usize| matches!(self.cmd(k), Some(Command { op: CommandOp::RsAdd(NcsType::Float), .. }));
        if i + 2 >= to || !float(i + 1) || !float(i + 2) {
            return false;
        }
        let low = st.stack.depth() as i64;
        let mut depth = low + 3;
        for k in i + 3..to {
            let Some(cmd) = self.cmd(k) else { return false };
            match &cmd.op {
                CommandOp::CopyDownSp { offset, size } | CommandOp::CopyTopSp { offset, size } => {
                    let start = depth + query::slot(*offset) as i64;
                    let len = *size as i64 / 4;
                    if start == low && len == 3 {
                        return true;
                    }
                    if start < low + 3 && start + len > low {
                        return false;
                    }
                    if matches!(cmd.op, CommandOp::CopyTopSp { .. }) {
                        depth += len;
                    }
                }
                CommandOp::RsAdd(t) => depth += t.width().max(1) as i64,
                CommandOp::Const(_) => depth += 1,
                CommandOp::CopyTopBp { size, .. } => depth += *size as i64 / 4,
                CommandOp::CopyDownBp { .. } | CommandOp::Unary { .. } | CommandOp::StackOp { .. } => {}
                CommandOp::MoveSp { delta } => depth += query::slot(*delta) as i64,
                CommandOp::Logii(_) => depth -= 1,
                CommandOp::Binary { op, pair, size } => {
                    let (lw, rw) = query::binary_operand_widths(*pair, *size);
                    let (_, w) = query::binary_result(*op, *pair);
                    depth += w as i64 - lw as i64 - rw as i64;
                }
                CommandOp::Action { id, argc } => {
                    let table = self.ctx.actions;
                    let popped: usize = match table.param_types(*id) {
                        Some(p) => p.iter().take(*argc as usize).map(|t| t.width()).sum(),
                        None => *argc as usize,
                    };
                    let pushed = table.return_type(*id).unwrap_or(NcsType::Int).width();
                    depth += pushed as i64 - popped as i64;
                }
                _ => return false,
            }
            if depth < low + 3 {
                return false;
            }
        }
        false
    }

    /// `a && b` and `a || b` compiled with a duplicated left operand and a
    /// jump over the right one.
    fn short_circuit(&mut self, i: usize, to: usize, st: &mut State, scope: Scope) -> Result<Option<usize>, SubroutineError> {
        let Some(Command {
            op: CommandOp::CondJump { kind, offset },
            ..
        }) = self.cmd(i + 1)
        else {
            return Ok(None);
        };
        let logii = |this: &Self, k: usize, want: LogiiOp| matches!(this.cmd(k), Some(Command { op: CommandOp::Logii(op), .. }) if *op == want);
        let join_index = |this: &Self, d: Option<usize>| d.and_then(|d| this.index.get(&d).copied()).filter(|j| *j <= to);

        let shape = match kind {
            CondKind::Zero if *offset == 2 * query::JUMP_LEN && self.is(i + 2, CmdKind::Jump) => {
                join_index(self, self.dest(i + 2)).map(|j| (i + 3, j, LogiiOp::Or))
            }
            CondKind::Zero => join_index(self, self.dest(i + 1)).map(|j| (i + 2, j, LogiiOp::And)),
            CondKind::NonZero => join_index(self, self.dest(i + 1)).map(|j| (i + 2, j, LogiiOp::Or)),
        };
        let Some((from, join, op)) = shape else {
            return Ok(None);
        };
        if join < from + 2 || !logii(self, join - 1, op) {
            return Ok(None);
        }

        let mut trial = st.clone();
        let operand = Scope {
            expr_only: true,
            ..scope
        };
        let Ok(stmts) = self.lift(from, join - 1, &mut trial, operand) else {
            return Ok(None);
        };
        if !stmts.is_empty() || trial.stack.depth() != st.stack.depth() + 1 {
            return Ok(None);
        }
        let pos = self.positions[join - 1];
        let rhs = pop_value(&mut trial, 1, pos)?;
        let lhs = pop_value(st, 1, pos)?;
        st.deferred = trial.deferred;
        st.stack.push(
            NcsType::Int,
            Value::Temp(Expr::Logical {
                op: query::logii_symbol(op),
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }),
        );
        Ok(Some(join))
    }

    fn cond_jump(
        &mut self,
        i: usize,
        to: usize,
        st: &mut State,
        scope: Scope,
        out: &mut Vec<Stmt>,
    ) -> Result<usize, SubroutineError> {
        let id = self.cmds[i];
        let pos = self.positions[i];
        let Some(Command {
            op: CommandOp::CondJump { kind, .. },
            ..
        }) = self.cmd(i)
        else {
            return Ok(i + 1);
        };
        let cond = pop_value(st, 1, pos)?;

        // Guards whose body is empty.
        let skip = if query::is_jump_to_next(self.arena, id) {
            Some(i + 1)
        } else if query::is_jz_past_one(self.arena, self.block, id) {
            Some(i + 2)
        } else {
            None
        };
        if let Some(next) = skip {
            if cond.has_side_effects() {
                out.push(Stmt::Expr(cond));
            }
            return Ok(next);
        }

        // `test` holds when execution falls through.
        let test = match kind {
            CondKind::Zero => cond,
            CondKind::NonZero => cond.not(),
        };
        let d = self.dest(i).unwrap_or(usize::MAX);
        let j = match self.index.get(&d) {
            Some(&j) if j > i && j <= to => j,
            _ => {
                let taken = if Some(d) == scope.brk {
                    Stmt::Break
                } else if Some(d) == scope.cont {
                    Stmt::Continue
                } else if d >= self.epilogue_pos && self.index.contains_key(&d) {
                    Stmt::Return(None)
                } else {
                    self.goto(d, pos)
                };
                out.push(Stmt::If {
                    cond: test.not(),
                    then_body: vec![taken],
                    else_body: Vec::new(),
                });
                return Ok(i + 1);
            }
        };

        if let Some((k, m)) = self.else_branch(i, j, to, scope) {
            let mut then_state = st.clone();
            let then_body = self.lift(i + 1, k, &mut then_state, scope)?;
            let mut else_state = st.clone();
            let else_body = self.lift(j, m, &mut else_state, scope)?;
            out.push(Stmt::If {
                cond: test,
                then_body,
                else_body,
            });
            return Ok(m);
        }

        let mut then_state = st.clone();
        let then_body = self.lift(i + 1, j, &mut then_state, scope)?;
        out.push(Stmt::If {
            cond: test,
            then_body,
            else_body: Vec::new(),
        });
        Ok(j)
    }

    /// For a forward guard at `i` landing on `j`: a forward jump right before
    /// `j` that skips an else branch. Returns the jump's index and the index
    /// where the else branch ends.
    fn else_branch(&self, i: usize, j: usize, to: usize, scope: Scope) -> Option<(usize, usize)> {
        let k = j.checked_sub(1).filter(|k| *k > i)?;
        if !self.is(k, CmdKind::Jump) {
            return None;
        }
        let e = self.dest(k)?;
        if e <= self.positions[j] || Some(e) == scope.brk || Some(e) == scope.cont {
            return None;
        }
        if e > self.epilogue_pos {
            return None;
        }
        let m = *self.index.get(&e)?;
        (m <= to).then_some((k, m))
    }

    fn lift_loop(
        &mut self,
        head: usize,
        back: usize,
        st: &mut State,
        scope: Scope,
    ) -> Result<Option<(Stmt, usize)>, SubroutineError> {
        let head_pos = self.positions[head];
        let Some(back_cmd) = self.cmd(back) else {
            return Ok(None);
        };
        let after = back_cmd.end();
        let next = back + 1;
        let body_scope = |cont: Option<usize>| Scope {
            brk: Some(after),
            cont,
            expr_only: false,
        };

        match &back_cmd.op {
            CommandOp::Jump { .. } => {
                let exit = (head..back).find(|&c| self.is(c, CmdKind::CondJump) && query::is_jz(self.arena, self.cmds[c]) && self.dest(c) == Some(after));
                let Some(c) = exit else {
                    return Ok(None);
                };

                // while (cond) { body }
                let mut trial = st.clone();
                let operand = Scope {
                    expr_only: true,
                    ..scope
                };
                if let Ok(stmts) = self.lift(head, c, &mut trial, operand) {
                    if stmts.is_empty() && trial.stack.depth() == st.stack.depth() + 1 {
                        let cond = pop_value(&mut trial, 1, self.positions[c])?;
                        let body = self.lift(c + 1, back, &mut trial, body_scope(Some(head_pos)))?;
                        return Ok(Some((Stmt::While { cond, body }, next)));
                    }
                }

                // do { body } while (cond) with the exit test last.
                if c + 1 == back {
                    let mut inner = st.clone();
                    let body = self.lift(head, c, &mut inner, body_scope(None))?;
                    let cond = pop_value(&mut inner, 1, self.positions[c])?;
                    return Ok(Some((Stmt::DoWhile { body, cond }, next)));
                }
                Ok(None)
            }
            CommandOp::CondJump { kind, .. } => {
                let mut inner = st.clone();
                let body = self.lift(head, back, &mut inner, body_scope(None))?;
                let cond = pop_value(&mut inner, 1, self.positions[back])?;
                let cond = match kind {
                    CondKind::NonZero => cond,
                    CondKind::Zero => cond.not(),
                };
                Ok(Some((Stmt::DoWhile { body, cond }, next)))
            }
            _ => Ok(None),
        }
    }

    fn lift_closure(&self, body: NodeId, st: &State) -> Result<Vec<Stmt>, SubroutineError> {
        let mut inner = Lifter::new(self.ctx, body, self.counter, self.global);
        let mut state = State {
            stack: st.stack.clone(),
            deferred: Vec::new(),
        };
        let base = state.stack.depth();
        let end = inner.epilogue;
        let mut stmts = inner.lift(0, end, &mut state, Scope::default())?;
        flush(&mut state, base, &mut stmts);
        Ok(finish(stmts))
    }
}

/// Emits the side effects of values still above `base`.
fn flush(st: &mut State, base: usize, out: &mut Vec<Stmt>) {
    let mut rest = Vec::new();
    while st.stack.depth() > base {
        match st.stack.pop(0) {
            Ok(s) => rest.push(s),
            Err(_) => break,
        }
    }
    rest.reverse();
    discard(rest, out);
}

/// Labels go first so loop heads no longer separate a loop from its
/// initializer.
fn finish(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut used = Vec::new();
    ast::goto_targets(&stmts, &mut used);
    ast::tidy(ast::prune_labels(stmts, &used))
}

fn param_name(ty: NcsType, n: usize) -> String {
    format!("{}Param{n}", ty.keyword())
}

fn lift_routine(ctx: &Context<'_>, index: usize) -> Result<Routine, SubroutineError> {
    let tree = ctx.tree;
    let sub = tree.subroutines[index];
    let start = tree.bounds(sub).0;
    let sig = ctx
        .signatures
        .get(index)
        .and_then(|s| s.as_ref())
        .ok_or(SubroutineError::RecursiveSignature { start })?;

    let mut st = State {
        stack: TypedStack::new(),
        deferred: Vec::new(),
    };
    if sig.returns != NcsType::Void && !sig.implicit_return {
        st.stack.push(sig.returns, Value::ReturnSlot);
    }
    let params: Vec<(NcsType, String)> = sig
        .params
        .iter()
        .enumerate()
        .map(|(k, ty)| (*ty, param_name(*ty, k + 1)))
        .collect();
    for (ty, name) in params.iter().rev() {
        st.stack.push(*ty, Value::Var(name.clone()));
    }
    let base = st.stack.depth();

    let counter = Cell::new(0);
    let mut lifter = Lifter::new(ctx, tree.block(sub), &counter, false);
    let end = lifter.epilogue;
    let mut body = lifter.lift(0, end, &mut st, Scope::default())?;
    if sig.implicit_return && st.stack.depth() > base {
        let value = pop_value(&mut st, sig.returns.width().max(1), lifter.epilogue_pos)?;
        flush(&mut st, base, &mut body);
        body.push(Stmt::Return(Some(value)));
    } else {
        flush(&mut st, base, &mut body);
    }
    debug!(start, statements = body.len(), "lifted routine");
    Ok(Routine {
        name: ctx.names.get(index).cloned().unwrap_or_default(),
        params,
        returns: sig.returns,
        body: finish(body),
    })
}

/// Lifts the declarations before SAVEBP of the routine that owns the
/// globals. Returns the statements and the BP frame they build.
fn lift_globals(ctx: &Context<'_>, frame: &GlobalFrame) -> Result<(Vec<Stmt>, TypedStack<Value>), SubroutineError> {
    let Some(owner) = frame.owner else {
        return Ok((Vec::new(), TypedStack::new()));
    };
    let counter = Cell::new(0);
    let mut lifter = Lifter::new(ctx, ctx.tree.block(ctx.tree.subroutines[owner]), &counter, true);
    let mut st = State {
        stack: TypedStack::new(),
        deferred: Vec::new(),
    };
    let mut stmts = lifter.lift(0, frame.save_index, &mut st, Scope::default())?;
    flush_above_globals(&mut st, &mut stmts);
    st.stack.push(NcsType::Int, Value::SavedBp);
    Ok((finish(stmts), st.stack))
}

/// Drops temporaries left above the global variables.
fn flush_above_globals(st: &mut State, out: &mut Vec<Stmt>) {
    let keep = st
        .stack
        .entries()
        .iter()
        .rposition(|s| matches!(s.value, Value::Var(_)))
        .map(|i| st.stack.base(i) + st.stack.get(i).map(|s| s.width).unwrap_or(0))
        .unwrap_or(0);
    flush(st, keep, out);
}

/// Which subroutines are compiler scaffolding and which one is the entry.
#[derive(Debug, Clone, Copy)]
struct Layout {
    stub: Option<usize>,
    owner: Option<usize>,
    main: usize,
}

fn layout(tree: &NodeTree, frame: &GlobalFrame) -> Layout {
    let arena = &tree.arena;
    let Some(target) = stack::is_entry_stub(tree, 0) else {
        return Layout {
            stub: None,
            owner: None,
            main: 0,
        };
    };
    if frame.owner == Some(target) {
        let block = tree.block(tree.subroutines[target]);
        let main = arena.children(block)[frame.save_index..]
            .iter()
            .find(|id| query::is_kind(arena, **id, CmdKind::Jsr))
            .and_then(|id| query::jump_destination(arena, *id))
            .and_then(|t| tree.subroutine_at(t))
            .unwrap_or(target);
        return Layout {
            stub: Some(0),
            owner: Some(target),
            main,
        };
    }
    Layout {
        stub: Some(0),
        owner: None,
        main: target,
    }
}

/// Reconstructs every routine of a program. Routine failures are recorded
/// per routine; only cancellation fails the whole program.
pub(crate) fn reconstruct(
    tree: &NodeTree,
    actions: &dyn ActionTable,
    options: &DecompileOptions,
    cancel: Option<&AtomicBool>,
) -> Result<Program, NcsError> {
    let frame = stack::global_frame(tree, actions);
    let mut signatures = Vec::with_capacity(tree.subroutines.len());
    let mut sig_errors = Vec::with_capacity(tree.subroutines.len());
    for r in stack::analyze(tree, actions, &frame) {
        match r {
            Ok(s) => {
                signatures.push(Some(s));
                sig_errors.push(None);
            }
            Err(e) => {
                signatures.push(None);
                sig_errors.push(Some(e));
            }
        }
    }

    let layout = layout(tree, &frame);
    let conditional = tree.conditional()
        || signatures
            .get(layout.main)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.returns == NcsType::Int);
    let visible: Vec<usize> = (0..tree.subroutines.len())
        .filter(|i| Some(*i) != layout.stub && Some(*i) != layout.owner)
        .collect();
    let mut names = vec![String::new(); tree.subroutines.len()];
    let mut k = 0;
    for &i in &visible {
        names[i] = if i == layout.main {
            if conditional { "StartingConditional" } else { "main" }.to_string()
        } else {
            k += 1;
            format!("sub{k}")
        };
    }

    let no_globals = TypedStack::new();
    let pre = Context {
        tree,
        actions,
        signatures: &signatures,
        names: &names,
        globals: &no_globals,
        fold_constants: options.fold_constants,
    };
    let (globals, globals_frame, globals_error) = match lift_globals(&pre, &frame) {
        Ok((stmts, bp)) => (stmts, bp, None),
        Err(e) => {
            warn!("global declarations failed: {e}");
            let mut bp = TypedStack::new();
            for (n, s) in frame.slots.entries().iter().enumerate() {
                let value = if n + 1 == frame.slots.len() {
                    Value::SavedBp
                } else {
                    Value::Var(format!("{}GLOB_{}", s.ty.keyword(), n + 1))
                };
                bp.push_slot(Slot {
                    ty: s.ty,
                    width: s.width,
                    value,
                });
            }
            (Vec::new(), bp, Some(e))
        }
    };

    let ctx = Context {
        globals: &globals_frame,
        ..pre
    };
    let cancelled = || cancel.is_some_and(|c| c.load(Ordering::Relaxed));
    let run = |i: &usize| -> Result<Option<Routine>, SubroutineError> {
        if ctx.signatures[*i].is_none() {
            return Ok(None);
        }
        lift_routine(&ctx, *i).map(Some)
    };
    let lifted: Vec<Result<Option<Routine>, SubroutineError>> = if options.parallel {
        visible
            .par_iter()
            .map(|i| if cancelled() { Ok(None) } else { run(i) })
            .collect()
    } else {
        let mut v = Vec::with_capacity(visible.len());
        for i in &visible {
            if cancelled() {
                return Err(NcsError::Cancelled);
            }
            v.push(run(i));
        }
        v
    };
    if cancelled() {
        return Err(NcsError::Cancelled);
    }

    let mut routines = Vec::with_capacity(visible.len());
    let mut main = None;
    for (&i, result) in visible.iter().zip(lifted) {
        let start = tree.bounds(tree.subroutines[i]).0;
        let outcome = match (result, sig_errors[i].take()) {
            (_, Some(e)) => Err(e),
            (Ok(Some(r)), None) => Ok(r),
            (Ok(None), None) => Err(SubroutineError::RecursiveSignature { start }),
            (Err(e), None) => Err(e),
        };
        if let Err(e) = &outcome {
            warn!(routine = %names[i], start, "decompilation failed: {e}");
        }
        if i == layout.main {
            main = Some(routines.len());
        }
        routines.push(RoutineResult {
            name: names[i].clone(),
            start,
            outcome,
        });
    }

    Ok(Program {
        globals,
        globals_error,
        routines,
        main,
        conditional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{EmptyTable, NwscriptTable};
    use crate::builder::build;
    use crate::instr::asm::*;
    use crate::instr::{layout as place, Instr};
    use crate::tables::op;
    use crate::types::OperandPair;

    fn program(mut v: Vec<Instr>, actions: &dyn ActionTable) -> Program {
        place(&mut v);
        let tree = build(&v).unwrap();
        reconstruct(&tree, actions, &DecompileOptions::default(), None).unwrap()
    }

    fn main_body(p: &Program) -> &[Stmt] {
        let r = &p.routines[p.main.unwrap()];
        &r.outcome.as_ref().unwrap().body
    }

    fn table() -> NwscriptTable {
        NwscriptTable::parse(
            "int Random(int n);\nvoid PrintInteger(int n);\nvoid DelayCommand(float f, action a);\nint GetIsNight();",
        )
        .unwrap()
    }

    #[test]
    fn local_declaration_with_initializer() {
        // RSADDI; CONST 7; CPDOWNSP -8,4; MOVSP -4; CPTOPSP -4,4; ACTION PrintInteger; MOVSP -4; RETN
        let p = program(
            vec![
                rsadd(NcsType::Int),
                const_int(7),
                cpdownsp(-8, 4),
                movsp(-4),
                cptopsp(-4, 4),
                action(1, 1),
                movsp(-4),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        assert_eq!(
            body[0],
            Stmt::Decl {
                ty: NcsType::Int,
                name: "int1".into(),
                init: Some(Expr::int(7))
            }
        );
        assert!(matches!(&body[1], Stmt::Expr(Expr::Call { name, .. }) if name == "PrintInteger"));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn while_loop_with_break_target() {
        // 13 ACTION GetIsNight; 18 JZ ->41; 24 CONST 3; 30 ACTION PrintInteger;
        // 35 JMP ->13; 41 RETN
        let p = program(
            vec![
                action(3, 0),
                jz(23),
                const_int(3),
                action(1, 1),
                jmp(-22),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        assert_eq!(body.len(), 1, "{body:?}");
        let Stmt::While { cond, body } = &body[0] else {
            panic!("{body:?}");
        };
        assert!(matches!(cond, Expr::Call { name, .. } if name == "GetIsNight"));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn do_while_with_jnz() {
        // 13 CONST 1; 19 ACTION PrintInteger; 24 ACTION GetIsNight; 29 JNZ ->13
        let p = program(
            vec![const_int(1), action(1, 1), action(3, 0), jnz(-16), retn()],
            &table(),
        );
        let body = main_body(&p);
        assert!(matches!(&body[0], Stmt::DoWhile { body, .. } if body.len() == 1), "{body:?}");
    }

    #[test]
    fn and_short_circuit_is_preserved() {
        // a; CPTOPSP -4,4; JZ L; b; LOGANDII; L: JZ end; PrintInteger(1); end: RETN
        let p = program(
            vec![
                action(3, 0),
                cptopsp(-4, 4),
                jz(13),
                action(3, 0),
                binary(op::LOGANDII, OperandPair::II),
                jz(17),
                const_int(1),
                action(1, 1),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        let Stmt::If { cond, then_body, .. } = &body[0] else {
            panic!("{body:?}");
        };
        assert!(matches!(cond, Expr::Logical { op: "&&", .. }));
        assert_eq!(then_body.len(), 1);
    }

    #[test]
    fn or_short_circuit_is_preserved() {
        // a; CPTOPSP; JZ +12; JMP L; b; LOGORII; L: JZ end; body; end: RETN
        let p = program(
            vec![
                action(3, 0),
                cptopsp(-4, 4),
                jz(12),
                jmp(13),
                action(3, 0),
                binary(op::LOGORII, OperandPair::II),
                jz(17),
                const_int(1),
                action(1, 1),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        let Stmt::If { cond, .. } = &body[0] else {
            panic!("{body:?}");
        };
        assert!(matches!(cond, Expr::Logical { op: "||", .. }), "{cond:?}");
    }

    #[test]
    fn jump_into_sibling_routine_becomes_goto() {
        // main: 13 JSR ->27; 19 JMP ->29; 25 RETN. sub1: 27 NOP; 29 RETN; 31 RETN
        let p = program(vec![jsr(14), jmp(10), retn(), nop(), retn(), retn()], &EmptyTable);
        let body = main_body(&p);
        assert!(body.iter().any(|s| matches!(s, Stmt::Goto(_))), "{body:?}");
    }

    #[test]
    fn globals_are_named_and_reachable() {
        // stub; globals: RSADDI; CONST 4; CPDOWNSP -8,4; MOVSP -4; SAVEBP; JSR main;
        // RESTOREBP; MOVSP -4; RETN; main: CPTOPBP -8,4; ACTION PrintInteger; RETN
        let p = program(
            vec![
                jsr(8),
                retn(),
                rsadd(NcsType::Int),
                const_int(4),
                cpdownsp(-8, 4),
                movsp(-4),
                savebp(),
                jsr(16),
                restorebp(),
                movsp(-4),
                retn(),
                cptopbp(-8, 4),
                action(1, 1),
                retn(),
            ],
            &table(),
        );
        assert_eq!(
            p.globals,
            vec![Stmt::Decl {
                ty: NcsType::Int,
                name: "intGLOB_1".into(),
                init: Some(Expr::int(4))
            }]
        );
        assert_eq!(p.routines.len(), 1);
        let body = main_body(&p);
        let Stmt::Expr(Expr::Call { args, .. }) = &body[0] else {
            panic!("{body:?}");
        };
        assert_eq!(args[0], Expr::var("intGLOB_1", NcsType::Int));
    }

    #[test]
    fn deferred_action_body() {
        // 13 STORE_STATE; 23 JMP ->42; 29 CONST 2; 35 ACTION PrintInteger; 40 RETN;
        // 42 CONST 1.5; 48 ACTION DelayCommand; 53 RETN
        let p = program(
            vec![
                store_state(0, 0),
                jmp(19),
                const_int(2),
                action(1, 1),
                retn(),
                const_float(1.5),
                action(2, 2),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        let Stmt::Expr(Expr::Call { name, args, .. }) = &body[0] else {
            panic!("{body:?}");
        };
        assert_eq!(name, "DelayCommand");
        let Expr::Deferred(inner) = &args[1] else { panic!("{args:?}") };
        assert!(matches!(&inner[0], Stmt::Expr(Expr::Call { name, .. }) if name == "PrintInteger"));
    }

    #[test]
    fn failing_routine_does_not_abort_program() {
        // main: 13 JSR ->27; 19 JSR ->35; 25 RETN. sub1: 27 JSR ->30 (no routine); 33 RETN.
        // sub2: 35 RETN. sub1 fails, and main with it since it calls sub1.
        let p = program(
            vec![jsr(14), jsr(16), retn(), jsr(3), retn(), retn()],
            &EmptyTable,
        );
        assert_eq!(p.routines.len(), 3);
        let ok: Vec<bool> = p.routines.iter().map(|r| r.outcome.is_ok()).collect();
        assert_eq!(ok, vec![false, false, true]);
    }

    #[test]
    fn call_result_replaces_reserved_slot() {
        // main: 13 RSADDI; 15 JSR ->28; 21 ACTION PrintInteger; 26 RETN
        // sub1: 28 CONST 5; 34 CPDOWNSP -8,4; 42 MOVSP -4; 48 RETN
        let p = program(
            vec![
                rsadd(NcsType::Int),
                jsr(13),
                action(1, 1),
                retn(),
                const_int(5),
                cpdownsp(-8, 4),
                movsp(-4),
                retn(),
            ],
            &table(),
        );
        let body = main_body(&p);
        assert_eq!(body.len(), 1, "{body:?}");
        let Stmt::Expr(Expr::Call { args, .. }) = &body[0] else { panic!() };
        assert!(matches!(&args[0], Expr::Call { name, .. } if name == "sub1"));
        let sub = p.routines.iter().find(|r| r.name == "sub1").unwrap();
        let sub = sub.outcome.as_ref().unwrap();
        assert_eq!(sub.returns, NcsType::Int);
        assert_eq!(sub.body, vec![Stmt::Return(Some(Expr::int(5)))]);
    }
}
