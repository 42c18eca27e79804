//! Stack and type tracking.
//!
//! [`TypedStack`] models the evaluation stack as typed entries, each one or
//! more 4-byte slots wide. On top of it, [`analyze`] infers the parameter
//! count, parameter types and return type of every subroutine by simulating
//! its stack effect.

use std::collections::HashMap;
use std::ops::Range;

use tracing::{debug, warn};

use crate::actions::ActionTable;
use crate::builder::NodeTree;
use crate::error::SubroutineError;
use crate::node::{Arena, BpOp, Command, CommandOp, NodeId, NodeKind};
use crate::query;
use crate::traverse;
use crate::types::NcsType;

#[derive(Debug, Clone, PartialEq)]
pub struct Slot<T> {
    pub ty: NcsType,
    pub width: usize,
    pub value: T,
}

/// Where a stack access lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Whole entries, bottom to top.
    Entries(Range<usize>),
    /// Part of a single wider entry, starting `offset` slots into it.
    Part { entry: usize, offset: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedStack<T> {
    entries: Vec<Slot<T>>,
    depth: usize,
}

impl<T> Default for TypedStack<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            depth: 0,
        }
    }
}

impl<T: Clone> TypedStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depth in slots.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Slot<T>] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Slot<T>> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Slot<T>> {
        self.entries.get_mut(index)
    }

    pub fn top(&self) -> Option<&Slot<T>> {
        self.entries.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Slot<T>> {
        self.entries.last_mut()
    }

    pub fn push(&mut self, ty: NcsType, value: T) {
        self.push_slot(Slot {
            ty,
            width: ty.width().max(1),
            value,
        });
    }

    pub fn push_slot(&mut self, slot: Slot<T>) {
        self.depth += slot.width;
        self.entries.push(slot);
    }

    pub fn pop(&mut self, pos: usize) -> Result<Slot<T>, SubroutineError> {
        let slot = self.entries.pop().ok_or(SubroutineError::StackUnderflow { pos })?;
        self.depth -= slot.width;
        Ok(slot)
    }

    /// Pops whole entries covering exactly `n` slots, returned bottom to top.
    pub fn pop_slots(&mut self, n: usize, pos: usize) -> Result<Vec<Slot<T>>, SubroutineError> {
        if n > self.depth {
            return Err(SubroutineError::StackUnderflow { pos });
        }
        let mut taken = 0usize;
        let mut count = 0usize;
        for slot in self.entries.iter().rev() {
            if taken >= n {
                break;
            }
            taken += slot.width;
            count += 1;
        }
        if taken != n {
            let width = self.entries[self.entries.len() - count].width;
            return Err(SubroutineError::SplitValue { pos, width });
        }
        let out = self.entries.split_off(self.entries.len() - count);
        self.depth -= n;
        Ok(out)
    }

    /// Drops entries until at most `depth` slots remain.
    pub fn truncate_depth(&mut self, depth: usize) {
        while self.depth > depth {
            match self.entries.pop() {
                Some(s) => self.depth -= s.width,
                None => break,
            }
        }
    }

    /// Slot index of the bottom of each entry.
    fn base_of(&self, index: usize) -> usize {
        self.entries[..index].iter().map(|s| s.width).sum()
    }

    /// Resolves `len` slots starting at absolute slot `start`.
    pub fn locate(&self, start: i64, len: usize, pos: usize) -> Result<Access, SubroutineError> {
        let unresolved = SubroutineError::UnresolvedVariable {
            pos,
            offset: (start - self.depth as i64) as i32 * 4,
        };
        if start < 0 || len == 0 || start as usize + len > self.depth {
            return Err(unresolved);
        }
        let start = start as usize;
        let mut base = 0usize;
        for (i, slot) in self.entries.iter().enumerate() {
            if start < base + slot.width {
                if start > base {
                    if start + len <= base + slot.width {
                        return Ok(Access::Part {
                            entry: i,
                            offset: start - base,
                            len,
                        });
                    }
                    return Err(SubroutineError::SplitValue { pos, width: slot.width });
                }
                if len < slot.width {
                    return Ok(Access::Part { entry: i, offset: 0, len });
                }
                let mut covered = 0usize;
                let mut end = i;
                while covered < len {
                    covered += self.entries[end].width;
                    end += 1;
                }
                if covered != len {
                    return Err(SubroutineError::SplitValue {
                        pos,
                        width: self.entries[end - 1].width,
                    });
                }
                return Ok(Access::Entries(i..end));
            }
            base += slot.width;
        }
        Err(unresolved)
    }

    /// Resolves a `(byte offset, byte size)` access relative to the top.
    pub fn locate_top(&self, offset: i32, size: u16, pos: usize) -> Result<Access, SubroutineError> {
        let start = self.depth as i64 + query::slot(offset) as i64;
        self.locate(start, size as usize / 4, pos)
    }

    /// Absolute slot index of the bottom of entry `index`.
    pub fn base(&self, index: usize) -> usize {
        self.base_of(index)
    }
}

/// Inferred shape of a subroutine.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Parameter types; the first parameter is the one pushed last.
    pub params: Vec<NcsType>,
    pub returns: NcsType,
    /// The routine leaves its result on the stack instead of writing a
    /// caller-reserved slot.
    pub implicit_return: bool,
}

impl Signature {
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(|t| t.width()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Shape {
    param_slots: usize,
    returns: NcsType,
    implicit_return: bool,
}

/// Defining node of a simulated slot; `None` for slots that belong to the
/// caller.
type Origin = Option<NodeId>;

/// Caller-owned slots below a routine's frame during simulation.
const FLOOR: usize = 256;

/// Global variable frame seen through BP by every routine but the one that
/// declares the globals.
#[derive(Debug, Clone, Default)]
pub struct GlobalFrame {
    pub slots: TypedStack<Origin>,
    /// Subroutine declaring the globals, if any.
    pub owner: Option<usize>,
    /// Block index of its SAVEBP.
    pub save_index: usize,
}

fn command(arena: &Arena, id: NodeId) -> Option<&Command> {
    arena.unwrap_command(id)
}

/// Index of the SAVEBP command in a block's children, if present.
pub fn save_bp_index(arena: &Arena, block: NodeId) -> Option<usize> {
    arena
        .children(block)
        .iter()
        .position(|id| matches!(command(arena, *id), Some(Command { op: CommandOp::Bp(BpOp::Save), .. })))
}

/// Whether a subroutine is the compiler's entry stub: an optional RSADD,
/// a JSR and a RETN.
pub fn is_entry_stub(tree: &NodeTree, sub: usize) -> Option<usize> {
    let arena = &tree.arena;
    let block = tree.block(tree.subroutines[sub]);
    let kids = arena.children(block);
    let (jsr, rest) = match kids {
        [a, b, rest @ ..] if query::is_kind(arena, *a, crate::node::CmdKind::RsAdd) => (*b, rest),
        [a, rest @ ..] => (*a, rest),
        [] => return None,
    };
    if !query::is_kind(arena, jsr, crate::node::CmdKind::Jsr) || !rest.iter().all(|r| query::is_return(arena, *r)) {
        return None;
    }
    query::jump_destination(arena, jsr).and_then(|t| tree.subroutine_at(t))
}

struct Sim<'a> {
    arena: &'a Arena,
    actions: &'a dyn ActionTable,
    shapes: &'a [Option<Shape>],
    failed: &'a [bool],
    tree: &'a NodeTree,
    frame: &'a TypedStack<Origin>,
    calls: Vec<(usize, Vec<NcsType>)>,
    /// Writes below the frame: (first slot, width, type).
    low_writes: Vec<(usize, usize, NcsType)>,
}

impl Sim<'_> {
    fn param_types(&self, id: u16, argc: u8) -> Vec<NcsType> {
        match self.actions.param_types(id) {
            Some(p) => p.iter().copied().take(argc as usize).collect(),
            None => vec![NcsType::Int; argc as usize],
        }
    }

    fn push_access(
        &self,
        stack: &mut TypedStack<Origin>,
        source: &TypedStack<Origin>,
        access: Access,
        origin: Origin,
    ) {
        match access {
            Access::Entries(r) => {
                for i in r {
                    if let Some(s) = source.get(i) {
                        let s = Slot { value: origin, ..s.clone() };
                        stack.push_slot(s);
                    }
                }
            }
            Access::Part { entry, len, .. } => {
                let ty = match source.get(entry).map(|s| s.ty) {
                    Some(NcsType::Vector) => NcsType::Float,
                    Some(t) => t,
                    None => NcsType::Int,
                };
                stack.push_slot(Slot { ty, width: len, value: origin });
            }
        }
    }

    /// Simulates `nodes` on `stack`. Returns true once the return at `end`
    /// is reached.
    fn run(&mut self, nodes: &[NodeId], stack: &mut TypedStack<Origin>, end: usize) -> Result<bool, SubroutineError> {
        let arena = self.arena;
        let mut pending: HashMap<usize, TypedStack<Origin>> = HashMap::new();
        let mut live = true;
        for &id in nodes {
            let Some(pos) = arena.position(id) else { continue };
            if let Some(saved) = pending.remove(&pos) {
                if !live {
                    *stack = saved;
                    live = true;
                }
            }
            if let NodeKind::Return { pos } = arena.kind(id) {
                if *pos >= end {
                    return Ok(true);
                }
                live = false;
                continue;
            }
            let Some(cmd) = command(arena, id) else { continue };
            self.step(id, cmd, stack, &mut pending, &mut live)?;
        }
        Ok(false)
    }

    fn step(
        &mut self,
        id: NodeId,
        cmd: &Command,
        stack: &mut TypedStack<Origin>,
        pending: &mut HashMap<usize, TypedStack<Origin>>,
        live: &mut bool,
    ) -> Result<(), SubroutineError> {
        let arena = self.arena;
        let pos = cmd.pos;
        let origin = Some(id);
        match &cmd.op {
            CommandOp::RsAdd(ty) => stack.push(*ty, origin),
            CommandOp::Const(c) => stack.push(c.ty(), origin),
            CommandOp::CopyTopSp { offset, size } => {
                let access = stack.locate_top(*offset, *size, pos)?;
                let source = stack.clone();
                self.push_access(stack, &source, access, origin);
            }
            CommandOp::CopyDownSp { offset, size } => {
                let start = stack.depth() as i64 + query::slot(*offset) as i64;
                if start >= 0 && (start as usize) < FLOOR {
                    let width = *size as usize / 4;
                    let ty = match stack.top() {
                        Some(s) if width == 3 && s.width == 1 => NcsType::Vector,
                        Some(s) => known(s.ty),
                        None => return Err(SubroutineError::StackUnderflow { pos }),
                    };
                    self.low_writes.push((start as usize, width, ty));
                } else {
                    stack.locate_top(*offset, *size, pos)?;
                }
            }
            CommandOp::CopyTopBp { offset, size } => {
                let access = self.frame.locate_top(*offset, *size, pos)?;
                self.push_access(stack, self.frame, access, origin);
            }
            CommandOp::CopyDownBp { offset, size } => {
                self.frame.locate_top(*offset, *size, pos)?;
            }
            CommandOp::MoveSp { delta } => {
                if *delta > 0 {
                    return Err(SubroutineError::Unexpected {
                        pos,
                        what: "positive stack adjustment",
                    });
                }
                stack.pop_slots((-query::slot(*delta)) as usize, pos)?;
            }
            CommandOp::Action { id: action, argc } => {
                let params = self.param_types(*action, *argc);
                let slots: usize = params.iter().map(|t| t.width()).sum();
                stack.pop_slots(slots, pos)?;
                let ret = self.actions.return_type(*action).unwrap_or(NcsType::Int);
                if ret != NcsType::Void {
                    stack.push(ret, origin);
                }
            }
            CommandOp::Jsr { .. } => {
                let target = query::jump_destination(arena, id).unwrap_or(usize::MAX);
                let callee = self
                    .tree
                    .subroutine_at(target)
                    .ok_or(SubroutineError::UnknownSubroutine { pos, target })?;
                let shape = match self.shapes.get(callee).copied().flatten() {
                    Some(s) => s,
                    None if self.failed.get(callee).copied().unwrap_or(false) => {
                        return Err(SubroutineError::Unexpected {
                            pos,
                            what: "call to a routine whose signature is unknown",
                        });
                    }
                    None => return Err(SubroutineError::RecursiveSignature { start: target }),
                };
                let args = stack.pop_slots(shape.param_slots, pos)?;
                let types = args.iter().rev().map(|s| known(s.ty)).collect();
                self.calls.push((callee, types));
                if shape.implicit_return {
                    stack.push(shape.returns, origin);
                }
            }
            CommandOp::Logii(_) => {
                stack.pop_slots(2, pos)?;
                stack.push(NcsType::Int, origin);
            }
            CommandOp::Unary { .. } => {
                if stack.is_empty() {
                    return Err(SubroutineError::StackUnderflow { pos });
                }
            }
            CommandOp::StackOp { .. } => {}
            CommandOp::Binary { op, pair, size } => {
                let (lw, rw) = query::binary_operand_widths(*pair, *size);
                stack.pop_slots(rw, pos)?;
                stack.pop_slots(lw, pos)?;
                let (ty, width) = query::binary_result(*op, *pair);
                stack.push_slot(Slot { ty, width, value: origin });
            }
            CommandOp::CondJump { .. } => {
                stack.pop(pos)?;
                if let Some(t) = query::jump_destination(arena, id) {
                    pending.entry(t).or_insert_with(|| stack.clone());
                }
            }
            CommandOp::Jump { .. } => {
                if let Some(t) = query::jump_destination(arena, id) {
                    pending.entry(t).or_insert_with(|| stack.clone());
                }
                *live = false;
            }
            CommandOp::Destruct {
                size,
                exclude_offset,
                exclude_size,
            } => {
                let popped = stack.pop_slots(*size as usize / 4, pos)?;
                let keep = *exclude_size as usize / 4;
                if keep > 0 {
                    let at = *exclude_offset as usize / 4;
                    let mut base = 0;
                    let ty = popped
                        .iter()
                        .find(|s| {
                            let hit = at < base + s.width;
                            base += s.width;
                            hit
                        })
                        .map(|s| if s.ty == NcsType::Vector { NcsType::Float } else { s.ty })
                        .unwrap_or(NcsType::Int);
                    stack.push_slot(Slot { ty, width: keep, value: origin });
                }
            }
            CommandOp::Bp(BpOp::Save) => stack.push(NcsType::Int, origin),
            CommandOp::Bp(BpOp::Restore) => {
                stack.pop(pos)?;
            }
            CommandOp::StoreState { .. } => {
                if let Some(body) = deferred_body(arena, id) {
                    // The deferred body runs later on a copy of the stack.
                    let mut copy = stack.clone();
                    self.run(arena.children(body), &mut copy, last_return(arena, body))?;
                }
            }
        }
        Ok(())
    }
}

/// Caller-owned slots have no known type; treat them as int.
fn known(ty: NcsType) -> NcsType {
    if ty == NcsType::Void { NcsType::Int } else { ty }
}

/// Body block nested under a store-state command.
pub fn deferred_body(arena: &Arena, store: NodeId) -> Option<NodeId> {
    let inner = *arena.children(store).first()?;
    arena.children(inner).get(1).copied()
}

/// Position of the last return directly inside `block`.
pub fn last_return(arena: &Arena, block: NodeId) -> usize {
    arena
        .children(block)
        .iter()
        .rev()
        .find_map(|n| match arena.kind(*n) {
            NodeKind::Return { pos } => Some(*pos),
            _ => None,
        })
        .unwrap_or(usize::MAX)
}

fn floor() -> TypedStack<Origin> {
    let mut s = TypedStack::new();
    for _ in 0..FLOOR {
        s.push_slot(Slot {
            ty: NcsType::Void,
            width: 1,
            value: None,
        });
    }
    s
}

/// Types of the global variables: every slot declared before the SAVEBP of
/// the routine the entry stub calls, followed by the saved BP itself.
pub fn global_frame(tree: &NodeTree, actions: &dyn ActionTable) -> GlobalFrame {
    if tree.subroutines.is_empty() {
        return GlobalFrame::default();
    }
    let Some(owner) = is_entry_stub(tree, 0) else {
        return GlobalFrame::default();
    };
    let arena = &tree.arena;
    let block = tree.block(tree.subroutines[owner]);
    let Some(save_index) = save_bp_index(arena, block) else {
        return GlobalFrame::default();
    };

    let empty = TypedStack::new();
    let mut sim = Sim {
        arena,
        actions,
        shapes: &[],
        failed: &[],
        tree,
        frame: &empty,
        calls: Vec::new(),
        low_writes: Vec::new(),
    };
    let mut stack = TypedStack::new();
    if let Err(e) = sim.run(&arena.children(block)[..save_index], &mut stack, usize::MAX) {
        warn!("could not type global declarations: {e}");
        return GlobalFrame::default();
    }
    stack.push(NcsType::Int, None);
    debug!(globals = stack.len() - 1, "global frame");
    GlobalFrame {
        slots: stack,
        owner: Some(owner),
        save_index,
    }
}

fn shape_of(sim: &mut Sim<'_>, tree: &NodeTree, index: usize) -> Result<Shape, SubroutineError> {
    let sub = tree.subroutines[index];
    let block = tree.block(sub);
    let start = tree.bounds(sub).0;
    let mut last = floor();
    let base = last.depth();
    if !sim.run(tree.arena.children(block), &mut last, tree.bounds(sub).1)? {
        return Err(SubroutineError::Unexpected {
            pos: start,
            what: "routine without a reachable return",
        });
    }

    if last.depth() > base {
        let ty = last.top().map(|s| s.ty).unwrap_or(NcsType::Int);
        return Ok(Shape {
            param_slots: 0,
            returns: ty,
            implicit_return: true,
        });
    }
    let param_slots = base - last.depth();
    let params_bottom = base - param_slots;
    let returns = sim
        .low_writes
        .iter()
        .filter(|(first, width, _)| first + width <= params_bottom)
        .min_by_key(|(first, ..)| *first)
        .map(|(first, width, ty)| {
            if first + width == params_bottom {
                if *width == 3 { NcsType::Vector } else { *ty }
            } else {
                NcsType::Void
            }
        })
        .unwrap_or(NcsType::Void);
    Ok(Shape {
        param_slots,
        returns,
        implicit_return: false,
    })
}

/// Call graph order with callees first.
fn callee_first_order(tree: &NodeTree) -> Vec<usize> {
    let calls: Vec<Vec<usize>> = tree
        .subroutines
        .iter()
        .map(|s| {
            traverse::call_targets(&tree.arena, *s)
                .into_iter()
                .filter_map(|t| tree.subroutine_at(t))
                .collect()
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks = vec![Mark::New; calls.len()];
    let mut order = Vec::with_capacity(calls.len());
    for root in 0..calls.len() {
        if marks[root] != Mark::New {
            continue;
        }
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Active;
        while let Some((node, next)) = stack.pop() {
            if let Some(&callee) = calls[node].get(next) {
                stack.push((node, next + 1));
                if marks[callee] == Mark::New {
                    marks[callee] = Mark::Active;
                    stack.push((callee, 0));
                }
            } else {
                marks[node] = Mark::Done;
                order.push(node);
            }
        }
    }
    order
}

/// Infers the signature of every subroutine, in subroutine order.
pub fn analyze(
    tree: &NodeTree,
    actions: &dyn ActionTable,
    frame: &GlobalFrame,
) -> Vec<Result<Signature, SubroutineError>> {
    let n = tree.subroutines.len();
    let mut shapes: Vec<Option<Shape>> = vec![None; n];
    let mut failed = vec![false; n];
    let mut errors: Vec<Option<SubroutineError>> = (0..n).map(|_| None).collect();
    let mut arg_types: Vec<Option<Vec<NcsType>>> = vec![None; n];

    for index in callee_first_order(tree) {
        let mut sim = Sim {
            arena: &tree.arena,
            actions,
            shapes: &shapes,
            failed: &failed,
            tree,
            frame: &frame.slots,
            calls: Vec::new(),
            low_writes: Vec::new(),
        };
        let result = shape_of(&mut sim, tree, index);
        let calls = std::mem::take(&mut sim.calls);
        match result {
            Ok(shape) => {
                shapes[index] = Some(shape);
                for (callee, types) in calls {
                    arg_types[callee].get_or_insert(types);
                }
            }
            Err(e) => {
                debug!(sub = index, "signature inference failed: {e}");
                failed[index] = true;
                errors[index] = Some(e);
            }
        }
    }

    (0..n)
        .map(|i| match (shapes[i], errors[i].take()) {
            (_, Some(e)) => Err(e),
            (Some(shape), None) => {
                let params = match arg_types[i].take() {
                    Some(types) if types.iter().map(|t| t.width()).sum::<usize>() == shape.param_slots => types,
                    _ => vec![NcsType::Int; shape.param_slots],
                };
                Ok(Signature {
                    params,
                    returns: shape.returns,
                    implicit_return: shape.implicit_return,
                })
            }
            (None, None) => Err(SubroutineError::RecursiveSignature {
                start: tree.bounds(tree.subroutines[i]).0,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{EmptyTable, NwscriptTable};
    use crate::builder::build;
    use crate::instr::asm::*;
    use crate::instr::{layout, Instr};
    use crate::tables::op;
    use crate::types::OperandPair;

    fn tree(mut v: Vec<Instr>) -> NodeTree {
        layout(&mut v);
        build(&v).unwrap()
    }

    fn sigs(t: &NodeTree) -> Vec<Result<Signature, SubroutineError>> {
        let frame = global_frame(t, &EmptyTable);
        analyze(t, &EmptyTable, &frame)
    }

    #[test]
    fn pop_slots_refuses_to_split() {
        let mut s: TypedStack<u8> = TypedStack::new();
        s.push(NcsType::Int, 1);
        s.push(NcsType::Vector, 2);
        assert_eq!(s.depth(), 4);
        assert!(matches!(s.pop_slots(2, 9), Err(SubroutineError::SplitValue { pos: 9, width: 3 })));
        let popped = s.pop_slots(3, 9).unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].value, 2);
        assert!(matches!(s.pop_slots(2, 9), Err(SubroutineError::StackUnderflow { pos: 9 })));
        assert_eq!(s.pop(9).unwrap().value, 1);
        assert!(s.pop(9).is_err());
    }

    #[test]
    fn locate_resolves_entries_and_parts() {
        let mut s: TypedStack<char> = TypedStack::new();
        s.push(NcsType::Int, 'a');
        s.push(NcsType::Vector, 'v');
        s.push(NcsType::Float, 'f');
        // depth 5: a=0, v=1..4, f=4
        assert_eq!(s.locate_top(-4, 4, 0).unwrap(), Access::Entries(2..3));
        assert_eq!(s.locate_top(-16, 12, 0).unwrap(), Access::Entries(1..2));
        assert_eq!(s.locate_top(-20, 20, 0).unwrap(), Access::Entries(0..3));
        assert_eq!(
            s.locate_top(-12, 4, 0).unwrap(),
            Access::Part {
                entry: 1,
                offset: 1,
                len: 1
            }
        );
        assert!(matches!(s.locate_top(-12, 8, 0), Err(SubroutineError::SplitValue { .. })));
        assert!(matches!(s.locate_top(-24, 4, 0), Err(SubroutineError::UnresolvedVariable { .. })));
        assert_eq!(s.base(2), 4);
    }

    #[test]
    fn parameters_come_from_the_final_depth() {
        // main: RSADDI; CONST 1; CONST 2.5; JSR sub; MOVSP -4; RETN
        // sub(int, float) -> int: CPTOPSP -8,4; CPDOWNSP -16,4; MOVSP -4; MOVSP -8; RETN
        let t = tree(vec![
            rsadd(NcsType::Int),
            const_int(1),
            const_float(2.5),
            jsr(14),
            movsp(-4),
            retn(),
            cptopsp(-8, 4),
            cpdownsp(-16, 4),
            movsp(-4),
            movsp(-8),
            retn(),
        ]);
        let s = sigs(&t);
        let sub = s[1].as_ref().unwrap();
        assert_eq!(sub.params, vec![NcsType::Float, NcsType::Int]);
        assert_eq!(sub.returns, NcsType::Int);
        assert!(!sub.implicit_return);
        assert_eq!(sub.param_slots(), 2);
    }

    #[test]
    fn value_left_on_stack_is_an_implicit_return() {
        let t = tree(vec![const_int(5), const_int(3), binary(op::ADD, OperandPair::II), retn()]);
        let s = sigs(&t);
        let main = s[0].as_ref().unwrap();
        assert!(main.implicit_return);
        assert_eq!(main.returns, NcsType::Int);
        assert!(main.params.is_empty());
    }

    #[test]
    fn untyped_arguments_default_to_int() {
        // 13 JSR ->21; 19 RETN; 21 CPTOPSP -4,4; 29 MOVSP -4; 35 MOVSP -4; 41 RETN
        let t = tree(vec![jsr(8), retn(), cptopsp(-4, 4), movsp(-4), movsp(-4), retn()]);
        let s = sigs(&t);
        let sub = s[1].as_ref().unwrap();
        assert_eq!(sub.params, vec![NcsType::Int]);
        assert_eq!(sub.returns, NcsType::Void);
    }

    #[test]
    fn recursion_is_reported() {
        // 13 JSR ->21; 19 RETN; 21 JSR ->21; 27 RETN
        let t = tree(vec![jsr(8), retn(), jsr(0), retn()]);
        let s = sigs(&t);
        assert!(matches!(s[1], Err(SubroutineError::RecursiveSignature { start: 21 })));
        assert!(s[0].is_err());
    }

    #[test]
    fn action_signatures_drive_the_stack() {
        let table = NwscriptTable::parse("int Random(int n);\nvoid PrintInteger(int n);").unwrap();
        let t = tree(vec![const_int(6), action(0, 1), action(1, 1), retn()]);
        let frame = global_frame(&t, &table);
        let s = analyze(&t, &table, &frame);
        let main = s[0].as_ref().unwrap();
        assert!(!main.implicit_return);
        assert!(main.params.is_empty());

        // Without the table, the void action is assumed to return an int.
        let s = sigs(&t);
        assert!(s[0].as_ref().unwrap().implicit_return);
    }

    #[test]
    fn globals_frame_ends_with_saved_bp() {
        // 13 JSR ->21; 19 RETN; 21 RSADDI; 23 RSADDS; 25 SAVEBP; 27 JSR ->43;
        // 33 RESTOREBP; 35 MOVSP -8; 41 RETN; 43 CPTOPBP -12,4; 51 MOVSP -4; 57 RETN
        let t = tree(vec![
            jsr(8),
            retn(),
            rsadd(NcsType::Int),
            rsadd(NcsType::String),
            savebp(),
            jsr(16),
            restorebp(),
            movsp(-8),
            retn(),
            cptopbp(-12, 4),
            movsp(-4),
            retn(),
        ]);
        let frame = global_frame(&t, &EmptyTable);
        assert_eq!(frame.owner, Some(1));
        assert_eq!(frame.slots.len(), 3);
        assert_eq!(frame.slots.get(0).unwrap().ty, NcsType::Int);
        assert_eq!(frame.slots.get(1).unwrap().ty, NcsType::String);
        let s = analyze(&t, &EmptyTable, &frame);
        assert!(s.iter().all(|r| r.is_ok()), "{s:?}");
        assert!(s[2].as_ref().unwrap().params.is_empty());
    }
}
