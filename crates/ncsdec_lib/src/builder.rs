use std::collections::BTreeSet;

use tracing::debug;

use crate::error::NcsError;
use crate::instr::{Instr, Operand};
use crate::node::{
    Arena, BinaryOp, BpOp, CmdKind, Command, CommandOp, CondKind, Constant, LogiiOp, NodeId, NodeKind, ParentTable,
    StackOpKind, UnaryOp,
};
use crate::tables::op;
use crate::types::{NcsType, OperandPair};

/// Node tree of one program: Program -> Subroutine -> Block -> commands.
#[derive(Debug, Clone)]
pub struct NodeTree {
    pub arena: Arena,
    pub root: NodeId,
    pub subroutines: Vec<NodeId>,
}

impl NodeTree {
    pub fn parents(&self) -> ParentTable {
        ParentTable::build(&self.arena)
    }

    pub fn conditional(&self) -> bool {
        matches!(self.arena.kind(self.root), NodeKind::Program { conditional: true })
    }

    /// `(start, end)` of a subroutine node.
    pub fn bounds(&self, sub: NodeId) -> (usize, usize) {
        match self.arena.kind(sub) {
            NodeKind::Subroutine { start, end } => (*start, *end),
            _ => (0, 0),
        }
    }

    /// Command block of a subroutine.
    pub fn block(&self, sub: NodeId) -> NodeId {
        self.arena.children(sub)[0]
    }

    pub fn subroutine_at(&self, pos: usize) -> Option<usize> {
        self.subroutines.iter().position(|s| self.bounds(*s).0 == pos)
    }
}

fn mismatch(ins: &Instr) -> NcsError {
    NcsError::OperandMismatch {
        pos: ins.pos,
        name: ins.name,
    }
}

fn pair(ins: &Instr) -> Result<OperandPair, NcsError> {
    OperandPair::from_qualifier(ins.qual).ok_or(NcsError::InvalidQualifier {
        pos: ins.pos,
        name: ins.name,
        qual: ins.qual,
    })
}

fn single(ins: &Instr) -> Result<NcsType, NcsError> {
    NcsType::from_qualifier(ins.qual).ok_or(NcsError::InvalidQualifier {
        pos: ins.pos,
        name: ins.name,
        qual: ins.qual,
    })
}

fn binary_op(code: u8) -> Option<BinaryOp> {
    Some(match code {
        op::EQUAL => BinaryOp::Equal,
        op::NEQUAL => BinaryOp::NotEqual,
        op::GEQ => BinaryOp::Geq,
        op::GT => BinaryOp::Gt,
        op::LT => BinaryOp::Lt,
        op::LEQ => BinaryOp::Leq,
        op::SHLEFT => BinaryOp::ShiftLeft,
        op::SHRIGHT => BinaryOp::ShiftRight,
        op::USHRIGHT => BinaryOp::UnsignedShiftRight,
        op::ADD => BinaryOp::Add,
        op::SUB => BinaryOp::Sub,
        op::MUL => BinaryOp::Mul,
        op::DIV => BinaryOp::Div,
        op::MOD => BinaryOp::Mod,
        _ => return None,
    })
}

/// Lifts one instruction into its typed command. Returns `None` for the
/// instructions that are not commands (RETN, NOP).
pub fn lift_command(ins: &Instr) -> Result<Option<Command>, NcsError> {
    let copy = || match ins.operand {
        Operand::StackCopy { offset, size } => Ok((offset, size)),
        _ => Err(mismatch(ins)),
    };
    let offset = || match ins.operand {
        Operand::Offset(o) => Ok(o),
        _ => Err(mismatch(ins)),
    };

    let cmd_op = match ins.op {
        op::RETN | op::NOP => return Ok(None),
        op::RSADD => CommandOp::RsAdd(single(ins)?),
        op::CONST => {
            let expected = single(ins)?;
            let value = match &ins.operand {
                Operand::Int(v) => Constant::Int(*v),
                Operand::Float(v) => Constant::Float(*v),
                Operand::Str(s) => Constant::String(s.clone()),
                Operand::Object(v) => Constant::Object(*v),
                _ => return Err(mismatch(ins)),
            };
            if value.ty() != expected {
                return Err(NcsError::ConstantKind {
                    pos: ins.pos,
                    expected,
                    found: value.ty(),
                });
            }
            CommandOp::Const(value)
        }
        op::CPDOWNSP => {
            let (offset, size) = copy()?;
            CommandOp::CopyDownSp { offset, size }
        }
        op::CPTOPSP => {
            let (offset, size) = copy()?;
            CommandOp::CopyTopSp { offset, size }
        }
        op::CPDOWNBP => {
            let (offset, size) = copy()?;
            CommandOp::CopyDownBp { offset, size }
        }
        op::CPTOPBP => {
            let (offset, size) = copy()?;
            CommandOp::CopyTopBp { offset, size }
        }
        op::ACTION => match ins.operand {
            Operand::Action { id, argc } => CommandOp::Action { id, argc },
            _ => return Err(mismatch(ins)),
        },
        op::LOGANDII => CommandOp::Logii(LogiiOp::And),
        op::LOGORII => CommandOp::Logii(LogiiOp::Or),
        op::INCORII => CommandOp::Logii(LogiiOp::InclusiveOr),
        op::EXCORII => CommandOp::Logii(LogiiOp::ExclusiveOr),
        op::BOOLANDII => CommandOp::Logii(LogiiOp::BitAnd),
        op::USHRIGHT => {
            return Err(NcsError::UnsupportedOperator {
                pos: ins.pos,
                name: ins.name,
            });
        }
        code if binary_op(code).is_some() => {
            let bop = binary_op(code).ok_or_else(|| mismatch(ins))?;
            let pair = pair(ins)?;
            let size = match (pair, &ins.operand) {
                (OperandPair::TT, Operand::Size(s)) => Some(*s),
                (OperandPair::TT, _) => return Err(mismatch(ins)),
                (_, Operand::None) => None,
                _ => return Err(mismatch(ins)),
            };
            CommandOp::Binary { op: bop, pair, size }
        }
        op::NEG => CommandOp::Unary {
            op: UnaryOp::Neg,
            ty: single(ins)?,
        },
        op::COMP => CommandOp::Unary {
            op: UnaryOp::Comp,
            ty: single(ins)?,
        },
        op::NOT => CommandOp::Unary {
            op: UnaryOp::Not,
            ty: single(ins)?,
        },
        op::MOVSP => CommandOp::MoveSp { delta: offset()? },
        op::STORE_STATEALL => CommandOp::StoreState {
            bp_size: 0,
            sp_size: 0,
            all: true,
        },
        op::STORE_STATE => match ins.operand {
            Operand::StoreState { bp_size, sp_size } => CommandOp::StoreState {
                bp_size,
                sp_size,
                all: false,
            },
            _ => return Err(mismatch(ins)),
        },
        op::JMP => CommandOp::Jump { offset: offset()? },
        op::JSR => CommandOp::Jsr { offset: offset()? },
        op::JZ => CommandOp::CondJump {
            kind: CondKind::Zero,
            offset: offset()?,
        },
        op::JNZ => CommandOp::CondJump {
            kind: CondKind::NonZero,
            offset: offset()?,
        },
        op::DESTRUCT => match ins.operand {
            Operand::Destruct {
                size,
                exclude_offset,
                exclude_size,
            } => CommandOp::Destruct {
                size,
                exclude_offset,
                exclude_size,
            },
            _ => return Err(mismatch(ins)),
        },
        op::SAVEBP => CommandOp::Bp(BpOp::Save),
        op::RESTOREBP => CommandOp::Bp(BpOp::Restore),
        op::INCISP | op::DECISP | op::INCIBP | op::DECIBP => {
            let kind = match ins.op {
                op::INCISP => StackOpKind::IncSp,
                op::DECISP => StackOpKind::DecSp,
                op::INCIBP => StackOpKind::IncBp,
                _ => StackOpKind::DecBp,
            };
            CommandOp::StackOp {
                kind,
                offset: offset()?,
            }
        }
        other => return Err(NcsError::InvalidOpcode { pos: ins.pos, op: other }),
    };

    Ok(Some(Command {
        pos: ins.pos,
        len: ins.len(),
        qual: ins.qual,
        op: cmd_op,
    }))
}

fn command_kind(arena: &Arena, id: NodeId) -> Option<CmdKind> {
    arena.unwrap_command(id).map(|c| c.kind())
}

/// Moves `nodes` under `block`, nesting the body of each deferred action
/// (`STORE_STATE; JMP over; body; over:`) under its store-state command.
fn place(arena: &mut Arena, block: NodeId, nodes: &[NodeId]) {
    let mut i = 0usize;
    while i < nodes.len() {
        let id = nodes[i];
        arena.attach(block, id);
        i += 1;

        if command_kind(arena, id) != Some(CmdKind::StoreState) {
            continue;
        }
        let Some(&jump) = nodes.get(i) else { continue };
        let target = match arena.unwrap_command(jump) {
            Some(Command {
                pos,
                op: CommandOp::Jump { offset },
                ..
            }) if *offset > 0 => pos + *offset as usize,
            _ => continue,
        };
        let inner = arena.children(id)[0];
        arena.attach(inner, jump);
        let body = arena.alloc_child(inner, NodeKind::Block);
        let body_start = i + 1;
        let mut j = body_start;
        while j < nodes.len() && arena.position(nodes[j]).is_some_and(|p| p < target) {
            j += 1;
        }
        let body_nodes = nodes[body_start..j].to_vec();
        place(arena, body, &body_nodes);
        i = j;
    }
}

/// Builds the node tree for a decoded instruction stream.
pub fn build(instrs: &[Instr]) -> Result<NodeTree, NcsError> {
    if instrs.is_empty() {
        return Err(NcsError::Empty);
    }

    let mut arena = Arena::new();
    let staging = arena.alloc(NodeKind::Block);
    for ins in instrs {
        match lift_command(ins)? {
            Some(cmd) => {
                arena.alloc_command(staging, cmd);
            }
            None if ins.op == op::RETN => {
                arena.alloc_child(staging, NodeKind::Return { pos: ins.pos });
            }
            None => {}
        }
    }

    let positions: BTreeSet<usize> = instrs.iter().map(|i| i.pos).collect();
    let mut starts: BTreeSet<usize> = BTreeSet::new();
    starts.insert(instrs[0].pos);
    for ins in instrs.iter().filter(|i| i.op == op::JSR) {
        if let Some(t) = ins.jump_target().filter(|t| positions.contains(t)) {
            starts.insert(t);
        }
    }

    let staged = arena.take_children(staging);
    let first_kinds: Vec<Option<CmdKind>> = staged.iter().take(2).map(|n| command_kind(&arena, *n)).collect();
    let conditional = first_kinds == [Some(CmdKind::RsAdd), Some(CmdKind::Jsr)];
    let root = arena.alloc(NodeKind::Program { conditional });

    let starts: Vec<usize> = starts.into_iter().collect();
    let mut subroutines = Vec::with_capacity(starts.len());
    let mut cursor = 0usize;
    for (k, start) in starts.iter().enumerate() {
        let limit = starts.get(k + 1).copied().unwrap_or(usize::MAX);
        let begin = cursor;
        while cursor < staged.len() && arena.position(staged[cursor]).is_some_and(|p| p < limit) {
            cursor += 1;
        }
        let members = &staged[begin..cursor];
        let end = members
            .iter()
            .filter_map(|n| match arena.kind(*n) {
                NodeKind::Return { pos } => Some(*pos),
                _ => None,
            })
            .max()
            .ok_or(NcsError::MissingReturn { start: *start })?;

        let sub = arena.alloc_child(root, NodeKind::Subroutine { start: *start, end });
        let block = arena.alloc_child(sub, NodeKind::Block);
        place(&mut arena, block, members);
        subroutines.push(sub);
    }

    debug!(subroutines = subroutines.len(), conditional, nodes = arena.len(), "built node tree");
    Ok(NodeTree {
        arena,
        root,
        subroutines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::asm::*;
    use crate::instr::layout;

    fn tree(mut v: Vec<Instr>) -> NodeTree {
        layout(&mut v);
        build(&v).unwrap()
    }

    #[test]
    fn splits_subroutines_at_call_targets() {
        // 13: JSR +8 -> 21; 19: RETN; 21: CONST; 27: MOVSP; 33: RETN
        let t = tree(vec![jsr(8), retn(), const_int(1), movsp(-4), retn()]);
        assert_eq!(t.subroutines.len(), 2);
        assert_eq!(t.bounds(t.subroutines[0]), (13, 19));
        assert_eq!(t.bounds(t.subroutines[1]), (21, 33));
        assert!(!t.conditional());
        let block = t.block(t.subroutines[1]);
        assert_eq!(t.arena.children(block).len(), 3);
        let parents = t.parents();
        assert_eq!(parents.parent(block), Some(t.subroutines[1]));
        assert_eq!(parents.parent(t.subroutines[1]), Some(t.root));
    }

    #[test]
    fn rsadd_before_entry_call_marks_conditional_script() {
        let t = tree(vec![rsadd(NcsType::Int), jsr(8), retn(), const_int(1), retn()]);
        assert!(t.conditional());
    }

    #[test]
    fn deferred_action_body_is_nested_under_store_state() {
        // 13 JSR ->21, 19 RETN, 21 STORE_STATE, 31 JMP ->44, 37 ACTION, 42 RETN, 44 ACTION
        let mut v = vec![
            jsr(8),
            retn(),
            store_state(0, 0),
            jmp(13),
            action(1, 0),
            retn(),
            action(7, 1),
            retn(),
        ];
        layout(&mut v);
        assert_eq!(v[3].jump_target(), Some(v[6].pos));
        let t = build(&v).unwrap();
        let block = t.block(t.subroutines[1]);
        let top: Vec<Option<CmdKind>> = t
            .arena
            .children(block)
            .iter()
            .map(|n| t.arena.unwrap_command(*n).map(|c| c.kind()))
            .collect();
        assert_eq!(top, vec![Some(CmdKind::StoreState), Some(CmdKind::Action), None]);
        let store = t.arena.children(block)[0];
        let inner = t.arena.children(store)[0];
        let nested = t.arena.children(inner);
        assert_eq!(nested.len(), 2);
        assert_eq!(t.arena.unwrap_command(nested[0]).unwrap().kind(), CmdKind::Jump);
        assert_eq!(t.arena.children(nested[1]).len(), 2);
        assert_eq!(t.bounds(t.subroutines[1]).1, v[7].pos);
    }

    #[test]
    fn unsigned_shift_is_fatal() {
        let mut v = vec![binary(op::USHRIGHT, OperandPair::II), retn()];
        layout(&mut v);
        assert!(matches!(build(&v), Err(NcsError::UnsupportedOperator { name: "USHRIGHT", .. })));
    }

    #[test]
    fn constant_type_must_match_qualifier() {
        let mut bad = const_int(3);
        bad.qual = crate::types::QUAL_FLOAT;
        let mut v = vec![bad, retn()];
        layout(&mut v);
        assert!(matches!(
            build(&v),
            Err(NcsError::ConstantKind {
                expected: NcsType::Float,
                found: NcsType::Int,
                ..
            })
        ));
    }

    #[test]
    fn subroutine_without_return_is_fatal() {
        let t = {
            let mut v = vec![jsr(8), retn(), const_int(1)];
            layout(&mut v);
            build(&v)
        };
        assert!(matches!(t, Err(NcsError::MissingReturn { .. })));
    }

    #[test]
    fn nop_produces_no_node() {
        let t = tree(vec![nop(), retn()]);
        assert_eq!(t.arena.children(t.block(t.subroutines[0])).len(), 1);
    }
}
