//! Stateless helpers over the node tree: classification, operand extraction,
//! stack arithmetic and operator symbols.

use crate::error::NcsError;
use crate::node::{
    Arena, BinaryOp, CmdKind, Command, CommandOp, CondKind, Constant, LogiiOp, NodeId, NodeKind, StackOpKind, UnaryOp,
};
use crate::types::{NcsType, OperandPair, SLOT_BYTES};

/// Width in bytes of a JZ/JNZ/JMP instruction.
pub const JUMP_LEN: i32 = 6;

fn command(arena: &Arena, id: NodeId) -> Option<&Command> {
    arena.unwrap_command(id)
}

pub fn command_kind(arena: &Arena, id: NodeId) -> Option<CmdKind> {
    command(arena, id).map(|c| c.kind())
}

/// True for nodes that stand for one of the 18 command families.
pub fn is_command_node(arena: &Arena, id: NodeId) -> bool {
    matches!(arena.kind(id), NodeKind::Cmd(_) | NodeKind::Command(_))
}

pub fn is_kind(arena: &Arena, id: NodeId, kind: CmdKind) -> bool {
    command_kind(arena, id) == Some(kind)
}

pub fn is_return(arena: &Arena, id: NodeId) -> bool {
    matches!(arena.kind(id), NodeKind::Return { .. })
}

pub fn is_jump(arena: &Arena, id: NodeId) -> bool {
    matches!(
        command_kind(arena, id),
        Some(CmdKind::Jump | CmdKind::CondJump | CmdKind::Jsr)
    )
}

pub fn is_jz(arena: &Arena, id: NodeId) -> bool {
    matches!(
        command(arena, id),
        Some(Command {
            op: CommandOp::CondJump { kind: CondKind::Zero, .. },
            ..
        })
    )
}

/// Commands that only move or reshape the stack.
pub fn is_stack_op(arena: &Arena, id: NodeId) -> bool {
    matches!(
        command_kind(arena, id),
        Some(
            CmdKind::RsAdd
                | CmdKind::CopyDownSp
                | CmdKind::CopyTopSp
                | CmdKind::CopyDownBp
                | CmdKind::CopyTopBp
                | CmdKind::MoveSp
                | CmdKind::Destruct
                | CmdKind::StackOp
        )
    )
}

pub fn command_pos(arena: &Arena, id: NodeId) -> Option<usize> {
    command(arena, id).map(|c| c.pos)
}

/// Jump destination: instruction position plus its signed offset.
pub fn jump_destination(arena: &Arena, id: NodeId) -> Option<usize> {
    let c = command(arena, id)?;
    let rel = match c.op {
        CommandOp::Jump { offset } | CommandOp::Jsr { offset } | CommandOp::CondJump { offset, .. } => offset,
        _ => return None,
    };
    let t = c.pos as i64 + rel as i64;
    (t >= 0).then_some(t as usize)
}

/// A JZ over exactly one following jump to the same destination: both
/// outcomes continue at the same place, so the guard has an empty body.
pub fn is_jz_past_one(arena: &Arena, block: NodeId, id: NodeId) -> bool {
    let Some(Command {
        pos,
        op: CommandOp::CondJump {
            kind: CondKind::Zero,
            offset,
        },
        ..
    }) = command(arena, id)
    else {
        return false;
    };
    if *offset != 2 * JUMP_LEN {
        return false;
    }
    let dest = pos + *offset as usize;
    match next_command(arena, block, *pos) {
        Some(next) => is_kind(arena, next, CmdKind::Jump) && jump_destination(arena, next) == Some(dest),
        None => false,
    }
}

/// A conditional jump to the instruction right after itself.
pub fn is_jump_to_next(arena: &Arena, id: NodeId) -> bool {
    matches!(
        command(arena, id),
        Some(Command {
            op: CommandOp::CondJump { offset: JUMP_LEN, .. },
            ..
        })
    )
}

/// Right-operand regions of short-circuit ORs in a block, as half-open
/// position ranges `[start, or_pos)`.
pub fn or_regions(arena: &Arena, block: NodeId) -> Vec<(usize, usize)> {
    let children = arena.children(block);
    let mut regions = Vec::new();
    for (i, id) in children.iter().enumerate() {
        let Some(c) = command(arena, *id) else { continue };
        if c.op != CommandOp::Logii(LogiiOp::Or) {
            continue;
        }
        let join = c.end();
        let guard = children[..i].iter().rev().find(|g| {
            matches!(command_kind(arena, **g), Some(CmdKind::Jump | CmdKind::CondJump))
                && jump_destination(arena, **g) == Some(join)
        });
        if let Some(g) = guard {
            if let Some(gc) = command(arena, *g) {
                regions.push((gc.end(), c.pos));
            }
        }
    }
    regions
}

/// Whether a command unconditionally pushes onto the stack. False for a
/// logical OR and for everything in the conditionally evaluated right
/// operand of a short-circuit OR.
pub fn is_store_stack_node(arena: &Arena, block: NodeId, id: NodeId) -> bool {
    let Some(c) = command(arena, id) else {
        return false;
    };
    if c.op == CommandOp::Logii(LogiiOp::Or) {
        return false;
    }
    !or_regions(arena, block)
        .iter()
        .any(|(start, end)| (*start..*end).contains(&c.pos))
}

fn constant(arena: &Arena, id: NodeId, expected: NcsType) -> Result<&Constant, NcsError> {
    match command(arena, id) {
        Some(Command {
            pos,
            op: CommandOp::Const(v),
            ..
        }) => {
            if v.ty() == expected {
                Ok(v)
            } else {
                Err(NcsError::ConstantKind {
                    pos: *pos,
                    expected,
                    found: v.ty(),
                })
            }
        }
        _ => Err(NcsError::ConstantKind {
            pos: arena.position(id).unwrap_or(0),
            expected,
            found: NcsType::Void,
        }),
    }
}

fn kind_error(arena: &Arena, id: NodeId, expected: NcsType, found: &Constant) -> NcsError {
    NcsError::ConstantKind {
        pos: arena.position(id).unwrap_or(0),
        expected,
        found: found.ty(),
    }
}

pub fn int_const(arena: &Arena, id: NodeId) -> Result<i32, NcsError> {
    match constant(arena, id, NcsType::Int)? {
        Constant::Int(v) => Ok(*v),
        other => Err(kind_error(arena, id, NcsType::Int, other)),
    }
}

pub fn float_const(arena: &Arena, id: NodeId) -> Result<f32, NcsError> {
    match constant(arena, id, NcsType::Float)? {
        Constant::Float(v) => Ok(*v),
        other => Err(kind_error(arena, id, NcsType::Float, other)),
    }
}

pub fn string_const<'a>(arena: &'a Arena, id: NodeId) -> Result<&'a str, NcsError> {
    match constant(arena, id, NcsType::String)? {
        Constant::String(v) => Ok(v),
        other => Err(kind_error(arena, id, NcsType::String, other)),
    }
}

pub fn object_const(arena: &Arena, id: NodeId) -> Result<i32, NcsError> {
    match constant(arena, id, NcsType::Object)? {
        Constant::Object(v) => Ok(*v),
        other => Err(kind_error(arena, id, NcsType::Object, other)),
    }
}

pub fn action_id(arena: &Arena, id: NodeId) -> Option<u16> {
    match command(arena, id)?.op {
        CommandOp::Action { id, .. } => Some(id),
        _ => None,
    }
}

pub fn action_argc(arena: &Arena, id: NodeId) -> Option<u8> {
    match command(arena, id)?.op {
        CommandOp::Action { argc, .. } => Some(argc),
        _ => None,
    }
}

pub fn binary_symbol(op: BinaryOp, pos: usize) -> Result<&'static str, NcsError> {
    Ok(match op {
        BinaryOp::Equal => "==",
        BinaryOp::NotEqual => "!=",
        BinaryOp::Geq => ">=",
        BinaryOp::Gt => ">",
        BinaryOp::Lt => "<",
        BinaryOp::Leq => "<=",
        BinaryOp::ShiftLeft => "<<",
        BinaryOp::ShiftRight => ">>",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::UnsignedShiftRight => {
            return Err(NcsError::UnsupportedOperator { pos, name: "USHRIGHT" });
        }
    })
}

pub fn unary_symbol(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Comp => "~",
        UnaryOp::Not => "!",
    }
}

pub fn logii_symbol(op: LogiiOp) -> &'static str {
    match op {
        LogiiOp::And => "&&",
        LogiiOp::Or => "||",
        LogiiOp::InclusiveOr => "|",
        LogiiOp::ExclusiveOr => "^",
        LogiiOp::BitAnd => "&",
    }
}

pub fn stack_op_symbol(kind: StackOpKind) -> &'static str {
    match kind {
        StackOpKind::IncSp | StackOpKind::IncBp => "++",
        StackOpKind::DecSp | StackOpKind::DecBp => "--",
    }
}

/// Operator symbol of a unary, binary, logical or increment command.
pub fn operator_symbol(arena: &Arena, id: NodeId) -> Result<&'static str, NcsError> {
    let c = command(arena, id).ok_or(NcsError::UnsupportedOperator {
        pos: arena.position(id).unwrap_or(0),
        name: "<none>",
    })?;
    match c.op {
        CommandOp::Binary { op, .. } => binary_symbol(op, c.pos),
        CommandOp::Unary { op, .. } => Ok(unary_symbol(op)),
        CommandOp::Logii(op) => Ok(logii_symbol(op)),
        CommandOp::StackOp { kind, .. } => Ok(stack_op_symbol(kind)),
        _ => Err(NcsError::UnsupportedOperator {
            pos: c.pos,
            name: "<not an operator>",
        }),
    }
}

/// Stack slots taken by the left and right operand of a binary command.
pub fn binary_operand_widths(pair: OperandPair, size: Option<u16>) -> (usize, usize) {
    if pair == OperandPair::TT {
        let w = size.map(|s| s as usize / SLOT_BYTES as usize).unwrap_or(1);
        return (w, w);
    }
    let (l, r) = pair.types();
    (l.width(), r.width())
}

/// Result type and slot width of a binary command.
pub fn binary_result(op: BinaryOp, pair: OperandPair) -> (NcsType, usize) {
    if op.is_comparison() {
        return (NcsType::Int, 1);
    }
    let ty = match pair {
        OperandPair::II => NcsType::Int,
        OperandPair::FF | OperandPair::IF | OperandPair::FI => NcsType::Float,
        OperandPair::SS => NcsType::String,
        OperandPair::VV | OperandPair::VF | OperandPair::FV => NcsType::Vector,
        OperandPair::OO => NcsType::Object,
        OperandPair::EE(n) => NcsType::Engine(n),
        OperandPair::TT => NcsType::Int,
    };
    let width = if pair.involves_vector() { 3 } else { 1 };
    (widen(ty, width), width)
}

/// A three-slot intermediate that is not a vector is typed as float.
pub fn widen(ty: NcsType, width: usize) -> NcsType {
    if width == 3 && ty != NcsType::Vector {
        NcsType::Float
    } else {
        ty
    }
}

/// Byte offset to stack slot, sign preserving.
pub fn slot(byte_offset: i32) -> i32 {
    byte_offset / SLOT_BYTES
}

pub fn byte(slot: i32) -> i32 {
    slot * SLOT_BYTES
}

/// Slots freed by removing the first `n` parameters of the given types.
pub fn removed_param_slots(types: &[NcsType], n: usize) -> usize {
    types.iter().take(n).map(|t| t.width() * SLOT_BYTES as usize).sum::<usize>() / SLOT_BYTES as usize
}

/// Last command in `block` positioned before `pos`.
pub fn previous_command(arena: &Arena, block: NodeId, pos: usize) -> Option<NodeId> {
    arena
        .children(block)
        .iter()
        .rev()
        .copied()
        .find(|id| command_pos(arena, *id).is_some_and(|p| p < pos))
}

/// First command in `block` positioned after `pos`.
pub fn next_command(arena: &Arena, block: NodeId, pos: usize) -> Option<NodeId> {
    arena
        .children(block)
        .iter()
        .copied()
        .find(|id| command_pos(arena, *id).is_some_and(|p| p > pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::instr::asm::*;
    use crate::instr::{layout, Instr};
    use crate::tables::op;

    fn block_of(mut v: Vec<Instr>) -> (crate::builder::NodeTree, NodeId) {
        layout(&mut v);
        let t = build(&v).unwrap();
        let b = t.block(t.subroutines[0]);
        (t, b)
    }

    fn nth(t: &crate::builder::NodeTree, b: NodeId, i: usize) -> NodeId {
        t.arena.children(b)[i]
    }

    #[test]
    fn classification_is_mutually_exclusive() {
        let (t, b) = block_of(vec![
            rsadd(NcsType::Int),
            store_state(0, 0),
            const_int(1),
            cpdownsp(-8, 4),
            cptopsp(-4, 4),
            cpdownbp(-4, 4),
            cptopbp(-4, 4),
            jz(6),
            jmp(6),
            jsr(-62),
            movsp(-4),
            binary(op::LOGANDII, OperandPair::II),
            unary(op::NEG, NcsType::Int),
            binary(op::ADD, OperandPair::II),
            destruct(8, 0, 4),
            savebp(),
            action(0, 0),
            incisp(-4),
            retn(),
        ]);
        let a = &t.arena;
        let mut seen = Vec::new();
        for id in a.children(b).iter().copied() {
            let hits: Vec<CmdKind> = CmdKind::ALL.iter().copied().filter(|k| is_kind(a, id, *k)).collect();
            if is_return(a, id) {
                assert!(hits.is_empty());
                assert!(!is_command_node(a, id));
                continue;
            }
            assert!(is_command_node(a, id));
            assert_eq!(hits.len(), 1, "{:?}", a.kind(id));
            assert_eq!(hits, vec![command_kind(a, id).unwrap()]);
            assert_eq!(command_kind(a, id), command_kind(a, id));
            seen.push(hits[0]);
        }
        for k in CmdKind::ALL {
            assert!(seen.contains(&k), "{k:?} not covered");
        }
    }

    #[test]
    fn jump_destination_adds_signed_offset() {
        let (t, b) = block_of(vec![jmp(6), jz(-6), retn()]);
        assert_eq!(jump_destination(&t.arena, nth(&t, b, 0)), Some(19));
        assert_eq!(jump_destination(&t.arena, nth(&t, b, 1)), Some(13));
        assert!(is_jz(&t.arena, nth(&t, b, 1)));
        assert!(!is_jz(&t.arena, nth(&t, b, 0)));
        assert!(is_jump(&t.arena, nth(&t, b, 0)));
    }

    #[test]
    fn jz_past_one_needs_jump_to_same_destination() {
        // 13 CONST, 19 JZ +12 -> 31, 25 JMP +6 -> 31, 31 RETN
        let (t, b) = block_of(vec![const_int(1), jz(12), jmp(6), retn()]);
        assert!(is_jz_past_one(&t.arena, b, nth(&t, b, 1)));

        let (t, b) = block_of(vec![const_int(1), jz(12), jmp(20), retn(), retn()]);
        assert!(!is_jz_past_one(&t.arena, b, nth(&t, b, 1)));

        let (t, b) = block_of(vec![const_int(1), jz(6), retn()]);
        assert!(is_jump_to_next(&t.arena, nth(&t, b, 1)));
        assert!(!is_jz_past_one(&t.arena, b, nth(&t, b, 1)));
    }

    #[test]
    fn constants_check_their_type() {
        let (t, b) = block_of(vec![const_int(7), const_float(2.5), const_string("x"), const_object(0), retn()]);
        let a = &t.arena;
        assert_eq!(int_const(a, nth(&t, b, 0)).unwrap(), 7);
        assert_eq!(float_const(a, nth(&t, b, 1)).unwrap(), 2.5);
        assert_eq!(string_const(a, nth(&t, b, 2)).unwrap(), "x");
        assert_eq!(object_const(a, nth(&t, b, 3)).unwrap(), 0);
        assert!(matches!(
            int_const(a, nth(&t, b, 1)),
            Err(NcsError::ConstantKind {
                expected: NcsType::Int,
                found: NcsType::Float,
                ..
            })
        ));
        assert!(string_const(a, nth(&t, b, 4)).is_err());
    }

    #[test]
    fn operator_symbols() {
        let (t, b) = block_of(vec![
            binary(op::GEQ, OperandPair::FF),
            binary(op::LOGORII, OperandPair::II),
            unary(op::COMP, NcsType::Int),
            decisp(-4),
            action(3, 0),
            retn(),
        ]);
        let a = &t.arena;
        assert_eq!(operator_symbol(a, nth(&t, b, 0)).unwrap(), ">=");
        assert_eq!(operator_symbol(a, nth(&t, b, 1)).unwrap(), "||");
        assert_eq!(operator_symbol(a, nth(&t, b, 2)).unwrap(), "~");
        assert_eq!(operator_symbol(a, nth(&t, b, 3)).unwrap(), "--");
        assert!(operator_symbol(a, nth(&t, b, 4)).is_err());
        assert!(matches!(
            binary_symbol(BinaryOp::UnsignedShiftRight, 40),
            Err(NcsError::UnsupportedOperator { pos: 40, .. })
        ));
        assert_eq!(action_id(a, nth(&t, b, 4)), Some(3));
        assert_eq!(action_argc(a, nth(&t, b, 4)), Some(0));
    }

    #[test]
    fn slot_conversion_is_symmetric() {
        for b in (-4096..=4096).step_by(4) {
            assert_eq!(slot(b), b / 4);
            assert_eq!(byte(slot(b)), b);
        }
        assert_eq!(slot(-12), -3);
    }

    #[test]
    fn vector_operators_are_three_slots_wide() {
        let pairs = [
            OperandPair::II,
            OperandPair::FF,
            OperandPair::OO,
            OperandPair::SS,
            OperandPair::IF,
            OperandPair::FI,
            OperandPair::EE(2),
            OperandPair::VV,
            OperandPair::VF,
            OperandPair::FV,
        ];
        for pair in pairs {
            let (l, r) = binary_operand_widths(pair, None);
            let (lt, rt) = pair.types();
            assert_eq!(l, if lt == NcsType::Vector { 3 } else { 1 });
            assert_eq!(r, if rt == NcsType::Vector { 3 } else { 1 });
            for op in [BinaryOp::Add, BinaryOp::Mul] {
                let (ty, w) = binary_result(op, pair);
                assert_eq!(w, if ty == NcsType::Vector { 3 } else { 1 });
            }
        }
        assert_eq!(binary_result(BinaryOp::Equal, OperandPair::VV), (NcsType::Int, 1));
        assert_eq!(binary_operand_widths(OperandPair::TT, Some(12)), (3, 3));
    }

    #[test]
    fn three_wide_non_vector_widens_to_float() {
        assert_eq!(widen(NcsType::Int, 3), NcsType::Float);
        assert_eq!(widen(NcsType::Vector, 3), NcsType::Vector);
        assert_eq!(widen(NcsType::Int, 1), NcsType::Int);
    }

    #[test]
    fn removed_params_sum_widths() {
        let types = [NcsType::Vector, NcsType::Int, NcsType::Action, NcsType::Float];
        assert_eq!(removed_param_slots(&types, 0), 0);
        assert_eq!(removed_param_slots(&types, 2), 4);
        assert_eq!(removed_param_slots(&types, 4), 5);
    }

    #[test]
    fn sequential_lookup() {
        let (t, b) = block_of(vec![const_int(1), const_int(2), movsp(-8), retn()]);
        let a = &t.arena;
        assert_eq!(next_command(a, b, 13), Some(nth(&t, b, 1)));
        assert_eq!(previous_command(a, b, 25), Some(nth(&t, b, 1)));
        assert_eq!(previous_command(a, b, 13), None);
        assert_eq!(next_command(a, b, 25), None);
    }

    #[test]
    fn or_right_operand_is_not_a_store() {
        // a; CPTOPSP; JZ +12; JMP join; ACTION f(); LOGORII; join: RETN
        let (t, b) = block_of(vec![
            const_int(0),
            cptopsp(-4, 4),
            jz(12),
            jmp(13),
            action(5, 0),
            binary(op::LOGORII, OperandPair::II),
            retn(),
        ]);
        let a = &t.arena;
        assert!(is_store_stack_node(a, b, nth(&t, b, 0)));
        assert!(!is_store_stack_node(a, b, nth(&t, b, 4)));
        assert!(!is_store_stack_node(a, b, nth(&t, b, 5)));
    }
}
