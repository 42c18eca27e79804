//! Node tree storage.
//!
//! Nodes live in a per-program [`Arena`] and refer to each other by [`NodeId`].
//! A node records only its children; the child-to-parent mapping is a separate
//! [`ParentTable`] rebuilt from the arena when it is needed.

use crate::types::{NcsType, OperandPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The 18 command families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdKind {
    RsAdd,
    StoreState,
    Const,
    CopyDownSp,
    CopyTopSp,
    CopyDownBp,
    CopyTopBp,
    CondJump,
    Jump,
    Jsr,
    MoveSp,
    Logii,
    Unary,
    Binary,
    Destruct,
    Bp,
    Action,
    StackOp,
}

impl CmdKind {
    pub const ALL: [CmdKind; 18] = [
        CmdKind::RsAdd,
        CmdKind::StoreState,
        CmdKind::Const,
        CmdKind::CopyDownSp,
        CmdKind::CopyTopSp,
        CmdKind::CopyDownBp,
        CmdKind::CopyTopBp,
        CmdKind::CondJump,
        CmdKind::Jump,
        CmdKind::Jsr,
        CmdKind::MoveSp,
        CmdKind::Logii,
        CmdKind::Unary,
        CmdKind::Binary,
        CmdKind::Destruct,
        CmdKind::Bp,
        CmdKind::Action,
        CmdKind::StackOp,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    String(String),
    Object(i32),
}

impl Constant {
    pub fn ty(&self) -> NcsType {
        match self {
            Constant::Int(_) => NcsType::Int,
            Constant::Float(_) => NcsType::Float,
            Constant::String(_) => NcsType::String,
            Constant::Object(_) => NcsType::Object,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogiiOp {
    And,
    Or,
    InclusiveOr,
    ExclusiveOr,
    BitAnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    Geq,
    Gt,
    Lt,
    Leq,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal | BinaryOp::NotEqual | BinaryOp::Geq | BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Leq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Comp,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    Zero,
    NonZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpOp {
    Save,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOpKind {
    IncSp,
    DecSp,
    IncBp,
    DecBp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOp {
    RsAdd(NcsType),
    /// `all` is set for STORE_STATEALL.
    StoreState { bp_size: u32, sp_size: u32, all: bool },
    Const(Constant),
    CopyDownSp { offset: i32, size: u16 },
    CopyTopSp { offset: i32, size: u16 },
    CopyDownBp { offset: i32, size: u16 },
    CopyTopBp { offset: i32, size: u16 },
    CondJump { kind: CondKind, offset: i32 },
    Jump { offset: i32 },
    Jsr { offset: i32 },
    MoveSp { delta: i32 },
    Logii(LogiiOp),
    Unary { op: UnaryOp, ty: NcsType },
    Binary { op: BinaryOp, pair: OperandPair, size: Option<u16> },
    Destruct { size: u16, exclude_offset: i16, exclude_size: u16 },
    Bp(BpOp),
    Action { id: u16, argc: u8 },
    StackOp { kind: StackOpKind, offset: i32 },
}

/// Innermost typed command, one per instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub pos: usize,
    pub len: usize,
    pub qual: u8,
    pub op: CommandOp,
}

impl Command {
    pub fn kind(&self) -> CmdKind {
        match self.op {
            CommandOp::RsAdd(_) => CmdKind::RsAdd,
            CommandOp::StoreState { .. } => CmdKind::StoreState,
            CommandOp::Const(_) => CmdKind::Const,
            CommandOp::CopyDownSp { .. } => CmdKind::CopyDownSp,
            CommandOp::CopyTopSp { .. } => CmdKind::CopyTopSp,
            CommandOp::CopyDownBp { .. } => CmdKind::CopyDownBp,
            CommandOp::CopyTopBp { .. } => CmdKind::CopyTopBp,
            CommandOp::CondJump { .. } => CmdKind::CondJump,
            CommandOp::Jump { .. } => CmdKind::Jump,
            CommandOp::Jsr { .. } => CmdKind::Jsr,
            CommandOp::MoveSp { .. } => CmdKind::MoveSp,
            CommandOp::Logii(_) => CmdKind::Logii,
            CommandOp::Unary { .. } => CmdKind::Unary,
            CommandOp::Binary { .. } => CmdKind::Binary,
            CommandOp::Destruct { .. } => CmdKind::Destruct,
            CommandOp::Bp(_) => CmdKind::Bp,
            CommandOp::Action { .. } => CmdKind::Action,
            CommandOp::StackOp { .. } => CmdKind::StackOp,
        }
    }

    pub fn end(&self) -> usize {
        self.pos + self.len
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Program { conditional: bool },
    /// `end` is the position of the terminating return.
    Subroutine { start: usize, end: usize },
    Block,
    /// Command wrapper; its single child is the typed [`NodeKind::Command`].
    Cmd(CmdKind),
    Command(Command),
    Return { pos: usize },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<Node>,
    attached: Vec<bool>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
        });
        self.attached.push(false);
        id
    }

    /// Allocates a node directly under `parent`.
    pub fn alloc_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.alloc(kind);
        self.nodes[parent.index()].children.push(id);
        self.attached[id.index()] = true;
        id
    }

    /// Allocates a command wrapper and its typed child under `parent`.
    pub fn alloc_command(&mut self, parent: NodeId, cmd: Command) -> NodeId {
        let wrapper = self.alloc_child(parent, NodeKind::Cmd(cmd.kind()));
        self.alloc_child(wrapper, NodeKind::Command(cmd));
        wrapper
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn has_parent(&self, id: NodeId) -> bool {
        self.attached[id.index()]
    }

    fn subtree_contains(&self, root: NodeId, needle: NodeId) -> bool {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if id == needle {
                return true;
            }
            stack.extend_from_slice(self.children(id));
        }
        false
    }

    /// Removes `child` from whatever node currently owns it.
    pub fn detach(&mut self, child: NodeId) -> bool {
        if !self.attached[child.index()] {
            return false;
        }
        for node in &mut self.nodes {
            if let Some(i) = node.children.iter().position(|c| *c == child) {
                node.children.remove(i);
                self.attached[child.index()] = false;
                return true;
            }
        }
        self.attached[child.index()] = false;
        false
    }

    /// Appends `child` to `parent`, detaching it from its previous owner
    /// first. Returns false and changes nothing if `parent` lies inside the
    /// subtree of `child`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> bool {
        if self.subtree_contains(child, parent) {
            return false;
        }
        self.detach(child);
        self.nodes[parent.index()].children.push(child);
        self.attached[child.index()] = true;
        true
    }

    /// Detaches and returns every child of `id`.
    pub fn take_children(&mut self, id: NodeId) -> Vec<NodeId> {
        let children = std::mem::take(&mut self.nodes[id.index()].children);
        for c in &children {
            self.attached[c.index()] = false;
        }
        children
    }

    /// Deep-copies the subtree rooted at `id`. The copy has no parent.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let copy = self.alloc(self.kind(id).clone());
        let children = self.children(id).to_vec();
        for c in children {
            let cc = self.clone_subtree(c);
            self.nodes[copy.index()].children.push(cc);
            self.attached[cc.index()] = true;
        }
        copy
    }

    /// Returns the typed command a node stands for, looking through a
    /// command wrapper to its child.
    pub fn unwrap_command(&self, id: NodeId) -> Option<&Command> {
        match self.kind(id) {
            NodeKind::Command(c) => Some(c),
            NodeKind::Cmd(_) => self.children(id).first().and_then(|c| match self.kind(*c) {
                NodeKind::Command(cmd) => Some(cmd),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Byte position of a command or return node.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        match self.kind(id) {
            NodeKind::Return { pos } => Some(*pos),
            _ => self.unwrap_command(id).map(|c| c.pos),
        }
    }
}

/// Child-to-parent lookup built from an arena snapshot.
#[derive(Debug, Clone)]
pub struct ParentTable {
    parents: Vec<Option<NodeId>>,
}

impl ParentTable {
    pub fn build(arena: &Arena) -> Self {
        let mut parents = vec![None; arena.len()];
        for id in arena.ids() {
            for c in arena.children(id) {
                debug_assert!(parents[c.index()].is_none(), "node {c:?} has two parents");
                parents[c.index()] = Some(id);
            }
        }
        Self { parents }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id.index()).copied().flatten()
    }

    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |p| self.parent(*p))
    }
}
