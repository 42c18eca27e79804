//! Tree walks dispatching on command kind.
//!
//! A walk visits every command wrapper below a root once. The handler
//! registered for the command's [`CmdKind`] decides whether the walk enters
//! the command's own children (the nested body of a deferred action).

use std::collections::HashMap;

use crate::node::{Arena, CmdKind, Command, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    SkipChildren,
}

type Handler<'h> = Box<dyn FnMut(&Arena, NodeId, &Command) -> Visit + 'h>;

/// Per-kind handlers. Kinds without a handler are walked through.
#[derive(Default)]
pub struct Handlers<'h> {
    table: HashMap<CmdKind, Handler<'h>>,
}

impl<'h> Handlers<'h> {
    pub fn new() -> Self {
        Self { table: HashMap::new() }
    }

    pub fn on(mut self, kind: CmdKind, f: impl FnMut(&Arena, NodeId, &Command) -> Visit + 'h) -> Self {
        self.table.insert(kind, Box::new(f));
        self
    }

    fn dispatch(&mut self, arena: &Arena, id: NodeId, cmd: &Command) -> Visit {
        match self.table.get_mut(&cmd.kind()) {
            Some(h) => h(arena, id, cmd),
            None => Visit::Continue,
        }
    }
}

/// Children to descend into after visiting `id`, or `None` to stop.
fn visit(arena: &Arena, id: NodeId, handlers: &mut Handlers<'_>) -> Option<Vec<NodeId>> {
    match arena.kind(id) {
        NodeKind::Cmd(_) => {
            let cmd = arena.unwrap_command(id)?;
            if handlers.dispatch(arena, id, cmd) == Visit::SkipChildren {
                return None;
            }
            // The typed child was dispatched through its wrapper; only its
            // own children remain.
            let inner = *arena.children(id).first()?;
            Some(arena.children(inner).to_vec())
        }
        _ => Some(arena.children(id).to_vec()),
    }
}

/// Depth-first, children in program order.
pub fn walk_forward(arena: &Arena, root: NodeId, handlers: &mut Handlers<'_>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if let Some(children) = visit(arena, id, handlers) {
            stack.extend(children.into_iter().rev());
        }
    }
}

/// Depth-first, children in reverse program order.
pub fn walk_reversed(arena: &Arena, root: NodeId, handlers: &mut Handlers<'_>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if let Some(children) = visit(arena, id, handlers) {
            stack.extend(children);
        }
    }
}

/// Positions of every subroutine called from below `root`, deferred bodies
/// included.
pub fn call_targets(arena: &Arena, root: NodeId) -> Vec<usize> {
    let mut targets = Vec::new();
    let mut handlers = Handlers::new().on(CmdKind::Jsr, |a, id, _| {
        if let Some(t) = crate::query::jump_destination(a, id) {
            targets.push(t);
        }
        Visit::Continue
    });
    walk_forward(arena, root, &mut handlers);
    drop(handlers);
    targets
}
