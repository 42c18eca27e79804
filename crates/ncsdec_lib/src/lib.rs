//! Decompiler for compiled NWScript (NCS) bytecode.
//!
//! The pipeline decodes bytes into instructions, builds a node tree of
//! subroutines, infers every subroutine's signature from its stack effect,
//! reconstructs structured statements and renders them as source text.

use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use tracing::debug;

mod tables {
    include!(concat!(env!("OUT_DIR"), "/ncs_tables.rs"));
}

pub mod actions;
pub mod ast;
pub mod batch;
pub mod builder;
pub mod emit;
pub mod error;
pub mod fileio;
pub mod instr;
pub mod node;
pub mod query;
pub mod reconstruct;
pub mod roundtrip;
pub mod stack;
pub mod traverse;
pub mod types;

pub use actions::{ActionTable, ActionTables, EmptyTable, GameVariant, NwscriptTable};
pub use error::{ActionTableError, CompileError, NcsError, SubroutineError};
pub use instr::Instr;
pub use tables::op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub game: GameVariant,
    /// Fold arithmetic over integer literals (`5 + 3` becomes `8`).
    pub fold_constants: bool,
    /// Reconstruct subroutines on the rayon pool.
    pub parallel: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            game: GameVariant::K1,
            fold_constants: false,
            parallel: false,
        }
    }
}

/// Outcome of one routine in a decompiled program.
#[derive(Debug)]
pub struct RoutineReport {
    pub name: String,
    pub start: usize,
    pub error: Option<SubroutineError>,
}

#[derive(Debug)]
pub struct Decompilation {
    pub text: String,
    /// The program is a conditional script (`StartingConditional`).
    pub conditional: bool,
    pub routines: Vec<RoutineReport>,
}

impl Decompilation {
    pub fn failed(&self) -> impl Iterator<Item = &RoutineReport> {
        self.routines.iter().filter(|r| r.error.is_some())
    }
}

pub struct Decompiler<'a> {
    options: DecompileOptions,
    actions: &'a dyn ActionTable,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Decompiler<'a> {
    pub fn new(options: DecompileOptions, actions: &'a dyn ActionTable) -> Self {
        Self {
            options,
            actions,
            cancel: None,
        }
    }

    /// Uses the table of the game selected in `options`.
    pub fn for_game(options: DecompileOptions, tables: &'a ActionTables) -> Self {
        Self::new(options, tables.for_variant(options.game))
    }

    /// Stops between subroutines once `flag` is set; the decompilation then
    /// fails with [`NcsError::Cancelled`].
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn options(&self) -> DecompileOptions {
        self.options
    }

    pub fn decompile_bytes(&self, bytes: &[u8]) -> Result<Decompilation, NcsError> {
        let instrs = instr::decode(bytes)?;
        self.decompile_instrs(&instrs)
    }

    pub fn decompile_instrs(&self, instrs: &[Instr]) -> Result<Decompilation, NcsError> {
        let tree = builder::build(instrs)?;
        let program = reconstruct::reconstruct(&tree, self.actions, &self.options, self.cancel)?;
        let text = emit::program(&program);
        let routines: Vec<RoutineReport> = program
            .routines
            .into_iter()
            .map(|r| RoutineReport {
                name: r.name,
                start: r.start,
                error: r.outcome.err(),
            })
            .collect();
        debug!(
            routines = routines.len(),
            failed = routines.iter().filter(|r| r.error.is_some()).count(),
            game = ?self.options.game,
            "decompiled program"
        );
        Ok(Decompilation {
            text,
            conditional: program.conditional,
            routines,
        })
    }
}

pub fn decompile_with_options(
    bytecode: &[u8],
    options: DecompileOptions,
    actions: &dyn ActionTable,
) -> Result<String, NcsError> {
    Ok(Decompiler::new(options, actions).decompile_bytes(bytecode)?.text)
}

/// Decompiles with default options and no action names.
pub fn decompile(bytecode: &[u8]) -> Result<String, NcsError> {
    decompile_with_options(bytecode, DecompileOptions::default(), &EmptyTable)
}

/// One line per instruction: `pos: NAME.QUAL operands`.
pub fn disassemble(bytecode: &[u8]) -> Result<String, NcsError> {
    Ok(instr::disassemble_instrs(&instr::decode(bytecode)?))
}
