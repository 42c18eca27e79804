use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GameCli {
    K1,
    K2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EncodingCli {
    Utf8,
    Latin1,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

/// Settings shared by every command that decompiles.
#[derive(Debug, Args)]
pub struct DecompileArgs {
    /// Target game; selects the action id space
    #[arg(long, value_enum, default_value_t = GameCli::K1)]
    pub game: GameCli,

    /// nwscript.nss listing used to name engine actions
    #[arg(long)]
    pub actions: Option<PathBuf>,

    /// Fold arithmetic over integer literals
    #[arg(long, default_value_t = false)]
    pub fold_constants: bool,

    /// Reconstruct subroutines in parallel
    #[arg(long, default_value_t = false)]
    pub parallel: bool,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles NCS bytecode files
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Lists the instructions of an NCS file
    Disasm {
        /// Path to the NCS file
        path: PathBuf,
    },
    /// Decompiles, recompiles with an external compiler and compares
    RoundTrip {
        /// Path to the NCS file
        path: PathBuf,

        /// Compiler executable
        #[arg(long)]
        compiler: PathBuf,

        /// Compiler argument; `{input}`, `{output}` and `{game}` are substituted.
        /// Repeat for each argument
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Kill the compiler after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[command(flatten)]
        decompile: DecompileArgs,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles one NCS file
    File {
        /// Path to the NCS file
        path: PathBuf,

        /// Write the source here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,

        /// Encoding of the written source
        #[arg(long, value_enum, default_value_t = EncodingCli::Utf8)]
        encoding: EncodingCli,

        #[command(flatten)]
        decompile: DecompileArgs,
    },
    /// Decompiles many NCS files into a directory
    Batch {
        /// NCS files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory receiving one `.nss` per input
        #[arg(long)]
        out_dir: PathBuf,

        /// Encoding of the written sources
        #[arg(long, value_enum, default_value_t = EncodingCli::Utf8)]
        encoding: EncodingCli,

        #[command(flatten)]
        decompile: DecompileArgs,
    },
}
