use std::path::Path;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use ncsdec_lib::batch::{FileOutcome, decompile_batch};
use ncsdec_lib::fileio::{TextEncoding, decompile_file};
use ncsdec_lib::roundtrip::{ExternalCompiler, RoundTripOutcome, round_trip};
use ncsdec_lib::{ActionTable, DecompileOptions, Decompiler, EmptyTable, GameVariant, NwscriptTable};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileArgs, DecompileCommand, EncodingCli, GameCli, TopLevel};

mod cli;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ncsdec=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn options(args: &DecompileArgs) -> DecompileOptions {
    DecompileOptions {
        game: match args.game {
            GameCli::K1 => GameVariant::K1,
            GameCli::K2 => GameVariant::K2,
        },
        fold_constants: args.fold_constants,
        parallel: args.parallel,
    }
}

fn action_table(path: Option<&Path>) -> Box<dyn ActionTable> {
    match path {
        Some(p) => match NwscriptTable::load(p) {
            Ok(t) => {
                info!(actions = t.len(), path = %p.display(), "loaded action table");
                Box::new(t)
            }
            Err(e) => fail(format!("failed to load action table {p:?}: {e}")),
        },
        None => Box::new(EmptyTable),
    }
}

fn encoding(e: EncodingCli) -> TextEncoding {
    match e {
        EncodingCli::Utf8 => TextEncoding::Utf8,
        EncodingCli::Latin1 => TextEncoding::Latin1,
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File {
                path,
                out,
                encoding: enc,
                decompile,
            } => {
                let actions = action_table(decompile.actions.as_deref());
                let options = options(&decompile);
                match out {
                    Some(out) => match decompile_file(&path, &out, options, actions.as_ref(), encoding(enc)) {
                        Ok(d) => {
                            for r in d.failed() {
                                eprintln!("{}: {}", r.name, r.error.as_ref().map(|e| e.to_string()).unwrap_or_default());
                            }
                        }
                        Err(e) => fail(format!("decompile error: {e}")),
                    },
                    None => match std::fs::read(&path) {
                        Ok(bytes) => match Decompiler::new(options, actions.as_ref()).decompile_bytes(&bytes) {
                            Ok(d) => print!("{}", d.text),
                            Err(e) => fail(format!("decompile error: {e}")),
                        },
                        Err(e) => fail(format!("failed to read {path:?}: {e}")),
                    },
                }
            }
            DecompileCommand::Batch {
                paths,
                out_dir,
                encoding: enc,
                decompile,
            } => {
                let actions = action_table(decompile.actions.as_deref());
                let report = decompile_batch(&paths, &out_dir, options(&decompile), actions.as_ref(), encoding(enc), None);
                for f in &report.files {
                    match &f.outcome {
                        FileOutcome::Done {
                            output,
                            failed_routines,
                            ..
                        } => {
                            if *failed_routines > 0 {
                                eprintln!("{}: {failed_routines} routine(s) failed", output.display());
                            }
                        }
                        FileOutcome::Failed(e) => eprintln!("{}: {e}", f.input.display()),
                        FileOutcome::Skipped => {}
                    }
                }
                println!("{} decompiled, {} failed", report.succeeded(), report.failed());
                if report.failed() > 0 {
                    std::process::exit(1);
                }
            }
        },
        Some(TopLevel::Disasm { path }) => match std::fs::read(&path) {
            Ok(bytes) => match ncsdec_lib::disassemble(&bytes) {
                Ok(text) => print!("{text}"),
                Err(e) => fail(format!("decode error: {e}")),
            },
            Err(e) => fail(format!("failed to read {path:?}: {e}")),
        },
        Some(TopLevel::RoundTrip {
            path,
            compiler,
            args,
            timeout_secs,
            decompile,
        }) => {
            let actions = action_table(decompile.actions.as_deref());
            let mut external = ExternalCompiler::new(compiler);
            if !args.is_empty() {
                external = external.with_args(args);
            }
            if let Some(secs) = timeout_secs {
                external = external.with_timeout(Duration::from_secs(secs));
            }
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => fail(format!("failed to read {path:?}: {e}")),
            };
            match round_trip(&bytes, options(&decompile), actions.as_ref(), &external) {
                Ok(RoundTripOutcome::Stable) => println!("stable"),
                Ok(RoundTripOutcome::Diverged { line, .. }) => fail(format!("diverged at normalized line {line}")),
                Ok(RoundTripOutcome::Unconfirmed(e)) => fail(format!("unconfirmed: {e}")),
                Err(e) => fail(format!("decompile error: {e}")),
            }
        }
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                fail(e);
            }
        }
    }
}
