//! Recompilation through an external compiler.
//!
//! A round trip decompiles a program, recompiles the text, decompiles the
//! result and compares both texts after normalization. Compiler failures
//! leave the round trip unconfirmed; they are never a crash.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions::{ActionTable, GameVariant};
use crate::error::{CompileError, NcsError};
use crate::{DecompileOptions, Decompiler, emit};

const POLL: Duration = Duration::from_millis(20);

/// Turns a source file into a bytecode file.
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &Path, output: &Path, game: GameVariant) -> Result<(), CompileError>;
}

/// A compiler run as a child process.
///
/// Arguments are a template: `{input}`, `{output}` and `{game}` are replaced
/// by the source path, the bytecode path and the game number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCompiler {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ExternalCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: ["-c", "-g", "{game}", "{input}", "-o", "{output}"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn render(&self, input: &Path, output: &Path, game: GameVariant) -> Vec<OsString> {
        self.args
            .iter()
            .map(|a| match a.as_str() {
                "{input}" => input.as_os_str().to_owned(),
                "{output}" => output.as_os_str().to_owned(),
                _ => OsString::from(
                    a.replace("{input}", &input.to_string_lossy())
                        .replace("{output}", &output.to_string_lossy())
                        .replace("{game}", &game.number().to_string()),
                ),
            })
            .collect()
    }

    fn wait(&self, child: &mut std::process::Child) -> Result<ExitStatus, CompileError> {
        let Some(limit) = self.timeout else {
            return Ok(child.wait()?);
        };
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= limit {
                if let Err(e) = child.kill() {
                    warn!("could not kill compiler: {e}");
                }
                child.wait()?;
                return Err(CompileError::TimedOut(limit));
            }
            thread::sleep(POLL);
        }
    }
}

impl Compiler for ExternalCompiler {
    fn compile(&self, source: &Path, output: &Path, game: GameVariant) -> Result<(), CompileError> {
        // Both streams go to one anonymous file so a chatty compiler can
        // never block on a full pipe.
        let mut log = tempfile::tempfile()?;
        let mut child = Command::new(&self.program)
            .args(self.render(source, output, game))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .spawn()
            .map_err(|source| CompileError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let status = self.wait(&mut child)?;
        debug!(program = %self.program.display(), %status, "compiler finished");

        if !status.success() {
            return Err(CompileError::Failed {
                status: status.to_string(),
                diagnostics: read_log(&mut log)?,
            });
        }
        if !output.exists() {
            return Err(CompileError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

fn read_log(log: &mut File) -> Result<String, CompileError> {
    log.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    log.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

fn close(dir: tempfile::TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(dir = %path.display(), "could not remove temporary directory: {e}");
    }
}

/// Compiles `source` in a scratch directory and returns the bytecode.
pub fn recompile(source: &str, game: GameVariant, compiler: &dyn Compiler) -> Result<Vec<u8>, CompileError> {
    let dir = tempfile::Builder::new().prefix("ncsdec-").tempdir()?;
    let input = dir.path().join("roundtrip.nss");
    let output = dir.path().join("roundtrip.ncs");
    let result = fs::write(&input, source)
        .map_err(CompileError::from)
        .and_then(|()| compiler.compile(&input, &output, game))
        .and_then(|()| fs::read(&output).map_err(CompileError::from));
    close(dir);
    result
}

/// Compiles `source` to `output`. On failure a placeholder holding the
/// error text is written to `output` before the error is returned.
pub fn compile_to_file(
    compiler: &dyn Compiler,
    source: &str,
    output: &Path,
    game: GameVariant,
) -> Result<(), CompileError> {
    let dir = tempfile::Builder::new().prefix("ncsdec-").tempdir()?;
    let input = dir.path().join("source.nss");
    let result = fs::write(&input, source)
        .map_err(CompileError::from)
        .and_then(|()| compiler.compile(&input, output, game));
    close(dir);
    if let Err(e) = &result {
        warn!(output = %output.display(), "compilation failed: {e}");
        if let Err(w) = fs::write(output, format!("// compilation failed: {e}\n")) {
            warn!(output = %output.display(), "could not write placeholder: {w}");
        }
    }
    result
}

#[derive(Debug)]
pub enum RoundTripOutcome {
    /// Both decompilations agree.
    Stable,
    /// First differing normalized line, 1-based.
    Diverged { first: String, second: String, line: usize },
    /// The compiler could not produce comparable output.
    Unconfirmed(CompileError),
}

impl RoundTripOutcome {
    pub fn is_stable(&self) -> bool {
        matches!(self, RoundTripOutcome::Stable)
    }
}

/// Source text with comments removed, whitespace runs collapsed and blank
/// lines dropped.
pub fn normalize(text: &str) -> Vec<String> {
    let mut stripped = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            stripped.push(c);
            match c {
                '\\' => {
                    if let Some(n) = chars.next() {
                        stripped.push(n);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                stripped.push(c);
            }
            ('/', Some('/')) => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        stripped.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    if n == '\n' {
                        stripped.push('\n');
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => stripped.push(c),
        }
    }
    stripped
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect()
}

/// Decompiles, recompiles and decompiles again.
pub fn round_trip(
    bytecode: &[u8],
    options: DecompileOptions,
    actions: &dyn ActionTable,
    compiler: &dyn Compiler,
) -> Result<RoundTripOutcome, NcsError> {
    let decompiler = Decompiler::new(options, actions);
    let first = decompiler.decompile_bytes(bytecode)?.text;
    if first.contains(emit::DEFERRED_BLOCK) {
        let e = CompileError::Inexpressible("deferred action with more than one statement");
        warn!("round trip unconfirmed: {e}");
        return Ok(RoundTripOutcome::Unconfirmed(e));
    }

    let recompiled = match recompile(&first, options.game, compiler) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("round trip unconfirmed: {e}");
            return Ok(RoundTripOutcome::Unconfirmed(e));
        }
    };
    let second = match decompiler.decompile_bytes(&recompiled) {
        Ok(d) => d.text,
        Err(e) => return Ok(RoundTripOutcome::Unconfirmed(CompileError::Undecodable(e))),
    };

    let (a, b) = (normalize(&first), normalize(&second));
    if a == b {
        return Ok(RoundTripOutcome::Stable);
    }
    let line = a.iter().zip(&b).take_while(|(x, y)| x == y).count() + 1;
    debug!(line, "round trip diverged");
    Ok(RoundTripOutcome::Diverged { first, second, line })
}
