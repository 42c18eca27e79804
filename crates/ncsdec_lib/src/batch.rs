//! Decompiling many files at once. One bad file never stops the batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::DecompileOptions;
use crate::actions::ActionTable;
use crate::fileio::{TextEncoding, decompile_file};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Done {
        output: PathBuf,
        routines: usize,
        failed_routines: usize,
    },
    Failed(String),
    /// Not started because the batch was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub input: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// One entry per input, in input order.
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Done { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed(_)))
            .count()
    }
}

/// `<output_dir>/<input stem>.nss`
pub fn output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or(input.as_os_str());
    output_dir.join(stem).with_extension("nss")
}

pub fn decompile_batch(
    inputs: &[PathBuf],
    output_dir: &Path,
    options: DecompileOptions,
    actions: &dyn ActionTable,
    encoding: TextEncoding,
    cancel: Option<&AtomicBool>,
) -> BatchReport {
    let files: Vec<FileReport> = inputs
        .par_iter()
        .map(|input| {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return FileReport {
                    input: input.clone(),
                    outcome: FileOutcome::Skipped,
                };
            }
            let output = output_path(input, output_dir);
            let outcome = match decompile_file(input, &output, options, actions, encoding) {
                Ok(d) => FileOutcome::Done {
                    output,
                    routines: d.routines.len(),
                    failed_routines: d.failed().count(),
                },
                Err(e) => {
                    warn!(input = %input.display(), "decompilation failed: {e}");
                    FileOutcome::Failed(e.to_string())
                }
            };
            FileReport {
                input: input.clone(),
                outcome,
            }
        })
        .collect();
    let report = BatchReport { files };
    info!(
        files = report.files.len(),
        succeeded = report.succeeded(),
        failed = report.failed(),
        "batch finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::actions::EmptyTable;
    use crate::instr::asm::*;
    use crate::instr::{assemble, layout};

    #[test]
    fn output_names_follow_input_stems() {
        assert_eq!(output_path(Path::new("a/b/k_hen.ncs"), Path::new("out")), PathBuf::from("out/k_hen.nss"));
    }

    #[test]
    fn cancelled_batch_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let flag = AtomicBool::new(true);
        let inputs = vec![dir.path().join("a.ncs"), dir.path().join("b.ncs")];
        let report = decompile_batch(
            &inputs,
            dir.path(),
            DecompileOptions::default(),
            &EmptyTable,
            TextEncoding::Utf8,
            Some(&flag),
        );
        assert!(report.files.iter().all(|f| f.outcome == FileOutcome::Skipped));
    }

    #[test]
    fn broken_file_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.ncs");
        let bad = dir.path().join("bad.ncs");
        let mut v = vec![const_int(1), movsp(-4), retn()];
        layout(&mut v);
        fs::write(&good, assemble(&v)).unwrap();
        fs::write(&bad, b"NCS V1.0\x42\x00\x00\x00\x0f\xff\xff").unwrap();

        let out = dir.path().join("out");
        let report = decompile_batch(
            &[bad.clone(), good.clone()],
            &out,
            DecompileOptions::default(),
            &EmptyTable,
            TextEncoding::Utf8,
            None,
        );
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.files[0].outcome, FileOutcome::Failed(_)));
        assert!(out.join("good.nss").exists());
    }
}
