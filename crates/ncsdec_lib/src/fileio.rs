//! Reading `.ncs` files and writing decompiled source.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::actions::ActionTable;
use crate::error::NcsError;
use crate::{Decompilation, DecompileOptions, Decompiler};

/// Encoding of written source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// One byte per character; characters above U+00FF become `?`.
    Latin1,
}

impl TextEncoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

pub fn write_text(output: &Path, text: &str, encoding: TextEncoding) -> Result<(), NcsError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, encoding.encode(text))?;
    Ok(())
}

/// Decompiles `input` and writes the source to `output`.
pub fn decompile_file(
    input: &Path,
    output: &Path,
    options: DecompileOptions,
    actions: &dyn ActionTable,
    encoding: TextEncoding,
) -> Result<Decompilation, NcsError> {
    let bytes = fs::read(input)?;
    debug!(input = %input.display(), bytes = bytes.len(), "read program");
    let result = Decompiler::new(options, actions).decompile_bytes(&bytes)?;
    write_text(output, &result.text, encoding)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        failed = result.failed().count(),
        "decompiled file"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::EmptyTable;
    use crate::instr::asm::*;
    use crate::instr::{assemble, layout};

    #[test]
    fn latin1_replaces_wide_characters() {
        assert_eq!(TextEncoding::Latin1.encode("é€"), vec![0xe9, b'?']);
        assert_eq!(TextEncoding::Utf8.encode("é"), "é".as_bytes());
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.ncs");
        let mut v = vec![const_string("caf\u{e9}"), action(0, 1), movsp(-4), retn()];
        layout(&mut v);
        fs::write(&input, assemble(&v)).unwrap();

        let output = dir.path().join("deep/er/out.nss");
        let r = decompile_file(&input, &output, DecompileOptions::default(), &EmptyTable, TextEncoding::Latin1).unwrap();
        assert_eq!(r.failed().count(), 0);
        let written = fs::read(&output).unwrap();
        assert!(written.windows(4).any(|w| w == b"caf\xe9"));
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = decompile_file(
            &dir.path().join("nope.ncs"),
            &dir.path().join("out.nss"),
            DecompileOptions::default(),
            &EmptyTable,
            TextEncoding::Utf8,
        )
        .unwrap_err();
        assert!(matches!(err, NcsError::Io(_)));
    }
}
