use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ActionTableError;
use crate::types::NcsType;

/// Target runtime. The numeric action-id space differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GameVariant {
    #[default]
    K1,
    K2,
}

impl GameVariant {
    /// Numeric form passed to external compilers.
    pub fn number(self) -> u8 {
        match self {
            GameVariant::K1 => 1,
            GameVariant::K2 => 2,
        }
    }
}

/// Read-only lookup of engine action signatures.
pub trait ActionTable: Send + Sync {
    fn name(&self, id: u16) -> Option<&str>;
    fn param_types(&self, id: u16) -> Option<&[NcsType]>;
    fn return_type(&self, id: u16) -> Option<NcsType>;
}

/// A table where every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyTable;

impl ActionTable for EmptyTable {
    fn name(&self, _id: u16) -> Option<&str> {
        None
    }

    fn param_types(&self, _id: u16) -> Option<&[NcsType]> {
        None
    }

    fn return_type(&self, _id: u16) -> Option<NcsType> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSignature {
    pub name: String,
    pub return_type: NcsType,
    pub params: Vec<NcsType>,
}

/// Action table read from an `nwscript.nss` style listing: every function
/// prototype takes the next action id, in file order.
#[derive(Debug, Clone, Default)]
pub struct NwscriptTable {
    actions: Vec<ActionSignature>,
}

fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Splits on commas that are not nested in brackets or parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Splits source on `;` outside string literals. Each statement comes back
/// whitespace-collapsed together with the line it starts on.
fn split_statements(src: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut line = 1usize;
    let mut start_line = None;
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in src.chars() {
        if c == '\n' {
            line += 1;
        }
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            ';' => {
                let text = current.split_whitespace().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    out.push((start_line.unwrap_or(line), text));
                }
                current.clear();
                start_line = None;
            }
            _ => {
                if c == '"' {
                    in_string = true;
                }
                if start_line.is_none() && !c.is_whitespace() {
                    start_line = Some(line);
                }
                current.push(c);
            }
        }
    }
    out
}

fn parse_type(word: &str, line: usize) -> Result<NcsType, ActionTableError> {
    NcsType::from_keyword(word).ok_or_else(|| ActionTableError::UnknownType {
        line,
        ty: word.to_string(),
    })
}

fn parse_prototype(text: &str, line: usize) -> Result<Option<ActionSignature>, ActionTableError> {
    let Some(open) = text.find('(') else {
        return Ok(None);
    };
    // Constants such as `int X = (1 << 2)` have their `=` before the paren.
    if text[..open].contains('=') {
        return Ok(None);
    }
    let close = text.rfind(')').ok_or_else(|| ActionTableError::Malformed {
        line,
        text: text.to_string(),
    })?;
    let head: Vec<&str> = text[..open].split_whitespace().collect();
    let [ret, name] = head.as_slice() else {
        return Err(ActionTableError::Malformed {
            line,
            text: text.to_string(),
        });
    };
    let return_type = parse_type(ret, line)?;

    let inner = text[open + 1..close].trim();
    let mut params = Vec::new();
    if !inner.is_empty() && inner != "void" {
        for p in split_top_level(inner) {
            let decl = p.split('=').next().unwrap_or("").trim();
            let ty = decl.split_whitespace().next().ok_or_else(|| ActionTableError::Malformed {
                line,
                text: text.to_string(),
            })?;
            params.push(parse_type(ty, line)?);
        }
    }

    Ok(Some(ActionSignature {
        name: name.to_string(),
        return_type,
        params,
    }))
}

impl NwscriptTable {
    pub fn parse(src: &str) -> Result<Self, ActionTableError> {
        let cleaned = strip_comments(src);
        let cleaned: String = cleaned
            .lines()
            .map(|l| if l.trim_start().starts_with('#') { "" } else { l })
            .collect::<Vec<_>>()
            .join("\n");

        let mut actions = Vec::new();
        for (line, text) in split_statements(&cleaned) {
            if let Some(sig) = parse_prototype(&text, line)? {
                actions.push(sig);
            }
        }
        debug!(actions = actions.len(), "parsed action table");
        Ok(Self { actions })
    }

    pub fn load(path: &Path) -> Result<Self, ActionTableError> {
        let bytes = fs::read(path)?;
        // Listings are Windows-1252 in practice; read them byte for byte.
        let src: String = bytes.iter().map(|&b| b as char).collect();
        Self::parse(&src)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&ActionSignature> {
        self.actions.get(id as usize)
    }
}

impl ActionTable for NwscriptTable {
    fn name(&self, id: u16) -> Option<&str> {
        self.get(id).map(|s| s.name.as_str())
    }

    fn param_types(&self, id: u16) -> Option<&[NcsType]> {
        self.get(id).map(|s| s.params.as_slice())
    }

    fn return_type(&self, id: u16) -> Option<NcsType> {
        self.get(id).map(|s| s.return_type)
    }
}

/// One table per game variant.
pub struct ActionTables {
    k1: Box<dyn ActionTable>,
    k2: Box<dyn ActionTable>,
}

impl Default for ActionTables {
    fn default() -> Self {
        Self {
            k1: Box::new(EmptyTable),
            k2: Box::new(EmptyTable),
        }
    }
}

impl ActionTables {
    pub fn new(k1: Box<dyn ActionTable>, k2: Box<dyn ActionTable>) -> Self {
        Self { k1, k2 }
    }

    pub fn with(mut self, variant: GameVariant, table: Box<dyn ActionTable>) -> Self {
        match variant {
            GameVariant::K1 => self.k1 = table,
            GameVariant::K2 => self.k2 = table,
        }
        self
    }

    pub fn for_variant(&self, variant: GameVariant) -> &dyn ActionTable {
        match variant {
            GameVariant::K1 => self.k1.as_ref(),
            GameVariant::K2 => self.k2.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
// Engine structures
#define ENGINE_NUM_STRUCTURES 4
#define ENGINE_STRUCTURE_0 effect

int TRUE = 1;
float PI = 3.14159;
string sEmpty = "a;b";
int FLAGS = (1 << 2);

/* 0: random number */
int Random(int nMaxInteger);
// 1
void PrintString(string sString);
void PrintFloat(float fFloat, int nWidth=18, int nDecimals=9);
void DelayCommand(float fSeconds, action aActionToDelay);
location Location(vector vPosition,
                  float fOrientation);
void SetFacingPoint(vector vTarget = [0.0, 0.0, 0.0], object oTarget = OBJECT_SELF);
object GetFirstObject();
"#;

    #[test]
    fn prototypes_get_sequential_ids() {
        let t = NwscriptTable::parse(LISTING).unwrap();
        assert_eq!(t.len(), 7);
        assert_eq!(t.name(0), Some("Random"));
        assert_eq!(t.return_type(0), Some(NcsType::Int));
        assert_eq!(t.param_types(1), Some(&[NcsType::String][..]));
        assert_eq!(t.param_types(2), Some(&[NcsType::Float, NcsType::Int, NcsType::Int][..]));
        assert_eq!(t.param_types(3), Some(&[NcsType::Float, NcsType::Action][..]));
        assert_eq!(t.return_type(4), Some(NcsType::Engine(2)));
        assert_eq!(t.param_types(4), Some(&[NcsType::Vector, NcsType::Float][..]));
        assert_eq!(t.param_types(5), Some(&[NcsType::Vector, NcsType::Object][..]));
        assert_eq!(t.param_types(6), Some(&[][..]));
        assert_eq!(t.name(7), None);
    }

    #[test]
    fn unknown_type_reports_line() {
        let err = NwscriptTable::parse("int A();\n\nwidget B(int x);").unwrap_err();
        assert!(matches!(err, ActionTableError::UnknownType { line: 3, ref ty } if ty == "widget"), "{err}");
    }

    #[test]
    fn empty_table_misses() {
        assert_eq!(EmptyTable.name(0), None);
        assert_eq!(EmptyTable.param_types(42), None);
        assert_eq!(EmptyTable.return_type(42), None);
    }

    #[test]
    fn variant_selects_table() {
        let k2 = NwscriptTable::parse("void OnlyInK2();").unwrap();
        let tables = ActionTables::default().with(GameVariant::K2, Box::new(k2));
        assert_eq!(tables.for_variant(GameVariant::K1).name(0), None);
        assert_eq!(tables.for_variant(GameVariant::K2).name(0), Some("OnlyInK2"));
        assert_eq!(GameVariant::K2.number(), 2);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nwscript.nss");
        fs::write(&path, b"int Random(int n);\nvoid PrintString(string s);\n").unwrap();
        let t = NwscriptTable::load(&path).unwrap();
        assert_eq!(t.name(1), Some("PrintString"));
    }
}
