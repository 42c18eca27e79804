use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root(crate_dir: &Path) -> PathBuf {
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("crate directory should be <root>/crates/<name>")
        .to_path_buf()
}

fn take_until_paren_close(s: &str) -> Option<&str> {
    let s = s.trim();
    let j = s.find(')')?;
    Some(s[..j].trim())
}

fn strip_block_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_byte(s: &str) -> u8 {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).expect("hex byte"),
        None => s.parse().expect("decimal byte"),
    }
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let root = workspace_root(&manifest_dir);

    let def_path = root.join("ncs").join("ncs-opcodes.def");
    println!("cargo:rerun-if-changed={}", def_path.display());

    let src = fs::read_to_string(&def_path).expect("read ncs-opcodes.def");
    let src = strip_block_comments(&src);

    let mut fmts: Vec<String> = Vec::new();
    let mut types: HashMap<String, (u8, u8)> = HashMap::new();
    let mut ops: Vec<(String, u8, String, Vec<u8>, bool)> = Vec::new();

    for line in src.lines() {
        let l = line.trim();
        if let Some(rest) = l.strip_prefix("FMT(") {
            if let Some(name) = take_until_paren_close(rest) {
                if !name.is_empty() {
                    fmts.push(name.to_string());
                }
            }
            continue;
        }

        if let Some(rest) = l.strip_prefix("TYPE(") {
            let inner = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
            let first = parse_byte(parts[1]);
            let last = parts.get(2).map(|p| parse_byte(p)).unwrap_or(first);
            types.insert(parts[0].to_string(), (first, last));
            continue;
        }

        let rest = match l.strip_prefix("DEF(") {
            Some(v) => v,
            None => continue,
        };
        let inner = match take_until_paren_close(rest) {
            Some(v) => v,
            None => continue,
        };
        let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
        if parts.len() != 4 {
            continue;
        }
        let name = parts[0].to_string();
        let code = parse_byte(parts[1]);
        let fmt = parts[2].to_string();
        assert!(fmts.contains(&fmt), "unknown operand format {fmt} for {name}");

        let mut quals = Vec::new();
        let mut any = false;
        for q in parts[3].split_whitespace() {
            if q == "ANY" {
                any = true;
                continue;
            }
            let (first, last) = *types
                .get(q)
                .unwrap_or_else(|| panic!("unknown qualifier {q} for {name}"));
            quals.extend(first..=last);
        }
        ops.push((name, code, fmt, quals, any));
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_path = out_dir.join("ncs_tables.rs");

    let mut out = String::new();

    out.push_str("#[allow(non_camel_case_types)]\n");
    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq)]\n");
    out.push_str("pub enum OpFmt {\n");
    for f in &fmts {
        out.push_str(&format!("    {},\n", f.to_ascii_uppercase()));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct OpInfo {\n");
    out.push_str("    pub name: &'static str,\n");
    out.push_str("    pub code: u8,\n");
    out.push_str("    pub fmt: OpFmt,\n");
    out.push_str("    pub quals: &'static [u8],\n");
    out.push_str("    pub any_qual: bool,\n");
    out.push_str("}\n\n");

    out.push_str("pub const OPCODE_INFO: &[OpInfo] = &[\n");
    for (name, code, fmt, quals, any) in &ops {
        let quals: Vec<String> = quals.iter().map(|q| format!("0x{q:02x}")).collect();
        out.push_str(&format!(
            "    OpInfo {{ name: \"{}\", code: 0x{:02x}, fmt: OpFmt::{}, quals: &[{}], any_qual: {} }},\n",
            name,
            code,
            fmt.to_ascii_uppercase(),
            quals.join(", "),
            any
        ));
    }
    out.push_str("];\n\n");

    out.push_str("#[allow(dead_code)]\n");
    out.push_str("pub mod op {\n");
    for (name, code, _, _, _) in &ops {
        out.push_str(&format!("    pub const {}: u8 = 0x{:02x};\n", name, code));
    }
    out.push_str("}\n");

    fs::write(out_path, out).expect("write generated ncs tables");
}
