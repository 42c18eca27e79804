//! End-to-end decompilation of small hand-assembled programs.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use ncsdec_lib::instr::asm::*;
use ncsdec_lib::instr::{Operand, assemble, layout};
use ncsdec_lib::roundtrip::{Compiler, RoundTripOutcome, normalize, round_trip};
use ncsdec_lib::types::{NcsType, OperandPair};
use ncsdec_lib::{
    ActionTables, CompileError, DecompileOptions, Decompiler, EmptyTable, GameVariant, Instr, NcsError, NwscriptTable,
    op,
};

fn bytes(mut v: Vec<Instr>) -> Vec<u8> {
    layout(&mut v);
    assemble(&v)
}

fn text(v: Vec<Instr>) -> String {
    ncsdec_lib::decompile(&bytes(v)).unwrap()
}

/// Points the jump at `from` to the instruction at `to`. Needs `layout` first.
fn aim(v: &mut [Instr], from: usize, to: usize) {
    let rel = v[to].pos as i32 - v[from].pos as i32;
    if let Operand::Offset(o) = &mut v[from].operand {
        *o = rel;
    }
}

/// `action_1(k);`
fn call(k: i32) -> [Instr; 3] {
    [const_int(k), action(1, 1), movsp(-4)]
}

#[test]
fn addition_of_two_literals() {
    let v = vec![const_int(5), const_int(3), binary(op::ADD, OperandPair::II), retn()];
    let out = text(v.clone());
    assert!(out.contains("int StartingConditional() {"), "{out}");
    assert!(out.contains("return 5 + 3;"), "{out}");

    let folded = DecompileOptions {
        fold_constants: true,
        ..DecompileOptions::default()
    };
    let out = ncsdec_lib::decompile_with_options(&bytes(v), folded, &EmptyTable).unwrap();
    assert!(out.contains("return 8;"), "{out}");
}

#[test]
fn jz_over_a_jump_to_the_same_place_has_no_if() {
    // 13 ACTION; 18 JZ +12 -> 30; 24 JMP +6 -> 30; 30 RETN
    let out = text(vec![action(3, 0), jz(12), jmp(6), retn()]);
    assert!(!out.contains("if"), "{out}");
    assert!(!out.contains("goto"), "{out}");
    assert!(out.contains("action_3();"), "{out}");
}

#[test]
fn if_else_is_recovered() {
    // CONST; JZ L; B; JMP M; L: C; M: RETN
    let mut v = vec![const_int(7), jz(0)];
    v.extend(call(1));
    v.push(jmp(0));
    v.extend(call(2));
    v.push(retn());
    layout(&mut v);
    aim(&mut v, 1, 6);
    aim(&mut v, 5, 9);

    let out = ncsdec_lib::decompile(&assemble(&v)).unwrap();
    assert!(out.contains("if (7) {"), "{out}");
    assert!(out.contains("} else {"), "{out}");
    assert!(out.contains("        action_1(1);"), "{out}");
    assert!(out.contains("        action_1(2);"), "{out}");
    assert!(!out.contains("goto"), "{out}");
}

#[test]
fn unknown_action_uses_fallback_name() {
    let out = text(vec![const_int(2), const_int(1), action(42, 2), movsp(-4), retn()]);
    assert!(out.contains("action_42(1, 2);"), "{out}");
}

#[test]
fn named_action_uses_table() {
    let table = NwscriptTable::parse("int Random(int n);\nvoid PrintInteger(int n);\n").unwrap();
    let out = ncsdec_lib::decompile_with_options(
        &bytes(vec![const_int(6), action(0, 1), action(1, 1), retn()]),
        DecompileOptions::default(),
        &table,
    )
    .unwrap();
    assert!(out.contains("PrintInteger(Random(6));"), "{out}");
}

#[test]
fn game_variant_selects_the_action_table() {
    let tables = ActionTables::default()
        .with(GameVariant::K1, Box::new(NwscriptTable::parse("int GetIsNight();").unwrap()))
        .with(GameVariant::K2, Box::new(NwscriptTable::parse("int GetIsDay();").unwrap()));
    let program = bytes(vec![action(0, 0), movsp(-4), retn()]);

    for (game, name) in [(GameVariant::K1, "GetIsNight();"), (GameVariant::K2, "GetIsDay();")] {
        let options = DecompileOptions {
            game,
            ..DecompileOptions::default()
        };
        let out = Decompiler::for_game(options, &tables).decompile_bytes(&program).unwrap();
        assert!(out.text.contains(name), "{game:?}: {}", out.text);
    }
}

fn table() -> NwscriptTable {
    NwscriptTable::parse("int Random(int n);\nvoid PrintInteger(int n);\nint GetIsNight();").unwrap()
}

fn with_table(v: Vec<Instr>) -> String {
    ncsdec_lib::decompile_with_options(&bytes(v), DecompileOptions::default(), &table()).unwrap()
}

/// `int i; <between> for (i = 0; i < 3; i++) PrintInteger(i);`
fn counter_loop(between: Vec<Instr>) -> Vec<Instr> {
    let mut v = vec![rsadd(NcsType::Int)];
    v.extend(between);
    v.extend([const_int(0), cpdownsp(-8, 4), movsp(-4)]);
    let head = v.len();
    v.extend([cptopsp(-4, 4), const_int(3), binary(op::LT, OperandPair::II), jz(0)]);
    v.extend([cptopsp(-4, 4), action(1, 1)]);
    v.extend([cptopsp(-4, 4), incisp(-8), movsp(-4), jmp(0)]);
    let end = v.len();
    v.extend([movsp(-4), retn()]);
    layout(&mut v);
    aim(&mut v, head + 3, end);
    aim(&mut v, end - 1, head);
    v
}

#[test]
fn counter_loop_becomes_for() {
    let out = with_table(counter_loop(Vec::new()));
    assert!(out.contains("    int int1;\n"), "{out}");
    assert!(out.contains("for (int1 = 0; int1 < 3; int1++) {"), "{out}");
    assert!(out.contains("        PrintInteger(int1);"), "{out}");
    assert!(!out.contains("while"), "{out}");
    assert!(!out.contains(':'), "{out}");

    let out = with_table(counter_loop(vec![const_int(9), action(1, 1)]));
    assert!(out.contains("    PrintInteger(9);\n    for (int1 = 0; int1 < 3; int1++) {"), "{out}");
}

/// `while (GetIsNight()) { if (Random(2)) <exit>; PrintInteger(1); }` where
/// `exit` jumps to the loop end or back to its head.
fn guarded_loop(exit_to_head: bool) -> Vec<Instr> {
    let mut v = vec![
        action(2, 0),
        jz(0),
        const_int(2),
        action(0, 1),
        jz(0),
        jmp(0),
        const_int(1),
        action(1, 1),
        jmp(0),
        retn(),
    ];
    layout(&mut v);
    aim(&mut v, 1, 9);
    aim(&mut v, 4, 6);
    aim(&mut v, 5, if exit_to_head { 0 } else { 9 });
    aim(&mut v, 8, 0);
    v
}

#[test]
fn break_inside_while() {
    let out = with_table(guarded_loop(false));
    assert!(out.contains("while (GetIsNight()) {"), "{out}");
    assert!(out.contains("        if (Random(2)) {\n            break;\n        }"), "{out}");
    assert!(out.contains("        PrintInteger(1);"), "{out}");
    assert!(!out.contains("goto"), "{out}");
}

#[test]
fn continue_inside_while() {
    let out = with_table(guarded_loop(true));
    assert!(out.contains("while (GetIsNight()) {"), "{out}");
    assert!(out.contains("            continue;"), "{out}");
    assert!(!out.contains("goto"), "{out}");
}

#[test]
fn break_inside_do_while() {
    // do { if (Random(2)) break; PrintInteger(1); } while (GetIsNight());
    let mut v = vec![
        const_int(2),
        action(0, 1),
        jz(0),
        jmp(0),
        const_int(1),
        action(1, 1),
        action(2, 0),
        jnz(0),
        retn(),
    ];
    layout(&mut v);
    aim(&mut v, 2, 4);
    aim(&mut v, 3, 8);
    aim(&mut v, 7, 0);
    let out = with_table(v);
    assert!(out.contains("    do {"), "{out}");
    assert!(out.contains("            break;"), "{out}");
    assert!(out.contains("} while (GetIsNight());"), "{out}");
    assert!(!out.contains("goto"), "{out}");
}

/// `int1 = 1;` followed by three nested ifs and a run of calls.
fn nested_ifs() -> Vec<Instr> {
    let mut v = vec![rsadd(NcsType::Int), const_int(1), cpdownsp(-8, 4), movsp(-4)];
    v.extend(call(0));
    v.extend([cptopsp(-4, 4), jz(0)]); // 7, 8
    v.extend(call(1));
    v.extend([cptopsp(-4, 4), const_int(2), binary(op::LT, OperandPair::II), jz(0)]); // 12..15
    v.extend(call(2));
    v.extend([cptopsp(-4, 4), const_int(3), binary(op::NEQUAL, OperandPair::II), jz(0)]); // 19..22
    v.extend(call(3));
    v.extend(call(4));
    v.extend(call(5)); // 29
    v.extend(call(6)); // 32
    for k in 7..=10 {
        v.extend(call(k)); // 35..
    }
    v.extend([movsp(-4), retn()]);
    layout(&mut v);
    aim(&mut v, 8, 35);
    aim(&mut v, 15, 32);
    aim(&mut v, 22, 29);
    v
}

struct Reassembler {
    bytes: Vec<u8>,
}

impl Compiler for Reassembler {
    fn compile(&self, source: &Path, output: &Path, _game: GameVariant) -> Result<(), CompileError> {
        let src = fs::read_to_string(source)?;
        if src.matches("if (").count() != 3 {
            return Err(CompileError::Failed {
                status: "exit status: 1".into(),
                diagnostics: src,
            });
        }
        fs::write(output, &self.bytes)?;
        Ok(())
    }
}

#[test]
fn nested_ifs_survive_a_round_trip() {
    let v = nested_ifs();
    assert_eq!(v.len(), 49);
    let program = assemble(&v);

    let out = ncsdec_lib::decompile(&program).unwrap();
    assert!(out.contains("    if (int1) {"), "{out}");
    assert!(out.contains("        if (int1 < 2) {"), "{out}");
    assert!(out.contains("            if (int1 != 3) {"), "{out}");
    assert!(out.contains("                action_1(4);"), "{out}");
    assert!(!out.contains("goto"), "{out}");

    let compiler = Reassembler { bytes: program.clone() };
    let outcome = round_trip(&program, DecompileOptions::default(), &EmptyTable, &compiler).unwrap();
    assert!(matches!(outcome, RoundTripOutcome::Stable), "{outcome:?}");
    assert_eq!(normalize(&out), normalize(&ncsdec_lib::decompile(&program).unwrap()));
}

#[test]
fn differing_recompile_is_reported() {
    let program = assemble(&nested_ifs());
    let mut other = nested_ifs();
    other[35] = const_int(70);
    layout(&mut other);
    let compiler = Reassembler { bytes: assemble(&other) };
    let outcome = round_trip(&program, DecompileOptions::default(), &EmptyTable, &compiler).unwrap();
    let RoundTripOutcome::Diverged { first, second, line } = outcome else {
        panic!("{outcome:?}");
    };
    let (a, b) = (normalize(&first), normalize(&second));
    assert_eq!(a[line - 1], "action_1(7);");
    assert_eq!(b[line - 1], "action_1(70);");
    assert_eq!(a[..line - 1], b[..line - 1]);
}

#[test]
fn decode_errors_are_fatal() {
    assert!(matches!(ncsdec_lib::decompile(b"NCS V1.0"), Err(NcsError::InvalidHeader)));
    assert!(matches!(ncsdec_lib::decompile(b"not bytecode at all"), Err(NcsError::InvalidHeader)));
    let mut truncated = bytes(vec![const_int(1), movsp(-4), retn()]);
    truncated.truncate(truncated.len() - 1);
    assert!(ncsdec_lib::decompile(&truncated).is_err());
}

#[test]
fn failed_routine_becomes_a_placeholder() {
    // main calls sub1 and sub2; sub1 calls into the middle of an instruction.
    let d = Decompiler::new(DecompileOptions::default(), &EmptyTable)
        .decompile_bytes(&bytes(vec![jsr(14), jsr(16), retn(), jsr(3), retn(), retn()]))
        .unwrap();
    assert!(d.failed().count() >= 1);
    assert!(d.text.contains("decompilation failed for this routine"), "{}", d.text);
    assert!(d.text.contains("void sub2() {"), "{}", d.text);
}

#[test]
fn cancellation_stops_decompilation() {
    let flag = AtomicBool::new(true);
    let err = Decompiler::new(DecompileOptions::default(), &EmptyTable)
        .with_cancel(&flag)
        .decompile_bytes(&bytes(vec![const_int(1), movsp(-4), retn()]))
        .unwrap_err();
    assert!(matches!(err, NcsError::Cancelled));
}

#[test]
fn parallel_output_matches_sequential() {
    let program = assemble(&nested_ifs());
    let parallel = DecompileOptions {
        parallel: true,
        ..DecompileOptions::default()
    };
    assert_eq!(
        ncsdec_lib::decompile_with_options(&program, parallel, &EmptyTable).unwrap(),
        ncsdec_lib::decompile(&program).unwrap()
    );
}
