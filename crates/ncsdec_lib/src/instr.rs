use std::fmt;
use std::io::Write;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tracing::warn;

use crate::error::NcsError;
use crate::tables::{self, op, OpFmt};
use crate::types::{OperandPair, QUAL_FLOAT, QUAL_INT, QUAL_OBJECT, QUAL_STRING};

pub const MAGIC: &[u8; 8] = b"NCS V1.0";
pub const SIZE_MARKER: u8 = 0x42;
/// Byte offset of the first instruction.
pub const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    StackCopy { offset: i32, size: u16 },
    Int(i32),
    Float(f32),
    /// String bytes decoded as Latin-1, one char per byte.
    Str(String),
    Object(i32),
    Action { id: u16, argc: u8 },
    /// Byte width of a structure comparison.
    Size(u16),
    /// Jump offset, stack delta or stack position, depending on the opcode.
    Offset(i32),
    Destruct { size: u16, exclude_offset: i16, exclude_size: u16 },
    StoreState { bp_size: u32, sp_size: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub pos: usize,
    pub op: u8,
    pub qual: u8,
    pub name: &'static str,
    pub operand: Operand,
}

pub(crate) fn opcode_info(op: u8) -> Option<&'static tables::OpInfo> {
    tables::OPCODE_INFO.iter().find(|i| i.code == op)
}

pub fn opcode_name(op: u8) -> &'static str {
    opcode_info(op).map(|i| i.name).unwrap_or("???")
}

impl Instr {
    /// Builds an instruction at position 0; `layout` assigns real positions.
    pub fn new(op: u8, qual: u8, operand: Operand) -> Self {
        Self {
            pos: 0,
            op,
            qual,
            name: opcode_name(op),
            operand,
        }
    }

    pub fn len(&self) -> usize {
        2 + match &self.operand {
            Operand::None => 0,
            Operand::StackCopy { .. } => 6,
            Operand::Int(_) | Operand::Float(_) | Operand::Object(_) | Operand::Offset(_) => 4,
            Operand::Str(s) => 2 + s.chars().count(),
            Operand::Action { .. } => 3,
            Operand::Size(_) => 2,
            Operand::Destruct { .. } => 6,
            Operand::StoreState { .. } => 8,
        }
    }

    pub fn end(&self) -> usize {
        self.pos + self.len()
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.op, op::JMP | op::JSR | op::JZ | op::JNZ)
    }

    pub fn offset(&self) -> Option<i32> {
        match self.operand {
            Operand::Offset(o) => Some(o),
            Operand::StackCopy { offset, .. } => Some(offset),
            _ => None,
        }
    }

    /// Absolute target of a jump instruction.
    pub fn jump_target(&self) -> Option<usize> {
        if !self.is_jump() {
            return None;
        }
        let rel = self.offset()?;
        let t = self.pos as i64 + rel as i64;
        if t < 0 { None } else { Some(t as usize) }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.op)?;
        w.write_u8(self.qual)?;
        match &self.operand {
            Operand::None => {}
            Operand::StackCopy { offset, size } => {
                w.write_i32::<BigEndian>(*offset)?;
                w.write_u16::<BigEndian>(*size)?;
            }
            Operand::Int(v) | Operand::Object(v) | Operand::Offset(v) => w.write_i32::<BigEndian>(*v)?,
            Operand::Float(v) => w.write_f32::<BigEndian>(*v)?,
            Operand::Str(s) => {
                let bytes: Vec<u8> = s.chars().map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' }).collect();
                w.write_u16::<BigEndian>(bytes.len() as u16)?;
                w.write_all(&bytes)?;
            }
            Operand::Action { id, argc } => {
                w.write_u16::<BigEndian>(*id)?;
                w.write_u8(*argc)?;
            }
            Operand::Size(v) => w.write_u16::<BigEndian>(*v)?,
            Operand::Destruct { size, exclude_offset, exclude_size } => {
                w.write_u16::<BigEndian>(*size)?;
                w.write_i16::<BigEndian>(*exclude_offset)?;
                w.write_u16::<BigEndian>(*exclude_size)?;
            }
            Operand::StoreState { bp_size, sp_size } => {
                w.write_u32::<BigEndian>(*bp_size)?;
                w.write_u32::<BigEndian>(*sp_size)?;
            }
        }
        Ok(())
    }
}

pub fn qualifier_suffix(qual: u8) -> String {
    if let Some(p) = OperandPair::from_qualifier(qual) {
        return format!("{p:?}");
    }
    match qual {
        QUAL_INT => "I".into(),
        QUAL_FLOAT => "F".into(),
        QUAL_STRING => "S".into(),
        QUAL_OBJECT => "O".into(),
        0x10..=0x19 => format!("E{}", qual - 0x10),
        _ => String::new(),
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x} {}{}", self.pos, self.name, qualifier_suffix(self.qual))?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::StackCopy { offset, size } => write!(f, " {offset}, {size}"),
            Operand::Int(v) => write!(f, " {v}"),
            Operand::Float(v) => write!(f, " {v:?}"),
            Operand::Str(s) => write!(f, " {s:?}"),
            Operand::Object(v) => write!(f, " 0x{v:x}"),
            Operand::Action { id, argc } => write!(f, " {id}({argc})"),
            Operand::Size(v) => write!(f, " {v}"),
            Operand::Offset(v) => match self.jump_target() {
                Some(t) => write!(f, " {v:+} -> {t:08x}"),
                None => write!(f, " {v}"),
            },
            Operand::Destruct { size, exclude_offset, exclude_size } => {
                write!(f, " {size}, {exclude_offset}, {exclude_size}")
            }
            Operand::StoreState { bp_size, sp_size } => write!(f, " {bp_size}, {sp_size}"),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn get_u8(&mut self) -> Result<u8, NcsError> {
        if self.remaining() < 1 {
            return Err(NcsError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16, NcsError> {
        let v = BigEndian::read_u16(self.get_bytes(2)?);
        Ok(v)
    }

    fn get_i16(&mut self) -> Result<i16, NcsError> {
        Ok(BigEndian::read_i16(self.get_bytes(2)?))
    }

    fn get_u32(&mut self) -> Result<u32, NcsError> {
        Ok(BigEndian::read_u32(self.get_bytes(4)?))
    }

    fn get_i32(&mut self) -> Result<i32, NcsError> {
        Ok(BigEndian::read_i32(self.get_bytes(4)?))
    }

    fn get_f32(&mut self) -> Result<f32, NcsError> {
        Ok(BigEndian::read_f32(self.get_bytes(4)?))
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], NcsError> {
        if self.remaining() < n {
            return Err(NcsError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

fn read_operand(r: &mut Reader<'_>, info: &tables::OpInfo, qual: u8, pos: usize) -> Result<Operand, NcsError> {
    let operand = match info.fmt {
        OpFmt::NONE => Operand::None,
        OpFmt::STACK_COPY => Operand::StackCopy {
            offset: r.get_i32()?,
            size: r.get_u16()?,
        },
        OpFmt::CONSTANT => match qual {
            QUAL_INT => Operand::Int(r.get_i32()?),
            QUAL_FLOAT => Operand::Float(r.get_f32()?),
            QUAL_OBJECT => Operand::Object(r.get_i32()?),
            QUAL_STRING => {
                let len = r.get_u16()? as usize;
                let bytes = r.get_bytes(len)?;
                Operand::Str(bytes.iter().map(|&b| b as char).collect())
            }
            _ => return Err(NcsError::InvalidString { pos }),
        },
        OpFmt::ACTION => Operand::Action {
            id: r.get_u16()?,
            argc: r.get_u8()?,
        },
        OpFmt::COMPARE => {
            if OperandPair::from_qualifier(qual) == Some(OperandPair::TT) {
                Operand::Size(r.get_u16()?)
            } else {
                Operand::None
            }
        }
        OpFmt::I32 => Operand::Offset(r.get_i32()?),
        OpFmt::DESTRUCT => Operand::Destruct {
            size: r.get_u16()?,
            exclude_offset: r.get_i16()?,
            exclude_size: r.get_u16()?,
        },
        OpFmt::STORE_STATE => Operand::StoreState {
            bp_size: r.get_u32()?,
            sp_size: r.get_u32()?,
        },
    };
    Ok(operand)
}

fn decode_one(r: &mut Reader<'_>) -> Result<Instr, NcsError> {
    let pos = r.pos;
    let truncated = |r: &Reader<'_>| NcsError::TruncatedInstruction {
        pos,
        remaining: r.buf.len() - pos,
    };
    let op = r.get_u8().map_err(|_| truncated(r))?;
    let qual = r.get_u8().map_err(|_| truncated(r))?;
    let info = opcode_info(op).ok_or(NcsError::InvalidOpcode { pos, op })?;
    if !info.any_qual && !info.quals.contains(&qual) {
        return Err(NcsError::InvalidQualifier {
            pos,
            name: info.name,
            qual,
        });
    }
    let operand = match read_operand(r, info, qual, pos) {
        Ok(v) => v,
        Err(NcsError::Eof) => return Err(truncated(r)),
        Err(e) => return Err(e),
    };
    Ok(Instr {
        pos,
        op,
        qual,
        name: info.name,
        operand,
    })
}

/// Decodes a complete `.ncs` file into its instruction stream.
pub fn decode(bytes: &[u8]) -> Result<Vec<Instr>, NcsError> {
    let mut r = Reader::new(bytes);
    let magic = r.get_bytes(MAGIC.len()).map_err(|_| NcsError::InvalidHeader)?;
    if magic != MAGIC {
        return Err(NcsError::InvalidHeader);
    }
    if r.get_u8().map_err(|_| NcsError::InvalidHeader)? != SIZE_MARKER {
        return Err(NcsError::InvalidHeader);
    }
    let declared = r.get_u32().map_err(|_| NcsError::InvalidHeader)? as usize;
    if declared > bytes.len() {
        return Err(NcsError::SizeMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    if declared < bytes.len() {
        warn!(declared, actual = bytes.len(), "ignoring trailing bytes after program");
    }

    let mut r = Reader::new(&bytes[..declared]);
    r.pos = HEADER_LEN;
    let mut out = Vec::new();
    while r.remaining() > 0 {
        out.push(decode_one(&mut r)?);
    }
    if out.is_empty() {
        return Err(NcsError::Empty);
    }
    Ok(out)
}

/// Assigns consecutive positions starting right after the header.
pub fn layout(instrs: &mut [Instr]) {
    let mut pos = HEADER_LEN;
    for ins in instrs.iter_mut() {
        ins.pos = pos;
        pos += ins.len();
    }
}

/// Encodes an instruction stream as a complete `.ncs` file.
pub fn assemble(instrs: &[Instr]) -> Vec<u8> {
    let mut body = Vec::new();
    for ins in instrs {
        // Writing into a Vec cannot fail.
        let _ = ins.write_to(&mut body);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.push(SIZE_MARKER);
    let _ = out.write_u32::<BigEndian>((HEADER_LEN + body.len()) as u32);
    out.extend_from_slice(&body);
    out
}

pub fn disassemble_instrs(instrs: &[Instr]) -> String {
    let mut out = String::new();
    for ins in instrs {
        out.push_str(&ins.to_string());
        out.push('\n');
    }
    out
}

/// Constructors for hand-built instruction streams.
pub mod asm {
    use super::{Instr, Operand};
    use crate::tables::op;
    use crate::types::{NcsType, OperandPair, QUAL_NONE, QUAL_STACK};

    fn q(ty: NcsType) -> u8 {
        ty.qualifier().unwrap_or(QUAL_NONE)
    }

    pub fn rsadd(ty: NcsType) -> Instr {
        Instr::new(op::RSADD, q(ty), Operand::None)
    }

    pub fn const_int(v: i32) -> Instr {
        Instr::new(op::CONST, q(NcsType::Int), Operand::Int(v))
    }

    pub fn const_float(v: f32) -> Instr {
        Instr::new(op::CONST, q(NcsType::Float), Operand::Float(v))
    }

    pub fn const_string(s: &str) -> Instr {
        Instr::new(op::CONST, q(NcsType::String), Operand::Str(s.to_string()))
    }

    pub fn const_object(v: i32) -> Instr {
        Instr::new(op::CONST, q(NcsType::Object), Operand::Object(v))
    }

    pub fn cpdownsp(offset: i32, size: u16) -> Instr {
        Instr::new(op::CPDOWNSP, QUAL_STACK, Operand::StackCopy { offset, size })
    }

    pub fn cptopsp(offset: i32, size: u16) -> Instr {
        Instr::new(op::CPTOPSP, QUAL_STACK, Operand::StackCopy { offset, size })
    }

    pub fn cpdownbp(offset: i32, size: u16) -> Instr {
        Instr::new(op::CPDOWNBP, QUAL_STACK, Operand::StackCopy { offset, size })
    }

    pub fn cptopbp(offset: i32, size: u16) -> Instr {
        Instr::new(op::CPTOPBP, QUAL_STACK, Operand::StackCopy { offset, size })
    }

    pub fn action(id: u16, argc: u8) -> Instr {
        Instr::new(op::ACTION, QUAL_NONE, Operand::Action { id, argc })
    }

    /// Any two-operand instruction (arithmetic, comparison or logical).
    pub fn binary(opcode: u8, pair: OperandPair) -> Instr {
        Instr::new(opcode, pair.qualifier(), Operand::None)
    }

    pub fn unary(opcode: u8, ty: NcsType) -> Instr {
        Instr::new(opcode, q(ty), Operand::None)
    }

    pub fn movsp(delta: i32) -> Instr {
        Instr::new(op::MOVSP, QUAL_NONE, Operand::Offset(delta))
    }

    pub fn jmp(rel: i32) -> Instr {
        Instr::new(op::JMP, QUAL_NONE, Operand::Offset(rel))
    }

    pub fn jsr(rel: i32) -> Instr {
        Instr::new(op::JSR, QUAL_NONE, Operand::Offset(rel))
    }

    pub fn jz(rel: i32) -> Instr {
        Instr::new(op::JZ, QUAL_NONE, Operand::Offset(rel))
    }

    pub fn jnz(rel: i32) -> Instr {
        Instr::new(op::JNZ, QUAL_NONE, Operand::Offset(rel))
    }

    pub fn retn() -> Instr {
        Instr::new(op::RETN, QUAL_NONE, Operand::None)
    }

    pub fn incisp(offset: i32) -> Instr {
        Instr::new(op::INCISP, q(NcsType::Int), Operand::Offset(offset))
    }

    pub fn decisp(offset: i32) -> Instr {
        Instr::new(op::DECISP, q(NcsType::Int), Operand::Offset(offset))
    }

    pub fn incibp(offset: i32) -> Instr {
        Instr::new(op::INCIBP, q(NcsType::Int), Operand::Offset(offset))
    }

    pub fn savebp() -> Instr {
        Instr::new(op::SAVEBP, QUAL_NONE, Operand::None)
    }

    pub fn restorebp() -> Instr {
        Instr::new(op::RESTOREBP, QUAL_NONE, Operand::None)
    }

    pub fn store_state(bp_size: u32, sp_size: u32) -> Instr {
        Instr::new(op::STORE_STATE, 0x10, Operand::StoreState { bp_size, sp_size })
    }

    pub fn destruct(size: u16, exclude_offset: i16, exclude_size: u16) -> Instr {
        Instr::new(
            op::DESTRUCT,
            QUAL_STACK,
            Operand::Destruct {
                size,
                exclude_offset,
                exclude_size,
            },
        )
    }

    pub fn nop() -> Instr {
        Instr::new(op::NOP, QUAL_NONE, Operand::None)
    }
}
