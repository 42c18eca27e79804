use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of one evaluation stack slot in bytes.
pub const SLOT_BYTES: i32 = 4;

pub const QUAL_NONE: u8 = 0x00;
pub const QUAL_STACK: u8 = 0x01;
pub const QUAL_INT: u8 = 0x03;
pub const QUAL_FLOAT: u8 = 0x04;
pub const QUAL_STRING: u8 = 0x05;
pub const QUAL_OBJECT: u8 = 0x06;
pub const QUAL_ENGINE_FIRST: u8 = 0x10;
pub const QUAL_ENGINE_LAST: u8 = 0x19;

const ENGINE_NAMES: [&str; 10] = [
    "effect",
    "event",
    "location",
    "talent",
    "itemproperty",
    "engine5",
    "engine6",
    "engine7",
    "engine8",
    "engine9",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NcsType {
    Void,
    Int,
    Float,
    String,
    Object,
    Vector,
    /// Deferred `action` argument; lives outside the evaluation stack.
    Action,
    /// Engine structure N (effect, event, location, ...).
    Engine(u8),
}

impl NcsType {
    pub fn from_qualifier(q: u8) -> Option<NcsType> {
        match q {
            QUAL_INT => Some(NcsType::Int),
            QUAL_FLOAT => Some(NcsType::Float),
            QUAL_STRING => Some(NcsType::String),
            QUAL_OBJECT => Some(NcsType::Object),
            QUAL_ENGINE_FIRST..=QUAL_ENGINE_LAST => Some(NcsType::Engine(q - QUAL_ENGINE_FIRST)),
            _ => None,
        }
    }

    pub fn qualifier(self) -> Option<u8> {
        match self {
            NcsType::Int => Some(QUAL_INT),
            NcsType::Float => Some(QUAL_FLOAT),
            NcsType::String => Some(QUAL_STRING),
            NcsType::Object => Some(QUAL_OBJECT),
            NcsType::Engine(n) if n <= QUAL_ENGINE_LAST - QUAL_ENGINE_FIRST => Some(QUAL_ENGINE_FIRST + n),
            _ => None,
        }
    }

    /// Number of stack slots a value of this type occupies.
    pub fn width(self) -> usize {
        match self {
            NcsType::Void | NcsType::Action => 0,
            NcsType::Vector => 3,
            _ => 1,
        }
    }

    pub fn from_keyword(s: &str) -> Option<NcsType> {
        match s {
            "void" => Some(NcsType::Void),
            "int" => Some(NcsType::Int),
            "float" => Some(NcsType::Float),
            "string" => Some(NcsType::String),
            "object" => Some(NcsType::Object),
            "vector" => Some(NcsType::Vector),
            "action" => Some(NcsType::Action),
            _ => ENGINE_NAMES
                .iter()
                .position(|n| *n == s)
                .map(|i| NcsType::Engine(i as u8)),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            NcsType::Void => "void",
            NcsType::Int => "int",
            NcsType::Float => "float",
            NcsType::String => "string",
            NcsType::Object => "object",
            NcsType::Vector => "vector",
            NcsType::Action => "action",
            NcsType::Engine(n) => ENGINE_NAMES.get(n as usize).copied().unwrap_or("engine"),
        }
    }
}

impl fmt::Display for NcsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Operand typing of a two-operand instruction, taken from its qualifier byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandPair {
    II,
    FF,
    OO,
    SS,
    /// Structure comparison; the operand width comes from the instruction.
    TT,
    IF,
    FI,
    EE(u8),
    VV,
    VF,
    FV,
}

impl OperandPair {
    pub fn from_qualifier(q: u8) -> Option<OperandPair> {
        match q {
            0x20 => Some(OperandPair::II),
            0x21 => Some(OperandPair::FF),
            0x22 => Some(OperandPair::OO),
            0x23 => Some(OperandPair::SS),
            0x24 => Some(OperandPair::TT),
            0x25 => Some(OperandPair::IF),
            0x26 => Some(OperandPair::FI),
            0x30..=0x39 => Some(OperandPair::EE(q - 0x30)),
            0x3a => Some(OperandPair::VV),
            0x3b => Some(OperandPair::VF),
            0x3c => Some(OperandPair::FV),
            _ => None,
        }
    }

    pub fn qualifier(self) -> u8 {
        match self {
            OperandPair::II => 0x20,
            OperandPair::FF => 0x21,
            OperandPair::OO => 0x22,
            OperandPair::SS => 0x23,
            OperandPair::TT => 0x24,
            OperandPair::IF => 0x25,
            OperandPair::FI => 0x26,
            OperandPair::EE(n) => 0x30 + n,
            OperandPair::VV => 0x3a,
            OperandPair::VF => 0x3b,
            OperandPair::FV => 0x3c,
        }
    }

    /// Declared types of the left and right operands. `TT` reports `Void`
    /// because its layout is only known from the size operand.
    pub fn types(self) -> (NcsType, NcsType) {
        match self {
            OperandPair::II => (NcsType::Int, NcsType::Int),
            OperandPair::FF => (NcsType::Float, NcsType::Float),
            OperandPair::OO => (NcsType::Object, NcsType::Object),
            OperandPair::SS => (NcsType::String, NcsType::String),
            OperandPair::TT => (NcsType::Void, NcsType::Void),
            OperandPair::IF => (NcsType::Int, NcsType::Float),
            OperandPair::FI => (NcsType::Float, NcsType::Int),
            OperandPair::EE(n) => (NcsType::Engine(n), NcsType::Engine(n)),
            OperandPair::VV => (NcsType::Vector, NcsType::Vector),
            OperandPair::VF => (NcsType::Vector, NcsType::Float),
            OperandPair::FV => (NcsType::Float, NcsType::Vector),
        }
    }

    pub fn involves_vector(self) -> bool {
        matches!(self, OperandPair::VV | OperandPair::VF | OperandPair::FV)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifiers_map_both_ways() {
        for q in [QUAL_INT, QUAL_FLOAT, QUAL_STRING, QUAL_OBJECT, 0x10, 0x12, 0x19] {
            let ty = NcsType::from_qualifier(q).unwrap();
            assert_eq!(ty.qualifier(), Some(q));
        }
        assert_eq!(NcsType::from_qualifier(QUAL_STACK), None);
    }

    #[test]
    fn widths() {
        assert_eq!(NcsType::Vector.width(), 3);
        assert_eq!(NcsType::Int.width(), 1);
        assert_eq!(NcsType::Engine(2).width(), 1);
        assert_eq!(NcsType::Action.width(), 0);
    }

    #[test]
    fn keywords_round_trip() {
        for kw in ["int", "float", "string", "object", "vector", "location", "effect", "action", "void"] {
            assert_eq!(NcsType::from_keyword(kw).unwrap().keyword(), kw);
        }
        assert_eq!(NcsType::from_keyword("struct"), None);
    }
}
