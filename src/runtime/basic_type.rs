//! Basic types and top-of-stack states.

use serde::Serialize;

/// Element and value types as encoded in layout helpers and cp-cache flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
    Address = 15,
    Illegal = 99,
}

impl BasicType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            12 => BasicType::Object,
            13 => BasicType::Array,
            14 => BasicType::Void,
            15 => BasicType::Address,
            99 => BasicType::Illegal,
            _ => return None,
        })
    }

    /// Type of a signature character (`Z`, `I`, `L`, `[` ...).
    pub fn from_signature_char(c: u8) -> Option<Self> {
        Some(match c {
            b'Z' => BasicType::Boolean,
            b'C' => BasicType::Char,
            b'F' => BasicType::Float,
            b'D' => BasicType::Double,
            b'B' => BasicType::Byte,
            b'S' => BasicType::Short,
            b'I' => BasicType::Int,
            b'J' => BasicType::Long,
            b'L' => BasicType::Object,
            b'[' => BasicType::Array,
            b'V' => BasicType::Void,
            _ => return None,
        })
    }

    /// Number of 32-bit stack slots a value of this type occupies.
    pub fn size_in_words(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void | BasicType::Illegal => 0,
            _ => 1,
        }
    }

    /// log2 of the array element size in bytes.
    pub fn element_size_log2(self) -> u32 {
        match self {
            BasicType::Boolean | BasicType::Byte => 0,
            BasicType::Char | BasicType::Short => 1,
            BasicType::Long | BasicType::Double => 3,
            _ => 2,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    /// TOS state holding a value of this type.
    pub fn tos_state(self) -> TosState {
        match self {
            BasicType::Byte => TosState::Btos,
            BasicType::Boolean => TosState::Ztos,
            BasicType::Char => TosState::Ctos,
            BasicType::Short => TosState::Stos,
            BasicType::Int => TosState::Itos,
            BasicType::Long => TosState::Ltos,
            BasicType::Float => TosState::Ftos,
            BasicType::Double => TosState::Dtos,
            BasicType::Object | BasicType::Array => TosState::Atos,
            _ => TosState::Vtos,
        }
    }
}

/// Number of TOS states (rows of a dispatch table).
pub const NUMBER_OF_STATES: usize = 10;

/// What currently lives in the top-of-stack register(s).
///
/// `Ltos` uses EDX:EAX, `Ftos`/`Dtos` use ST0, all other non-void states
/// use EAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TosState {
    Btos = 0,
    Ztos = 1,
    Ctos = 2,
    Stos = 3,
    Itos = 4,
    Ltos = 5,
    Ftos = 6,
    Dtos = 7,
    Atos = 8,
    Vtos = 9,
}

impl TosState {
    pub const ALL: [TosState; NUMBER_OF_STATES] = [
        TosState::Btos,
        TosState::Ztos,
        TosState::Ctos,
        TosState::Stos,
        TosState::Itos,
        TosState::Ltos,
        TosState::Ftos,
        TosState::Dtos,
        TosState::Atos,
        TosState::Vtos,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            TosState::Btos => "btos",
            TosState::Ztos => "ztos",
            TosState::Ctos => "ctos",
            TosState::Stos => "stos",
            TosState::Itos => "itos",
            TosState::Ltos => "ltos",
            TosState::Ftos => "ftos",
            TosState::Dtos => "dtos",
            TosState::Atos => "atos",
            TosState::Vtos => "vtos",
        }
    }

    pub fn basic_type(self) -> BasicType {
        match self {
            TosState::Btos => BasicType::Byte,
            TosState::Ztos => BasicType::Boolean,
            TosState::Ctos => BasicType::Char,
            TosState::Stos => BasicType::Short,
            TosState::Itos => BasicType::Int,
            TosState::Ltos => BasicType::Long,
            TosState::Ftos => BasicType::Float,
            TosState::Dtos => BasicType::Double,
            TosState::Atos => BasicType::Object,
            TosState::Vtos => BasicType::Void,
        }
    }

    /// x87 stack depth while this state is cached.
    pub fn fpu_depth(self) -> i32 {
        match self {
            TosState::Ftos | TosState::Dtos => 1,
            _ => 0,
        }
    }

    /// Expression-stack words the cached value takes once pushed.
    pub fn stack_words(self) -> usize {
        self.basic_type().size_in_words()
    }
}

impl std::fmt::Display for TosState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tos_roundtrip_through_basic_type() {
        for tos in TosState::ALL {
            assert_eq!(tos.basic_type().tos_state(), tos);
        }
    }

    #[test]
    fn test_fpu_states() {
        assert_eq!(TosState::Dtos.fpu_depth(), 1);
        assert_eq!(TosState::Ltos.fpu_depth(), 0);
        assert_eq!(TosState::Ltos.stack_words(), 2);
        assert_eq!(TosState::Vtos.stack_words(), 0);
    }

    #[test]
    fn test_signature_chars() {
        assert_eq!(BasicType::from_signature_char(b'J'), Some(BasicType::Long));
        assert_eq!(BasicType::from_signature_char(b'['), Some(BasicType::Array));
        assert_eq!(BasicType::from_signature_char(b'X'), None);
        assert_eq!(BasicType::Char.element_size_log2(), 1);
    }
}
