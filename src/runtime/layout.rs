//! Object and metadata layout in the 32-bit address space.
//!
//! All offsets are in bytes unless a name says otherwise. Generated code
//! and the host-side helpers (method builder, frame walker, deoptimizer)
//! share these constants.

use super::basic_type::BasicType;

/// Bytes per machine word.
pub const WORD_SIZE: i32 = 4;
/// Bytes per expression-stack element.
pub const STACK_ELEMENT_SIZE: i32 = 4;
/// log2 of the word size.
pub const LOG_WORD_SIZE: u32 = 2;

/// Object header.
pub mod oop {
    pub const MARK_OFFSET: i32 = 0;
    pub const KLASS_OFFSET: i32 = 4;
    pub const HEADER_SIZE: i32 = 8;
}

/// Mark word lock bits.
pub mod mark {
    pub const LOCK_MASK: u32 = 0x3;
    pub const LOCKED_VALUE: u32 = 0x0;
    pub const UNLOCKED_VALUE: u32 = 0x1;
    pub const MONITOR_VALUE: u32 = 0x2;
    pub const MARKED_VALUE: u32 = 0x3;
    /// Prototype header of a fresh object (no hash, unlocked)
    pub const PROTOTYPE: u32 = UNLOCKED_VALUE;
}

/// Arrays.
pub mod array {
    pub const LENGTH_OFFSET: i32 = 8;
    pub const HEADER_SIZE: i32 = 12;
}

/// Offset of the first element of an array of `ty`.
pub fn array_base_offset(ty: BasicType) -> i32 {
    match ty {
        BasicType::Long | BasicType::Double => 16,
        _ => array::HEADER_SIZE,
    }
}

/// Klass metadata.
pub mod klass {
    pub const LAYOUT_HELPER_OFFSET: i32 = 0;
    pub const SUPER_CHECK_OFFSET_OFFSET: i32 = 4;
    pub const SECONDARY_SUPER_CACHE_OFFSET: i32 = 8;
    /// Pointer to an int-length array of klass pointers
    pub const SECONDARY_SUPERS_OFFSET: i32 = 12;
    pub const PRIMARY_SUPERS_OFFSET: i32 = 16;
    pub const PRIMARY_SUPER_LIMIT: i32 = 8;
    pub const JAVA_MIRROR_OFFSET: i32 = 48;
    pub const SUPER_OFFSET: i32 = 52;
    pub const ACCESS_FLAGS_OFFSET: i32 = 56;
    pub const PROTOTYPE_HEADER_OFFSET: i32 = 60;
    /// InstanceKlass: initialization state byte
    pub const INIT_STATE_OFFSET: i32 = 64;
    /// ObjArrayKlass: element klass
    pub const ELEMENT_KLASS_OFFSET: i32 = 68;
    pub const VTABLE_LENGTH_OFFSET: i32 = 72;
    pub const ITABLE_LENGTH_OFFSET: i32 = 76;
    /// First vtable entry; each entry is one method pointer
    pub const VTABLE_START_OFFSET: i32 = 80;
    pub const VTABLE_ENTRY_SIZE: i32 = 4;
    /// Itable offset entry: {interface klass, byte offset of its method block}
    pub const ITABLE_OFFSET_ENTRY_SIZE: i32 = 8;
    pub const ITABLE_METHOD_ENTRY_SIZE: i32 = 4;

    pub const FULLY_INITIALIZED: u8 = 4;
    pub const HAS_FINALIZER: u32 = 0x4000_0000;
}

/// Layout helper encoding.
///
/// Instances store their size in bytes (slow-path bit 0). Arrays store
/// `tag << 30 | header_size << 16 | element_type << 8 | log2_element_size`.
pub mod lh {
    pub const NEUTRAL_VALUE: i32 = 0;
    pub const INSTANCE_SLOW_PATH_BIT: i32 = 0x01;
    pub const LOG2_ELEMENT_SIZE_SHIFT: u32 = 0;
    pub const LOG2_ELEMENT_SIZE_MASK: i32 = 0x3F;
    pub const ELEMENT_TYPE_SHIFT: u32 = 8;
    pub const ELEMENT_TYPE_MASK: i32 = 0xFF;
    pub const HEADER_SIZE_SHIFT: u32 = 16;
    pub const HEADER_SIZE_MASK: i32 = 0xFF;
    pub const ARRAY_TAG_SHIFT: u32 = 30;
    pub const ARRAY_TAG_TYPE_VALUE: u32 = 0x3;
    pub const ARRAY_TAG_OBJ_VALUE: u32 = 0x2;
}

/// Layout helper of a type array of `ty`.
pub fn type_array_layout_helper(ty: BasicType) -> i32 {
    array_layout_helper(lh::ARRAY_TAG_TYPE_VALUE, ty)
}

/// Layout helper of an object array.
pub fn obj_array_layout_helper() -> i32 {
    array_layout_helper(lh::ARRAY_TAG_OBJ_VALUE, BasicType::Object)
}

fn array_layout_helper(tag: u32, ty: BasicType) -> i32 {
    ((tag << lh::ARRAY_TAG_SHIFT)
        | ((array_base_offset(ty) as u32) << lh::HEADER_SIZE_SHIFT)
        | ((ty as u32) << lh::ELEMENT_TYPE_SHIFT)
        | ty.element_size_log2()) as i32
}

/// Decoded array layout helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub is_obj_array: bool,
    pub header_size: u32,
    pub element_type: Option<BasicType>,
    pub log2_element_size: u32,
}

/// Decode a layout helper; `None` for instance klasses.
pub fn decode_array_layout_helper(helper: i32) -> Option<ArrayLayout> {
    if helper >= lh::NEUTRAL_VALUE {
        return None;
    }
    let bits = helper as u32;
    Some(ArrayLayout {
        is_obj_array: (bits >> lh::ARRAY_TAG_SHIFT) == lh::ARRAY_TAG_OBJ_VALUE,
        header_size: (bits >> lh::HEADER_SIZE_SHIFT) & lh::HEADER_SIZE_MASK as u32,
        element_type: BasicType::from_u8(((bits >> lh::ELEMENT_TYPE_SHIFT) & 0xFF) as u8),
        log2_element_size: bits & lh::LOG2_ELEMENT_SIZE_MASK as u32,
    })
}

/// Method metadata.
pub mod method {
    pub const CONST_METHOD_OFFSET: i32 = 0;
    pub const ACCESS_FLAGS_OFFSET: i32 = 4;
    pub const METHOD_DATA_OFFSET: i32 = 8;
    pub const METHOD_COUNTERS_OFFSET: i32 = 12;
    pub const VTABLE_INDEX_OFFSET: i32 = 16;
    pub const INTRINSIC_ID_OFFSET: i32 = 20;
    pub const FROM_INTERPRETED_OFFSET: i32 = 24;
    pub const FROM_COMPILED_OFFSET: i32 = 28;
    pub const INTERPRETER_ENTRY_OFFSET: i32 = 32;
    /// Compiled code (osr nmethods are looked up by the runtime)
    pub const CODE_OFFSET: i32 = 36;
    pub const SIZE: u32 = 40;
}

/// Immutable part of a method.
pub mod const_method {
    pub const CONSTANTS_OFFSET: i32 = 0;
    pub const CODE_SIZE_OFFSET: i32 = 4;
    pub const MAX_STACK_OFFSET: i32 = 6;
    pub const MAX_LOCALS_OFFSET: i32 = 8;
    pub const SIZE_OF_PARAMETERS_OFFSET: i32 = 10;
    pub const RESULT_TYPE_OFFSET: i32 = 12;
    pub const EXCEPTION_TABLE_OFFSET: i32 = 16;
    pub const EXCEPTION_TABLE_LENGTH_OFFSET: i32 = 20;
    /// Bytecodes start here
    pub const CODES_OFFSET: i32 = 24;
    /// Exception table entry: {start_pc, end_pc, handler_pc, catch_type_index} as u16
    pub const EXCEPTION_ENTRY_SIZE: u32 = 8;
}

/// Access flags.
pub mod access {
    pub const PUBLIC: u32 = 0x0001;
    pub const PRIVATE: u32 = 0x0002;
    pub const STATIC: u32 = 0x0008;
    pub const FINAL: u32 = 0x0010;
    pub const SYNCHRONIZED: u32 = 0x0020;
    pub const NATIVE: u32 = 0x0100;
    pub const INTERFACE: u32 = 0x0200;
    pub const ABSTRACT: u32 = 0x0400;
    pub const STRICT: u32 = 0x0800;
}

/// Constant pool.
pub mod constant_pool {
    pub const TAGS_OFFSET: i32 = 0;
    pub const CACHE_OFFSET: i32 = 4;
    pub const POOL_HOLDER_OFFSET: i32 = 8;
    pub const RESOLVED_REFERENCES_OFFSET: i32 = 12;
    pub const LENGTH_OFFSET: i32 = 16;
    pub const BASE_OFFSET: i32 = 20;

    pub const TAG_UTF8: u8 = 1;
    pub const TAG_INTEGER: u8 = 3;
    pub const TAG_FLOAT: u8 = 4;
    pub const TAG_LONG: u8 = 5;
    pub const TAG_DOUBLE: u8 = 6;
    pub const TAG_CLASS: u8 = 7;
    pub const TAG_STRING: u8 = 8;
    pub const TAG_FIELDREF: u8 = 9;
    pub const TAG_METHODREF: u8 = 10;
    pub const TAG_INTERFACE_METHODREF: u8 = 11;
    pub const TAG_INVOKE_DYNAMIC: u8 = 18;
    pub const TAG_UNRESOLVED_CLASS: u8 = 100;
}

/// Constant pool cache; entries are 4 words `{indices, f1, f2, flags}`.
pub mod cp_cache {
    pub const LENGTH_OFFSET: i32 = 0;
    pub const CONSTANT_POOL_OFFSET: i32 = 4;
    pub const BASE_OFFSET: i32 = 8;
    pub const ENTRY_SIZE_IN_WORDS: i32 = 4;
    pub const ENTRY_SIZE: i32 = ENTRY_SIZE_IN_WORDS * super::WORD_SIZE;
    pub const INDICES_OFFSET: i32 = 0;
    pub const F1_OFFSET: i32 = 4;
    pub const F2_OFFSET: i32 = 8;
    pub const FLAGS_OFFSET: i32 = 12;
}

/// Invocation and backedge counters.
pub mod counters {
    pub const INVOCATION_COUNTER_OFFSET: i32 = 0;
    pub const BACKEDGE_COUNTER_OFFSET: i32 = 4;
    pub const INTERPRETER_INVOCATION_COUNT_OFFSET: i32 = 8;
    pub const NUMBER_OF_BREAKPOINTS_OFFSET: i32 = 12;
    pub const SIZE: u32 = 16;

    /// Low bits of a counter hold state; the count starts above them.
    pub const COUNT_SHIFT: u32 = 3;
    pub const COUNT_INCREMENT: i32 = 1 << COUNT_SHIFT;
    pub const COUNT_MASK_IN_PLACE: i32 = !((1 << COUNT_SHIFT) - 1);
}

/// Monitor record on the interpreter stack.
pub mod basic_object_lock {
    /// Displaced header
    pub const LOCK_OFFSET: i32 = 0;
    pub const OBJ_OFFSET: i32 = 4;
    pub const SIZE: i32 = 8;
    pub const SIZE_IN_WORDS: i32 = SIZE / super::WORD_SIZE;
}

/// Call wrapper created by the native caller of `call_stub`.
pub mod java_call_wrapper {
    pub const THREAD_OFFSET: i32 = 0;
    pub const CALLEE_METHOD_OFFSET: i32 = 4;
    pub const RECEIVER_OFFSET: i32 = 8;
    /// Saved last-Java-frame anchor of the caller
    pub const ANCHOR_SP_OFFSET: i32 = 12;
    pub const ANCHOR_FP_OFFSET: i32 = 16;
    pub const ANCHOR_PC_OFFSET: i32 = 20;
    pub const SIZE: u32 = 24;
}

/// Fields of a compiled OSR method read by the backedge overflow path.
pub mod nmethod {
    pub const ENTRY_BCI_OFFSET: i32 = 0;
    pub const OSR_ENTRY_POINT_OFFSET: i32 = 4;
    /// Entry bci of an OSR method that has been invalidated
    pub const INVALID_OSR_ENTRY_BCI: i32 = -2;
}

/// Stack alignment expected by compiled code.
pub const STACK_ALIGNMENT: i32 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_array_layout_helper() {
        let lh = type_array_layout_helper(BasicType::Int);
        assert!(lh < 0);
        let decoded = decode_array_layout_helper(lh).unwrap();
        assert!(!decoded.is_obj_array);
        assert_eq!(decoded.header_size, 12);
        assert_eq!(decoded.element_type, Some(BasicType::Int));
        assert_eq!(decoded.log2_element_size, 2);
    }

    #[test]
    fn test_obj_array_layout_helper() {
        let decoded = decode_array_layout_helper(obj_array_layout_helper()).unwrap();
        assert!(decoded.is_obj_array);
        assert_eq!(decoded.element_type, Some(BasicType::Object));
    }

    #[test]
    fn test_long_arrays_are_8_aligned() {
        assert_eq!(array_base_offset(BasicType::Long) % 8, 0);
        assert_eq!(array_base_offset(BasicType::Byte), 12);
        assert_eq!(decode_array_layout_helper(64), None);
    }
}
