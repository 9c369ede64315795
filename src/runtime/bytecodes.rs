//! Bytecode definitions.
//!
//! Standard bytecodes 0x00-0xC9, `breakpoint` and the interpreter's fast
//! (rewritten) bytecodes. A length of 0 marks a variable-length
//! instruction; a wide length of 0 means the bytecode has no `wide` form.

use serde::Serialize;

use crate::error::{VmError, VmResult};

macro_rules! define_bytecodes {
    ($($variant:ident = $code:literal, $name:literal, $len:literal, $wlen:literal, $trap:literal, $java:ident;)*) => {
        /// A bytecode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[repr(u8)]
        pub enum Bytecode {
            $($variant = $code,)*
        }

        impl Bytecode {
            /// Every defined bytecode, in numeric order.
            pub const ALL: &'static [Bytecode] = &[$(Bytecode::$variant,)*];

            pub fn from_u8(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Bytecode::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Bytecode::$variant => $name,)*
                }
            }

            /// Fixed instruction length, 0 when variable.
            pub fn length(self) -> u32 {
                match self {
                    $(Bytecode::$variant => $len,)*
                }
            }

            /// Instruction length behind a `wide` prefix, 0 when not wideable.
            pub fn wide_length(self) -> u32 {
                match self {
                    $(Bytecode::$variant => $wlen,)*
                }
            }

            /// Whether executing the bytecode may raise an exception or call the VM.
            pub fn can_trap(self) -> bool {
                match self {
                    $(Bytecode::$variant => $trap,)*
                }
            }

            /// The standard bytecode a fast bytecode stands for.
            pub fn java_code(self) -> Bytecode {
                match self {
                    $(Bytecode::$variant => Bytecode::$java,)*
                }
            }
        }
    };
}

define_bytecodes! {
    Nop = 0x00, "nop", 1, 0, false, Nop;
    AconstNull = 0x01, "aconst_null", 1, 0, false, AconstNull;
    IconstM1 = 0x02, "iconst_m1", 1, 0, false, IconstM1;
    Iconst0 = 0x03, "iconst_0", 1, 0, false, Iconst0;
    Iconst1 = 0x04, "iconst_1", 1, 0, false, Iconst1;
    Iconst2 = 0x05, "iconst_2", 1, 0, false, Iconst2;
    Iconst3 = 0x06, "iconst_3", 1, 0, false, Iconst3;
    Iconst4 = 0x07, "iconst_4", 1, 0, false, Iconst4;
    Iconst5 = 0x08, "iconst_5", 1, 0, false, Iconst5;
    Lconst0 = 0x09, "lconst_0", 1, 0, false, Lconst0;
    Lconst1 = 0x0a, "lconst_1", 1, 0, false, Lconst1;
    Fconst0 = 0x0b, "fconst_0", 1, 0, false, Fconst0;
    Fconst1 = 0x0c, "fconst_1", 1, 0, false, Fconst1;
    Fconst2 = 0x0d, "fconst_2", 1, 0, false, Fconst2;
    Dconst0 = 0x0e, "dconst_0", 1, 0, false, Dconst0;
    Dconst1 = 0x0f, "dconst_1", 1, 0, false, Dconst1;
    Bipush = 0x10, "bipush", 2, 0, false, Bipush;
    Sipush = 0x11, "sipush", 3, 0, false, Sipush;
    Ldc = 0x12, "ldc", 2, 0, true, Ldc;
    LdcW = 0x13, "ldc_w", 3, 0, true, LdcW;
    Ldc2W = 0x14, "ldc2_w", 3, 0, true, Ldc2W;
    Iload = 0x15, "iload", 2, 4, false, Iload;
    Lload = 0x16, "lload", 2, 4, false, Lload;
    Fload = 0x17, "fload", 2, 4, false, Fload;
    Dload = 0x18, "dload", 2, 4, false, Dload;
    Aload = 0x19, "aload", 2, 4, false, Aload;
    Iload0 = 0x1a, "iload_0", 1, 0, false, Iload0;
    Iload1 = 0x1b, "iload_1", 1, 0, false, Iload1;
    Iload2 = 0x1c, "iload_2", 1, 0, false, Iload2;
    Iload3 = 0x1d, "iload_3", 1, 0, false, Iload3;
    Lload0 = 0x1e, "lload_0", 1, 0, false, Lload0;
    Lload1 = 0x1f, "lload_1", 1, 0, false, Lload1;
    Lload2 = 0x20, "lload_2", 1, 0, false, Lload2;
    Lload3 = 0x21, "lload_3", 1, 0, false, Lload3;
    Fload0 = 0x22, "fload_0", 1, 0, false, Fload0;
    Fload1 = 0x23, "fload_1", 1, 0, false, Fload1;
    Fload2 = 0x24, "fload_2", 1, 0, false, Fload2;
    Fload3 = 0x25, "fload_3", 1, 0, false, Fload3;
    Dload0 = 0x26, "dload_0", 1, 0, false, Dload0;
    Dload1 = 0x27, "dload_1", 1, 0, false, Dload1;
    Dload2 = 0x28, "dload_2", 1, 0, false, Dload2;
    Dload3 = 0x29, "dload_3", 1, 0, false, Dload3;
    Aload0 = 0x2a, "aload_0", 1, 0, false, Aload0;
    Aload1 = 0x2b, "aload_1", 1, 0, false, Aload1;
    Aload2 = 0x2c, "aload_2", 1, 0, false, Aload2;
    Aload3 = 0x2d, "aload_3", 1, 0, false, Aload3;
    Iaload = 0x2e, "iaload", 1, 0, true, Iaload;
    Laload = 0x2f, "laload", 1, 0, true, Laload;
    Faload = 0x30, "faload", 1, 0, true, Faload;
    Daload = 0x31, "daload", 1, 0, true, Daload;
    Aaload = 0x32, "aaload", 1, 0, true, Aaload;
    Baload = 0x33, "baload", 1, 0, true, Baload;
    Caload = 0x34, "caload", 1, 0, true, Caload;
    Saload = 0x35, "saload", 1, 0, true, Saload;
    Istore = 0x36, "istore", 2, 4, false, Istore;
    Lstore = 0x37, "lstore", 2, 4, false, Lstore;
    Fstore = 0x38, "fstore", 2, 4, false, Fstore;
    Dstore = 0x39, "dstore", 2, 4, false, Dstore;
    Astore = 0x3a, "astore", 2, 4, false, Astore;
    Istore0 = 0x3b, "istore_0", 1, 0, false, Istore0;
    Istore1 = 0x3c, "istore_1", 1, 0, false, Istore1;
    Istore2 = 0x3d, "istore_2", 1, 0, false, Istore2;
    Istore3 = 0x3e, "istore_3", 1, 0, false, Istore3;
    Lstore0 = 0x3f, "lstore_0", 1, 0, false, Lstore0;
    Lstore1 = 0x40, "lstore_1", 1, 0, false, Lstore1;
    Lstore2 = 0x41, "lstore_2", 1, 0, false, Lstore2;
    Lstore3 = 0x42, "lstore_3", 1, 0, false, Lstore3;
    Fstore0 = 0x43, "fstore_0", 1, 0, false, Fstore0;
    Fstore1 = 0x44, "fstore_1", 1, 0, false, Fstore1;
    Fstore2 = 0x45, "fstore_2", 1, 0, false, Fstore2;
    Fstore3 = 0x46, "fstore_3", 1, 0, false, Fstore3;
    Dstore0 = 0x47, "dstore_0", 1, 0, false, Dstore0;
    Dstore1 = 0x48, "dstore_1", 1, 0, false, Dstore1;
    Dstore2 = 0x49, "dstore_2", 1, 0, false, Dstore2;
    Dstore3 = 0x4a, "dstore_3", 1, 0, false, Dstore3;
    Astore0 = 0x4b, "astore_0", 1, 0, false, Astore0;
    Astore1 = 0x4c, "astore_1", 1, 0, false, Astore1;
    Astore2 = 0x4d, "astore_2", 1, 0, false, Astore2;
    Astore3 = 0x4e, "astore_3", 1, 0, false, Astore3;
    Iastore = 0x4f, "iastore", 1, 0, true, Iastore;
    Lastore = 0x50, "lastore", 1, 0, true, Lastore;
    Fastore = 0x51, "fastore", 1, 0, true, Fastore;
    Dastore = 0x52, "dastore", 1, 0, true, Dastore;
    Aastore = 0x53, "aastore", 1, 0, true, Aastore;
    Bastore = 0x54, "bastore", 1, 0, true, Bastore;
    Castore = 0x55, "castore", 1, 0, true, Castore;
    Sastore = 0x56, "sastore", 1, 0, true, Sastore;
    Pop = 0x57, "pop", 1, 0, false, Pop;
    Pop2 = 0x58, "pop2", 1, 0, false, Pop2;
    Dup = 0x59, "dup", 1, 0, false, Dup;
    DupX1 = 0x5a, "dup_x1", 1, 0, false, DupX1;
    DupX2 = 0x5b, "dup_x2", 1, 0, false, DupX2;
    Dup2 = 0x5c, "dup2", 1, 0, false, Dup2;
    Dup2X1 = 0x5d, "dup2_x1", 1, 0, false, Dup2X1;
    Dup2X2 = 0x5e, "dup2_x2", 1, 0, false, Dup2X2;
    Swap = 0x5f, "swap", 1, 0, false, Swap;
    Iadd = 0x60, "iadd", 1, 0, false, Iadd;
    Ladd = 0x61, "ladd", 1, 0, false, Ladd;
    Fadd = 0x62, "fadd", 1, 0, false, Fadd;
    Dadd = 0x63, "dadd", 1, 0, false, Dadd;
    Isub = 0x64, "isub", 1, 0, false, Isub;
    Lsub = 0x65, "lsub", 1, 0, false, Lsub;
    Fsub = 0x66, "fsub", 1, 0, false, Fsub;
    Dsub = 0x67, "dsub", 1, 0, false, Dsub;
    Imul = 0x68, "imul", 1, 0, false, Imul;
    Lmul = 0x69, "lmul", 1, 0, false, Lmul;
    Fmul = 0x6a, "fmul", 1, 0, false, Fmul;
    Dmul = 0x6b, "dmul", 1, 0, false, Dmul;
    Idiv = 0x6c, "idiv", 1, 0, true, Idiv;
    Ldiv = 0x6d, "ldiv", 1, 0, true, Ldiv;
    Fdiv = 0x6e, "fdiv", 1, 0, false, Fdiv;
    Ddiv = 0x6f, "ddiv", 1, 0, false, Ddiv;
    Irem = 0x70, "irem", 1, 0, true, Irem;
    Lrem = 0x71, "lrem", 1, 0, true, Lrem;
    Frem = 0x72, "frem", 1, 0, false, Frem;
    Drem = 0x73, "drem", 1, 0, false, Drem;
    Ineg = 0x74, "ineg", 1, 0, false, Ineg;
    Lneg = 0x75, "lneg", 1, 0, false, Lneg;
    Fneg = 0x76, "fneg", 1, 0, false, Fneg;
    Dneg = 0x77, "dneg", 1, 0, false, Dneg;
    Ishl = 0x78, "ishl", 1, 0, false, Ishl;
    Lshl = 0x79, "lshl", 1, 0, false, Lshl;
    Ishr = 0x7a, "ishr", 1, 0, false, Ishr;
    Lshr = 0x7b, "lshr", 1, 0, false, Lshr;
    Iushr = 0x7c, "iushr", 1, 0, false, Iushr;
    Lushr = 0x7d, "lushr", 1, 0, false, Lushr;
    Iand = 0x7e, "iand", 1, 0, false, Iand;
    Land = 0x7f, "land", 1, 0, false, Land;
    Ior = 0x80, "ior", 1, 0, false, Ior;
    Lor = 0x81, "lor", 1, 0, false, Lor;
    Ixor = 0x82, "ixor", 1, 0, false, Ixor;
    Lxor = 0x83, "lxor", 1, 0, false, Lxor;
    Iinc = 0x84, "iinc", 3, 6, false, Iinc;
    I2l = 0x85, "i2l", 1, 0, false, I2l;
    I2f = 0x86, "i2f", 1, 0, false, I2f;
    I2d = 0x87, "i2d", 1, 0, false, I2d;
    L2i = 0x88, "l2i", 1, 0, false, L2i;
    L2f = 0x89, "l2f", 1, 0, false, L2f;
    L2d = 0x8a, "l2d", 1, 0, false, L2d;
    F2i = 0x8b, "f2i", 1, 0, false, F2i;
    F2l = 0x8c, "f2l", 1, 0, false, F2l;
    F2d = 0x8d, "f2d", 1, 0, false, F2d;
    D2i = 0x8e, "d2i", 1, 0, false, D2i;
    D2l = 0x8f, "d2l", 1, 0, false, D2l;
    D2f = 0x90, "d2f", 1, 0, false, D2f;
    I2b = 0x91, "i2b", 1, 0, false, I2b;
    I2c = 0x92, "i2c", 1, 0, false, I2c;
    I2s = 0x93, "i2s", 1, 0, false, I2s;
    Lcmp = 0x94, "lcmp", 1, 0, false, Lcmp;
    Fcmpl = 0x95, "fcmpl", 1, 0, false, Fcmpl;
    Fcmpg = 0x96, "fcmpg", 1, 0, false, Fcmpg;
    Dcmpl = 0x97, "dcmpl", 1, 0, false, Dcmpl;
    Dcmpg = 0x98, "dcmpg", 1, 0, false, Dcmpg;
    Ifeq = 0x99, "ifeq", 3, 0, false, Ifeq;
    Ifne = 0x9a, "ifne", 3, 0, false, Ifne;
    Iflt = 0x9b, "iflt", 3, 0, false, Iflt;
    Ifge = 0x9c, "ifge", 3, 0, false, Ifge;
    Ifgt = 0x9d, "ifgt", 3, 0, false, Ifgt;
    Ifle = 0x9e, "ifle", 3, 0, false, Ifle;
    IfIcmpeq = 0x9f, "if_icmpeq", 3, 0, false, IfIcmpeq;
    IfIcmpne = 0xa0, "if_icmpne", 3, 0, false, IfIcmpne;
    IfIcmplt = 0xa1, "if_icmplt", 3, 0, false, IfIcmplt;
    IfIcmpge = 0xa2, "if_icmpge", 3, 0, false, IfIcmpge;
    IfIcmpgt = 0xa3, "if_icmpgt", 3, 0, false, IfIcmpgt;
    IfIcmple = 0xa4, "if_icmple", 3, 0, false, IfIcmple;
    IfAcmpeq = 0xa5, "if_acmpeq", 3, 0, false, IfAcmpeq;
    IfAcmpne = 0xa6, "if_acmpne", 3, 0, false, IfAcmpne;
    Goto = 0xa7, "goto", 3, 0, false, Goto;
    Jsr = 0xa8, "jsr", 3, 0, false, Jsr;
    Ret = 0xa9, "ret", 2, 4, false, Ret;
    Tableswitch = 0xaa, "tableswitch", 0, 0, false, Tableswitch;
    Lookupswitch = 0xab, "lookupswitch", 0, 0, false, Lookupswitch;
    Ireturn = 0xac, "ireturn", 1, 0, true, Ireturn;
    Lreturn = 0xad, "lreturn", 1, 0, true, Lreturn;
    Freturn = 0xae, "freturn", 1, 0, true, Freturn;
    Dreturn = 0xaf, "dreturn", 1, 0, true, Dreturn;
    Areturn = 0xb0, "areturn", 1, 0, true, Areturn;
    Return = 0xb1, "return", 1, 0, true, Return;
    Getstatic = 0xb2, "getstatic", 3, 0, true, Getstatic;
    Putstatic = 0xb3, "putstatic", 3, 0, true, Putstatic;
    Getfield = 0xb4, "getfield", 3, 0, true, Getfield;
    Putfield = 0xb5, "putfield", 3, 0, true, Putfield;
    Invokevirtual = 0xb6, "invokevirtual", 3, 0, true, Invokevirtual;
    Invokespecial = 0xb7, "invokespecial", 3, 0, true, Invokespecial;
    Invokestatic = 0xb8, "invokestatic", 3, 0, true, Invokestatic;
    Invokeinterface = 0xb9, "invokeinterface", 5, 0, true, Invokeinterface;
    Invokedynamic = 0xba, "invokedynamic", 5, 0, true, Invokedynamic;
    New = 0xbb, "new", 3, 0, true, New;
    Newarray = 0xbc, "newarray", 2, 0, true, Newarray;
    Anewarray = 0xbd, "anewarray", 3, 0, true, Anewarray;
    Arraylength = 0xbe, "arraylength", 1, 0, true, Arraylength;
    Athrow = 0xbf, "athrow", 1, 0, true, Athrow;
    Checkcast = 0xc0, "checkcast", 3, 0, true, Checkcast;
    Instanceof = 0xc1, "instanceof", 3, 0, true, Instanceof;
    Monitorenter = 0xc2, "monitorenter", 1, 0, true, Monitorenter;
    Monitorexit = 0xc3, "monitorexit", 1, 0, true, Monitorexit;
    Wide = 0xc4, "wide", 0, 0, false, Wide;
    Multianewarray = 0xc5, "multianewarray", 4, 0, true, Multianewarray;
    Ifnull = 0xc6, "ifnull", 3, 0, false, Ifnull;
    Ifnonnull = 0xc7, "ifnonnull", 3, 0, false, Ifnonnull;
    GotoW = 0xc8, "goto_w", 5, 0, false, GotoW;
    JsrW = 0xc9, "jsr_w", 5, 0, false, JsrW;
    Breakpoint = 0xca, "breakpoint", 1, 0, true, Breakpoint;
    FastAgetfield = 0xcb, "fast_agetfield", 3, 0, true, Getfield;
    FastBgetfield = 0xcc, "fast_bgetfield", 3, 0, true, Getfield;
    FastCgetfield = 0xcd, "fast_cgetfield", 3, 0, true, Getfield;
    FastDgetfield = 0xce, "fast_dgetfield", 3, 0, true, Getfield;
    FastFgetfield = 0xcf, "fast_fgetfield", 3, 0, true, Getfield;
    FastIgetfield = 0xd0, "fast_igetfield", 3, 0, true, Getfield;
    FastLgetfield = 0xd1, "fast_lgetfield", 3, 0, true, Getfield;
    FastSgetfield = 0xd2, "fast_sgetfield", 3, 0, true, Getfield;
    FastAputfield = 0xd3, "fast_aputfield", 3, 0, true, Putfield;
    FastBputfield = 0xd4, "fast_bputfield", 3, 0, true, Putfield;
    FastZputfield = 0xd5, "fast_zputfield", 3, 0, true, Putfield;
    FastCputfield = 0xd6, "fast_cputfield", 3, 0, true, Putfield;
    FastDputfield = 0xd7, "fast_dputfield", 3, 0, true, Putfield;
    FastFputfield = 0xd8, "fast_fputfield", 3, 0, true, Putfield;
    FastIputfield = 0xd9, "fast_iputfield", 3, 0, true, Putfield;
    FastLputfield = 0xda, "fast_lputfield", 3, 0, true, Putfield;
    FastSputfield = 0xdb, "fast_sputfield", 3, 0, true, Putfield;
    FastAload0 = 0xdc, "fast_aload_0", 1, 0, true, Aload0;
    FastIaccess0 = 0xdd, "fast_iaccess_0", 4, 0, true, Aload0;
    FastAaccess0 = 0xde, "fast_aaccess_0", 4, 0, true, Aload0;
    FastFaccess0 = 0xdf, "fast_faccess_0", 4, 0, true, Aload0;
    FastIload = 0xe0, "fast_iload", 2, 0, false, Iload;
    FastIload2 = 0xe1, "fast_iload2", 4, 0, false, Iload;
    FastIcaload = 0xe2, "fast_icaload", 3, 0, false, Iload;
    FastInvokevfinal = 0xe3, "fast_invokevfinal", 3, 0, true, Invokevirtual;
    FastLinearswitch = 0xe4, "fast_linearswitch", 0, 0, false, Lookupswitch;
    FastBinaryswitch = 0xe5, "fast_binaryswitch", 0, 0, false, Lookupswitch;
    FastAldc = 0xe6, "fast_aldc", 2, 0, true, Ldc;
    FastAldcW = 0xe7, "fast_aldc_w", 3, 0, true, LdcW;
    ReturnRegisterFinalizer = 0xe8, "return_register_finalizer", 1, 0, true, Return;
    Invokehandle = 0xe9, "invokehandle", 3, 0, true, Invokevirtual;
    Shouldnotreachhere = 0xea, "shouldnotreachhere", 1, 0, false, Shouldnotreachhere;
}

/// Number of opcode slots reserved in dispatch tables.
pub const DISPATCH_LENGTH: usize = 256;

impl Bytecode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this is one of the interpreter's rewritten bytecodes.
    pub fn is_fast(self) -> bool {
        self.code() > Bytecode::Breakpoint.code()
    }

    /// Whether some fast bytecode may replace this one.
    pub fn can_rewrite(self) -> bool {
        Bytecode::ALL
            .iter()
            .any(|&b| b != self && b.java_code() == self)
    }

    pub fn is_invoke(self) -> bool {
        matches!(
            self.java_code(),
            Bytecode::Invokevirtual
                | Bytecode::Invokespecial
                | Bytecode::Invokestatic
                | Bytecode::Invokeinterface
                | Bytecode::Invokedynamic
        )
    }

    pub fn is_return(self) -> bool {
        matches!(
            self.java_code(),
            Bytecode::Ireturn
                | Bytecode::Lreturn
                | Bytecode::Freturn
                | Bytecode::Dreturn
                | Bytecode::Areturn
                | Bytecode::Return
        )
    }

    /// Conditional and unconditional branches with a 16-bit offset.
    pub fn is_branch(self) -> bool {
        (Bytecode::Ifeq.code()..=Bytecode::Jsr.code()).contains(&self.code())
            || matches!(self, Bytecode::Ifnull | Bytecode::Ifnonnull)
    }

    pub fn is_conditional_branch(self) -> bool {
        self.is_branch() && !matches!(self, Bytecode::Goto | Bytecode::Jsr)
    }
}

impl std::fmt::Display for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn read_u8(code: &[u8], at: usize) -> VmResult<u8> {
    code.get(at).copied().ok_or(VmError::InvalidBytecode {
        opcode: 0,
        bci: at as u32,
    })
}

/// Read a big-endian u16 operand.
pub fn read_u16_be(code: &[u8], at: usize) -> VmResult<u16> {
    Ok(u16::from_be_bytes([read_u8(code, at)?, read_u8(code, at + 1)?]))
}

/// Read a big-endian i32 operand.
pub fn read_i32_be(code: &[u8], at: usize) -> VmResult<i32> {
    Ok(i32::from_be_bytes([
        read_u8(code, at)?,
        read_u8(code, at + 1)?,
        read_u8(code, at + 2)?,
        read_u8(code, at + 3)?,
    ]))
}

/// Offset of the first switch operand (aligned to 4 past the opcode).
pub fn switch_operands(bci: usize) -> usize {
    (bci + 1 + 3) & !3
}

/// Decode the opcode at `bci`.
pub fn code_at(code: &[u8], bci: usize) -> VmResult<Bytecode> {
    let op = read_u8(code, bci)?;
    Bytecode::from_u8(op).ok_or(VmError::InvalidBytecode {
        opcode: op,
        bci: bci as u32,
    })
}

/// Length of the instruction at `bci`, including switch padding and `wide`.
pub fn length_at(code: &[u8], bci: usize) -> VmResult<usize> {
    let bc = code_at(code, bci)?;
    let fixed = bc.length() as usize;
    if fixed > 0 {
        return Ok(fixed);
    }
    match bc {
        Bytecode::Wide => {
            let target = code_at(code, bci + 1)?;
            match target.wide_length() {
                0 => Err(VmError::InvalidBytecode {
                    opcode: target.code(),
                    bci: bci as u32 + 1,
                }),
                len => Ok(len as usize),
            }
        }
        Bytecode::Tableswitch => {
            let base = switch_operands(bci);
            let low = read_i32_be(code, base + 4)?;
            let high = read_i32_be(code, base + 8)?;
            let entries = (high as i64 - low as i64 + 1).max(0) as usize;
            Ok(base - bci + (3 + entries) * 4)
        }
        Bytecode::Lookupswitch | Bytecode::FastLinearswitch | Bytecode::FastBinaryswitch => {
            let base = switch_operands(bci);
            let npairs = read_i32_be(code, base + 4)?.max(0) as usize;
            Ok(base - bci + (2 + npairs * 2) * 4)
        }
        _ => Err(VmError::InvalidBytecode {
            opcode: bc.code(),
            bci: bci as u32,
        }),
    }
}

/// Iterates over the instructions of a bytecode array.
pub struct BytecodeStream<'a> {
    code: &'a [u8],
    bci: usize,
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub bci: usize,
    pub bytecode: Bytecode,
    pub length: usize,
    /// Target of a `wide` prefix
    pub wide: Option<Bytecode>,
}

impl<'a> BytecodeStream<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, bci: 0 }
    }
}

impl Iterator for BytecodeStream<'_> {
    type Item = VmResult<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bci >= self.code.len() {
            return None;
        }
        let bci = self.bci;
        let decoded = code_at(self.code, bci).and_then(|bytecode| {
            let length = length_at(self.code, bci)?;
            let wide = if bytecode == Bytecode::Wide {
                Some(code_at(self.code, bci + 1)?)
            } else {
                None
            };
            Ok(Instruction {
                bci,
                bytecode,
                length,
                wide,
            })
        });
        match &decoded {
            Ok(insn) => self.bci += insn.length,
            Err(_) => self.bci = self.code.len(),
        }
        Some(decoded)
    }
}

/// Bytecode metadata for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct BytecodeInfo {
    pub code: u8,
    pub name: &'static str,
    pub length: u32,
    pub wide_length: u32,
    pub can_trap: bool,
    pub can_rewrite: bool,
    pub java_code: &'static str,
}

impl From<Bytecode> for BytecodeInfo {
    fn from(bc: Bytecode) -> Self {
        Self {
            code: bc.code(),
            name: bc.name(),
            length: bc.length(),
            wide_length: bc.wide_length(),
            can_trap: bc.can_trap(),
            can_rewrite: bc.can_rewrite(),
            java_code: bc.java_code().name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_dense_and_ordered() {
        for (i, bc) in Bytecode::ALL.iter().enumerate() {
            assert_eq!(bc.code() as usize, i);
            assert_eq!(Bytecode::from_u8(i as u8), Some(*bc));
        }
        assert_eq!(Bytecode::from_u8(0xeb), None);
    }

    #[test]
    fn test_fast_codes_map_back() {
        assert_eq!(Bytecode::FastIgetfield.java_code(), Bytecode::Getfield);
        assert_eq!(Bytecode::FastBinaryswitch.java_code(), Bytecode::Lookupswitch);
        assert!(Bytecode::Iload.can_rewrite());
        assert!(Bytecode::Aload0.can_rewrite());
        assert!(!Bytecode::Istore.can_rewrite());
        assert!(Bytecode::FastAldc.is_fast());
    }

    #[test]
    fn test_tableswitch_length() {
        // nop; tableswitch at bci 1, padded to 4, low=10, high=12
        let mut code = vec![0x00, 0xaa, 0, 0];
        for v in [0x40i32, 10, 12, 0x10, 0x20, 0x30] {
            code.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(length_at(&code, 1).unwrap(), 3 + 6 * 4);
    }

    #[test]
    fn test_lookupswitch_length() {
        let mut code = vec![0xab, 0, 0, 0];
        for v in [8i32, 2, 1, 10, 5, 20] {
            code.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(length_at(&code, 0).unwrap(), 4 + 6 * 4);
    }

    #[test]
    fn test_wide_length() {
        assert_eq!(length_at(&[0xc4, 0x84, 0, 1, 0, 2], 0).unwrap(), 6);
        assert_eq!(length_at(&[0xc4, 0x15, 0, 1], 0).unwrap(), 4);
        assert!(length_at(&[0xc4, 0x60], 0).is_err());
    }

    #[test]
    fn test_stream() {
        // iconst_1; istore_0; iinc 0 1; goto -4; return
        let code = [0x04, 0x3b, 0x84, 0x00, 0x01, 0xa7, 0xff, 0xfc, 0xb1];
        let bcis: Vec<usize> = BytecodeStream::new(&code)
            .map(|i| i.unwrap().bci)
            .collect();
        assert_eq!(bcis, vec![0, 1, 2, 5, 8]);
    }
}
