/* Dalvik opcode table */

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;

/// Instruction encoding formats, named after their Dalvik format ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format
{
    Format10t,
    Format10x,
    Format11n,
    Format11x,
    Format12x,
    Format20t,
    Format21c,
    Format21ih,
    Format21lh,
    Format21s,
    Format21t,
    Format22b,
    Format22c,
    Format22s,
    Format22t,
    Format22x,
    Format23x,
    Format30t,
    Format31c,
    Format31i,
    Format31t,
    Format32x,
    Format35c,
    Format3rc,
    Format45cc,
    Format4rcc,
    Format51l,
}

impl Format
{
    /// Length in 16-bit code units.
    pub const fn units(&self) -> usize
    {
        match self
        {
            Format::Format10t | Format::Format10x | Format::Format11n | Format::Format11x | Format::Format12x => 1,
            Format::Format20t
            | Format::Format21c
            | Format::Format21ih
            | Format::Format21lh
            | Format::Format21s
            | Format::Format21t
            | Format::Format22b
            | Format::Format22c
            | Format::Format22s
            | Format::Format22t
            | Format::Format22x
            | Format::Format23x => 2,
            Format::Format30t
            | Format::Format31c
            | Format::Format31i
            | Format::Format31t
            | Format::Format32x
            | Format::Format35c
            | Format::Format3rc => 3,
            Format::Format45cc | Format::Format4rcc => 4,
            Format::Format51l => 5,
        }
    }

    pub const fn has_target(&self) -> bool
    {
        matches!(
            self,
            Format::Format10t | Format::Format20t | Format::Format30t | Format::Format21t | Format::Format22t | Format::Format31t
        )
    }

    pub const fn is_range(&self) -> bool
    {
        matches!(self, Format::Format3rc | Format::Format4rcc)
    }
}

/// What the index operand of an instruction points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind
{
    None,
    String,
    Type,
    Field,
    Method,
    Proto,
    CallSite,
    MethodHandle,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpcodeFlags: u32 {
        const CAN_CONTINUE = 0x1;
        const CAN_THROW = 0x2;
        const SETS_RESULT = 0x4;
        const SETS_REGISTER = 0x8;
        const SETS_WIDE_REGISTER = 0x10;
        const SWITCH = 0x20;
        const CONST = 0x40;
        const STATIC_FIELD_ACCESSOR = 0x80;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Opcode
{
    pub value: u8,
    pub name: &'static str,
    pub format: Format,
    pub reference: ReferenceKind,
    pub flags: OpcodeFlags,
}

impl Opcode
{
    pub fn can_continue(&self) -> bool
    {
        self.flags.contains(OpcodeFlags::CAN_CONTINUE)
    }

    pub fn can_throw(&self) -> bool
    {
        self.flags.contains(OpcodeFlags::CAN_THROW)
    }

    pub fn is_const(&self) -> bool
    {
        self.flags.contains(OpcodeFlags::CONST)
    }

    pub fn sets_wide_register(&self) -> bool
    {
        self.flags.contains(OpcodeFlags::SETS_WIDE_REGISTER)
    }
}

const CONTINUE: OpcodeFlags = OpcodeFlags::CAN_CONTINUE;
const SETS: OpcodeFlags = OpcodeFlags::CAN_CONTINUE.union(OpcodeFlags::SETS_REGISTER);
const SETS_WIDE: OpcodeFlags = SETS.union(OpcodeFlags::SETS_WIDE_REGISTER);
const THROWS: OpcodeFlags = OpcodeFlags::CAN_CONTINUE.union(OpcodeFlags::CAN_THROW);
const THROWS_SETS: OpcodeFlags = THROWS.union(OpcodeFlags::SETS_REGISTER);
const INVOKE: OpcodeFlags = THROWS.union(OpcodeFlags::SETS_RESULT);

const BINOP_KINDS: [&str; 11] = ["add", "sub", "mul", "div", "rem", "and", "or", "xor", "shl", "shr", "ushr"];
const ACCESS_SUFFIXES: [&str; 7] = ["", "-wide", "-object", "-boolean", "-byte", "-char", "-short"];
const INVOKE_KINDS: [&str; 5] = ["virtual", "super", "direct", "static", "interface"];
const UNARY_NAMES: [&str; 21] = [
    "neg-int",
    "not-int",
    "neg-long",
    "not-long",
    "neg-float",
    "neg-double",
    "int-to-long",
    "int-to-float",
    "int-to-double",
    "long-to-int",
    "long-to-float",
    "long-to-double",
    "float-to-int",
    "float-to-long",
    "float-to-double",
    "double-to-int",
    "double-to-long",
    "double-to-float",
    "int-to-byte",
    "int-to-char",
    "int-to-short",
];
const LIT16_NAMES: [&str; 8] = [
    "add-int/lit16",
    "rsub-int",
    "mul-int/lit16",
    "div-int/lit16",
    "rem-int/lit16",
    "and-int/lit16",
    "or-int/lit16",
    "xor-int/lit16",
];

fn leak(name: String) -> &'static str
{
    Box::leak(name.into_boxed_str())
}

fn build_table() -> Vec<Option<Opcode>>
{
    use Format::*;
    use ReferenceKind as R;

    let mut table: Vec<Option<Opcode>> = vec![None; 256];
    let mut put = |value: u8, name: &'static str, format: Format, reference: ReferenceKind, flags: OpcodeFlags| {
        table[value as usize] = Some(Opcode { value, name, format, reference, flags });
    };

    put(0x00, "nop", Format10x, R::None, CONTINUE);
    let moves = [("move", SETS), ("move-wide", SETS_WIDE), ("move-object", SETS)];
    for (i, (base, flags)) in moves.iter().enumerate()
    {
        let op = 0x01 + 3 * i as u8;
        put(op, *base, Format12x, R::None, *flags);
        put(op + 1, leak(format!("{}/from16", base)), Format22x, R::None, *flags);
        put(op + 2, leak(format!("{}/16", base)), Format32x, R::None, *flags);
    }
    put(0x0a, "move-result", Format11x, R::None, SETS);
    put(0x0b, "move-result-wide", Format11x, R::None, SETS_WIDE);
    put(0x0c, "move-result-object", Format11x, R::None, SETS);
    put(0x0d, "move-exception", Format11x, R::None, SETS);
    put(0x0e, "return-void", Format10x, R::None, OpcodeFlags::empty());
    put(0x0f, "return", Format11x, R::None, OpcodeFlags::empty());
    put(0x10, "return-wide", Format11x, R::None, OpcodeFlags::empty());
    put(0x11, "return-object", Format11x, R::None, OpcodeFlags::empty());

    let konst = SETS.union(OpcodeFlags::CONST);
    let konst_wide = SETS_WIDE.union(OpcodeFlags::CONST);
    put(0x12, "const/4", Format11n, R::None, konst);
    put(0x13, "const/16", Format21s, R::None, konst);
    put(0x14, "const", Format31i, R::None, konst);
    put(0x15, "const/high16", Format21ih, R::None, konst);
    put(0x16, "const-wide/16", Format21s, R::None, konst_wide);
    put(0x17, "const-wide/32", Format31i, R::None, konst_wide);
    put(0x18, "const-wide", Format51l, R::None, konst_wide);
    put(0x19, "const-wide/high16", Format21lh, R::None, konst_wide);
    put(0x1a, "const-string", Format21c, R::String, THROWS_SETS);
    put(0x1b, "const-string/jumbo", Format31c, R::String, THROWS_SETS);
    put(0x1c, "const-class", Format21c, R::Type, THROWS_SETS);
    put(0x1d, "monitor-enter", Format11x, R::None, THROWS);
    put(0x1e, "monitor-exit", Format11x, R::None, THROWS);
    put(0x1f, "check-cast", Format21c, R::Type, THROWS);
    put(0x20, "instance-of", Format22c, R::Type, THROWS_SETS);
    put(0x21, "array-length", Format12x, R::None, THROWS_SETS);
    put(0x22, "new-instance", Format21c, R::Type, THROWS_SETS);
    put(0x23, "new-array", Format22c, R::Type, THROWS_SETS);
    put(0x24, "filled-new-array", Format35c, R::Type, INVOKE);
    put(0x25, "filled-new-array/range", Format3rc, R::Type, INVOKE);
    put(0x26, "fill-array-data", Format31t, R::None, CONTINUE);
    put(0x27, "throw", Format11x, R::None, OpcodeFlags::CAN_THROW);
    put(0x28, "goto", Format10t, R::None, OpcodeFlags::empty());
    put(0x29, "goto/16", Format20t, R::None, OpcodeFlags::empty());
    put(0x2a, "goto/32", Format30t, R::None, OpcodeFlags::empty());
    put(0x2b, "packed-switch", Format31t, R::None, CONTINUE.union(OpcodeFlags::SWITCH));
    put(0x2c, "sparse-switch", Format31t, R::None, CONTINUE.union(OpcodeFlags::SWITCH));

    let compares = ["cmpl-float", "cmpg-float", "cmpl-double", "cmpg-double", "cmp-long"];
    for (i, name) in compares.iter().enumerate()
    {
        put(0x2d + i as u8, *name, Format23x, R::None, SETS);
    }
    let tests = ["eq", "ne", "lt", "ge", "gt", "le"];
    for (i, test) in tests.iter().enumerate()
    {
        put(0x32 + i as u8, leak(format!("if-{}", test)), Format22t, R::None, CONTINUE);
        put(0x38 + i as u8, leak(format!("if-{}z", test)), Format21t, R::None, CONTINUE);
    }

    for (i, suffix) in ACCESS_SUFFIXES.iter().enumerate()
    {
        let i = i as u8;
        let get_flags = if *suffix == "-wide" { THROWS_SETS.union(OpcodeFlags::SETS_WIDE_REGISTER) } else { THROWS_SETS };
        let static_get = get_flags.union(OpcodeFlags::STATIC_FIELD_ACCESSOR);
        let static_put = THROWS.union(OpcodeFlags::STATIC_FIELD_ACCESSOR);
        put(0x44 + i, leak(format!("aget{}", suffix)), Format23x, R::None, get_flags);
        put(0x4b + i, leak(format!("aput{}", suffix)), Format23x, R::None, THROWS);
        put(0x52 + i, leak(format!("iget{}", suffix)), Format22c, R::Field, get_flags);
        put(0x59 + i, leak(format!("iput{}", suffix)), Format22c, R::Field, THROWS);
        put(0x60 + i, leak(format!("sget{}", suffix)), Format21c, R::Field, static_get);
        put(0x67 + i, leak(format!("sput{}", suffix)), Format21c, R::Field, static_put);
    }

    for (i, kind) in INVOKE_KINDS.iter().enumerate()
    {
        put(0x6e + i as u8, leak(format!("invoke-{}", kind)), Format35c, R::Method, INVOKE);
        put(0x74 + i as u8, leak(format!("invoke-{}/range", kind)), Format3rc, R::Method, INVOKE);
    }

    for (i, name) in UNARY_NAMES.iter().enumerate()
    {
        let flags = if name.ends_with("long") || name.ends_with("double") { SETS_WIDE } else { SETS };
        put(0x7b + i as u8, *name, Format12x, R::None, flags);
    }

    let mut op = 0x90u8;
    for (suffix, kinds) in [("int", &BINOP_KINDS[..]), ("long", &BINOP_KINDS[..]), ("float", &BINOP_KINDS[..5]), ("double", &BINOP_KINDS[..5])]
    {
        let wide = suffix == "long" || suffix == "double";
        for kind in kinds
        {
            let throws = (*kind == "div" || *kind == "rem") && (suffix == "int" || suffix == "long");
            let mut flags = if wide { SETS_WIDE } else { SETS };
            if throws
            {
                flags |= OpcodeFlags::CAN_THROW;
            }
            put(op, leak(format!("{}-{}", kind, suffix)), Format23x, R::None, flags);
            put(op + 0x20, leak(format!("{}-{}/2addr", kind, suffix)), Format12x, R::None, flags);
            op += 1;
        }
    }

    for (i, name) in LIT16_NAMES.iter().enumerate()
    {
        let flags = if i == 3 || i == 4 { THROWS_SETS } else { SETS };
        put(0xd0 + i as u8, *name, Format22s, R::None, flags);
    }
    let mut op = 0xd8u8;
    for kind in BINOP_KINDS
    {
        let name = if kind == "sub" { "rsub-int/lit8".to_string() } else { format!("{}-int/lit8", kind) };
        let flags = if kind == "div" || kind == "rem" { THROWS_SETS } else { SETS };
        put(op, leak(name), Format22b, R::None, flags);
        op += 1;
    }

    put(0xfa, "invoke-polymorphic", Format45cc, R::Method, INVOKE);
    put(0xfb, "invoke-polymorphic/range", Format4rcc, R::Method, INVOKE);
    put(0xfc, "invoke-custom", Format35c, R::CallSite, INVOKE);
    put(0xfd, "invoke-custom/range", Format3rc, R::CallSite, INVOKE);
    put(0xfe, "const-method-handle", Format21c, R::MethodHandle, THROWS_SETS);
    put(0xff, "const-method-type", Format21c, R::Proto, THROWS_SETS);
    table
}

static OPCODES: Lazy<Vec<Option<Opcode>>> = Lazy::new(build_table);

static BY_NAME: Lazy<HashMap<&'static str, u8>> =
    Lazy::new(|| OPCODES.iter().flatten().map(|o| (o.name, o.value)).collect());

pub fn opcode(value: u8) -> Option<&'static Opcode>
{
    OPCODES[value as usize].as_ref()
}

pub fn opcode_by_name(name: &str) -> Option<&'static Opcode>
{
    BY_NAME.get(name).and_then(|v| opcode(*v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_defined_range() {
        let defined = OPCODES.iter().flatten().count();
        // 0x3e-0x43, 0x73, 0x79-0x7a and 0xe3-0xf9 are unused
        assert_eq!(defined, 256 - 6 - 1 - 2 - 23);
        assert!(opcode(0x73).is_none());
        assert!(opcode(0xe3).is_none());
    }

    #[test]
    fn families_land_on_their_values() {
        assert_eq!(opcode_by_name("iget-wide").unwrap().value, 0x53);
        assert_eq!(opcode_by_name("sput-short").unwrap().value, 0x6d);
        assert_eq!(opcode_by_name("invoke-interface/range").unwrap().value, 0x78);
        assert_eq!(opcode_by_name("int-to-short").unwrap().value, 0x8f);
        assert_eq!(opcode_by_name("rem-double").unwrap().value, 0xaf);
        assert_eq!(opcode_by_name("rem-double/2addr").unwrap().value, 0xcf);
        assert_eq!(opcode_by_name("xor-int/lit16").unwrap().value, 0xd7);
        assert_eq!(opcode_by_name("ushr-int/lit8").unwrap().value, 0xe2);
        assert_eq!(opcode_by_name("if-lez").unwrap().value, 0x3d);
        assert_eq!(opcode_by_name("move-object/16").unwrap().value, 0x09);
    }

    #[test]
    fn flags_follow_semantics() {
        assert!(!opcode(0x0e).unwrap().can_continue());
        assert!(opcode_by_name("div-int/lit8").unwrap().can_throw());
        assert!(opcode_by_name("const-wide/high16").unwrap().sets_wide_register());
        assert_eq!(opcode(0x1a).unwrap().reference, ReferenceKind::String);
        assert_eq!(opcode(0xff).unwrap().format.units(), 2);
    }
}
