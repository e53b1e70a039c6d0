/* Instructions: decoding from and encoding to 16-bit code units */

use crate::block::error::{BlockError, BlockResult};
use crate::block::reference::{IndexReference, IntegerReference, RefWidth};
use crate::dex::ids::{FieldId, IdPools, MethodId, ProtoId, StringData, TypeId};
use crate::dex::opcode::{opcode, Format, Opcode, ReferenceKind};

pub const PACKED_SWITCH_IDENT: u16 = 0x0100;
pub const SPARSE_SWITCH_IDENT: u16 = 0x0200;
pub const ARRAY_DATA_IDENT: u16 = 0x0300;

/// Stable identity of an instruction within its code item; survives insertion and removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsId(pub u32);

/// A branch, switch or handler destination.
///
/// `Relative` holds an offset that did not land on an instruction start, or
/// that belongs to a payload no switch refers to; it is written back as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target
{
    Ins(InsId),
    Relative(i32),
}

#[derive(Debug, Clone)]
pub enum IndexOperand
{
    String(IndexReference<StringData>),
    Type(IndexReference<TypeId>),
    Field(IndexReference<FieldId>),
    Method(IndexReference<MethodId>),
    Proto(IndexReference<ProtoId>),
    CallSite(u32),
    MethodHandle(u32),
}

impl IndexOperand
{
    fn from_raw(kind: ReferenceKind, raw: u32) -> Option<IndexOperand>
    {
        Some(match kind
        {
            ReferenceKind::None => return None,
            ReferenceKind::String => IndexOperand::String(IndexReference::from_raw(RefWidth::Int, raw)),
            ReferenceKind::Type => IndexOperand::Type(IndexReference::from_raw(RefWidth::Int, raw)),
            ReferenceKind::Field => IndexOperand::Field(IndexReference::from_raw(RefWidth::Int, raw)),
            ReferenceKind::Method => IndexOperand::Method(IndexReference::from_raw(RefWidth::Int, raw)),
            ReferenceKind::Proto => IndexOperand::Proto(IndexReference::from_raw(RefWidth::Int, raw)),
            ReferenceKind::CallSite => IndexOperand::CallSite(raw),
            ReferenceKind::MethodHandle => IndexOperand::MethodHandle(raw),
        })
    }

    pub fn kind(&self) -> ReferenceKind
    {
        match self
        {
            IndexOperand::String(_) => ReferenceKind::String,
            IndexOperand::Type(_) => ReferenceKind::Type,
            IndexOperand::Field(_) => ReferenceKind::Field,
            IndexOperand::Method(_) => ReferenceKind::Method,
            IndexOperand::Proto(_) => ReferenceKind::Proto,
            IndexOperand::CallSite(_) => ReferenceKind::CallSite,
            IndexOperand::MethodHandle(_) => ReferenceKind::MethodHandle,
        }
    }

    pub fn raw(&self) -> u32
    {
        match self
        {
            IndexOperand::String(r) => r.stored(),
            IndexOperand::Type(r) => r.stored(),
            IndexOperand::Field(r) => r.stored(),
            IndexOperand::Method(r) => r.stored(),
            IndexOperand::Proto(r) => r.stored(),
            IndexOperand::CallSite(i) | IndexOperand::MethodHandle(i) => *i,
        }
    }

    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        match self
        {
            IndexOperand::String(r) => r.get(&ids.strings).map(drop),
            IndexOperand::Type(r) => r.get(&ids.types).map(drop),
            IndexOperand::Field(r) => r.get(&ids.fields).map(drop),
            IndexOperand::Method(r) => r.get(&ids.methods).map(drop),
            IndexOperand::Proto(r) => r.get(&ids.protos).map(drop),
            IndexOperand::CallSite(_) | IndexOperand::MethodHandle(_) => Ok(()),
        }
    }

    pub(crate) fn refresh(&self, ids: &IdPools) -> BlockResult<()>
    {
        match self
        {
            IndexOperand::String(r) => r.refresh(&ids.strings).map(drop),
            IndexOperand::Type(r) => r.refresh(&ids.types).map(drop),
            IndexOperand::Field(r) => r.refresh(&ids.fields).map(drop),
            IndexOperand::Method(r) => r.refresh(&ids.methods).map(drop),
            IndexOperand::Proto(r) => r.refresh(&ids.protos).map(drop),
            IndexOperand::CallSite(_) | IndexOperand::MethodHandle(_) => Ok(()),
        }
    }
}

/// A non-payload instruction.
#[derive(Debug, Clone)]
pub struct Operation
{
    pub opcode: u8,
    /// Registers in operand order; a range form holds every register of the range.
    pub regs: Vec<u16>,
    /// Literal as the instruction means it, e.g. `const/high16` holds the shifted value.
    pub literal: i64,
    pub index: Option<IndexOperand>,
    /// Prototype operand of `invoke-polymorphic`.
    pub proto: Option<IndexReference<ProtoId>>,
    pub target: Option<Target>,
}

impl Operation
{
    pub fn new(opcode: u8) -> Operation
    {
        Operation { opcode, regs: Vec::new(), literal: 0, index: None, proto: None, target: None }
    }

    pub fn info(&self) -> BlockResult<&'static Opcode>
    {
        match opcode(self.opcode)
        {
            Some(o) => Ok(o),
            None => Err(BlockError::usage(format!("unused opcode 0x{:02x}", self.opcode))),
        }
    }

    fn reg(&self, i: usize) -> BlockResult<u16>
    {
        match self.regs.get(i)
        {
            Some(r) => Ok(*r),
            None => Err(BlockError::usage(format!("opcode 0x{:02x} needs register operand {}", self.opcode, i))),
        }
    }

    fn index_raw(&self) -> u32
    {
        self.index.as_ref().map_or(0, |i| i.raw())
    }

    /// Picks the narrowest `const` form of the same family that still holds the literal.
    pub(crate) fn fit_literal(&mut self) -> BlockResult<()>
    {
        let fits = |format: Format, v: i64| -> bool {
            match format
            {
                Format::Format11n => (-8..=7).contains(&v),
                Format::Format21s => (i16::MIN as i64..=i16::MAX as i64).contains(&v),
                Format::Format31i => (i32::MIN as i64..=i32::MAX as i64).contains(&v),
                Format::Format21ih => v & 0xffff == 0 && (i32::MIN as i64..=i32::MAX as i64).contains(&v),
                Format::Format21lh => v & 0xffff_ffff_ffff == 0,
                Format::Format22b => (i8::MIN as i64..=i8::MAX as i64).contains(&v),
                Format::Format22s => (i16::MIN as i64..=i16::MAX as i64).contains(&v),
                _ => true,
            }
        };
        let info = self.info()?;
        if fits(info.format, self.literal)
        {
            return Ok(());
        }
        let ladder: &[u8] = match self.opcode
        {
            0x12 | 0x13 | 0x14 | 0x15 => &[0x12, 0x13, 0x15, 0x14],
            0x16 | 0x17 | 0x18 | 0x19 => &[0x16, 0x17, 0x19, 0x18],
            _ => {
                return Err(BlockError::usage(format!("literal {} does not fit {}", self.literal, info.name)));
            }
        };
        for candidate in ladder
        {
            if let Some(o) = opcode(*candidate)
            {
                if fits(o.format, self.literal)
                {
                    self.opcode = *candidate;
                    return Ok(());
                }
            }
        }
        Err(BlockError::usage(format!("literal {} does not fit {}", self.literal, info.name)))
    }
}

impl IntegerReference for Operation
{
    fn get(&self) -> i32
    {
        self.literal as i32
    }

    fn set(&mut self, value: i32)
    {
        self.literal = value as i64;
    }
}

#[derive(Debug, Clone)]
pub enum InsBody
{
    Op(Operation),
    /// Targets are relative to the switch instruction that points here.
    PackedSwitch { first_key: i32, targets: Vec<Target> },
    SparseSwitch { keys: Vec<i32>, targets: Vec<Target> },
    ArrayData { element_width: u16, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Ins
{
    pub id: InsId,
    pub body: InsBody,
}

impl Ins
{
    pub fn is_payload(&self) -> bool
    {
        !matches!(self.body, InsBody::Op(_))
    }

    pub fn operation(&self) -> Option<&Operation>
    {
        match &self.body
        {
            InsBody::Op(op) => Some(op),
            _ => None,
        }
    }

    pub fn operation_mut(&mut self) -> Option<&mut Operation>
    {
        match &mut self.body
        {
            InsBody::Op(op) => Some(op),
            _ => None,
        }
    }

    /// Length in code units, alignment padding excluded.
    pub fn units(&self) -> usize
    {
        match &self.body
        {
            InsBody::Op(op) => opcode(op.opcode).map_or(1, |o| o.format.units()),
            InsBody::PackedSwitch { targets, .. } => 4 + 2 * targets.len(),
            InsBody::SparseSwitch { keys, .. } => 2 + 4 * keys.len(),
            InsBody::ArrayData { data, .. } => 4 + (data.len() + 1) / 2,
        }
    }

    pub fn targets(&self) -> Vec<Target>
    {
        match &self.body
        {
            InsBody::Op(op) => op.target.into_iter().collect(),
            InsBody::PackedSwitch { targets, .. } | InsBody::SparseSwitch { targets, .. } => targets.clone(),
            InsBody::ArrayData { .. } => Vec::new(),
        }
    }
}

#[inline]
fn a8(unit: u16) -> u16
{
    unit >> 8
}

#[inline]
fn a4(unit: u16) -> u16
{
    (unit >> 8) & 0x0f
}

#[inline]
fn b4(unit: u16) -> u16
{
    unit >> 12
}

#[inline]
fn u32_at(code: &[u16], pc: usize) -> u32
{
    code[pc] as u32 | (code[pc + 1] as u32) << 16
}

fn require(code: &[u16], pc: usize, need: usize, what: &str) -> BlockResult<()>
{
    if pc + need > code.len()
    {
        fail!("Truncated {} at 0x{:x}: need {} code units, have {}", what, pc, need, code.len().saturating_sub(pc));
    }
    Ok(())
}

/// Decodes the instruction at `pc`. Branch and switch targets come back as
/// `Target::Relative`; the caller resolves them to instruction ids.
pub fn decode(code: &[u16], pc: usize, id: InsId) -> BlockResult<Ins>
{
    let unit = code[pc];
    if unit & 0xff == 0
    {
        match unit
        {
            PACKED_SWITCH_IDENT => return decode_packed_switch(code, pc, id),
            SPARSE_SWITCH_IDENT => return decode_sparse_switch(code, pc, id),
            ARRAY_DATA_IDENT => return decode_array_data(code, pc, id),
            _ => {}
        }
    }
    let info = match opcode((unit & 0xff) as u8)
    {
        Some(o) => o,
        None => fail!("Unused opcode 0x{:02x} at 0x{:x}", unit & 0xff, pc),
    };
    require(code, pc, info.format.units(), info.name)?;
    let mut op = Operation::new(info.value);
    let c = |i: usize| code[pc + i];
    match info.format
    {
        Format::Format10x => {}
        Format::Format12x => op.regs = vec![a4(unit), b4(unit)],
        Format::Format11n => {
            op.regs = vec![a4(unit)];
            op.literal = (((b4(unit) as u8) << 4) as i8 >> 4) as i64;
        }
        Format::Format11x => op.regs = vec![a8(unit)],
        Format::Format10t => op.target = Some(Target::Relative(a8(unit) as u8 as i8 as i32)),
        Format::Format20t => op.target = Some(Target::Relative(c(1) as i16 as i32)),
        Format::Format22x => op.regs = vec![a8(unit), c(1)],
        Format::Format21t => {
            op.regs = vec![a8(unit)];
            op.target = Some(Target::Relative(c(1) as i16 as i32));
        }
        Format::Format21s => {
            op.regs = vec![a8(unit)];
            op.literal = c(1) as i16 as i64;
        }
        Format::Format21ih => {
            op.regs = vec![a8(unit)];
            op.literal = (c(1) as i16 as i64) << 16;
        }
        Format::Format21lh => {
            op.regs = vec![a8(unit)];
            op.literal = (c(1) as i16 as i64) << 48;
        }
        Format::Format21c => {
            op.regs = vec![a8(unit)];
            op.index = IndexOperand::from_raw(info.reference, c(1) as u32);
        }
        Format::Format23x => op.regs = vec![a8(unit), c(1) & 0xff, c(1) >> 8],
        Format::Format22b => {
            op.regs = vec![a8(unit), c(1) & 0xff];
            op.literal = (c(1) >> 8) as u8 as i8 as i64;
        }
        Format::Format22t => {
            op.regs = vec![a4(unit), b4(unit)];
            op.target = Some(Target::Relative(c(1) as i16 as i32));
        }
        Format::Format22s => {
            op.regs = vec![a4(unit), b4(unit)];
            op.literal = c(1) as i16 as i64;
        }
        Format::Format22c => {
            op.regs = vec![a4(unit), b4(unit)];
            op.index = IndexOperand::from_raw(info.reference, c(1) as u32);
        }
        Format::Format30t => op.target = Some(Target::Relative(u32_at(code, pc + 1) as i32)),
        Format::Format32x => op.regs = vec![c(1), c(2)],
        Format::Format31i => {
            op.regs = vec![a8(unit)];
            op.literal = u32_at(code, pc + 1) as i32 as i64;
        }
        Format::Format31t => {
            op.regs = vec![a8(unit)];
            op.target = Some(Target::Relative(u32_at(code, pc + 1) as i32));
        }
        Format::Format31c => {
            op.regs = vec![a8(unit)];
            op.index = IndexOperand::from_raw(info.reference, u32_at(code, pc + 1));
        }
        Format::Format35c | Format::Format45cc => {
            let count = b4(unit) as usize;
            if count > 5
            {
                fail!("{} at 0x{:x} names {} registers", info.name, pc, count);
            }
            let nibbles = c(2);
            let all = [nibbles & 0xf, (nibbles >> 4) & 0xf, (nibbles >> 8) & 0xf, nibbles >> 12, a4(unit)];
            op.regs = all[..count].to_vec();
            op.index = IndexOperand::from_raw(info.reference, c(1) as u32);
            if info.format == Format::Format45cc
            {
                op.proto = Some(IndexReference::from_raw(RefWidth::Int, c(3) as u32));
            }
        }
        Format::Format3rc | Format::Format4rcc => {
            let count = a8(unit);
            let first = c(2);
            op.regs = (0..count).map(|i| first.wrapping_add(i)).collect();
            op.index = IndexOperand::from_raw(info.reference, c(1) as u32);
            if info.format == Format::Format4rcc
            {
                op.proto = Some(IndexReference::from_raw(RefWidth::Int, c(3) as u32));
            }
        }
        Format::Format51l => {
            op.regs = vec![a8(unit)];
            op.literal = (0..4).fold(0u64, |acc, i| acc | (c(1 + i) as u64) << (16 * i)) as i64;
        }
    }
    Ok(Ins { id, body: InsBody::Op(op) })
}

fn decode_packed_switch(code: &[u16], pc: usize, id: InsId) -> BlockResult<Ins>
{
    require(code, pc, 4, "packed-switch payload")?;
    let size = code[pc + 1] as usize;
    require(code, pc, 4 + 2 * size, "packed-switch payload")?;
    let first_key = u32_at(code, pc + 2) as i32;
    let targets = (0..size).map(|i| Target::Relative(u32_at(code, pc + 4 + 2 * i) as i32)).collect();
    Ok(Ins { id, body: InsBody::PackedSwitch { first_key, targets } })
}

fn decode_sparse_switch(code: &[u16], pc: usize, id: InsId) -> BlockResult<Ins>
{
    require(code, pc, 2, "sparse-switch payload")?;
    let size = code[pc + 1] as usize;
    require(code, pc, 2 + 4 * size, "sparse-switch payload")?;
    let keys = (0..size).map(|i| u32_at(code, pc + 2 + 2 * i) as i32).collect();
    let targets = (0..size).map(|i| Target::Relative(u32_at(code, pc + 2 + 2 * size + 2 * i) as i32)).collect();
    Ok(Ins { id, body: InsBody::SparseSwitch { keys, targets } })
}

fn decode_array_data(code: &[u16], pc: usize, id: InsId) -> BlockResult<Ins>
{
    require(code, pc, 4, "array-data payload")?;
    let element_width = code[pc + 1];
    let count = u32_at(code, pc + 2) as usize;
    let byte_len = match (element_width as usize).checked_mul(count)
    {
        Some(n) => n,
        None => fail!("array-data payload at 0x{:x} overflows", pc),
    };
    require(code, pc, 4 + (byte_len + 1) / 2, "array-data payload")?;
    let mut data = Vec::with_capacity(byte_len + 1);
    for unit in &code[pc + 4..pc + 4 + (byte_len + 1) / 2]
    {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data.truncate(byte_len);
    Ok(Ins { id, body: InsBody::ArrayData { element_width, data } })
}

/// Address lookups an encoder needs: where an instruction starts, and for a
/// payload, where the switch that refers to it starts.
pub trait AddressMap
{
    fn address_of(&self, id: InsId) -> Option<u32>;
    fn switch_of(&self, payload: InsId) -> Option<u32>;
}

fn relative(target: Target, base: u32, addresses: &dyn AddressMap) -> BlockResult<i32>
{
    match target
    {
        Target::Relative(offset) => Ok(offset),
        Target::Ins(id) => match addresses.address_of(id)
        {
            Some(address) => Ok(address as i64 as i32 - base as i32),
            None => Err(BlockError::resolution(format!("branch to removed instruction {:?}", id))),
        },
    }
}

fn check_reg(value: u16, bits: u32, name: &str) -> BlockResult<u16>
{
    if (value as u32) >> bits != 0
    {
        return Err(BlockError::usage(format!("register v{} does not fit the {}-bit operand of {}", value, bits, name)));
    }
    Ok(value)
}

fn push_u32(out: &mut Vec<u16>, value: u32)
{
    out.push(value as u16);
    out.push((value >> 16) as u16);
}

/// Appends the code units of `ins`, which starts at `address`.
pub fn encode(ins: &Ins, address: u32, addresses: &dyn AddressMap, out: &mut Vec<u16>) -> BlockResult<()>
{
    let op = match &ins.body
    {
        InsBody::Op(op) => op,
        InsBody::PackedSwitch { first_key, targets } => {
            let base = addresses.switch_of(ins.id);
            out.push(PACKED_SWITCH_IDENT);
            out.push(targets.len() as u16);
            push_u32(out, *first_key as u32);
            for t in targets
            {
                push_u32(out, payload_target(*t, base, addresses)? as u32);
            }
            return Ok(());
        }
        InsBody::SparseSwitch { keys, targets } => {
            let base = addresses.switch_of(ins.id);
            out.push(SPARSE_SWITCH_IDENT);
            out.push(keys.len() as u16);
            for k in keys
            {
                push_u32(out, *k as u32);
            }
            for t in targets
            {
                push_u32(out, payload_target(*t, base, addresses)? as u32);
            }
            return Ok(());
        }
        InsBody::ArrayData { element_width, data } => {
            out.push(ARRAY_DATA_IDENT);
            out.push(*element_width);
            let count = if *element_width == 0 { 0 } else { data.len() / *element_width as usize };
            push_u32(out, count as u32);
            for pair in data.chunks(2)
            {
                out.push(pair[0] as u16 | (*pair.get(1).unwrap_or(&0) as u16) << 8);
            }
            return Ok(());
        }
    };
    let info = op.info()?;
    let name = info.name;
    let code = info.value as u16;
    let target = || -> BlockResult<i32> {
        match op.target
        {
            Some(t) => relative(t, address, addresses),
            None => Err(BlockError::usage(format!("{} has no target", name))),
        }
    };
    let index16 = || -> BlockResult<u16> {
        let raw = op.index_raw();
        if raw > 0xffff
        {
            return Err(BlockError::usage(format!("index {} does not fit the 16-bit operand of {}", raw, name)));
        }
        Ok(raw as u16)
    };
    match info.format
    {
        Format::Format10x => out.push(code),
        Format::Format12x => out.push(code | check_reg(op.reg(0)?, 4, name)? << 8 | check_reg(op.reg(1)?, 4, name)? << 12),
        Format::Format11n => out.push(code | check_reg(op.reg(0)?, 4, name)? << 8 | ((op.literal as u16) & 0xf) << 12),
        Format::Format11x => out.push(code | check_reg(op.reg(0)?, 8, name)? << 8),
        Format::Format10t => {
            let offset = target()?;
            if !(i8::MIN as i32..=i8::MAX as i32).contains(&offset)
            {
                return Err(BlockError::usage(format!("branch offset {} does not fit {}", offset, name)));
            }
            out.push(code | (offset as u8 as u16) << 8);
        }
        Format::Format20t => {
            out.push(code);
            out.push(branch16(target()?, name)?);
        }
        Format::Format22x => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(op.reg(1)?);
        }
        Format::Format21t => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(branch16(target()?, name)?);
        }
        Format::Format21s => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(op.literal as i16 as u16);
        }
        Format::Format21ih => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push((op.literal >> 16) as u16);
        }
        Format::Format21lh => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push((op.literal >> 48) as u16);
        }
        Format::Format21c => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(index16()?);
        }
        Format::Format23x => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(check_reg(op.reg(1)?, 8, name)? | check_reg(op.reg(2)?, 8, name)? << 8);
        }
        Format::Format22b => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            out.push(check_reg(op.reg(1)?, 8, name)? | (op.literal as u8 as u16) << 8);
        }
        Format::Format22t | Format::Format22s | Format::Format22c => {
            out.push(code | check_reg(op.reg(0)?, 4, name)? << 8 | check_reg(op.reg(1)?, 4, name)? << 12);
            out.push(match info.format
            {
                Format::Format22t => branch16(target()?, name)?,
                Format::Format22s => op.literal as i16 as u16,
                _ => index16()?,
            });
        }
        Format::Format30t => {
            out.push(code);
            push_u32(out, target()? as u32);
        }
        Format::Format32x => {
            out.push(code);
            out.push(op.reg(0)?);
            out.push(op.reg(1)?);
        }
        Format::Format31i | Format::Format31t | Format::Format31c => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            let value = match info.format
            {
                Format::Format31i => op.literal as i32 as u32,
                Format::Format31t => target()? as u32,
                _ => op.index_raw(),
            };
            push_u32(out, value);
        }
        Format::Format35c | Format::Format45cc => {
            if op.regs.len() > 5
            {
                return Err(BlockError::usage(format!("{} takes at most 5 registers, got {}", name, op.regs.len())));
            }
            let mut nibbles = [0u16; 5];
            for (i, r) in op.regs.iter().enumerate()
            {
                nibbles[i] = check_reg(*r, 4, name)?;
            }
            out.push(code | nibbles[4] << 8 | (op.regs.len() as u16) << 12);
            out.push(index16()?);
            out.push(nibbles[0] | nibbles[1] << 4 | nibbles[2] << 8 | nibbles[3] << 12);
            if info.format == Format::Format45cc
            {
                out.push(proto16(op, name)?);
            }
        }
        Format::Format3rc | Format::Format4rcc => {
            let first = op.regs.first().copied().unwrap_or(0);
            if op.regs.iter().enumerate().any(|(i, r)| *r as usize != first as usize + i)
            {
                return Err(BlockError::usage(format!("{} registers are not contiguous", name)));
            }
            if op.regs.len() > 0xff
            {
                return Err(BlockError::usage(format!("{} takes at most 255 registers", name)));
            }
            out.push(code | (op.regs.len() as u16) << 8);
            out.push(index16()?);
            out.push(first);
            if info.format == Format::Format4rcc
            {
                out.push(proto16(op, name)?);
            }
        }
        Format::Format51l => {
            out.push(code | check_reg(op.reg(0)?, 8, name)? << 8);
            for i in 0..4
            {
                out.push((op.literal as u64 >> (16 * i)) as u16);
            }
        }
    }
    Ok(())
}

fn branch16(offset: i32, name: &str) -> BlockResult<u16>
{
    if !(i16::MIN as i32..=i16::MAX as i32).contains(&offset)
    {
        return Err(BlockError::usage(format!("branch offset {} does not fit {}", offset, name)));
    }
    Ok(offset as i16 as u16)
}

fn proto16(op: &Operation, name: &str) -> BlockResult<u16>
{
    let raw = op.proto.as_ref().map_or(0, |p| p.stored());
    if raw > 0xffff
    {
        return Err(BlockError::usage(format!("proto index {} does not fit {}", raw, name)));
    }
    Ok(raw as u16)
}

fn payload_target(target: Target, base: Option<u32>, addresses: &dyn AddressMap) -> BlockResult<i32>
{
    match (target, base)
    {
        (Target::Relative(offset), _) => Ok(offset),
        (Target::Ins(_), Some(base)) => relative(target, base, addresses),
        (Target::Ins(id), None) => Err(BlockError::usage(format!("switch payload targeting {:?} has no switch", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Addresses {
        starts: HashMap<InsId, u32>,
        switches: HashMap<InsId, u32>,
    }

    impl AddressMap for Addresses {
        fn address_of(&self, id: InsId) -> Option<u32> {
            self.starts.get(&id).copied()
        }

        fn switch_of(&self, payload: InsId) -> Option<u32> {
            self.switches.get(&payload).copied()
        }
    }

    fn none() -> Addresses {
        Addresses { starts: HashMap::new(), switches: HashMap::new() }
    }

    fn round_trip(units: &[u16]) -> Ins {
        let ins = decode(units, 0, InsId(0)).unwrap();
        assert_eq!(ins.units(), units.len());
        let mut out = Vec::new();
        encode(&ins, 0, &none(), &mut out).unwrap();
        assert_eq!(out, units);
        ins
    }

    #[test]
    fn common_formats_round_trip() {
        // const/4 v1, -1
        let ins = round_trip(&[0xf112]);
        assert_eq!(ins.operation().unwrap().literal, -1);
        // const/high16 v0, 0x7f010000
        let ins = round_trip(&[0x0015, 0x7f01]);
        assert_eq!(ins.operation().unwrap().literal, 0x7f01_0000);
        // invoke-virtual {v1, v2, v3}, method@0x10
        let ins = round_trip(&[0x306e, 0x0010, 0x0321]);
        assert_eq!(ins.operation().unwrap().regs, vec![1, 2, 3]);
        // invoke-static/range {v4 .. v6}, method@2
        let ins = round_trip(&[0x0377, 0x0002, 0x0004]);
        assert_eq!(ins.operation().unwrap().regs, vec![4, 5, 6]);
        // const-wide v0, 0x1122334455667788
        let ins = round_trip(&[0x0018, 0x7788, 0x5566, 0x3344, 0x1122]);
        assert_eq!(ins.operation().unwrap().literal, 0x1122_3344_5566_7788);
        // add-int/lit8 v0, v1, -2
        let ins = round_trip(&[0x00d8, 0xfe01]);
        assert_eq!(ins.operation().unwrap().literal, -2);
    }

    #[test]
    fn payloads_round_trip() {
        let packed = [PACKED_SWITCH_IDENT, 2, 10, 0, 6, 0, 8, 0];
        let ins = round_trip(&packed);
        assert!(matches!(ins.body, InsBody::PackedSwitch { first_key: 10, .. }));
        let array = [ARRAY_DATA_IDENT, 1, 3, 0, 0x0201, 0x0003];
        let ins = round_trip(&array);
        match &ins.body {
            InsBody::ArrayData { data, .. } => assert_eq!(data, &vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn targets_encode_against_current_addresses() {
        let mut ins = decode(&[0x0028], 0, InsId(0)).unwrap();
        ins.operation_mut().unwrap().target = Some(Target::Ins(InsId(7)));
        let mut addresses = none();
        addresses.starts.insert(InsId(7), 2);
        let mut out = Vec::new();
        encode(&ins, 10, &addresses, &mut out).unwrap();
        assert_eq!(out, vec![0xf828]);
    }

    #[test]
    fn literal_growth_promotes_const() {
        let mut op = Operation::new(0x12);
        op.regs = vec![0];
        op.literal = 1000;
        op.fit_literal().unwrap();
        assert_eq!(op.opcode, 0x13);
        op.literal = 0x1234_0000;
        op.fit_literal().unwrap();
        assert_eq!(op.opcode, 0x15);
        let mut lit8 = Operation::new(0xd8);
        lit8.literal = 300;
        assert!(lit8.fit_literal().unwrap_err().is_usage());
    }

    #[test]
    fn wide_registers_are_rejected_in_nibbles() {
        let mut op = Operation::new(0x01);
        op.regs = vec![16, 0];
        let ins = Ins { id: InsId(0), body: InsBody::Op(op) };
        assert!(encode(&ins, 0, &none(), &mut Vec::new()).unwrap_err().is_usage());
    }
}
