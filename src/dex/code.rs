/* code_item: registers, instructions, tries and catch handlers */

use std::collections::{HashMap, HashSet};

use log::warn;
use rangemap::RangeMap;

use crate::block::error::{BlockError, BlockResult};
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::reference::{IndexReference, IntegerVisitor, OffsetReference, RefWidth};
use crate::dex::debug::DebugInfo;
use crate::dex::ids::{IdPools, TypeId};
use crate::dex::ins::{decode, encode, AddressMap, Ins, InsBody, InsId, Operation, Target};
use crate::dex::opcode::Format;

const OP_GOTO: u8 = 0x28;
const OP_GOTO_16: u8 = 0x29;
const OP_GOTO_32: u8 = 0x2a;
const OP_CONST_STRING: u8 = 0x1a;
const OP_CONST_STRING_JUMBO: u8 = 0x1b;
const MAX_BRANCH_PASSES: usize = 16;

/// A `try_item`: the instructions from `start` up to, not including, `end`
/// (`None` meaning the end of the code) are covered by `handler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock
{
    pub start: InsId,
    pub end: Option<InsId>,
    pub handler: usize,
}

#[derive(Debug, Clone)]
pub struct CatchPair
{
    pub exception: IndexReference<TypeId>,
    pub handler: InsId,
}

#[derive(Debug, Clone, Default)]
pub struct CatchHandler
{
    pub pairs: Vec<CatchPair>,
    pub catch_all: Option<InsId>,
}

#[derive(Debug, Clone, Default)]
struct Encoded
{
    units: Vec<u16>,
    handlers: Vec<u8>,
    handler_offsets: Vec<u16>,
}

#[derive(Debug, Clone, Default)]
struct Layout
{
    starts: HashMap<InsId, u32>,
    switches: HashMap<InsId, u32>,
    padded: HashSet<InsId>,
    by_address: RangeMap<u32, InsId>,
    units: u32,
}

impl AddressMap for Layout
{
    fn address_of(&self, id: InsId) -> Option<u32>
    {
        self.starts.get(&id).copied()
    }

    fn switch_of(&self, payload: InsId) -> Option<u32>
    {
        self.switches.get(&payload).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeItem
{
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub debug_info: OffsetReference<DebugInfo>,
    instructions: Vec<Ins>,
    pub tries: Vec<TryBlock>,
    pub handlers: Vec<CatchHandler>,
    next_id: u32,
    layout: Layout,
    encoded: Encoded,
}

impl CodeItem
{
    pub fn new(registers: u16, ins: u16, outs: u16) -> CodeItem
    {
        CodeItem { registers, ins, outs, ..Default::default() }
    }

    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<CodeItem>
    {
        let registers = reader.read_u16()?;
        let ins = reader.read_u16()?;
        let outs = reader.read_u16()?;
        let tries_size = reader.read_u16()?;
        let debug_info = OffsetReference::read(RefWidth::Int, reader)?;
        let insns_size = reader.read_u32()? as usize;
        let mut units = Vec::with_capacity(insns_size);
        for _ in 0..insns_size
        {
            units.push(reader.read_u16()?);
        }
        if tries_size > 0 && insns_size % 2 == 1
        {
            reader.read_u16()?;
        }
        let mut raw_tries = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size
        {
            raw_tries.push((reader.read_u32()?, reader.read_u16()?, reader.read_u16()?));
        }

        let mut code = CodeItem { registers, ins, outs, debug_info, ..Default::default() };
        let mut starts = Vec::new();
        let mut pc = 0;
        while pc < units.len()
        {
            let id = code.allocate_id();
            let ins = decode(&units, pc, id).map_err(|e| err!(e, "instruction at 0x{:x}", pc))?;
            starts.push(pc as u32);
            code.layout.by_address.insert(pc as u32..(pc + ins.units()) as u32, id);
            code.layout.starts.insert(id, pc as u32);
            pc += ins.units();
            code.instructions.push(ins);
        }
        code.layout.units = units.len() as u32;

        let mut handler_index = HashMap::new();
        if tries_size > 0
        {
            let base = reader.position();
            let count = reader.read_uleb128()?;
            for _ in 0..count
            {
                let offset = (reader.position() - base) as u16;
                let size = reader.read_sleb128()?;
                let mut handler = CatchHandler::default();
                for _ in 0..size.unsigned_abs()
                {
                    let exception = IndexReference::read(RefWidth::Uleb, reader)?;
                    let address = reader.read_uleb128()?;
                    handler.pairs.push(CatchPair { exception, handler: code.exact(address, "catch handler")? });
                }
                if size <= 0
                {
                    handler.catch_all = Some(code.exact(reader.read_uleb128()?, "catch-all handler")?);
                }
                handler_index.insert(offset, code.handlers.len());
                code.handlers.push(handler);
            }
        }
        for (start, count, handler_off) in raw_tries
        {
            let handler = match handler_index.get(&handler_off)
            {
                Some(h) => *h,
                None => fail!("try at 0x{:x} names handler offset 0x{:x}", start, handler_off),
            };
            let end = start + count as u32;
            code.tries.push(TryBlock {
                start: code.exact(start, "try start")?,
                end: if end == code.layout.units { None } else { Some(code.exact(end, "try end")?) },
                handler,
            });
        }
        code.resolve_targets(&starts);
        code.drop_alignment_nops();
        code.encoded = Encoded {
            units,
            handlers: Vec::new(),
            handler_offsets: Vec::new(),
        };
        code.encode_handlers()?;
        Ok(code)
    }

    fn allocate_id(&mut self) -> InsId
    {
        let id = InsId(self.next_id);
        self.next_id += 1;
        id
    }

    fn exact(&self, address: u32, what: &str) -> BlockResult<InsId>
    {
        match self.layout.by_address.get(&address)
        {
            Some(id) if self.layout.starts.get(id) == Some(&address) => Ok(*id),
            _ => fail!("{} at 0x{:x} is not an instruction boundary", what, address),
        }
    }

    fn resolve_targets(&mut self, starts: &[u32])
    {
        let mut payload_bases: HashMap<InsId, u32> = HashMap::new();
        for (i, ins) in self.instructions.iter_mut().enumerate()
        {
            let start = starts[i];
            if let InsBody::Op(op) = &mut ins.body
            {
                if let Some(Target::Relative(offset)) = op.target
                {
                    let address = start as i64 + offset as i64;
                    let found = self.layout.by_address.get(&(address as u32)).copied();
                    match found
                    {
                        Some(id) if address >= 0 && self.layout.starts.get(&id) == Some(&(address as u32)) => {
                            op.target = Some(Target::Ins(id));
                            if op.info().map_or(false, |o| o.format == Format::Format31t)
                            {
                                payload_bases.entry(id).or_insert(start);
                            }
                        }
                        _ => warn!("branch at 0x{:x} to 0x{:x} does not land on an instruction", start, address),
                    }
                }
            }
        }
        let layout = &self.layout;
        for ins in self.instructions.iter_mut()
        {
            let base = match payload_bases.get(&ins.id)
            {
                Some(b) => *b,
                None => continue,
            };
            if let InsBody::PackedSwitch { targets, .. } | InsBody::SparseSwitch { targets, .. } = &mut ins.body
            {
                for t in targets.iter_mut()
                {
                    if let Target::Relative(offset) = *t
                    {
                        let address = (base as i64 + offset as i64) as u32;
                        if let Some(id) = layout.by_address.get(&address)
                        {
                            if layout.starts.get(id) == Some(&address)
                            {
                                *t = Target::Ins(*id);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Removes `nop`s that only align a following payload; layout re-inserts them.
    fn drop_alignment_nops(&mut self)
    {
        let mut referenced: HashSet<InsId> = HashSet::new();
        for ins in &self.instructions
        {
            for t in ins.targets()
            {
                if let Target::Ins(id) = t
                {
                    referenced.insert(id);
                }
            }
        }
        for t in &self.tries
        {
            referenced.insert(t.start);
            referenced.extend(t.end);
        }
        for h in &self.handlers
        {
            referenced.extend(h.pairs.iter().map(|p| p.handler));
            referenced.extend(h.catch_all);
        }
        let mut padding = HashSet::new();
        for pair in self.instructions.windows(2)
        {
            let is_nop = matches!(&pair[0].body, InsBody::Op(op) if op.opcode == 0x00);
            let odd = self.layout.starts.get(&pair[0].id).map_or(false, |a| a % 2 == 1);
            if is_nop && odd && pair[1].is_payload() && !referenced.contains(&pair[0].id)
            {
                padding.insert(pair[0].id);
            }
        }
        if !padding.is_empty()
        {
            self.instructions.retain(|i| !padding.contains(&i.id));
            for i in &self.instructions
            {
                if let Some(pad) = self.layout.starts.get(&i.id).filter(|a| **a > 0).map(|a| *a - 1)
                {
                    if self.layout.by_address.get(&pad).map_or(false, |id| padding.contains(id))
                    {
                        self.layout.padded.insert(i.id);
                    }
                }
            }
        }
    }

    pub fn instructions(&self) -> &[Ins]
    {
        &self.instructions
    }

    pub fn instruction(&self, id: InsId) -> Option<&Ins>
    {
        self.instructions.iter().find(|i| i.id == id)
    }

    pub fn instruction_mut(&mut self, id: InsId) -> Option<&mut Ins>
    {
        self.instructions.iter_mut().find(|i| i.id == id)
    }

    pub fn position_of(&self, id: InsId) -> Option<usize>
    {
        self.instructions.iter().position(|i| i.id == id)
    }

    /// Address of `id` as of the last read or refresh.
    pub fn address_of(&self, id: InsId) -> Option<u32>
    {
        self.layout.starts.get(&id).copied()
    }

    /// Instruction covering `address` as of the last read or refresh.
    pub fn instruction_at(&self, address: u32) -> Option<InsId>
    {
        self.layout.by_address.get(&address).copied()
    }

    /// Length of the instruction stream in code units as of the last read or refresh.
    pub fn code_units(&self) -> u32
    {
        self.layout.units
    }

    pub fn push(&mut self, body: InsBody) -> InsId
    {
        let id = self.allocate_id();
        self.instructions.push(Ins { id, body });
        id
    }

    pub fn insert(&mut self, position: usize, body: InsBody) -> BlockResult<InsId>
    {
        if position > self.instructions.len()
        {
            return Err(BlockError::usage(format!(
                "insert position {} past {} instructions",
                position,
                self.instructions.len()
            )));
        }
        let id = self.allocate_id();
        self.instructions.insert(position, Ins { id, body });
        Ok(id)
    }

    /// Removes an instruction nothing refers to.
    pub fn remove(&mut self, id: InsId) -> BlockResult<Ins>
    {
        let referenced = self.instructions.iter().any(|i| i.targets().contains(&Target::Ins(id)))
            || self.tries.iter().any(|t| t.start == id || t.end == Some(id))
            || self.handlers.iter().any(|h| h.catch_all == Some(id) || h.pairs.iter().any(|p| p.handler == id));
        if referenced
        {
            return Err(BlockError::usage(format!("instruction {:?} is still a branch, try or handler target", id)));
        }
        match self.position_of(id)
        {
            Some(p) => Ok(self.instructions.remove(p)),
            None => Err(BlockError::usage(format!("no instruction {:?}", id))),
        }
    }

    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        for ins in &self.instructions
        {
            if let InsBody::Op(op) = &ins.body
            {
                if let Some(index) = &op.index
                {
                    index.bind(ids)?;
                }
                if let Some(p) = &op.proto
                {
                    p.get(&ids.protos)?;
                }
            }
        }
        for h in &self.handlers
        {
            for p in &h.pairs
            {
                p.exception.get(&ids.types)?;
            }
        }
        Ok(())
    }

    /// Rewrites index operands, re-lays out the instruction stream and re-encodes it.
    ///
    /// `const-string` grows to `const-string/jumbo` and `goto` to its wider forms
    /// when their operands no longer fit.
    pub fn refresh(&mut self, ids: &IdPools) -> BlockResult<()>
    {
        for ins in self.instructions.iter_mut()
        {
            if let InsBody::Op(op) = &mut ins.body
            {
                refresh_operation(op, ids)?;
            }
        }
        for h in &self.handlers
        {
            for p in &h.pairs
            {
                p.exception.refresh(&ids.types)?;
            }
        }
        self.relayout()?;
        let mut units = Vec::with_capacity(self.layout.units as usize);
        for ins in &self.instructions
        {
            if self.layout.padded.contains(&ins.id)
            {
                units.push(0);
            }
            let address = self.layout.starts.get(&ins.id).copied().unwrap_or(0);
            encode(ins, address, &self.layout, &mut units).map_err(|e| err!(e, "instruction {:?}", ins.id))?;
        }
        self.encoded.units = units;
        self.encode_handlers()
    }

    fn relayout(&mut self) -> BlockResult<()>
    {
        for _ in 0..MAX_BRANCH_PASSES
        {
            self.assign_addresses();
            if !self.widen_gotos()
            {
                return Ok(());
            }
        }
        fail!("branch layout did not settle after {} passes", MAX_BRANCH_PASSES)
    }

    fn assign_addresses(&mut self)
    {
        let mut layout = Layout::default();
        let mut address = 0u32;
        for ins in &self.instructions
        {
            if ins.is_payload() && address % 2 == 1
            {
                layout.padded.insert(ins.id);
                address += 1;
            }
            layout.starts.insert(ins.id, address);
            let units = ins.units() as u32;
            if units > 0
            {
                layout.by_address.insert(address..address + units, ins.id);
            }
            address += units;
        }
        layout.units = address;
        for ins in &self.instructions
        {
            if let InsBody::Op(op) = &ins.body
            {
                if let (Some(Target::Ins(payload)), Some(address)) = (op.target, layout.starts.get(&ins.id))
                {
                    if op.opcode == 0x2b || op.opcode == 0x2c
                    {
                        layout.switches.entry(payload).or_insert(*address);
                    }
                }
            }
        }
        self.layout = layout;
    }

    fn widen_gotos(&mut self) -> bool
    {
        let mut changed = false;
        for ins in self.instructions.iter_mut()
        {
            let from = match self.layout.starts.get(&ins.id)
            {
                Some(a) => *a as i64,
                None => continue,
            };
            if let InsBody::Op(op) = &mut ins.body
            {
                let to = match op.target
                {
                    Some(Target::Ins(id)) => match self.layout.starts.get(&id)
                    {
                        Some(a) => *a as i64,
                        None => continue,
                    },
                    _ => continue,
                };
                let offset = to - from;
                let wider = match op.opcode
                {
                    OP_GOTO if offset == 0 || !(i8::MIN as i64..=i8::MAX as i64).contains(&offset) => Some(OP_GOTO_16),
                    OP_GOTO_16 if offset == 0 || !(i16::MIN as i64..=i16::MAX as i64).contains(&offset) => Some(OP_GOTO_32),
                    _ => None,
                };
                if let Some(opcode) = wider
                {
                    op.opcode = opcode;
                    changed = true;
                }
            }
        }
        changed
    }

    fn encode_handlers(&mut self) -> BlockResult<()>
    {
        if self.tries.is_empty()
        {
            self.encoded.handlers.clear();
            self.encoded.handler_offsets.clear();
            return Ok(());
        }
        let mut writer = BlockWriter::new();
        let mut offsets = Vec::with_capacity(self.handlers.len());
        writer.write_uleb128(self.handlers.len() as u32);
        for h in &self.handlers
        {
            offsets.push(writer.position() as u16);
            let size = h.pairs.len() as i32;
            writer.write_sleb128(if h.catch_all.is_some() { -size } else { size });
            for p in &h.pairs
            {
                p.exception.write(&mut writer);
                writer.write_uleb128(self.handler_address(p.handler)?);
            }
            if let Some(all) = h.catch_all
            {
                writer.write_uleb128(self.handler_address(all)?);
            }
        }
        self.encoded.handlers = writer.into_bytes();
        self.encoded.handler_offsets = offsets;
        Ok(())
    }

    fn handler_address(&self, id: InsId) -> BlockResult<u32>
    {
        match self.layout.starts.get(&id)
        {
            Some(a) => Ok(*a),
            None => Err(BlockError::resolution(format!("handler {:?} was removed", id))),
        }
    }

    fn insns_padding(&self) -> usize
    {
        if !self.tries.is_empty() && self.encoded.units.len() % 2 == 1 { 2 } else { 0 }
    }

    pub fn byte_len(&self) -> usize
    {
        16 + 2 * self.encoded.units.len() + self.insns_padding() + 8 * self.tries.len() + self.encoded.handlers.len()
    }

    pub fn write(&self, writer: &mut BlockWriter) -> BlockResult<usize>
    {
        let start = writer.position();
        writer.write_u16(self.registers);
        writer.write_u16(self.ins);
        writer.write_u16(self.outs);
        writer.write_u16(self.tries.len() as u16);
        self.debug_info.write(writer);
        writer.write_u32(self.encoded.units.len() as u32);
        for u in &self.encoded.units
        {
            writer.write_u16(*u);
        }
        writer.fill(self.insns_padding(), 0);
        for t in &self.tries
        {
            let start_address = self.handler_address(t.start)?;
            let end_address = match t.end
            {
                Some(end) => self.handler_address(end)?,
                None => self.layout.units,
            };
            if end_address < start_address || end_address - start_address > 0xffff
            {
                return Err(BlockError::usage(format!("try block 0x{:x}..0x{:x} is out of range", start_address, end_address)));
            }
            let handler_off = match self.encoded.handler_offsets.get(t.handler)
            {
                Some(o) => *o,
                None => return Err(BlockError::usage(format!("try names missing handler {}", t.handler))),
            };
            writer.write_u32(start_address);
            writer.write_u16((end_address - start_address) as u16);
            writer.write_u16(handler_off);
        }
        writer.write_bytes(&self.encoded.handlers);
        Ok(writer.position() - start)
    }

    pub fn visit_integers(&mut self, visitor: &mut dyn IntegerVisitor)
    {
        for ins in self.instructions.iter_mut()
        {
            if let InsBody::Op(op) = &mut ins.body
            {
                if op.info().map_or(false, |o| o.is_const())
                {
                    visitor.visit(op);
                }
            }
        }
    }
}

fn refresh_operation(op: &mut Operation, ids: &IdPools) -> BlockResult<()>
{
    if let Some(index) = &op.index
    {
        index.refresh(ids)?;
    }
    if let Some(p) = &op.proto
    {
        p.refresh(&ids.protos)?;
    }
    if op.opcode == OP_CONST_STRING && op.index.as_ref().map_or(false, |i| i.raw() > 0xffff)
    {
        op.opcode = OP_CONST_STRING_JUMBO;
    }
    let info = op.info()?;
    if info.is_const() || matches!(info.format, Format::Format22b | Format::Format22s)
    {
        op.fit_literal()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_bytes(registers: u16, units: &[u16], tries: &[(u32, u16, u16)], handlers: &[u8]) -> Vec<u8> {
        let mut writer = BlockWriter::new();
        writer.write_u16(registers);
        writer.write_u16(0);
        writer.write_u16(0);
        writer.write_u16(tries.len() as u16);
        writer.write_u32(0);
        writer.write_u32(units.len() as u32);
        for u in units {
            writer.write_u16(*u);
        }
        if !tries.is_empty() && units.len() % 2 == 1 {
            writer.write_u16(0);
        }
        for (start, count, off) in tries {
            writer.write_u32(*start);
            writer.write_u16(*count);
            writer.write_u16(*off);
        }
        writer.write_bytes(handlers);
        writer.into_bytes()
    }

    fn rewritten(code: &mut CodeItem) -> Vec<u8> {
        code.refresh(&IdPools::default()).unwrap();
        let mut writer = BlockWriter::new();
        let written = code.write(&mut writer).unwrap();
        assert_eq!(written, code.byte_len());
        writer.into_bytes()
    }

    #[test]
    fn unchanged_code_writes_back_identically() {
        // const/4 v0, 0; if-eqz v0, +3; nop; return-void; catch-all over the first two
        let units = [0x0012, 0x0038, 0x0003, 0x0000, 0x000e];
        let handlers = [1, 0x00, 4];
        let bytes = code_bytes(1, &units, &[(0, 3, 1)], &handlers);
        let mut code = CodeItem::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(code.instructions().len(), 4);
        assert_eq!(rewritten(&mut code), bytes);
    }

    #[test]
    fn branches_and_tries_survive_insertion() {
        let units = [0x0012, 0x0038, 0x0003, 0x0000, 0x000e];
        let handlers = [1, 0x00, 4];
        let bytes = code_bytes(1, &units, &[(0, 3, 1)], &handlers);
        let mut code = CodeItem::read(&mut BlockReader::new(&bytes)).unwrap();
        let ret = code.instructions()[3].id;
        let mut op = Operation::new(0x12);
        op.regs = vec![1];
        op.literal = 2;
        code.insert(2, InsBody::Op(op)).unwrap();
        let out = rewritten(&mut code);

        let back = CodeItem::read(&mut BlockReader::new(&out)).unwrap();
        assert_eq!(back.code_units(), 6);
        let branch = back.instructions()[1].operation().unwrap();
        let target = match branch.target {
            Some(Target::Ins(id)) => id,
            other => panic!("unresolved {:?}", other),
        };
        assert_eq!(back.address_of(target), Some(5));
        assert_eq!(code.address_of(ret), Some(5));
        // the try now covers const/4, if-eqz and the inserted const/4
        assert_eq!(back.tries[0].end, back.instruction_at(4));
        assert_eq!(back.handlers[0].catch_all, back.instruction_at(5));
    }

    #[test]
    fn far_goto_widens() {
        let mut code = CodeItem::new(1, 0, 0);
        let first = code.push(InsBody::Op(Operation::new(0x0e)));
        let mut goto = Operation::new(OP_GOTO);
        goto.target = Some(Target::Ins(first));
        for _ in 0..200 {
            code.push(InsBody::Op(Operation::new(0x00)));
        }
        let goto = code.push(InsBody::Op(goto));
        code.refresh(&IdPools::default()).unwrap();
        let op = code.instruction(goto).unwrap().operation().unwrap();
        assert_eq!(op.opcode, OP_GOTO_16);
        assert_eq!(code.address_of(goto), Some(201));
    }

    #[test]
    fn payload_gets_aligned_and_switch_relative_targets() {
        let mut code = CodeItem::new(1, 0, 0);
        let ret = code.push(InsBody::Op(Operation::new(0x0e)));
        let mut switch = Operation::new(0x2b);
        switch.regs = vec![0];
        let switch_id = code.push(InsBody::Op(switch));
        let payload = code.push(InsBody::PackedSwitch { first_key: 0, targets: vec![Target::Ins(ret)] });
        code.instruction_mut(switch_id).unwrap().operation_mut().unwrap().target = Some(Target::Ins(payload));
        let bytes = rewritten(&mut code);
        // return-void at 0, packed-switch at 1..4, payload already even
        assert_eq!(code.address_of(payload), Some(4));
        let back = CodeItem::read(&mut BlockReader::new(&bytes)).unwrap();
        match &back.instructions()[2].body {
            InsBody::PackedSwitch { targets, .. } => assert_eq!(targets[0], Target::Ins(back.instructions()[0].id)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
