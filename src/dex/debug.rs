/* debug_info_item: line table and local variable state machine */

use crate::block::error::BlockResult;
use crate::block::io::{BlockReader, BlockWriter};
use crate::block::leb::{sleb128_len, uleb128_len};
use crate::block::reference::{IndexReference, RefWidth};
use crate::dex::ids::{IdPools, StringData, TypeId};

const DBG_END_SEQUENCE: u8 = 0x00;
const DBG_ADVANCE_PC: u8 = 0x01;
const DBG_ADVANCE_LINE: u8 = 0x02;
const DBG_START_LOCAL: u8 = 0x03;
const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
const DBG_END_LOCAL: u8 = 0x05;
const DBG_RESTART_LOCAL: u8 = 0x06;
const DBG_SET_PROLOGUE_END: u8 = 0x07;
const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
const DBG_SET_FILE: u8 = 0x09;
const DBG_FIRST_SPECIAL: u8 = 0x0a;
const DBG_LINE_BASE: i32 = -4;
const DBG_LINE_RANGE: i32 = 15;

#[derive(Debug, Clone)]
pub enum DebugRecord
{
    AdvancePc(u32),
    AdvanceLine(i32),
    StartLocal
    {
        register: u32,
        name: IndexReference<StringData>,
        local_type: IndexReference<TypeId>,
        signature: Option<IndexReference<StringData>>,
    },
    EndLocal(u32),
    RestartLocal(u32),
    PrologueEnd,
    EpilogueBegin,
    SetFile(IndexReference<StringData>),
    Special(u8),
}

impl DebugRecord
{
    fn byte_len(&self) -> usize
    {
        1 + match self
        {
            DebugRecord::AdvancePc(d) => uleb128_len(*d),
            DebugRecord::AdvanceLine(d) => sleb128_len(*d),
            DebugRecord::StartLocal { register, name, local_type, signature } => {
                uleb128_len(*register) + name.byte_len() + local_type.byte_len() + signature.as_ref().map_or(0, |s| s.byte_len())
            }
            DebugRecord::EndLocal(r) | DebugRecord::RestartLocal(r) => uleb128_len(*r),
            DebugRecord::SetFile(name) => name.byte_len(),
            DebugRecord::PrologueEnd | DebugRecord::EpilogueBegin | DebugRecord::Special(_) => 0,
        }
    }

    fn write(&self, writer: &mut BlockWriter) -> usize
    {
        match self
        {
            DebugRecord::AdvancePc(d) => writer.write_u8(DBG_ADVANCE_PC) + writer.write_uleb128(*d),
            DebugRecord::AdvanceLine(d) => writer.write_u8(DBG_ADVANCE_LINE) + writer.write_sleb128(*d),
            DebugRecord::StartLocal { register, name, local_type, signature } => {
                let tag = if signature.is_some() { DBG_START_LOCAL_EXTENDED } else { DBG_START_LOCAL };
                let mut c = writer.write_u8(tag) + writer.write_uleb128(*register);
                c += name.write(writer) + local_type.write(writer);
                if let Some(s) = signature
                {
                    c += s.write(writer);
                }
                c
            }
            DebugRecord::EndLocal(r) => writer.write_u8(DBG_END_LOCAL) + writer.write_uleb128(*r),
            DebugRecord::RestartLocal(r) => writer.write_u8(DBG_RESTART_LOCAL) + writer.write_uleb128(*r),
            DebugRecord::PrologueEnd => writer.write_u8(DBG_SET_PROLOGUE_END),
            DebugRecord::EpilogueBegin => writer.write_u8(DBG_SET_EPILOGUE_BEGIN),
            DebugRecord::SetFile(name) => writer.write_u8(DBG_SET_FILE) + name.write(writer),
            DebugRecord::Special(op) => writer.write_u8(*op),
        }
    }
}

/// A decoded debug event at a code address, with names resolved to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEventKind
{
    Line(u32),
    StartLocal
    {
        register: u32,
        name: Option<String>,
        local_type: Option<String>,
        signature: Option<String>,
    },
    EndLocal(u32),
    RestartLocal(u32),
    PrologueEnd,
    EpilogueBegin,
    SetFile(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent
{
    pub address: u32,
    pub kind: DebugEventKind,
}

#[derive(Debug, Clone, Default)]
pub struct DebugInfo
{
    pub line_start: u32,
    pub parameter_names: Vec<IndexReference<StringData>>,
    pub records: Vec<DebugRecord>,
}

impl DebugInfo
{
    pub fn read(reader: &mut BlockReader<'_>) -> BlockResult<DebugInfo>
    {
        let start = reader.position();
        let line_start = reader.read_uleb128()?;
        let parameters_size = reader.read_uleb128()?;
        let mut parameter_names = Vec::with_capacity(parameters_size.min(0x100) as usize);
        for _ in 0..parameters_size
        {
            parameter_names.push(IndexReference::read(RefWidth::UlebP1, reader)?);
        }
        let mut records = Vec::new();
        loop
        {
            let tag = reader.read_u8()?;
            let record = match tag
            {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => DebugRecord::AdvancePc(reader.read_uleb128()?),
                DBG_ADVANCE_LINE => DebugRecord::AdvanceLine(reader.read_sleb128()?),
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED => {
                    let register = reader.read_uleb128()?;
                    let name = IndexReference::read(RefWidth::UlebP1, reader)?;
                    let local_type = IndexReference::read(RefWidth::UlebP1, reader)?;
                    let signature = if tag == DBG_START_LOCAL_EXTENDED
                    {
                        Some(IndexReference::read(RefWidth::UlebP1, reader)?)
                    }
                    else
                    {
                        None
                    };
                    DebugRecord::StartLocal { register, name, local_type, signature }
                }
                DBG_END_LOCAL => DebugRecord::EndLocal(reader.read_uleb128()?),
                DBG_RESTART_LOCAL => DebugRecord::RestartLocal(reader.read_uleb128()?),
                DBG_SET_PROLOGUE_END => DebugRecord::PrologueEnd,
                DBG_SET_EPILOGUE_BEGIN => DebugRecord::EpilogueBegin,
                DBG_SET_FILE => DebugRecord::SetFile(IndexReference::read(RefWidth::UlebP1, reader)?),
                special => DebugRecord::Special(special),
            };
            records.push(record);
            if records.len() > 0x100000
            {
                fail!("Debug info at 0x{:x} does not terminate", start);
            }
        }
        Ok(DebugInfo { line_start, parameter_names, records })
    }

    pub fn write(&self, writer: &mut BlockWriter) -> usize
    {
        let mut c = writer.write_uleb128(self.line_start);
        c += writer.write_uleb128(self.parameter_names.len() as u32);
        for p in &self.parameter_names
        {
            c += p.write(writer);
        }
        for r in &self.records
        {
            c += r.write(writer);
        }
        c + writer.write_u8(DBG_END_SEQUENCE)
    }

    pub fn byte_len(&self) -> usize
    {
        uleb128_len(self.line_start)
            + uleb128_len(self.parameter_names.len() as u32)
            + self.parameter_names.iter().map(|p| p.byte_len()).sum::<usize>()
            + self.records.iter().map(|r| r.byte_len()).sum::<usize>()
            + 1
    }

    fn for_each_reference(&self, ids: &IdPools, refresh: bool) -> BlockResult<()>
    {
        let strings = |r: &IndexReference<StringData>| -> BlockResult<()> {
            if refresh { r.refresh(&ids.strings).map(drop) } else { r.get(&ids.strings).map(drop) }
        };
        for p in &self.parameter_names
        {
            strings(p)?;
        }
        for r in &self.records
        {
            match r
            {
                DebugRecord::StartLocal { name, local_type, signature, .. } => {
                    strings(name)?;
                    if refresh
                    {
                        local_type.refresh(&ids.types)?;
                    }
                    else
                    {
                        local_type.get(&ids.types)?;
                    }
                    if let Some(s) = signature
                    {
                        strings(s)?;
                    }
                }
                DebugRecord::SetFile(name) => strings(name)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn bind(&self, ids: &IdPools) -> BlockResult<()>
    {
        self.for_each_reference(ids, false)
    }

    pub fn refresh(&self, ids: &IdPools) -> BlockResult<()>
    {
        self.for_each_reference(ids, true)
    }

    /// Runs the state machine and returns its events in address order.
    pub fn events(&self, ids: &IdPools) -> BlockResult<Vec<DebugEvent>>
    {
        let mut address = 0u32;
        let mut line = self.line_start as i64;
        let mut events = Vec::new();
        for r in &self.records
        {
            let kind = match r
            {
                DebugRecord::AdvancePc(d) => {
                    address = address.wrapping_add(*d);
                    continue;
                }
                DebugRecord::AdvanceLine(d) => {
                    line += *d as i64;
                    continue;
                }
                DebugRecord::Special(op) => {
                    let adjusted = (*op - DBG_FIRST_SPECIAL) as i32;
                    line += (DBG_LINE_BASE + adjusted % DBG_LINE_RANGE) as i64;
                    address = address.wrapping_add((adjusted / DBG_LINE_RANGE) as u32);
                    DebugEventKind::Line(line.max(0) as u32)
                }
                DebugRecord::StartLocal { register, name, local_type, signature } => DebugEventKind::StartLocal {
                    register: *register,
                    name: ids.optional_string(name)?.map(str::to_string),
                    local_type: ids.optional_type(local_type)?.map(str::to_string),
                    signature: match signature
                    {
                        Some(s) => ids.optional_string(s)?.map(str::to_string),
                        None => None,
                    },
                },
                DebugRecord::EndLocal(r) => DebugEventKind::EndLocal(*r),
                DebugRecord::RestartLocal(r) => DebugEventKind::RestartLocal(*r),
                DebugRecord::PrologueEnd => DebugEventKind::PrologueEnd,
                DebugRecord::EpilogueBegin => DebugEventKind::EpilogueBegin,
                DebugRecord::SetFile(name) => DebugEventKind::SetFile(ids.optional_string(name)?.map(str::to_string)),
            };
            events.push(DebugEvent { address, kind });
        }
        Ok(events)
    }

    /// Encodes `events` (sorted by address) into a debug info item, interning names in `ids`.
    pub fn from_events(ids: &mut IdPools, parameter_names: &[Option<String>], events: &[DebugEvent]) -> DebugInfo
    {
        let string_ref = |ids: &mut IdPools, s: &Option<String>| match s
        {
            Some(s) => IndexReference::to(RefWidth::UlebP1, ids.get_or_create_string(s)),
            None => IndexReference::new(RefWidth::UlebP1),
        };
        let parameter_names = parameter_names.iter().map(|p| string_ref(&mut *ids, p)).collect();
        let line_start = events
            .iter()
            .find_map(|e| match e.kind
            {
                DebugEventKind::Line(l) => Some(l),
                _ => None,
            })
            .unwrap_or(0);
        let mut records = Vec::new();
        let mut address = 0u32;
        let mut line = line_start as i64;
        for event in events
        {
            let address_diff = event.address.saturating_sub(address);
            if let DebugEventKind::Line(target) = event.kind
            {
                let mut line_diff = target as i64 - line;
                if line_diff < DBG_LINE_BASE as i64 || line_diff >= (DBG_LINE_BASE + DBG_LINE_RANGE) as i64
                {
                    records.push(DebugRecord::AdvanceLine(line_diff as i32));
                    line_diff = 0;
                }
                let mut pc_diff = address_diff as i64;
                let special = |line_diff: i64, pc_diff: i64| (line_diff - DBG_LINE_BASE as i64) + pc_diff * DBG_LINE_RANGE as i64 + DBG_FIRST_SPECIAL as i64;
                if special(line_diff, pc_diff) > 0xff
                {
                    records.push(DebugRecord::AdvancePc(address_diff));
                    pc_diff = 0;
                }
                records.push(DebugRecord::Special(special(line_diff, pc_diff) as u8));
                address = event.address;
                line = target as i64;
                continue;
            }
            if address_diff > 0
            {
                records.push(DebugRecord::AdvancePc(address_diff));
                address = event.address;
            }
            let record = match &event.kind
            {
                DebugEventKind::StartLocal { register, name, local_type, signature } => DebugRecord::StartLocal {
                    register: *register,
                    name: string_ref(&mut *ids, name),
                    local_type: match local_type
                    {
                        Some(t) => IndexReference::to(RefWidth::UlebP1, ids.get_or_create_type(t)),
                        None => IndexReference::new(RefWidth::UlebP1),
                    },
                    signature: signature.as_ref().map(|s| string_ref(&mut *ids, &Some(s.clone()))),
                },
                DebugEventKind::EndLocal(r) => DebugRecord::EndLocal(*r),
                DebugEventKind::RestartLocal(r) => DebugRecord::RestartLocal(*r),
                DebugEventKind::PrologueEnd => DebugRecord::PrologueEnd,
                DebugEventKind::EpilogueBegin => DebugRecord::EpilogueBegin,
                DebugEventKind::SetFile(name) => DebugRecord::SetFile(string_ref(&mut *ids, name)),
                DebugEventKind::Line(_) => continue,
            };
            records.push(record);
        }
        DebugInfo { line_start, parameter_names, records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(address: u32, line: u32) -> DebugEvent {
        DebugEvent { address, kind: DebugEventKind::Line(line) }
    }

    #[test]
    fn reads_special_opcodes() {
        // line_start 10, no parameters, special(+1 line, +2 pc), end
        let bytes = [10, 0, 0x0a + 5 + 2 * 15, 0];
        let info = DebugInfo::read(&mut BlockReader::new(&bytes)).unwrap();
        let events = info.events(&IdPools::default()).unwrap();
        assert_eq!(events, vec![line(2, 11)]);
        let mut writer = BlockWriter::new();
        assert_eq!(info.write(&mut writer), info.byte_len());
        assert_eq!(writer.into_bytes(), bytes.to_vec());
    }

    #[test]
    fn line_table_round_trips_through_events() {
        let mut ids = IdPools::default();
        let events = vec![
            line(0, 5),
            line(3, 6),
            line(40, 100),
            DebugEvent {
                address: 42,
                kind: DebugEventKind::StartLocal {
                    register: 1,
                    name: Some("count".to_string()),
                    local_type: Some("I".to_string()),
                    signature: None,
                },
            },
            line(400, 2),
            DebugEvent { address: 401, kind: DebugEventKind::EndLocal(1) },
        ];
        let info = DebugInfo::from_events(&mut ids, &[Some("arg".to_string()), None], &events);
        assert_eq!(info.line_start, 5);
        assert_eq!(info.events(&ids).unwrap(), events);

        info.refresh(&ids).unwrap();
        let mut writer = BlockWriter::new();
        info.write(&mut writer);
        let bytes = writer.into_bytes();
        ids.commit_order();
        let back = DebugInfo::read(&mut BlockReader::new(&bytes)).unwrap();
        assert_eq!(back.events(&ids).unwrap(), events);
        assert_eq!(ids.optional_string(&back.parameter_names[0]).unwrap(), Some("arg"));
        assert_eq!(ids.optional_string(&back.parameter_names[1]).unwrap(), None);
    }
}
