/* Moving classes between a DexFile and the smali model */

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, warn};

use crate::block::error::{BlockError, BlockResult};
use crate::block::pool::ItemId;
use crate::block::reference::{IndexReference, OffsetReference, RefWidth};
use crate::dex::annotation::{AnnotationSet, AnnotationsDirectory};
use crate::dex::class::{ClassDef, EncodedField, EncodedMethod};
use crate::dex::code::{CatchHandler, CatchPair, CodeItem, TryBlock};
use crate::dex::debug::{DebugEvent, DebugEventKind, DebugInfo};
use crate::dex::file::DexFile;
use crate::dex::ids::IdPools;
use crate::dex::ins::{IndexOperand, InsBody, InsId, Operation, Target};
use crate::dex::opcode::{opcode_by_name, ReferenceKind};
use crate::dex::value::{AnnotationElement, DexValue, EncodedAnnotation, EncodedValue};
use crate::smali::model::{
    OperandLayout, Register, RegisterForm, SmaliAnnotation, SmaliAnnotationElement, SmaliCatch, SmaliClass, SmaliCode, SmaliField,
    SmaliInstruction, SmaliMethod, SmaliParameter, SmaliReference, SmaliValue,
};
use crate::smali::SmaliOptions;

fn value_to_smali(ids: &IdPools, value: &EncodedValue) -> BlockResult<SmaliValue>
{
    Ok(match value.value()
    {
        DexValue::Byte(v) => SmaliValue::Byte(*v),
        DexValue::Short(v) => SmaliValue::Short(*v),
        DexValue::Char(v) => SmaliValue::Char(*v),
        DexValue::Int(v) => SmaliValue::Int(*v),
        DexValue::Long(v) => SmaliValue::Long(*v),
        DexValue::Float(v) => SmaliValue::Float(*v),
        DexValue::Double(v) => SmaliValue::Double(*v),
        DexValue::MethodType(r) => SmaliValue::MethodType(ids.proto_key(r.require(&ids.protos)?)?),
        DexValue::MethodHandle(i) => return Err(BlockError::usage(format!("method handle value {} has no smali form", i))),
        DexValue::String(r) => SmaliValue::String(ids.string(r)?.to_string()),
        DexValue::Type(r) => SmaliValue::Type(ids.type_descriptor(r)?.to_string()),
        DexValue::Field(r) => SmaliValue::Field(ids.field_key(r.require(&ids.fields)?)?),
        DexValue::Method(r) => SmaliValue::Method(ids.method_key(r.require(&ids.methods)?)?),
        DexValue::Enum(r) => SmaliValue::Enum(ids.field_key(r.require(&ids.fields)?)?),
        DexValue::Array(values) => SmaliValue::Array(values.iter().map(|v| value_to_smali(ids, v)).collect::<BlockResult<_>>()?),
        DexValue::Annotation(a) => SmaliValue::SubAnnotation {
            annotation_type: ids.type_descriptor(&a.annotation_type)?.to_string(),
            elements: elements_to_smali(ids, &a.elements)?,
        },
        DexValue::Null => SmaliValue::Null,
        DexValue::Boolean(b) => SmaliValue::Boolean(*b),
    })
}

fn elements_to_smali(ids: &IdPools, elements: &[AnnotationElement]) -> BlockResult<Vec<SmaliAnnotationElement>>
{
    elements
        .iter()
        .map(|e| Ok(SmaliAnnotationElement { name: ids.string(&e.name)?.to_string(), value: value_to_smali(ids, &e.value)? }))
        .collect()
}

fn value_from_smali(ids: &mut IdPools, value: &SmaliValue) -> BlockResult<EncodedValue>
{
    Ok(EncodedValue::new(match value
    {
        SmaliValue::Byte(v) => DexValue::Byte(*v),
        SmaliValue::Short(v) => DexValue::Short(*v),
        SmaliValue::Char(v) => DexValue::Char(*v),
        SmaliValue::Int(v) => DexValue::Int(*v),
        SmaliValue::Long(v) => DexValue::Long(*v),
        SmaliValue::Float(v) => DexValue::Float(*v),
        SmaliValue::Double(v) => DexValue::Double(*v),
        SmaliValue::String(s) => DexValue::String(IndexReference::to(RefWidth::Int, ids.get_or_create_string(s))),
        SmaliValue::Type(t) => DexValue::Type(IndexReference::to(RefWidth::Int, ids.get_or_create_type(t))),
        SmaliValue::Field(f) => DexValue::Field(IndexReference::to(RefWidth::Int, ids.get_or_create_field(f))),
        SmaliValue::Method(m) => DexValue::Method(IndexReference::to(RefWidth::Int, ids.get_or_create_method(m))),
        SmaliValue::Enum(f) => DexValue::Enum(IndexReference::to(RefWidth::Int, ids.get_or_create_field(f))),
        SmaliValue::MethodType(p) => DexValue::MethodType(IndexReference::to(RefWidth::Int, ids.get_or_create_proto(p))),
        SmaliValue::Array(values) => DexValue::Array(values.iter().map(|v| value_from_smali(ids, v)).collect::<BlockResult<_>>()?),
        SmaliValue::SubAnnotation { annotation_type, elements } => DexValue::Annotation(annotation_from_smali(ids, annotation_type, elements)?),
        SmaliValue::Null => DexValue::Null,
        SmaliValue::Boolean(b) => DexValue::Boolean(*b),
    }))
}

fn annotation_from_smali(ids: &mut IdPools, annotation_type: &str, elements: &[SmaliAnnotationElement]) -> BlockResult<EncodedAnnotation>
{
    let mut encoded = Vec::with_capacity(elements.len());
    for e in elements
    {
        let name = IndexReference::to(RefWidth::Uleb, ids.get_or_create_string(&e.name));
        encoded.push(AnnotationElement { name, value: value_from_smali(ids, &e.value)? });
    }
    Ok(EncodedAnnotation { annotation_type: IndexReference::to(RefWidth::Uleb, ids.get_or_create_type(annotation_type)), elements: encoded })
}

fn label_name(prefix: &str, address: u32) -> String
{
    format!("{}_{:x}", prefix, address)
}

/// Labels of one method body, keyed by code address.
#[derive(Default)]
struct Labels
{
    at: BTreeMap<u32, BTreeSet<String>>,
}

impl Labels
{
    fn add(&mut self, prefix: &str, address: u32) -> String
    {
        let name = label_name(prefix, address);
        self.at.entry(address).or_default().insert(name.clone());
        name
    }

    fn take(&mut self, address: u32) -> impl Iterator<Item = SmaliCode>
    {
        self.at.remove(&address).unwrap_or_default().into_iter().map(SmaliCode::Label)
    }
}

fn branch_prefix(name: &str) -> &'static str
{
    match name
    {
        "packed-switch" => "pswitch_data",
        "sparse-switch" => "sswitch_data",
        "fill-array-data" => "array",
        n if n.starts_with("goto") => "goto",
        _ => "cond",
    }
}

/// A body's frame, for mapping frame registers to their smali spelling.
#[derive(Clone, Copy)]
struct Frame
{
    registers: u16,
    ins: u16,
}

impl Frame
{
    fn register(&self, reg: u16) -> Register
    {
        Register::from_frame(reg, self.registers, self.ins)
    }

    fn registers(&self, regs: &[u16], range: bool) -> Vec<Register>
    {
        let mapped: Vec<Register> = regs.iter().map(|r| self.register(*r)).collect();
        let mixed = mapped.iter().any(|r| matches!(r, Register::Local(_))) && mapped.iter().any(|r| matches!(r, Register::Param(_)));
        if range && mixed
        {
            return regs.iter().map(|r| Register::Local(*r)).collect();
        }
        mapped
    }
}

fn operation_to_smali(ids: &IdPools, op: &Operation, frame: Frame, label: Option<String>) -> BlockResult<SmaliInstruction>
{
    let info = op.info()?;
    let layout = OperandLayout::of(info);
    let mut out = SmaliInstruction::new(info.name);
    out.registers = frame.registers(&op.regs, layout.registers == RegisterForm::Range);
    if layout.literal
    {
        out.literal = Some(op.literal);
    }
    out.label = label;
    if let Some(index) = &op.index
    {
        out.reference = Some(match index
        {
            IndexOperand::String(r) => SmaliReference::String(ids.string(r)?.to_string()),
            IndexOperand::Type(r) => SmaliReference::Type(ids.type_descriptor(r)?.to_string()),
            IndexOperand::Field(r) => SmaliReference::Field(ids.field_key(r.require(&ids.fields)?)?),
            IndexOperand::Method(r) => SmaliReference::Method(ids.method_key(r.require(&ids.methods)?)?),
            IndexOperand::Proto(r) => SmaliReference::Proto(ids.proto_key(r.require(&ids.protos)?)?),
            IndexOperand::CallSite(_) | IndexOperand::MethodHandle(_) => {
                return Err(BlockError::usage(format!("{} operand of {} has no smali form", info.name, index.raw())));
            }
        });
    }
    if let Some(p) = &op.proto
    {
        out.proto = Some(ids.proto_key(p.require(&ids.protos)?)?);
    }
    Ok(out)
}

fn debug_to_smali(kind: &DebugEventKind, frame: Frame) -> SmaliCode
{
    match kind
    {
        DebugEventKind::Line(l) => SmaliCode::Line(*l),
        DebugEventKind::StartLocal { register, name, local_type, signature } => SmaliCode::Local {
            register: frame.register(*register as u16),
            name: name.clone(),
            local_type: local_type.clone(),
            signature: signature.clone(),
        },
        DebugEventKind::EndLocal(r) => SmaliCode::EndLocal(frame.register(*r as u16)),
        DebugEventKind::RestartLocal(r) => SmaliCode::RestartLocal(frame.register(*r as u16)),
        DebugEventKind::PrologueEnd => SmaliCode::PrologueEnd,
        DebugEventKind::EpilogueBegin => SmaliCode::EpilogueBegin,
        DebugEventKind::SetFile(name) => SmaliCode::Source(name.clone()),
    }
}

fn array_elements(element_width: u16, data: &[u8]) -> BlockResult<Vec<i64>>
{
    let width = element_width as usize;
    if !matches!(width, 1 | 2 | 4 | 8)
    {
        fail!("array-data element width {}", element_width);
    }
    Ok(data
        .chunks_exact(width)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes[..width].copy_from_slice(chunk);
            let shift = 64 - 8 * width as u32;
            (i64::from_le_bytes(bytes) << shift) >> shift
        })
        .collect())
}

fn code_to_smali(ids: &IdPools, code: &CodeItem, debug: Option<&DebugInfo>, options: &SmaliOptions) -> BlockResult<Vec<SmaliCode>>
{
    let frame = Frame { registers: code.registers, ins: code.ins };
    let end = code.code_units();
    let address = |id: InsId| -> BlockResult<u32> {
        match code.address_of(id)
        {
            Some(a) => Ok(a),
            None => Err(BlockError::resolution(format!("instruction {:?} has no address", id))),
        }
    };

    let mut labels = Labels::default();
    let mut branch_labels: HashMap<InsId, String> = HashMap::new();
    let mut case_labels: HashMap<InsId, Vec<String>> = HashMap::new();
    for ins in code.instructions()
    {
        match &ins.body
        {
            InsBody::Op(op) => match op.target
            {
                Some(Target::Ins(t)) => {
                    let name = labels.add(branch_prefix(op.info()?.name), address(t)?);
                    branch_labels.insert(ins.id, name);
                }
                Some(Target::Relative(offset)) => {
                    return Err(BlockError::usage(format!("branch at {:?} to offset {} does not land on an instruction", ins.id, offset)));
                }
                None => {}
            },
            InsBody::PackedSwitch { targets, .. } | InsBody::SparseSwitch { targets, .. } => {
                let prefix = if matches!(ins.body, InsBody::PackedSwitch { .. }) { "pswitch" } else { "sswitch" };
                let mut names = Vec::with_capacity(targets.len());
                for t in targets
                {
                    match t
                    {
                        Target::Ins(t) => names.push(labels.add(prefix, address(*t)?)),
                        Target::Relative(_) => break,
                    }
                }
                if names.len() == targets.len()
                {
                    case_labels.insert(ins.id, names);
                }
            }
            InsBody::ArrayData { .. } => {}
        }
    }

    let mut catches: BTreeMap<u32, Vec<SmaliCatch>> = BTreeMap::new();
    for t in &code.tries
    {
        let handler = match code.handlers.get(t.handler)
        {
            Some(h) => h,
            None => fail!("try block names handler {} of {}", t.handler, code.handlers.len()),
        };
        let start = labels.add("try_start", address(t.start)?);
        let end_address = match t.end
        {
            Some(e) => address(e)?,
            None => end,
        };
        let end_label = labels.add("try_end", end_address);
        let list = catches.entry(end_address).or_default();
        for p in &handler.pairs
        {
            list.push(SmaliCatch {
                exception: Some(ids.type_descriptor(&p.exception)?.to_string()),
                start: start.clone(),
                end: end_label.clone(),
                handler: labels.add("catch", address(p.handler)?),
            });
        }
        if let Some(all) = handler.catch_all
        {
            list.push(SmaliCatch { exception: None, start: start.clone(), end: end_label.clone(), handler: labels.add("catchall", address(all)?) });
        }
    }

    let events = match debug
    {
        Some(d) => d.events(ids)?,
        None => Vec::new(),
    };
    let mut events = events.iter().peekable();

    let mut out = Vec::new();
    for ins in code.instructions()
    {
        let at = address(ins.id)?;
        out.extend(labels.take(at));
        out.extend(catches.remove(&at).unwrap_or_default().into_iter().map(SmaliCode::Catch));
        while let Some(e) = events.next_if(|e| e.address <= at)
        {
            out.push(debug_to_smali(&e.kind, frame));
        }
        if options.comment_addresses
        {
            out.push(SmaliCode::Comment(format!("0x{:04x}", at)));
        }
        match &ins.body
        {
            InsBody::Op(op) => {
                let label = branch_labels.remove(&ins.id);
                out.push(SmaliCode::Instruction(operation_to_smali(ids, op, frame, label)?));
            }
            InsBody::PackedSwitch { first_key, .. } => match case_labels.remove(&ins.id)
            {
                Some(targets) => out.push(SmaliCode::PackedSwitch { first_key: *first_key, targets }),
                None => warn!("packed-switch payload at 0x{:x} has no switch; dropped", at),
            },
            InsBody::SparseSwitch { keys, .. } => match case_labels.remove(&ins.id)
            {
                Some(targets) => out.push(SmaliCode::SparseSwitch(keys.iter().copied().zip(targets).collect())),
                None => warn!("sparse-switch payload at 0x{:x} has no switch; dropped", at),
            },
            InsBody::ArrayData { element_width, data } => {
                out.push(SmaliCode::ArrayData { element_width: *element_width, elements: array_elements(*element_width, data)? });
            }
        }
    }
    out.extend(labels.take(end));
    out.extend(catches.remove(&end).unwrap_or_default().into_iter().map(SmaliCode::Catch));
    out.extend(events.map(|e| debug_to_smali(&e.kind, frame)));
    Ok(out)
}

impl DexFile
{
    pub fn class_to_smali(&self, index: usize) -> BlockResult<SmaliClass>
    {
        self.class_to_smali_with(index, &SmaliOptions::default())
    }

    /// The class at `index` of the class definitions as smali.
    pub fn class_to_smali_with(&self, index: usize, options: &SmaliOptions) -> BlockResult<SmaliClass>
    {
        let def = self.class_defs.get(index)?;
        let ids = &self.ids;
        let mut class = SmaliClass::new(def.descriptor(ids)?);
        class.access_flags = def.access_flags;
        class.superclass = def.superclass(ids)?.map(str::to_string);
        class.source = def.source_file(ids)?.map(str::to_string);
        class.interfaces = ids.type_list(&def.interfaces)?;

        let directory = def.annotations.item(&self.annotations.directories)?;
        if let Some(dir) = directory
        {
            if let Some(set) = dir.class_annotations.get(&self.annotations.sets)?
            {
                class.annotations = self.smali_annotations(set)?;
            }
        }
        let data = match def.class_data.item(&self.class_data)?
        {
            Some(d) => d,
            None => return Ok(class),
        };
        let static_values: &[EncodedValue] = match def.static_values.item(&self.encoded_arrays)?
        {
            Some(a) => a.values.as_slice(),
            None => &[],
        };
        for (i, f) in data.static_fields.iter().enumerate()
        {
            class.fields.push(self.smali_field(f, static_values.get(i), directory)?);
        }
        for f in &data.instance_fields
        {
            class.fields.push(self.smali_field(f, None, directory)?);
        }
        for m in data.methods()
        {
            let method = self.smali_method(m, directory, options).map_err(|e| err!(e, "class {}", class.descriptor))?;
            class.methods.push(method);
        }
        Ok(class)
    }

    fn smali_annotations(&self, set: ItemId<AnnotationSet>) -> BlockResult<Vec<SmaliAnnotation>>
    {
        let mut out = Vec::new();
        for item in self.annotations.set_items(set)?
        {
            out.push(SmaliAnnotation {
                visibility: item.visibility,
                annotation_type: self.ids.type_descriptor(&item.annotation.annotation_type)?.to_string(),
                elements: elements_to_smali(&self.ids, &item.annotation.elements)?,
            });
        }
        Ok(out)
    }

    fn smali_field(&self, field: &EncodedField, value: Option<&EncodedValue>, directory: Option<&AnnotationsDirectory>) -> BlockResult<SmaliField>
    {
        let id = field.field.require(&self.ids.fields)?;
        let key = self.ids.field_key(id)?;
        let mut annotations = Vec::new();
        for fa in directory.map_or(&[][..], |d| d.fields.as_slice())
        {
            if fa.field.get(&self.ids.fields)? == Some(id)
            {
                if let Some(set) = fa.annotations.get(&self.annotations.sets)?
                {
                    annotations = self.smali_annotations(set)?;
                }
            }
        }
        let initial_value = match value
        {
            Some(v) => Some(value_to_smali(&self.ids, v)?),
            None => None,
        };
        Ok(SmaliField { name: key.name, field_type: key.field_type, access_flags: field.access_flags, initial_value, annotations })
    }

    fn smali_method(&self, method: &EncodedMethod, directory: Option<&AnnotationsDirectory>, options: &SmaliOptions) -> BlockResult<SmaliMethod>
    {
        let id = method.method.require(&self.ids.methods)?;
        let key = self.ids.method_key(id)?;
        let mut out = SmaliMethod {
            name: key.name,
            proto: key.proto,
            access_flags: method.access_flags,
            locals: None,
            parameters: Vec::new(),
            annotations: Vec::new(),
            code: Vec::new(),
        };

        let mut parameter_annotations: Vec<Vec<SmaliAnnotation>> = Vec::new();
        if let Some(dir) = directory
        {
            for ma in &dir.methods
            {
                if ma.method.get(&self.ids.methods)? == Some(id)
                {
                    if let Some(set) = ma.annotations.get(&self.annotations.sets)?
                    {
                        out.annotations = self.smali_annotations(set)?;
                    }
                }
            }
            for pa in &dir.parameters
            {
                if pa.method.get(&self.ids.methods)? != Some(id)
                {
                    continue;
                }
                if let Some(list) = pa.annotations.item(&self.annotations.ref_lists)?
                {
                    for l in &list.lists
                    {
                        parameter_annotations.push(match l.get(&self.annotations.sets)?
                        {
                            Some(set) => self.smali_annotations(set)?,
                            None => Vec::new(),
                        });
                    }
                }
            }
        }

        let mut names: Vec<Option<String>> = Vec::new();
        if let Some(code) = self.code_of(method)?
        {
            let refreshed;
            let code = if code.code_units() == 0 && !code.instructions().is_empty()
            {
                let mut copy = code.clone();
                copy.refresh(&self.ids)?;
                refreshed = copy;
                &refreshed
            }
            else
            {
                code
            };
            let debug_info = code.debug_info.item(&self.debug_infos)?;
            if let Some(d) = debug_info
            {
                for n in &d.parameter_names
                {
                    names.push(self.ids.optional_string(n)?.map(str::to_string));
                }
            }
            out.locals = Some(code.registers.saturating_sub(code.ins));
            out.code = code_to_smali(&self.ids, code, debug_info, options).map_err(|e| err!(e, "method {}", out.name))?;
        }

        for i in 0..out.proto.parameters.len()
        {
            let name = names.get(i).cloned().flatten();
            let annotations = parameter_annotations.get(i).cloned().unwrap_or_default();
            if name.is_some() || !annotations.is_empty()
            {
                let register = out.parameter_register(i);
                out.parameters.push(SmaliParameter { register, name, annotations });
            }
        }
        Ok(out)
    }
}

/// Where a label, debug event or try bound sits: at an instruction or past the last one.
type Anchor = Option<InsId>;

/// Builds a code item from smali lines in two passes: instructions first,
/// then label fixups once every label is anchored.
struct Assembler<'a>
{
    method: &'a SmaliMethod,
    code: CodeItem,
    labels: HashMap<&'a str, Anchor>,
    pending_labels: Vec<&'a str>,
    pending_events: Vec<DebugEventKind>,
    events: Vec<(Anchor, DebugEventKind)>,
    branches: Vec<(InsId, &'a str)>,
    cases: Vec<(InsId, &'a [String])>,
    sparse_cases: Vec<(InsId, Vec<&'a str>)>,
    catches: Vec<&'a SmaliCatch>,
}

impl<'a> Assembler<'a>
{
    fn new(method: &'a SmaliMethod, locals: u16) -> BlockResult<Assembler<'a>>
    {
        let ins = method.ins();
        let registers = match locals.checked_add(ins)
        {
            Some(r) => r,
            None => return Err(BlockError::usage(format!("{} locals and {} parameter registers overflow the frame", locals, ins))),
        };
        Ok(Assembler {
            method,
            code: CodeItem::new(registers, ins, 0),
            labels: HashMap::new(),
            pending_labels: Vec::new(),
            pending_events: Vec::new(),
            events: Vec::new(),
            branches: Vec::new(),
            cases: Vec::new(),
            sparse_cases: Vec::new(),
            catches: Vec::new(),
        })
    }

    fn anchor(&mut self, at: Anchor)
    {
        for l in self.pending_labels.drain(..)
        {
            self.labels.insert(l, at);
        }
        for e in self.pending_events.drain(..)
        {
            self.events.push((at, e));
        }
    }

    fn push(&mut self, body: InsBody) -> InsId
    {
        let id = self.code.push(body);
        self.anchor(Some(id));
        id
    }

    fn resolve(&self, register: Register) -> BlockResult<u16>
    {
        register.resolve(self.code.registers, self.code.ins)
    }

    fn label(&self, name: &str) -> BlockResult<Anchor>
    {
        match self.labels.get(name)
        {
            Some(a) => Ok(*a),
            None => Err(BlockError::usage(format!("undefined label :{}", name))),
        }
    }

    fn target(&self, name: &str) -> BlockResult<InsId>
    {
        match self.label(name)?
        {
            Some(id) => Ok(id),
            None => Err(BlockError::usage(format!("label :{} is past the last instruction", name))),
        }
    }

    fn operation(&mut self, ids: &mut IdPools, ins: &SmaliInstruction) -> BlockResult<Operation>
    {
        let info = match opcode_by_name(&ins.name)
        {
            Some(o) => o,
            None => return Err(BlockError::usage(format!("unknown instruction {}", ins.name))),
        };
        let layout = OperandLayout::of(info);
        let mut op = Operation::new(info.value);
        for r in &ins.registers
        {
            op.regs.push(self.resolve(*r)?);
        }
        let count_ok = match layout.registers
        {
            RegisterForm::Plain(n) => op.regs.len() == n,
            RegisterForm::List => op.regs.len() <= 5,
            RegisterForm::Range => op.regs.windows(2).all(|w| w[1] == w[0].wrapping_add(1)),
        };
        if !count_ok
        {
            return Err(BlockError::usage(format!("{} cannot take registers {:?}", ins.name, ins.registers)));
        }
        if layout.literal
        {
            match ins.literal
            {
                Some(l) => op.literal = l,
                None => return Err(BlockError::usage(format!("{} needs a literal", ins.name))),
            }
        }
        op.index = match &ins.reference
        {
            None => None,
            Some(SmaliReference::String(s)) => Some(IndexOperand::String(IndexReference::to(RefWidth::Int, ids.get_or_create_string(s)))),
            Some(SmaliReference::Type(t)) => Some(IndexOperand::Type(IndexReference::to(RefWidth::Int, ids.get_or_create_type(t)))),
            Some(SmaliReference::Field(f)) => Some(IndexOperand::Field(IndexReference::to(RefWidth::Int, ids.get_or_create_field(f)))),
            Some(SmaliReference::Method(m)) => Some(IndexOperand::Method(IndexReference::to(RefWidth::Int, ids.get_or_create_method(m)))),
            Some(SmaliReference::Proto(p)) => Some(IndexOperand::Proto(IndexReference::to(RefWidth::Int, ids.get_or_create_proto(p)))),
        };
        let kind = op.index.as_ref().map_or(ReferenceKind::None, |i| i.kind());
        if kind != info.reference
        {
            return Err(BlockError::usage(format!("{} takes a {:?} reference, not {:?}", ins.name, info.reference, kind)));
        }
        if layout.proto
        {
            match &ins.proto
            {
                Some(p) => op.proto = Some(IndexReference::to(RefWidth::Int, ids.get_or_create_proto(p))),
                None => return Err(BlockError::usage(format!("{} needs a prototype", ins.name))),
            }
        }
        if layout.label && ins.label.is_none()
        {
            return Err(BlockError::usage(format!("{} needs a label", ins.name)));
        }
        Ok(op)
    }

    fn debug_event(&self, code: &SmaliCode) -> BlockResult<Option<DebugEventKind>>
    {
        Ok(Some(match code
        {
            SmaliCode::Line(l) => DebugEventKind::Line(*l),
            SmaliCode::Local { register, name, local_type, signature } => DebugEventKind::StartLocal {
                register: self.resolve(*register)? as u32,
                name: name.clone(),
                local_type: local_type.clone(),
                signature: signature.clone(),
            },
            SmaliCode::EndLocal(r) => DebugEventKind::EndLocal(self.resolve(*r)? as u32),
            SmaliCode::RestartLocal(r) => DebugEventKind::RestartLocal(self.resolve(*r)? as u32),
            SmaliCode::PrologueEnd => DebugEventKind::PrologueEnd,
            SmaliCode::EpilogueBegin => DebugEventKind::EpilogueBegin,
            SmaliCode::Source(name) => DebugEventKind::SetFile(name.clone()),
            _ => return Ok(None),
        }))
    }

    /// First pass: lay down instructions, anchoring labels and debug events.
    fn collect(&mut self, ids: &mut IdPools) -> BlockResult<()>
    {
        let method = self.method;
        for line in &method.code
        {
            if let Some(event) = self.debug_event(line)?
            {
                self.pending_events.push(event);
                continue;
            }
            match line
            {
                SmaliCode::Label(name) => self.pending_labels.push(name),
                SmaliCode::Catch(c) => self.catches.push(c),
                SmaliCode::Comment(_) => {}
                SmaliCode::Instruction(ins) => {
                    let op = self.operation(ids, ins)?;
                    let outs = if ins.name.starts_with("invoke-") { op.regs.len() as u16 } else { 0 };
                    self.code.outs = self.code.outs.max(outs);
                    let id = self.push(InsBody::Op(op));
                    if let Some(l) = &ins.label
                    {
                        self.branches.push((id, l.as_str()));
                    }
                }
                SmaliCode::PackedSwitch { first_key, targets } => {
                    let id = self.push(InsBody::PackedSwitch { first_key: *first_key, targets: vec![Target::Relative(0); targets.len()] });
                    self.cases.push((id, targets.as_slice()));
                }
                SmaliCode::SparseSwitch(entries) => {
                    let keys = entries.iter().map(|(k, _)| *k).collect();
                    let id = self.push(InsBody::SparseSwitch { keys, targets: vec![Target::Relative(0); entries.len()] });
                    self.sparse_cases.push((id, entries.iter().map(|(_, t)| t.as_str()).collect()));
                }
                SmaliCode::ArrayData { element_width, elements } => {
                    let width = *element_width as usize;
                    if !matches!(width, 1 | 2 | 4 | 8)
                    {
                        return Err(BlockError::usage(format!("array-data element width {}", element_width)));
                    }
                    let mut data = Vec::with_capacity(width * elements.len());
                    for e in elements
                    {
                        data.extend_from_slice(&e.to_le_bytes()[..width]);
                    }
                    self.push(InsBody::ArrayData { element_width: *element_width, data });
                }
                _ => {}
            }
        }
        self.anchor(None);
        Ok(())
    }

    /// Second pass: point branches, switch cases and try blocks at their instructions.
    fn link(&mut self, ids: &mut IdPools) -> BlockResult<()>
    {
        for (id, label) in std::mem::take(&mut self.branches)
        {
            let target = self.target(label)?;
            if let Some(op) = self.code.instruction_mut(id).and_then(|i| i.operation_mut())
            {
                op.target = Some(Target::Ins(target));
            }
        }
        for (id, labels) in std::mem::take(&mut self.cases)
        {
            let resolved = labels.iter().map(|l| self.target(l).map(Target::Ins)).collect::<BlockResult<Vec<_>>>()?;
            if let Some(InsBody::PackedSwitch { targets, .. }) = self.code.instruction_mut(id).map(|i| &mut i.body)
            {
                *targets = resolved;
            }
        }
        for (id, labels) in std::mem::take(&mut self.sparse_cases)
        {
            let resolved = labels.iter().map(|l| self.target(l).map(Target::Ins)).collect::<BlockResult<Vec<_>>>()?;
            if let Some(InsBody::SparseSwitch { targets, .. }) = self.code.instruction_mut(id).map(|i| &mut i.body)
            {
                *targets = resolved;
            }
        }

        let mut groups: Vec<((InsId, Anchor), CatchHandler)> = Vec::new();
        for c in std::mem::take(&mut self.catches)
        {
            let range = (self.target(&c.start)?, self.label(&c.end)?);
            let handler = self.target(&c.handler)?;
            let position = match groups.iter().position(|(r, _)| *r == range)
            {
                Some(p) => p,
                None => {
                    groups.push((range, CatchHandler::default()));
                    groups.len() - 1
                }
            };
            let group = &mut groups[position].1;
            match &c.exception
            {
                Some(t) => group.pairs.push(CatchPair { exception: IndexReference::to(RefWidth::Uleb, ids.get_or_create_type(t)), handler }),
                None => group.catch_all = Some(handler),
            }
        }
        for (i, ((start, end), handler)) in groups.into_iter().enumerate()
        {
            self.code.tries.push(TryBlock { start, end, handler: i });
            self.code.handlers.push(handler);
        }
        Ok(())
    }

    /// Lays the code out and encodes its debug events and parameter names.
    fn finish(mut self, ids: &mut IdPools) -> BlockResult<(CodeItem, Option<DebugInfo>)>
    {
        self.code.refresh(ids)?;
        let mut tries = std::mem::take(&mut self.code.tries);
        tries.sort_by_key(|t| self.code.address_of(t.start));
        self.code.tries = tries;

        let end = self.code.code_units();
        let events: Vec<DebugEvent> = self
            .events
            .iter()
            .map(|(at, kind)| DebugEvent { address: at.and_then(|id| self.code.address_of(id)).unwrap_or(end), kind: kind.clone() })
            .collect();
        let method = self.method;
        let names: Vec<Option<String>> = (0..method.proto.parameters.len())
            .map(|i| method.parameters.iter().find(|p| method.parameter_index(p.register) == Some(i)).and_then(|p| p.name.clone()))
            .collect();
        if events.is_empty() && names.iter().all(Option::is_none)
        {
            return Ok((self.code, None));
        }
        let info = DebugInfo::from_events(ids, &names, &events);
        Ok((self.code, Some(info)))
    }
}

impl DexFile
{
    /// Defines the class described by `class`: its fields with their static
    /// values, its methods with assembled code, and every annotation.
    pub fn add_class(&mut self, class: &SmaliClass) -> BlockResult<ItemId<ClassDef>>
    {
        let descriptor = class.descriptor.as_str();
        let id = self.create_class(descriptor, class.access_flags, class.superclass.as_deref(), &class.interfaces)?;
        if class.source.is_some()
        {
            self.set_source_file(id, class.source.as_deref())?;
        }
        let mut directory = None;
        if !class.annotations.is_empty()
        {
            let set = self.annotation_set(&class.annotations)?;
            let dir = self.directory_of(id, &mut directory)?;
            self.annotations.directories.item_mut(dir)?.class_annotations = OffsetReference::to(RefWidth::Int, set);
        }

        for f in &class.fields
        {
            let key = f.key(descriptor);
            if f.initial_value.is_some() && !f.is_static()
            {
                warn!("initial value of instance field {} ignored", f.name);
            }
            let value = match &f.initial_value
            {
                Some(v) if f.is_static() => Some(value_from_smali(&mut self.ids, v)?),
                _ => None,
            };
            let field = self.add_field(id, &key, f.access_flags, value)?;
            if !f.annotations.is_empty()
            {
                let set = self.annotation_set(&f.annotations)?;
                let dir = self.directory_of(id, &mut directory)?;
                self.annotations.attach_field(&self.ids, dir, descriptor, field, set)?;
            }
        }

        for m in &class.methods
        {
            let key = m.key(descriptor);
            let code = match m.locals
            {
                Some(locals) => Some(self.assemble(m, locals).map_err(|e| err!(e, "method {}", m.name))?),
                None => None,
            };
            let method = self.add_method(id, &key, m.access_flags, code)?;
            if !m.annotations.is_empty()
            {
                let set = self.annotation_set(&m.annotations)?;
                let dir = self.directory_of(id, &mut directory)?;
                self.annotations.attach_method(&self.ids, dir, descriptor, method, set)?;
            }
            if m.parameters.iter().any(|p| !p.annotations.is_empty())
            {
                let mut sets = vec![None; m.proto.parameters.len()];
                for p in m.parameters.iter().filter(|p| !p.annotations.is_empty())
                {
                    let index = match m.parameter_index(p.register)
                    {
                        Some(i) => i,
                        None => return Err(BlockError::usage(format!("{} of {} is not a parameter register", p.register, m.name))),
                    };
                    sets[index] = Some(self.annotation_set(&p.annotations)?);
                }
                let list = self.annotations.add_ref_list(&sets);
                let dir = self.directory_of(id, &mut directory)?;
                self.annotations.attach_parameters(&self.ids, dir, descriptor, method, list)?;
            }
        }
        debug!("added class {} with {} fields and {} methods", descriptor, class.fields.len(), class.methods.len());
        Ok(id)
    }

    fn annotation_set(&mut self, annotations: &[SmaliAnnotation]) -> BlockResult<ItemId<AnnotationSet>>
    {
        let mut items = Vec::with_capacity(annotations.len());
        for a in annotations
        {
            let encoded = annotation_from_smali(&mut self.ids, &a.annotation_type, &a.elements)?;
            items.push(self.annotations.add_item(a.visibility, encoded));
        }
        Ok(self.annotations.add_set(&items))
    }

    fn directory_of(&mut self, class: ItemId<ClassDef>, cached: &mut Option<ItemId<AnnotationsDirectory>>) -> BlockResult<ItemId<AnnotationsDirectory>>
    {
        if let Some(dir) = cached
        {
            return Ok(*dir);
        }
        let dir = self.annotations.directories.push(AnnotationsDirectory::default());
        self.class_defs.item_mut(class)?.annotations = OffsetReference::to(RefWidth::Int, dir);
        *cached = Some(dir);
        Ok(dir)
    }

    fn assemble(&mut self, method: &SmaliMethod, locals: u16) -> BlockResult<CodeItem>
    {
        let mut assembler = Assembler::new(method, locals)?;
        assembler.collect(&mut self.ids)?;
        assembler.link(&mut self.ids)?;
        let (mut code, info) = assembler.finish(&mut self.ids)?;
        if let Some(info) = info
        {
            code.debug_info = OffsetReference::to(RefWidth::Int, self.debug_infos.push(info));
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smali::parse::parse_class;

    const CLASS: &str = r#"
.class public LCounter;
.super Ljava/lang/Object;
.source "Counter.java"

.annotation runtime LMarker;
    level = 0x2
.end annotation

.field public static final START:I = 0x5

.field private count:I

.method public constructor <init>()V
    .locals 0
    invoke-direct {p0}, Ljava/lang/Object;-><init>()V
    return-void
.end method

.method public static describe(I)Ljava/lang/String;
    .locals 1
    .param p0, "which"
        .annotation runtime LNotNull;
        .end annotation
    .end param

    .line 10
    :try_start_0
    packed-switch p0, :pswitch_data_0
    const-string v0, "other"
    :goto_0
    return-object v0
    :pswitch_0
    const-string v0, "zero"
    goto :goto_0
    :pswitch_1
    const-string v0, "one"
    goto :goto_0
    :try_end_0
    .catch Ljava/lang/RuntimeException; {:try_start_0 .. :try_end_0} :catch_0

    :catch_0
    const/4 v0, 0x0
    return-object v0

    :pswitch_data_0
    .packed-switch 0x0
        :pswitch_0
        :pswitch_1
    .end packed-switch
.end method
"#;

    fn counter() -> DexFile {
        let mut dex = DexFile::new();
        dex.add_class(&parse_class(CLASS).unwrap()).unwrap();
        dex
    }

    fn method<'c>(class: &'c SmaliClass, name: &str) -> &'c SmaliMethod {
        class.methods.iter().find(|m| m.name == name).unwrap()
    }

    #[test]
    fn assembled_class_converts_back() {
        let dex = counter();
        let class = dex.class_to_smali(0).unwrap();
        assert_eq!(class.descriptor, "LCounter;");
        assert_eq!(class.source.as_deref(), Some("Counter.java"));
        assert_eq!(class.annotations[0].elements[0].value, SmaliValue::Int(2));
        assert_eq!(class.fields[0].initial_value, Some(SmaliValue::Int(5)));
        assert_eq!(class.fields[1].initial_value, None);

        let describe = method(&class, "describe");
        assert_eq!(describe.locals, Some(1));
        assert_eq!(describe.parameters.len(), 1);
        assert_eq!(describe.parameters[0].name.as_deref(), Some("which"));
        assert_eq!(describe.parameters[0].annotations[0].annotation_type, "LNotNull;");
        assert_eq!(describe.code.iter().filter(|c| matches!(c, SmaliCode::Instruction(_))).count(), 9);
        assert!(describe.code.contains(&SmaliCode::Line(10)));
        assert!(describe.code.iter().any(|c| matches!(c, SmaliCode::PackedSwitch { first_key: 0, targets } if targets.len() == 2)));
        let catch = describe
            .code
            .iter()
            .find_map(|c| match c {
                SmaliCode::Catch(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(catch.exception.as_deref(), Some("Ljava/lang/RuntimeException;"));
        assert!(describe.code.contains(&SmaliCode::Label(catch.handler.clone())));
    }

    #[test]
    fn parameters_map_to_p_registers() {
        let dex = counter();
        let class = dex.class_to_smali(0).unwrap();
        let init = method(&class, "<init>");
        match &init.code[0] {
            SmaliCode::Instruction(i) => assert_eq!(i.registers, vec![Register::Param(0)]),
            other => panic!("unexpected {:?}", other),
        }
        let describe = method(&class, "describe");
        let switch = describe
            .code
            .iter()
            .find_map(|c| match c {
                SmaliCode::Instruction(i) if i.name == "packed-switch" => Some(i),
                _ => None,
            })
            .unwrap();
        assert_eq!(switch.registers, vec![Register::Param(0)]);
        assert_eq!(switch.label.as_deref(), Some("pswitch_data_e"));
    }

    #[test]
    fn converted_text_reassembles_identically() {
        let dex = counter();
        let class = dex.class_to_smali(0).unwrap();
        let text = class.to_smali();
        let reparsed = parse_class(&text).unwrap();
        assert_eq!(reparsed, class);

        let mut again = DexFile::new();
        again.add_class(&reparsed).unwrap();
        assert_eq!(again.class_to_smali(0).unwrap(), class);
    }

    #[test]
    fn class_survives_the_binary_form() {
        let mut dex = counter();
        let class = dex.class_to_smali(0).unwrap();
        let bytes = dex.to_bytes().unwrap();
        let read = DexFile::from_bytes(&bytes).unwrap();
        assert_eq!(read.class_to_smali(0).unwrap(), class);
    }

    #[test]
    fn address_comments_are_optional() {
        let dex = counter();
        let options = SmaliOptions { comment_addresses: true, ..SmaliOptions::default() };
        let class = dex.class_to_smali_with(0, &options).unwrap();
        let init = method(&class, "<init>");
        assert_eq!(init.code[0], SmaliCode::Comment("0x0000".to_string()));
        assert_eq!(init.code[2], SmaliCode::Comment("0x0003".to_string()));
    }

    #[test]
    fn undefined_labels_are_rejected() {
        let mut class = SmaliClass::new("LBroken;");
        let mut goto = SmaliInstruction::new("goto");
        goto.label = Some("nowhere".to_string());
        class.methods.push(SmaliMethod {
            name: "f".to_string(),
            proto: crate::dex::key::ProtoKey::new(vec![], "V"),
            access_flags: crate::dex::class::ACC_STATIC,
            locals: Some(0),
            parameters: vec![],
            annotations: vec![],
            code: vec![SmaliCode::Instruction(goto)],
        });
        let err = DexFile::new().add_class(&class).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn narrow_literals_widen_const() {
        let text = ".class LK;\n.method static k()I\n    .locals 1\n    const/4 v0, 0x12345\n    return v0\n.end method\n";
        let mut dex = DexFile::new();
        dex.add_class(&parse_class(text).unwrap()).unwrap();
        let class = dex.class_to_smali(0).unwrap();
        match &class.methods[0].code[0] {
            SmaliCode::Instruction(i) => {
                assert_eq!(i.name, "const");
                assert_eq!(i.literal, Some(0x12345));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
