/* The smali text model: classes, members, code lines and values */

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::error::{BlockError, BlockResult};
use crate::dex::class::ACC_STATIC;
use crate::dex::key::{FieldKey, MethodKey, ProtoKey};
use crate::dex::opcode::{Format, Opcode, ReferenceKind};

/// A register as written in smali: `v` registers count from the bottom of
/// the frame, `p` registers from the first parameter register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register
{
    Local(u16),
    Param(u16),
}

impl Register
{
    /// Frame register number in a frame of `registers` whose last `ins` hold the parameters.
    pub fn resolve(&self, registers: u16, ins: u16) -> BlockResult<u16>
    {
        match *self
        {
            Register::Local(r) if r < registers => Ok(r),
            Register::Param(p) if p < ins => Ok(registers - ins + p),
            _ => Err(BlockError::usage(format!("register {} is outside a frame of {} registers with {} ins", self, registers, ins))),
        }
    }

    /// The smali spelling of frame register `reg`, using `p` for parameter registers.
    pub fn from_frame(reg: u16, registers: u16, ins: u16) -> Register
    {
        let first_param = registers.saturating_sub(ins);
        if ins > 0 && reg >= first_param
        {
            Register::Param(reg - first_param)
        }
        else
        {
            Register::Local(reg)
        }
    }
}

impl fmt::Display for Register
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self
        {
            Register::Local(r) => write!(f, "v{}", r),
            Register::Param(p) => write!(f, "p{}", p),
        }
    }
}

/// The pool operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmaliReference
{
    String(String),
    Type(String),
    Field(FieldKey),
    Method(MethodKey),
    Proto(ProtoKey),
}

/// One instruction line. Operands are laid out by the opcode's format:
/// registers, then the literal, branch label, pool reference and prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmaliInstruction
{
    pub name: String,
    /// Every register of the instruction; a range form lists the whole range.
    pub registers: Vec<Register>,
    pub literal: Option<i64>,
    pub label: Option<String>,
    pub reference: Option<SmaliReference>,
    /// Prototype operand of `invoke-polymorphic`.
    pub proto: Option<ProtoKey>,
}

impl SmaliInstruction
{
    pub fn new(name: &str) -> SmaliInstruction
    {
        SmaliInstruction { name: name.to_string(), registers: Vec::new(), literal: None, label: None, reference: None, proto: None }
    }
}

/// How an instruction's registers are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterForm
{
    Plain(usize),
    List,
    Range,
}

/// The operands an opcode's format carries, in text order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperandLayout
{
    pub registers: RegisterForm,
    pub literal: bool,
    pub wide: bool,
    pub label: bool,
    pub reference: bool,
    pub proto: bool,
}

impl OperandLayout
{
    pub fn of(opcode: &Opcode) -> OperandLayout
    {
        use Format::*;
        let registers = match opcode.format
        {
            Format10x | Format10t | Format20t | Format30t => RegisterForm::Plain(0),
            Format11n | Format11x | Format21c | Format21ih | Format21lh | Format21s | Format21t | Format31c | Format31i | Format31t | Format51l => {
                RegisterForm::Plain(1)
            }
            Format12x | Format22b | Format22c | Format22s | Format22t | Format22x | Format32x => RegisterForm::Plain(2),
            Format23x => RegisterForm::Plain(3),
            Format35c | Format45cc => RegisterForm::List,
            Format3rc | Format4rcc => RegisterForm::Range,
        };
        OperandLayout {
            registers,
            literal: matches!(opcode.format, Format11n | Format21ih | Format21lh | Format21s | Format22b | Format22s | Format31i | Format51l),
            wide: matches!(opcode.format, Format21lh | Format51l),
            label: opcode.format.has_target(),
            reference: opcode.reference != ReferenceKind::None,
            proto: matches!(opcode.format, Format45cc | Format4rcc),
        }
    }
}

/// A `.catch` or, without an exception type, `.catchall` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmaliCatch
{
    pub exception: Option<String>,
    pub start: String,
    pub end: String,
    pub handler: String,
}

/// One line, or one payload block, of a method body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmaliCode
{
    Label(String),
    Instruction(SmaliInstruction),
    Catch(SmaliCatch),
    Line(u32),
    Local
    {
        register: Register,
        name: Option<String>,
        local_type: Option<String>,
        signature: Option<String>,
    },
    EndLocal(Register),
    RestartLocal(Register),
    PrologueEnd,
    EpilogueBegin,
    Source(Option<String>),
    PackedSwitch
    {
        first_key: i32,
        targets: Vec<String>,
    },
    SparseSwitch(Vec<(i32, String)>),
    ArrayData
    {
        element_width: u16,
        elements: Vec<i64>,
    },
    Comment(String),
}

/// An encoded value as it appears in field initializers and annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SmaliValue
{
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Type(String),
    Field(FieldKey),
    Method(MethodKey),
    Enum(FieldKey),
    MethodType(ProtoKey),
    Array(Vec<SmaliValue>),
    SubAnnotation
    {
        annotation_type: String,
        elements: Vec<SmaliAnnotationElement>,
    },
    Null,
    Boolean(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliAnnotationElement
{
    pub name: String,
    pub value: SmaliValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliAnnotation
{
    pub visibility: u8,
    pub annotation_type: String,
    pub elements: Vec<SmaliAnnotationElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliField
{
    pub name: String,
    pub field_type: String,
    pub access_flags: u32,
    pub initial_value: Option<SmaliValue>,
    pub annotations: Vec<SmaliAnnotation>,
}

impl SmaliField
{
    pub fn key(&self, class: &str) -> FieldKey
    {
        FieldKey::new(class, &self.name, &self.field_type)
    }

    pub fn is_static(&self) -> bool
    {
        self.access_flags & ACC_STATIC != 0
    }
}

/// A `.param` directive: a parameter's debug name and its annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliParameter
{
    pub register: Register,
    pub name: Option<String>,
    pub annotations: Vec<SmaliAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliMethod
{
    pub name: String,
    pub proto: ProtoKey,
    pub access_flags: u32,
    /// Non-parameter registers; `None` for a method without code.
    pub locals: Option<u16>,
    pub parameters: Vec<SmaliParameter>,
    pub annotations: Vec<SmaliAnnotation>,
    pub code: Vec<SmaliCode>,
}

impl SmaliMethod
{
    pub fn key(&self, class: &str) -> MethodKey
    {
        MethodKey::new(class, &self.name, self.proto.clone())
    }

    pub fn is_static(&self) -> bool
    {
        self.access_flags & ACC_STATIC != 0
    }

    /// Registers taken by the parameters, `this` included.
    pub fn ins(&self) -> u16
    {
        (self.proto.parameter_registers() + if self.is_static() { 0 } else { 1 }) as u16
    }

    /// The `p` register of parameter `index`.
    pub fn parameter_register(&self, index: usize) -> Register
    {
        let skip: usize = self.proto.parameters[..index.min(self.proto.parameters.len())]
            .iter()
            .map(|p| if p == "J" || p == "D" { 2 } else { 1 })
            .sum();
        Register::Param((skip + if self.is_static() { 0 } else { 1 }) as u16)
    }

    /// The parameter whose first register is `register`.
    pub fn parameter_index(&self, register: Register) -> Option<usize>
    {
        (0..self.proto.parameters.len()).find(|i| self.parameter_register(*i) == register)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaliClass
{
    pub descriptor: String,
    pub access_flags: u32,
    pub superclass: Option<String>,
    pub source: Option<String>,
    pub interfaces: Vec<String>,
    pub annotations: Vec<SmaliAnnotation>,
    pub fields: Vec<SmaliField>,
    pub methods: Vec<SmaliMethod>,
}

impl SmaliClass
{
    pub fn new(descriptor: &str) -> SmaliClass
    {
        SmaliClass {
            descriptor: descriptor.to_string(),
            access_flags: 0,
            superclass: Some("Ljava/lang/Object;".to_string()),
            source: None,
            interfaces: Vec::new(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_registers_sit_at_the_top_of_the_frame() {
        assert_eq!(Register::Param(1).resolve(5, 2).unwrap(), 4);
        assert_eq!(Register::Local(2).resolve(5, 2).unwrap(), 2);
        assert_eq!(Register::from_frame(3, 5, 2), Register::Param(0));
        assert_eq!(Register::from_frame(3, 5, 0), Register::Local(3));
        assert!(Register::Param(2).resolve(5, 2).unwrap_err().is_usage());
    }

    #[test]
    fn wide_parameters_take_two_registers() {
        let method = SmaliMethod {
            name: "f".to_string(),
            proto: ProtoKey::new(vec!["J".to_string(), "I".to_string()], "V"),
            access_flags: 0,
            locals: Some(0),
            parameters: vec![],
            annotations: vec![],
            code: vec![],
        };
        assert_eq!(method.ins(), 4);
        assert_eq!(method.parameter_register(1), Register::Param(3));
        assert_eq!(method.parameter_index(Register::Param(1)), Some(0));
        assert_eq!(method.parameter_index(Register::Param(2)), None);
    }
}
