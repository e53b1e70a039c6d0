/* Emitting smali text */

use std::path::Path;

use crate::block::error::{BlockError, BlockResult};
use crate::dex::annotation::visibility_name;
use crate::dex::class::{access_names, MemberKind};
use crate::dex::opcode::opcode_by_name;
use crate::smali::model::{
    OperandLayout, RegisterForm, SmaliAnnotation, SmaliAnnotationElement, SmaliCatch, SmaliClass, SmaliCode, SmaliField, SmaliInstruction,
    SmaliMethod, SmaliParameter, SmaliReference, SmaliValue,
};
use crate::smali::SmaliOptions;

/// A text sink that indents every line it starts.
#[derive(Debug, Clone)]
pub struct SmaliWriter
{
    out: String,
    depth: usize,
    unit: String,
    at_line_start: bool,
}

impl Default for SmaliWriter
{
    fn default() -> Self
    {
        SmaliWriter::new()
    }
}

impl SmaliWriter
{
    pub fn new() -> SmaliWriter
    {
        SmaliWriter::with_options(&SmaliOptions::default())
    }

    pub fn with_options(options: &SmaliOptions) -> SmaliWriter
    {
        SmaliWriter { out: String::new(), depth: 0, unit: " ".repeat(options.indent), at_line_start: true }
    }

    /// Writes `text`, which must not contain line breaks.
    pub fn write(&mut self, text: &str) -> &mut Self
    {
        if text.is_empty()
        {
            return self;
        }
        if self.at_line_start
        {
            for _ in 0..self.depth
            {
                self.out.push_str(&self.unit);
            }
            self.at_line_start = false;
        }
        self.out.push_str(text);
        self
    }

    pub fn newline(&mut self) -> &mut Self
    {
        self.out.push('\n');
        self.at_line_start = true;
        self
    }

    pub fn line(&mut self, text: &str) -> &mut Self
    {
        self.write(text).newline()
    }

    pub fn indent(&mut self) -> &mut Self
    {
        self.depth += 1;
        self
    }

    pub fn dedent(&mut self) -> &mut Self
    {
        self.depth = self.depth.saturating_sub(1);
        self
    }

    pub fn as_str(&self) -> &str
    {
        &self.out
    }

    pub fn finish(self) -> String
    {
        self.out
    }
}

/// Anything with a canonical smali spelling.
pub trait SmaliAppend
{
    fn append(&self, writer: &mut SmaliWriter);
}

pub fn to_smali<T: SmaliAppend + ?Sized>(item: &T) -> String
{
    let mut writer = SmaliWriter::new();
    item.append(&mut writer);
    writer.finish()
}

pub fn to_smali_with<T: SmaliAppend + ?Sized>(item: &T, options: &SmaliOptions) -> String
{
    let mut writer = SmaliWriter::with_options(options);
    item.append(&mut writer);
    writer.finish()
}

fn escape_unit(out: &mut String, unit: u16, quote: char)
{
    match unit
    {
        0x0a => out.push_str("\\n"),
        0x0d => out.push_str("\\r"),
        0x09 => out.push_str("\\t"),
        0x08 => out.push_str("\\b"),
        0x0c => out.push_str("\\f"),
        0x5c => out.push_str("\\\\"),
        u if u == quote as u16 => {
            out.push('\\');
            out.push(quote);
        }
        0x20..=0x7e => out.push(unit as u8 as char),
        _ => out.push_str(&format!("\\u{:04x}", unit)),
    }
}

pub fn escape_string(text: &str) -> String
{
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for unit in text.encode_utf16()
    {
        escape_unit(&mut out, unit, '"');
    }
    out.push('"');
    out
}

pub fn escape_char(unit: u16) -> String
{
    let mut out = String::with_capacity(3);
    out.push('\'');
    escape_unit(&mut out, unit, '\'');
    out.push('\'');
    out
}

/// Signed hex, the way smali writes integer literals.
pub fn hex(value: i64) -> String
{
    if value < 0
    {
        format!("-0x{:x}", value.unsigned_abs())
    }
    else
    {
        format!("0x{:x}", value)
    }
}

fn float_text(value: f64, is_float: bool) -> String
{
    let suffix = if is_float { "f" } else { "" };
    if value.is_nan()
    {
        return format!("NaN{}", suffix);
    }
    if value.is_infinite()
    {
        let sign = if value < 0.0 { "-" } else { "" };
        return format!("{}Infinity{}", sign, suffix);
    }
    format!("{}{}", if is_float { format!("{:?}", value as f32) } else { format!("{:?}", value) }, suffix)
}

fn modifiers(flags: u32, kind: MemberKind) -> String
{
    let mut out = String::new();
    for name in access_names(flags, kind)
    {
        out.push_str(name);
        out.push(' ');
    }
    out
}

impl SmaliAppend for SmaliValue
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        match self
        {
            SmaliValue::Byte(v) => writer.write(&format!("{}t", hex(*v as i64))),
            SmaliValue::Short(v) => writer.write(&format!("{}s", hex(*v as i64))),
            SmaliValue::Char(v) => writer.write(&escape_char(*v)),
            SmaliValue::Int(v) => writer.write(&hex(*v as i64)),
            SmaliValue::Long(v) => writer.write(&format!("{}L", hex(*v))),
            SmaliValue::Float(v) => writer.write(&float_text(*v as f64, true)),
            SmaliValue::Double(v) => writer.write(&float_text(*v, false)),
            SmaliValue::String(s) => writer.write(&escape_string(s)),
            SmaliValue::Type(t) => writer.write(t),
            SmaliValue::Field(f) => writer.write(&f.to_string()),
            SmaliValue::Method(m) => writer.write(&m.to_string()),
            SmaliValue::Enum(f) => writer.write(&format!(".enum {}", f)),
            SmaliValue::MethodType(p) => writer.write(&p.to_string()),
            SmaliValue::Array(values) => {
                if values.is_empty()
                {
                    writer.write("{}");
                    return;
                }
                writer.write("{").newline().indent();
                for (i, v) in values.iter().enumerate()
                {
                    v.append(writer);
                    if i + 1 < values.len()
                    {
                        writer.write(",");
                    }
                    writer.newline();
                }
                writer.dedent().write("}")
            }
            SmaliValue::SubAnnotation { annotation_type, elements } => {
                writer.write(".subannotation ").line(annotation_type).indent();
                for e in elements
                {
                    e.append(writer);
                }
                writer.dedent().write(".end subannotation")
            }
            SmaliValue::Null => writer.write("null"),
            SmaliValue::Boolean(b) => writer.write(if *b { "true" } else { "false" }),
        };
    }
}

impl SmaliAppend for SmaliAnnotationElement
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        writer.write(&self.name).write(" = ");
        self.value.append(writer);
        writer.newline();
    }
}

impl SmaliAppend for SmaliAnnotation
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        writer.line(&format!(".annotation {} {}", visibility_name(self.visibility), self.annotation_type)).indent();
        for e in &self.elements
        {
            e.append(writer);
        }
        writer.dedent().line(".end annotation");
    }
}

impl SmaliAppend for SmaliReference
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        match self
        {
            SmaliReference::String(s) => writer.write(&escape_string(s)),
            SmaliReference::Type(t) => writer.write(t),
            SmaliReference::Field(f) => writer.write(&f.to_string()),
            SmaliReference::Method(m) => writer.write(&m.to_string()),
            SmaliReference::Proto(p) => writer.write(&p.to_string()),
        };
    }
}

impl SmaliAppend for SmaliInstruction
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        let layout = opcode_by_name(&self.name).map(OperandLayout::of);
        let mut operands: Vec<String> = Vec::new();
        let registers = self.registers.iter().map(|r| r.to_string()).collect::<Vec<_>>();
        match layout.map(|l| l.registers)
        {
            Some(RegisterForm::List) => operands.push(format!("{{{}}}", registers.join(", "))),
            Some(RegisterForm::Range) => match (registers.first(), registers.last())
            {
                (Some(first), Some(last)) => operands.push(format!("{{{} .. {}}}", first, last)),
                _ => operands.push("{}".to_string()),
            },
            _ => operands.extend(registers),
        }
        if let Some(literal) = self.literal
        {
            let wide = layout.map_or(false, |l| l.wide);
            operands.push(format!("{}{}", hex(literal), if wide { "L" } else { "" }));
        }
        if let Some(label) = &self.label
        {
            operands.push(format!(":{}", label));
        }
        if let Some(reference) = &self.reference
        {
            let mut inner = SmaliWriter::new();
            reference.append(&mut inner);
            operands.push(inner.finish());
        }
        if let Some(proto) = &self.proto
        {
            operands.push(proto.to_string());
        }
        writer.write(&self.name);
        if !operands.is_empty()
        {
            writer.write(" ").write(&operands.join(", "));
        }
    }
}

impl SmaliAppend for SmaliCatch
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        let range = format!("{{:{} .. :{}}} :{}", self.start, self.end, self.handler);
        match &self.exception
        {
            Some(e) => writer.write(&format!(".catch {} {}", e, range)),
            None => writer.write(&format!(".catchall {}", range)),
        };
    }
}

fn optional_string(text: &Option<String>) -> String
{
    match text
    {
        Some(t) => escape_string(t),
        None => "null".to_string(),
    }
}

impl SmaliAppend for SmaliCode
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        match self
        {
            SmaliCode::Label(l) => {
                writer.line(&format!(":{}", l));
            }
            SmaliCode::Instruction(i) => {
                i.append(writer);
                writer.newline();
            }
            SmaliCode::Catch(c) => {
                c.append(writer);
                writer.newline();
            }
            SmaliCode::Line(n) => {
                writer.line(&format!(".line {}", n));
            }
            SmaliCode::Local { register, name, local_type, signature } => {
                let mut text = format!(".local {}, {}:{}", register, optional_string(name), local_type.as_deref().unwrap_or("null"));
                if let Some(s) = signature
                {
                    text.push_str(", ");
                    text.push_str(&escape_string(s));
                }
                writer.line(&text);
            }
            SmaliCode::EndLocal(r) => {
                writer.line(&format!(".end local {}", r));
            }
            SmaliCode::RestartLocal(r) => {
                writer.line(&format!(".restart local {}", r));
            }
            SmaliCode::PrologueEnd => {
                writer.line(".prologue");
            }
            SmaliCode::EpilogueBegin => {
                writer.line(".epilogue");
            }
            SmaliCode::Source(name) => {
                writer.line(&format!(".source {}", optional_string(name)));
            }
            SmaliCode::PackedSwitch { first_key, targets } => {
                writer.line(&format!(".packed-switch {}", hex(*first_key as i64))).indent();
                for t in targets
                {
                    writer.line(&format!(":{}", t));
                }
                writer.dedent().line(".end packed-switch");
            }
            SmaliCode::SparseSwitch(entries) => {
                writer.line(".sparse-switch").indent();
                for (key, target) in entries
                {
                    writer.line(&format!("{} -> :{}", hex(*key as i64), target));
                }
                writer.dedent().line(".end sparse-switch");
            }
            SmaliCode::ArrayData { element_width, elements } => {
                let suffix = match element_width
                {
                    1 => "t",
                    2 => "s",
                    8 => "L",
                    _ => "",
                };
                writer.line(&format!(".array-data {}", element_width)).indent();
                for e in elements
                {
                    writer.line(&format!("{}{}", hex(*e), suffix));
                }
                writer.dedent().line(".end array-data");
            }
            SmaliCode::Comment(text) => {
                writer.line(&format!("# {}", text));
            }
        }
    }
}

impl SmaliAppend for SmaliParameter
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        match &self.name
        {
            Some(n) => writer.line(&format!(".param {}, {}", self.register, escape_string(n))),
            None => writer.line(&format!(".param {}", self.register)),
        };
        if !self.annotations.is_empty()
        {
            writer.indent();
            for a in &self.annotations
            {
                a.append(writer);
            }
            writer.dedent().line(".end param");
        }
    }
}

impl SmaliAppend for SmaliField
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        writer.write(&format!(".field {}{}:{}", modifiers(self.access_flags, MemberKind::Field), self.name, self.field_type));
        if let Some(value) = &self.initial_value
        {
            writer.write(" = ");
            value.append(writer);
        }
        writer.newline();
        if !self.annotations.is_empty()
        {
            writer.indent();
            for a in &self.annotations
            {
                a.append(writer);
            }
            writer.dedent().line(".end field");
        }
    }
}

impl SmaliAppend for SmaliMethod
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        writer.line(&format!(".method {}{}{}", modifiers(self.access_flags, MemberKind::Method), self.name, self.proto)).indent();
        if let Some(locals) = self.locals
        {
            writer.line(&format!(".locals {}", locals));
        }
        for a in &self.annotations
        {
            a.append(writer);
        }
        for p in &self.parameters
        {
            p.append(writer);
        }
        if !self.code.is_empty()
        {
            writer.newline();
        }
        for c in &self.code
        {
            c.append(writer);
        }
        writer.dedent().line(".end method");
    }
}

impl SmaliAppend for SmaliClass
{
    fn append(&self, writer: &mut SmaliWriter)
    {
        writer.line(&format!(".class {}{}", modifiers(self.access_flags, MemberKind::Class), self.descriptor));
        if let Some(s) = &self.superclass
        {
            writer.line(&format!(".super {}", s));
        }
        if let Some(s) = &self.source
        {
            writer.line(&format!(".source {}", escape_string(s)));
        }

        if !self.interfaces.is_empty()
        {
            writer.newline().line("# interfaces");
            for i in &self.interfaces
            {
                writer.line(&format!(".implements {}", i));
            }
        }

        if !self.annotations.is_empty()
        {
            writer.newline().line("# annotations");
            for a in &self.annotations
            {
                a.append(writer);
            }
        }

        if !self.fields.is_empty()
        {
            writer.newline().line("# fields");
            for f in &self.fields
            {
                f.append(writer);
                writer.newline();
            }
        }

        if !self.methods.is_empty()
        {
            writer.newline().line("# methods");
            for m in &self.methods
            {
                m.append(writer);
                writer.newline();
            }
        }
    }
}

impl SmaliClass
{
    pub fn to_smali(&self) -> String
    {
        to_smali(self)
    }

    pub fn write_file(&self, path: &Path) -> BlockResult<()>
    {
        std::fs::write(path, self.to_smali()).map_err(|e| BlockError::from(e).with_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::key::FieldKey;
    use crate::smali::model::Register;

    #[test]
    fn strings_and_chars_are_escaped() {
        assert_eq!(escape_string("a\"b\n\u{e9}"), "\"a\\\"b\\n\\u00e9\"");
        assert_eq!(escape_char(b'\'' as u16), "'\\''");
        assert_eq!(escape_char(0x20ac), "'\\u20ac'");
    }

    #[test]
    fn literals_are_signed_hex() {
        assert_eq!(hex(-1), "-0x1");
        assert_eq!(hex(i64::MIN), "-0x8000000000000000");
        assert_eq!(to_smali(&SmaliValue::Long(16)), "0x10L");
        assert_eq!(to_smali(&SmaliValue::Float(1.5)), "1.5f");
        assert_eq!(to_smali(&SmaliValue::Double(f64::NEG_INFINITY)), "-Infinity");
    }

    #[test]
    fn instruction_operands_follow_the_format() {
        let mut invoke = SmaliInstruction::new("invoke-static/range");
        invoke.registers = vec![Register::Param(0), Register::Param(1), Register::Param(2)];
        invoke.reference = Some(SmaliReference::Method(crate::dex::key::MethodKey::new(
            "LA;",
            "f",
            crate::dex::key::ProtoKey::new(vec!["I".to_string(), "J".to_string()], "V"),
        )));
        assert_eq!(to_smali(&invoke), "invoke-static/range {p0 .. p2}, LA;->f(IJ)V");

        let mut wide = SmaliInstruction::new("const-wide/high16");
        wide.registers = vec![Register::Local(0)];
        wide.literal = Some(0x4000_0000_0000_0000);
        assert_eq!(to_smali(&wide), "const-wide/high16 v0, 0x4000000000000000L");

        let mut get = SmaliInstruction::new("sget");
        get.registers = vec![Register::Local(1)];
        get.reference = Some(SmaliReference::Field(FieldKey::new("LA;", "x", "I")));
        assert_eq!(to_smali(&get), "sget v1, LA;->x:I");
    }

    #[test]
    fn arrays_nest_with_indentation() {
        let value = SmaliValue::Array(vec![SmaliValue::Int(1), SmaliValue::Array(vec![])]);
        assert_eq!(to_smali(&value), "{\n    0x1,\n    {}\n}");
    }
}
