/* nom parsers for smali text */

use std::path::Path;

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, line_ending, multispace0, multispace1, not_line_ending, one_of, satisfy, space0, space1};
use nom::combinator::{cut, eof, map, not, opt, peek, recognize, value};
use nom::error::{Error, ErrorKind};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::{Err, IResult};

use crate::block::error::{BlockError, BlockResult};
use crate::dex::annotation::visibility_from_name;
use crate::dex::class::access_flag;
use crate::dex::key::{FieldKey, MethodKey, ProtoKey};
use crate::dex::opcode::{opcode_by_name, ReferenceKind};
use crate::smali::model::{
    OperandLayout, Register, RegisterForm, SmaliAnnotation, SmaliAnnotationElement, SmaliCatch, SmaliClass, SmaliCode, SmaliField,
    SmaliInstruction, SmaliMethod, SmaliParameter, SmaliReference, SmaliValue,
};

fn error<T>(input: &str, kind: ErrorKind) -> IResult<&str, T>
{
    Err(Err::Error(Error::new(input, kind)))
}

fn failure<T>(input: &str, kind: ErrorKind) -> IResult<&str, T>
{
    Err(Err::Failure(Error::new(input, kind)))
}

/// Success as `Some`, a recoverable miss as `None`; failures pass through.
fn attempt<'a, O>(result: IResult<&'a str, O>) -> Result<Option<(&'a str, O)>, Err<Error<&'a str>>>
{
    match result
    {
        Ok(r) => Ok(Some(r)),
        Err(Err::Error(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn comment(input: &str) -> IResult<&str, &str>
{
    preceded(char('#'), not_line_ending)(input)
}

/// Trailing blanks, an optional comment and the end of the line.
fn line_end(input: &str) -> IResult<&str, ()>
{
    value((), tuple((space0, opt(comment), alt((line_ending, eof)))))(input)
}

/// Skips blank lines and comment lines.
fn skip_blank(input: &str) -> IResult<&str, ()>
{
    value((), many0(alt((multispace1, comment))))(input)
}

fn comma(input: &str) -> IResult<&str, ()>
{
    value((), tuple((space0, char(','), space0)))(input)
}

fn is_word_char(c: char) -> bool
{
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str>
{
    terminated(tag(word), not(peek(satisfy(is_word_char))))
}

/// An integer literal: optional sign, hex or decimal digits and an optional width suffix.
fn integer<T: num_traits::Num>(input: &str) -> IResult<&str, T>
{
    let (rest, negative) = map(opt(char('-')), |s| s.is_some())(input)?;
    let (rest, (radix, digits)) = alt((
        map(preceded(alt((tag("0x"), tag("0X"))), hex_digit1), |d| (16, d)),
        map(digit1, |d| (10, d)),
    ))(rest)?;
    let (rest, _) = opt(one_of("tTsSlL"))(rest)?;
    let text = if negative { format!("-{}", digits) } else { digits.to_string() };
    match T::from_str_radix(&text, radix)
    {
        Ok(v) => Ok((rest, v)),
        Err(_) => failure(input, ErrorKind::Digit),
    }
}

fn register(input: &str) -> IResult<&str, Register>
{
    let (rest, kind) = one_of("vp")(input)?;
    let (rest, number) = digit1(rest)?;
    let number = match number.parse::<u16>()
    {
        Ok(n) => n,
        Err(_) => return failure(input, ErrorKind::Digit),
    };
    Ok((rest, if kind == 'v' { Register::Local(number) } else { Register::Param(number) }))
}

fn label(input: &str) -> IResult<&str, String>
{
    map(preceded(char(':'), take_while1(is_word_char)), str::to_string)(input)
}

/// A type descriptor: array dimensions, then a primitive or `L...;`.
fn descriptor(input: &str) -> IResult<&str, &str>
{
    recognize(pair(
        many0(char('[')),
        alt((recognize(tuple((char('L'), is_not(";\r\n \t"), char(';')))), recognize(one_of("VZBSCIJFD")))),
    ))(input)
}

fn proto(input: &str) -> IResult<&str, ProtoKey>
{
    let (rest, parameters) = delimited(char('('), many0(descriptor), char(')'))(input)?;
    let (rest, return_type) = descriptor(rest)?;
    Ok((rest, ProtoKey::new(parameters.into_iter().map(str::to_string).collect(), return_type)))
}

fn member_name(input: &str) -> IResult<&str, &str>
{
    take_while1(|c: char| !matches!(c, '(' | ':' | ',' | '}' | ' ' | '\t' | '\r' | '\n'))(input)
}

fn field_key(input: &str) -> IResult<&str, FieldKey>
{
    let (rest, (class, _, name, _, field_type)) = tuple((descriptor, tag("->"), member_name, char(':'), descriptor))(input)?;
    Ok((rest, FieldKey::new(class, name, field_type)))
}

fn method_key(input: &str) -> IResult<&str, MethodKey>
{
    let (rest, (class, _, name, proto)) = tuple((descriptor, tag("->"), member_name, proto))(input)?;
    Ok((rest, MethodKey::new(class, name, proto)))
}

fn escape(input: &str) -> IResult<&str, u16>
{
    let (rest, c) = one_of("nrtbf\"'\\u")(input)?;
    let unit = match c
    {
        'n' => 0x0a,
        'r' => 0x0d,
        't' => 0x09,
        'b' => 0x08,
        'f' => 0x0c,
        'u' => {
            let digits = rest.get(..4).unwrap_or("");
            return match u16::from_str_radix(digits, 16)
            {
                Ok(u) if digits.len() == 4 => Ok((&rest[4..], u)),
                _ => failure(rest, ErrorKind::HexDigit),
            };
        }
        other => other as u16,
    };
    Ok((rest, unit))
}

/// UTF-16 units between `quote`s, escapes decoded.
fn quoted_units(quote: char) -> impl FnMut(&str) -> IResult<&str, Vec<u16>>
{
    move |input: &str| {
        let (mut rest, _) = char(quote)(input)?;
        let mut units = Vec::new();
        loop
        {
            let mut chars = rest.chars();
            match chars.next()
            {
                None | Some('\n') => return failure(rest, ErrorKind::Char),
                Some(c) if c == quote => return Ok((chars.as_str(), units)),
                Some('\\') => {
                    let (after, unit) = escape(chars.as_str())?;
                    units.push(unit);
                    rest = after;
                }
                Some(c) => {
                    let mut buf = [0u16; 2];
                    units.extend_from_slice(c.encode_utf16(&mut buf));
                    rest = chars.as_str();
                }
            }
        }
    }
}

fn string(input: &str) -> IResult<&str, String>
{
    map(quoted_units('"'), |u| String::from_utf16_lossy(&u))(input)
}

fn optional_string(input: &str) -> IResult<&str, Option<String>>
{
    alt((map(string, Some), value(None, keyword("null"))))(input)
}

fn character(input: &str) -> IResult<&str, u16>
{
    let (rest, units) = quoted_units('\'')(input)?;
    match units.as_slice()
    {
        [unit] => Ok((rest, *unit)),
        _ => failure(input, ErrorKind::Char),
    }
}

fn float_literal(input: &str) -> IResult<&str, SmaliValue>
{
    let (rest, text) = alt((
        recognize(pair(opt(char('-')), tag("Infinity"))),
        tag("NaN"),
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
    ))(input)?;
    let (rest, suffix) = opt(one_of("fFdD"))(rest)?;
    let is_float = matches!(suffix, Some('f') | Some('F'));
    let is_decimal = text.contains(|c| matches!(c, '.' | 'e' | 'E' | 'N' | 'I'));
    if !is_decimal && suffix.is_none()
    {
        return error(input, ErrorKind::Float);
    }
    let number = match text
    {
        "NaN" => f64::NAN,
        "Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if is_float => match text.parse::<f32>()
        {
            Ok(v) => return Ok((rest, SmaliValue::Float(v))),
            Err(_) => return failure(input, ErrorKind::Float),
        },
        _ => match text.parse::<f64>()
        {
            Ok(v) => v,
            Err(_) => return failure(input, ErrorKind::Float),
        },
    };
    Ok((rest, if is_float { SmaliValue::Float(number as f32) } else { SmaliValue::Double(number) }))
}

fn integer_literal(input: &str) -> IResult<&str, SmaliValue>
{
    let (_, text) = recognize(tuple((opt(char('-')), alt((preceded(tag("0x"), hex_digit1), digit1)), opt(one_of("tsL")))))(input)?;
    match text.chars().last()
    {
        Some('t') => map(integer::<i8>, SmaliValue::Byte)(input),
        Some('s') => map(integer::<i16>, SmaliValue::Short)(input),
        Some('L') => map(integer::<i64>, SmaliValue::Long)(input),
        _ => map(integer::<i32>, SmaliValue::Int)(input),
    }
}

fn array(input: &str) -> IResult<&str, Vec<SmaliValue>>
{
    delimited(
        pair(char('{'), multispace0),
        separated_list0(tuple((multispace0, char(','), multispace0)), smali_value),
        pair(multispace0, char('}')),
    )(input)
}

fn elements<'a>(end_tag: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, Vec<SmaliAnnotationElement>>
{
    move |input: &'a str| {
        let mut rest = input;
        let mut elements = Vec::new();
        loop
        {
            let (r, _) = skip_blank(rest)?;
            if let Ok((r, _)) = tag::<_, _, Error<&str>>(end_tag)(r)
            {
                return Ok((r, elements));
            }
            let (r, e) = cut(terminated(annotation_element, line_end))(r)?;
            elements.push(e);
            rest = r;
        }
    }
}

fn subannotation(input: &str) -> IResult<&str, SmaliValue>
{
    let (rest, _) = tag(".subannotation")(input)?;
    let (rest, (_, annotation_type, _)) = cut(tuple((space1, descriptor, line_end)))(rest)?;
    let (rest, elements) = elements(".end subannotation")(rest)?;
    Ok((rest, SmaliValue::SubAnnotation { annotation_type: annotation_type.to_string(), elements }))
}

fn member_or_type(input: &str) -> IResult<&str, SmaliValue>
{
    if let Some((rest, method)) = attempt(method_key(input))?
    {
        return Ok((rest, SmaliValue::Method(method)));
    }
    if let Some((rest, field)) = attempt(field_key(input))?
    {
        return Ok((rest, SmaliValue::Field(field)));
    }
    map(descriptor, |d| SmaliValue::Type(d.to_string()))(input)
}

fn smali_value(input: &str) -> IResult<&str, SmaliValue>
{
    alt((
        subannotation,
        map(preceded(pair(tag(".enum"), space1), cut(field_key)), SmaliValue::Enum),
        map(array, SmaliValue::Array),
        map(string, SmaliValue::String),
        map(character, SmaliValue::Char),
        value(SmaliValue::Boolean(true), keyword("true")),
        value(SmaliValue::Boolean(false), keyword("false")),
        value(SmaliValue::Null, keyword("null")),
        float_literal,
        integer_literal,
        map(proto, SmaliValue::MethodType),
        member_or_type,
    ))(input)
}

fn annotation_element(input: &str) -> IResult<&str, SmaliAnnotationElement>
{
    let (rest, name) = take_while1(is_word_char)(input)?;
    let (rest, value) = preceded(tuple((space0, char('='), space0)), cut(smali_value))(rest)?;
    Ok((rest, SmaliAnnotationElement { name: name.to_string(), value }))
}

fn annotation(input: &str) -> IResult<&str, SmaliAnnotation>
{
    let (rest, _) = tag(".annotation")(input)?;
    let (rest, (_, visibility, _, annotation_type, _)) = cut(tuple((space1, take_while1(is_word_char), space1, descriptor, line_end)))(rest)?;
    let visibility = match visibility_from_name(visibility)
    {
        Some(v) => v,
        None => return failure(input, ErrorKind::Tag),
    };
    let (rest, elements) = elements(".end annotation")(rest)?;
    let (rest, _) = line_end(rest)?;
    Ok((rest, SmaliAnnotation { visibility, annotation_type: annotation_type.to_string(), elements }))
}

/// Consecutive annotations, each on its own lines.
fn annotations(input: &str) -> IResult<&str, Vec<SmaliAnnotation>>
{
    many0(preceded(skip_blank, annotation))(input)
}

fn reference(kind: ReferenceKind) -> impl Fn(&str) -> IResult<&str, SmaliReference>
{
    move |input: &str| match kind
    {
        ReferenceKind::String => map(string, SmaliReference::String)(input),
        ReferenceKind::Type => map(descriptor, |d| SmaliReference::Type(d.to_string()))(input),
        ReferenceKind::Field => map(field_key, SmaliReference::Field)(input),
        ReferenceKind::Method => map(method_key, SmaliReference::Method)(input),
        ReferenceKind::Proto => map(proto, SmaliReference::Proto)(input),
        _ => failure(input, ErrorKind::Verify),
    }
}

fn register_range(input: &str) -> IResult<&str, Vec<Register>>
{
    let (rest, bounds) = delimited(
        pair(char('{'), space0),
        opt(pair(register, preceded(tuple((space0, tag(".."), space0)), register))),
        pair(space0, char('}')),
    )(input)?;
    let registers = match bounds
    {
        None => Vec::new(),
        Some((Register::Local(a), Register::Local(b))) if a <= b => (a..=b).map(Register::Local).collect(),
        Some((Register::Param(a), Register::Param(b))) if a <= b => (a..=b).map(Register::Param).collect(),
        Some(_) => return failure(input, ErrorKind::Verify),
    };
    Ok((rest, registers))
}

/// The next operand: a blank ahead of the first one, a comma ahead of the rest.
fn operand<'a, O, F>(input: &'a str, first: &mut bool, parser: F) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    let separated = if std::mem::replace(first, false) { value((), space1)(input) } else { comma(input) };
    let (rest, _) = separated.map_err(|e| match e
    {
        Err::Error(e) => Err::Failure(e),
        other => other,
    })?;
    cut(parser)(rest)
}

fn instruction(input: &str) -> IResult<&str, SmaliInstruction>
{
    let (rest, name) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '/')(input)?;
    let info = match opcode_by_name(name)
    {
        Some(o) => o,
        None => return failure(input, ErrorKind::Tag),
    };
    let layout = OperandLayout::of(info);
    let mut ins = SmaliInstruction::new(name);
    let mut rest = rest;
    let mut first = true;

    match layout.registers
    {
        RegisterForm::Plain(count) => {
            for _ in 0..count
            {
                let (r, reg) = operand(rest, &mut first, register)?;
                ins.registers.push(reg);
                rest = r;
            }
        }
        RegisterForm::List => {
            let (r, regs) = operand(
                rest,
                &mut first,
                delimited(pair(char('{'), space0), separated_list0(comma, register), pair(space0, char('}'))),
            )?;
            ins.registers = regs;
            rest = r;
        }
        RegisterForm::Range => {
            let (r, regs) = operand(rest, &mut first, register_range)?;
            ins.registers = regs;
            rest = r;
        }
    }
    if layout.literal
    {
        let (r, literal) = operand(rest, &mut first, integer::<i64>)?;
        ins.literal = Some(literal);
        rest = r;
    }
    if layout.label
    {
        let (r, target) = operand(rest, &mut first, label)?;
        ins.label = Some(target);
        rest = r;
    }
    if layout.reference
    {
        let (r, operand) = operand(rest, &mut first, reference(info.reference))?;
        ins.reference = Some(operand);
        rest = r;
    }
    if layout.proto
    {
        let (r, p) = operand(rest, &mut first, proto)?;
        ins.proto = Some(p);
        rest = r;
    }
    Ok((rest, ins))
}

fn catch(input: &str) -> IResult<&str, SmaliCatch>
{
    let (rest, exception) = alt((
        value(None, terminated(tag(".catchall"), space1)),
        map(delimited(pair(tag(".catch"), space1), cut(descriptor), space1), |d| Some(d.to_string())),
    ))(input)?;
    let (rest, (start, end)) = cut(delimited(
        pair(char('{'), space0),
        pair(label, preceded(tuple((space1, tag(".."), space1)), label)),
        pair(space0, char('}')),
    ))(rest)?;
    let (rest, handler) = cut(preceded(space1, label))(rest)?;
    Ok((rest, SmaliCatch { exception, start, end, handler }))
}

fn local(input: &str) -> IResult<&str, SmaliCode>
{
    let (rest, _) = pair(tag(".local"), space1)(input)?;
    let (rest, (register, _, name, _, local_type, signature)) = cut(tuple((
        register,
        comma,
        optional_string,
        char(':'),
        alt((map(descriptor, |d| Some(d.to_string())), value(None, keyword("null")))),
        opt(preceded(comma, string)),
    )))(rest)?;
    Ok((rest, SmaliCode::Local { register, name, local_type, signature }))
}

fn packed_switch(input: &str) -> IResult<&str, SmaliCode>
{
    let (rest, _) = pair(tag(".packed-switch"), space1)(input)?;
    let (rest, first_key) = cut(terminated(integer::<i32>, line_end))(rest)?;
    let (rest, targets) = many0(delimited(skip_blank, label, line_end))(rest)?;
    let (rest, _) = cut(preceded(skip_blank, tag(".end packed-switch")))(rest)?;
    Ok((rest, SmaliCode::PackedSwitch { first_key, targets }))
}

fn sparse_switch(input: &str) -> IResult<&str, SmaliCode>
{
    let (rest, _) = terminated(tag(".sparse-switch"), line_end)(input)?;
    let entry = pair(integer::<i32>, preceded(tuple((space0, tag("->"), space0)), label));
    let (rest, entries) = many0(delimited(skip_blank, entry, line_end))(rest)?;
    let (rest, _) = cut(preceded(skip_blank, tag(".end sparse-switch")))(rest)?;
    Ok((rest, SmaliCode::SparseSwitch(entries)))
}

fn array_data(input: &str) -> IResult<&str, SmaliCode>
{
    let (rest, _) = pair(tag(".array-data"), space1)(input)?;
    let (rest, element_width) = cut(terminated(integer::<u16>, line_end))(rest)?;
    let (rest, elements) = many0(delimited(skip_blank, integer::<i64>, line_end))(rest)?;
    let (rest, _) = cut(preceded(skip_blank, tag(".end array-data")))(rest)?;
    Ok((rest, SmaliCode::ArrayData { element_width, elements }))
}

/// One line, or one payload block, of a method body, without its line ending.
fn code(input: &str) -> IResult<&str, SmaliCode>
{
    alt((
        map(label, SmaliCode::Label),
        map(preceded(pair(tag(".line"), space1), cut(integer::<u32>)), SmaliCode::Line),
        local,
        map(preceded(pair(tag(".end local"), space1), cut(register)), SmaliCode::EndLocal),
        map(preceded(pair(tag(".restart local"), space1), cut(register)), SmaliCode::RestartLocal),
        value(SmaliCode::PrologueEnd, keyword(".prologue")),
        value(SmaliCode::EpilogueBegin, keyword(".epilogue")),
        map(preceded(pair(tag(".source"), space1), cut(optional_string)), SmaliCode::Source),
        map(catch, SmaliCode::Catch),
        packed_switch,
        sparse_switch,
        array_data,
        map(preceded(pair(char('#'), opt(char(' '))), not_line_ending), |c: &str| SmaliCode::Comment(c.to_string())),
        map(instruction, SmaliCode::Instruction),
    ))(input)
}

/// Access flag keywords ahead of a name, each followed by a blank.
fn modifiers(input: &str) -> IResult<&str, u32>
{
    let mut flags = 0;
    let (mut rest, _) = space1(input)?;
    loop
    {
        let word: IResult<&str, &str> = terminated(take_while1(is_word_char), space1)(rest);
        match word
        {
            Ok((after, w)) => match access_flag(w)
            {
                Some(bit) => {
                    flags |= bit;
                    rest = after;
                }
                None => return Ok((rest, flags)),
            },
            Err(_) => return Ok((rest, flags)),
        }
    }
}

fn param(input: &str) -> IResult<&str, SmaliParameter>
{
    let (rest, _) = pair(tag(".param"), space1)(input)?;
    let (rest, (register, name, _)) = cut(tuple((register, opt(preceded(comma, string)), line_end)))(rest)?;
    let (rest, annotations) = annotations(rest)?;
    let rest = if annotations.is_empty()
    {
        rest
    }
    else
    {
        cut(delimited(skip_blank, tag(".end param"), line_end))(rest)?.0
    };
    Ok((rest, SmaliParameter { register, name, annotations }))
}

fn method(input: &str) -> IResult<&str, SmaliMethod>
{
    let (rest, _) = tag(".method")(input)?;
    let (rest, (access_flags, name, proto, _)) = cut(tuple((modifiers, member_name, proto, line_end)))(rest)?;
    let mut method = SmaliMethod {
        name: name.to_string(),
        proto,
        access_flags,
        locals: None,
        parameters: Vec::new(),
        annotations: Vec::new(),
        code: Vec::new(),
    };
    let ins = method.ins();

    let mut rest = rest;
    loop
    {
        let (r, _) = many0(pair(space0, line_ending))(rest)?;
        let (r, _) = space0(r)?;
        if let Ok((r, _)) = terminated(tag::<_, _, Error<&str>>(".end method"), line_end)(r)
        {
            return Ok((r, method));
        }
        if let Some((r, n)) = attempt(preceded(pair(tag(".locals"), space1), cut(terminated(integer::<u16>, line_end)))(r))?
        {
            method.locals = Some(n);
            rest = r;
            continue;
        }
        if let Some((r, n)) = attempt(preceded(pair(tag(".registers"), space1), cut(terminated(integer::<u16>, line_end)))(r))?
        {
            if n < ins
            {
                return failure(rest, ErrorKind::Verify);
            }
            method.locals = Some(n - ins);
            rest = r;
            continue;
        }
        if let Some((r, a)) = attempt(annotation(r))?
        {
            method.annotations.push(a);
            rest = r;
            continue;
        }
        if let Some((r, p)) = attempt(param(r))?
        {
            method.parameters.push(p);
            rest = r;
            continue;
        }
        if r.is_empty()
        {
            return failure(r, ErrorKind::Eof);
        }
        let (r, c) = cut(terminated(code, line_end))(r)?;
        method.code.push(c);
        rest = r;
    }
}

fn field(input: &str) -> IResult<&str, SmaliField>
{
    let (rest, _) = tag(".field")(input)?;
    let (rest, (access_flags, name, _, field_type)) = cut(tuple((modifiers, member_name, char(':'), descriptor)))(rest)?;
    let (rest, initial_value) = cut(terminated(opt(preceded(tuple((space0, char('='), space0)), smali_value)), line_end))(rest)?;
    let (rest, annotations) = annotations(rest)?;
    let rest = if annotations.is_empty()
    {
        rest
    }
    else
    {
        cut(delimited(skip_blank, tag(".end field"), line_end))(rest)?.0
    };
    Ok((rest, SmaliField { name: name.to_string(), field_type: field_type.to_string(), access_flags, initial_value, annotations }))
}

fn class(input: &str) -> IResult<&str, SmaliClass>
{
    let (rest, _) = skip_blank(input)?;
    let (rest, _) = tag(".class")(rest)?;
    let (rest, (access_flags, class_name, _)) = cut(tuple((modifiers, descriptor, line_end)))(rest)?;
    let mut class = SmaliClass::new(class_name);
    class.access_flags = access_flags;
    class.superclass = None;

    let mut rest = rest;
    loop
    {
        let (r, _) = skip_blank(rest)?;
        if r.is_empty()
        {
            return Ok((r, class));
        }
        if let Some((r, s)) = attempt(preceded(pair(tag(".super"), space1), cut(terminated(descriptor, line_end)))(r))?
        {
            class.superclass = Some(s.to_string());
            rest = r;
            continue;
        }
        if let Some((r, s)) = attempt(preceded(pair(tag(".source"), space1), cut(terminated(string, line_end)))(r))?
        {
            class.source = Some(s);
            rest = r;
            continue;
        }
        if let Some((r, i)) = attempt(preceded(pair(tag(".implements"), space1), cut(terminated(descriptor, line_end)))(r))?
        {
            class.interfaces.push(i.to_string());
            rest = r;
            continue;
        }
        if let Some((r, a)) = attempt(annotation(r))?
        {
            class.annotations.push(a);
            rest = r;
            continue;
        }
        if let Some((r, f)) = attempt(field(r))?
        {
            class.fields.push(f);
            rest = r;
            continue;
        }
        if let Some((r, m)) = attempt(method(r))?
        {
            class.methods.push(m);
            rest = r;
            continue;
        }
        return failure(r, ErrorKind::Alt);
    }
}

/// Byte offset of `rest` within `text`; `rest` is always a slice of `text`.
fn offset_in(text: &str, rest: &str) -> usize
{
    (rest.as_ptr() as usize).saturating_sub(text.as_ptr() as usize).min(text.len())
}

fn parse_error(text: &str, rest: &str, what: &str) -> BlockError
{
    let offset = offset_in(text, rest);
    let consumed = &text[..offset];
    let line = consumed.matches('\n').count() + 1;
    let column = consumed.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    let found: String = text[offset..].lines().next().unwrap_or("").trim().chars().take(48).collect();
    if found.is_empty()
    {
        BlockError::parse(format!("unexpected end of {}", what), line, column, offset)
    }
    else
    {
        BlockError::parse(format!("unexpected `{}` in {}", found, what), line, column, offset)
    }
}

/// Runs `parser` over the whole of `text`, trailing blanks and comments aside.
fn complete<'a, O, F>(text: &'a str, what: &str, parser: F) -> BlockResult<O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    match terminated(preceded(space0, parser), pair(skip_blank, eof))(text)
    {
        Ok((_, o)) => Ok(o),
        Err(Err::Error(e)) | Err(Err::Failure(e)) => Err(parse_error(text, e.input, what)),
        Err(Err::Incomplete(_)) => Err(parse_error(text, "", what)),
    }
}

pub fn parse_class(text: &str) -> BlockResult<SmaliClass>
{
    complete(text, "class", class)
}

pub fn parse_instruction(text: &str) -> BlockResult<SmaliInstruction>
{
    complete(text, "instruction", instruction)
}

/// One method body line or payload block.
pub fn parse_code(text: &str) -> BlockResult<SmaliCode>
{
    complete(text, "code", code)
}

pub fn parse_annotation(text: &str) -> BlockResult<SmaliAnnotation>
{
    complete(text, "annotation", annotation)
}

pub fn parse_annotation_element(text: &str) -> BlockResult<SmaliAnnotationElement>
{
    complete(text, "annotation element", annotation_element)
}

pub fn parse_value(text: &str) -> BlockResult<SmaliValue>
{
    complete(text, "value", smali_value)
}

pub fn parse_method_key(text: &str) -> BlockResult<MethodKey>
{
    complete(text, "method reference", method_key)
}

pub fn parse_field_key(text: &str) -> BlockResult<FieldKey>
{
    complete(text, "field reference", field_key)
}

impl SmaliClass
{
    pub fn read_file(path: &Path) -> BlockResult<SmaliClass>
    {
        let text = std::fs::read_to_string(path).map_err(|e| BlockError::from(e).with_path(path))?;
        parse_class(&text).map_err(|e| e.with_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::error::ErrorKind as BlockErrorKind;
    use crate::dex::class::{ACC_CONSTRUCTOR, ACC_FINAL, ACC_PUBLIC, ACC_STATIC};
    use crate::smali::write::to_smali;

    #[test]
    fn integers_take_width_from_the_target() {
        assert_eq!(integer::<i32>("-0x10").unwrap().1, -16);
        assert_eq!(integer::<i64>("-0x8000000000000000L").unwrap().1, i64::MIN);
        assert_eq!(integer::<u16>("12").unwrap().1, 12);
        assert!(matches!(integer::<i8>("0x80t"), Err(Err::Failure(_))));
    }

    #[test]
    fn values_parse_by_shape() {
        assert_eq!(parse_value("0x7ft").unwrap(), SmaliValue::Byte(127));
        assert_eq!(parse_value("-0x2s").unwrap(), SmaliValue::Short(-2));
        assert_eq!(parse_value("0x10L").unwrap(), SmaliValue::Long(16));
        assert_eq!(parse_value("12").unwrap(), SmaliValue::Int(12));
        assert_eq!(parse_value("1.5").unwrap(), SmaliValue::Double(1.5));
        assert_eq!(parse_value("-Infinityf").unwrap(), SmaliValue::Float(f32::NEG_INFINITY));
        assert_eq!(parse_value("'\\n'").unwrap(), SmaliValue::Char(10));
        assert_eq!(parse_value("\"a\\u00e9\"").unwrap(), SmaliValue::String("a\u{e9}".to_string()));
        assert_eq!(parse_value("null").unwrap(), SmaliValue::Null);
        assert_eq!(parse_value("Ljava/lang/String;").unwrap(), SmaliValue::Type("Ljava/lang/String;".to_string()));
        assert_eq!(parse_value("LA;->x:I").unwrap(), SmaliValue::Field(FieldKey::new("LA;", "x", "I")));
        assert_eq!(parse_value(".enum LE;->ONE:LE;").unwrap(), SmaliValue::Enum(FieldKey::new("LE;", "ONE", "LE;")));
        assert_eq!(parse_value("(IJ)V").unwrap(), SmaliValue::MethodType(ProtoKey::new(vec!["I".to_string(), "J".to_string()], "V")));
    }

    #[test]
    fn float_literal_round_trips() {
        for v in [SmaliValue::Float(1.5), SmaliValue::Float(-3.4028235e38), SmaliValue::Double(0.1), SmaliValue::Double(1e300)] {
            assert_eq!(parse_value(&to_smali(&v)).unwrap(), v);
        }
    }

    #[test]
    fn instruction_round_trips() {
        let text = "invoke-virtual {p0, v1}, Ljava/io/PrintStream;->println(Ljava/lang/String;)V";
        let ins = parse_instruction(text).unwrap();
        assert_eq!(ins.registers, vec![Register::Param(0), Register::Local(1)]);
        assert!(matches!(&ins.reference, Some(SmaliReference::Method(m)) if m.name == "println"));
        assert_eq!(to_smali(&ins), text);
        assert_eq!(parse_instruction(&to_smali(&ins)).unwrap(), ins);

        let range = parse_instruction("invoke-static/range {v2 .. v4}, LA;->f(IJ)V").unwrap();
        assert_eq!(range.registers.len(), 3);
        let branch = parse_instruction("if-nez v0, :cond_1a   # comment").unwrap();
        assert_eq!(branch.label.as_deref(), Some("cond_1a"));
        let wide = parse_instruction("const-wide v0, -0x1L").unwrap();
        assert_eq!(wide.literal, Some(-1));
    }

    #[test]
    fn annotation_element_round_trips() {
        let element = SmaliAnnotationElement {
            name: "value".to_string(),
            value: SmaliValue::Array(vec![
                SmaliValue::String("a,b".to_string()),
                SmaliValue::SubAnnotation {
                    annotation_type: "LInner;".to_string(),
                    elements: vec![SmaliAnnotationElement { name: "x".to_string(), value: SmaliValue::Boolean(true) }],
                },
            ]),
        };
        let text = to_smali(&element);
        assert_eq!(parse_annotation_element(&text).unwrap(), element);
    }

    #[test]
    fn errors_carry_their_position() {
        let err = parse_instruction("const/4 v0, :nope").unwrap_err();
        assert_eq!(err.kind(), BlockErrorKind::Parse { line: 1, column: 13, offset: 12 });

        let text = ".class public LA;\n.super Ljava/lang/Object;\n.method public f()V\n    .locals 0\n    frobnicate v0\n.end method\n";
        match parse_class(text).unwrap_err().kind() {
            BlockErrorKind::Parse { line, column, .. } => {
                assert_eq!(line, 5);
                assert_eq!(column, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn class_parses_members_and_payloads() {
        let text = r#"
# a comment before the class
.class public final LHello;
.super Ljava/lang/Object;
.source "Hello.java"

.implements Ljava/lang/Runnable;

.annotation system Ldalvik/annotation/Signature;
    value = {
        "x",
        "y"
    }
.end annotation

.field public static final COUNT:I = 0x3

.field private name:Ljava/lang/String;
    .annotation runtime LNullable;
    .end annotation
.end field

.method public constructor <init>()V
    .registers 1
    invoke-direct {p0}, Ljava/lang/Object;-><init>()V
    return-void
.end method

.method public static pick(I)I
    .locals 1
    .param p0, "which"

    .line 7
    packed-switch p0, :pswitch_data_0
    const/4 v0, 0x0
    :goto_0
    return v0
    :pswitch_0
    const/4 v0, 0x1
    goto :goto_0

    :pswitch_data_0
    .packed-switch 0x0
        :pswitch_0
    .end packed-switch
.end method
"#;
        let class = parse_class(text).unwrap();
        assert_eq!(class.access_flags, ACC_PUBLIC | ACC_FINAL);
        assert_eq!(class.descriptor, "LHello;");
        assert_eq!(class.superclass.as_deref(), Some("Ljava/lang/Object;"));
        assert_eq!(class.source.as_deref(), Some("Hello.java"));
        assert_eq!(class.interfaces, vec!["Ljava/lang/Runnable;".to_string()]);
        assert_eq!(class.fields[0].initial_value, Some(SmaliValue::Int(3)));
        assert_eq!(class.fields[1].annotations[0].annotation_type, "LNullable;");
        let init = &class.methods[0];
        assert_eq!(init.access_flags, ACC_PUBLIC | ACC_CONSTRUCTOR);
        assert_eq!(init.locals, Some(0));
        let pick = &class.methods[1];
        assert_eq!(pick.access_flags, ACC_PUBLIC | ACC_STATIC);
        assert_eq!(pick.parameters[0].name.as_deref(), Some("which"));
        assert_eq!(pick.code[0], SmaliCode::Line(7));
        assert!(matches!(pick.code.last(), Some(SmaliCode::PackedSwitch { first_key: 0, targets }) if targets.len() == 1));

        assert_eq!(parse_class(&to_smali(&class)).unwrap(), class);
    }
}
