/* Symbolic keys for dex identifiers */

use std::fmt;

use serde::{Deserialize, Serialize};

/// A method prototype: parameter descriptors and return descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtoKey
{
    pub parameters: Vec<String>,
    pub return_type: String,
}

impl ProtoKey
{
    pub fn new(parameters: Vec<String>, return_type: &str) -> ProtoKey
    {
        ProtoKey { parameters, return_type: return_type.to_string() }
    }

    /// Short-form descriptor: one character per type, references collapsed to `L`.
    pub fn shorty(&self) -> String
    {
        let mut shorty = String::with_capacity(self.parameters.len() + 1);
        shorty.push(shorty_char(&self.return_type));
        for p in &self.parameters
        {
            shorty.push(shorty_char(p));
        }
        shorty
    }

    /// Number of registers the parameters occupy, not counting `this`.
    pub fn parameter_registers(&self) -> usize
    {
        self.parameters.iter().map(|p| if p == "J" || p == "D" { 2 } else { 1 }).sum()
    }
}

fn shorty_char(descriptor: &str) -> char
{
    match descriptor.chars().next()
    {
        Some('[') | Some('L') | None => 'L',
        Some(c) => c,
    }
}

impl fmt::Display for ProtoKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "({}){}", self.parameters.concat(), self.return_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey
{
    pub class: String,
    pub name: String,
    pub field_type: String,
}

impl FieldKey
{
    pub fn new(class: &str, name: &str, field_type: &str) -> FieldKey
    {
        FieldKey { class: class.to_string(), name: name.to_string(), field_type: field_type.to_string() }
    }
}

impl fmt::Display for FieldKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}->{}:{}", self.class, self.name, self.field_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey
{
    pub class: String,
    pub name: String,
    pub proto: ProtoKey,
}

impl MethodKey
{
    pub fn new(class: &str, name: &str, proto: ProtoKey) -> MethodKey
    {
        MethodKey { class: class.to_string(), name: name.to_string(), proto }
    }

    pub fn is_constructor(&self) -> bool
    {
        self.name == "<init>" || self.name == "<clinit>"
    }
}

impl fmt::Display for MethodKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}->{}{}", self.class, self.name, self.proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_key_text() {
        let key = MethodKey::new(
            "Lcom/example/Foo;",
            "bar",
            ProtoKey::new(vec!["I".to_string(), "[Ljava/lang/String;".to_string(), "J".to_string()], "V"),
        );
        assert_eq!(key.to_string(), "Lcom/example/Foo;->bar(I[Ljava/lang/String;J)V");
        assert_eq!(key.proto.shorty(), "VILJ");
        assert_eq!(key.proto.parameter_registers(), 4);
    }

    #[test]
    fn field_key_text() {
        let key = FieldKey::new("Lcom/example/Foo;", "count", "I");
        assert_eq!(key.to_string(), "Lcom/example/Foo;->count:I");
    }
}
