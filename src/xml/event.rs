//! The event vocabulary shared by every XML source and sink.

use crate::block::error::BlockResult;

/// A namespace-qualified name. `prefix` is how the source spelled it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlName {
    pub namespace: Option<String>,
    pub prefix: Option<String>,
    pub local: String,
}

impl XmlName {
    pub fn local(name: &str) -> Self {
        XmlName { namespace: None, prefix: None, local: name.to_string() }
    }

    pub fn qualified(prefix: &str, namespace: &str, name: &str) -> Self {
        XmlName { namespace: Some(namespace.to_string()), prefix: Some(prefix.to_string()), local: name.to_string() }
    }

    /// `prefix:local`, or just `local` without a prefix.
    pub fn qname(&self) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, self.local),
            _ => self.local.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttr {
    pub name: XmlName,
    pub value: String,
    /// Compiled attribute id, when the source knows it.
    pub resource_id: Option<u32>,
}

/// A namespace declared on an element, `prefix` empty for the default namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNamespaceDecl {
    pub prefix: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    StartDocument,
    EndDocument,
    StartTag {
        name: XmlName,
        namespaces: Vec<XmlNamespaceDecl>,
        attributes: Vec<XmlAttr>,
        line: u32,
    },
    EndTag {
        name: XmlName,
        line: u32,
    },
    Text(String),
    CData(String),
    Comment(String),
    EntityRef(String),
    IgnorableWhitespace(String),
    DocDecl(String),
    ProcessingInstruction(String),
}

impl XmlEvent {
    /// How the event moves the nesting depth.
    pub fn depth_change(&self) -> i32 {
        match self {
            XmlEvent::StartDocument | XmlEvent::StartTag { .. } => 1,
            XmlEvent::EndDocument | XmlEvent::EndTag { .. } => -1,
            _ => 0,
        }
    }
}

/// Pull-style producer of [`XmlEvent`]s. `None` means the source is exhausted.
pub trait XmlPullSource {
    fn next_event(&mut self) -> BlockResult<Option<XmlEvent>>;
}

/// Push-style consumer of [`XmlEvent`]s.
pub trait XmlPushSink {
    fn push(&mut self, event: XmlEvent) -> BlockResult<()>;

    /// Called once after the last event.
    fn finish(&mut self) -> BlockResult<()> {
        Ok(())
    }
}

impl<S: XmlPushSink + ?Sized> XmlPushSink for &mut S {
    fn push(&mut self, event: XmlEvent) -> BlockResult<()> {
        (**self).push(event)
    }

    fn finish(&mut self) -> BlockResult<()> {
        (**self).finish()
    }
}

/// Collects events; handy for inspecting a source.
impl XmlPushSink for Vec<XmlEvent> {
    fn push(&mut self, event: XmlEvent) -> BlockResult<()> {
        Vec::push(self, event);
        Ok(())
    }
}

/// Drains `source` into a vector.
pub fn collect_events<P: XmlPullSource + ?Sized>(source: &mut P) -> BlockResult<Vec<XmlEvent>> {
    let mut events = Vec::new();
    while let Some(event) = source.next_event()? {
        events.push(event);
    }
    Ok(events)
}

/// Replays a list of events.
#[derive(Debug, Clone, Default)]
pub struct EventReplay {
    events: std::collections::VecDeque<XmlEvent>,
}

impl EventReplay {
    pub fn new(events: Vec<XmlEvent>) -> Self {
        EventReplay { events: events.into() }
    }
}

impl XmlPullSource for EventReplay {
    fn next_event(&mut self) -> BlockResult<Option<XmlEvent>> {
        Ok(self.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_join_with_colon() {
        assert_eq!(XmlName::qualified("android", "uri", "label").qname(), "android:label");
        assert_eq!(XmlName::local("manifest").qname(), "manifest");
    }

    #[test]
    fn tags_move_depth() {
        let start = XmlEvent::StartTag { name: XmlName::local("a"), namespaces: vec![], attributes: vec![], line: 0 };
        assert_eq!(start.depth_change(), 1);
        assert_eq!(XmlEvent::EndTag { name: XmlName::local("a"), line: 0 }.depth_change(), -1);
        assert_eq!(XmlEvent::Text("x".to_string()).depth_change(), 0);
    }
}
