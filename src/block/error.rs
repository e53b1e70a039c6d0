use std::fmt;

/// Builds a structural `BlockError`, optionally wrapping another error with context.
#[macro_export]
macro_rules! err {
    ($base:ident, $msg:literal) => {
        $crate::block::error::BlockError::with_context($base, $msg.to_string())
    };
    ($base:ident, $fmtstr:literal, $($args:tt)*) => {
        $crate::block::error::BlockError::with_context($base, format!($fmtstr, $($args)*))
    };
    ($msg:literal) => {
        $crate::block::error::BlockError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::block::error::BlockError::new(&format!($fmtstr, $($args)*))
    };
}

/// Returns early with a structural `BlockError`.
#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::block::error::BlockError::new($msg))
    };
    (($msg:literal), ($context:literal)) => {
        return Err($crate::block::error::BlockError::with_context(
            $crate::block::error::BlockError::new($msg), $context.to_string()))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::block::error::BlockError::new(&format!($fmtstr, $($args)*)))
    };
    (($fmtstr:literal, $($args:tt)*), ($contextfmt:literal, $($contextargs:tt)*)) => {
        return Err($crate::block::error::BlockError::with_context(
            $crate::block::error::BlockError::new(&format!($fmtstr, $($args)*)),
            format!($contextfmt, $($contextargs)*)))
    };
}

/// What went wrong, independent of where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind
{
    /// Truncated input, bad magic, sizes or offsets outside the buffer.
    Structural,
    /// A stored index or offset does not name a live item.
    Resolution,
    /// An operation was called against its precondition.
    Usage,
    /// Malformed text, with the position it was found at.
    Parse { line: usize, column: usize, offset: usize },
    Io,
    Xml,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockError
{
    kind: ErrorKind,
    msg: String,
    contexts: Vec<String>,
}

pub type BlockResult<T> = Result<T, BlockError>;

impl BlockError
{
    pub(crate) fn new(msg: &str) -> Self
    {
        BlockError {
            kind: ErrorKind::Structural,
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub(crate) fn of_kind(kind: ErrorKind, msg: impl Into<String>) -> Self
    {
        BlockError { kind, msg: msg.into(), contexts: Vec::new() }
    }

    pub fn resolution(msg: impl Into<String>) -> Self
    {
        Self::of_kind(ErrorKind::Resolution, msg)
    }

    pub fn usage(msg: impl Into<String>) -> Self
    {
        Self::of_kind(ErrorKind::Usage, msg)
    }

    pub fn parse(msg: impl Into<String>, line: usize, column: usize, offset: usize) -> Self
    {
        Self::of_kind(ErrorKind::Parse { line, column, offset }, msg)
    }

    pub fn xml(msg: impl Into<String>) -> Self
    {
        Self::of_kind(ErrorKind::Xml, msg)
    }

    pub fn with_context(base: BlockError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        BlockError { kind: base.kind, msg: base.msg, contexts }
    }

    /// Attaches the originating file path; used by the load and write entry points.
    pub fn with_path(self, path: &std::path::Path) -> Self
    {
        Self::with_context(self, path.display().to_string())
    }

    pub fn kind(&self) -> ErrorKind
    {
        self.kind
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }

    pub fn is_usage(&self) -> bool
    {
        self.kind == ErrorKind::Usage
    }

    pub fn is_resolution(&self) -> bool
    {
        self.kind == ErrorKind::Resolution
    }
}

impl fmt::Display for BlockError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if let ErrorKind::Parse { line, column, .. } = self.kind
        {
            write!(f, "{}:{}: ", line, column)?;
        }
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for BlockError {}

impl From<std::io::Error> for BlockError
{
    fn from(value: std::io::Error) -> Self
    {
        BlockError::of_kind(ErrorKind::Io, value.to_string())
    }
}

impl From<quick_xml::Error> for BlockError
{
    fn from(value: quick_xml::Error) -> Self
    {
        match value
        {
            quick_xml::Error::Io(e) => BlockError::of_kind(ErrorKind::Io, e.to_string()),
            other => BlockError::xml(other.to_string()),
        }
    }
}

impl From<quick_xml::events::attributes::AttrError> for BlockError
{
    fn from(value: quick_xml::events::attributes::AttrError) -> Self
    {
        BlockError::xml(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_are_chained() {
        let e = BlockError::new("Unexpected end of stream");
        let e = err!(e, "string pool");
        let e = err!(e, "package {}", 0x7f);
        assert_eq!(e.to_string(), "Unexpected end of stream for string pool of package 127");
        assert_eq!(e.kind(), ErrorKind::Structural);
    }

    #[test]
    fn parse_errors_cite_position() {
        let e = BlockError::parse("expected '='", 3, 7, 41);
        assert_eq!(e.to_string(), "3:7: expected '='");
    }
}
