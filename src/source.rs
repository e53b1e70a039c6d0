//! Byte sources handed in by whatever holds the packaged files.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::block::error::{BlockError, BlockResult};

/// A named entry whose bytes can be streamed, then released.
pub trait InputSource {
    /// Path of the entry inside its container, used in error messages.
    fn name(&self) -> &str;

    fn open_stream(&mut self) -> BlockResult<Box<dyn Read + '_>>;

    /// Releases whatever the source holds; the source is not opened again.
    fn dispose(&mut self) {}

    fn read_all(&mut self) -> BlockResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open_stream()?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Bytes already in memory.
#[derive(Debug, Clone)]
pub struct ByteInputSource {
    name: String,
    bytes: Option<Vec<u8>>,
}

impl ByteInputSource {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        ByteInputSource { name: name.to_string(), bytes: Some(bytes) }
    }

    pub fn is_disposed(&self) -> bool {
        self.bytes.is_none()
    }
}

impl InputSource for ByteInputSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_stream(&mut self) -> BlockResult<Box<dyn Read + '_>> {
        match &self.bytes {
            Some(bytes) => Ok(Box::new(bytes.as_slice())),
            None => Err(BlockError::usage(format!("{} was already disposed", self.name))),
        }
    }

    fn dispose(&mut self) {
        self.bytes = None;
    }
}

/// A file on disk, opened on demand.
#[derive(Debug, Clone)]
pub struct FileInputSource {
    name: String,
    path: PathBuf,
}

impl FileInputSource {
    pub fn new(path: &Path) -> Self {
        FileInputSource { name: path.display().to_string(), path: path.to_path_buf() }
    }
}

impl InputSource for FileInputSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_stream(&mut self) -> BlockResult<Box<dyn Read + '_>> {
        let file = std::fs::File::open(&self.path).map_err(|e| BlockError::from(e).with_path(&self.path))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposed_source_refuses_to_open() {
        let mut source = ByteInputSource::new("res/layout/main.xml", vec![1, 2, 3]);
        assert_eq!(source.read_all().unwrap(), vec![1, 2, 3]);
        source.dispose();
        assert!(source.is_disposed());
        assert!(source.open_stream().err().map_or(false, |e| e.is_usage()));
    }

    #[test]
    fn missing_file_names_its_path() {
        let mut source = FileInputSource::new(Path::new("/nonexistent/apkblock/missing.xml"));
        let err = source.read_all().unwrap_err();
        assert!(err.to_string().contains("missing.xml"));
    }
}
