use std::fmt;
use std::sync::Arc;

use crate::{FileReader, TeeResult};

/// Immutable in-memory file, cheap to clone.
#[derive(Clone)]
pub struct MemoryFileReader {
    name: String,
    data: Arc<[u8]>,
}

impl MemoryFileReader {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl FileReader for MemoryFileReader {
    fn size(&self) -> TeeResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let len = out.len().min(self.data.len() - start);
        out[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "memory:{}", self.name)
    }
}
