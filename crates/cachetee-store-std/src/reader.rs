use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use cachetee_core::{FileReader, TeeResult};
use tracing::debug;

use crate::{map_io_err, read_file_at};

/// Read-only native file used as a backing source.
pub struct StdFileReader {
    path: PathBuf,
    file: File,
}

impl StdFileReader {
    pub fn open(path: impl AsRef<Path>) -> TeeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(map_io_err("open backing file"))?;
        debug!(path = %path.display(), "opened backing file");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, used to name the cache sidecar.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

impl FileReader for StdFileReader {
    fn size(&self) -> TeeResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(map_io_err("stat backing file"))
    }

    fn read_at(&self, mut offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        let mut filled = 0usize;
        while filled < out.len() {
            let read = match read_file_at(&self.file, &mut out[filled..], offset) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_err("read backing file")(err)),
            };
            filled += read;
            offset += read as u64;
        }
        Ok(filled)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "file:{}", self.path.display())
    }
}
