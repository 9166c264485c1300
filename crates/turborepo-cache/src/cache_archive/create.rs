use std::io::Write;

use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Streams files into a tar (optionally zstd-compressed) artifact. On-disk
/// artifacts are written to a sibling temp file and renamed into place on
/// `finish`, so readers never observe a partial archive.
pub struct CacheWriter {
    builder: tar::Builder<Box<dyn Write + Send>>,
    // (temp, final) when writing to disk
    paths: Option<(AbsoluteSystemPathBuf, AbsoluteSystemPathBuf)>,
}

impl CacheWriter {
    /// Wraps an arbitrary writer, e.g. a byte buffer destined for a remote
    /// upload. Compression is the caller's choice since in-memory artifacts
    /// don't have a file name to carry it.
    pub fn from_writer(
        writer: impl Write + Send + 'static,
        use_compression: bool,
    ) -> Result<Self, CacheError> {
        let writer: Box<dyn Write + Send> = if use_compression {
            Box::new(zstd::Encoder::new(writer, 0)?.auto_finish())
        } else {
            Box::new(writer)
        };
        let mut builder = tar::Builder::new(writer);
        // Symlinks are archived as links, never chased.
        builder.follow_symlinks(false);
        Ok(Self {
            builder,
            paths: None,
        })
    }

    /// Creates an artifact that will land at `path` once finished.
    /// Compression is selected by the `.zst` extension.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        path.ensure_dir()?;
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::InvalidFilePath(path.to_string()))?;
        let name = path
            .as_std_path()
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CacheError::InvalidFilePath(path.to_string()))?;
        let temp_path = parent.join_component(&format!(".{}.{}.tmp", name, std::process::id()));

        let use_compression = path.as_str().ends_with(".zst");
        let file = temp_path.create()?;
        let mut writer = Self::from_writer(file, use_compression)?;
        writer.paths = Some((temp_path, path.to_owned()));
        Ok(writer)
    }

    /// Appends `file_path` (anchored at `anchor`) to the archive.
    /// Directories and symlinks are captured as such.
    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        // Archive paths always use unix separators.
        let archive_path = file_path.to_unix();
        self.builder
            .append_path_with_name(source_path.as_std_path(), archive_path.as_str())?;
        Ok(())
    }

    /// Writes the tar footer, flushes the compressor, and for on-disk
    /// artifacts performs the atomic rename from temp to final path.
    pub fn finish(mut self) -> Result<(), CacheError> {
        self.builder.finish()?;
        let writer = self.builder.into_inner()?;
        // Dropping the writer finishes the zstd frame.
        drop(writer);
        if let Some((temp_path, final_path)) = self.paths {
            temp_path.rename(&final_path)?;
        }
        Ok(())
    }
}

/// Grow-only byte buffer that can be handed to the tar builder and read back
/// after `finish`.
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn into_bytes(self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().expect("shared buffer mutex poisoned"))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("shared buffer mutex poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
