use std::{
    io::Read,
    path::{Component, Path},
};

use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::CacheError;

/// Reads a tar (optionally zstd-compressed) artifact and materializes it
/// under an anchor directory. Entry paths are validated so a crafted archive
/// cannot write outside the anchor.
pub struct CacheReader {
    reader: Box<dyn Read>,
}

impl CacheReader {
    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        let is_compressed = path.as_str().ends_with(".zst");
        Self::from_reader(file, is_compressed)
    }

    pub fn from_reader(
        reader: impl Read + 'static,
        is_compressed: bool,
    ) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };
        Ok(Self { reader })
    }

    /// Restores every entry under `anchor`, returning the anchored paths in
    /// archive order.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut archive = tar::Archive::new(&mut self.reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path().map_err(|_| CacheError::MalformedTar)?;
            let anchored_path = validated_anchored_path(&entry_path)?;
            let target = anchor.resolve(&anchored_path);

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    target.create_dir_all()?;
                }
                tar::EntryType::Regular => {
                    target.ensure_dir()?;
                    let mut file = target.create()?;
                    std::io::copy(&mut entry, &mut file)?;
                    #[cfg(unix)]
                    {
                        use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                        if let Ok(mode) = entry.header().mode() {
                            std::fs::set_permissions(
                                target.as_std_path(),
                                Permissions::from_mode(mode),
                            )?;
                        }
                    }
                }
                tar::EntryType::Symlink => {
                    let link = entry
                        .link_name()
                        .map_err(|_| CacheError::MalformedTar)?
                        .ok_or(CacheError::MalformedTar)?;
                    let link = link
                        .to_str()
                        .ok_or_else(|| CacheError::InvalidFilePath(target.to_string()))?
                        .to_owned();
                    if Path::new(&link).is_absolute() {
                        return Err(CacheError::LinkOutsideOfDirectory(link));
                    }
                    target.ensure_dir()?;
                    if target.symlink_metadata().is_ok() {
                        target.remove_file()?;
                    }
                    target.symlink_to(&link)?;
                }
                entry_type => {
                    return Err(CacheError::RestoreUnsupportedFileType(entry_type));
                }
            }

            restored.push(anchored_path);
        }

        Ok(restored)
    }
}

/// Rejects absolute paths and any path escaping the anchor via `..`.
fn validated_anchored_path(entry_path: &Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    let mut depth = 0_isize;
    for component in entry_path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(CacheError::LinkOutsideOfDirectory(
                        entry_path.display().to_string(),
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CacheError::InvalidFilePath(
                    entry_path.display().to_string(),
                ));
            }
        }
    }
    let path = entry_path
        .to_str()
        .ok_or_else(|| CacheError::InvalidFilePath(entry_path.display().to_string()))?;
    Ok(AnchoredSystemPathBuf::from_raw(path)?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;

    fn archive_with_entry(path: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        let name = &mut header.as_old_mut().name;
        let bytes = path.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        header.set_cksum();
        builder
            .append(&header, contents)
            .expect("append test entry");
        builder.into_inner().expect("finish test archive")
    }

    #[test]
    fn test_rejects_traversal() -> Result<()> {
        let bytes = archive_with_entry("../escape.txt", b"gotcha");
        let dir = tempfile::tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(dir.path())?;

        let mut reader = CacheReader::from_reader(std::io::Cursor::new(bytes), false)?;
        let err = reader.restore(anchor).unwrap_err();
        assert!(
            matches!(err, CacheError::LinkOutsideOfDirectory(_)),
            "{err:?}"
        );
        Ok(())
    }

    #[test]
    fn test_restores_nested_file_without_dir_entry() -> Result<()> {
        let bytes = archive_with_entry("deep/nested/file.txt", b"depths");
        let dir = tempfile::tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(dir.path())?;

        let mut reader = CacheReader::from_reader(std::io::Cursor::new(bytes), false)?;
        let restored = reader.restore(anchor)?;
        assert_eq!(restored.len(), 1);
        assert_eq!(
            anchor
                .join_components(&["deep", "nested", "file.txt"])
                .read_to_string()?,
            "depths"
        );
        Ok(())
    }

    #[test]
    fn test_rejects_fifo_entries() -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_entry_type(tar::EntryType::Fifo);
        header.set_mode(0o644);
        builder.append_data(&mut header, "pipe", std::io::empty())?;
        let bytes = builder.into_inner()?;

        let dir = tempfile::tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(dir.path())?;
        let mut reader = CacheReader::from_reader(std::io::Cursor::new(bytes), false)?;
        let err = reader.restore(anchor).unwrap_err();
        assert!(
            matches!(err, CacheError::RestoreUnsupportedFileType(_)),
            "{err:?}"
        );
        Ok(())
    }
}
