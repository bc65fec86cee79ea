//! Tar archive construction for bulk transfer into an instance filesystem
//!
//! Entries are collected first and written in path order when the archive is
//! finished, so identical inputs always produce identical bytes. Every entry is
//! a regular file with mode `0o755` and a zero mtime; parent directories are
//! created by the engine on extraction.

use std::collections::BTreeMap;

use crate::errors::ArchiveError;
use crate::task::FileSystem;

/// Permission bits applied to every archived file.
pub const ENTRY_MODE: u32 = 0o755;

/// Check that `path` is a forward-slash relative path that stays inside its root.
pub fn validate_relative_path(path: &str) -> Result<(), ArchiveError> {
    if path.is_empty() {
        return Err(ArchiveError::EmptyPath);
    }
    if path.starts_with('/') || path.starts_with('\\') || path.as_bytes().get(1) == Some(&b':') {
        return Err(ArchiveError::AbsolutePath(path.to_string()));
    }
    for segment in path.split(['/', '\\']) {
        match segment {
            ".." => return Err(ArchiveError::ParentTraversal(path.to_string())),
            "" | "." => return Err(ArchiveError::InvalidPath(path.to_string())),
            _ if segment.contains('\0') => {
                return Err(ArchiveError::InvalidPath(path.to_string()))
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one file. A later entry for the same path replaces the earlier one.
    pub fn append(
        &mut self,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<&mut Self, ArchiveError> {
        let path = path.into();
        validate_relative_path(&path)?;
        self.entries.insert(path, content.into());
        Ok(self)
    }

    pub fn append_files(&mut self, files: &FileSystem) -> Result<&mut Self, ArchiveError> {
        for (path, content) in files.iter() {
            self.append(path, content)?;
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write all entries and return the finished archive bytes.
    pub fn finish(self) -> Result<Vec<u8>, ArchiveError> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(ENTRY_MODE);
            header.set_mtime(0);
            builder.append_data(&mut header, path, content.as_slice())?;
        }
        let bytes = builder.into_inner()?;
        log::debug!(
            "Built archive with {} entries ({} bytes)",
            self.entries.len(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// Archive a whole source tree in one call.
    pub fn build(files: &FileSystem) -> Result<Vec<u8>, ArchiveError> {
        let mut builder = Self::new();
        builder.append_files(files)?;
        builder.finish()
    }
}
