//! 3MF container access
//!
//! A 3MF file is a ZIP archive. This module opens it, reads members, and
//! writes modified copies where every member that is not explicitly replaced
//! is raw-copied, so its compressed bytes and compression method survive
//! unchanged.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Main 3D model file path within the 3MF archive
pub const MODEL_PATH: &str = "3D/3dmodel.model";

/// Content types file path
pub const CONTENT_TYPES_PATH: &str = "[Content_Types].xml";

/// Relationships file path
pub const RELS_PATH: &str = "_rels/.rels";

/// Vendor per-object / per-plate settings (XML)
pub const MODEL_SETTINGS_PATH: &str = "Metadata/model_settings.config";

/// Vendor slice summary (XML)
pub const SLICE_INFO_PATH: &str = "Metadata/slice_info.config";

/// Vendor filament order per plate (JSON)
pub const FILAMENT_SEQUENCE_PATH: &str = "Metadata/filament_sequence.json";

/// Flat project settings document (JSON)
pub const PROJECT_SETTINGS_PATH: &str = "Metadata/project_settings.config";

/// Per-layer custom G-code / tool-change records (XML)
pub const CUSTOM_GCODE_PATH: &str = "Metadata/custom_gcode_per_layer.xml";

/// Vendor cut-tool bookkeeping (XML)
pub const CUT_INFORMATION_PATH: &str = "Metadata/cut_information.xml";

/// An opened 3MF archive
pub struct Package<R: Read> {
    archive: ZipArchive<R>,
    names: Vec<String>,
    name_set: HashSet<String>,
}

impl Package<File> {
    /// Open a 3MF file from disk
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::open(file)
    }
}

impl<R: Read + Seek> Package<R> {
    /// Open a 3MF package from a reader
    ///
    /// Fails with [`Error::CorruptArchive`] when the bytes are not a ZIP and
    /// with [`Error::MissingModel`] when `3D/3dmodel.model` is absent.
    pub fn open(reader: R) -> Result<Self> {
        let mut archive =
            ZipArchive::new(reader).map_err(|e| Error::CorruptArchive(e.to_string()))?;

        let mut names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive
                .by_index_raw(i)
                .map_err(|e| Error::CorruptArchive(e.to_string()))?;
            names.push(file.name().to_string());
        }
        let name_set = names.iter().cloned().collect();

        let package = Self {
            archive,
            names,
            name_set,
        };

        if !package.has_file(MODEL_PATH) {
            return Err(Error::MissingModel);
        }

        Ok(package)
    }

    /// Check if a member exists
    pub fn has_file(&self, name: &str) -> bool {
        self.name_set.contains(name)
    }

    /// All member names in archive order
    pub fn file_names(&self) -> &[String] {
        &self.names
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the archive has no members
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Read a member as UTF-8 text
    pub fn read_string(&mut self, name: &str) -> Result<String> {
        let bytes = self.read_binary(name)?;
        String::from_utf8(bytes).map_err(|e| Error::malformed(name, e))
    }

    /// Read a member as UTF-8 text if it exists
    pub fn read_string_opt(&mut self, name: &str) -> Result<Option<String>> {
        if !self.has_file(name) {
            return Ok(None);
        }
        self.read_string(name).map(Some)
    }

    /// Read a member as raw bytes
    pub fn read_binary(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut file = self
            .archive
            .by_name(name)
            .map_err(|_| Error::MissingFile(name.to_string()))?;
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Read the main model XML
    pub fn read_model(&mut self) -> Result<String> {
        self.read_string(MODEL_PATH)
    }

    /// Stream a member through `visit` in chunks of at most `chunk` bytes,
    /// stopping after `limit` bytes or when `visit` returns `true`
    ///
    /// Returns whether `visit` asked to stop.
    pub fn scan_chunks<F>(&mut self, name: &str, chunk: usize, limit: u64, mut visit: F) -> Result<bool>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let file = self
            .archive
            .by_name(name)
            .map_err(|_| Error::MissingFile(name.to_string()))?;
        let mut limited = file.take(limit);
        let mut buf = vec![0u8; chunk.max(1)];
        loop {
            let n = limited.read(&mut buf)?;
            if n == 0 {
                return Ok(false);
            }
            if visit(&buf[..n]) {
                return Ok(true);
            }
        }
    }

    /// Write a copy of this archive with `edit` applied
    pub fn write_edited<W: Write + Seek>(&mut self, writer: W, edit: &ArchiveEdit) -> Result<W> {
        let mut zip = ZipWriter::new(writer);
        let options = edit.options();
        let mut written: HashSet<String> = HashSet::new();

        for i in 0..self.archive.len() {
            let name = self.names.get(i).cloned().unwrap_or_default();
            if edit.is_removed(&name) || written.contains(&name) {
                continue;
            }
            if let Some(bytes) = edit.replacements.get(&name) {
                zip.start_file(name.as_str(), options)?;
                zip.write_all(bytes)?;
            } else {
                let file = self.archive.by_index_raw(i)?;
                zip.raw_copy_file(file)?;
            }
            written.insert(name);
        }

        for (name, bytes) in &edit.replacements {
            if written.contains(name) {
                continue;
            }
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }

        Ok(zip.finish()?)
    }

    /// Write an edited copy to `dst` through a temporary file in the same
    /// directory, so a failure never leaves a partial archive behind
    pub fn write_edited_to_path(&mut self, dst: &Path, edit: &ArchiveEdit) -> Result<()> {
        persist_atomically(dst, |file| {
            self.write_edited(file, edit)?;
            Ok(())
        })
    }
}

/// Replacement set for an archive rewrite
///
/// Members not named here are raw-copied. Replacing a name that does not
/// exist appends it.
#[derive(Debug, Default, Clone)]
pub struct ArchiveEdit {
    replacements: BTreeMap<String, Vec<u8>>,
    removed: HashSet<String>,
    removed_prefixes: Vec<String>,
}

impl ArchiveEdit {
    /// Empty edit (a raw copy)
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace or add a member
    pub fn replace(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.replacements.insert(name.into(), bytes.into());
        self
    }

    /// Drop a member
    pub fn remove(&mut self, name: impl Into<String>) -> &mut Self {
        self.removed.insert(name.into());
        self
    }

    /// Drop every member whose path starts with `prefix` (case-insensitive)
    pub fn remove_prefix(&mut self, prefix: &str) -> &mut Self {
        self.removed_prefixes.push(prefix.to_ascii_lowercase());
        self
    }

    fn is_removed(&self, name: &str) -> bool {
        if self.removed.contains(name) {
            return true;
        }
        let lower = name.to_ascii_lowercase();
        self.removed_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }

    fn options(&self) -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated)
    }
}

/// Byte-identical copy of `src` to `dst`
pub fn copy_archive(src: &Path, dst: &Path) -> Result<()> {
    if src != dst {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

/// Run `write` against a temporary file next to `dst` and move it into place
/// only when `write` succeeds
pub fn persist_atomically<F>(dst: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.persist(dst).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Normalize a `p:path` style reference to an archive member name
///
/// Strips the leading `/` and percent-decodes (`%20` → space).
pub fn member_name(reference: &str) -> String {
    let trimmed = reference.trim().trim_start_matches('/');
    match urlencoding::decode(trimmed) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_open_rejects_non_zip() {
        let err = Package::open(Cursor::new(b"not a zip".to_vec())).err().unwrap();
        assert!(matches!(err, Error::CorruptArchive(_)));
    }

    #[test]
    fn test_open_requires_model() {
        let bytes = build(&[("Metadata/x.config", "{}")]);
        let err = Package::open(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, Error::MissingModel));
    }

    #[test]
    fn test_edit_replaces_and_keeps_order() {
        let bytes = build(&[
            ("a.txt", "A"),
            (MODEL_PATH, "<model/>"),
            ("b.txt", "B"),
        ]);
        let mut package = Package::open(Cursor::new(bytes)).unwrap();
        let mut edit = ArchiveEdit::new();
        edit.replace("a.txt", "AA").remove("b.txt").replace("c.txt", "C");
        let out = package
            .write_edited(Cursor::new(Vec::new()), &edit)
            .unwrap()
            .into_inner();

        let mut result = Package::open(Cursor::new(out)).unwrap();
        assert_eq!(result.file_names(), &["a.txt", MODEL_PATH, "c.txt"]);
        assert_eq!(result.read_string("a.txt").unwrap(), "AA");
        assert_eq!(result.read_string(MODEL_PATH).unwrap(), "<model/>");
    }

    #[test]
    fn test_member_name() {
        assert_eq!(member_name("/3D/Objects/part%201.model"), "3D/Objects/part 1.model");
        assert_eq!(member_name("3D/3dmodel.model"), "3D/3dmodel.model");
    }
}
