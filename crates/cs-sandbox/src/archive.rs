//! Project archives shared by export/import and backups.
//!
//! An archive is a JSON manifest with every regular file base64-encoded, so
//! extraction reproduces the tree byte-for-byte.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::SandboxError;

pub const ARCHIVE_VERSION: u32 = 1;

/// Sidecar written next to a backup tree; never included in archives.
pub const BACKUP_METADATA_FILE: &str = "_backup_metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub path: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    pub content_b64: String,
}

fn default_mode() -> u32 {
    0o644
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectArchive {
    pub version: u32,
    pub language: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ArchiveFile>,
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    default_mode()
}

/// Reject absolute paths and `..` so extraction stays inside the target.
fn safe_relative(path: &str) -> Result<PathBuf, SandboxError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p.to_path_buf())
    } else {
        Err(SandboxError::Archive(format!("unsafe path in archive: {path}")))
    }
}

impl ProjectArchive {
    /// Snapshot every regular file under `dir`, sorted by path. The backup
    /// sidecar is skipped.
    pub fn from_dir(dir: &Path, language: &str, name: &str) -> Result<Self, SandboxError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| SandboxError::Archive(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| SandboxError::Archive(e.to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if rel == BACKUP_METADATA_FILE {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            let meta = entry.metadata().map_err(|e| SandboxError::Archive(e.to_string()))?;
            files.push(ArchiveFile {
                path: rel,
                mode: file_mode(&meta),
                content_b64: B64.encode(bytes),
            });
        }
        Ok(Self {
            version: ARCHIVE_VERSION,
            language: language.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            files,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SandboxError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SandboxError> {
        let archive: Self = serde_json::from_slice(bytes)?;
        if archive.version > ARCHIVE_VERSION {
            return Err(SandboxError::Archive(format!(
                "unsupported archive version {}",
                archive.version
            )));
        }
        Ok(archive)
    }

    /// Decoded contents of `path`, if present.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| B64.decode(&f.content_b64).ok())
    }

    /// Write every file under `dir`, creating parents. Returns the number of
    /// files written.
    pub fn extract_to(&self, dir: &Path) -> Result<usize, SandboxError> {
        std::fs::create_dir_all(dir)?;
        for f in &self.files {
            let rel = safe_relative(&f.path)?;
            let target = dir.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = B64
                .decode(&f.content_b64)
                .map_err(|e| SandboxError::Archive(format!("{}: {e}", f.path)))?;
            std::fs::write(&target, bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(f.mode))?;
            }
        }
        Ok(self.files.len())
    }

    pub fn total_bytes(&self) -> usize {
        self.files
            .iter()
            .map(|f| f.content_b64.len() / 4 * 3)
            .sum()
    }
}

/// Copy `src` into `dst` recursively (regular files only).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize, SandboxError> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Archive(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SandboxError::Archive(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
