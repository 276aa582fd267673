use std::path::{Component, Path, PathBuf};

use crate::config;

pub const MAX_FILENAME_LEN: usize = 255;

/// Validates a peer-proposed filename and resolves the destination
/// path. Runs before any socket is opened; every rejection carries the
/// specific security reason.
pub fn resolve(dcc: &config::Dcc, requested: &str, size: u64) -> Result<PathBuf, Error> {
    if requested.is_empty() {
        return Err(Error::BadFilename("empty filename"));
    }
    if requested.len() > MAX_FILENAME_LEN {
        return Err(Error::BadFilename("filename too long"));
    }
    if requested.chars().any(|c| c.is_control() || c == '\0') {
        return Err(Error::BadFilename("control bytes in filename"));
    }
    if requested == "." || requested == ".." {
        return Err(Error::BadFilename("reserved name"));
    }

    // The destination must stay inside the download directory once the
    // proposed name is joined and normalized
    let base = normalize(&dcc.download_dir);
    let candidate = normalize(&dcc.download_dir.join(requested));

    if requested.contains(['/', '\\']) || !candidate.starts_with(&base) {
        return Err(Error::PathEscape(requested.to_string()));
    }

    if let Some(extension) = Path::new(requested)
        .extension()
        .and_then(|e| e.to_str())
    {
        let extension = format!(".{}", extension.to_lowercase());
        if dcc
            .blocked_extensions
            .iter()
            .any(|blocked| blocked.to_lowercase() == extension)
        {
            return Err(Error::BlockedExtension(extension));
        }
    }

    if size > dcc.max_file_size {
        return Err(Error::OversizeFile {
            size,
            max: dcc.max_file_size,
        });
    }

    Ok(candidate)
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            component => normalized.push(component),
        }
    }

    normalized
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("file type {0:?} is blocked")]
    BlockedExtension(String),
    #[error("filename {0:?} escapes the download directory")]
    PathEscape(String),
    #[error("file size {size} exceeds the maximum {max}")]
    OversizeFile { size: u64, max: u64 },
    #[error("bad filename: {0}")]
    BadFilename(&'static str),
}
