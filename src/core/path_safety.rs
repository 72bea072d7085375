//! Output path validation
//!
//! Destination checks run before any network activity begins: the resolved
//! path must stay inside the configured download root, and file names are
//! sanitized so a scraped title can never smuggle in path separators or
//! control characters. Violations are `OutputPath` errors, which are hard
//! preconditions and never retried.

use std::path::{Component, Path, PathBuf};

use crate::core::error_handling::DownloadError;

/// Characters stripped from file names on every platform.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Sanitize a user- or scraper-supplied file name.
///
/// Path separators, Windows-reserved characters, and control characters are
/// removed; trailing dots and whitespace are trimmed. An empty or dot-leading
/// result is replaced with a generated name so the caller always gets
/// something usable.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();

    let trimmed = cleaned.trim().trim_end_matches(['.', ' ']);

    if trimmed.is_empty() || trimmed.starts_with('.') {
        generated_name()
    } else {
        trimmed.to_string()
    }
}

fn generated_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("download-{}", &id[..8])
}

/// Resolve `dest_dir/file_name` against the configured download root.
///
/// The destination may be given relative to the root or as an absolute path;
/// either way the lexically normalized result must stay inside the root.
/// No filesystem access happens here - the directories may not exist yet.
pub fn resolve_output_path(
    root: &Path,
    dest_dir: &Path,
    file_name: &str,
) -> Result<PathBuf, DownloadError> {
    let root = normalize_lexically(root, Path::new("")).map_err(|_| DownloadError::OutputPath {
        message: format!("download root {:?} is not a clean path", root),
    })?;

    let dir = if dest_dir.is_absolute() {
        normalize_lexically(dest_dir, Path::new("")).map_err(|_| escape_error(dest_dir))?
    } else {
        normalize_lexically(&root, dest_dir).map_err(|_| escape_error(dest_dir))?
    };

    if !dir.starts_with(&root) {
        return Err(escape_error(dest_dir));
    }

    let name = sanitize_file_name(file_name);
    Ok(dir.join(name))
}

fn escape_error(dest: &Path) -> DownloadError {
    DownloadError::OutputPath {
        message: format!("destination {:?} escapes the download root", dest),
    }
}

/// Lexical normalization: resolve `.` and `..` without touching the
/// filesystem. Popping past the base is an error.
fn normalize_lexically(base: &Path, rel: &Path) -> Result<PathBuf, ()> {
    let mut out: Vec<std::ffi::OsString> = Vec::new();
    let mut prefix = PathBuf::new();

    for comp in base.components().chain(rel.components()) {
        match comp {
            Component::Prefix(p) => prefix.push(p.as_os_str()),
            Component::RootDir => prefix.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.pop().is_none() {
                    return Err(());
                }
            }
            Component::Normal(part) => out.push(part.to_os_string()),
        }
    }

    let mut result = prefix;
    for part in out {
        result.push(part);
    }
    Ok(result)
}
