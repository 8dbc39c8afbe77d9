//! Safe archive extraction.
//!
//! The one place in the system that handles adversarial input: archives of
//! external tools. Every member path is vetted *before anything is written*:
//! the candidate path is lexically normalized against the canonicalized
//! destination and must remain a descendant of it, compared component-wise.
//! String-prefix comparison is explicitly not enough (`/tmp/root` is a
//! string prefix of `/tmp/root2` but not an ancestor). One bad member aborts
//! the whole extraction with no members retained.
//!
//! `.tar.gz` archives are handled natively; other formats go through the
//! external 7-Zip command after the same vetting of its listing.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use thiserror::Error;
use tracing::{debug, info};

use crate::tools::{self, ToolCommand, ToolError};

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// A member would land outside the destination. Fatal; nothing is
    /// extracted.
    #[error("archive member '{member}' escapes the destination directory")]
    PathTraversal { member: String },

    /// A member type we refuse to extract (device nodes, and links whose
    /// target escapes).
    #[error("archive member '{member}' has an unsafe type or link target")]
    UnsafeMember { member: String },

    /// No handler for this archive format.
    #[error("unsupported archive format: {0} (need .tar.gz, or 7z configured)")]
    UnsupportedFormat(PathBuf),

    /// I/O failure on the archive or destination.
    #[error("extraction I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The external 7z tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Lexically resolve `member` against `destination_real` and require the
/// result to stay inside it.
///
/// Returns the resolved path. `allow_self` permits members that normalize
/// to the destination itself (directory entries like `./`).
fn vet_member(
    destination_real: &Path,
    member: &str,
    allow_self: bool,
) -> ExtractResult<PathBuf> {
    let reject = || ExtractError::PathTraversal {
        member: member.to_string(),
    };

    let relative = Path::new(member);
    if relative.is_absolute() {
        return Err(reject());
    }

    let mut resolved = destination_real.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping is only legal while we stay under the destination.
                if !resolved.pop() || !resolved.starts_with(destination_real) {
                    return Err(reject());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(reject()),
        }
        if !resolved.starts_with(destination_real) {
            return Err(reject());
        }
    }

    if resolved == *destination_real && !allow_self {
        return Err(reject());
    }
    Ok(resolved)
}

/// Extract an archive into `destination` with traversal prevention.
///
/// Returns the number of extracted members. The destination is created if
/// needed; on a rejected member nothing has been written.
pub fn extract_archive(
    archive: &Path,
    destination: &Path,
    sevenzip: Option<&ToolCommand>,
) -> ExtractResult<usize> {
    std::fs::create_dir_all(destination).map_err(|source| ExtractError::Io {
        path: destination.to_path_buf(),
        source,
    })?;
    let destination_real =
        std::fs::canonicalize(destination).map_err(|source| ExtractError::Io {
            path: destination.to_path_buf(),
            source,
        })?;

    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive, &destination_real)
    } else if let Some(sevenzip) = sevenzip {
        extract_via_sevenzip(sevenzip, archive, &destination_real)
    } else {
        Err(ExtractError::UnsupportedFormat(archive.to_path_buf()))
    }
}

fn open_tar(archive: &Path) -> ExtractResult<Archive<GzDecoder<std::fs::File>>> {
    let file = std::fs::File::open(archive).map_err(|source| ExtractError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn extract_tar_gz(archive: &Path, destination_real: &Path) -> ExtractResult<usize> {
    let archive_err = |source| ExtractError::Io {
        path: archive.to_path_buf(),
        source,
    };

    // Pass 1: vet every member before anything touches the disk.
    let mut tar = open_tar(archive)?;
    for entry in tar.entries().map_err(archive_err)? {
        let entry = entry.map_err(archive_err)?;
        let member = entry.path().map_err(archive_err)?.display().to_string();
        let header_type = entry.header().entry_type();
        let is_dir = header_type == EntryType::Directory;
        vet_member(destination_real, &member, is_dir)?;

        match header_type {
            EntryType::Regular | EntryType::Directory => {}
            EntryType::Symlink | EntryType::Link => {
                // A link target may point anywhere; resolve it relative to
                // the link's parent and hold it to the same rule.
                let target = entry
                    .link_name()
                    .map_err(archive_err)?
                    .map(|t| t.display().to_string())
                    .unwrap_or_default();
                let parent = Path::new(&member)
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(&target);
                if vet_member(destination_real, &parent.display().to_string(), false).is_err() {
                    return Err(ExtractError::UnsafeMember { member });
                }
            }
            _ => return Err(ExtractError::UnsafeMember { member }),
        }
    }

    // Pass 2: actually extract. `unpack_in` re-checks traversal as a second
    // line of defense.
    let mut tar = open_tar(archive)?;
    let mut count = 0usize;
    for entry in tar.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let unpacked = entry.unpack_in(destination_real).map_err(archive_err)?;
        if unpacked && entry.header().entry_type() == EntryType::Regular {
            count += 1;
        }
    }

    info!(
        archive = %archive.display(),
        destination = %destination_real.display(),
        files = count,
        "extracted archive"
    );
    Ok(count)
}

/// Vet the 7z listing, then let 7z extract.
fn extract_via_sevenzip(
    sevenzip: &ToolCommand,
    archive: &Path,
    destination_real: &Path,
) -> ExtractResult<usize> {
    let listing = tools::run_checked(
        sevenzip,
        &[
            String::from("l"),
            String::from("-ba"),
            String::from("-slt"),
            archive.display().to_string(),
        ],
        None,
    )?;

    let mut members = Vec::new();
    for line in listing.stdout.lines() {
        if let Some(path) = line.strip_prefix("Path = ") {
            members.push(path.trim().to_string());
        }
    }
    for member in &members {
        vet_member(destination_real, member, false)?;
    }
    debug!(archive = %archive.display(), members = members.len(), "7z listing vetted");

    tools::run_checked(
        sevenzip,
        &[
            String::from("x"),
            String::from("-y"),
            format!("-o{}", destination_real.display()),
            archive.display().to_string(),
        ],
        None,
    )?;
    Ok(members.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tar_gz(path: &Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            if name.contains("..") {
                // `set_path` refuses traversal names, so write the raw
                // header field the way a hostile archive would carry it.
                let bytes = name.as_bytes();
                header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            } else {
                header.set_cksum();
                builder.append_data(&mut header, name, *data).unwrap();
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_vet_accepts_nested_members() {
        let temp = TempDir::new().unwrap();
        let dest = std::fs::canonicalize(temp.path()).unwrap();
        let resolved = vet_member(&dest, "tool/bin/Ortho4XP.py", false).unwrap();
        assert!(resolved.starts_with(&dest));
    }

    #[test]
    fn test_vet_rejects_parent_escape() {
        let temp = TempDir::new().unwrap();
        let dest = std::fs::canonicalize(temp.path()).unwrap();
        assert!(vet_member(&dest, "../evil", false).is_err());
        assert!(vet_member(&dest, "ok/../../evil", false).is_err());
        assert!(vet_member(&dest, "/etc/passwd", false).is_err());
    }

    #[test]
    fn test_vet_rejects_sibling_prefix() {
        // destination "root"; "../root2/x" normalizes to a *sibling* whose
        // name shares the prefix. Component-wise comparison must reject it.
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(temp.path().join("root2")).unwrap();
        let dest = std::fs::canonicalize(&root).unwrap();
        assert!(vet_member(&dest, "../root2/x", false).is_err());
    }

    #[test]
    fn test_vet_tolerates_dot_prefixed_members() {
        let temp = TempDir::new().unwrap();
        let dest = std::fs::canonicalize(temp.path()).unwrap();
        assert!(vet_member(&dest, "./tool/file", false).is_ok());
        // A bare "." is only fine for directory entries.
        assert!(vet_member(&dest, ".", true).is_ok());
        assert!(vet_member(&dest, ".", false).is_err());
    }

    #[test]
    fn test_extracts_well_formed_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tool.tar.gz");
        build_tar_gz(
            &archive,
            &[
                ("tool/Ortho4XP.py", b"print('hi')".as_slice()),
                ("tool/README", b"docs".as_slice()),
            ],
        );

        let dest = temp.path().join("install");
        let count = extract_archive(&archive, &dest, None).unwrap();
        assert_eq!(count, 2);
        assert!(dest.join("tool/Ortho4XP.py").is_file());
    }

    #[test]
    fn test_traversal_member_aborts_before_any_write() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar.gz");
        // A benign member first; the hostile one later. Nothing at all may
        // be written.
        build_tar_gz(
            &archive,
            &[
                ("benign.txt", b"ok".as_slice()),
                ("../root2/evil", b"pwned".as_slice()),
            ],
        );

        let dest = temp.path().join("root");
        let err = extract_archive(&archive, &dest, None).unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversal { .. }));

        assert!(!temp.path().join("root2/evil").exists());
        assert!(!dest.join("benign.txt").exists());
    }

    #[test]
    fn test_unsupported_format_without_sevenzip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tool.7z");
        std::fs::write(&archive, b"7z").unwrap();
        let err = extract_archive(&archive, &temp.path().join("dest"), None).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat(_)));
    }
}
