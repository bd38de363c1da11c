//! Filesystem evidence: snapshots, change detection and claim verification.
//!
//! Nothing the executor says about files is trusted. Claims are checked
//! against the disk, and the before/after diff adds files the executor touched
//! without mentioning.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::status::derive_status;
use crate::core::types::{ExecutorResult, VerifiedFile};
use crate::io::config::EvidenceConfig;

/// Modification stamp of one file in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Relative path (with `/` separators) to stamp, for every regular file under
/// a root that is neither hidden nor inside an excluded directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    entries: BTreeMap<String, FileStamp>,
}

impl FileSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileStamp> {
        self.entries.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Walk `root` and record every regular file.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn snapshot(root: &Path, config: &EvidenceConfig) -> Result<FileSnapshot> {
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        if name.starts_with('.') {
            return false;
        }
        !(e.file_type().is_dir() && config.excluded_dirs.iter().any(|ex| ex == name.as_ref()))
    });

    let mut entries = BTreeMap::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        entries.insert(
            slash_path(rel),
            FileStamp {
                modified: metadata.modified().ok(),
                size: metadata.len(),
            },
        );
    }
    debug!(files = entries.len(), "snapshot taken");
    Ok(FileSnapshot { entries })
}

/// Paths present in `after` that are new or whose mtime or size changed.
/// Sorted.
pub fn diff(before: &FileSnapshot, after: &FileSnapshot) -> Vec<String> {
    after
        .entries
        .iter()
        .filter(|(path, stamp)| before.get(path) != Some(*stamp))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Stat each claimed path relative to `working_dir`.
///
/// Claims that resolve outside `working_dir` (through `..`, an unrelated
/// absolute path or a symlink) are reported as not existing.
pub fn verify(claimed: &[String], working_dir: &Path, config: &EvidenceConfig) -> Vec<VerifiedFile> {
    claimed
        .iter()
        .map(|claim| verify_one(claim, working_dir, config.preview_bytes))
        .collect()
}

fn verify_one(claim: &str, working_dir: &Path, preview_bytes: usize) -> VerifiedFile {
    let missing = |path: String| VerifiedFile {
        path,
        exists: false,
        size: None,
        content_preview: None,
    };

    let Some(rel) = normalize_claim(claim, working_dir) else {
        debug!(claim, "claim escapes working directory");
        return missing(claim.to_string());
    };
    let display = slash_path(&rel);
    let full = working_dir.join(&rel);
    let Ok(metadata) = fs::metadata(&full) else {
        return missing(display);
    };
    if !stays_inside(&full, working_dir) {
        debug!(claim, "claim resolves outside working directory");
        return missing(display);
    }

    let content_preview = if metadata.is_file() && preview_bytes > 0 {
        read_preview(&full, preview_bytes)
    } else {
        None
    };
    VerifiedFile {
        path: display,
        exists: true,
        size: Some(metadata.len()),
        content_preview,
    }
}

/// Replace the executor's file claims with independently verified evidence and
/// re-derive the status.
pub fn apply_evidence(
    mut result: ExecutorResult,
    changed: &[String],
    working_dir: &Path,
    config: &EvidenceConfig,
) -> ExecutorResult {
    let claims: Vec<String> = std::mem::take(&mut result.files_modified);
    let claim_checks = verify(&claims, working_dir, config);

    let mut files_modified: Vec<String> = Vec::new();
    let mut verified: Vec<VerifiedFile> = Vec::new();
    let mut unverified: Vec<String> = Vec::new();

    for (claim, check) in claims.iter().zip(claim_checks) {
        if check.exists {
            push_unique(&mut files_modified, check.path.clone());
            if !verified.iter().any(|file| file.path == check.path) {
                verified.push(check);
            }
        } else {
            push_unique(&mut files_modified, claim.clone());
            push_unique(&mut unverified, claim.clone());
        }
    }
    for path in changed {
        if files_modified.contains(path) {
            continue;
        }
        files_modified.push(path.clone());
        let check = verify_one(path, working_dir, config.preview_bytes);
        if check.exists {
            verified.push(check);
        }
    }

    result.files_modified = files_modified;
    result.verified_files = verified;
    result.unverified_files = unverified;
    result.status = derive_status(&result);
    debug!(
        verified = result.verified_files.len(),
        unverified = result.unverified_files.len(),
        status = %result.status,
        "evidence applied"
    );
    result
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Lexically resolve `claim` to a path relative to `working_dir`.
fn normalize_claim(claim: &str, working_dir: &Path) -> Option<PathBuf> {
    let path = Path::new(claim.trim());
    let relative = if path.is_absolute() {
        path.strip_prefix(working_dir).ok()?
    } else {
        path
    };

    let mut out = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

fn stays_inside(full: &Path, working_dir: &Path) -> bool {
    match (full.canonicalize(), working_dir.canonicalize()) {
        (Ok(full), Ok(root)) => full.starts_with(root),
        _ => false,
    }
}

fn read_preview(path: &Path, limit: usize) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut buf = Vec::with_capacity(limit.min(8192));
    file.take(limit as u64).read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
