use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Component, Path, PathBuf},
};

/// How two relative paths from different mods are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CasePolicy {
    /// Paths that differ only in case are the same path (what the games expect).
    #[default]
    Insensitive,
    /// Leave collisions to the backing filesystem.
    Sensitive,
}

impl CasePolicy {
    pub fn key(self, rel: &str) -> String {
        match self {
            CasePolicy::Insensitive => rel.to_lowercase(),
            CasePolicy::Sensitive => rel.to_string(),
        }
    }

    pub fn eq(self, a: &str, b: &str) -> bool {
        match self {
            CasePolicy::Insensitive => a.to_lowercase() == b.to_lowercase(),
            CasePolicy::Sensitive => a == b,
        }
    }
}

/// Turns any archive or script path into `a/b/c`: forward slashes, no leading
/// or trailing separator, no `.` segments. Returns `None` for paths that try to
/// climb out of their root.
pub fn normalize_rel(raw: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

pub fn rel_from_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in rel.split('/').filter(|part| !part.is_empty()) {
        path.push(part);
    }
    path
}

/// Archive debris and VCS folders that never belong in a game directory.
pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part.eq_ignore_ascii_case("desktop.ini")
            || part == ".git"
            || part == ".svn"
            || part == ".vscode"
    })
}

/// Per-mod metadata files written by other managers.
pub fn is_metadata_file(rel: &str) -> bool {
    rel.eq_ignore_ascii_case("meta.ini")
}

/// Walks `rel` below `root` matching each segment case-insensitively against
/// what is on disk. Existing segments keep their on-disk spelling, missing ones
/// keep the spelling from `rel`. The returned path may not exist.
pub fn resolve_existing_case(root: &Path, rel: &str) -> PathBuf {
    let mut current = root.to_path_buf();
    let mut exists = true;
    for part in rel.split('/').filter(|part| !part.is_empty()) {
        if exists {
            if let Some(found) = find_child_nocase(&current, part) {
                current = found;
                continue;
            }
            exists = false;
        }
        current.push(part);
    }
    current
}

/// Like [`resolve_existing_case`] but only succeeds when every segment exists
/// and the final entry is a file.
pub fn resolve_file_nocase(
    root: &Path,
    rel: &str,
    cache: &mut HashMap<PathBuf, Vec<PathBuf>>,
) -> Option<PathBuf> {
    let direct = join_rel(root, rel);
    if direct.is_file() {
        return Some(direct);
    }
    let mut current = root.to_path_buf();
    for part in rel.split('/').filter(|part| !part.is_empty()) {
        let listing = cache.entry(current.clone()).or_insert_with(|| {
            fs::read_dir(&current)
                .map(|entries| entries.flatten().map(|entry| entry.path()).collect())
                .unwrap_or_default()
        });
        let needle = part.to_lowercase();
        current = listing
            .iter()
            .find(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().to_lowercase() == needle)
                    .unwrap_or(false)
            })?
            .clone();
    }
    current.is_file().then_some(current)
}

fn find_child_nocase(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if fs::symlink_metadata(&exact).is_ok() {
        return Some(exact);
    }
    let needle = name.to_lowercase();
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().to_lowercase() == needle)
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// Lexical containment check; `rel` values come from our own records so no
/// symlink resolution is attempted.
pub fn path_under_root(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
        && !path
            .strip_prefix(root)
            .map(|rel| rel.components().any(|c| matches!(c, Component::ParentDir)))
            .unwrap_or(true)
}

pub fn sanitize_dir_name(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim().to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Counts uppercase letters so the "most capitalised" spelling of a folder can
/// be preferred when mods disagree.
pub fn uppercase_weight(segment: &str) -> usize {
    segment.chars().filter(|ch| ch.is_uppercase()).count()
}
