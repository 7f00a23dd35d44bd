use crate::{
    config::GameConfig,
    error::{Error, Result},
    extract::ExtractedArchive,
    fomod::{self, GameContext, ModuleConfig, ModuleInfo, RecordedSelections, SelectionMemory, Selector},
    paths::{self, is_ignored_path, sanitize_dir_name},
};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

const HEURISTIC_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub source: PathBuf,
    pub dest: String,
}

#[derive(Debug, Clone)]
pub struct ScriptSummary {
    pub module: String,
    pub info: ModuleInfo,
    pub selections: RecordedSelections,
}

/// Copy instructions for one mod, produced before anything is staged.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub mod_name: String,
    pub entries: Vec<PlanEntry>,
    pub archive: Option<String>,
    pub script: Option<ScriptSummary>,
}

impl InstallPlan {
    /// Script identity used to key remembered selections.
    pub fn script_identity(&self) -> Option<&str> {
        self.script.as_ref().map(|script| {
            if script.module.trim().is_empty() {
                self.mod_name.as_str()
            } else {
                script.module.as_str()
            }
        })
    }
}

pub struct Installer<'a> {
    config: &'a GameConfig,
    game: &'a GameContext,
    memory: &'a SelectionMemory,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a GameConfig, game: &'a GameContext, memory: &'a SelectionMemory) -> Self {
        Self {
            config,
            game,
            memory,
        }
    }

    pub fn plan(
        &self,
        extracted: &ExtractedArchive,
        name: Option<&str>,
        selector: &mut dyn Selector,
    ) -> Result<InstallPlan> {
        let archive = Some(extracted.label().to_string()).filter(|label| !label.is_empty());
        match fomod::discover(extracted.root()) {
            Some(location) => {
                let script = ModuleConfig::from_file(&location.config)?;
                let info = location
                    .info
                    .as_deref()
                    .map(ModuleInfo::from_file)
                    .unwrap_or_default();
                let mod_name = pick_name(
                    name,
                    [info.name.as_str(), script.name.as_str(), extracted.label()],
                );
                let identity = if script.name.trim().is_empty() {
                    mod_name.clone()
                } else {
                    script.name.clone()
                };
                let remembered = self.memory.load(&identity);
                tracing::info!(
                    module = %identity,
                    remembered = remembered.is_some(),
                    "running install script"
                );
                let outcome = fomod::run(
                    &script,
                    self.game,
                    remembered.as_ref(),
                    selector,
                    &location.root,
                )?;
                Ok(InstallPlan {
                    mod_name,
                    entries: outcome
                        .files
                        .into_iter()
                        .map(|file| PlanEntry {
                            source: file.source,
                            dest: file.destination,
                        })
                        .collect(),
                    archive,
                    script: Some(ScriptSummary {
                        module: outcome.module,
                        info,
                        selections: outcome.selections,
                    }),
                })
            }
            None => {
                let data_root = find_data_root(
                    extracted.root(),
                    &self.config.marker_folders,
                    &self.config.marker_extensions,
                );
                tracing::info!(
                    root = %data_root.display(),
                    "no install script; staging detected data root"
                );
                let mod_name = pick_name(name, [extracted.label()]);
                Ok(InstallPlan {
                    mod_name,
                    entries: plan_tree(&data_root)?,
                    archive,
                    script: None,
                })
            }
        }
    }

    pub fn remember(&self, plan: &InstallPlan) -> Result<()> {
        if let (Some(identity), Some(script)) = (plan.script_identity(), &plan.script) {
            self.memory.save(identity, &script.selections)?;
        }
        Ok(())
    }
}

fn pick_name<'n>(explicit: Option<&str>, candidates: impl IntoIterator<Item = &'n str>) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|name| !name.is_empty()) {
        return sanitize_dir_name(name);
    }
    for candidate in candidates {
        let cleaned = clean_source_label(candidate);
        if !cleaned.is_empty() {
            return sanitize_dir_name(&cleaned);
        }
    }
    sanitize_dir_name("")
}

/// Shallowest directory (breadth first, sorted) that holds a marker folder or
/// a file with a marker extension. Falls back to `root`.
pub fn find_data_root(root: &Path, marker_folders: &[String], marker_exts: &[String]) -> PathBuf {
    if marker_folders.is_empty() && marker_exts.is_empty() {
        return root.to_path_buf();
    }
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        let mut entries: Vec<(String, PathBuf, bool)> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| !is_ignored_path(&entry.path()))
                .map(|entry| {
                    let is_dir = entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false);
                    (
                        entry.file_name().to_string_lossy().into_owned(),
                        entry.path(),
                        is_dir,
                    )
                })
                .collect(),
            Err(_) => continue,
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let hit = entries.iter().any(|(name, path, is_dir)| {
            if *is_dir {
                marker_folders
                    .iter()
                    .any(|marker| marker.eq_ignore_ascii_case(name))
            } else {
                path.extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy();
                        marker_exts
                            .iter()
                            .any(|marker| marker.eq_ignore_ascii_case(&ext))
                    })
                    .unwrap_or(false)
            }
        });
        if hit {
            return dir;
        }
        if depth < HEURISTIC_DEPTH {
            for (_, path, is_dir) in entries {
                if is_dir {
                    queue.push_back((path, depth + 1));
                }
            }
        }
    }
    root.to_path_buf()
}

fn plan_tree(root: &Path) -> Result<Vec<PlanEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored_path(entry.path()))
    {
        let entry = entry.map_err(|err| Error::Io {
            action: "scan extracted archive".to_string(),
            path: root.to_path_buf(),
            source: err.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(dest) = paths::rel_from_path(root, entry.path()) {
            entries.push(PlanEntry {
                source: entry.path().to_path_buf(),
                dest,
            });
        }
    }
    Ok(entries)
}

/// Strips Nexus-style download suffixes: `SkyUI_5_2_SE-12604-5-2SE` stays
/// readable, `Cool Mod-1234-1-0-1700000000` becomes `Cool Mod`.
pub fn clean_source_label(label: &str) -> String {
    let raw = label.trim().replace('_', " ");
    if raw.is_empty() {
        return String::new();
    }

    let joiner = if raw.contains(" - ") { " - " } else { "-" };
    let parts: Vec<&str> = raw.split('-').collect();
    let mut idx = parts.len();
    let mut numeric_segments: Vec<&str> = Vec::new();

    while idx > 0 {
        let seg = parts[idx - 1].trim();
        if seg.is_empty() {
            idx -= 1;
            continue;
        }
        if seg.chars().all(|c| c.is_ascii_digit()) {
            numeric_segments.push(seg);
            idx -= 1;
        } else {
            break;
        }
    }

    if !numeric_segments.is_empty() {
        let last_len = numeric_segments[0].len();
        if !(last_len >= 6 || numeric_segments.len() >= 2) {
            idx = parts.len();
        }
    }

    let cleaned: Vec<&str> = parts
        .iter()
        .take(idx)
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect();
    cleaned
        .join(joiner)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
