use crate::{
    config::{read_json, write_json, GameConfig, DEFAULT_PROFILE},
    deploy,
    error::{Error, IoResultExt, Result},
    library::{separator_display_name, ModKind, ModStore, SEPARATOR_SUFFIX},
    paths::sanitize_dir_name,
    plugins::{parse_loadorder_txt, parse_plugins_txt, PluginEntry},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntry {
    pub name: String,
    pub enabled: bool,
}

/// One switchable configuration over the shared store. `order[0]` has the
/// lowest precedence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub order: Vec<ProfileEntry>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            order: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// Drops names the store no longer has and appends mods it does not list
    /// yet, disabled, at the top.
    pub fn ensure_mods(&mut self, store: &ModStore) {
        self.order.retain(|entry| store.get(&entry.name).is_some());
        for entry in store.mods() {
            if self.position(&entry.name).is_none() {
                self.order.push(ProfileEntry {
                    name: entry.name.clone(),
                    enabled: entry.kind == ModKind::Separator,
                });
            }
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|entry| entry.name == name)
    }

    /// Enabled names in ascending precedence, ready for the resolver.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.name.as_str())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let entry = self
            .order
            .iter_mut()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::not_found("mod", name))?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Moves `name` to `index` (clamped), shifting the others.
    pub fn move_to(&mut self, name: &str, index: usize) -> Result<usize> {
        let from = self
            .position(name)
            .ok_or_else(|| Error::not_found("mod", name))?;
        let entry = self.order.remove(from);
        let index = index.min(self.order.len());
        self.order.insert(index, entry);
        Ok(index)
    }

    pub fn rename_mod(&mut self, old: &str, new: &str) {
        for entry in &mut self.order {
            if entry.name == old {
                entry.name = new.to_string();
            }
        }
    }

    pub fn forget_mod(&mut self, name: &str) {
        self.order.retain(|entry| entry.name != name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    pub line: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparseableLine {
    pub line: usize,
    pub text: String,
}

/// Outcome of reading a third-party list. Problems never abort the import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub rejected: Vec<RejectedLine>,
    pub unparseable: Vec<UnparseableLine>,
    pub created_separators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModlistLine {
    pub line: usize,
    pub name: String,
    pub enabled: bool,
    pub separator: bool,
}

/// Parses an MO2 `modlist.txt`. Lines come back in file order, which is
/// highest precedence first.
pub fn parse_modlist(text: &str) -> (Vec<ModlistLine>, Vec<UnparseableLine>) {
    let mut entries = Vec::new();
    let mut bad = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut chars = line.chars();
        let marker = chars.next();
        let name = chars.as_str().trim();
        let enabled = match marker {
            Some('+') | Some('*') => true,
            Some('-') => false,
            _ => {
                bad.push(UnparseableLine {
                    line: idx + 1,
                    text: raw.to_string(),
                });
                continue;
            }
        };
        if name.is_empty() {
            bad.push(UnparseableLine {
                line: idx + 1,
                text: raw.to_string(),
            });
            continue;
        }
        entries.push(ModlistLine {
            line: idx + 1,
            name: name.to_string(),
            enabled,
            separator: name.ends_with(SEPARATOR_SUFFIX),
        });
    }
    (entries, bad)
}

/// Replaces the profile's mod order with an MO2 list. Unknown mods are
/// reported, unknown separators are created, and store mods the list does not
/// mention stay in the profile disabled at the lowest positions.
pub fn import_modlist(profile: &mut Profile, store: &mut ModStore, text: &str) -> Result<ImportReport> {
    let (lines, unparseable) = parse_modlist(text);
    let mut report = ImportReport {
        unparseable,
        ..ImportReport::default()
    };
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for line in lines.into_iter().rev() {
        let name = if line.separator {
            let display = separator_display_name(&line.name).to_string();
            match store.find(&display) {
                Some(entry) if entry.kind == ModKind::Separator => entry.name.clone(),
                Some(_) => {
                    report.rejected.push(RejectedLine {
                        line: line.line,
                        name: line.name,
                    });
                    continue;
                }
                None => {
                    let created = store.add_separator(&display)?;
                    report.created_separators.push(created.name.clone());
                    created.name
                }
            }
        } else {
            match store.find(&line.name) {
                Some(entry) if entry.kind == ModKind::Mod => entry.name.clone(),
                _ => {
                    tracing::warn!(line = line.line, name = %line.name, "unknown mod in imported list");
                    report.rejected.push(RejectedLine {
                        line: line.line,
                        name: line.name,
                    });
                    continue;
                }
            }
        };
        if !seen.insert(name.clone()) {
            report.rejected.push(RejectedLine {
                line: line.line,
                name: line.name,
            });
            continue;
        }
        report.imported.push(name.clone());
        ordered.push(ProfileEntry {
            name,
            enabled: line.enabled || line.separator,
        });
    }

    let mut order: Vec<ProfileEntry> = store
        .mods()
        .iter()
        .filter(|entry| !seen.contains(&entry.name))
        .map(|entry| ProfileEntry {
            name: entry.name.clone(),
            enabled: false,
        })
        .collect();
    order.extend(ordered);
    profile.order = order;
    report.rejected.sort_by_key(|rejected| rejected.line);
    report.imported.reverse();
    tracing::info!(
        profile = %profile.name,
        imported = report.imported.len(),
        rejected = report.rejected.len(),
        unparseable = report.unparseable.len(),
        "mod list imported"
    );
    Ok(report)
}

pub fn export_modlist(profile: &Profile, store: &ModStore) -> String {
    let mut out = String::new();
    for entry in profile.order.iter().rev() {
        let separator = store.get(&entry.name).is_some_and(|m| m.is_separator());
        if separator {
            out.push('-');
            out.push_str(&entry.name);
            out.push_str(SEPARATOR_SUFFIX);
        } else {
            out.push(if entry.enabled { '+' } else { '-' });
            out.push_str(&entry.name);
        }
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginListFormat {
    /// `plugins.txt` with `*` enable markers.
    Plugins,
    /// `loadorder.txt`: order only, enable flags are kept from the profile.
    LoadOrder,
}

/// Replaces the profile's plugin order. Names that are not plugin files or
/// that nothing known provides are rejected; implicit plugins are skipped.
pub fn import_plugins(
    profile: &mut Profile,
    text: &str,
    format: PluginListFormat,
    known: &HashSet<String>,
    extensions: &[String],
    implicit: &[&str],
) -> ImportReport {
    let mut report = ImportReport::default();
    let entries: Vec<(usize, PluginEntry)> = match format {
        PluginListFormat::Plugins => numbered(text)
            .into_iter()
            .filter_map(|(line, raw)| {
                parse_plugins_txt(&raw).into_iter().next().map(|entry| (line, entry))
            })
            .collect(),
        PluginListFormat::LoadOrder => numbered(text)
            .into_iter()
            .filter_map(|(line, raw)| {
                parse_loadorder_txt(&raw).into_iter().next().map(|name| {
                    let enabled = profile
                        .plugins
                        .iter()
                        .find(|p| p.name.eq_ignore_ascii_case(&name))
                        .map(|p| p.enabled)
                        .unwrap_or(true);
                    (line, PluginEntry { name, enabled })
                })
            })
            .collect(),
    };
    let implicit: HashSet<String> = implicit.iter().map(|name| name.to_lowercase()).collect();
    let mut seen = HashSet::new();
    let mut plugins = Vec::new();
    for (line, entry) in entries {
        let lower = entry.name.to_lowercase();
        let has_ext = Path::new(&entry.name)
            .extension()
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(&ext.to_string_lossy())))
            .unwrap_or(false);
        if !has_ext {
            report.unparseable.push(UnparseableLine {
                line,
                text: entry.name,
            });
            continue;
        }
        if implicit.contains(&lower) {
            continue;
        }
        if !known.contains(&lower) || !seen.insert(lower) {
            report.rejected.push(RejectedLine {
                line,
                name: entry.name,
            });
            continue;
        }
        report.imported.push(entry.name.clone());
        plugins.push(entry);
    }
    profile.plugins = plugins;
    tracing::info!(
        profile = %profile.name,
        imported = report.imported.len(),
        rejected = report.rejected.len(),
        "plugin list imported"
    );
    report
}

fn numbered(text: &str) -> Vec<(usize, String)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.to_string()))
        .collect()
}

/// Profile files under `profiles/<name>/profile.json`.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    dir: PathBuf,
}

impl ProfileManager {
    pub fn new(config: &GameConfig) -> Self {
        Self {
            dir: config.profiles_dir(),
        }
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.dir.join(name).join("profile.json")
    }

    pub fn profile_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        is_profile_name(name) && self.profile_path(name).is_file()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err).io_ctx("list profiles", &self.dir),
        };
        for entry in entries.flatten() {
            if entry.path().join("profile.json").is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort_by_key(|name| name.to_lowercase());
        Ok(names)
    }

    /// Loads `name`; the default profile is created on first use.
    pub fn load(&self, name: &str) -> Result<Profile> {
        if !is_profile_name(name) {
            return Err(Error::not_found("profile", name));
        }
        let path = self.profile_path(name);
        if !path.exists() {
            if name == DEFAULT_PROFILE {
                let profile = Profile::new(name);
                self.save(&profile)?;
                return Ok(profile);
            }
            return Err(Error::not_found("profile", name));
        }
        read_json(&path)
    }

    pub fn save(&self, profile: &Profile) -> Result<()> {
        let dir = self.profile_dir(&profile.name);
        fs::create_dir_all(&dir).io_ctx("create profile dir", &dir)?;
        write_json(&self.profile_path(&profile.name), profile)
    }

    pub fn create(&self, name: &str, clone_from: Option<&str>) -> Result<Profile> {
        let name = sanitize_dir_name(name);
        if self.exists(&name) {
            return Err(Error::AlreadyExists {
                kind: "profile",
                name,
            });
        }
        let mut profile = match clone_from {
            Some(source) => self.load(source)?,
            None => Profile::new(&name),
        };
        profile.name = name;
        self.save(&profile)?;
        tracing::info!(profile = %profile.name, cloned_from = ?clone_from, "profile created");
        Ok(profile)
    }

    pub fn rename(&self, old: &str, new: &str, config: &GameConfig) -> Result<Profile> {
        let mut profile = self.load(old)?;
        let new = sanitize_dir_name(new);
        if self.exists(&new) {
            return Err(Error::AlreadyExists {
                kind: "profile",
                name: new,
            });
        }
        self.ensure_not_deployed(old, config)?;
        let from = self.profile_dir(old);
        let to = self.profile_dir(&new);
        fs::rename(&from, &to).io_ctx("rename profile dir", &from)?;
        profile.name = new;
        self.save(&profile)?;
        tracing::info!(from = old, to = %profile.name, "profile renamed");
        Ok(profile)
    }

    pub fn remove(&self, name: &str, config: &GameConfig) -> Result<()> {
        if !self.exists(name) {
            return Err(Error::not_found("profile", name));
        }
        if config.active_profile == name {
            return Err(Error::ProfileInUse {
                name: name.to_string(),
                reason: "active",
            });
        }
        self.ensure_not_deployed(name, config)?;
        let dir = self.profile_dir(name);
        fs::remove_dir_all(&dir).io_ctx("remove profile dir", &dir)?;
        tracing::info!(profile = name, "profile removed");
        Ok(())
    }

    fn ensure_not_deployed(&self, name: &str, config: &GameConfig) -> Result<()> {
        if deploy::live_profiles(config)?.iter().any(|live| live == name) {
            return Err(Error::ProfileInUse {
                name: name.to_string(),
                reason: "deployed",
            });
        }
        Ok(())
    }

    /// Every profile, with `apply` run over each and saved back.
    pub fn update_all(&self, mut apply: impl FnMut(&mut Profile)) -> Result<()> {
        for name in self.list()? {
            let mut profile = self.load(&name)?;
            apply(&mut profile);
            self.save(&profile)?;
        }
        Ok(())
    }
}

// Names that sanitize to themselves stay inside the profiles directory.
fn is_profile_name(name: &str) -> bool {
    sanitize_dir_name(name) == name
}
