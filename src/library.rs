use crate::{
    config::{read_json, write_json, GameConfig},
    deploy,
    error::{Error, IoResultExt, Result},
    extract::{make_temp_dir, StagingGuard},
    installer::InstallPlan,
    paths::{self, is_ignored_path, is_metadata_file, sanitize_dir_name, CasePolicy},
};
use filetime::{set_file_mtime, FileTime};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

pub const SEPARATOR_SUFFIX: &str = "_separator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModKind {
    #[default]
    Mod,
    Separator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModEntry {
    pub name: String,
    #[serde(default)]
    pub kind: ModKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    pub installed_at: i64,
}

impl ModEntry {
    pub fn is_separator(&self) -> bool {
        self.kind == ModKind::Separator
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LibraryFile {
    mods: Vec<ModEntry>,
}

#[derive(Debug, Clone)]
pub struct StageProgress {
    pub mod_name: String,
    pub current: usize,
    pub total: usize,
}

pub type StageProgressCallback = Arc<dyn Fn(StageProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Path below the mod root, `/` separated, original casing.
    pub rel: String,
    /// Comparison key under the store's case policy.
    pub key: String,
    pub source: PathBuf,
}

/// Lazily walks one mod's staged tree in file-name order.
pub struct ModFiles {
    root: PathBuf,
    policy: CasePolicy,
    walker: Option<walkdir::IntoIter>,
}

impl Iterator for ModFiles {
    type Item = Result<StagedFile>;

    fn next(&mut self) -> Option<Self::Item> {
        let walker = self.walker.as_mut()?;
        loop {
            let entry = match walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    return Some(Err(Error::Io {
                        action: "walk staged mod".to_string(),
                        path: err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                        source: err.into(),
                    }))
                }
            };
            if entry.file_type().is_dir() {
                if is_ignored_path(Path::new(entry.file_name())) {
                    walker.skip_current_dir();
                }
                continue;
            }
            if is_ignored_path(Path::new(entry.file_name())) {
                continue;
            }
            let Some(rel) = paths::rel_from_path(&self.root, entry.path()) else {
                continue;
            };
            if is_metadata_file(&rel) {
                continue;
            }
            return Some(Ok(StagedFile {
                key: self.policy.key(&rel),
                rel,
                source: entry.path().to_path_buf(),
            }));
        }
    }
}

/// Staged mods of one game: isolated directories under `mods/` plus the
/// metadata list in `library.json`.
#[derive(Debug, Clone)]
pub struct ModStore {
    data_dir: PathBuf,
    mods_dir: PathBuf,
    profiles_dir: PathBuf,
    tmp_dir: PathBuf,
    policy: CasePolicy,
    mods: Vec<ModEntry>,
}

impl ModStore {
    pub fn open(config: &GameConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let mut store = Self {
            data_dir: config.data_dir.clone(),
            mods_dir: config.mods_dir(),
            profiles_dir: config.profiles_dir(),
            tmp_dir: config.tmp_dir(),
            policy: config.case_policy,
            mods: Vec::new(),
        };
        store.mods = store.read_file()?.mods;
        Ok(store)
    }

    fn library_path(&self) -> PathBuf {
        self.data_dir.join("library.json")
    }

    fn read_file(&self) -> Result<LibraryFile> {
        let path = self.library_path();
        if !path.exists() {
            return Ok(LibraryFile::default());
        }
        read_json(&path)
    }

    /// Re-reads `library.json` under an exclusive file lock, applies `apply`
    /// and writes the result back, so concurrent installs never lose each
    /// other's entries.
    fn update<R>(&mut self, apply: impl FnOnce(&mut Vec<ModEntry>) -> Result<R>) -> Result<R> {
        let lock_path = self.data_dir.join("library.lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .io_ctx("open", &lock_path)?;
        FileExt::lock_exclusive(&lock).io_ctx("lock", &lock_path)?;

        let mut file = self.read_file()?;
        let result = apply(&mut file.mods)?;
        write_json(&self.library_path(), &file)?;
        self.mods = file.mods;
        Ok(result)
    }

    pub fn reload(&mut self) -> Result<()> {
        self.mods = self.read_file()?.mods;
        Ok(())
    }

    pub fn mods(&self) -> &[ModEntry] {
        &self.mods
    }

    pub fn get(&self, name: &str) -> Option<&ModEntry> {
        self.mods.iter().find(|entry| entry.name == name)
    }

    /// Case-insensitive lookup for names coming from external lists.
    pub fn find(&self, name: &str) -> Option<&ModEntry> {
        self.get(name).or_else(|| {
            self.mods
                .iter()
                .find(|entry| entry.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    pub fn mods_dir(&self) -> &Path {
        &self.mods_dir
    }

    pub fn mod_dir(&self, name: &str) -> PathBuf {
        self.mods_dir.join(name)
    }

    /// Copies every plan entry into a fresh directory and only then publishes
    /// it as `mods/<name>`. A failed copy leaves nothing behind. With
    /// `replace`, an existing mod is swapped out in place and keeps its
    /// position everywhere.
    pub fn stage(
        &mut self,
        plan: &InstallPlan,
        replace: bool,
        progress: Option<&StageProgressCallback>,
    ) -> Result<ModEntry> {
        let name = sanitize_dir_name(&plan.mod_name);
        let existing = self.get(&name).cloned();
        match &existing {
            Some(entry) if entry.is_separator() => {
                return Err(Error::AlreadyExists {
                    kind: "separator",
                    name,
                })
            }
            Some(_) if !replace => {
                return Err(Error::AlreadyExists { kind: "mod", name });
            }
            Some(_) => self.ensure_not_deployed(&name)?,
            None => {}
        }

        let temp = make_temp_dir(&self.tmp_dir, "stage")?;
        let mut guard = StagingGuard::new(temp.clone());
        let total = plan.entries.len();
        for (idx, entry) in plan.entries.iter().enumerate() {
            let dest = paths::join_rel(&temp, &entry.dest);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).io_ctx("create staging dir", parent)?;
            }
            fs::copy(&entry.source, &dest).io_ctx("stage file", &entry.source)?;
            preserve_mtime(&entry.source, &dest);
            if let Some(progress) = progress {
                progress(StageProgress {
                    mod_name: name.clone(),
                    current: idx + 1,
                    total,
                });
            }
        }

        let target = self.mod_dir(&name);
        if target.exists() {
            let retired = make_temp_dir(&self.tmp_dir, "replaced")?.join(&name);
            fs::rename(&target, &retired).io_ctx("retire old mod dir", &target)?;
            if let Err(err) = fs::rename(&temp, &target) {
                let _ = fs::rename(&retired, &target);
                return Err(err).io_ctx("publish staged mod", &target);
            }
            if let Some(parent) = retired.parent() {
                let _ = fs::remove_dir_all(parent);
            }
        } else {
            fs::rename(&temp, &target).io_ctx("publish staged mod", &target)?;
        }
        guard.disarm();

        let entry = ModEntry {
            name: name.clone(),
            kind: ModKind::Mod,
            source: plan.archive.clone(),
            script: plan.script_identity().map(str::to_string),
            installed_at: now_timestamp(),
        };
        let stored = entry.clone();
        self.update(move |mods| {
            match mods.iter_mut().find(|m| m.name == stored.name) {
                Some(slot) => *slot = stored,
                None => mods.push(stored),
            }
            Ok(())
        })?;
        tracing::info!(
            mod_name = %name,
            files = total,
            replaced = existing.is_some(),
            "mod staged"
        );
        Ok(entry)
    }

    /// Staged files of `name`; separators yield nothing.
    pub fn files(&self, name: &str) -> Result<ModFiles> {
        let entry = self.get(name).ok_or_else(|| Error::not_found("mod", name))?;
        let root = self.mod_dir(name);
        let walker = match entry.kind {
            ModKind::Separator => None,
            ModKind::Mod => {
                if !root.is_dir() {
                    return Err(Error::Io {
                        action: "open staged mod".to_string(),
                        path: root,
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "staging directory missing",
                        ),
                    });
                }
                Some(
                    WalkDir::new(&root)
                        .follow_links(false)
                        .sort_by_file_name()
                        .into_iter(),
                )
            }
        };
        Ok(ModFiles {
            root,
            policy: self.policy,
            walker,
        })
    }

    pub fn add_separator(&mut self, name: &str) -> Result<ModEntry> {
        let name = separator_display_name(name.trim()).to_string();
        if name.is_empty() {
            return Err(Error::not_found("separator", name));
        }
        if self.get(&name).is_some() {
            return Err(Error::AlreadyExists {
                kind: "separator",
                name,
            });
        }
        let entry = ModEntry {
            name,
            kind: ModKind::Separator,
            source: None,
            script: None,
            installed_at: now_timestamp(),
        };
        let stored = entry.clone();
        self.update(move |mods| {
            mods.push(stored);
            Ok(())
        })?;
        Ok(entry)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<ModEntry> {
        let entry = self
            .get(old)
            .cloned()
            .ok_or_else(|| Error::not_found("mod", old))?;
        let new = sanitize_dir_name(new);
        if new == old {
            return Ok(entry);
        }
        if self.get(&new).is_some() {
            return Err(Error::AlreadyExists {
                kind: "mod",
                name: new,
            });
        }
        self.ensure_not_deployed(old)?;
        if entry.kind == ModKind::Mod {
            let from = self.mod_dir(old);
            let to = self.mod_dir(&new);
            fs::rename(&from, &to).io_ctx("rename mod dir", &from)?;
        }
        let old_name = old.to_string();
        let new_name = new.clone();
        let renamed = self.update(move |mods| {
            let slot = mods
                .iter_mut()
                .find(|m| m.name == old_name)
                .ok_or_else(|| Error::not_found("mod", old_name.clone()))?;
            slot.name = new_name;
            Ok(slot.clone())
        })?;
        tracing::info!(from = old, to = %new, "mod renamed");
        Ok(renamed)
    }

    /// Deletes the staged tree and the metadata entry. Refused while any
    /// profile's deployment still references the mod.
    pub fn remove(&mut self, name: &str) -> Result<ModEntry> {
        let entry = self
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("mod", name))?;
        self.ensure_not_deployed(name)?;
        if entry.kind == ModKind::Mod {
            let dir = self.mod_dir(name);
            if dir.exists() {
                fs::remove_dir_all(&dir).io_ctx("remove mod dir", &dir)?;
            }
        }
        let target = name.to_string();
        self.update(move |mods| {
            mods.retain(|m| m.name != target);
            Ok(())
        })?;
        tracing::info!(mod_name = name, "mod removed");
        Ok(entry)
    }

    pub fn ensure_not_deployed(&self, name: &str) -> Result<()> {
        for (profile, owners) in deploy::deployed_mods(&self.profiles_dir)? {
            if owners.contains(name) {
                return Err(Error::ModDeployed {
                    name: name.to_string(),
                    profile,
                });
            }
        }
        Ok(())
    }
}

/// `Armor_separator` (the on-disk form other managers use) and `Armor` name
/// the same separator.
pub fn separator_display_name(name: &str) -> &str {
    name.strip_suffix(SEPARATOR_SUFFIX).unwrap_or(name)
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, 0);
    let _ = set_file_mtime(dest, mtime);
}

pub(crate) fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
