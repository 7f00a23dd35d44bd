use crate::{
    config::{read_json, write_json, GameConfig},
    error::{Error, IoResultExt, Result},
    library::now_timestamp,
    paths::{join_rel, rel_from_path, resolve_existing_case, CasePolicy},
    resolve::{Resolution, Winner},
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs, io,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const RECORD_FILE: &str = "deployment.json";
const JOURNAL_FILE: &str = "deployment.journal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Hardlink on the same filesystem, symlink across filesystems, copy when
    /// neither works.
    #[default]
    Auto,
    Hardlink,
    Symlink,
    Copy,
}

impl LinkMode {
    pub fn label(self) -> &'static str {
        match self {
            LinkMode::Auto => "auto",
            LinkMode::Hardlink => "hardlink",
            LinkMode::Symlink => "symlink",
            LinkMode::Copy => "copy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(LinkMode::Auto),
            "hardlink" | "hard" => Some(LinkMode::Hardlink),
            "symlink" | "soft" => Some(LinkMode::Symlink),
            "copy" => Some(LinkMode::Copy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Hardlink,
    Symlink,
    Copy,
}

impl Placement {
    pub fn label(self) -> &'static str {
        match self {
            Placement::Hardlink => "hardlink",
            Placement::Symlink => "symlink",
            Placement::Copy => "copy",
        }
    }
}

/// What identifies a placed file as ours when the directory is inspected
/// again later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Proof {
    Inode { dev: u64, ino: u64 },
    Symlink { target: PathBuf },
    Content { len: u64, hash: String },
}

impl Proof {
    fn of_source(placement: Placement, source: &Path) -> io::Result<Self> {
        match placement {
            #[cfg(unix)]
            Placement::Hardlink => {
                let meta = fs::metadata(source)?;
                Ok(Proof::Inode {
                    dev: meta.dev(),
                    ino: meta.ino(),
                })
            }
            Placement::Symlink => Ok(Proof::Symlink {
                target: source.to_path_buf(),
            }),
            _ => content_proof(source),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        match self {
            #[cfg(unix)]
            Proof::Inode { dev, ino } => {
                meta.file_type().is_file() && meta.dev() == *dev && meta.ino() == *ino
            }
            #[cfg(not(unix))]
            Proof::Inode { .. } => false,
            Proof::Symlink { target } => {
                meta.file_type().is_symlink()
                    && fs::read_link(path).is_ok_and(|link| &link == target)
            }
            Proof::Content { len, hash } => {
                meta.file_type().is_file()
                    && meta.len() == *len
                    && content_proof(path).is_ok_and(|proof| {
                        matches!(proof, Proof::Content { hash: found, .. } if &found == hash)
                    })
            }
        }
    }
}

fn content_proof(path: &Path) -> io::Result<Proof> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let len = io::copy(&mut file, &mut hasher)?;
    Ok(Proof::Content {
        len,
        hash: hasher.finalize().to_hex().to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedEntry {
    /// On-disk spelling below the target root.
    pub rel: String,
    pub mod_name: String,
    pub source: PathBuf,
    pub method: Placement,
    /// A foreign file was at this path and now sits in the shadow directory.
    pub shadowed: bool,
    pub proof: Proof,
}

/// Everything one profile has placed into the game directory. Only written
/// once the filesystem work it describes is done.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub profile: String,
    pub target_root: PathBuf,
    #[serde(default)]
    pub deployed_at: i64,
    #[serde(default)]
    pub entries: BTreeMap<String, DeployedEntry>,
    #[serde(default)]
    pub created_dirs: BTreeSet<String>,
}

impl DeploymentRecord {
    fn new(profile: &str, target_root: &Path) -> Self {
        Self {
            profile: profile.to_string(),
            target_root: target_root.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn load(config: &GameConfig, profile: &str) -> Result<Option<Self>> {
        let path = record_path(config, profile);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.created_dirs.is_empty()
    }

    pub fn owners(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .map(|entry| entry.mod_name.clone())
            .collect()
    }

    /// True when the record places exactly what `resolution` asks for.
    pub fn matches(&self, resolution: &Resolution) -> bool {
        self.entries.len() == resolution.len()
            && resolution.winners().iter().all(|(key, winner)| {
                self.entries
                    .get(key)
                    .is_some_and(|entry| entry.mod_name == winner.owner && entry.source == winner.source)
            })
    }

    fn commit(&self, config: &GameConfig) -> Result<()> {
        let path = record_path(config, &self.profile);
        if self.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).io_ctx("remove deployment record", &path),
            };
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_ctx("create profile dir", parent)?;
        }
        write_json(&path, self)
    }
}

fn record_path(config: &GameConfig, profile: &str) -> PathBuf {
    config.profiles_dir().join(profile).join(RECORD_FILE)
}

fn journal_path(config: &GameConfig, profile: &str) -> PathBuf {
    config.profiles_dir().join(profile).join(JOURNAL_FILE)
}

/// A deploy or restore for `profile` stopped before it finished.
pub fn is_interrupted(config: &GameConfig, profile: &str) -> bool {
    journal_path(config, profile).exists()
}

fn shadow_root(config: &GameConfig, profile: &str) -> PathBuf {
    config.shadow_dir().join(profile)
}

/// Profiles with a deployment on disk, keyed to the mods they placed.
pub fn deployed_mods(profiles_dir: &Path) -> Result<Vec<(String, BTreeSet<String>)>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(profiles_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err).io_ctx("list profiles", profiles_dir),
    };
    for entry in entries.flatten() {
        let path = entry.path().join(RECORD_FILE);
        if !path.is_file() {
            continue;
        }
        let record: DeploymentRecord = read_json(&path)?;
        if !record.entries.is_empty() {
            out.push((record.profile.clone(), record.owners()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Profiles holding a record or an unfinished journal.
pub fn live_profiles(config: &GameConfig) -> Result<Vec<String>> {
    let dir = config.profiles_dir();
    let mut out = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err).io_ctx("list profiles", &dir),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.join(RECORD_FILE).is_file() || path.join(JOURNAL_FILE).is_file() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

/// Exclusive right to mutate one game directory. A second holder is turned
/// away immediately.
#[derive(Debug)]
pub struct DeployLock {
    _file: fs::File,
    path: PathBuf,
}

impl DeployLock {
    pub fn acquire(config: &GameConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).io_ctx("create data dir", &config.data_dir)?;
        let path = config.data_dir.join("deploy.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .io_ctx("open", &path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Err(Error::Busy {
                game_dir: config.game_dir.clone(),
            }),
            Err(err) => Err(err).io_ctx("lock", &path),
        }
    }

    /// Blocks until the current holder is done. For short metadata updates
    /// that only need to stay out of a running deploy's way.
    pub fn wait(config: &GameConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).io_ctx("create data dir", &config.data_dir)?;
        let path = config.data_dir.join("deploy.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .io_ctx("open", &path)?;
        FileExt::lock_exclusive(&file).io_ctx("lock", &path)?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Removing,
    Placing,
}

#[derive(Debug, Clone)]
pub struct DeployProgress {
    pub phase: DeployPhase,
    pub current: usize,
    pub total: usize,
}

pub type DeployProgressCallback = Arc<dyn Fn(DeployProgress) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct DeployReport {
    pub profile: String,
    pub placed: usize,
    pub removed: usize,
    pub kept: usize,
    pub shadowed: usize,
    pub restored: usize,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
    pub link_summary: String,
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Intent {
    Place {
        key: String,
        entry: DeployedEntry,
        #[serde(default)]
        created_dirs: Vec<String>,
    },
    Unlink {
        key: String,
        entry: DeployedEntry,
    },
}

/// Append-only log of operations about to touch the game directory.
struct Journal {
    path: PathBuf,
    file: fs::File,
}

impl Journal {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_ctx("create profile dir", parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .io_ctx("open journal", &path)?;
        Ok(Self { path, file })
    }

    fn log(&mut self, intent: &Intent) -> Result<()> {
        let line = serde_json::to_string(intent).map_err(|source| Error::State {
            path: self.path.clone(),
            source,
        })?;
        writeln!(self.file, "{line}").io_ctx("write journal", &self.path)?;
        self.file.sync_data().io_ctx("sync journal", &self.path)?;
        Ok(())
    }

    fn read(path: &Path) -> Result<Vec<Intent>> {
        let file = fs::File::open(path).io_ctx("open journal", path)?;
        let mut intents = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.io_ctx("read journal", path)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(intent) => intents.push(intent),
                Err(err) => {
                    tracing::warn!(line = idx + 1, "torn journal line ignored: {err}");
                }
            }
        }
        Ok(intents)
    }
}

fn remove_journal(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).io_ctx("remove journal", path),
    }
}

/// Replays an interrupted deploy or restore of `profile` by inspecting the
/// game directory for every journaled intent, then commits the reconciled
/// record. Returns false when there was nothing to recover.
pub fn recover(config: &GameConfig, profile: &str, _lock: &DeployLock) -> Result<bool> {
    let journal = journal_path(config, profile);
    if !journal.exists() {
        return Ok(false);
    }
    let target_root = config.deploy_dir();
    let shadows = shadow_root(config, profile);
    let mut record = DeploymentRecord::load(config, profile)?
        .unwrap_or_else(|| DeploymentRecord::new(profile, &target_root));
    let intents = Journal::read(&journal)?;
    let root = record.target_root.clone();

    // Within one pass a later intent for a path supersedes earlier ones, so
    // only the last intent per key describes what the disk should hold.
    let mut last: BTreeMap<String, (DeployedEntry, bool)> = BTreeMap::new();
    for intent in intents {
        match intent {
            Intent::Unlink { key, entry } => {
                last.insert(key, (entry, false));
            }
            Intent::Place {
                key,
                entry,
                created_dirs,
            } => {
                for dir in created_dirs {
                    if join_rel(&root, &dir).is_dir() {
                        record.created_dirs.insert(dir);
                    }
                }
                last.insert(key, (entry, true));
            }
        }
    }

    for (key, (entry, placing)) in last {
        let dest = join_rel(&root, &entry.rel);
        let shadow = join_rel(&shadows, &entry.rel);
        // A shadowed placement only happened once the original left for the
        // shadow directory; before that, dest is still the original.
        let original_moved = !entry.shadowed || fs::symlink_metadata(&shadow).is_ok();
        if entry.proof.matches(&dest) && (!placing || original_moved) {
            record.entries.insert(key, entry);
            continue;
        }
        let committed_live = record
            .entries
            .get(&key)
            .is_some_and(|committed| committed.proof.matches(&join_rel(&root, &committed.rel)));
        if committed_live {
            continue;
        }
        record.entries.remove(&key);
        if entry.shadowed {
            settle_shadow(&shadow, &dest, config, profile);
        }
    }

    record.commit(config)?;
    remove_journal(&journal)?;
    tracing::warn!(
        profile,
        entries = record.entries.len(),
        "recovered interrupted deployment"
    );
    Ok(true)
}

// A shadowed original goes back when its path is free; otherwise it is stale.
fn settle_shadow(shadow: &Path, dest: &Path, config: &GameConfig, profile: &str) {
    if fs::symlink_metadata(shadow).is_err() {
        return;
    }
    if fs::symlink_metadata(dest).is_err() {
        if let Err(err) = move_path(shadow, dest) {
            tracing::warn!(path = ?dest, "could not restore shadowed file: {err}");
        }
        return;
    }
    if let Err(err) = orphan(shadow, config, profile) {
        tracing::warn!(path = ?shadow, "could not move stale shadow: {err}");
    }
}

fn orphan(path: &Path, config: &GameConfig, profile: &str) -> Result<PathBuf> {
    let shadows = shadow_root(config, profile);
    let rel = rel_from_path(&shadows, path).unwrap_or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let dest = join_rel(
        &config
            .orphans_dir()
            .join(profile)
            .join(now_timestamp().to_string()),
        &rel,
    );
    move_path(path, &dest).io_ctx("move orphan", path)?;
    tracing::warn!(from = ?path, to = ?dest, "orphaned stale shadow");
    Ok(dest)
}

#[cfg(unix)]
fn filesystem_id(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path).io_ctx("stat", path)?.dev())
}

#[cfg(not(unix))]
fn filesystem_id(path: &Path) -> Result<u64> {
    let _ = path;
    Ok(0)
}

#[cfg(unix)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink unavailable on this platform",
    ))
}

fn place_file(source: &Path, dest: &Path, placement: Placement) -> io::Result<()> {
    match placement {
        Placement::Hardlink => fs::hard_link(source, dest),
        Placement::Symlink => create_symlink(source, dest),
        Placement::Copy => {
            let mut partial = dest.as_os_str().to_owned();
            partial.push(".stagecraft-part");
            let partial = PathBuf::from(partial);
            fs::copy(source, &partial)?;
            fs::rename(&partial, dest).inspect_err(|_| {
                let _ = fs::remove_file(&partial);
            })
        }
    }
}

/// Renames when possible, copies across filesystems.
fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        create_symlink(&fs::read_link(from)?, to)?;
    } else {
        fs::copy(from, to)?;
    }
    fs::remove_file(from)
}

fn remove_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Picks the placement for `auto`: same device as staging means hardlink.
struct LinkModeCache {
    mode: LinkMode,
    preferred: Placement,
    used: HashSet<Placement>,
}

impl LinkModeCache {
    fn new(mode: LinkMode, staging_root: &Path, target_root: &Path) -> Result<Self> {
        let preferred = match mode {
            LinkMode::Hardlink => Placement::Hardlink,
            LinkMode::Symlink => Placement::Symlink,
            LinkMode::Copy => Placement::Copy,
            LinkMode::Auto => {
                fs::create_dir_all(staging_root).io_ctx("create staging root", staging_root)?;
                if filesystem_id(staging_root)? == filesystem_id(target_root)? {
                    Placement::Hardlink
                } else {
                    Placement::Symlink
                }
            }
        };
        Ok(Self {
            mode,
            preferred,
            used: HashSet::new(),
        })
    }

    fn fallback(&self, placement: Placement) -> Option<Placement> {
        match (self.mode, placement) {
            (LinkMode::Auto, Placement::Hardlink) => Some(Placement::Symlink),
            (LinkMode::Auto, Placement::Symlink) => Some(Placement::Copy),
            _ => None,
        }
    }

    fn summary(&self) -> String {
        match self.used.len() {
            0 => "none".to_string(),
            1 => self
                .used
                .iter()
                .next()
                .map(|placement| placement.label().to_string())
                .unwrap_or_default(),
            _ => "mixed".to_string(),
        }
    }
}

/// Synchronizes the game directory with a winning-path map for one profile.
pub struct Deployer<'a> {
    config: &'a GameConfig,
    profile: String,
    progress: Option<DeployProgressCallback>,
    cancel: Option<CancelToken>,
}

struct Pass<'a> {
    config: &'a GameConfig,
    profile: &'a str,
    target_root: PathBuf,
    shadows: PathBuf,
    policy: CasePolicy,
    journal: Journal,
    record: DeploymentRecord,
    report: DeployReport,
}

impl<'a> Deployer<'a> {
    pub fn new(config: &'a GameConfig, profile: &str) -> Self {
        Self {
            config,
            profile: profile.to_string(),
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, progress: DeployProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Makes the game directory hold exactly `resolution` for this profile.
    /// Any other profile still deployed is restored first.
    pub fn deploy(&self, lock: &DeployLock, resolution: &Resolution) -> Result<DeployReport> {
        for other in live_profiles(self.config)? {
            if other != self.profile {
                tracing::info!(profile = %other, "restoring other profile before deploy");
                Deployer::new(self.config, &other).restore(lock)?;
            }
        }
        self.sync(lock, resolution)
    }

    /// Removes everything this profile placed and puts shadowed originals
    /// back. Running it again does nothing.
    pub fn restore(&self, lock: &DeployLock) -> Result<DeployReport> {
        self.sync(lock, &Resolution::empty(self.config.case_policy))
    }

    fn sync(&self, lock: &DeployLock, resolution: &Resolution) -> Result<DeployReport> {
        let recovered = recover(self.config, &self.profile, lock)?;
        let target_root = self.config.deploy_dir();
        let mut existing = DeploymentRecord::load(self.config, &self.profile)?;
        let moved_from = existing
            .as_ref()
            .map(|record| record.target_root.clone())
            .filter(|root| root != &target_root && !resolution.is_empty());
        if let Some(old_root) = moved_from {
            tracing::info!(
                profile = %self.profile,
                from = ?old_root,
                to = ?target_root,
                "deploy root moved; restoring the old one first"
            );
            self.restore(lock)?;
            existing = DeploymentRecord::load(self.config, &self.profile)?;
        }
        if existing.is_none() && resolution.is_empty() {
            return Ok(DeployReport {
                profile: self.profile.clone(),
                link_summary: "none".to_string(),
                recovered,
                ..DeployReport::default()
            });
        }
        if !self.config.game_dir.is_dir() {
            return Err(Error::not_found(
                "game directory",
                self.config.game_dir.to_string_lossy(),
            ));
        }
        fs::create_dir_all(&target_root).io_ctx("create deploy dir", &target_root)?;

        let record = existing.unwrap_or_else(|| DeploymentRecord::new(&self.profile, &target_root));
        let record_root = record.target_root.clone();
        let mut pass = Pass {
            config: self.config,
            profile: &self.profile,
            target_root: record_root,
            shadows: shadow_root(self.config, &self.profile),
            policy: resolution.policy(),
            journal: Journal::open(journal_path(self.config, &self.profile))?,
            record,
            report: DeployReport {
                profile: self.profile.clone(),
                recovered,
                ..DeployReport::default()
            },
        };

        pass.reconcile();
        let removals = pass.removals(resolution);
        let links = LinkModeCache::new(self.config.link_mode, &self.config.mods_dir(), &target_root)?;
        let result = self.run(&mut pass, resolution, removals, &target_root, links);
        match result {
            Ok(links) => {
                let clear_all = resolution.is_empty();
                pass.prune_dirs(clear_all);
                pass.record.target_root = target_root;
                pass.record.deployed_at = now_timestamp();
                pass.record.commit(self.config)?;
                remove_journal(&pass.journal.path)?;
                pass.report.link_summary = links.summary();
                pass.report.kept = pass.record.entries.len().saturating_sub(pass.report.placed);
                tracing::info!(
                    profile = %self.profile,
                    placed = pass.report.placed,
                    removed = pass.report.removed,
                    shadowed = pass.report.shadowed,
                    restored = pass.report.restored,
                    mode = %pass.report.link_summary,
                    "deployment synchronized"
                );
                Ok(pass.report)
            }
            Err(err) => {
                tracing::warn!(profile = %self.profile, "deployment interrupted: {err}");
                drop(pass);
                recover(self.config, &self.profile, lock)?;
                Err(err)
            }
        }
    }

    fn run(
        &self,
        pass: &mut Pass<'_>,
        resolution: &Resolution,
        removals: Vec<String>,
        target_root: &Path,
        mut links: LinkModeCache,
    ) -> Result<LinkModeCache> {
        let total = removals.len();
        for (idx, key) in removals.into_iter().enumerate() {
            self.checkpoint(DeployPhase::Removing, idx, total)?;
            pass.unlink(&key)?;
        }

        let additions: Vec<(&String, &Winner)> = resolution
            .winners()
            .iter()
            .filter(|(key, _)| !pass.record.entries.contains_key(*key))
            .collect();
        let total = additions.len();
        for (idx, (key, winner)) in additions.into_iter().enumerate() {
            self.checkpoint(DeployPhase::Placing, idx, total)?;
            pass.place(key, winner, target_root, &mut links)?;
        }
        Ok(links)
    }

    fn checkpoint(&self, phase: DeployPhase, current: usize, total: usize) -> Result<()> {
        if let Some(progress) = &self.progress {
            progress(DeployProgress {
                phase,
                current,
                total,
            });
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl Pass<'_> {
    // Anything changed behind our back since the last commit is forgotten,
    // never deleted.
    fn reconcile(&mut self) {
        let stale: Vec<String> = self
            .record
            .entries
            .iter()
            .filter(|(_, entry)| !entry.proof.matches(&join_rel(&self.target_root, &entry.rel)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            let Some(entry) = self.record.entries.remove(&key) else {
                continue;
            };
            let dest = join_rel(&self.target_root, &entry.rel);
            let message = format!("{} was changed outside the manager; left alone", entry.rel);
            tracing::warn!(path = %entry.rel, "deployed file changed externally");
            self.report.warnings.push(message);
            if entry.shadowed {
                let shadow = join_rel(&self.shadows, &entry.rel);
                let absent = fs::symlink_metadata(&dest).is_err();
                settle_shadow(&shadow, &dest, self.config, self.profile);
                if absent && fs::symlink_metadata(&dest).is_ok() {
                    self.report.restored += 1;
                }
            }
        }
    }

    fn removals(&self, resolution: &Resolution) -> Vec<String> {
        self.record
            .entries
            .iter()
            .filter(|(key, entry)| match resolution.winners().get(*key) {
                None => true,
                Some(winner) => {
                    winner.owner != entry.mod_name
                        || winner.source != entry.source
                        || !source_unchanged(entry)
                }
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn unlink(&mut self, key: &str) -> Result<()> {
        let Some(entry) = self.record.entries.get(key).cloned() else {
            return Ok(());
        };
        self.journal.log(&Intent::Unlink {
            key: key.to_string(),
            entry: entry.clone(),
        })?;
        let dest = join_rel(&self.target_root, &entry.rel);
        if entry.proof.matches(&dest) {
            fs::remove_file(&dest).io_ctx("remove deployed file", &dest)?;
        }
        if entry.shadowed {
            let shadow = join_rel(&self.shadows, &entry.rel);
            if fs::symlink_metadata(&shadow).is_ok() {
                move_path(&shadow, &dest).io_ctx("restore shadowed file", &shadow)?;
                remove_empty_parents(&shadow, &self.shadows);
                self.report.restored += 1;
            }
        }
        self.record.entries.remove(key);
        self.report.removed += 1;
        tracing::debug!(path = %entry.rel, mod_name = %entry.mod_name, "unlinked");
        Ok(())
    }

    fn place(
        &mut self,
        key: &str,
        winner: &Winner,
        target_root: &Path,
        links: &mut LinkModeCache,
    ) -> Result<()> {
        let dest = match self.policy {
            CasePolicy::Insensitive => resolve_existing_case(target_root, &winner.rel),
            CasePolicy::Sensitive => join_rel(target_root, &winner.rel),
        };
        let rel = rel_from_path(target_root, &dest).unwrap_or_else(|| winner.rel.clone());
        let shadowed = match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => {
                tracing::warn!(path = %rel, "directory in the way of a deployed file; skipped");
                self.report.skipped.push(rel);
                return Ok(());
            }
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err).io_ctx("inspect", &dest),
        };

        let mut created_dirs = Vec::new();
        let mut dir = dest.parent();
        while let Some(current) = dir {
            if current == target_root || fs::symlink_metadata(current).is_ok() {
                break;
            }
            if let Some(dir_rel) = rel_from_path(target_root, current) {
                created_dirs.push(dir_rel);
            }
            dir = current.parent();
        }
        created_dirs.reverse();

        // A shadow present at journal time must be this original.
        let shadow = join_rel(&self.shadows, &rel);
        if shadowed && fs::symlink_metadata(&shadow).is_ok() {
            orphan(&shadow, self.config, self.profile)?;
        }

        let mut placement = links.preferred;
        loop {
            let entry = DeployedEntry {
                rel: rel.clone(),
                mod_name: winner.owner.clone(),
                source: winner.source.clone(),
                method: placement,
                shadowed,
                proof: Proof::of_source(placement, &winner.source)
                    .io_ctx("read staged file", &winner.source)?,
            };
            self.journal.log(&Intent::Place {
                key: key.to_string(),
                entry: entry.clone(),
                created_dirs: created_dirs.clone(),
            })?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).io_ctx("create game dir", parent)?;
            }
            self.record.created_dirs.extend(created_dirs.iter().cloned());
            if shadowed && fs::symlink_metadata(&dest).is_ok() {
                move_path(&dest, &shadow).io_ctx("shadow existing file", &dest)?;
            }
            match place_file(&winner.source, &dest, placement) {
                Ok(()) => {
                    links.used.insert(placement);
                    if shadowed {
                        self.report.shadowed += 1;
                    }
                    self.record.entries.insert(key.to_string(), entry);
                    self.report.placed += 1;
                    tracing::debug!(path = %rel, mod_name = %winner.owner, method = placement.label(), "placed");
                    return Ok(());
                }
                Err(err) => match links.fallback(placement) {
                    Some(next) => {
                        tracing::debug!(path = %rel, "{} failed ({err}); trying {}", placement.label(), next.label());
                        placement = next;
                    }
                    None => {
                        if shadowed && fs::symlink_metadata(&dest).is_err() {
                            let _ = move_path(&shadow, &dest);
                        }
                        return Err(err).io_ctx(placement.label(), &dest);
                    }
                },
            }
        }
    }

    fn prune_dirs(&mut self, clear_all: bool) {
        let dirs: Vec<String> = self.record.created_dirs.iter().rev().cloned().collect();
        for rel in dirs {
            let path = join_rel(&self.target_root, &rel);
            let gone = match fs::symlink_metadata(&path) {
                Err(_) => true,
                Ok(meta) if meta.is_dir() => fs::remove_dir(&path).is_ok(),
                Ok(_) => false,
            };
            if gone || clear_all {
                self.record.created_dirs.remove(&rel);
            }
        }
    }
}

// The staged bytes behind an entry are still the ones that were placed.
fn source_unchanged(entry: &DeployedEntry) -> bool {
    match &entry.proof {
        Proof::Symlink { target } => target == &entry.source && entry.source.is_file(),
        proof => Proof::of_source(entry.method, &entry.source).is_ok_and(|now| &now == proof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{game::GameKind, library::StagedFile, resolve::Resolver};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        config: GameConfig,
    }

    fn fixture(mode: LinkMode) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = GameConfig::standalone(
            "g",
            GameKind::Generic,
            temp.path().join("game"),
            temp.path().join("data"),
        );
        config.link_mode = mode;
        config.ensure_dirs().unwrap();
        fs::create_dir_all(&config.game_dir).unwrap();
        Fixture {
            _temp: temp,
            config,
        }
    }

    fn stage(config: &GameConfig, name: &str, files: &[(&str, &str)]) {
        for (rel, data) in files {
            let path = join_rel(&config.mods_dir().join(name), rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
    }

    fn resolution(config: &GameConfig, mods: &[(&str, &[&str])]) -> Resolution {
        let mut resolver = Resolver::new(config.case_policy);
        for (name, rels) in mods {
            let files: Vec<Result<StagedFile>> = rels
                .iter()
                .map(|rel| {
                    Ok(StagedFile {
                        rel: rel.to_string(),
                        key: config.case_policy.key(rel),
                        source: join_rel(&config.mods_dir().join(name), rel),
                    })
                })
                .collect();
            resolver.add_mod(name, files).unwrap();
        }
        resolver.finish()
    }

    fn read(config: &GameConfig, rel: &str) -> String {
        fs::read_to_string(join_rel(&config.game_dir, rel)).unwrap()
    }

    #[test]
    fn link_mode_parse() {
        assert_eq!(LinkMode::parse("Hard"), Some(LinkMode::Hardlink));
        assert_eq!(LinkMode::parse("copy"), Some(LinkMode::Copy));
        assert_eq!(LinkMode::parse("nope"), None);
    }

    #[test]
    fn deploy_shadows_and_restore_brings_back() {
        let fx = fixture(LinkMode::Auto);
        let config = &fx.config;
        fs::write(config.game_dir.join("vanilla.txt"), "original").unwrap();
        stage(config, "A", &[("vanilla.txt", "modded"), ("new/deep/file.txt", "new")]);
        let res = resolution(config, &[("A", &["vanilla.txt", "new/deep/file.txt"])]);

        let lock = DeployLock::acquire(config).unwrap();
        let deployer = Deployer::new(config, "Default");
        let report = deployer.deploy(&lock, &res).unwrap();
        assert_eq!(report.placed, 2);
        assert_eq!(report.shadowed, 1);
        assert_eq!(read(config, "vanilla.txt"), "modded");
        let record = DeploymentRecord::load(config, "Default").unwrap().unwrap();
        assert!(record.matches(&res));
        assert!(record.created_dirs.contains("new"));
        assert!(record.created_dirs.contains("new/deep"));

        let report = deployer.restore(&lock).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(read(config, "vanilla.txt"), "original");
        assert!(!config.game_dir.join("new").exists());
        assert!(DeploymentRecord::load(config, "Default").unwrap().is_none());

        let again = deployer.restore(&lock).unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(read(config, "vanilla.txt"), "original");
    }

    #[test]
    fn changed_winner_is_swapped() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        stage(config, "A", &[("x.txt", "a")]);
        stage(config, "B", &[("X.TXT", "b")]);
        let lock = DeployLock::acquire(config).unwrap();
        let deployer = Deployer::new(config, "Default");

        deployer
            .deploy(&lock, &resolution(config, &[("A", &["x.txt"])]))
            .unwrap();
        assert_eq!(read(config, "x.txt"), "a");

        let report = deployer
            .deploy(&lock, &resolution(config, &[("A", &["x.txt"]), ("B", &["X.TXT"])]))
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.placed, 1);
        assert_eq!(report.link_summary, "copy");
        assert_eq!(read(config, "X.TXT"), "b");
    }

    #[test]
    fn externally_replaced_file_is_left_alone() {
        let fx = fixture(LinkMode::Symlink);
        let config = &fx.config;
        stage(config, "A", &[("a.txt", "mod")]);
        let lock = DeployLock::acquire(config).unwrap();
        let deployer = Deployer::new(config, "Default");
        deployer
            .deploy(&lock, &resolution(config, &[("A", &["a.txt"])]))
            .unwrap();

        let dest = config.game_dir.join("a.txt");
        fs::remove_file(&dest).unwrap();
        fs::write(&dest, "user").unwrap();

        let report = deployer.restore(&lock).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(read(config, "a.txt"), "user");
    }

    #[test]
    fn second_lock_is_busy() {
        let fx = fixture(LinkMode::Auto);
        let _held = DeployLock::acquire(&fx.config).unwrap();
        assert!(matches!(
            DeployLock::acquire(&fx.config),
            Err(Error::Busy { .. })
        ));
    }

    #[test]
    fn cancelled_deploy_keeps_record_truthful() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        stage(config, "A", &[("a.txt", "1"), ("b.txt", "2")]);
        let res = resolution(config, &[("A", &["a.txt", "b.txt"])]);
        let lock = DeployLock::acquire(config).unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let deployer = Deployer::new(config, "Default")
            .with_cancel(cancel)
            .with_progress(Arc::new(move |progress: DeployProgress| {
                if progress.phase == DeployPhase::Placing && progress.current == 1 {
                    trigger.cancel();
                }
            }));

        let err = deployer.deploy(&lock, &res).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let record = DeploymentRecord::load(config, "Default").unwrap().unwrap();
        assert_eq!(record.entries.len(), 1);
        assert!(config.game_dir.join("a.txt").exists());
        assert!(!config.game_dir.join("b.txt").exists());
        assert!(!journal_path(config, "Default").exists());

        Deployer::new(config, "Default").restore(&lock).unwrap();
        assert!(!config.game_dir.join("a.txt").exists());
    }

    #[test]
    fn journal_replay_restores_shadow_after_crash() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        fs::write(config.game_dir.join("v.txt"), "original").unwrap();
        stage(config, "A", &[("v.txt", "modded")]);
        let lock = DeployLock::acquire(config).unwrap();
        Deployer::new(config, "Default")
            .deploy(&lock, &resolution(config, &[("A", &["v.txt"])]))
            .unwrap();

        // Simulate a crash right after an unlink.
        let record = DeploymentRecord::load(config, "Default").unwrap().unwrap();
        let (key, entry) = record.entries.iter().next().unwrap();
        let mut journal = Journal::open(journal_path(config, "Default")).unwrap();
        journal
            .log(&Intent::Unlink {
                key: key.clone(),
                entry: entry.clone(),
            })
            .unwrap();
        fs::remove_file(config.game_dir.join("v.txt")).unwrap();

        assert!(recover(config, "Default", &lock).unwrap());
        assert_eq!(read(config, "v.txt"), "original");
        assert!(DeploymentRecord::load(config, "Default").unwrap().is_none());
        assert!(!recover(config, "Default", &lock).unwrap());
    }

    #[test]
    fn cancel_after_owner_swap_keeps_original() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        fs::write(config.game_dir.join("v.txt"), "vanilla").unwrap();
        stage(config, "A", &[("v.txt", "a")]);
        stage(config, "B", &[("v.txt", "b"), ("z1.txt", "1"), ("z2.txt", "2")]);
        let lock = DeployLock::acquire(config).unwrap();
        Deployer::new(config, "Default")
            .deploy(&lock, &resolution(config, &[("A", &["v.txt"])]))
            .unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let deployer = Deployer::new(config, "Default")
            .with_cancel(cancel)
            .with_progress(Arc::new(move |progress: DeployProgress| {
                if progress.phase == DeployPhase::Placing && progress.current == 1 {
                    trigger.cancel();
                }
            }));
        let swapped = resolution(
            config,
            &[("A", &["v.txt"]), ("B", &["v.txt", "z1.txt", "z2.txt"])],
        );
        let err = deployer.deploy(&lock, &swapped).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(read(config, "v.txt"), "b");

        Deployer::new(config, "Default").restore(&lock).unwrap();
        assert_eq!(read(config, "v.txt"), "vanilla");
        assert!(!config.orphans_dir().join("Default").exists());
    }

    #[test]
    fn crash_before_shadowing_identical_original_keeps_it() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        fs::write(config.game_dir.join("v.txt"), "same").unwrap();
        stage(config, "A", &[("v.txt", "same")]);
        let lock = DeployLock::acquire(config).unwrap();

        // Crash right after the placement was journaled.
        let source = config.mods_dir().join("A").join("v.txt");
        let entry = DeployedEntry {
            rel: "v.txt".to_string(),
            mod_name: "A".to_string(),
            source: source.clone(),
            method: Placement::Copy,
            shadowed: true,
            proof: Proof::of_source(Placement::Copy, &source).unwrap(),
        };
        let mut journal = Journal::open(journal_path(config, "Default")).unwrap();
        journal
            .log(&Intent::Place {
                key: "v.txt".to_string(),
                entry,
                created_dirs: Vec::new(),
            })
            .unwrap();

        assert!(recover(config, "Default", &lock).unwrap());
        assert!(DeploymentRecord::load(config, "Default").unwrap().is_none());
        Deployer::new(config, "Default").restore(&lock).unwrap();
        assert_eq!(read(config, "v.txt"), "same");
    }

    #[test]
    fn moved_game_dir_restores_old_root_first() {
        let mut fx = fixture(LinkMode::Copy);
        stage(&fx.config, "A", &[("a.txt", "a")]);
        let lock = DeployLock::acquire(&fx.config).unwrap();
        let res = resolution(&fx.config, &[("A", &["a.txt"])]);
        Deployer::new(&fx.config, "Default").deploy(&lock, &res).unwrap();
        let old_root = fx.config.game_dir.clone();

        fx.config.game_dir = fx._temp.path().join("game2");
        fs::create_dir_all(&fx.config.game_dir).unwrap();
        Deployer::new(&fx.config, "Default").deploy(&lock, &res).unwrap();

        assert!(!old_root.join("a.txt").exists());
        assert_eq!(read(&fx.config, "a.txt"), "a");
        let record = DeploymentRecord::load(&fx.config, "Default").unwrap().unwrap();
        assert_eq!(record.target_root, fx.config.game_dir);
    }

    #[test]
    fn deploy_restores_other_live_profile() {
        let fx = fixture(LinkMode::Copy);
        let config = &fx.config;
        stage(config, "A", &[("a.txt", "a")]);
        stage(config, "B", &[("b.txt", "b")]);
        let lock = DeployLock::acquire(config).unwrap();
        Deployer::new(config, "One")
            .deploy(&lock, &resolution(config, &[("A", &["a.txt"])]))
            .unwrap();
        Deployer::new(config, "Two")
            .deploy(&lock, &resolution(config, &[("B", &["b.txt"])]))
            .unwrap();
        assert!(!config.game_dir.join("a.txt").exists());
        assert_eq!(read(config, "b.txt"), "b");
        assert_eq!(live_profiles(config).unwrap(), vec!["Two".to_string()]);
        let deployed = deployed_mods(&config.profiles_dir()).unwrap();
        assert_eq!(deployed.len(), 1);
        assert!(deployed[0].1.contains("B"));
    }
}
