use crate::{
    backup::{self, BackupEntry},
    config::GameConfig,
    deploy::{self, CancelToken, DeployLock, DeployProgressCallback, DeployReport, Deployer, DeploymentRecord},
    error::{Error, IoResultExt, Result},
    extract::{ArchiveExtractor, Extractor},
    fomod::{GameContext, SelectionMemory, Selector, Version},
    installer::{InstallPlan, Installer},
    library::{ModEntry, ModStore, StageProgressCallback},
    paths::sanitize_dir_name,
    plugins::{self, PluginEntry, PluginSorter, PluginSyncReport},
    profile::{self, ImportReport, PluginListFormat, Profile, ProfileEntry, ProfileManager},
    resolve::{self, Resolution},
};
use std::{
    collections::HashSet,
    fs,
    path::Path,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub profile: String,
    /// Some profile has files in the game directory.
    pub deployed_profile: Option<String>,
    /// The active profile is deployed and matches its current resolution.
    pub current: bool,
    pub interrupted: bool,
}

impl DeploymentStatus {
    /// What a launcher checks before starting anything against the game.
    pub fn is_valid(&self) -> bool {
        self.current && !self.interrupted
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub entry: ModEntry,
    pub plan_files: usize,
    pub scripted: bool,
}

#[derive(Debug)]
pub struct DeployOutcome {
    pub report: DeployReport,
    pub plugins: PluginSyncReport,
    pub backup: Option<BackupEntry>,
}

/// One managed game: its store, its profiles and the deployment engine
/// wired together.
pub struct App {
    pub game: GameConfig,
    pub store: ModStore,
    pub profiles: ProfileManager,
    memory: SelectionMemory,
    extractor: Box<dyn Extractor>,
    stage_progress: Option<StageProgressCallback>,
}

impl App {
    pub fn open(game: GameConfig) -> Result<Self> {
        game.ensure_dirs()?;
        let store = ModStore::open(&game)?;
        let profiles = ProfileManager::new(&game);
        let memory = SelectionMemory::new(game.fomod_dir());
        let extractor = Box::new(ArchiveExtractor::new(game.tmp_dir()));
        Ok(Self {
            game,
            store,
            profiles,
            memory,
            extractor,
            stage_progress: None,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_stage_progress(mut self, progress: StageProgressCallback) -> Self {
        self.stage_progress = Some(progress);
        self
    }

    pub fn active_profile(&self) -> Result<Profile> {
        let mut profile = self.profiles.load(&self.game.active_profile)?;
        profile.ensure_mods(&self.store);
        Ok(profile)
    }

    fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.profiles.save(profile)
    }

    /// What install-script conditions see: the configured game version and
    /// the plugin files of the active profile and game directory.
    pub fn game_context(&self) -> Result<GameContext> {
        let version = match self.game.game_version.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(Version::parse(raw)?),
            _ => None,
        };
        let mut context = GameContext::new(version);
        let profile = self.active_profile()?;
        for plugin in &profile.plugins {
            context.add_file(&plugin.name, plugin.enabled);
        }
        let implicit = self.game.kind.implicit_plugins();
        for name in self.present_plugins() {
            let active = implicit.iter().any(|i| i.eq_ignore_ascii_case(&name));
            context.add_file(&name, active);
        }
        Ok(context)
    }

    fn is_plugin_name(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .map(|ext| {
                self.game
                    .plugin_extensions
                    .iter()
                    .any(|want| want.eq_ignore_ascii_case(&ext.to_string_lossy()))
            })
            .unwrap_or(false)
    }

    fn present_plugins(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.game.deploy_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| self.is_plugin_name(name))
            .collect();
        names.sort();
        names
    }

    /// Plugin file names, lowercased, that any staged mod or the game
    /// directory provides at its root.
    pub fn known_plugins(&self) -> Result<HashSet<String>> {
        let mut known: HashSet<String> = self
            .present_plugins()
            .into_iter()
            .map(|name| name.to_lowercase())
            .collect();
        for entry in self.store.mods() {
            if entry.is_separator() {
                continue;
            }
            for file in self.store.files(&entry.name)? {
                let file = file?;
                if !file.rel.contains('/') && self.is_plugin_name(&file.rel) {
                    known.insert(file.rel.to_lowercase());
                }
            }
        }
        Ok(known)
    }

    pub fn plan_install(&self, archive: &Path, name: Option<&str>, selector: &mut dyn Selector) -> Result<InstallPlan> {
        let extracted = self.extractor.extract(archive)?;
        let context = self.game_context()?;
        let installer = Installer::new(&self.game, &context, &self.memory);
        installer.plan(&extracted, name, selector)
    }

    /// Extracts, plans and stages one archive. The new mod goes to the top of
    /// every profile, enabled only in the active one.
    pub fn install(
        &mut self,
        archive: &Path,
        name: Option<&str>,
        replace: bool,
        selector: &mut dyn Selector,
    ) -> Result<InstallOutcome> {
        let extracted = self.extractor.extract(archive)?;
        let context = self.game_context()?;
        let installer = Installer::new(&self.game, &context, &self.memory);
        let plan = installer.plan(&extracted, name, selector)?;
        let fresh = self.store.get(&sanitize_dir_name(&plan.mod_name)).is_none();
        let entry = self
            .store
            .stage(&plan, replace, self.stage_progress.as_ref())?;
        drop(extracted);

        let registered = (|| -> Result<()> {
            let _lock = DeployLock::wait(&self.game)?;
            let active = self.game.active_profile.clone();
            self.profiles.load(&active)?;
            self.profiles.update_all(|profile| {
                if profile.position(&entry.name).is_none() {
                    profile.order.push(ProfileEntry {
                        name: entry.name.clone(),
                        enabled: profile.name == active,
                    });
                }
            })?;
            installer.remember(&plan)
        })();
        if let Err(err) = registered {
            if fresh {
                self.unstage(&entry.name);
            }
            return Err(err);
        }
        tracing::info!(mod_name = %entry.name, files = plan.entries.len(), "mod installed");
        Ok(InstallOutcome {
            plan_files: plan.entries.len(),
            scripted: plan.script.is_some(),
            entry,
        })
    }

    // Takes back a freshly staged mod whose registration failed.
    fn unstage(&mut self, name: &str) {
        if let Err(err) = self.store.remove(name) {
            tracing::warn!(mod_name = name, "could not remove staged mod: {err}");
        }
        let cleared = DeployLock::wait(&self.game)
            .and_then(|_lock| self.profiles.update_all(|profile| profile.forget_mod(name)));
        if let Err(err) = cleared {
            tracing::warn!(mod_name = name, "could not drop mod from profiles: {err}");
        }
    }

    pub fn resolution(&self) -> Result<Resolution> {
        let profile = self.active_profile()?;
        resolve::resolve(&self.store, profile.enabled())
    }

    /// Deploys the active profile. Fails fast when another deploy, restore or
    /// switch holds the game directory.
    pub fn deploy(
        &mut self,
        progress: Option<DeployProgressCallback>,
        cancel: Option<CancelToken>,
    ) -> Result<DeployOutcome> {
        let lock = DeployLock::acquire(&self.game)?;
        self.deploy_locked(&lock, progress, cancel)
    }

    fn deploy_locked(
        &mut self,
        lock: &DeployLock,
        progress: Option<DeployProgressCallback>,
        cancel: Option<CancelToken>,
    ) -> Result<DeployOutcome> {
        let mut profile = self.active_profile()?;
        let backup = match backup::create_backup(&self.profiles, &profile) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(profile = %profile.name, "profile backup failed: {err}");
                None
            }
        };
        let resolution = resolve::resolve(&self.store, profile.enabled())?;
        let mut deployer = Deployer::new(&self.game, &profile.name);
        if let Some(progress) = progress {
            deployer = deployer.with_progress(progress);
        }
        if let Some(cancel) = cancel {
            deployer = deployer.with_cancel(cancel);
        }
        let report = deployer.deploy(lock, &resolution)?;
        let plugins = plugins::sync_plugins(
            &mut profile.plugins,
            &resolution,
            &self.game.plugin_extensions,
            self.game.kind.implicit_plugins(),
            &self.game.deploy_dir(),
        );
        self.save_profile(&profile)?;
        Ok(DeployOutcome {
            report,
            plugins,
            backup,
        })
    }

    /// Restores every profile that still has files in the game directory.
    pub fn restore(&mut self) -> Result<Vec<DeployReport>> {
        let lock = DeployLock::acquire(&self.game)?;
        self.restore_locked(&lock)
    }

    fn restore_locked(&self, lock: &DeployLock) -> Result<Vec<DeployReport>> {
        let mut reports = Vec::new();
        for name in deploy::live_profiles(&self.game)? {
            reports.push(Deployer::new(&self.game, &name).restore(lock)?);
        }
        Ok(reports)
    }

    /// Restores whatever is deployed, makes `name` active and deploys it.
    pub fn switch_profile(&mut self, name: &str) -> Result<DeployOutcome> {
        let lock = DeployLock::acquire(&self.game)?;
        if !self.profiles.exists(name) {
            return Err(Error::not_found("profile", name));
        }
        self.restore_locked(&lock)?;
        let previous = std::mem::replace(&mut self.game.active_profile, name.to_string());
        if let Err(err) = self.game.save() {
            self.game.active_profile = previous;
            return Err(err);
        }
        tracing::info!(from = %previous, to = name, "switching profile");
        self.deploy_locked(&lock, None, None)
    }

    pub fn deployment_status(&self) -> Result<DeploymentStatus> {
        let profile = self.game.active_profile.clone();
        let live = deploy::live_profiles(&self.game)?;
        let interrupted = live
            .iter()
            .any(|name| deploy::is_interrupted(&self.game, name));
        let deployed_profile = live
            .iter()
            .find(|name| {
                DeploymentRecord::load(&self.game, name)
                    .ok()
                    .flatten()
                    .is_some_and(|record| !record.entries.is_empty())
            })
            .cloned();
        let current = match DeploymentRecord::load(&self.game, &profile)? {
            Some(record) => record.matches(&self.resolution()?),
            None => self.resolution()?.is_empty(),
        };
        Ok(DeploymentStatus {
            profile,
            deployed_profile,
            current,
            interrupted,
        })
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let _lock = DeployLock::wait(&self.game)?;
        let mut profile = self.active_profile()?;
        profile.set_enabled(name, enabled)?;
        self.save_profile(&profile)
    }

    pub fn move_mod(&mut self, name: &str, index: usize) -> Result<usize> {
        let _lock = DeployLock::wait(&self.game)?;
        let mut profile = self.active_profile()?;
        let index = profile.move_to(name, index)?;
        self.save_profile(&profile)?;
        Ok(index)
    }

    pub fn rename_mod(&mut self, old: &str, new: &str) -> Result<ModEntry> {
        let _lock = DeployLock::wait(&self.game)?;
        let entry = self.store.rename(old, new)?;
        self.profiles
            .update_all(|profile| profile.rename_mod(old, &entry.name))?;
        Ok(entry)
    }

    /// New separators go to the top of the active profile.
    pub fn add_separator(&mut self, name: &str) -> Result<ModEntry> {
        let _lock = DeployLock::wait(&self.game)?;
        let entry = self.store.add_separator(name)?;
        let profile = self.active_profile()?;
        self.save_profile(&profile)?;
        Ok(entry)
    }

    pub fn remove_mod(&mut self, name: &str) -> Result<ModEntry> {
        let _lock = DeployLock::wait(&self.game)?;
        let entry = self.store.remove(name)?;
        self.profiles.update_all(|profile| profile.forget_mod(name))?;
        Ok(entry)
    }

    pub fn import_modlist(&mut self, path: &Path) -> Result<ImportReport> {
        let text = plugins::read_list_file(path)?;
        let _lock = DeployLock::wait(&self.game)?;
        let mut profile = self.active_profile()?;
        let report = profile::import_modlist(&mut profile, &mut self.store, &text)?;
        self.save_profile(&profile)?;
        Ok(report)
    }

    pub fn import_plugins(&mut self, path: &Path, format: PluginListFormat) -> Result<ImportReport> {
        let text = plugins::read_list_file(path)?;
        let known = self.known_plugins()?;
        let _lock = DeployLock::wait(&self.game)?;
        let mut profile = self.active_profile()?;
        let report = profile::import_plugins(
            &mut profile,
            &text,
            format,
            &known,
            &self.game.plugin_extensions,
            self.game.kind.implicit_plugins(),
        );
        self.save_profile(&profile)?;
        Ok(report)
    }

    pub fn export_modlist(&self, path: &Path) -> Result<()> {
        let profile = self.active_profile()?;
        write_text(path, &profile::export_modlist(&profile, &self.store))
    }

    pub fn export_plugins(&self, path: &Path, format: PluginListFormat) -> Result<()> {
        let profile = self.active_profile()?;
        let text = match format {
            PluginListFormat::Plugins => plugins::render_plugins_txt(&profile.plugins),
            PluginListFormat::LoadOrder => {
                plugins::render_loadorder_txt(&profile.plugins, self.game.kind.implicit_plugins())
            }
        };
        write_text(path, &text)
    }

    /// Hands the plugin list to the sorter and stores its answer unchanged.
    pub fn sort_plugins(&mut self, sorter: &dyn PluginSorter) -> Result<Vec<PluginEntry>> {
        let context = self.game_context()?;
        let _lock = DeployLock::wait(&self.game)?;
        let mut profile = self.active_profile()?;
        profile.plugins = sorter.sort(&profile.plugins, &context)?;
        self.save_profile(&profile)?;
        tracing::info!(plugins = profile.plugins.len(), "plugin order applied");
        Ok(profile.plugins)
    }

    pub fn backups(&self) -> Result<Vec<BackupEntry>> {
        backup::list_backups(&self.profiles, &self.game.active_profile)
    }

    pub fn restore_backup(&mut self, id: &str) -> Result<Profile> {
        let _lock = DeployLock::wait(&self.game)?;
        backup::restore_backup(&self.profiles, &self.game.active_profile, id)
    }

    pub fn create_profile(&self, name: &str, clone_from: Option<&str>) -> Result<Profile> {
        let mut profile = self.profiles.create(name, clone_from)?;
        profile.ensure_mods(&self.store);
        self.profiles.save(&profile)?;
        Ok(profile)
    }

    pub fn rename_profile(&mut self, old: &str, new: &str) -> Result<Profile> {
        let _lock = DeployLock::acquire(&self.game)?;
        let profile = self.profiles.rename(old, new, &self.game)?;
        if self.game.active_profile == old {
            self.game.active_profile = profile.name.clone();
            self.game.save()?;
        }
        Ok(profile)
    }

    pub fn remove_profile(&mut self, name: &str) -> Result<()> {
        let _lock = DeployLock::acquire(&self.game)?;
        self.profiles.remove(name, &self.game)
    }
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).io_ctx("create dir", parent)?;
    }
    fs::write(path, text).io_ctx("write", path)
}
