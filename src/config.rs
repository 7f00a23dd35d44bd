use crate::{
    deploy::LinkMode,
    error::{Error, IoResultExt, Result},
    game::GameKind,
    paths::{sanitize_dir_name, CasePolicy},
};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const HOME_ENV: &str = "STAGECRAFT_HOME";
pub const DEFAULT_PROFILE: &str = "Default";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub active_game: Option<String>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        Self::load_from(base_data_dir()?)
    }

    pub fn load_from(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).io_ctx("create app data dir", &base_dir)?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let mut config: AppConfig = read_json(&path)?;
            config.base_dir = base_dir;
            if let Some(active) = &config.active_game {
                if !config.game_config_path(active).exists() {
                    tracing::warn!(game = %active, "active game has no config; clearing");
                    config.active_game = None;
                    config.save()?;
                }
            }
            return Ok(config);
        }

        let config = AppConfig {
            active_game: None,
            base_dir,
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        write_json(&self.base_dir.join("config.json"), self)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn game_root(&self, name: &str) -> PathBuf {
        self.base_dir.join(sanitize_dir_name(name))
    }

    fn game_config_path(&self, name: &str) -> PathBuf {
        self.game_root(name).join("config.json")
    }

    pub fn games(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        for entry in entries.flatten() {
            let path = entry.path().join("config.json");
            if path.is_file() {
                let config: GameConfig = read_json(&path)?;
                names.push(config.name);
            }
        }
        names.sort_by_key(|name| name.to_lowercase());
        Ok(names)
    }

    pub fn add_game(&mut self, mut game: GameConfig) -> Result<GameConfig> {
        let root = self.game_root(&game.name);
        if root.join("config.json").exists() {
            return Err(Error::AlreadyExists {
                kind: "game",
                name: game.name,
            });
        }
        if game.data_dir.as_os_str().is_empty() {
            game.data_dir = root.clone();
        }
        fs::create_dir_all(&root).io_ctx("create game dir", &root)?;
        game.config_path = root.join("config.json");
        game.save()?;
        if self.active_game.is_none() {
            self.active_game = Some(game.name.clone());
            self.save()?;
        }
        tracing::info!(game = %game.name, kind = game.kind.as_str(), "game added");
        Ok(game)
    }

    pub fn load_game(&self, name: &str) -> Result<GameConfig> {
        let path = self.game_config_path(name);
        if !path.exists() {
            return Err(Error::not_found("game", name));
        }
        let mut config: GameConfig = read_json(&path)?;
        config.config_path = path;
        Ok(config)
    }

    pub fn set_active_game(&mut self, name: &str) -> Result<()> {
        let game = self.load_game(name)?;
        self.active_game = Some(game.name);
        self.save()
    }
}

/// Everything the manager needs to know about one managed game install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub name: String,
    #[serde(default)]
    pub kind: GameKind,
    /// Game install directory; mods deploy into `deploy_dir()` below it.
    pub game_dir: PathBuf,
    /// Root for staging, profiles and all manager state.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub link_mode: LinkMode,
    #[serde(default)]
    pub case_policy: CasePolicy,
    #[serde(default)]
    pub marker_folders: Vec<String>,
    #[serde(default)]
    pub marker_extensions: Vec<String>,
    #[serde(default)]
    pub plugin_extensions: Vec<String>,
    #[serde(default)]
    pub game_version: Option<String>,
    #[serde(default = "default_profile")]
    pub active_profile: String,
    #[serde(skip)]
    config_path: PathBuf,
}

impl GameConfig {
    pub fn new(name: &str, kind: GameKind, game_dir: PathBuf) -> Self {
        Self {
            name: name.trim().to_string(),
            kind,
            game_dir,
            data_dir: PathBuf::new(),
            link_mode: LinkMode::default(),
            case_policy: CasePolicy::default(),
            marker_folders: kind.marker_folders(),
            marker_extensions: kind.marker_extensions(),
            plugin_extensions: kind.plugin_extensions(),
            game_version: None,
            active_profile: default_profile(),
            config_path: PathBuf::new(),
        }
    }

    /// Builds a config rooted at `data_dir` without touching the app config;
    /// used by embedders and tests that manage their own directories.
    pub fn standalone(name: &str, kind: GameKind, game_dir: PathBuf, data_dir: PathBuf) -> Self {
        let mut config = Self::new(name, kind, game_dir);
        config.config_path = data_dir.join("config.json");
        config.data_dir = data_dir;
        config
    }

    pub fn save(&self) -> Result<()> {
        let path = if self.config_path.as_os_str().is_empty() {
            self.data_dir.join("config.json")
        } else {
            self.config_path.clone()
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_ctx("create config dir", parent)?;
        }
        write_json(&path, self)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        let sub = self.kind.deploy_subdir();
        if sub.is_empty() {
            self.game_dir.clone()
        } else {
            self.game_dir.join(sub)
        }
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.data_dir.join("mods")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn shadow_dir(&self) -> PathBuf {
        self.data_dir.join("shadow")
    }

    pub fn orphans_dir(&self) -> PathBuf {
        self.data_dir.join("orphans")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn fomod_dir(&self) -> PathBuf {
        self.data_dir.join("fomod")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.mods_dir(),
            self.profiles_dir(),
            self.shadow_dir(),
            self.tmp_dir(),
            self.fomod_dir(),
        ] {
            fs::create_dir_all(&dir).io_ctx("create data dir", &dir)?;
        }
        Ok(())
    }
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(home) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let base = BaseDirs::new().ok_or_else(|| Error::Io {
        action: "resolve home dir".to_string(),
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
    })?;
    Ok(base.data_local_dir().join("stagecraft"))
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).io_ctx("read", path)?;
    serde_json::from_str(&raw).map_err(|source| Error::State {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes through a sibling temp file and renames it into place so readers
/// never observe a half-written state file.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).map_err(|source| Error::State {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).io_ctx("write", &tmp)?;
    fs::rename(&tmp, path).io_ctx("replace", path)?;
    Ok(())
}
