use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    #[default]
    Generic,
    SkyrimSe,
    Fallout4,
    StardewValley,
}

impl GameKind {
    pub fn display_name(self) -> &'static str {
        match self {
            GameKind::Generic => "Generic",
            GameKind::SkyrimSe => "Skyrim Special Edition",
            GameKind::Fallout4 => "Fallout 4",
            GameKind::StardewValley => "Stardew Valley",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameKind::Generic => "generic",
            GameKind::SkyrimSe => "skyrim_se",
            GameKind::Fallout4 => "fallout4",
            GameKind::StardewValley => "stardew_valley",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        supported_games()
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
    }

    /// Folder names that identify a mod's data root for the install heuristic.
    pub fn marker_folders(self) -> Vec<String> {
        let names: &[&str] = match self {
            GameKind::Generic => &[],
            GameKind::SkyrimSe | GameKind::Fallout4 => &[
                "meshes",
                "textures",
                "scripts",
                "interface",
                "sound",
                "music",
                "materials",
                "strings",
                "skse",
                "f4se",
                "seq",
                "lodsettings",
            ],
            GameKind::StardewValley => &["Mods"],
        };
        names.iter().map(|name| name.to_string()).collect()
    }

    pub fn marker_extensions(self) -> Vec<String> {
        let exts: &[&str] = match self {
            GameKind::Generic => &[],
            GameKind::SkyrimSe => &["esp", "esm", "esl", "bsa"],
            GameKind::Fallout4 => &["esp", "esm", "esl", "ba2"],
            GameKind::StardewValley => &[],
        };
        exts.iter().map(|ext| ext.to_string()).collect()
    }

    pub fn plugin_extensions(self) -> Vec<String> {
        match self {
            GameKind::SkyrimSe | GameKind::Fallout4 => {
                vec!["esp".to_string(), "esm".to_string(), "esl".to_string()]
            }
            GameKind::Generic | GameKind::StardewValley => Vec::new(),
        }
    }

    /// Plugins the game always loads; they never appear in the user's list.
    pub fn implicit_plugins(self) -> &'static [&'static str] {
        match self {
            GameKind::SkyrimSe => &[
                "Skyrim.esm",
                "Update.esm",
                "Dawnguard.esm",
                "HearthFires.esm",
                "Dragonborn.esm",
            ],
            GameKind::Fallout4 => &[
                "Fallout4.esm",
                "DLCRobot.esm",
                "DLCworkshop01.esm",
                "DLCCoast.esm",
                "DLCworkshop02.esm",
                "DLCworkshop03.esm",
                "DLCNukaWorld.esm",
            ],
            GameKind::Generic | GameKind::StardewValley => &[],
        }
    }

    /// Subdirectory of the game directory that mods deploy into.
    pub fn deploy_subdir(self) -> &'static str {
        match self {
            GameKind::SkyrimSe | GameKind::Fallout4 => "Data",
            GameKind::Generic | GameKind::StardewValley => "",
        }
    }

    pub fn looks_like_game_root(self, path: &Path) -> bool {
        match self {
            GameKind::Generic => path.is_dir(),
            GameKind::SkyrimSe => path.join("SkyrimSE.exe").is_file() || path.join("Data").is_dir(),
            GameKind::Fallout4 => path.join("Fallout4.exe").is_file() || path.join("Data").is_dir(),
            GameKind::StardewValley => {
                path.join("Stardew Valley.dll").is_file() || path.join("Content").is_dir()
            }
        }
    }
}

pub fn supported_games() -> Vec<GameKind> {
    vec![
        GameKind::Generic,
        GameKind::SkyrimSe,
        GameKind::Fallout4,
        GameKind::StardewValley,
    ]
}
