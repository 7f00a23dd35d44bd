#![allow(dead_code)]

use stagecraft::{
    config::GameConfig,
    deploy::LinkMode,
    fomod::{AcceptDefaults, PresetSelector},
    game::GameKind,
    App,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

pub const ARMOR_SCRIPT: &str = r#"<config>
  <moduleName>Armor Pack</moduleName>
  <installSteps order="Explicit">
    <installStep name="Body">
      <optionalFileGroups order="Explicit">
        <group name="Variant" type="SelectExactlyOne">
          <plugins order="Explicit">
            <plugin name="P1">
              <files><folder source="p1" destination="meshes"/></files>
              <typeDescriptor><type name="Recommended"/></typeDescriptor>
            </plugin>
            <plugin name="P2">
              <files><folder source="p2" destination="meshes"/></files>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
          </plugins>
        </group>
        <group name="Extras" type="SelectAtLeastOne">
          <plugins order="Explicit">
            <plugin name="Cape">
              <files><file source="extras/cape.nif" destination="meshes/cape.nif"/></files>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
          </plugins>
        </group>
      </optionalFileGroups>
    </installStep>
  </installSteps>
</config>"#;

pub struct Fixture {
    pub temp: TempDir,
    pub app: App,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_link_mode(LinkMode::Copy)
    }

    pub fn with_link_mode(mode: LinkMode) -> Self {
        let temp = TempDir::new().unwrap();
        let game_dir = temp.path().join("game");
        fs::create_dir_all(&game_dir).unwrap();
        let mut game = GameConfig::standalone(
            "test",
            GameKind::Generic,
            game_dir,
            temp.path().join("data"),
        );
        game.link_mode = mode;
        game.save().unwrap();
        let app = App::open(game).unwrap();
        Self { temp, app }
    }

    pub fn game_dir(&self) -> PathBuf {
        self.app.game.deploy_dir()
    }

    /// Writes a loose mod folder under `sources/<name>` and returns it.
    pub fn source(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.temp.path().join("sources").join(name);
        for (rel, data) in files {
            write(&root, rel, data);
        }
        root
    }

    pub fn install_plain(&mut self, name: &str, files: &[(&str, &str)]) {
        let root = self.source(name, files);
        self.app
            .install(&root, Some(name), false, &mut AcceptDefaults)
            .unwrap();
    }

    pub fn armor_source(&self) -> PathBuf {
        self.source(
            "ArmorPack-1234-1-0",
            &[
                ("fomod/ModuleConfig.xml", ARMOR_SCRIPT),
                ("p1/body.nif", "p1 body"),
                ("p2/body.nif", "p2 body"),
                ("extras/cape.nif", "cape"),
            ],
        )
    }

    pub fn install_armor(&mut self, selections: &[&str], replace: bool) {
        let root = self.armor_source();
        let specs: Vec<String> = selections.iter().map(|s| s.to_string()).collect();
        let mut selector = PresetSelector::parse(&specs).unwrap();
        self.app.install(&root, None, replace, &mut selector).unwrap();
    }
}

pub fn write(root: &Path, rel: &str, data: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

pub fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

/// Every regular file below `root` with its contents.
pub fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            (rel, fs::read(entry.path()).unwrap())
        })
        .collect()
}

/// Directories below `root`, for checking that cleanup removed what deploy made.
pub fn dirs(root: &Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.path().strip_prefix(root).unwrap().to_string_lossy().into_owned())
        .collect()
}
