use super::{
    condition::{Condition, EvalContext, GameContext},
    script::{FileInstall, Group, GroupType, ModuleConfig, Plugin, PluginType, TypeDescriptor},
};
use crate::{
    error::{Error, Result, ValidationError},
    paths::{self, is_ignored_path},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Group name to chosen plugin names, for one step.
pub type StepSelection = IndexMap<String, Vec<String>>;

/// Choices for a whole script run, keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedSelections {
    pub steps: IndexMap<String, StepSelection>,
}

impl RecordedSelections {
    pub fn get(&self, step: &str, group: &str) -> Option<&Vec<String>> {
        self.steps.get(step).and_then(|groups| groups.get(group))
    }
}

#[derive(Debug, Clone)]
pub struct PluginView {
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub kind: PluginType,
    /// False when the plugin's own visibility condition fails. Hidden
    /// plugins stay selectable.
    pub displayed: bool,
}

#[derive(Debug, Clone)]
pub struct GroupView {
    pub name: String,
    pub kind: GroupType,
    pub plugins: Vec<PluginView>,
}

/// The step waiting for a decision, with only its visible groups.
#[derive(Debug, Clone)]
pub struct StepView {
    pub index: usize,
    pub name: String,
    pub groups: Vec<GroupView>,
    pub defaults: StepSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub source: PathBuf,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub module: String,
    pub files: Vec<PlannedFile>,
    pub selections: RecordedSelections,
    pub flags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    cursor: Option<usize>,
    flags: BTreeMap<String, String>,
    selected: BTreeSet<String>,
    chosen: usize,
}

/// Walks one install script step by step.
///
/// Step visibility is decided from the flags and plugins chosen in earlier
/// steps only; nothing is copied until [`InstallSession::finish`].
pub struct InstallSession<'a> {
    config: &'a ModuleConfig,
    game: &'a GameContext,
    remembered: Option<&'a RecordedSelections>,
    cursor: Option<usize>,
    flags: BTreeMap<String, String>,
    selected: BTreeSet<String>,
    chosen: Vec<(usize, StepSelection)>,
    history: Vec<Checkpoint>,
}

impl<'a> InstallSession<'a> {
    pub fn new(config: &'a ModuleConfig, game: &'a GameContext) -> Result<Self> {
        let mut session = Self {
            config,
            game,
            remembered: None,
            cursor: None,
            flags: BTreeMap::new(),
            selected: BTreeSet::new(),
            chosen: Vec::new(),
            history: Vec::new(),
        };
        if let Some(deps) = &config.dependencies {
            if !deps.eval(&session.ctx()) {
                return Err(ValidationError::UnmetRequirements(describe(deps)).into());
            }
        }
        session.cursor = session.next_visible(0);
        Ok(session)
    }

    pub fn with_memory(mut self, remembered: Option<&'a RecordedSelections>) -> Self {
        self.remembered = remembered;
        self
    }

    fn ctx(&self) -> EvalContext<'_> {
        EvalContext {
            flags: &self.flags,
            selected: &self.selected,
            game: self.game,
        }
    }

    fn next_visible(&self, from: usize) -> Option<usize> {
        let ctx = self.ctx();
        (from..self.config.steps.len()).find(|&idx| {
            self.config.steps[idx]
                .visible
                .as_ref()
                .map(|cond| cond.eval(&ctx))
                .unwrap_or(true)
        })
    }

    fn visible_groups(&self, step: usize) -> Vec<&'a Group> {
        let ctx = self.ctx();
        self.config.steps[step]
            .groups
            .iter()
            .filter(|group| {
                group
                    .visible
                    .as_ref()
                    .map(|cond| cond.eval(&ctx))
                    .unwrap_or(true)
            })
            .collect()
    }

    fn plugin_type(&self, plugin: &Plugin) -> PluginType {
        match &plugin.type_descriptor {
            TypeDescriptor::Static(kind) => *kind,
            TypeDescriptor::Conditional { default, patterns } => {
                let ctx = self.ctx();
                patterns
                    .iter()
                    .find(|(cond, _)| cond.eval(&ctx))
                    .map(|(_, kind)| *kind)
                    .unwrap_or(*default)
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn current(&self) -> Option<StepView> {
        let index = self.cursor?;
        let step = &self.config.steps[index];
        let ctx = self.ctx();
        let groups = self
            .visible_groups(index)
            .into_iter()
            .map(|group| GroupView {
                name: group.name.clone(),
                kind: group.kind,
                plugins: group
                    .plugins
                    .iter()
                    .map(|plugin| PluginView {
                        name: plugin.name.clone(),
                        description: plugin.description.clone(),
                        image: plugin.image.clone(),
                        kind: self.plugin_type(plugin),
                        displayed: plugin
                            .visible
                            .as_ref()
                            .map(|cond| cond.eval(&ctx))
                            .unwrap_or(true),
                    })
                    .collect(),
            })
            .collect();
        Some(StepView {
            index,
            name: step.name.clone(),
            groups,
            defaults: self.defaults(index),
        })
    }

    fn defaults(&self, index: usize) -> StepSelection {
        let step = &self.config.steps[index];
        let mut out = StepSelection::new();
        for group in self.visible_groups(index) {
            let types: Vec<PluginType> = group
                .plugins
                .iter()
                .map(|plugin| self.plugin_type(plugin))
                .collect();
            let remembered = self
                .remembered
                .and_then(|memory| memory.get(&step.name, &group.name))
                .filter(|names| {
                    names.iter().all(|name| {
                        group
                            .plugins
                            .iter()
                            .zip(&types)
                            .any(|(plugin, kind)| {
                                plugin.name == *name && *kind != PluginType::NotUsable
                            })
                    })
                });
            let picked = match remembered {
                Some(names) => {
                    let mut names = names.clone();
                    for (plugin, kind) in group.plugins.iter().zip(&types) {
                        if *kind == PluginType::Required && !names.contains(&plugin.name) {
                            names.push(plugin.name.clone());
                        }
                    }
                    names
                }
                None => computed_defaults(group, &types),
            };
            out.insert(group.name.clone(), picked);
        }
        out
    }

    /// Validates and applies the choices for the current step, then advances
    /// to the next visible step.
    pub fn select(&mut self, choices: StepSelection) -> std::result::Result<(), ValidationError> {
        let index = self.cursor.ok_or(ValidationError::NoPendingStep)?;
        let step = &self.config.steps[index];
        let groups = self.visible_groups(index);

        for name in choices.keys() {
            if !groups.iter().any(|group| group.name == *name) {
                return Err(ValidationError::DanglingReference {
                    kind: "group",
                    name: format!("{}/{}", step.name, name),
                });
            }
        }

        let mut accepted = StepSelection::new();
        for group in &groups {
            let wanted = choices.get(&group.name).cloned().unwrap_or_default();
            for name in &wanted {
                if !group.plugins.iter().any(|plugin| plugin.name == *name) {
                    return Err(ValidationError::DanglingReference {
                        kind: "plugin",
                        name: format!("{}/{}/{}", step.name, group.name, name),
                    });
                }
            }

            let mut picked = Vec::new();
            for plugin in &group.plugins {
                let kind = self.plugin_type(plugin);
                let requested = wanted.contains(&plugin.name);
                if requested && kind == PluginType::NotUsable {
                    return Err(ValidationError::NotUsable {
                        group: group.name.clone(),
                        plugin: plugin.name.clone(),
                    });
                }
                let forced = kind == PluginType::Required
                    || (group.kind == GroupType::SelectAll && kind != PluginType::NotUsable);
                if requested || forced {
                    picked.push(plugin.name.clone());
                }
            }

            let count = picked.len();
            let rule = match group.kind {
                GroupType::SelectExactlyOne if count != 1 => Some("select exactly one"),
                GroupType::SelectAtLeastOne if count < 1 => Some("select at least one"),
                GroupType::SelectAtMostOne if count > 1 => Some("select at most one"),
                _ => None,
            };
            if let Some(rule) = rule {
                return Err(ValidationError::SelectionViolation {
                    step: step.name.clone(),
                    group: group.name.clone(),
                    rule,
                    count,
                });
            }
            accepted.insert(group.name.clone(), picked);
        }

        self.history.push(Checkpoint {
            cursor: self.cursor,
            flags: self.flags.clone(),
            selected: self.selected.clone(),
            chosen: self.chosen.len(),
        });

        for group in &groups {
            let Some(names) = accepted.get(&group.name) else {
                continue;
            };
            for plugin in group.plugins.iter().filter(|p| names.contains(&p.name)) {
                for (flag, value) in &plugin.flags {
                    self.flags.insert(flag.clone(), value.clone());
                }
                self.selected.insert(plugin.name.clone());
            }
        }
        tracing::debug!(step = %step.name, ?accepted, "step accepted");
        self.chosen.push((index, accepted));
        self.cursor = self.next_visible(index + 1);
        Ok(())
    }

    /// Returns to the previous step, forgetting its choices and flags.
    pub fn back(&mut self) -> bool {
        let Some(checkpoint) = self.history.pop() else {
            return false;
        };
        self.cursor = checkpoint.cursor;
        self.flags = checkpoint.flags;
        self.selected = checkpoint.selected;
        self.chosen.truncate(checkpoint.chosen);
        true
    }

    /// Turns the completed run into concrete copy instructions against the
    /// script root. Every referenced source must exist.
    pub fn finish(self, root: &Path) -> Result<ScriptOutcome> {
        if let Some(index) = self.cursor {
            return Err(ValidationError::Incomplete(self.config.steps[index].name.clone()).into());
        }

        let mut installs: Vec<&FileInstall> = self.config.required_files.iter().collect();
        let mut selections = RecordedSelections::default();
        for (index, accepted) in &self.chosen {
            let step = &self.config.steps[*index];
            for group in &step.groups {
                let Some(names) = accepted.get(&group.name) else {
                    continue;
                };
                for plugin in group.plugins.iter().filter(|p| names.contains(&p.name)) {
                    installs.extend(plugin.files.iter());
                }
            }
            selections
                .steps
                .insert(step.name.clone(), accepted.clone());
        }
        let ctx = self.ctx();
        for pattern in &self.config.conditional_installs {
            if pattern.condition.eval(&ctx) {
                installs.extend(pattern.files.iter());
            }
        }
        installs.sort_by_key(|install| install.priority);

        let mut lookup = HashMap::new();
        let mut mapped: IndexMap<String, PlannedFile> = IndexMap::new();
        for install in installs {
            for file in expand_install(root, install, &mut lookup)? {
                mapped.insert(file.destination.to_lowercase(), file);
            }
        }

        tracing::info!(
            module = %self.config.name,
            files = mapped.len(),
            "install script resolved"
        );
        Ok(ScriptOutcome {
            module: self.config.name.clone(),
            files: mapped.into_values().collect(),
            selections,
            flags: self.flags,
        })
    }
}

fn computed_defaults(group: &Group, types: &[PluginType]) -> Vec<String> {
    let first_of = |wanted: PluginType| {
        group
            .plugins
            .iter()
            .zip(types)
            .find(|(_, kind)| **kind == wanted)
            .map(|(plugin, _)| plugin.name.clone())
    };
    let first_usable = || {
        group
            .plugins
            .iter()
            .zip(types)
            .find(|(_, kind)| **kind != PluginType::NotUsable)
            .map(|(plugin, _)| plugin.name.clone())
    };
    match group.kind {
        GroupType::SelectAll => group
            .plugins
            .iter()
            .zip(types)
            .filter(|(_, kind)| **kind != PluginType::NotUsable)
            .map(|(plugin, _)| plugin.name.clone())
            .collect(),
        GroupType::SelectExactlyOne => first_of(PluginType::Required)
            .or_else(|| first_of(PluginType::Recommended))
            .or_else(first_usable)
            .into_iter()
            .collect(),
        GroupType::SelectAtMostOne => first_of(PluginType::Required)
            .or_else(|| first_of(PluginType::Recommended))
            .into_iter()
            .collect(),
        GroupType::SelectAtLeastOne | GroupType::SelectAny => {
            let picked: Vec<String> = group
                .plugins
                .iter()
                .zip(types)
                .filter(|(_, kind)| {
                    matches!(kind, PluginType::Required | PluginType::Recommended)
                })
                .map(|(plugin, _)| plugin.name.clone())
                .collect();
            if picked.is_empty() && group.kind == GroupType::SelectAtLeastOne {
                first_usable().into_iter().collect()
            } else {
                picked
            }
        }
    }
}

fn expand_install(
    root: &Path,
    install: &FileInstall,
    lookup: &mut HashMap<PathBuf, Vec<PathBuf>>,
) -> Result<Vec<PlannedFile>> {
    let missing = || Error::from(ValidationError::MissingSource(install.source.clone()));

    if install.is_folder {
        let dir = if install.source.is_empty() {
            root.to_path_buf()
        } else {
            paths::resolve_existing_case(root, &install.source)
        };
        if !dir.is_dir() {
            return Err(missing());
        }
        let base = install
            .destination
            .clone()
            .unwrap_or_else(|| install.source.clone());
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_ignored_path(entry.path()))
        {
            let entry = entry.map_err(|err| Error::Io {
                action: "walk install source".to_string(),
                path: dir.clone(),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = paths::rel_from_path(&dir, entry.path()) else {
                continue;
            };
            out.push(PlannedFile {
                source: entry.path().to_path_buf(),
                destination: join_dest(&base, &rel),
            });
        }
        return Ok(out);
    }

    let source = paths::resolve_file_nocase(root, &install.source, lookup).ok_or_else(missing)?;
    let destination = match install.destination.as_deref() {
        None => install.source.clone(),
        Some("") => install
            .source
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string(),
        Some(dest) => dest.to_string(),
    };
    Ok(vec![PlannedFile {
        source,
        destination,
    }])
}

fn join_dest(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{base}/{rel}")
    }
}

fn describe(cond: &Condition) -> String {
    match cond {
        Condition::All(children) | Condition::Any(children) => children
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join(", "),
        Condition::Flag { name, value } => format!("flag {name}={value}"),
        Condition::File { name, state } => format!("{name} {state:?}"),
        Condition::GameVersion { min } => format!("game version {min}"),
        Condition::Selected { plugin } => format!("option {plugin}"),
    }
}

/// Supplies the choices for each step of a run.
pub trait Selector {
    /// Called once with the parsed script before the first step.
    fn prepare(&mut self, _config: &ModuleConfig) -> Result<()> {
        Ok(())
    }

    fn choose(&mut self, step: &StepView) -> Result<StepSelection>;
}

/// Takes whatever the session proposes as defaults.
pub struct AcceptDefaults;

impl Selector for AcceptDefaults {
    fn choose(&mut self, step: &StepView) -> Result<StepSelection> {
        Ok(step.defaults.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub step: String,
    pub group: String,
    pub plugins: Vec<String>,
}

/// Fixed choices given up front (`Step/Group=PluginA,PluginB`); groups
/// without a preset keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct PresetSelector {
    presets: Vec<Preset>,
    used: HashSet<usize>,
}

impl PresetSelector {
    pub fn new(presets: Vec<Preset>) -> Self {
        Self {
            presets,
            used: HashSet::new(),
        }
    }

    pub fn parse(raw: &[String]) -> std::result::Result<Self, ValidationError> {
        let mut presets = Vec::new();
        for entry in raw {
            let bad = || ValidationError::DanglingReference {
                kind: "selection",
                name: entry.clone(),
            };
            let (path, plugins) = entry.split_once('=').ok_or_else(bad)?;
            let (step, group) = path.split_once('/').ok_or_else(bad)?;
            let plugins = plugins
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            presets.push(Preset {
                step: step.trim().to_string(),
                group: group.trim().to_string(),
                plugins,
            });
        }
        Ok(Self::new(presets))
    }

    /// Fails when a preset names a step, group or plugin the script does not
    /// define. Run before the session so nothing is staged on a typo.
    pub fn verify(&self, config: &ModuleConfig) -> std::result::Result<(), ValidationError> {
        for preset in &self.presets {
            let group = config
                .steps
                .iter()
                .filter(|step| step.name == preset.step)
                .flat_map(|step| step.groups.iter())
                .find(|group| group.name == preset.group)
                .ok_or_else(|| ValidationError::DanglingReference {
                    kind: "group",
                    name: format!("{}/{}", preset.step, preset.group),
                })?;
            for plugin in &preset.plugins {
                if !group.plugins.iter().any(|p| p.name == *plugin) {
                    return Err(ValidationError::DanglingReference {
                        kind: "plugin",
                        name: format!("{}/{}/{}", preset.step, preset.group, plugin),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn unused(&self) -> impl Iterator<Item = &Preset> {
        self.presets
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.used.contains(idx))
            .map(|(_, preset)| preset)
    }
}

impl Selector for PresetSelector {
    fn prepare(&mut self, config: &ModuleConfig) -> Result<()> {
        self.verify(config)?;
        Ok(())
    }

    fn choose(&mut self, step: &StepView) -> Result<StepSelection> {
        let mut choice = step.defaults.clone();
        for (idx, preset) in self.presets.iter().enumerate() {
            if preset.step != step.name {
                continue;
            }
            if let Some(slot) = choice.get_mut(&preset.group) {
                *slot = preset.plugins.clone();
                self.used.insert(idx);
            }
        }
        Ok(choice)
    }
}

/// Drives a session to completion with `selector` and resolves its files.
pub fn run(
    config: &ModuleConfig,
    game: &GameContext,
    remembered: Option<&RecordedSelections>,
    selector: &mut dyn Selector,
    root: &Path,
) -> Result<ScriptOutcome> {
    selector.prepare(config)?;
    let mut session = InstallSession::new(config, game)?.with_memory(remembered);
    while let Some(view) = session.current() {
        let choice = selector.choose(&view)?;
        session.select(choice)?;
    }
    session.finish(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"<config>
  <moduleName>Armor Pack</moduleName>
  <requiredInstallFiles>
    <file source="readme.txt" destination="docs/readme.txt"/>
  </requiredInstallFiles>
  <installSteps order="Explicit">
    <installStep name="Body">
      <optionalFileGroups order="Explicit">
        <group name="Variant" type="SelectExactlyOne">
          <plugins order="Explicit">
            <plugin name="P1">
              <files><folder source="p1" destination="meshes"/></files>
              <conditionFlags><flag name="body">one</flag></conditionFlags>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
            <plugin name="P2">
              <files><folder source="p2" destination="meshes"/></files>
              <conditionFlags><flag name="body">two</flag></conditionFlags>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
          </plugins>
        </group>
        <group name="Extras" type="SelectAtLeastOne">
          <plugins order="Explicit">
            <plugin name="Gloves">
              <files><file source="extras/gloves.nif" destination="meshes/gloves.nif"/></files>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
            <plugin name="Broken">
              <typeDescriptor><type name="NotUsable"/></typeDescriptor>
            </plugin>
          </plugins>
        </group>
      </optionalFileGroups>
    </installStep>
    <installStep name="Patches">
      <visible><flagDependency flag="body" value="two"/></visible>
      <optionalFileGroups>
        <group name="Patch" type="SelectAny">
          <plugins>
            <plugin name="P2 Patch">
              <files><file source="patch/p2.esp" destination="p2.esp" priority="5"/></files>
              <typeDescriptor><type name="Recommended"/></typeDescriptor>
            </plugin>
          </plugins>
        </group>
      </optionalFileGroups>
    </installStep>
  </installSteps>
</config>"#;

    fn fixture() -> (TempDir, ModuleConfig) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for (rel, data) in [
            ("readme.txt", "read me"),
            ("p1/body.nif", "p1"),
            ("p1/p1_only.nif", "p1"),
            ("p2/Body.nif", "p2"),
            ("extras/gloves.nif", "g"),
            ("patch/p2.esp", "esp"),
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        let config = ModuleConfig::parse(SCRIPT.as_bytes()).unwrap();
        (temp, config)
    }

    fn choice(pairs: &[(&str, &[&str])]) -> StepSelection {
        pairs
            .iter()
            .map(|(group, plugins)| {
                (
                    group.to_string(),
                    plugins.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect()
    }

    fn destinations(outcome: &ScriptOutcome) -> Vec<&str> {
        outcome
            .files
            .iter()
            .map(|f| f.destination.as_str())
            .collect()
    }

    #[test]
    fn defaults_follow_group_rules() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let session = InstallSession::new(&config, &game).unwrap();
        let view = session.current().unwrap();
        assert_eq!(view.name, "Body");
        assert_eq!(
            view.defaults,
            choice(&[("Variant", &["P1"]), ("Extras", &["Gloves"])])
        );
    }

    #[test]
    fn flags_unlock_later_steps() {
        let (temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        session
            .select(choice(&[("Variant", &["P2"]), ("Extras", &["Gloves"])]))
            .unwrap();
        let view = session.current().unwrap();
        assert_eq!(view.name, "Patches");
        assert_eq!(view.defaults, choice(&[("Patch", &["P2 Patch"])]));
        session.select(view.defaults.clone()).unwrap();

        let outcome = session.finish(temp.path()).unwrap();
        assert_eq!(
            destinations(&outcome),
            vec!["docs/readme.txt", "meshes/Body.nif", "meshes/gloves.nif", "p2.esp"]
        );
        assert_eq!(outcome.flags.get("body").map(String::as_str), Some("two"));
    }

    #[test]
    fn hidden_step_is_skipped() {
        let (temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        session
            .select(choice(&[("Variant", &["P1"]), ("Extras", &["Gloves"])]))
            .unwrap();
        assert!(session.is_complete());
        let outcome = session.finish(temp.path()).unwrap();
        assert!(destinations(&outcome).contains(&"meshes/p1_only.nif"));
        assert!(!destinations(&outcome).contains(&"p2.esp"));
    }

    #[test]
    fn back_restores_flags() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        session
            .select(choice(&[("Variant", &["P2"]), ("Extras", &["Gloves"])]))
            .unwrap();
        assert!(session.back());
        let view = session.current().unwrap();
        assert_eq!(view.name, "Body");
        session
            .select(choice(&[("Variant", &["P1"]), ("Extras", &["Gloves"])]))
            .unwrap();
        assert!(session.is_complete());
        assert!(session.back());
        assert_eq!(session.current().unwrap().name, "Body");
        assert!(!session.back());
    }

    #[test]
    fn exactly_one_violation() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        let err = session
            .select(choice(&[("Variant", &["P1", "P2"]), ("Extras", &["Gloves"])]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::SelectionViolation {
                step: "Body".to_string(),
                group: "Variant".to_string(),
                rule: "select exactly one",
                count: 2,
            }
        );
    }

    #[test]
    fn at_least_one_with_nothing_fails() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        let err = session
            .select(choice(&[("Variant", &["P1"]), ("Extras", &[])]))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SelectionViolation { rule: "select at least one", count: 0, .. }
        ));
        // The session did not advance.
        assert_eq!(session.current().unwrap().name, "Body");
    }

    #[test]
    fn not_usable_and_dangling_are_rejected() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let mut session = InstallSession::new(&config, &game).unwrap();
        assert!(matches!(
            session.select(choice(&[("Variant", &["P1"]), ("Extras", &["Broken"])])),
            Err(ValidationError::NotUsable { .. })
        ));
        assert!(matches!(
            session.select(choice(&[("Variant", &["P3"]), ("Extras", &["Gloves"])])),
            Err(ValidationError::DanglingReference { kind: "plugin", .. })
        ));
        assert!(matches!(
            session.select(choice(&[("Colour", &["Red"])])),
            Err(ValidationError::DanglingReference { kind: "group", .. })
        ));
    }

    #[test]
    fn remembered_choices_become_defaults() {
        let (temp, config) = fixture();
        let game = GameContext::default();
        let mut memory = RecordedSelections::default();
        memory.steps.insert(
            "Body".to_string(),
            choice(&[("Variant", &["P2"]), ("Extras", &["Gloves"])]),
        );
        memory
            .steps
            .insert("Patches".to_string(), choice(&[("Patch", &[])]));

        let outcome = run(&config, &game, Some(&memory), &mut AcceptDefaults, temp.path()).unwrap();
        let dests = destinations(&outcome);
        assert!(dests.contains(&"meshes/Body.nif"));
        assert!(!dests.contains(&"meshes/p1_only.nif"));
        assert!(!dests.contains(&"p2.esp"));
    }

    #[test]
    fn stale_memory_is_ignored() {
        let (_temp, config) = fixture();
        let game = GameContext::default();
        let mut memory = RecordedSelections::default();
        memory
            .steps
            .insert("Body".to_string(), choice(&[("Variant", &["Removed"])]));
        let session = InstallSession::new(&config, &game)
            .unwrap()
            .with_memory(Some(&memory));
        let view = session.current().unwrap();
        assert_eq!(view.defaults.get("Variant").unwrap(), &vec!["P1".to_string()]);
    }

    #[test]
    fn presets_override_and_verify() {
        let (temp, config) = fixture();
        let game = GameContext::default();
        let mut presets =
            PresetSelector::parse(&["Body/Variant=P2".to_string(), "Patches/Patch=".to_string()])
                .unwrap();
        presets.verify(&config).unwrap();
        let outcome = run(&config, &game, None, &mut presets, temp.path()).unwrap();
        assert_eq!(
            destinations(&outcome),
            vec!["docs/readme.txt", "meshes/Body.nif", "meshes/gloves.nif"]
        );
        assert_eq!(presets.unused().count(), 0);

        let typo = PresetSelector::parse(&["Body/Varient=P2".to_string()]).unwrap();
        assert!(matches!(
            typo.verify(&config),
            Err(ValidationError::DanglingReference { kind: "group", .. })
        ));
    }

    #[test]
    fn missing_source_fails_finish() {
        let (temp, config) = fixture();
        fs::remove_file(temp.path().join("readme.txt")).unwrap();
        let game = GameContext::default();
        let err = run(&config, &game, None, &mut AcceptDefaults, temp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingSource(_))
        ));
    }
}
