use super::script::Element;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

/// Dotted numeric version, compared component by component with missing
/// components treated as zero (`1.5` == `1.5.0`).
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Version(Vec<u32>);

impl Version {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::BadVersion(raw.to_string()));
        }
        trimmed
            .split('.')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(Version)
            .map_err(|_| ValidationError::BadVersion(raw.to_string()))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|part| part.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Active,
    Inactive,
    Missing,
}

impl FileState {
    fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw {
            "Active" => Ok(FileState::Active),
            "Inactive" => Ok(FileState::Inactive),
            "Missing" => Ok(FileState::Missing),
            other => Err(ValidationError::UnknownCondition(format!(
                "fileDependency state=\"{other}\""
            ))),
        }
    }
}

/// Boolean expression attached to steps, groups, plugin types and
/// conditional installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Flag { name: String, value: String },
    File { name: String, state: FileState },
    GameVersion { min: Version },
    /// `<pluginDependency plugin="..."/>`: true once a plugin of that name was
    /// chosen in an earlier step.
    Selected { plugin: String },
}

/// What the game install looks like to the script: its version and which
/// plugin files exist and are enabled.
#[derive(Debug, Clone, Default)]
pub struct GameContext {
    pub version: Option<Version>,
    files: HashMap<String, bool>,
}

impl GameContext {
    pub fn new(version: Option<Version>) -> Self {
        Self {
            version,
            files: HashMap::new(),
        }
    }

    pub fn add_file(&mut self, name: &str, active: bool) {
        let entry = self.files.entry(name.to_lowercase()).or_insert(false);
        *entry |= active;
    }

    pub fn file_state(&self, name: &str) -> FileState {
        match self.files.get(&name.replace('\\', "/").to_lowercase()) {
            Some(true) => FileState::Active,
            Some(false) => FileState::Inactive,
            None => FileState::Missing,
        }
    }
}

/// Immutable view of everything decided before the step being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub flags: &'a BTreeMap<String, String>,
    pub selected: &'a BTreeSet<String>,
    pub game: &'a GameContext,
}

impl Condition {
    pub fn from_element(el: &Element) -> Result<Self, ValidationError> {
        match el.name.as_str() {
            "dependencies" | "moduleDependencies" | "visible" => {
                let operator = el.attr("operator").unwrap_or("And");
                let children = el
                    .children
                    .iter()
                    .map(Condition::from_element)
                    .collect::<Result<Vec<_>, _>>()?;
                match operator {
                    "And" | "and" => Ok(Condition::All(children)),
                    "Or" | "or" => Ok(Condition::Any(children)),
                    other => Err(ValidationError::UnknownOperator(other.to_string())),
                }
            }
            "flagDependency" => Ok(Condition::Flag {
                name: required_attr(el, "flag")?,
                value: el.attr("value").unwrap_or_default().to_string(),
            }),
            "fileDependency" => Ok(Condition::File {
                name: required_attr(el, "file")?,
                state: FileState::parse(el.attr("state").unwrap_or("Active"))?,
            }),
            "gameDependency" => Ok(Condition::GameVersion {
                min: Version::parse(&required_attr(el, "version")?)?,
            }),
            // Manager version checks do not apply here.
            "fommDependency" | "foseDependency" => Ok(Condition::All(Vec::new())),
            "pluginDependency" => Ok(Condition::Selected {
                plugin: required_attr(el, "plugin")?,
            }),
            other => Err(ValidationError::UnknownCondition(other.to_string())),
        }
    }

    pub fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::All(children) => children.iter().all(|child| child.eval(ctx)),
            Condition::Any(children) => {
                children.is_empty() || children.iter().any(|child| child.eval(ctx))
            }
            Condition::Flag { name, value } => {
                ctx.flags.get(name).map(String::as_str).unwrap_or("") == value
            }
            Condition::File { name, state } => ctx.game.file_state(name) == *state,
            Condition::GameVersion { min } => match &ctx.game.version {
                Some(version) => version >= min,
                None => {
                    tracing::debug!(%min, "game version unknown; treating requirement as met");
                    true
                }
            },
            Condition::Selected { plugin } => ctx.selected.contains(plugin),
        }
    }
}

fn required_attr(el: &Element, name: &'static str) -> Result<String, ValidationError> {
    el.attr(name)
        .map(str::to_string)
        .ok_or(ValidationError::MissingElement(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fomod::script::parse_document;

    fn cond(xml: &str) -> Result<Condition, ValidationError> {
        let doc = parse_document(xml.as_bytes())?;
        Condition::from_element(&doc)
    }

    fn ctx<'a>(
        flags: &'a BTreeMap<String, String>,
        selected: &'a BTreeSet<String>,
        game: &'a GameContext,
    ) -> EvalContext<'a> {
        EvalContext {
            flags,
            selected,
            game,
        }
    }

    #[test]
    fn versions_compare_numerically() {
        assert!(Version::parse("1.10").unwrap() > Version::parse("1.9.9").unwrap());
        assert_eq!(Version::parse("1.5").unwrap(), Version::parse("1.5.0").unwrap());
        assert!(Version::parse("1.x").is_err());
    }

    #[test]
    fn and_or_over_flags() {
        let c = cond(
            r#"<dependencies operator="Or">
                 <flagDependency flag="a" value="On"/>
                 <dependencies>
                   <flagDependency flag="b" value="1"/>
                   <flagDependency flag="c" value=""/>
                 </dependencies>
               </dependencies>"#,
        )
        .unwrap();
        let game = GameContext::default();
        let selected = BTreeSet::new();
        let mut flags = BTreeMap::new();
        assert!(!c.eval(&ctx(&flags, &selected, &game)));
        flags.insert("b".to_string(), "1".to_string());
        assert!(c.eval(&ctx(&flags, &selected, &game)));
        flags.insert("c".to_string(), "set".to_string());
        assert!(!c.eval(&ctx(&flags, &selected, &game)));
        flags.insert("a".to_string(), "On".to_string());
        assert!(c.eval(&ctx(&flags, &selected, &game)));
    }

    #[test]
    fn file_states() {
        let mut game = GameContext::new(Some(Version::parse("1.6.640").unwrap()));
        game.add_file("SkyUI_SE.esp", true);
        game.add_file("Old.esp", false);
        let flags = BTreeMap::new();
        let selected = BTreeSet::new();
        let c = ctx(&flags, &selected, &game);

        let active = cond(r#"<fileDependency file="skyui_se.esp" state="Active"/>"#).unwrap();
        let inactive = cond(r#"<fileDependency file="Old.esp" state="Inactive"/>"#).unwrap();
        let missing = cond(r#"<fileDependency file="None.esp" state="Missing"/>"#).unwrap();
        let version = cond(r#"<gameDependency version="1.6.0"/>"#).unwrap();
        assert!(active.eval(&c));
        assert!(inactive.eval(&c));
        assert!(missing.eval(&c));
        assert!(version.eval(&c));
    }

    #[test]
    fn unknown_elements_are_errors() {
        assert_eq!(
            cond(r#"<dependencies operator="Xor"/>"#),
            Err(ValidationError::UnknownOperator("Xor".to_string()))
        );
        assert_eq!(
            cond(r#"<scriptDependency/>"#),
            Err(ValidationError::UnknownCondition("scriptDependency".to_string()))
        );
    }

    #[test]
    fn selected_plugin_condition() {
        let c = cond(r#"<pluginDependency plugin="HD Textures"/>"#).unwrap();
        let game = GameContext::default();
        let flags = BTreeMap::new();
        let mut selected = BTreeSet::new();
        assert!(!c.eval(&ctx(&flags, &selected, &game)));
        selected.insert("HD Textures".to_string());
        assert!(c.eval(&ctx(&flags, &selected, &game)));
    }
}
