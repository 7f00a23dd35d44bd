use super::condition::Condition;
use crate::error::{IoResultExt, Result, ValidationError};
use quick_xml::{events::Event, Reader};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Minimal element tree; namespaces are stripped to local names.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn text_trimmed(&self) -> String {
        self.text.trim().to_string()
    }
}

/// Parses an XML document into an [`Element`] tree. UTF-16 (with BOM) and
/// UTF-8 (with or without BOM) inputs are accepted.
pub fn parse_document(bytes: &[u8]) -> std::result::Result<Element, ValidationError> {
    let text = decode_text(bytes)?;
    let mut reader = Reader::from_reader(text.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(start_element(&e)?),
            Ok(Event::Empty(e)) => {
                let el = start_element(&e)?;
                attach(&mut stack, &mut root, el);
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| ValidationError::Xml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, el);
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = stack.last_mut() {
                    let value = e
                        .unescape()
                        .map_err(|err| ValidationError::Xml(err.to_string()))?;
                    current.text.push_str(&value);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(ValidationError::Xml(format!(
                    "at byte {}: {err}",
                    reader.buffer_position()
                )))
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ValidationError::Xml("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| ValidationError::Xml("document has no root element".to_string()))
}

fn start_element(
    e: &quick_xml::events::BytesStart<'_>,
) -> std::result::Result<Element, ValidationError> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ValidationError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ValidationError::Xml(err.to_string()))?;
        attrs.push((key, value.into_owned()));
    }
    Ok(Element {
        name,
        attrs,
        ..Element::default()
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None => {
            if root.is_none() {
                *root = Some(el);
            }
        }
    }
}

fn decode_text(bytes: &[u8]) -> std::result::Result<String, ValidationError> {
    let utf16 = |data: &[u8], little: bool| {
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| {
                if little {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16(&units).map_err(|err| ValidationError::Xml(err.to_string()))
    };
    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => Ok(String::from_utf8_lossy(rest).into_owned()),
        _ => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    SelectExactlyOne,
    SelectAtMostOne,
    SelectAtLeastOne,
    SelectAny,
    SelectAll,
}

impl GroupType {
    pub fn parse(raw: &str) -> std::result::Result<Self, ValidationError> {
        match raw {
            "SelectExactlyOne" => Ok(GroupType::SelectExactlyOne),
            "SelectAtMostOne" => Ok(GroupType::SelectAtMostOne),
            "SelectAtLeastOne" => Ok(GroupType::SelectAtLeastOne),
            "SelectAny" => Ok(GroupType::SelectAny),
            "SelectAll" => Ok(GroupType::SelectAll),
            other => Err(ValidationError::UnknownSelectionType(other.to_string())),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GroupType::SelectExactlyOne => "select exactly one",
            GroupType::SelectAtMostOne => "select at most one",
            GroupType::SelectAtLeastOne => "select at least one",
            GroupType::SelectAny => "select any",
            GroupType::SelectAll => "select all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Required,
    Recommended,
    Optional,
    CouldBeUsable,
    NotUsable,
}

impl PluginType {
    pub fn parse(raw: &str) -> std::result::Result<Self, ValidationError> {
        match raw {
            "Required" => Ok(PluginType::Required),
            "Recommended" => Ok(PluginType::Recommended),
            "Optional" => Ok(PluginType::Optional),
            "CouldBeUsable" => Ok(PluginType::CouldBeUsable),
            "NotUsable" => Ok(PluginType::NotUsable),
            other => Err(ValidationError::UnknownPluginType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Static(PluginType),
    /// First matching pattern wins, otherwise `default`.
    Conditional {
        default: PluginType,
        patterns: Vec<(Condition, PluginType)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInstall {
    /// Normalized path below the script root.
    pub source: String,
    /// `None` when the script omits it: install to the source path.
    pub destination: Option<String>,
    pub priority: i64,
    pub is_folder: bool,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub files: Vec<FileInstall>,
    pub flags: Vec<(String, String)>,
    pub type_descriptor: TypeDescriptor,
    pub visible: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub kind: GroupType,
    pub plugins: Vec<Plugin>,
    pub visible: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub visible: Option<Condition>,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone)]
pub struct ConditionalInstall {
    pub condition: Condition,
    pub files: Vec<FileInstall>,
}

/// A parsed `ModuleConfig.xml`.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub image: Option<String>,
    pub dependencies: Option<Condition>,
    pub required_files: Vec<FileInstall>,
    pub steps: Vec<Step>,
    pub conditional_installs: Vec<ConditionalInstall>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub author: String,
    pub version: String,
    pub description: String,
}

/// Where an install script was found inside an extracted archive.
#[derive(Debug, Clone)]
pub struct ScriptLocation {
    /// Directory holding the `fomod` folder; script sources are relative to it.
    pub root: PathBuf,
    pub config: PathBuf,
    pub info: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortOrder {
    Explicit,
    Ascending,
    Descending,
}

impl SortOrder {
    fn of(el: &Element) -> std::result::Result<Self, ValidationError> {
        match el.attr("order").unwrap_or("Ascending") {
            "Explicit" => Ok(SortOrder::Explicit),
            "Ascending" => Ok(SortOrder::Ascending),
            "Descending" => Ok(SortOrder::Descending),
            other => Err(ValidationError::Xml(format!("unknown order \"{other}\""))),
        }
    }

    fn apply<T>(self, items: &mut [T], name: impl Fn(&T) -> &str) {
        match self {
            SortOrder::Explicit => {}
            SortOrder::Ascending => {
                items.sort_by_key(|item| name(item).to_lowercase());
            }
            SortOrder::Descending => {
                items.sort_by_key(|item| name(item).to_lowercase());
                items.reverse();
            }
        }
    }
}

impl ModuleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).io_ctx("read install script", path)?;
        Ok(Self::parse(&bytes)?)
    }

    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, ValidationError> {
        let root = parse_document(bytes)?;
        if root.name != "config" {
            return Err(ValidationError::MissingElement("config"));
        }
        let name = root
            .child("moduleName")
            .map(Element::text_trimmed)
            .unwrap_or_default();
        let image = root
            .child("moduleImage")
            .and_then(|el| el.attr("path"))
            .map(str::to_string);
        let dependencies = root
            .child("moduleDependencies")
            .map(Condition::from_element)
            .transpose()?;
        let required_files = root
            .child("requiredInstallFiles")
            .map(parse_files)
            .transpose()?
            .unwrap_or_default();

        let mut steps = Vec::new();
        if let Some(steps_el) = root.child("installSteps") {
            for step_el in steps_el.children_named("installStep") {
                steps.push(parse_step(step_el)?);
            }
            SortOrder::of(steps_el)?.apply(&mut steps, |step| step.name.as_str());
        }

        let mut conditional_installs = Vec::new();
        if let Some(patterns) = root
            .child("conditionalFileInstalls")
            .and_then(|el| el.child("patterns"))
        {
            for pattern in patterns.children_named("pattern") {
                let condition = pattern
                    .child("dependencies")
                    .map(Condition::from_element)
                    .transpose()?
                    .unwrap_or(Condition::All(Vec::new()));
                let files = pattern
                    .child("files")
                    .map(parse_files)
                    .transpose()?
                    .unwrap_or_default();
                conditional_installs.push(ConditionalInstall { condition, files });
            }
        }

        Ok(ModuleConfig {
            name,
            image,
            dependencies,
            required_files,
            steps,
            conditional_installs,
        })
    }
}

impl ModuleInfo {
    /// `info.xml` is advisory; unreadable files yield an empty record.
    pub fn from_file(path: &Path) -> Self {
        let Ok(bytes) = fs::read(path) else {
            return Self::default();
        };
        match parse_document(&bytes) {
            Ok(root) => {
                let field = |name: &str| {
                    root.child(name)
                        .map(Element::text_trimmed)
                        .unwrap_or_default()
                };
                ModuleInfo {
                    name: field("Name"),
                    author: field("Author"),
                    version: field("Version"),
                    description: field("Description"),
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable info.xml: {err}");
                Self::default()
            }
        }
    }
}

fn parse_visible(el: &Element) -> std::result::Result<Option<Condition>, ValidationError> {
    let Some(visible) = el.child("visible") else {
        return Ok(None);
    };
    // `<visible>` either wraps a `<dependencies>` block or holds the
    // dependency elements directly.
    match visible.child("dependencies") {
        Some(deps) if visible.children.len() == 1 => Condition::from_element(deps).map(Some),
        _ => Condition::from_element(visible).map(Some),
    }
}

fn parse_step(el: &Element) -> std::result::Result<Step, ValidationError> {
    let name = el.attr("name").unwrap_or_default().to_string();
    let visible = parse_visible(el)?;
    let mut groups = Vec::new();
    if let Some(groups_el) = el.child("optionalFileGroups") {
        for group_el in groups_el.children_named("group") {
            groups.push(parse_group(group_el)?);
        }
        SortOrder::of(groups_el)?.apply(&mut groups, |group| group.name.as_str());
    }
    Ok(Step {
        name,
        visible,
        groups,
    })
}

fn parse_group(el: &Element) -> std::result::Result<Group, ValidationError> {
    let name = el.attr("name").unwrap_or_default().to_string();
    let kind = GroupType::parse(el.attr("type").unwrap_or("SelectAny"))?;
    let visible = parse_visible(el)?;
    let mut plugins = Vec::new();
    if let Some(plugins_el) = el.child("plugins") {
        for plugin_el in plugins_el.children_named("plugin") {
            plugins.push(parse_plugin(plugin_el)?);
        }
        SortOrder::of(plugins_el)?.apply(&mut plugins, |plugin| plugin.name.as_str());
    }
    Ok(Group {
        name,
        kind,
        plugins,
        visible,
    })
}

fn parse_plugin(el: &Element) -> std::result::Result<Plugin, ValidationError> {
    let name = el.attr("name").unwrap_or_default().to_string();
    let description = el
        .child("description")
        .map(Element::text_trimmed)
        .unwrap_or_default();
    let image = el
        .child("image")
        .and_then(|img| img.attr("path"))
        .map(str::to_string);
    let files = el
        .child("files")
        .map(parse_files)
        .transpose()?
        .unwrap_or_default();
    let flags = el
        .child("conditionFlags")
        .map(|flags| {
            flags
                .children_named("flag")
                .filter_map(|flag| {
                    let name = flag.attr("name")?;
                    (!name.is_empty()).then(|| (name.to_string(), flag.text_trimmed()))
                })
                .collect()
        })
        .unwrap_or_default();
    let type_descriptor = match el.child("typeDescriptor") {
        Some(td) => parse_type_descriptor(td)?,
        None => TypeDescriptor::Static(PluginType::Optional),
    };
    Ok(Plugin {
        name,
        description,
        image,
        files,
        flags,
        type_descriptor,
        visible: parse_visible(el)?,
    })
}

fn parse_type_descriptor(el: &Element) -> std::result::Result<TypeDescriptor, ValidationError> {
    if let Some(ty) = el.child("type") {
        return Ok(TypeDescriptor::Static(PluginType::parse(
            ty.attr("name").unwrap_or("Optional"),
        )?));
    }
    let Some(dep_type) = el.child("dependencyType") else {
        return Ok(TypeDescriptor::Static(PluginType::Optional));
    };
    let default = match dep_type.child("defaultType") {
        Some(default) => PluginType::parse(default.attr("name").unwrap_or("Optional"))?,
        None => PluginType::Optional,
    };
    let mut patterns = Vec::new();
    if let Some(patterns_el) = dep_type.child("patterns") {
        for pattern in patterns_el.children_named("pattern") {
            let (Some(deps), Some(ty)) = (pattern.child("dependencies"), pattern.child("type"))
            else {
                continue;
            };
            patterns.push((
                Condition::from_element(deps)?,
                PluginType::parse(ty.attr("name").unwrap_or("Optional"))?,
            ));
        }
    }
    Ok(TypeDescriptor::Conditional { default, patterns })
}

fn parse_files(el: &Element) -> std::result::Result<Vec<FileInstall>, ValidationError> {
    let mut files = Vec::new();
    for child in &el.children {
        let is_folder = match child.name.as_str() {
            "file" => false,
            "folder" => true,
            _ => continue,
        };
        let raw_source = child
            .attr("source")
            .ok_or(ValidationError::MissingElement("source"))?;
        let source = crate::paths::normalize_rel(raw_source)
            .ok_or_else(|| ValidationError::MissingSource(raw_source.to_string()))?;
        let destination = match child.attr("destination") {
            Some(raw) => Some(
                crate::paths::normalize_rel(raw)
                    .ok_or_else(|| ValidationError::Xml(format!("destination escapes root: {raw}")))?,
            ),
            None => None,
        };
        let priority = match child.attr("priority") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ValidationError::Xml(format!("bad priority \"{raw}\"")))?,
            None => 0,
        };
        files.push(FileInstall {
            source,
            destination,
            priority,
            is_folder,
        });
    }
    Ok(files)
}

/// Looks for `fomod/ModuleConfig.xml` (any casing) in the archive root and the
/// directories up to two levels below it, breadth first with sorted entries.
pub fn discover(root: &Path) -> Option<ScriptLocation> {
    let mut level = vec![root.to_path_buf()];
    for _ in 0..3 {
        let mut next = Vec::new();
        for dir in &level {
            let mut children = sorted_subdirs(dir);
            if let Some(found) = check_dir(dir, &children) {
                return Some(found);
            }
            next.append(&mut children);
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }
    None
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn check_dir(dir: &Path, children: &[PathBuf]) -> Option<ScriptLocation> {
    let fomod = children.iter().find(|child| {
        child
            .file_name()
            .map(|name| name.to_string_lossy().eq_ignore_ascii_case("fomod"))
            .unwrap_or(false)
    })?;
    let mut config = None;
    let mut info = None;
    for entry in fs::read_dir(fomod).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name == "moduleconfig.xml" {
            config = Some(entry.path());
        } else if name == "info.xml" {
            info = Some(entry.path());
        }
    }
    Some(ScriptLocation {
        root: dir.to_path_buf(),
        config: config?,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<config xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <moduleName>Better Water</moduleName>
  <requiredInstallFiles>
    <folder source="core" destination=""/>
  </requiredInstallFiles>
  <installSteps order="Explicit">
    <installStep name="Options">
      <optionalFileGroups order="Explicit">
        <group name="Quality" type="SelectExactlyOne">
          <plugins order="Explicit">
            <plugin name="Low">
              <description>Small textures</description>
              <files><file source="low\water.dds" destination="textures\water.dds" priority="1"/></files>
              <conditionFlags><flag name="quality">low</flag></conditionFlags>
              <typeDescriptor><type name="Optional"/></typeDescriptor>
            </plugin>
            <plugin name="High">
              <files><file source="high/water.dds" destination="textures/water.dds"/></files>
              <typeDescriptor>
                <dependencyType>
                  <defaultType name="Optional"/>
                  <patterns>
                    <pattern>
                      <dependencies><fileDependency file="HD.esp" state="Active"/></dependencies>
                      <type name="Recommended"/>
                    </pattern>
                  </patterns>
                </dependencyType>
              </typeDescriptor>
            </plugin>
          </plugins>
        </group>
      </optionalFileGroups>
    </installStep>
  </installSteps>
  <conditionalFileInstalls>
    <patterns>
      <pattern>
        <dependencies operator="And"><flagDependency flag="quality" value="low"/></dependencies>
        <files><file source="extra/low.ini" destination="low.ini"/></files>
      </pattern>
    </patterns>
  </conditionalFileInstalls>
</config>"#;

    #[test]
    fn parses_structure() {
        let config = ModuleConfig::parse(SCRIPT.as_bytes()).unwrap();
        assert_eq!(config.name, "Better Water");
        assert_eq!(config.required_files.len(), 1);
        assert!(config.required_files[0].is_folder);
        assert_eq!(config.required_files[0].destination.as_deref(), Some(""));

        let group = &config.steps[0].groups[0];
        assert_eq!(group.kind, GroupType::SelectExactlyOne);
        assert_eq!(group.plugins[0].name, "Low");
        assert_eq!(group.plugins[0].files[0].source, "low/water.dds");
        assert_eq!(group.plugins[0].files[0].priority, 1);
        assert_eq!(
            group.plugins[0].flags,
            vec![("quality".to_string(), "low".to_string())]
        );
        assert!(matches!(
            group.plugins[1].type_descriptor,
            TypeDescriptor::Conditional { .. }
        ));
        assert_eq!(config.conditional_installs.len(), 1);
    }

    #[test]
    fn utf16_scripts_are_decoded() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in SCRIPT.replace("UTF-8", "UTF-16").encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let config = ModuleConfig::parse(&bytes).unwrap();
        assert_eq!(config.name, "Better Water");
    }

    #[test]
    fn unknown_group_type_is_rejected() {
        let xml = r#"<config><installSteps><installStep name="s"><optionalFileGroups>
            <group name="g" type="SelectSome"><plugins/></group>
            </optionalFileGroups></installStep></installSteps></config>"#;
        let err = ModuleConfig::parse(xml.as_bytes()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownSelectionType("SelectSome".to_string()));
    }

    #[test]
    fn default_order_is_ascending() {
        let xml = r#"<config><installSteps><installStep name="s"><optionalFileGroups>
            <group name="g" type="SelectAny"><plugins>
              <plugin name="Zebra"/><plugin name="apple"/>
            </plugins></group>
            </optionalFileGroups></installStep></installSteps></config>"#;
        let config = ModuleConfig::parse(xml.as_bytes()).unwrap();
        let names: Vec<_> = config.steps[0].groups[0]
            .plugins
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["apple", "Zebra"]);
    }

    #[test]
    fn malformed_xml_is_validation_error() {
        let err = ModuleConfig::parse(b"<config><moduleName>x</config>").unwrap_err();
        assert!(matches!(err, ValidationError::Xml(_)));
    }

    #[test]
    fn discover_finds_nested_script() {
        let temp = TempDir::new().unwrap();
        let fomod = temp.path().join("Wrapper/Mod/FOMOD");
        fs::create_dir_all(&fomod).unwrap();
        fs::write(fomod.join("ModuleConfig.xml"), SCRIPT).unwrap();
        fs::write(fomod.join("info.xml"), "<fomod><Name>Water</Name></fomod>").unwrap();

        let found = discover(temp.path()).unwrap();
        assert_eq!(found.root, temp.path().join("Wrapper/Mod"));
        let info = ModuleInfo::from_file(found.info.as_deref().unwrap());
        assert_eq!(info.name, "Water");
    }

    #[test]
    fn discover_stops_below_three_levels() {
        let temp = TempDir::new().unwrap();
        let fomod = temp.path().join("a/b/c/d/fomod");
        fs::create_dir_all(&fomod).unwrap();
        fs::write(fomod.join("ModuleConfig.xml"), SCRIPT).unwrap();
        assert!(discover(temp.path()).is_none());
    }
}
