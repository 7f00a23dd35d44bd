use crate::{
    error::{IoResultExt, Result, SortError},
    fomod::GameContext,
    resolve::Resolution,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::Path,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub enabled: bool,
}

impl PluginEntry {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
        }
    }
}

/// `plugins.txt`: one plugin per line, `*` marks it enabled, first line loads
/// first. Blank lines and `#` comments are skipped.
pub fn parse_plugins_txt(text: &str) -> Vec<PluginEntry> {
    text.lines()
        .map(|line| line.trim().trim_start_matches('\u{feff}'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.strip_prefix('*') {
            Some(name) => PluginEntry::new(name.trim(), true),
            None => PluginEntry::new(line, false),
        })
        .filter(|entry| !entry.name.is_empty())
        .collect()
}

pub fn render_plugins_txt(entries: &[PluginEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if entry.enabled {
            out.push('*');
        }
        out.push_str(&entry.name);
        out.push('\n');
    }
    out
}

/// `loadorder.txt`: bare names, the full order including implicit plugins.
pub fn parse_loadorder_txt(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim().trim_start_matches('\u{feff}'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn render_loadorder_txt(entries: &[PluginEntry], implicit: &[&str]) -> String {
    let listed: HashSet<String> = entries.iter().map(|e| e.name.to_lowercase()).collect();
    let mut out = String::new();
    for name in implicit {
        if !listed.contains(&name.to_lowercase()) {
            out.push_str(name);
            out.push('\n');
        }
    }
    for entry in entries {
        out.push_str(&entry.name);
        out.push('\n');
    }
    out
}

pub fn read_list_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).io_ctx("read", path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginSyncReport {
    pub added: Vec<String>,
    pub pruned: Vec<String>,
}

/// Brings a profile's plugin order in line with what is deployed: plugin
/// files at the root of the winning map are appended enabled, and entries
/// whose file is neither deployed nor present in `deploy_dir` are dropped.
pub fn sync_plugins(
    order: &mut Vec<PluginEntry>,
    resolution: &Resolution,
    extensions: &[String],
    implicit: &[&str],
    deploy_dir: &Path,
) -> PluginSyncReport {
    let mut report = PluginSyncReport::default();
    if extensions.is_empty() {
        return report;
    }
    let is_plugin = |name: &str| {
        Path::new(name)
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                extensions.iter().any(|want| want.eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false)
    };
    let implicit: HashSet<String> = implicit.iter().map(|name| name.to_lowercase()).collect();

    let deployed: Vec<&str> = resolution
        .winners()
        .values()
        .map(|winner| winner.rel.as_str())
        .filter(|rel| !rel.contains('/') && is_plugin(rel))
        .collect();

    let mut present: HashSet<String> = deployed.iter().map(|name| name.to_lowercase()).collect();
    if let Ok(entries) = fs::read_dir(deploy_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_file() && is_plugin(&name) {
                present.insert(name.to_lowercase());
            }
        }
    }

    order.retain(|entry| {
        let keep = present.contains(&entry.name.to_lowercase());
        if !keep {
            report.pruned.push(entry.name.clone());
        }
        keep
    });

    let mut listed: HashSet<String> = order.iter().map(|e| e.name.to_lowercase()).collect();
    for name in deployed {
        let lower = name.to_lowercase();
        if implicit.contains(&lower) || !listed.insert(lower) {
            continue;
        }
        order.push(PluginEntry::new(name, true));
        report.added.push(name.to_string());
    }
    if !report.added.is_empty() || !report.pruned.is_empty() {
        tracing::info!(
            added = report.added.len(),
            pruned = report.pruned.len(),
            "plugin list synchronized"
        );
    }
    report
}

/// The external plugin-ordering tool. Its answer is taken as is.
pub trait PluginSorter {
    fn sort(
        &self,
        plugins: &[PluginEntry],
        game: &GameContext,
    ) -> std::result::Result<Vec<PluginEntry>, SortError>;
}

/// Sorter backed by an order some other tool already wrote out, such as a
/// `loadorder.txt`. Plugins the list does not mention keep their relative
/// order after the listed ones.
#[derive(Debug, Clone)]
pub struct ListSorter {
    order: Vec<String>,
}

impl ListSorter {
    pub fn new(order: Vec<String>) -> Self {
        Self { order }
    }

    pub fn from_file(path: &Path) -> std::result::Result<Self, SortError> {
        let text = read_list_file(path)
            .map_err(|err| SortError::Unavailable(err.to_string()))?;
        Ok(Self::new(parse_loadorder_txt(&text)))
    }
}

impl PluginSorter for ListSorter {
    fn sort(
        &self,
        plugins: &[PluginEntry],
        _game: &GameContext,
    ) -> std::result::Result<Vec<PluginEntry>, SortError> {
        let mut seen = HashSet::new();
        for name in &self.order {
            if !seen.insert(name.to_lowercase()) {
                return Err(SortError::Unsatisfiable(format!(
                    "{name} is listed more than once"
                )));
            }
        }
        let mut remaining: Vec<Option<&PluginEntry>> = plugins.iter().map(Some).collect();
        let mut sorted = Vec::with_capacity(plugins.len());
        for name in &self.order {
            let found = remaining.iter_mut().find(|slot| {
                slot.is_some_and(|entry| entry.name.eq_ignore_ascii_case(name))
            });
            if let Some(slot) = found {
                if let Some(entry) = slot.take() {
                    sorted.push(entry.clone());
                }
            }
        }
        sorted.extend(remaining.into_iter().flatten().cloned());
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{library::StagedFile, paths::CasePolicy, resolve::Resolver};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn plugins_txt_markers() {
        let parsed = parse_plugins_txt("# comment\n*A.esp\nB.esm\n\n* C.esl\n");
        assert_eq!(
            parsed,
            vec![
                PluginEntry::new("A.esp", true),
                PluginEntry::new("B.esm", false),
                PluginEntry::new("C.esl", true),
            ]
        );
        assert_eq!(render_plugins_txt(&parsed), "*A.esp\nB.esm\n*C.esl\n");
    }

    #[test]
    fn loadorder_puts_implicit_first() {
        let entries = vec![PluginEntry::new("Mod.esp", true)];
        assert_eq!(
            render_loadorder_txt(&entries, &["Skyrim.esm", "Update.esm"]),
            "Skyrim.esm\nUpdate.esm\nMod.esp\n"
        );
        assert_eq!(parse_loadorder_txt("a.esp\r\n\nb.esp"), vec!["a.esp", "b.esp"]);
    }

    #[test]
    fn sync_adds_deployed_and_prunes_missing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("Vanilla.esm"), "").unwrap();
        let mut resolver = Resolver::new(CasePolicy::Insensitive);
        let files = ["New.esp", "Skyrim.esm", "meshes/Nested.esp", "readme.txt"]
            .iter()
            .map(|rel| {
                Ok(StagedFile {
                    rel: rel.to_string(),
                    key: rel.to_lowercase(),
                    source: PathBuf::from(rel),
                })
            })
            .collect::<Vec<_>>();
        resolver.add_mod("M", files).unwrap();
        let resolution = resolver.finish();

        let mut order = vec![
            PluginEntry::new("Vanilla.esm", true),
            PluginEntry::new("Gone.esp", true),
        ];
        let report = sync_plugins(
            &mut order,
            &resolution,
            &["esp".to_string(), "esm".to_string()],
            &["Skyrim.esm"],
            temp.path(),
        );
        assert_eq!(report.pruned, vec!["Gone.esp"]);
        assert_eq!(report.added, vec!["New.esp"]);
        assert_eq!(
            order,
            vec![PluginEntry::new("Vanilla.esm", true), PluginEntry::new("New.esp", true)]
        );
    }

    #[test]
    fn list_sorter_orders_and_keeps_unlisted() {
        let plugins = vec![
            PluginEntry::new("a.esp", true),
            PluginEntry::new("b.esp", false),
            PluginEntry::new("c.esp", true),
        ];
        let sorter = ListSorter::new(vec!["C.esp".into(), "a.esp".into()]);
        let sorted = sorter.sort(&plugins, &GameContext::default()).unwrap();
        let names: Vec<&str> = sorted.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c.esp", "a.esp", "b.esp"]);

        let dup = ListSorter::new(vec!["a.esp".into(), "A.ESP".into()]);
        assert!(matches!(
            dup.sort(&plugins, &GameContext::default()),
            Err(SortError::Unsatisfiable(_))
        ));
    }
}
