use crate::{
    error::Result,
    library::{ModStore, StagedFile},
    paths::{uppercase_weight, CasePolicy},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::PathBuf,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Winner {
    /// Relative path as it will appear in the game directory.
    pub rel: String,
    pub owner: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictStatus {
    None,
    Wins,
    Loses,
    Partial,
    /// Every file of the mod is overridden; nothing of it reaches the game.
    Full,
}

impl ConflictStatus {
    pub fn label(self) -> &'static str {
        match self {
            ConflictStatus::None => "none",
            ConflictStatus::Wins => "wins",
            ConflictStatus::Loses => "loses",
            ConflictStatus::Partial => "partial",
            ConflictStatus::Full => "full",
        }
    }
}

/// Single forward pass over mods in ascending precedence: every file a mod
/// provides overwrites whatever an earlier mod put at the same key.
#[derive(Debug)]
pub struct Resolver {
    policy: CasePolicy,
    order: Vec<String>,
    winners: BTreeMap<String, Winner>,
    providers: HashMap<String, Vec<String>>,
    overrides: HashMap<String, BTreeSet<String>>,
    overridden_by: HashMap<String, BTreeSet<String>>,
    folders: HashMap<String, String>,
}

impl Resolver {
    pub fn new(policy: CasePolicy) -> Self {
        Self {
            policy,
            order: Vec::new(),
            winners: BTreeMap::new(),
            providers: HashMap::new(),
            overrides: HashMap::new(),
            overridden_by: HashMap::new(),
            folders: HashMap::new(),
        }
    }

    pub fn add_mod<I>(&mut self, name: &str, files: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<StagedFile>>,
    {
        self.order.push(name.to_string());
        for file in files {
            let file = file?;
            if self.policy == CasePolicy::Insensitive {
                self.note_folders(&file.rel);
            }
            let providers = self.providers.entry(file.key.clone()).or_default();
            if providers.last().map(String::as_str) != Some(name) {
                providers.push(name.to_string());
            }
            let previous = self.winners.insert(
                file.key,
                Winner {
                    rel: file.rel,
                    owner: name.to_string(),
                    source: file.source,
                },
            );
            if let Some(previous) = previous {
                if previous.owner != name {
                    self.overrides
                        .entry(name.to_string())
                        .or_default()
                        .insert(previous.owner.clone());
                    self.overridden_by
                        .entry(previous.owner)
                        .or_default()
                        .insert(name.to_string());
                }
            }
        }
        Ok(())
    }

    // Folder casing with the most uppercase letters wins; first seen on ties.
    fn note_folders(&mut self, rel: &str) {
        let segments: Vec<&str> = rel.split('/').collect();
        let mut prefix = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&segment.to_lowercase());
            match self.folders.get_mut(&prefix) {
                Some(current) => {
                    if uppercase_weight(segment) > uppercase_weight(current) {
                        *current = segment.to_string();
                    }
                }
                None => {
                    self.folders.insert(prefix.clone(), segment.to_string());
                }
            }
        }
    }

    fn canonical_rel(&self, rel: &str) -> String {
        let segments: Vec<&str> = rel.split('/').collect();
        let Some((file_name, dirs)) = segments.split_last() else {
            return rel.to_string();
        };
        let mut prefix = String::new();
        let mut out = String::with_capacity(rel.len());
        for segment in dirs {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&segment.to_lowercase());
            let canonical = self
                .folders
                .get(&prefix)
                .map(String::as_str)
                .unwrap_or(*segment);
            out.push_str(canonical);
            out.push('/');
        }
        out.push_str(file_name);
        out
    }

    pub fn finish(mut self) -> Resolution {
        if self.policy == CasePolicy::Insensitive && !self.folders.is_empty() {
            let renamed: Vec<(String, String)> = self
                .winners
                .iter()
                .map(|(key, winner)| (key.clone(), self.canonical_rel(&winner.rel)))
                .collect();
            for (key, rel) in renamed {
                if let Some(winner) = self.winners.get_mut(&key) {
                    winner.rel = rel;
                }
            }
        }
        let mut owned: HashMap<String, usize> = HashMap::new();
        for winner in self.winners.values() {
            *owned.entry(winner.owner.clone()).or_default() += 1;
        }
        Resolution {
            policy: self.policy,
            order: self.order,
            winners: self.winners,
            providers: self.providers,
            overrides: self.overrides,
            overridden_by: self.overridden_by,
            owned,
        }
    }
}

/// The winning-path map of one ordered mod list plus the conflict data
/// gathered while building it.
#[derive(Debug, Clone)]
pub struct Resolution {
    policy: CasePolicy,
    order: Vec<String>,
    winners: BTreeMap<String, Winner>,
    providers: HashMap<String, Vec<String>>,
    overrides: HashMap<String, BTreeSet<String>>,
    overridden_by: HashMap<String, BTreeSet<String>>,
    owned: HashMap<String, usize>,
}

impl Resolution {
    pub fn empty(policy: CasePolicy) -> Self {
        Resolver::new(policy).finish()
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    pub fn winners(&self) -> &BTreeMap<String, Winner> {
        &self.winners
    }

    pub fn len(&self) -> usize {
        self.winners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.winners.is_empty()
    }

    pub fn winner(&self, rel: &str) -> Option<&Winner> {
        self.winners.get(&self.policy.key(rel))
    }

    /// Mods that provide `rel` but lose it, highest precedence first.
    pub fn losers(&self, rel: &str) -> Vec<&str> {
        let Some(providers) = self.providers.get(&self.policy.key(rel)) else {
            return Vec::new();
        };
        providers
            .iter()
            .rev()
            .skip(1)
            .map(String::as_str)
            .collect()
    }

    /// Every contested path with its winner and losers.
    pub fn conflicts(&self) -> Vec<(&Winner, Vec<&str>)> {
        self.winners
            .iter()
            .filter_map(|(key, winner)| {
                let providers = self.providers.get(key)?;
                if providers.len() < 2 {
                    return None;
                }
                let losers = providers.iter().rev().skip(1).map(String::as_str).collect();
                Some((winner, losers))
            })
            .collect()
    }

    pub fn overrides(&self, name: &str) -> Vec<&str> {
        self.overrides
            .get(name)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn overridden_by(&self, name: &str) -> Vec<&str> {
        self.overridden_by
            .get(name)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn status(&self, name: &str) -> ConflictStatus {
        let wins = self.overrides.get(name).is_some_and(|set| !set.is_empty());
        let loses = self
            .overridden_by
            .get(name)
            .is_some_and(|set| !set.is_empty());
        if !wins && !loses {
            return ConflictStatus::None;
        }
        if loses && self.owned.get(name).copied().unwrap_or(0) == 0 {
            return ConflictStatus::Full;
        }
        match (wins, loses) {
            (true, false) => ConflictStatus::Wins,
            (false, true) => ConflictStatus::Loses,
            _ => ConflictStatus::Partial,
        }
    }

    /// Mods that took part, in ascending precedence.
    pub fn order(&self) -> &[String] {
        &self.order
    }
}

/// Resolves `enabled` (ascending precedence) against the store. Separators
/// and names the store no longer knows are skipped.
pub fn resolve<I, S>(store: &ModStore, enabled: I) -> Result<Resolution>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut resolver = Resolver::new(store.policy());
    for name in enabled {
        let name = name.as_ref();
        match store.get(name) {
            Some(entry) if entry.is_separator() => continue,
            Some(_) => resolver.add_mod(name, store.files(name)?)?,
            None => tracing::warn!(mod_name = name, "profile references unknown mod; skipped"),
        }
    }
    let resolution = resolver.finish();
    tracing::debug!(
        mods = resolution.order.len(),
        files = resolution.len(),
        "resolved load order"
    );
    Ok(resolution)
}
