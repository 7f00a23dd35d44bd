use super::engine::RecordedSelections;
use crate::{
    config::{read_json, write_json},
    error::{IoResultExt, Result},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSelections {
    module: String,
    saved_at: i64,
    selections: RecordedSelections,
}

/// Install-script choices remembered per script identity, offered as
/// defaults the next time the same script runs.
#[derive(Debug, Clone)]
pub struct SelectionMemory {
    dir: PathBuf,
}

impl SelectionMemory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, module: &str) -> PathBuf {
        let key = blake3::hash(module.trim().to_lowercase().as_bytes());
        self.dir.join(format!("{}.json", key.to_hex()))
    }

    /// A damaged memory file only costs the user their old defaults.
    pub fn load(&self, module: &str) -> Option<RecordedSelections> {
        let path = self.path_for(module);
        if !path.exists() {
            return None;
        }
        match read_json::<StoredSelections>(&path) {
            Ok(stored) => Some(stored.selections),
            Err(err) => {
                tracing::warn!(module, "ignoring saved selections: {err}");
                None
            }
        }
    }

    pub fn save(&self, module: &str, selections: &RecordedSelections) -> Result<()> {
        fs::create_dir_all(&self.dir).io_ctx("create selection dir", &self.dir)?;
        let stored = StoredSelections {
            module: module.to_string(),
            saved_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
            selections: selections.clone(),
        };
        write_json(&self.path_for(module), &stored)?;
        tracing::debug!(module, "saved install selections");
        Ok(())
    }

    pub fn forget(&self, module: &str) -> Result<()> {
        let path = self.path_for(module);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).io_ctx("remove saved selections", &path),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn saves_and_loads_by_module_name() {
        let temp = TempDir::new().unwrap();
        let memory = SelectionMemory::new(temp.path().join("fomod"));
        let mut selections = RecordedSelections::default();
        selections.steps.insert(
            "Main".to_string(),
            [("Size".to_string(), vec!["Large".to_string()])]
                .into_iter()
                .collect(),
        );
        memory.save("Armor Pack", &selections).unwrap();

        assert_eq!(memory.load(" armor pack "), Some(selections));
        assert_eq!(memory.load("Other"), None);

        memory.forget("Armor Pack").unwrap();
        assert_eq!(memory.load("Armor Pack"), None);
        memory.forget("Armor Pack").unwrap();
    }

    #[test]
    fn corrupt_memory_is_ignored() {
        let temp = TempDir::new().unwrap();
        let memory = SelectionMemory::new(temp.path().to_path_buf());
        fs::write(memory.path_for("x"), "[").unwrap();
        assert_eq!(memory.load("x"), None);
    }
}
