use crate::{
    config::{read_json, write_json},
    error::{Error, IoResultExt, Result},
    profile::{Profile, ProfileManager},
};
use std::{fs, path::PathBuf};
use time::{OffsetDateTime, PrimitiveDateTime};

pub const MAX_BACKUPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub id: String,
    pub taken_at: PrimitiveDateTime,
    pub path: PathBuf,
}

fn backups_dir(manager: &ProfileManager, profile: &str) -> PathBuf {
    manager.profile_dir(profile).join("backups")
}

fn parse_stamp(name: &str) -> Option<PrimitiveDateTime> {
    let format = time::macros::format_description!("[year][month][day]_[hour][minute][second]");
    PrimitiveDateTime::parse(name, format).ok()
}

fn now_stamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let format = time::macros::format_description!("[year][month][day]_[hour][minute][second]");
    now.format(format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Snapshots the profile's order, enablement and plugin order, keeping the
/// newest few.
pub fn create_backup(manager: &ProfileManager, profile: &Profile) -> Result<BackupEntry> {
    let root = backups_dir(manager, &profile.name);
    let id = now_stamp();
    let dir = root.join(&id);
    fs::create_dir_all(&dir).io_ctx("create backup dir", &dir)?;
    write_json(&dir.join("profile.json"), profile)?;

    let mut all = list_backups(manager, &profile.name)?;
    while all.len() > MAX_BACKUPS {
        if let Some(oldest) = all.pop() {
            if let Err(err) = fs::remove_dir_all(&oldest.path) {
                tracing::warn!(backup = %oldest.id, "could not prune backup: {err}");
            }
        }
    }
    tracing::debug!(profile = %profile.name, backup = %id, "profile backed up");
    Ok(BackupEntry {
        taken_at: parse_stamp(&id).unwrap_or(PrimitiveDateTime::MIN),
        id,
        path: dir,
    })
}

/// Newest first.
pub fn list_backups(manager: &ProfileManager, profile: &str) -> Result<Vec<BackupEntry>> {
    let root = backups_dir(manager, profile);
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).io_ctx("list backups", &root),
    };
    let mut out: Vec<BackupEntry> = entries
        .flatten()
        .filter(|entry| entry.path().join("profile.json").is_file())
        .filter_map(|entry| {
            let id = entry.file_name().to_string_lossy().into_owned();
            parse_stamp(&id).map(|taken_at| BackupEntry {
                id,
                taken_at,
                path: entry.path(),
            })
        })
        .collect();
    out.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
    Ok(out)
}

/// Puts a snapshot back as the profile's current state.
pub fn restore_backup(manager: &ProfileManager, profile: &str, id: &str) -> Result<Profile> {
    let backup = list_backups(manager, profile)?
        .into_iter()
        .find(|entry| entry.id == id)
        .ok_or_else(|| Error::not_found("backup", id))?;
    let mut restored: Profile = read_json(&backup.path.join("profile.json"))?;
    restored.name = profile.to_string();
    manager.save(&restored)?;
    tracing::info!(profile, backup = id, "profile restored from backup");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::GameConfig, game::GameKind, profile::ProfileEntry};
    use tempfile::TempDir;

    #[test]
    fn backups_prune_and_restore() {
        let temp = TempDir::new().unwrap();
        let config = GameConfig::standalone(
            "g",
            GameKind::Generic,
            temp.path().join("game"),
            temp.path().join("data"),
        );
        let manager = ProfileManager::new(&config);
        let mut profile = Profile::new("Default");
        profile.order.push(ProfileEntry {
            name: "A".into(),
            enabled: true,
        });
        manager.save(&profile).unwrap();
        let taken = create_backup(&manager, &profile).unwrap();

        let root = backups_dir(&manager, "Default");
        for day in 1..=12 {
            let dir = root.join(format!("200001{day:02}_000000"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("profile.json"), "{\"name\":\"old\"}").unwrap();
        }
        fs::create_dir_all(root.join("not-a-stamp")).unwrap();
        create_backup(&manager, &profile).unwrap();
        let listed = list_backups(&manager, "Default").unwrap();
        assert_eq!(listed.len(), MAX_BACKUPS);
        assert!(listed.iter().any(|backup| backup.id == taken.id));
        assert!(!root.join("20000101_000000").exists());

        profile.order.clear();
        manager.save(&profile).unwrap();
        let restored = restore_backup(&manager, "Default", &taken.id).unwrap();
        assert_eq!(restored.order.len(), 1);
        assert_eq!(manager.load("Default").unwrap().order.len(), 1);
        assert!(restore_backup(&manager, "Default", "19990101_000000").is_err());
    }
}
