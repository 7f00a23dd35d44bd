mod common;

use common::{read, Fixture};
use pretty_assertions::assert_eq;
use stagecraft::{deploy::DeployLock, plugins::ListSorter, profile::PluginListFormat, Error};
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

fn order(fx: &Fixture) -> Vec<(String, bool)> {
    fx.app
        .active_profile()
        .unwrap()
        .order
        .into_iter()
        .map(|entry| (entry.name, entry.enabled))
        .collect()
}

#[test]
fn modlist_import_skips_unknown_mod() {
    let mut fx = Fixture::new();
    fx.install_plain("Alpha", &[("a.txt", "a")]);
    fx.install_plain("Beta", &[("b.txt", "b")]);
    fx.install_plain("Gamma", &[("c.txt", "c")]);

    let list = fx.temp.path().join("modlist.txt");
    fs::write(
        &list,
        "# This file was automatically generated by Mod Organizer.\r\n+Gamma\r\n+GhostMod\r\n-Alpha\r\n+Beta\r\n",
    )
    .unwrap();
    let report = fx.app.import_modlist(&list).unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].name, "GhostMod");
    assert_eq!(report.imported, vec!["Gamma", "Alpha", "Beta"]);
    assert_eq!(
        order(&fx),
        vec![
            ("Beta".to_string(), true),
            ("Alpha".to_string(), false),
            ("Gamma".to_string(), true),
        ]
    );

    let out = fx.temp.path().join("out/modlist.txt");
    fx.app.export_modlist(&out).unwrap();
    assert_eq!(read(out.parent().unwrap(), "modlist.txt"), "+Gamma\n-Alpha\n+Beta\n");
}

#[test]
fn deploy_keeps_plugin_list_in_step() {
    let mut fx = Fixture::new();
    fx.app.game.plugin_extensions = vec!["esp".into(), "esm".into()];
    fx.install_plain("Quests", &[("Quests.esp", "q"), ("meshes/q.nif", "n")]);
    fx.install_plain("Master", &[("Master.esm", "m")]);

    let outcome = fx.app.deploy(None, None).unwrap();
    assert_eq!(outcome.plugins.added, vec!["Master.esm", "Quests.esp"]);
    let plugins = fx.app.active_profile().unwrap().plugins;
    assert_eq!(plugins.len(), 2);
    assert!(plugins.iter().all(|plugin| plugin.enabled));

    let order_file = fx.temp.path().join("loadorder.txt");
    fs::write(&order_file, "Quests.esp\nMaster.esm\n").unwrap();
    let sorter = ListSorter::from_file(&order_file).unwrap();
    let sorted = fx.app.sort_plugins(&sorter).unwrap();
    let names: Vec<&str> = sorted.iter().map(|plugin| plugin.name.as_str()).collect();
    assert_eq!(names, vec!["Quests.esp", "Master.esm"]);

    let export = fx.temp.path().join("plugins.txt");
    fx.app.export_plugins(&export, PluginListFormat::Plugins).unwrap();
    let text = fs::read_to_string(&export).unwrap();
    assert!(text.contains("*Quests.esp"), "{text}");

    fx.app.set_enabled("Master", false).unwrap();
    let outcome = fx.app.deploy(None, None).unwrap();
    assert_eq!(outcome.plugins.pruned, vec!["Master.esm"]);
}

#[test]
fn plugin_import_reports_unknown_plugin() {
    let mut fx = Fixture::new();
    fx.app.game.plugin_extensions = vec!["esp".into()];
    fx.install_plain("Quests", &[("Quests.esp", "q")]);
    let list = fx.temp.path().join("plugins.txt");
    fs::write(&list, "*Quests.esp\n*GhostMod.esp\n").unwrap();
    let report = fx.app.import_plugins(&list, PluginListFormat::Plugins).unwrap();
    assert_eq!(report.imported, vec!["Quests.esp"]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].line, 2);
}

#[test]
fn backups_are_taken_on_deploy_and_restorable() {
    let mut fx = Fixture::new();
    fx.install_plain("Alpha", &[("a.txt", "a")]);
    let outcome = fx.app.deploy(None, None).unwrap();
    let backup = outcome.backup.expect("backup taken before deploy");

    fx.app.set_enabled("Alpha", false).unwrap();
    let listed = fx.app.backups().unwrap();
    assert!(listed.iter().any(|entry| entry.id == backup.id));

    let restored = fx.app.restore_backup(&backup.id).unwrap();
    assert!(restored.order[0].enabled);
    assert_eq!(order(&fx), vec![("Alpha".to_string(), true)]);
}

#[test]
fn live_and_active_profiles_are_protected() {
    let mut fx = Fixture::new();
    fx.install_plain("Alpha", &[("a.txt", "a")]);
    fx.app.create_profile("Spare", None).unwrap();
    fx.app.deploy(None, None).unwrap();

    let err = fx.app.remove_profile("Default").unwrap_err();
    assert!(matches!(err, Error::ProfileInUse { .. }), "{err}");
    let err = fx.app.rename_profile("Default", "Main").unwrap_err();
    assert!(matches!(err, Error::ProfileInUse { .. }), "{err}");

    fx.app.restore().unwrap();
    let renamed = fx.app.rename_profile("Default", "Main").unwrap();
    assert_eq!(renamed.name, "Main");
    assert_eq!(fx.app.game.active_profile, "Main");
    fx.app.remove_profile("Spare").unwrap();
    assert_eq!(fx.app.profiles.list().unwrap(), vec!["Main".to_string()]);
}

#[test]
fn renaming_a_mod_follows_every_profile() {
    let mut fx = Fixture::new();
    fx.install_plain("Alpha", &[("a.txt", "a")]);
    fx.app.create_profile("Spare", Some("Default")).unwrap();
    fx.app.rename_mod("Alpha", "Alpha Remastered").unwrap();
    assert!(fx.app.store.mod_dir("Alpha Remastered").join("a.txt").is_file());
    for name in ["Default", "Spare"] {
        let profile = fx.app.profiles.load(name).unwrap();
        assert_eq!(profile.order[0].name, "Alpha Remastered");
    }
}

#[test]
fn profile_edits_wait_for_running_deploy() {
    let mut fx = Fixture::new();
    fx.install_plain("Alpha", &[("a.txt", "a")]);
    let game = fx.app.game.clone();
    let released = Arc::new(AtomicBool::new(false));
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = {
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let lock = DeployLock::acquire(&game).unwrap();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
            released.store(true, Ordering::SeqCst);
            drop(lock);
        })
    };

    locked_rx.recv().unwrap();
    assert!(matches!(fx.app.deploy(None, None), Err(Error::Busy { .. })));
    fx.app.set_enabled("Alpha", false).unwrap();
    assert!(released.load(Ordering::SeqCst));
    holder.join().unwrap();
    assert_eq!(order(&fx), vec![("Alpha".to_string(), false)]);
}

#[test]
fn switching_to_a_path_like_name_is_refused() {
    let mut fx = Fixture::new();
    for name in ["..", "../Default", "Default/.."] {
        let err = fx.app.switch_profile(name).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{err}");
    }
    assert_eq!(fx.app.game.active_profile, "Default");
}
