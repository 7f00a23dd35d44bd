use crate::{
    app::App,
    config::{base_data_dir, AppConfig, GameConfig},
    deploy::{DeployReport, LinkMode},
    fomod::{AcceptDefaults, PresetSelector, Selector},
    game::{supported_games, GameKind},
    library::{separator_display_name, ModKind},
    paths::CasePolicy,
    plugins::ListSorter,
    profile::{ImportReport, PluginListFormat},
    resolve::ConflictStatus,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stagecraft", version, about = "Mod staging and deployment manager")]
pub struct Cli {
    /// Game to operate on (defaults to the active game)
    #[arg(long, global = true)]
    pub game: Option<String>,

    /// Debug logging, also echoed to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for list commands
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register and select managed games
    #[command(subcommand)]
    Game(GameCommand),

    /// Install a mod archive or folder into the store
    Install {
        archive: PathBuf,

        /// Name for the mod (defaults to the archive name)
        #[arg(long)]
        name: Option<String>,

        /// Install-script choice, `Step/Group=PluginA,PluginB`; repeatable
        #[arg(long = "select")]
        select: Vec<String>,

        /// Replace a mod of the same name
        #[arg(long)]
        replace: bool,

        /// Show what would be staged without copying anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and edit the active profile's mod list
    #[command(subcommand)]
    Mods(ModsCommand),

    /// Deploy the active profile into the game directory
    Deploy,

    /// Put the game directory back the way it was before deploying
    Restore,

    /// Whether the deployed files match the active profile
    Status,

    /// Files provided by more than one enabled mod
    Conflicts {
        /// Report one mod's conflict status instead
        #[arg(long = "mod")]
        mod_name: Option<String>,
    },

    #[command(subcommand)]
    Profiles(ProfilesCommand),

    /// Import a third-party list into the active profile
    #[command(subcommand)]
    Import(ListCommand),

    /// Export the active profile as a third-party list
    #[command(subcommand)]
    Export(ExportCommand),

    #[command(subcommand)]
    Plugins(PluginsCommand),

    /// Profile snapshots taken before each deploy
    #[command(subcommand)]
    Backups(BackupsCommand),
}

#[derive(Subcommand)]
pub enum GameCommand {
    Add(GameAddArgs),
    List,
    /// Make a game the default for later commands
    Use { name: String },
}

#[derive(Args)]
pub struct GameAddArgs {
    pub name: String,
    /// Game install directory
    pub game_dir: PathBuf,
    #[arg(long, default_value = "generic")]
    pub kind: String,
    /// State directory (defaults to one under the app data dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long, default_value = "auto")]
    pub link_mode: String,
    /// Treat paths differing only in case as distinct
    #[arg(long)]
    pub case_sensitive: bool,
    /// Version reported to install-script conditions
    #[arg(long)]
    pub game_version: Option<String>,
}

#[derive(Subcommand)]
pub enum ModsCommand {
    List,
    Enable { name: String },
    Disable { name: String },
    /// Move to a position; 0 is the lowest precedence
    Move { name: String, index: usize },
    Rename { old: String, new: String },
    /// Add a separator to the active profile
    Separator { name: String },
    Remove { name: String },
}

#[derive(Subcommand)]
pub enum ProfilesCommand {
    List,
    Create {
        name: String,
        /// Start from a copy of this profile
        #[arg(long)]
        from: Option<String>,
    },
    Remove { name: String },
    Rename { old: String, new: String },
    /// Restore the deployed profile, then deploy this one
    Switch { name: String },
}

#[derive(Subcommand)]
pub enum ListCommand {
    /// MO2-style modlist.txt
    Modlist { file: PathBuf },
    /// plugins.txt, or loadorder.txt with --loadorder
    Plugins {
        file: PathBuf,
        #[arg(long)]
        loadorder: bool,
    },
}

#[derive(Subcommand)]
pub enum ExportCommand {
    Modlist { file: PathBuf },
    Plugins { file: PathBuf },
    Loadorder { file: PathBuf },
}

#[derive(Subcommand)]
pub enum PluginsCommand {
    List,
    /// Take the plugin order from a loadorder.txt written by another tool
    ApplyOrder { file: PathBuf },
}

#[derive(Subcommand)]
pub enum BackupsCommand {
    List,
    Restore { id: String },
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_or_create()?;
    let format = cli.format;
    let command = match cli.command {
        Command::Game(command) => return run_game(&mut config, command, format),
        command => command,
    };

    let name = cli
        .game
        .or_else(|| config.active_game.clone())
        .ok_or_else(|| anyhow!("no game configured; run `stagecraft game add` first"))?;
    let game = config.load_game(&name)?;
    let mut app = App::open(game)?;
    run_command(&mut app, command, format)
}

fn run_game(config: &mut AppConfig, command: GameCommand, format: OutputFormat) -> Result<()> {
    match command {
        GameCommand::Add(args) => {
            let kind = GameKind::parse(&args.kind).ok_or_else(|| {
                let known: Vec<&str> = supported_games().iter().map(|kind| kind.as_str()).collect();
                anyhow!("unknown game kind {:?}; expected one of {}", args.kind, known.join(", "))
            })?;
            let link_mode = LinkMode::parse(&args.link_mode)
                .ok_or_else(|| anyhow!("unknown link mode {:?}", args.link_mode))?;
            let mut game = GameConfig::new(&args.name, kind, args.game_dir);
            game.link_mode = link_mode;
            if args.case_sensitive {
                game.case_policy = CasePolicy::Sensitive;
            }
            if let Some(version) = args.game_version {
                crate::fomod::Version::parse(&version)?;
                game.game_version = Some(version);
            }
            if let Some(dir) = args.data_dir {
                game.data_dir = dir;
            }
            let game = config.add_game(game)?;
            game.ensure_dirs()?;
            println!("Added {} ({})", game.name, game.kind.display_name());
            println!("  game dir: {}", game.game_dir.display());
            println!("  data dir: {}", game.data_dir.display());
        }
        GameCommand::List => {
            #[derive(Serialize)]
            struct GameListItem {
                name: String,
                active: bool,
            }
            let items: Vec<GameListItem> = config
                .games()?
                .into_iter()
                .map(|name| GameListItem {
                    active: config.active_game.as_deref() == Some(name.as_str()),
                    name,
                })
                .collect();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
                OutputFormat::Text => {
                    for item in items {
                        let marker = if item.active { "*" } else { " " };
                        println!("{marker} {}", item.name);
                    }
                }
            }
        }
        GameCommand::Use { name } => {
            config.set_active_game(&name)?;
            println!("Active game: {name}");
        }
    }
    Ok(())
}

fn run_command(app: &mut App, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::Game(_) => bail!("game commands run without a loaded game"),
        Command::Install {
            archive,
            name,
            select,
            replace,
            dry_run,
        } => install(app, archive, name, select, replace, dry_run),
        Command::Mods(command) => run_mods(app, command, format),
        Command::Deploy => {
            let outcome = app.deploy(None, None)?;
            print_report(&outcome.report);
            for name in &outcome.plugins.added {
                println!("  plugin added: {name}");
            }
            for name in &outcome.plugins.pruned {
                println!("  plugin dropped: {name}");
            }
            Ok(())
        }
        Command::Restore => {
            let reports = app.restore()?;
            if reports.is_empty() {
                println!("Nothing deployed");
            }
            for report in &reports {
                print_report(report);
            }
            Ok(())
        }
        Command::Status => {
            let status = app.deployment_status()?;
            #[derive(Serialize)]
            struct StatusView<'a> {
                profile: &'a str,
                deployed_profile: Option<&'a str>,
                current: bool,
                interrupted: bool,
                valid: bool,
            }
            let view = StatusView {
                profile: &status.profile,
                deployed_profile: status.deployed_profile.as_deref(),
                current: status.current,
                interrupted: status.interrupted,
                valid: status.is_valid(),
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                OutputFormat::Text => {
                    println!("Active profile: {}", view.profile);
                    println!(
                        "Deployed: {}",
                        view.deployed_profile.unwrap_or("nothing")
                    );
                    if view.interrupted {
                        println!("An earlier deploy or restore was interrupted; it is repaired on the next one");
                    } else if view.current {
                        println!("Game directory is up to date");
                    } else {
                        println!("Game directory is out of date; run `stagecraft deploy`");
                    }
                }
            }
            Ok(())
        }
        Command::Conflicts { mod_name } => conflicts(app, mod_name, format),
        Command::Profiles(command) => run_profiles(app, command, format),
        Command::Import(ListCommand::Modlist { file }) => {
            let report = app.import_modlist(&file)?;
            print_import(&report);
            Ok(())
        }
        Command::Import(ListCommand::Plugins { file, loadorder }) => {
            let format = if loadorder {
                PluginListFormat::LoadOrder
            } else {
                PluginListFormat::Plugins
            };
            let report = app.import_plugins(&file, format)?;
            print_import(&report);
            Ok(())
        }
        Command::Export(command) => {
            let file = match command {
                ExportCommand::Modlist { file } => {
                    app.export_modlist(&file)?;
                    file
                }
                ExportCommand::Plugins { file } => {
                    app.export_plugins(&file, PluginListFormat::Plugins)?;
                    file
                }
                ExportCommand::Loadorder { file } => {
                    app.export_plugins(&file, PluginListFormat::LoadOrder)?;
                    file
                }
            };
            println!("Wrote {}", file.display());
            Ok(())
        }
        Command::Plugins(PluginsCommand::List) => {
            let profile = app.active_profile()?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&profile.plugins)?)
                }
                OutputFormat::Text => {
                    for (index, plugin) in profile.plugins.iter().enumerate() {
                        let enabled = if plugin.enabled { "x" } else { " " };
                        println!("{index:>3} [{enabled}] {}", plugin.name);
                    }
                }
            }
            Ok(())
        }
        Command::Plugins(PluginsCommand::ApplyOrder { file }) => {
            let sorter = ListSorter::from_file(&file)?;
            let plugins = app.sort_plugins(&sorter)?;
            println!("Applied order to {} plugins", plugins.len());
            Ok(())
        }
        Command::Backups(BackupsCommand::List) => {
            let backups = app.backups()?;
            match format {
                OutputFormat::Json => {
                    let ids: Vec<&str> = backups.iter().map(|b| b.id.as_str()).collect();
                    println!("{}", serde_json::to_string_pretty(&ids)?);
                }
                OutputFormat::Text => {
                    for backup in backups {
                        println!("{}  {}", backup.id, backup.taken_at);
                    }
                }
            }
            Ok(())
        }
        Command::Backups(BackupsCommand::Restore { id }) => {
            let profile = app.restore_backup(&id)?;
            println!("Restored {} from backup {id}", profile.name);
            Ok(())
        }
    }
}

fn install(
    app: &mut App,
    archive: PathBuf,
    name: Option<String>,
    select: Vec<String>,
    replace: bool,
    dry_run: bool,
) -> Result<()> {
    let mut selector: Box<dyn Selector> = if select.is_empty() {
        Box::new(AcceptDefaults)
    } else {
        Box::new(PresetSelector::parse(&select)?)
    };
    if dry_run {
        let plan = app.plan_install(&archive, name.as_deref(), selector.as_mut())?;
        println!("{} ({} files)", plan.mod_name, plan.entries.len());
        for entry in &plan.entries {
            println!("  {}", entry.dest);
        }
        return Ok(());
    }
    let outcome = app
        .install(&archive, name.as_deref(), replace, selector.as_mut())
        .with_context(|| format!("install {}", archive.display()))?;
    let how = if outcome.scripted { "scripted" } else { "plain" };
    println!(
        "Installed {} ({} files, {how})",
        outcome.entry.name, outcome.plan_files
    );
    Ok(())
}

#[derive(Serialize)]
struct ModListItem {
    index: usize,
    name: String,
    kind: &'static str,
    enabled: bool,
}

fn run_mods(app: &mut App, command: ModsCommand, format: OutputFormat) -> Result<()> {
    match command {
        ModsCommand::List => {
            let profile = app.active_profile()?;
            let mut items: Vec<ModListItem> = profile
                .order
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    let kind = match app.store.get(&entry.name).map(|m| m.kind) {
                        Some(ModKind::Separator) => "separator",
                        _ => "mod",
                    };
                    ModListItem {
                        index,
                        name: entry.name.clone(),
                        kind,
                        enabled: entry.enabled,
                    }
                })
                .collect();
            items.reverse();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
                OutputFormat::Text => {
                    for item in items {
                        if item.kind == "separator" {
                            println!("{:>3} --- {} ---", item.index, separator_display_name(&item.name));
                            continue;
                        }
                        let enabled = if item.enabled { "x" } else { " " };
                        println!("{:>3} [{enabled}] {}", item.index, item.name);
                    }
                }
            }
        }
        ModsCommand::Enable { name } => {
            app.set_enabled(&name, true)?;
            println!("Enabled {name}");
        }
        ModsCommand::Disable { name } => {
            app.set_enabled(&name, false)?;
            println!("Disabled {name}");
        }
        ModsCommand::Move { name, index } => {
            let index = app.move_mod(&name, index)?;
            println!("Moved {name} to {index}");
        }
        ModsCommand::Rename { old, new } => {
            let entry = app.rename_mod(&old, &new)?;
            println!("Renamed {old} to {}", entry.name);
        }
        ModsCommand::Separator { name } => {
            let entry = app.add_separator(&name)?;
            println!("Added separator {}", entry.name);
        }
        ModsCommand::Remove { name } => {
            app.remove_mod(&name)?;
            println!("Removed {name}");
        }
    }
    Ok(())
}

fn run_profiles(app: &mut App, command: ProfilesCommand, format: OutputFormat) -> Result<()> {
    match command {
        ProfilesCommand::List => {
            #[derive(Serialize)]
            struct ProfileListItem {
                name: String,
                active: bool,
            }
            let active = app.game.active_profile.clone();
            let items: Vec<ProfileListItem> = app
                .profiles
                .list()?
                .into_iter()
                .map(|name| ProfileListItem {
                    active: name == active,
                    name,
                })
                .collect();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
                OutputFormat::Text => {
                    for item in items {
                        if item.active {
                            println!("* {}", item.name);
                        } else {
                            println!("  {}", item.name);
                        }
                    }
                }
            }
        }
        ProfilesCommand::Create { name, from } => {
            let profile = app.create_profile(&name, from.as_deref())?;
            println!("Created profile {}", profile.name);
        }
        ProfilesCommand::Remove { name } => {
            app.remove_profile(&name)?;
            println!("Removed profile {name}");
        }
        ProfilesCommand::Rename { old, new } => {
            let profile = app.rename_profile(&old, &new)?;
            println!("Renamed profile {old} to {}", profile.name);
        }
        ProfilesCommand::Switch { name } => {
            let outcome = app.switch_profile(&name)?;
            println!("Switched to {name}");
            print_report(&outcome.report);
        }
    }
    Ok(())
}

fn conflicts(app: &App, mod_name: Option<String>, format: OutputFormat) -> Result<()> {
    let resolution = app.resolution()?;
    if let Some(name) = mod_name {
        if !resolution.order().iter().any(|m| *m == name) {
            bail!("{name} is not an enabled mod in profile {}", app.game.active_profile);
        }
        let status = resolution.status(&name);
        #[derive(Serialize)]
        struct ModConflicts<'a> {
            name: &'a str,
            status: &'static str,
            overrides: Vec<&'a str>,
            overridden_by: Vec<&'a str>,
        }
        let view = ModConflicts {
            name: &name,
            status: status.label(),
            overrides: resolution.overrides(&name),
            overridden_by: resolution.overridden_by(&name),
        };
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
            OutputFormat::Text => {
                println!("{}: {}", view.name, view.status);
                if status != ConflictStatus::None {
                    for other in &view.overrides {
                        println!("  overrides {other}");
                    }
                    for other in &view.overridden_by {
                        println!("  overridden by {other}");
                    }
                }
            }
        }
        return Ok(());
    }

    #[derive(Serialize)]
    struct ConflictItem<'a> {
        path: &'a str,
        winner: &'a str,
        losers: Vec<&'a str>,
    }
    let items: Vec<ConflictItem> = resolution
        .conflicts()
        .into_iter()
        .map(|(winner, losers)| ConflictItem {
            path: &winner.rel,
            winner: &winner.owner,
            losers,
        })
        .collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No conflicts");
            }
            for item in items {
                println!("{}  {} > {}", item.path, item.winner, item.losers.join(", "));
            }
        }
    }
    Ok(())
}

fn print_report(report: &DeployReport) {
    if report.recovered {
        println!("Recovered an interrupted run for {}", report.profile);
    }
    println!(
        "{}: {} placed, {} removed, {} unchanged, {} shadowed, {} restored ({})",
        report.profile,
        report.placed,
        report.removed,
        report.kept,
        report.shadowed,
        report.restored,
        report.link_summary
    );
    for rel in &report.skipped {
        println!("  skipped {rel}");
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
}

fn print_import(report: &ImportReport) {
    println!("Imported {} entries", report.imported.len());
    for name in &report.created_separators {
        println!("  created separator {name}");
    }
    for rejected in &report.rejected {
        println!("  line {}: unknown or repeated {}", rejected.line, rejected.name);
    }
    for bad in &report.unparseable {
        println!("  line {}: could not read {:?}", bad.line, bad.text);
    }
}

/// The selected game's log directory, or a shared one when no game is set up.
pub fn log_dir(cli: &Cli) -> Result<PathBuf> {
    let base = base_data_dir()?;
    let config = AppConfig::load_from(base.clone())?;
    let game = cli
        .game
        .clone()
        .or_else(|| config.active_game.clone())
        .and_then(|name| config.load_game(&name).ok());
    Ok(match game {
        Some(game) => game.log_dir(),
        None => base.join("logs"),
    })
}
