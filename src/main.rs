mod cli;

use cli::{Cli, Command};
use medorg::autofix::{self, RenameRules};
use medorg::backup::{self, BackupEngine, BackupError, BackupOptions};
use medorg::config::{ConfigError, GlobalConfig};
use medorg::dedupe;
use medorg::discover;
use medorg::fingerprint::FingerprintService;
use medorg::record::ChecksumError;
use medorg::shutdown::{Shutdown, shutdown_pair};
use medorg::tags;
use medorg::walker::{ChecksumVisitor, DirectoryTracker, WalkError, WalkOptions};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::prelude::*;

/// Exit codes are the CLI contract, namespaced per operation.
struct MedorgExitCode;

impl MedorgExitCode {
    fn invalid_args() -> ExitCode {
        ExitCode::from(10)
    }

    fn no_config() -> ExitCode {
        ExitCode::from(11)
    }

    fn too_few_directories() -> ExitCode {
        ExitCode::from(12)
    }

    fn too_many_directories() -> ExitCode {
        ExitCode::from(13)
    }

    /// Missing or malformed volume label.
    fn bad_volume() -> ExitCode {
        ExitCode::from(20)
    }

    fn backup_incomplete() -> ExitCode {
        ExitCode::from(21)
    }

    fn discovery_error() -> ExitCode {
        ExitCode::from(22)
    }

    fn checksum_error() -> ExitCode {
        ExitCode::from(23)
    }

    fn shutdown() -> ExitCode {
        ExitCode::from(30)
    }

    /// Errors outside any operation's namespace (I/O on the config path,
    /// invalid working directory, bugs).
    fn any_error() -> ExitCode {
        ExitCode::from(255)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    if let Some(directory) = cli.directory
        && let Err(e) = std::env::set_current_dir(&directory)
    {
        error!(
            "Failed to change directory to {}: {}",
            directory.display(),
            e
        );
        return MedorgExitCode::any_error();
    }

    let shutdown = install_shutdown();
    let config_path = cli.config.clone();

    let result: anyhow::Result<ExitCode> = match cli.command {
        Command::Check { dirs, validate } => handle_check(&dirs, validate, &shutdown),
        Command::Backup {
            paths,
            delete_orphans,
            workers,
        } => handle_backup(
            &paths,
            delete_orphans,
            workers,
            config_path.as_deref(),
            &shutdown,
        ),
        Command::Discover { volume, dirs } => handle_discover(&volume, &dirs, &shutdown),
        Command::Dupes { dirs } => handle_dupes(&dirs, &shutdown),
        Command::Tag {
            dir,
            files,
            add,
            remove,
        } => handle_tag(&dir, &files, add, remove),
        Command::Autofix {
            dirs,
            rename,
            delete_dupes,
        } => handle_autofix(
            &dirs,
            rename,
            delete_dupes,
            config_path.as_deref(),
            &shutdown,
        ),
    };

    match result {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("{err}");
            MedorgExitCode::any_error()
        }
    }
}

fn handle_check(
    dirs: &[PathBuf],
    validate: bool,
    shutdown: &Shutdown,
) -> anyhow::Result<ExitCode> {
    if dirs.is_empty() {
        error!("check needs at least one directory");
        return Ok(MedorgExitCode::too_few_directories());
    }

    let service = FingerprintService::default();
    let mut files = 0;
    let mut directories = 0;
    let mut recalced = 0;
    let mut failures = 0;

    for dir in dirs {
        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = if validate {
            ChecksumVisitor::validating(service.clone())
        } else {
            ChecksumVisitor::new(service.clone())
        };

        match tracker.walk(dir, &visitor, shutdown) {
            Ok(report) => {
                files += report.files_visited;
                directories += report.dirs_visited;
                for e in &report.errors {
                    match e {
                        WalkError::Checksum(ChecksumError::Recalced { path }) => {
                            recalced += 1;
                            warn!("content drifted: {}", path.display());
                        }
                        other => {
                            failures += 1;
                            warn!("{other}");
                        }
                    }
                }
                failures += report.errors_dropped;
            }
            Err(e) if e.is_shutdown() => {
                info!("check interrupted");
                return Ok(MedorgExitCode::shutdown());
            }
            Err(e) => {
                error!("check failed under {}: {e}", dir.display());
                return Ok(MedorgExitCode::checksum_error());
            }
        }
    }

    info!("checked {files} files in {directories} directories");
    if recalced > 0 {
        info!("{recalced} files had drifted content; fingerprints refreshed");
    }

    if failures > 0 {
        error!("{failures} files could not be checked");
        return Ok(MedorgExitCode::checksum_error());
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_backup(
    paths: &[PathBuf],
    delete_orphans: bool,
    workers: Option<usize>,
    config_path: Option<&Path>,
    shutdown: &Shutdown,
) -> anyhow::Result<ExitCode> {
    if paths.len() < 2 {
        error!("backup needs at least one source and a destination");
        return Ok(MedorgExitCode::too_few_directories());
    }
    let (sources, dest) = paths.split_at(paths.len() - 1);
    let dest = &dest[0];

    let mut config = match GlobalConfig::load(config_path) {
        Ok(config) => config,
        Err(ConfigError::NoHome) => {
            error!("no config path available; pass --config or set HOME");
            return Ok(MedorgExitCode::no_config());
        }
        Err(e) => {
            error!("failed to load config: {e}");
            return Ok(MedorgExitCode::no_config());
        }
    };

    let mut options = BackupOptions::default();
    if let Some(workers) = workers {
        options.copy_workers = workers.max(1);
    }

    let engine = BackupEngine::new(FingerprintService::default())
        .with_options(options)
        .with_orphan_handler(if delete_orphans {
            Box::new(backup::delete_orphan)
        } else {
            Box::new(backup::report_orphan)
        });

    let result = engine.run(sources, dest, &mut config, shutdown);

    // Whatever happened, keep any label minted during the run.
    if let Err(e) = config.save() {
        warn!("failed to save config: {e}");
    }

    match result {
        Ok(summary) => {
            info!(
                "backup to volume {} complete: {} copied, {} already present, {} orphans",
                summary.label, summary.copied, summary.already_present, summary.orphans
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_shutdown() => {
            info!("backup interrupted");
            Ok(MedorgExitCode::shutdown())
        }
        Err(BackupError::Volume(e)) => {
            error!("{e}");
            Ok(MedorgExitCode::bad_volume())
        }
        Err(e) => {
            error!("{e}");
            Ok(MedorgExitCode::backup_incomplete())
        }
    }
}

fn handle_discover(
    volume: &Path,
    dirs: &[PathBuf],
    shutdown: &Shutdown,
) -> anyhow::Result<ExitCode> {
    if dirs.is_empty() {
        error!("discover needs at least one source directory");
        return Ok(MedorgExitCode::too_few_directories());
    }

    match discover::run_discovery(
        dirs,
        volume,
        &WalkOptions::default(),
        &FingerprintService::default(),
        shutdown,
    ) {
        Ok(summary) => {
            info!(
                "volume {}: tagged {} records as already backed up",
                summary.label, summary.tagged
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_shutdown() => {
            info!("discovery interrupted");
            Ok(MedorgExitCode::shutdown())
        }
        Err(BackupError::Volume(e)) => {
            error!("{e}");
            Ok(MedorgExitCode::bad_volume())
        }
        Err(e) => {
            error!("{e}");
            Ok(MedorgExitCode::discovery_error())
        }
    }
}

fn handle_dupes(dirs: &[PathBuf], shutdown: &Shutdown) -> anyhow::Result<ExitCode> {
    if dirs.is_empty() {
        error!("dupes needs at least one directory");
        return Ok(MedorgExitCode::too_few_directories());
    }
    if dirs.len() > 2 {
        error!("dupes compares at most two trees");
        return Ok(MedorgExitCode::too_many_directories());
    }

    let index = match dedupe::scan_trees(
        dirs,
        &WalkOptions::default(),
        &FingerprintService::default(),
        shutdown,
    ) {
        Ok(index) => index,
        Err(e) if e.is_shutdown() => {
            info!("scan interrupted");
            return Ok(MedorgExitCode::shutdown());
        }
        Err(e) => {
            error!("{e}");
            return Ok(MedorgExitCode::checksum_error());
        }
    };

    let groups = dedupe::report_duplicates(&index);
    for (_key, paths) in &groups {
        let line: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        println!("{}", line.join(" == "));
    }

    info!(
        "{} duplicate groups across {} content keys",
        groups.len(),
        index.len()
    );
    if index.collisions() > 0 {
        warn!(
            "{} fingerprint collisions observed; nothing was merged",
            index.collisions()
        );
    }

    Ok(ExitCode::SUCCESS)
}

fn handle_autofix(
    dirs: &[PathBuf],
    rename: bool,
    delete_dupes: bool,
    config_path: Option<&Path>,
    shutdown: &Shutdown,
) -> anyhow::Result<ExitCode> {
    if !rename && !delete_dupes {
        error!("nothing to do: pass --rename and/or --delete-dupes");
        return Ok(MedorgExitCode::invalid_args());
    }
    if dirs.is_empty() {
        error!("autofix needs at least one directory");
        return Ok(MedorgExitCode::too_few_directories());
    }

    if rename {
        let config = match GlobalConfig::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config: {e}");
                return Ok(MedorgExitCode::no_config());
            }
        };
        if !config.existed_on_disk() {
            error!("no global config; rename rules live there");
            return Ok(MedorgExitCode::no_config());
        }

        let rules = match RenameRules::new(&config.autofix_rules) {
            Ok(rules) => rules,
            Err(e) => {
                error!("{e}");
                return Ok(MedorgExitCode::invalid_args());
            }
        };

        match autofix::run_autofix(dirs, &rules, &WalkOptions::default(), shutdown) {
            Ok(outcomes) => {
                info!("renamed {} files", outcomes.len());
            }
            Err(e) if e.is_shutdown() => {
                info!("autofix interrupted");
                return Ok(MedorgExitCode::shutdown());
            }
            Err(e) => {
                error!("{e}");
                return Ok(MedorgExitCode::checksum_error());
            }
        }
    }

    if delete_dupes {
        let index = match dedupe::scan_trees(
            dirs,
            &WalkOptions::default(),
            &FingerprintService::default(),
            shutdown,
        ) {
            Ok(index) => index,
            Err(e) if e.is_shutdown() => {
                info!("autofix interrupted");
                return Ok(MedorgExitCode::shutdown());
            }
            Err(e) => {
                error!("{e}");
                return Ok(MedorgExitCode::checksum_error());
            }
        };

        match dedupe::prune_duplicates(&index, shutdown) {
            Ok(actions) => {
                let removed: usize = actions.iter().map(|a| a.removed.len()).sum();
                info!(
                    "pruned {} duplicate files across {} groups",
                    removed,
                    actions.len()
                );
            }
            Err(e) if e.is_shutdown() => {
                info!("autofix interrupted");
                return Ok(MedorgExitCode::shutdown());
            }
            Err(e) => {
                error!("{e}");
                return Ok(MedorgExitCode::checksum_error());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn handle_tag(
    dir: &Path,
    files: &[String],
    add: Vec<String>,
    remove: Vec<String>,
) -> anyhow::Result<ExitCode> {
    if files.is_empty() {
        error!("tag needs at least one file");
        return Ok(MedorgExitCode::invalid_args());
    }
    if add.is_empty() && remove.is_empty() {
        error!("nothing to do: pass --add and/or --remove");
        return Ok(MedorgExitCode::invalid_args());
    }

    let update = tags::TagUpdate { add, remove };
    match tags::apply_tags(dir, files, &update) {
        Ok(touched) => {
            info!("updated tags on {touched} files");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ tags::TagError::NoSuchFile(_)) => {
            error!("{e}");
            Ok(MedorgExitCode::invalid_args())
        }
        Err(e) => {
            error!("{e}");
            Ok(MedorgExitCode::checksum_error())
        }
    }
}

/// Close the shutdown signal on SIGINT/SIGTERM.
fn install_shutdown() -> Shutdown {
    let (handle, signal) = shutdown_pair();

    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            std::thread::spawn(move || {
                if signals.forever().next().is_some() {
                    info!("shutdown requested; finishing in-flight work");
                    handle.request();
                }
            });
        }
        Err(e) => {
            warn!("failed to install signal handler: {e}");
            // Without a handler the signal must never fire.
            std::mem::forget(handle);
        }
    }

    signal
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
