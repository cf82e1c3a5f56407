use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use deskpack::build::BuildPipeline;
use deskpack::config::Config;
use deskpack::events::{EngineEvent, EventSink};
use deskpack::fsops::FsMutator;
use deskpack::logging;
use deskpack::provision::{stage_interpreter, PhpIni, RuntimeProvisioner};
use deskpack::runtime::{RuntimeRoot, SyncOutcome, SyncReport};
use deskpack::server::{DevServer, InterpreterCommand};

#[derive(Parser)]
#[command(name = "deskpack")]
#[command(about = "Runtime provisioning and build orchestration for desktop PHP apps")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, extract and verify an interpreter release
    Fetch {
        /// Short version from the release catalog (e.g. 8.3)
        version: String,
    },

    /// Copy an interpreter into a project's bin/php and write its php.ini
    Stage {
        /// Project root
        #[arg(long)]
        project: PathBuf,

        /// Directory containing the interpreter executable
        #[arg(long)]
        interpreter: PathBuf,

        /// Extension to enable (repeatable)
        #[arg(long = "extension")]
        extensions: Vec<String>,
    },

    /// Mirror an asset tree into a runtime root
    Sync {
        /// Source tree
        #[arg(long)]
        source: PathBuf,

        /// Use the shared, version-gated root in user data
        #[arg(long)]
        persistent: bool,

        /// Application version recorded in the marker file
        #[arg(long)]
        app_version: String,
    },

    /// Run the interpreter's built-in server until Ctrl-C
    Serve {
        /// Interpreter executable
        #[arg(long)]
        interpreter: PathBuf,

        /// Document root
        #[arg(long)]
        docroot: PathBuf,

        /// php.ini to load
        #[arg(long)]
        ini: Option<PathBuf>,

        /// Entry document to print a URL for
        #[arg(long, default_value = "index.php")]
        entry: String,

        /// Serve a per-process copy of the document root, deleted on exit
        #[arg(long)]
        ephemeral: bool,
    },

    /// Install dependencies and package a project
    Build {
        /// Project root
        project: PathBuf,

        /// Keep the unpacked output variant
        #[arg(long)]
        keep_unpacked: bool,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the user config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    let long_running = matches!(cli.command, Commands::Serve { .. } | Commands::Build { .. });
    let logging_handle = logging::init_logging(&config, long_running, cli.debug)?;

    match cli.command {
        Commands::Fetch { version } => cmd_fetch(&config, &version).await?,
        Commands::Stage {
            project,
            interpreter,
            extensions,
        } => cmd_stage(&config, project, interpreter, extensions).await?,
        Commands::Sync {
            source,
            persistent,
            app_version,
        } => cmd_sync(&config, source, persistent, &app_version)?,
        Commands::Serve {
            interpreter,
            docroot,
            ini,
            entry,
            ephemeral,
        } => cmd_serve(&config, interpreter, docroot, ini, &entry, ephemeral).await?,
        Commands::Build {
            project,
            keep_unpacked,
        } => {
            if !cmd_build(&config, project, keep_unpacked).await? {
                drop(logging_handle);
                std::process::exit(1);
            }
        }
        Commands::Config { save } => cmd_config(&config, save)?,
    }

    if let Some(log_path) = logging_handle.log_file_path {
        eprintln!("Logs written to {}", log_path.display());
    }

    Ok(())
}

fn mutator(config: &Config) -> FsMutator {
    FsMutator::new(config.fs.retry_policy())
}

/// Print engine events as they arrive; the task ends when every sink is dropped
fn spawn_event_printer() -> (EventSink, tokio::task::JoinHandle<()>) {
    let (events, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::DownloadProgress {
                    percent,
                    current,
                    total,
                    ..
                } => {
                    eprint!("\r  {:>5.1}% ({} / {} bytes)", percent, current, total);
                    if current >= total {
                        eprintln!();
                    }
                }
                EngineEvent::Status { status, .. } => eprintln!("{}", status),
                EngineEvent::Stage { status } => eprintln!("==> {}", status),
                EngineEvent::BuildLog { text, is_error, .. } => {
                    if is_error {
                        eprintln!("{}", text);
                    } else {
                        println!("{}", text);
                    }
                }
            }
        }
    });
    (events, printer)
}

async fn cmd_fetch(config: &Config, version: &str) -> Result<()> {
    let provisioner = RuntimeProvisioner::new(
        config.cache_path(),
        config.download.clone(),
        mutator(config),
    )?;

    let (events, printer) = spawn_event_printer();
    let result = provisioner.provision(version, &events).await;
    drop(events);
    let _ = printer.await;

    let runtime = result?;
    println!("{}", runtime.banner);
    println!("Executable: {}", runtime.executable.display());
    Ok(())
}

async fn cmd_stage(
    config: &Config,
    project: PathBuf,
    interpreter: PathBuf,
    extensions: Vec<String>,
) -> Result<()> {
    let ini = PhpIni {
        extensions,
        ..PhpIni::default()
    };
    let staged = stage_interpreter(&project, &interpreter, &ini, &mutator(config)).await?;

    println!("Staged interpreter into {}", staged.dir.display());
    println!("Wrote {}", staged.ini_path.display());
    print_sync_failures(&staged.report);
    Ok(())
}

fn cmd_sync(config: &Config, source: PathBuf, persistent: bool, app_version: &str) -> Result<()> {
    let root = if persistent {
        RuntimeRoot::persistent(&config.user_data_path(), app_version)
    } else {
        RuntimeRoot::ephemeral(&std::env::temp_dir(), "deskpack", app_version)
    };

    match root.sync(&source)? {
        SyncOutcome::UpToDate => {
            println!(
                "{} already at version {}",
                root.path().display(),
                app_version
            );
        }
        SyncOutcome::Synced(report) => {
            println!(
                "Synced {} files ({} directories) into {}",
                report.copied,
                report.directories,
                root.path().display()
            );
            print_sync_failures(&report);
        }
    }
    Ok(())
}

fn print_sync_failures(report: &SyncReport) {
    if report.failures.is_empty() {
        return;
    }
    eprintln!("{} files could not be copied:", report.failures.len());
    for failure in &report.failures {
        eprintln!("  {}: {}", failure.path.display(), failure.reason);
    }
}

async fn cmd_serve(
    config: &Config,
    interpreter: PathBuf,
    docroot: PathBuf,
    ini: Option<PathBuf>,
    entry: &str,
    ephemeral: bool,
) -> Result<()> {
    let mut root = None;
    let served = if ephemeral {
        let runtime = RuntimeRoot::ephemeral(
            &std::env::temp_dir(),
            "deskpack",
            env!("CARGO_PKG_VERSION"),
        );
        runtime
            .sync(&docroot)
            .context("Failed to prepare ephemeral runtime root")?;
        let path = runtime.path().to_path_buf();
        root = Some(runtime);
        path
    } else {
        docroot
    };

    let command = InterpreterCommand::php_builtin(
        &interpreter,
        &config.server.bind_host,
        &served,
        ini.as_deref(),
    );
    let mut server = DevServer::new(command, config.server.clone());
    if let Some(root) = root {
        server = server.with_runtime_root(root, mutator(config));
    }

    server.start().await?;
    if let Some(url) = server.entry_url(entry) {
        println!("Serving {} at {}", served.display(), url);
    }
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    server.shutdown().await?;
    Ok(())
}

/// Returns whether the build succeeded
async fn cmd_build(config: &Config, project: PathBuf, keep_unpacked: bool) -> Result<bool> {
    let mut build_config = config.build.clone();
    build_config.keep_unpacked |= keep_unpacked;
    let pipeline = BuildPipeline::new(build_config, mutator(config));

    let (events, printer) = spawn_event_printer();
    let result = pipeline.run(&project, &events).await;
    drop(events);
    let _ = printer.await;

    match result {
        Ok(report) => {
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            if let Some(moved) = &report.displaced_output {
                eprintln!(
                    "note: previous output was locked and moved to {}",
                    moved.display()
                );
            }
            println!(
                "Build complete: {}",
                pipeline.output_dir(&project).display()
            );
            Ok(true)
        }
        Err(failure) => {
            eprintln!("Error: {}", failure);
            if !failure.log.is_empty() {
                eprintln!();
                eprintln!("Last output:");
                for line in failure.log.tail(20) {
                    eprintln!("  {}", line.text);
                }
            }
            Ok(false)
        }
    }
}

fn cmd_config(config: &Config, save: bool) -> Result<()> {
    print!("{}", config.to_toml()?);
    if save {
        let path = config.save()?;
        eprintln!("Saved to {}", path.display());
    }
    Ok(())
}
