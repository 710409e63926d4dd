use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use tsukuri::project::{GRAPH_BUILD, GRAPH_DEFAULT, TASK_CACHE_CLEAR, TASK_CLEAN, TASK_WATCH};
use tsukuri::{CONFIG_FILE, Config, Mode, Project};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, short, default_value = CONFIG_FILE)]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Clean the output directory and build every asset class once.
    Build,
    /// Rebuild whatever changes, without serving.
    Watch,
    /// Build, then serve the output and rebuild on change.
    #[command(alias = "default")]
    Dev,
    /// Remove the output directory.
    Clean,
    /// Drop every cached compression result.
    #[command(name = "cache:clear")]
    CacheClear,
    /// List the registered tasks.
    Tasks,
}

impl Command {
    fn mode(self) -> Mode {
        match self {
            Command::Dev => Mode::Dev,
            Command::Watch => Mode::Watch,
            _ => Mode::Build,
        }
    }

    fn target(self) -> Option<&'static str> {
        match self {
            Command::Build => Some(GRAPH_BUILD),
            Command::Watch => Some(TASK_WATCH),
            Command::Dev => Some(GRAPH_DEFAULT),
            Command::Clean => Some(TASK_CLEAN),
            Command::CacheClear => Some(TASK_CACHE_CLEAR),
            Command::Tasks => None,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    #[cfg(feature = "logging")]
    tsukuri::init_logging()?;

    let command = args.command.unwrap_or(Command::Dev);
    let config = Config::load(&args.config)?;
    let project = Project::new(config, command.mode())?;
    let executor = project.executor()?;

    let Some(target) = command.target() else {
        let registry = executor.registry();
        for name in registry.names() {
            match registry.resolve(name) {
                Ok(graph) if graph.leaves().len() > 1 => {
                    println!("{} = {}", style(name).bold(), graph.describe(registry));
                }
                _ => println!("{}", style(name).bold()),
            }
        }
        return Ok(ExitCode::SUCCESS);
    };

    match project.run(&executor, target) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!("{target} failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
