//! lambdev CLI - Local serverless functions runner

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{InvokeArgs, Project, cmd_config_init, cmd_config_show, cmd_invoke, cmd_list, cmd_serve};
use logging::{init_cli_logging, init_serve_logging};

#[derive(Parser)]
#[command(name = "lambdev")]
#[command(about = "Discover, build, and invoke serverless functions locally")]
#[command(after_help = "\
QUICK START:
  lambdev config init             # Create lambdev.toml
  lambdev list                    # Show discovered functions
  lambdev invoke hello            # Call a function once
  lambdev serve                   # Keep functions built while you edit")]
struct Cli {
  /// Project root (default: current directory)
  #[arg(long, global = true, value_name = "DIR")]
  project: Option<PathBuf>,

  /// Config file to use instead of the project/user lookup
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `lambdev config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show current effective configuration
  #[command(long_about = "Show the current effective configuration.\n\n\
    Displays which config file is being used and its contents as TOML.")]
  Show,

  /// Initialize project config file (lambdev.toml)
  Init,
}

#[derive(Subcommand)]
enum Commands {
  /// List discovered functions and their build status
  List {
    /// Functions directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    functions: Option<PathBuf>,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Invoke a function once with a synthesized request
  #[command(long_about = "Invoke a function once with a synthesized request.\n\n\
    Functions named after platform events get a mocked event body; scheduled\n\
    functions are called with the scheduler's user agent.")]
  Invoke {
    /// Function name
    name: String,
    /// JSON object merged into the body, or a path to a JSON file
    #[arg(short, long)]
    payload: Option<String>,
    /// Send an emulated identity token
    #[arg(long)]
    identity: bool,
    /// Query string, e.g. "a=1&b=2"
    #[arg(short, long)]
    querystring: Option<String>,
    /// Timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Functions directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    functions: Option<PathBuf>,
    /// Print the full response instead of only the body
    #[arg(long)]
    full: bool,
  },

  /// Build all functions and rebuild them as files change
  Serve {
    /// Functions directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    functions: Option<PathBuf>,
    /// Log to a rolling file in the data directory instead of the console
    #[arg(long)]
    log_file: bool,
  },

  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let project = Project::load(cli.project, cli.config)?;

  // File logging only for serve, console for everything else
  let _guard = match &cli.command {
    Commands::Serve { log_file, .. } => init_serve_logging(&project.config.log, *log_file),
    _ => {
      init_cli_logging(&project.config.log);
      None
    }
  };

  match cli.command {
    Commands::List { functions, json } => cmd_list(&project, functions.as_deref(), json).await,
    Commands::Invoke {
      name,
      payload,
      identity,
      querystring,
      timeout,
      functions,
      full,
    } => {
      cmd_invoke(
        &project,
        InvokeArgs {
          name,
          payload,
          identity,
          querystring,
          timeout,
          functions_dir: functions,
          full,
        },
      )
      .await
    }
    Commands::Serve { functions, .. } => cmd_serve(&project, functions.as_deref()).await,
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(&project),
      ConfigCommand::Init => cmd_config_init(&project),
    },
  }
}
