use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agencyflow")]
#[command(version, about = "Multi-tenant agency CRM service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "AGENCYFLOW_LOG_JSON")]
    pub log_json: bool,

    /// Directory holding agencyflow.toml and .env (defaults to the current directory)
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the REST, realtime and checkout service
    Serve {
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Start with a throwaway anon key when none is configured
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and write agencyflow.toml with a fresh anon key
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Replace an existing anon key
        #[arg(long)]
        force: bool,
    },
    /// Manage users and their access tokens
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Show the resolved configuration and backend status
    Config,
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    /// Register a user and print an access token
    Add {
        #[arg(long)]
        email: String,

        /// Also create an agency owned by the new user
        #[arg(long)]
        agency: Option<String>,
    },
    /// List registered users
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = match cli.dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = agencyflow::config::AppConfig::load(&dir)?;
    let verbose = cli.verbose || matches!(cli.command, Commands::Serve { dev: true, .. });
    agencyflow::logging::init(cli.log_json || config.log_json, verbose);

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                config,
                cmd::ServeOverrides {
                    host: host.clone(),
                    port: *port,
                    db_path: db_path.clone(),
                    dev: *dev,
                },
            )
            .await?;
        }
        Commands::Init { db_path, force } => cmd::cmd_init(&config, db_path.clone(), *force)?,
        Commands::User { command } => cmd::cmd_user(&config, command.clone()).await?,
        Commands::Config => cmd::cmd_config(&config)?,
    }

    Ok(())
}
