//! ezftp: single-account FTP upload endpoint
//!
//! Subcommands mirror the four operations of the core:
//! - `setup`  stores the username and a salted hash of the password
//! - `serve`  starts the FTP server until Enter is pressed
//! - `upload` pushes files to a running server
//! - `config` shows where settings and credentials live

mod commands;
mod prompt;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ezftp_core::Config;

/// Share one upload directory over FTP, and push files into it.
#[derive(Parser, Debug)]
#[command(name = "ezftp", version, about)]
struct Cli {
    /// Config file to use instead of the per-user default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the FTP username and password, replacing any previous ones
    Setup {
        #[arg(short, long)]
        username: String,
    },

    /// Start the FTP server and keep it running until Enter is pressed
    Serve {
        /// Control port (default from config, normally 21)
        #[arg(short, long)]
        port: Option<u32>,

        /// Directory exposed to clients
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Bind here instead of the detected network address
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Upload files to an FTP server (this machine's by default)
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Server host; the detected network address when omitted
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Login name; the stored username when omitted
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Print config and credential file locations and effective settings
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs on stderr, progress and status on stdout
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ezftp=info,ezftp_core=info,libunftp=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }),
    };

    match cli.command {
        Command::Setup { username } => commands::setup(&config, &username),
        Command::Serve { port, dir, bind } => commands::serve(&config, port, dir, bind),
        Command::Upload {
            files,
            host,
            port,
            username,
        } => commands::upload(&config, files, host, port, username),
        Command::Config => commands::show_config(&config, cli.config.as_deref()),
    }
}
