//! Subcommand handlers

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use ezftp_core::upload::upload as run_upload;
use ezftp_core::{
    resolve_local_address, Config, ConnectionEvent, ServerLifecycle, StartRequest, TransferPhase,
    UploadBatch,
};

use crate::prompt;

pub fn setup(config: &Config, username: &str) -> anyhow::Result<()> {
    let store = config.credential_store()?;
    let password = prompt::password("Enter FTP password")?;

    store.set_credentials(username, &password)?;
    println!("Credentials saved to {}", store.path().display());
    Ok(())
}

pub fn serve(
    config: &Config,
    port: Option<u32>,
    dir: Option<PathBuf>,
    bind: Option<IpAddr>,
) -> anyhow::Result<()> {
    let store = config.credential_store()?;
    let username = store.load_credentials()?.username;
    let password = prompt::password(&format!("Enter the password for user {username}"))?;

    let mut request = StartRequest::new(
        username,
        password,
        port.unwrap_or(u32::from(config.server.port)),
        dir.unwrap_or_else(|| config.server.upload_dir.clone()),
    );
    if let Some(ip) = bind.or(config.server.bind_addr) {
        request = request.bind_addr(ip);
    }

    let mut server = ServerLifecycle::new(store, config.server.clone());
    let events = {
        let session = server.start(request)?;
        println!(
            "Server started! IP: {}, Port: {}, Username: {}",
            session.bound_address().ip(),
            session.bound_address().port(),
            session.username()
        );
        println!("Serving {}", session.upload_dir().display());
        session.subscribe()
    };

    let printer = std::thread::spawn(move || print_connection_events(events));

    prompt::line("Press Enter to stop the server")?;
    server.stop()?;
    println!("Server stopped.");

    // Channel closes once the engine is gone
    let _ = printer.join();
    Ok(())
}

fn print_connection_events(mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.blocking_recv() {
            Ok(ConnectionEvent::LoggedIn { username, .. }) => {
                println!("Connection established: {username} logged in.");
            }
            Ok(ConnectionEvent::LoggedOut { username, .. }) => {
                println!("{username} disconnected.");
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("Skipped {} connection events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn upload(
    config: &Config,
    files: Vec<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
) -> anyhow::Result<()> {
    let store = config.credential_store()?;

    let username = match username {
        Some(name) => name,
        None => store
            .load_credentials()
            .context("No username given and no stored credentials")?
            .username,
    };

    let (host, local) = match host.or_else(|| config.client.default_host.clone()) {
        Some(host) => (host, false),
        None => (resolve_local_address()?.to_string(), true),
    };

    let password = prompt::password(&format!("Enter FTP password for {username}"))?;
    let batch = UploadBatch::new(files, host, username, password)
        .port(port.unwrap_or(config.server.port));

    // Same check the server applies, without a network round trip
    if local && store.exists() {
        batch.verify_against(&store)?;
    }

    let report = run_upload(batch, &config.client, |progress| {
        let label = format!("[{}/{}] {}", progress.index, progress.total, progress.file_name);
        match progress.phase {
            TransferPhase::InProgress => println!("{label} uploading..."),
            TransferPhase::Complete => println!("{label} done ({} bytes)", progress.bytes),
            TransferPhase::Failed => println!(
                "{label} FAILED: {}",
                progress.error.as_deref().unwrap_or("unknown error")
            ),
        }
    })?;

    println!(
        "Upload complete! {} of {} file(s), {} bytes.",
        report.completed, report.total, report.bytes
    );
    Ok(())
}

pub fn show_config(config: &Config, explicit: Option<&Path>) -> anyhow::Result<()> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let store = config.credential_store()?;

    println!("Config file:      {}", config_path.display());
    println!(
        "Credentials file: {} ({})",
        store.path().display(),
        if store.exists() { "present" } else { "not set up" }
    );
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
