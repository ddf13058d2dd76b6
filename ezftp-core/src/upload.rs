//! Batch upload over FTP
//!
//! [`Uploader::connect`] opens the control connection and logs in before any
//! file is touched. The returned uploader is an iterator of
//! [`TransferProgress`]: each file yields `InProgress` before its `STOR` is
//! issued and `Complete` or `Failed` after. The first failure ends the batch;
//! files after it produce no events. The session is logged out when the
//! sequence ends or the uploader is dropped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream};
use thiserror::Error;

use crate::auth::{CredentialError, CredentialStore};
use crate::config::ClientConfig;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(&'static str),

    /// Control or data connection failed, before or during a transfer
    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("Invalid credentials")]
    Authentication,

    #[error(transparent)]
    Credentials(CredentialError),

    /// A local file could not be read or named
    #[error("Upload of {file} failed: {reason}")]
    Transfer { file: String, reason: String },
}

impl From<CredentialError> for UploadError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Authentication => UploadError::Authentication,
            other => UploadError::Credentials(other),
        }
    }
}

/// Files to send plus where and as whom
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub files: Vec<PathBuf>,
    pub target_host: String,
    pub target_port: u16,
    pub username: String,
    pub password: String,
}

impl UploadBatch {
    pub fn new(
        files: Vec<PathBuf>,
        target_host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            files,
            target_host: target_host.into(),
            target_port: crate::DEFAULT_FTP_PORT,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.target_port = port;
        self
    }

    /// Check the entered password against the local record before dialling.
    ///
    /// Only meaningful when the target is this machine's own server.
    pub fn verify_against(&self, store: &CredentialStore) -> Result<(), UploadError> {
        let credential = store.authenticate(&self.password)?;
        if credential.username != self.username {
            return Err(UploadError::Authentication);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), UploadError> {
        if self.files.is_empty() {
            return Err(UploadError::Validation("No files selected"));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(UploadError::Validation("Username and password are required"));
        }
        if self.target_port == 0 {
            return Err(UploadError::Validation("Port must be in 1-65535"));
        }
        Ok(())
    }

    fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    InProgress,
    Complete,
    Failed,
}

/// One step of a batch; `index` is 1-based
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub index: usize,
    pub total: usize,
    pub file_name: String,
    pub phase: TransferPhase,
    /// Bytes stored, set on `Complete`
    pub bytes: u64,
    /// Set on `Failed`
    pub error: Option<String>,
}

impl TransferProgress {
    fn new(index: usize, total: usize, file_name: &str, phase: TransferPhase) -> Self {
        Self {
            index,
            total,
            file_name: file_name.to_string(),
            phase,
            bytes: 0,
            error: None,
        }
    }
}

/// Outcome of a drained batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub bytes: u64,
}

struct Job {
    index: usize,
    path: PathBuf,
    file_name: String,
}

/// Authenticated FTP session draining an [`UploadBatch`]
pub struct Uploader {
    stream: Option<FtpStream>,
    target: String,
    pending: VecDeque<PathBuf>,
    in_flight: Option<Job>,
    next_index: usize,
    total: usize,
    report: UploadReport,
    failure: Option<UploadError>,
}

impl Uploader {
    /// Connect, log in and switch to binary mode
    pub fn connect(batch: UploadBatch, config: &ClientConfig) -> Result<Self, UploadError> {
        batch.validate()?;
        let target = batch.target();

        let addr = resolve_target(&batch.target_host, batch.target_port).ok_or_else(|| {
            UploadError::Connection {
                target: target.clone(),
                reason: "host did not resolve".to_string(),
            }
        })?;

        let connection_err = |e: FtpError| UploadError::Connection {
            target: target.clone(),
            reason: e.to_string(),
        };

        let transfer_timeout = config.transfer_timeout();
        let mut stream = FtpStream::connect_timeout(addr, config.connect_timeout())
            .map_err(connection_err)?
            .passive_stream_builder(move |addr| data_stream(addr, transfer_timeout));

        let timeout = Some(transfer_timeout);
        let sock = stream.get_ref();
        if let Err(e) = sock
            .set_read_timeout(timeout)
            .and_then(|_| sock.set_write_timeout(timeout))
        {
            tracing::warn!("Could not set transfer timeout: {}", e);
        }

        match stream.login(batch.username.as_str(), batch.password.as_str()) {
            Ok(()) => {}
            Err(FtpError::UnexpectedResponse(_)) => {
                let _ = stream.quit();
                tracing::warn!(user = %batch.username, "Login to {} rejected", target);
                return Err(UploadError::Authentication);
            }
            Err(e) => return Err(connection_err(e)),
        }

        if let Err(e) = stream.transfer_type(FileType::Binary) {
            let _ = stream.quit();
            return Err(connection_err(e));
        }

        let total = batch.files.len();
        tracing::info!(user = %batch.username, "Uploading {} file(s) to {}", total, target);

        Ok(Self {
            stream: Some(stream),
            target,
            pending: batch.files.into(),
            in_flight: None,
            next_index: 1,
            total,
            report: UploadReport {
                total,
                ..UploadReport::default()
            },
            failure: None,
        })
    }

    /// Counts so far
    pub fn report(&self) -> &UploadReport {
        &self.report
    }

    /// Drain remaining progress and return the summary, or the error that
    /// ended the batch
    pub fn finish(mut self) -> Result<UploadReport, UploadError> {
        for _ in self.by_ref() {}
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self.report.clone()),
        }
    }

    fn transfer(&mut self, job: &Job) -> Result<u64, UploadError> {
        let file = File::open(&job.path).map_err(|e| UploadError::Transfer {
            file: job.file_name.clone(),
            reason: e.to_string(),
        })?;
        let mut reader = BufReader::new(file);

        let connection_err = |reason: String| UploadError::Connection {
            target: self.target.clone(),
            reason,
        };
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| connection_err("connection closed".to_string()))?;
        stream
            .put_file(job.file_name.as_str(), &mut reader)
            .map_err(|e| connection_err(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            match stream.quit() {
                Ok(()) => tracing::debug!("FTP session closed"),
                Err(e) => tracing::debug!("FTP logout failed: {}", e),
            }
        }
    }
}

impl Iterator for Uploader {
    type Item = TransferProgress;

    fn next(&mut self) -> Option<TransferProgress> {
        if let Some(job) = self.in_flight.take() {
            let mut progress = TransferProgress::new(job.index, self.total, &job.file_name, TransferPhase::Complete);

            match self.transfer(&job) {
                Ok(bytes) => {
                    tracing::debug!(file = %job.file_name, bytes, "Stored");
                    self.report.completed += 1;
                    self.report.bytes += bytes;
                    progress.bytes = bytes;
                }
                Err(e) => {
                    tracing::warn!(file = %job.file_name, "Upload failed: {}", e);
                    progress.phase = TransferPhase::Failed;
                    progress.error = Some(e.to_string());
                    self.report.failed += 1;
                    self.failure = Some(e);
                    self.pending.clear();
                    self.close();
                }
            }
            return Some(progress);
        }

        let Some(path) = self.pending.pop_front() else {
            self.close();
            return None;
        };

        let index = self.next_index;
        self.next_index += 1;

        let file_name = match remote_name(&path) {
            Some(name) => name,
            None => {
                let shown = path.display().to_string();
                let mut progress = TransferProgress::new(index, self.total, &shown, TransferPhase::Failed);
                progress.error = Some("path has no file name".to_string());
                self.report.failed += 1;
                self.failure = Some(UploadError::Transfer {
                    file: shown,
                    reason: "path has no file name".to_string(),
                });
                self.pending.clear();
                self.close();
                return Some(progress);
            }
        };

        let progress = TransferProgress::new(index, self.total, &file_name, TransferPhase::InProgress);
        self.in_flight = Some(Job {
            index,
            path,
            file_name,
        });
        Some(progress)
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect, send every file in order and report each step to `on_progress`
pub fn upload(
    batch: UploadBatch,
    config: &ClientConfig,
    mut on_progress: impl FnMut(&TransferProgress),
) -> Result<UploadReport, UploadError> {
    let mut uploader = Uploader::connect(batch, config)?;
    for progress in uploader.by_ref() {
        on_progress(&progress);
    }
    uploader.finish()
}

/// Data connections get the same timeouts as the control socket
fn data_stream(addr: SocketAddr, timeout: Duration) -> FtpResult<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(FtpError::ConnectionError)?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(FtpError::ConnectionError)?;
    Ok(stream)
}

fn resolve_target(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Base name used as the remote file name
fn remote_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
