//! ezftp-core: single-account FTP upload endpoint
//!
//! This crate provides:
//! - Salted credential storage and verification
//! - Outward-facing address resolution
//! - FTP server lifecycle (start/stop on a background thread)
//! - Batch upload orchestration with per-file progress

pub mod auth;
pub mod config;
pub mod network;
pub mod server;
pub mod upload;

pub use auth::{Credential, CredentialError, CredentialStore};
pub use config::Config;
pub use network::{NetworkError, resolve_local_address};
pub use server::{ConnectionEvent, ServerError, ServerLifecycle, ServerSession, ServerState, StartRequest};
pub use upload::{TransferPhase, TransferProgress, UploadBatch, UploadError, UploadReport, Uploader};

/// Standard FTP control port
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Directory exposed to FTP clients when none is configured
pub const DEFAULT_UPLOAD_DIR: &str = "uploaded_files";
