//! Credential storage for the single FTP account
//!
//! One username and one argon2 password hash, stored as two lines:
//!
//! ```text
//! <username>
//! $argon2id$v=19$m=19456,t=2,p=1$<salt>$<hash>
//! ```
//!
//! The plaintext password is never written anywhere. Callers supply it fresh
//! for every privileged operation and it is checked against the stored hash.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use thiserror::Error;

/// File name of the credential record inside the data directory
pub const CREDENTIALS_FILE_NAME: &str = "ftp_credentials.cfg";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{0} cannot be empty")]
    Validation(&'static str),

    #[error("Username must be printable and fit on one line")]
    InvalidUsername,

    #[error("Credentials file not found at {0}, set up credentials first")]
    NotFound(PathBuf),

    #[error("Invalid credentials file format")]
    Format,

    #[error("Invalid credentials")]
    Authentication,

    #[error("Password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),

    #[error("Failed to access credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data directory not found")]
    NoDirFound,
}

/// Stored account: username plus PHC-encoded password hash
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password_hash: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Check a freshly entered password against this record
    pub fn verify(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }
}

/// Persists one [`Credential`] at a fixed path
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the per-user data directory (`~/.local/share/ezftp` on Linux)
    pub fn default_location() -> Result<Self, CredentialError> {
        dirs::data_dir()
            .map(|p| Self::new(p.join("ezftp").join(CREDENTIALS_FILE_NAME)))
            .ok_or(CredentialError::NoDirFound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Hash `password` with a fresh salt and replace any stored record
    pub fn set_credentials(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        if username.is_empty() {
            return Err(CredentialError::Validation("Username"));
        }
        if password.is_empty() {
            return Err(CredentialError::Validation("Password"));
        }
        if username.trim() != username || username.chars().any(char::is_control) {
            return Err(CredentialError::InvalidUsername);
        }

        let password_hash = hash_password(password)?;
        self.write_atomically(&format!("{username}\n{password_hash}\n"))?;

        tracing::info!(user = %username, path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    /// Read the stored record without hashing anything
    pub fn load_credentials(&self) -> Result<Credential, CredentialError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        parse_record(&content)
    }

    /// Load the record and check `password` against it.
    ///
    /// Fails with [`CredentialError::Authentication`] on a wrong password.
    pub fn authenticate(&self, password: &str) -> Result<Credential, CredentialError> {
        let credential = self.load_credentials()?;
        if credential.verify(password) {
            Ok(credential)
        } else {
            Err(CredentialError::Authentication)
        }
    }

    // Readers see either the previous record or the new one, never a partial write.
    fn write_atomically(&self, content: &str) -> Result<(), CredentialError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CREDENTIALS_FILE_NAME.to_string());
        let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        let result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(result?)
    }
}

/// Produce a salted argon2 hash in PHC string form
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(CredentialError::Hash)
}

/// Verify using the hash's own parameters and salt.
///
/// Returns false for a mismatch and for an unparseable hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

fn parse_record(content: &str) -> Result<Credential, CredentialError> {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    match lines.as_slice() {
        [username, password_hash] => Ok(Credential {
            username: (*username).to_string(),
            password_hash: (*password_hash).to_string(),
        }),
        _ => Err(CredentialError::Format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("nested").join(CREDENTIALS_FILE_NAME))
    }

    #[test]
    fn test_set_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set_credentials("alice", "s3cret").unwrap();
        let credential = store.load_credentials().unwrap();

        assert_eq!(credential.username, "alice");
        assert!(credential.password_hash.starts_with("$argon2"));
        assert!(!credential.password_hash.contains("s3cret"));
        assert!(verify_password("s3cret", &credential.password_hash));
        assert!(!verify_password("s3cret!", &credential.password_hash));
        assert!(!verify_password("", &credential.password_hash));
    }

    #[test]
    fn test_overwrite_invalidates_old_password() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set_credentials("alice", "first").unwrap();
        let first_hash = store.load_credentials().unwrap().password_hash;
        store.set_credentials("alice", "second").unwrap();
        let credential = store.load_credentials().unwrap();

        assert_ne!(first_hash, credential.password_hash);
        assert!(credential.verify("second"));
        assert!(!credential.verify("first"));
    }

    #[test]
    fn test_same_password_gets_fresh_salt() {
        assert_ne!(hash_password("pw").unwrap(), hash_password("pw").unwrap());
    }

    #[test]
    fn test_empty_fields_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(matches!(
            store.set_credentials("", "pw"),
            Err(CredentialError::Validation("Username"))
        ));
        assert!(matches!(
            store.set_credentials("alice", ""),
            Err(CredentialError::Validation("Password"))
        ));
        assert!(matches!(
            store.set_credentials("al\nice", "pw"),
            Err(CredentialError::InvalidUsername)
        ));
        assert!(!store.exists());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = store_in(&dir).load_credentials();
        assert!(matches!(result, Err(CredentialError::NotFound(_))));
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE_NAME);
        let store = CredentialStore::new(&path);

        fs::write(&path, "alice\n").unwrap();
        assert!(matches!(store.load_credentials(), Err(CredentialError::Format)));

        fs::write(&path, "alice\n\n").unwrap();
        assert!(matches!(store.load_credentials(), Err(CredentialError::Format)));

        fs::write(&path, "alice\nhash\nextra\n").unwrap();
        assert!(matches!(store.load_credentials(), Err(CredentialError::Format)));

        fs::write(&path, "  alice  \r\n hash \r\n").unwrap();
        let credential = store.load_credentials().unwrap();
        assert_eq!(credential.username, "alice");
        assert_eq!(credential.password_hash, "hash");
    }

    #[test]
    fn test_authenticate() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_credentials("alice", "s3cret").unwrap();

        assert_eq!(store.authenticate("s3cret").unwrap().username, "alice");
        assert!(matches!(
            store.authenticate("wrong"),
            Err(CredentialError::Authentication)
        ));
    }

    #[test]
    fn test_garbage_hash_does_not_verify() {
        assert!(!verify_password("pw", "not-a-phc-string"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join(CREDENTIALS_FILE_NAME));
        store.set_credentials("alice", "pw").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(CREDENTIALS_FILE_NAME)]);
    }

    #[test]
    fn test_debug_redacts_hash() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_credentials("alice", "s3cret").unwrap();
        let credential = store.load_credentials().unwrap();

        let shown = format!("{credential:?}");
        assert!(shown.contains("alice"));
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains(&credential.password_hash));
    }
}
