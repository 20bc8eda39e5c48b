/// Credential materialization
///
/// Turns an identity into connect options the broker client understands.
/// Token+seed pairs are rendered into the decorated credentials layout and
/// either handed to the client in memory or written to a request-scoped
/// temporary file that disappears when the credentials are dropped.

use async_nats::ConnectOptions;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::AuthMode;

/// Where rendered token+seed credentials live while a session is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CredentialStorage {
    #[default]
    InMemory,
    /// Uniquely named file in `dir` (or the system temp dir), removed on drop.
    TempFile { dir: Option<PathBuf> },
}

/// Error type for credential materialization
#[derive(Debug)]
pub enum CredentialError {
    Io(std::io::Error),
    /// The client library rejected the rendered credentials.
    Rejected(std::io::Error),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Io(e) => write!(f, "Failed to write credentials: {}", e),
            CredentialError::Rejected(e) => write!(f, "Credentials rejected: {}", e),
        }
    }
}

impl std::error::Error for CredentialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CredentialError::Io(e) | CredentialError::Rejected(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(err: std::io::Error) -> Self {
        CredentialError::Io(err)
    }
}

/// Credentials ready to be turned into connect options.
pub enum MaterializedCredentials {
    /// Rendered credentials text kept in memory.
    Inline(String),
    /// Rendered credentials written to a temporary file.
    File(NamedTempFile),
    UserPassword { username: String, password: String },
}

impl fmt::Debug for MaterializedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializedCredentials::Inline(_) => f.write_str("Inline(..)"),
            MaterializedCredentials::File(file) => {
                f.debug_tuple("File").field(&file.path()).finish()
            }
            MaterializedCredentials::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl MaterializedCredentials {
    /// Absolute path of the credentials file, if one was written.
    pub fn path(&self) -> Option<&Path> {
        match self {
            MaterializedCredentials::File(file) => Some(file.path()),
            _ => None,
        }
    }

    pub async fn connect_options(&self) -> Result<ConnectOptions, CredentialError> {
        let options = match self {
            MaterializedCredentials::Inline(creds) => ConnectOptions::new()
                .credentials(creds)
                .map_err(CredentialError::Rejected)?,
            MaterializedCredentials::File(file) => ConnectOptions::new()
                .credentials_file(file.path())
                .await
                .map_err(CredentialError::Rejected)?,
            MaterializedCredentials::UserPassword { username, password } => {
                ConnectOptions::new().user_and_password(username.clone(), password.clone())
            }
        };
        Ok(options)
    }
}

/// Render a signed user token and its seed in the decorated credentials layout.
pub fn render_creds(token: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n\
         {}\n\
         ------END NATS USER JWT------\n\
         \n\
         ************************* IMPORTANT *************************\n\
         NKEY Seed printed below can be used to sign and prove identity.\n\
         NKEYs are sensitive and should be treated as secrets.\n\
         \n\
         -----BEGIN USER NKEY SEED-----\n\
         {}\n\
         ------END USER NKEY SEED------\n\
         \n\
         *************************************************************\n",
        token.trim(),
        seed.trim()
    )
}

/// Materialize `auth` according to `storage`.
///
/// Username/password pairs never touch storage.
pub fn materialize(
    auth: &AuthMode,
    storage: &CredentialStorage,
) -> Result<MaterializedCredentials, CredentialError> {
    match auth {
        AuthMode::UserPassword { username, password } => Ok(MaterializedCredentials::UserPassword {
            username: username.clone(),
            password: password.clone(),
        }),
        AuthMode::TokenSeed { token, seed } => {
            let creds = render_creds(token, seed);
            match storage {
                CredentialStorage::InMemory => Ok(MaterializedCredentials::Inline(creds)),
                CredentialStorage::TempFile { dir } => {
                    let file = write_temp_creds(&creds, dir.as_deref())?;
                    tracing::debug!(path = %file.path().display(), "Wrote session credentials");
                    Ok(MaterializedCredentials::File(file))
                }
            }
        }
    }
}

fn write_temp_creds(creds: &str, dir: Option<&Path>) -> Result<NamedTempFile, CredentialError> {
    let prefix = format!("relay-{}-", Uuid::new_v4());
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".creds");

    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    file.write_all(creds.as_bytes())?;
    file.flush()?;
    Ok(file)
}
