//! In-process age decryption with X25519 identities

use crate::backup::BackupStream;
use crate::config::EncryptionConfig;
use crate::error::{config_error, AppError, AppResult};
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tracing::info;

/// Decrypts age-encrypted artifacts with identities loaded at startup
#[derive(Clone)]
pub struct AgeDecryptor {
    identities: Arc<Vec<age::x25519::Identity>>,
    origin: String,
    temp_dir: PathBuf,
}

impl fmt::Debug for AgeDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeDecryptor")
            .field("origin", &self.origin)
            .field("identities", &self.identities.len())
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

impl AgeDecryptor {
    /// Load identities from `private_key_path`, falling back to `private_key_env`
    pub fn from_config(config: &EncryptionConfig, temp_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let (text, origin) = match (&config.private_key_path, &config.private_key_env) {
            (Some(path), _) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    config_error(format!(
                        "failed to read age private key from {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                (text, path.display().to_string())
            }
            (None, Some(var)) => {
                let text = std::env::var(var).map_err(|_| {
                    config_error(format!("age private key environment variable {} is not set", var))
                })?;
                (text, format!("environment variable {}", var))
            }
            (None, None) => {
                return Err(config_error(
                    "encryption requires private_key_path or private_key_env",
                ))
            }
        };

        let identities = parse_identities(&text, &origin)?;
        Ok(Self {
            identities: Arc::new(identities),
            origin,
            temp_dir: temp_dir.into(),
        })
    }

    /// Wrap an encrypted stream, yielding the plaintext stream
    pub async fn decrypt(&self, mut stream: BackupStream) -> AppResult<BackupStream> {
        let workdir = tempfile::Builder::new()
            .prefix("restorable-age-")
            .tempdir_in(&self.temp_dir)?;
        let input = workdir.path().join("artifact.age");
        let output = workdir.path().join("artifact.dump");

        let mut file = tokio::fs::File::create(&input).await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        drop(file);

        let identities = Arc::clone(&self.identities);
        let (src, dst) = (input.clone(), output.clone());
        tokio::task::spawn_blocking(move || decrypt_file(&identities, &src, &dst))
            .await
            .map_err(|e| AppError::Internal(format!("age decryption task failed: {}", e)))??;
        tokio::fs::remove_file(&input).await?;

        let file = tokio::fs::File::open(&output).await?;
        info!("Backup artifact decrypted");
        Ok(Box::new(DecryptedStream {
            file,
            _workdir: workdir,
        }))
    }

    /// Where the identities were loaded from
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// One identity per line; blank lines and `#` comments are skipped
fn parse_identities(text: &str, origin: &str) -> AppResult<Vec<age::x25519::Identity>> {
    let identities = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<age::x25519::Identity>().map_err(|e| {
                config_error(format!("failed to parse age identities in {}: {}", origin, e))
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    if identities.is_empty() {
        return Err(config_error(format!("no age identities found in {}", origin)));
    }
    Ok(identities)
}

fn decrypt_file(
    identities: &[age::x25519::Identity],
    input: &std::path::Path,
    output: &std::path::Path,
) -> AppResult<()> {
    let failed = |e: age::DecryptError| AppError::Internal(format!("age decryption failed: {}", e));

    let encrypted = std::io::BufReader::new(std::fs::File::open(input)?);
    let decryptor = age::Decryptor::new(encrypted).map_err(failed)?;
    let mut reader = decryptor
        .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
        .map_err(failed)?;

    let mut out = std::fs::File::create(output)?;
    std::io::copy(&mut reader, &mut out)
        .map_err(|e| AppError::Internal(format!("age decryption failed: {}", e)))?;
    out.sync_all()?;
    Ok(())
}

/// Plaintext file that is deleted once the reader is dropped
struct DecryptedStream {
    file: tokio::fs::File,
    _workdir: TempDir,
}

impl AsyncRead for DecryptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;
    use std::io::{Cursor, Write};
    use tokio::io::AsyncReadExt;

    fn encrypt(recipient: &age::x25519::Recipient, plaintext: &[u8]) -> Vec<u8> {
        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
                .unwrap();
        let mut encrypted = Vec::new();
        let mut writer = encryptor.wrap_output(&mut encrypted).unwrap();
        writer.write_all(plaintext).unwrap();
        writer.finish().unwrap();
        encrypted
    }

    fn key_file(dir: &std::path::Path, identity: &age::x25519::Identity) -> PathBuf {
        let path = dir.join("age.key");
        let secret = identity.to_string();
        std::fs::write(
            &path,
            format!("# created: today\n# public key: {}\n{}\n", identity.to_public(), secret.expose_secret()),
        )
        .unwrap();
        path
    }

    fn from_path(path: PathBuf, dir: &std::path::Path) -> AppResult<AgeDecryptor> {
        AgeDecryptor::from_config(
            &EncryptionConfig {
                method: "age".into(),
                private_key_path: Some(path),
                private_key_env: None,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn test_decrypts_with_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let identity = age::x25519::Identity::generate();
        let d = from_path(key_file(dir.path(), &identity), dir.path()).unwrap();

        let ciphertext = encrypt(&identity.to_public(), b"PGDMP custom archive");
        let mut plain = d.decrypt(Box::new(Cursor::new(ciphertext))).await.unwrap();
        let mut out = Vec::new();
        plain.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"PGDMP custom archive");
        assert!(d.origin().ends_with("age.key"));
    }

    #[tokio::test]
    async fn test_identity_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let identity = age::x25519::Identity::generate();
        std::env::set_var(
            "RESTORABLE_TEST_AGE_IDENTITY",
            identity.to_string().expose_secret().to_string(),
        );
        let d = AgeDecryptor::from_config(
            &EncryptionConfig {
                method: "age".into(),
                private_key_path: None,
                private_key_env: Some("RESTORABLE_TEST_AGE_IDENTITY".into()),
            },
            dir.path(),
        )
        .unwrap();

        let ciphertext = encrypt(&identity.to_public(), b"from env");
        let mut plain = d.decrypt(Box::new(Cursor::new(ciphertext))).await.unwrap();
        let mut out = String::new();
        plain.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "from env");
        assert_eq!(d.origin(), "environment variable RESTORABLE_TEST_AGE_IDENTITY");
    }

    #[tokio::test]
    async fn test_wrong_identity_fails_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let ours = age::x25519::Identity::generate();
        let theirs = age::x25519::Identity::generate();
        let d = from_path(key_file(dir.path(), &ours), dir.path()).unwrap();

        let ciphertext = encrypt(&theirs.to_public(), b"secret");
        let err = d.decrypt(Box::new(Cursor::new(ciphertext))).await.err().unwrap();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(err.to_string().contains("age decryption failed"));
    }

    #[tokio::test]
    async fn test_garbage_input_fails_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let identity = age::x25519::Identity::generate();
        let d = from_path(key_file(dir.path(), &identity), dir.path()).unwrap();

        let err = d
            .decrypt(Box::new(Cursor::new(b"not an age file".to_vec())))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("age decryption failed"));
    }

    #[test]
    fn test_key_file_without_identities_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.key");
        std::fs::write(&path, "# nothing here\n\n").unwrap();

        let err = from_path(path, dir.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("no age identities found"));
    }

    #[test]
    fn test_malformed_identity_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "AGE-SECRET-KEY-1TEST\n").unwrap();

        let err = from_path(path, dir.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse age identities"));
    }

    #[test]
    fn test_missing_key_sources_are_config_errors() {
        let err = from_path("/nonexistent/age.key".into(), std::path::Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let err = AgeDecryptor::from_config(
            &EncryptionConfig {
                method: "age".into(),
                private_key_path: None,
                private_key_env: Some("RESTORABLE_TEST_SURELY_UNSET_AGE".into()),
            },
            "/tmp",
        )
        .unwrap_err();
        assert!(err.to_string().contains("is not set"));
    }
}
