//! Report Signing
//!
//! Canonical encoding: the report as a JSON tree without its `signature`
//! member, object keys sorted bytewise, no whitespace. Reports carry no
//! floating point values and timestamps have a fixed format, so a report
//! reloaded from disk encodes to the same bytes it was signed with.

use crate::config::public_key_path_for;
use crate::error::{AppError, AppResult};
use crate::report::model::Report;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

fn signing_error(msg: impl Into<String>) -> AppError {
    AppError::Signing(msg.into())
}

/// Bytes the signature is computed over
pub fn canonical_bytes(report: &Report) -> AppResult<Vec<u8>> {
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> AppResult<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Number(n) if n.is_f64() => {
            return Err(signing_error(format!("non-integer number {} in report", n)));
        }
        other => serde_json::to_writer(&mut *out, other)?,
    }
    Ok(())
}

/// Sign the report in place, replacing any previous signature
pub fn sign(report: &mut Report, key: &SigningKey) -> AppResult<()> {
    report.signature = None;
    let bytes = canonical_bytes(report)?;
    let signature = key.sign(&bytes);
    report.signature = Some(STANDARD.encode(signature.to_bytes()));
    Ok(())
}

/// Check the stored signature; `Ok(false)` means the report was altered or signed by another key
pub fn verify(report: &Report, key: &VerifyingKey) -> AppResult<bool> {
    let encoded = report
        .signature
        .as_deref()
        .ok_or_else(|| signing_error("report has no signature"))?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| signing_error(format!("failed to decode signature: {}", e)))?;
    let signature = Signature::from_slice(&raw)
        .map_err(|e| signing_error(format!("malformed signature: {}", e)))?;

    let bytes = canonical_bytes(report)?;
    Ok(key.verify(&bytes, &signature).is_ok())
}

/// Private key file: 64 bytes (seed then public key) or a bare 32-byte seed
pub fn load_signing_key(path: &Path) -> AppResult<SigningKey> {
    let data = std::fs::read(path).map_err(|e| {
        signing_error(format!("failed to read private key file {}: {}", path.display(), e))
    })?;

    match data.len() {
        64 => {
            let bytes: [u8; 64] = data[..].try_into().map_err(|_| signing_error("invalid key"))?;
            SigningKey::from_keypair_bytes(&bytes)
                .map_err(|e| signing_error(format!("invalid private key {}: {}", path.display(), e)))
        }
        32 => {
            let bytes: [u8; 32] = data[..].try_into().map_err(|_| signing_error("invalid key"))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        n => Err(signing_error(format!(
            "invalid private key size: expected 64 bytes, got {}",
            n
        ))),
    }
}

/// Public key file: raw 32 bytes
pub fn load_verifying_key(path: &Path) -> AppResult<VerifyingKey> {
    let data = std::fs::read(path).map_err(|e| {
        signing_error(format!("failed to read public key file {}: {}", path.display(), e))
    })?;
    let bytes: [u8; 32] = data[..].try_into().map_err(|_| {
        signing_error(format!(
            "invalid public key size: expected 32 bytes, got {}",
            data.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| signing_error(format!("invalid public key {}: {}", path.display(), e)))
}

/// Generate a key pair at `private_path` and its `.pub` sibling; never overwrites
pub fn generate_key_files(private_path: &Path) -> AppResult<(PathBuf, PathBuf)> {
    let public_path = public_key_path_for(private_path);
    for path in [private_path, public_path.as_path()] {
        if path.exists() {
            return Err(signing_error(format!(
                "refusing to overwrite existing key {}",
                path.display()
            )));
        }
    }
    if let Some(parent) = private_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let key = SigningKey::generate(&mut OsRng);
    write_new(private_path, &key.to_keypair_bytes(), 0o600)?;
    write_new(&public_path, key.verifying_key().as_bytes(), 0o644)?;
    Ok((private_path.to_path_buf(), public_path))
}

fn write_new(path: &Path, bytes: &[u8], mode: u32) -> AppResult<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}
