// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk ed25519 keystore for the public-key signing extension.
//!
//! Private keys never leave this module: callers hand in a content hash and
//! get back a base64 signature. Key files are written with `0o600` modes;
//! the registry maps signer namespaces to public keys and enforces claims.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from keystore operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Underlying filesystem failure.
    #[error("keystore I/O error: {0}")]
    Io(#[from] io::Error),

    /// No key material for the requested namespace.
    #[error("no key for namespace '{0}'")]
    MissingKey(String),

    /// Stored key bytes are not a valid ed25519 key.
    #[error("corrupt key material for namespace '{0}'")]
    CorruptKey(String),

    /// A signature failed verification.
    #[error("signature verification failed for namespace '{0}'")]
    BadSignature(String),
}

/// Directory of `<namespace>.key` / `<namespace>.pub` ed25519 pairs.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Open (creating if needed) a keystore at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    /// Generate a fresh key pair for `namespace`, overwriting any existing one.
    ///
    /// Rotation is exactly this: generate a new pair, then update the
    /// registry's public-key record out of band.
    pub fn generate(&self, namespace: &str) -> Result<(), KeyStoreError> {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        self.write_protected(&self.key_path(namespace), signing.to_bytes().as_ref())?;
        self.write_protected(
            &self.pub_path(namespace),
            signing.verifying_key().to_bytes().as_ref(),
        )?;
        Ok(())
    }

    /// Whether a private key exists for `namespace`.
    pub fn has_key(&self, namespace: &str) -> bool {
        self.key_path(namespace).is_file()
    }

    /// Sign a content hash, returning the base64 signature for the marker's
    /// `sig=` field.
    pub fn sign_hash(&self, namespace: &str, hash: &str) -> Result<String, KeyStoreError> {
        let signing = self.load_signing(namespace)?;
        let sig = signing.sign(hash.as_bytes());
        Ok(BASE64.encode(sig.to_bytes()))
    }

    /// Verify a base64 signature over a content hash against the namespace's
    /// public key.
    pub fn verify_hash(
        &self,
        namespace: &str,
        hash: &str,
        sig_b64: &str,
    ) -> Result<(), KeyStoreError> {
        let verifying = self.load_verifying(namespace)?;
        let raw = BASE64
            .decode(sig_b64)
            .map_err(|_| KeyStoreError::BadSignature(namespace.to_string()))?;
        let sig = Signature::from_slice(&raw)
            .map_err(|_| KeyStoreError::BadSignature(namespace.to_string()))?;
        verifying
            .verify(hash.as_bytes(), &sig)
            .map_err(|_| KeyStoreError::BadSignature(namespace.to_string()))
    }

    /// The base64 public key for `namespace`, for publishing to the registry.
    pub fn public_key(&self, namespace: &str) -> Result<String, KeyStoreError> {
        let verifying = self.load_verifying(namespace)?;
        Ok(BASE64.encode(verifying.to_bytes()))
    }

    fn key_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.key"))
    }

    fn pub_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.pub"))
    }

    fn write_protected(&self, path: &Path, bytes: &[u8]) -> Result<(), KeyStoreError> {
        fs::write(path, BASE64.encode(bytes))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn load_signing(&self, namespace: &str) -> Result<SigningKey, KeyStoreError> {
        let path = self.key_path(namespace);
        if !path.is_file() {
            return Err(KeyStoreError::MissingKey(namespace.to_string()));
        }
        let encoded = fs::read_to_string(&path)?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| KeyStoreError::CorruptKey(namespace.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| KeyStoreError::CorruptKey(namespace.to_string()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    fn load_verifying(&self, namespace: &str) -> Result<VerifyingKey, KeyStoreError> {
        let path = self.pub_path(namespace);
        if !path.is_file() {
            return Err(KeyStoreError::MissingKey(namespace.to_string()));
        }
        let encoded = fs::read_to_string(&path)?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| KeyStoreError::CorruptKey(namespace.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| KeyStoreError::CorruptKey(namespace.to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| KeyStoreError::CorruptKey(namespace.to_string()))
    }
}
