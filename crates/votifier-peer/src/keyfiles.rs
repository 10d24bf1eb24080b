//! Receiver key pair persistence under `<data_dir>/rsa/`.

use std::path::{Path, PathBuf};

use votifier_core::{KeyLoad, KeyPair, StoredKeyMaterial, VoteError, load_or_generate_key_pair};

use crate::app::AppError;

/// Private key file name.
pub const PRIVATE_KEY_FILE: &str = "private.key";
/// Public key file name.
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// Reads and writes the receiver's RSA pair.
#[derive(Clone, Debug)]
pub struct KeyFiles {
    dir: PathBuf,
    bits: usize,
}

impl KeyFiles {
    /// Key files in `dir`, generating `bits`-sized keys when needed.
    pub fn new(dir: impl Into<PathBuf>, bits: usize) -> Self {
        Self {
            dir: dir.into(),
            bits,
        }
    }

    /// Loads the stored pair, generating and writing a new one when the files
    /// are missing, half missing or corrupt.
    pub async fn load_or_generate(&self) -> Result<KeyPair, AppError> {
        let dir = self.dir.clone();
        let bits = self.bits;
        tokio::task::spawn_blocking(move || load_or_generate_blocking(&dir, bits))
            .await
            .map_err(|e| AppError::Runtime(format!("key loader join error: {e}")))?
    }
}

fn load_or_generate_blocking(dir: &Path, bits: usize) -> Result<KeyPair, AppError> {
    let stored = StoredKeyMaterial {
        private_pem: read_optional(&dir.join(PRIVATE_KEY_FILE))?,
        public_pem: read_optional(&dir.join(PUBLIC_KEY_FILE))?,
    };
    match load_or_generate_key_pair(stored, bits)? {
        KeyLoad::Loaded(pair) => {
            tracing::debug!(dir = %dir.display(), "loaded rsa key pair");
            Ok(pair)
        }
        KeyLoad::Generated { pair, reason } => {
            tracing::warn!(dir = %dir.display(), ?reason, "generating new rsa key pair");
            write_pair(dir, &pair)?;
            Ok(pair)
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, AppError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::Vote(VoteError::KeyMaterial(format!(
            "cannot read {}: {err}",
            path.display()
        )))),
    }
}

fn write_pair(dir: &Path, pair: &KeyPair) -> Result<(), AppError> {
    let pem = pair.to_pem()?;
    let persist = |path: PathBuf, text: &str| {
        std::fs::write(&path, text).map_err(|e| {
            AppError::Vote(VoteError::KeyMaterial(format!(
                "cannot write {}: {e}",
                path.display()
            )))
        })
    };
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::Vote(VoteError::KeyMaterial(format!(
            "cannot create {}: {e}",
            dir.display()
        )))
    })?;
    persist(dir.join(PRIVATE_KEY_FILE), &pem.private_pem)?;
    persist(dir.join(PUBLIC_KEY_FILE), &pem.public_pem)
}
