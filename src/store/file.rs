//! Encrypted-at-rest credential file.
//!
//! Credentials are kept as a JSON map encrypted with XChaCha20-Poly1305 at
//! `~/.config/bakery/credentials.enc` (or `$XDG_CONFIG_HOME/bakery/credentials.enc`).
//! The key comes from `BAKERY_MASTER_KEY` or the system keychain.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{KeyValueStore, StoreError};

const CREDENTIAL_FILE_NAME: &str = "credentials.enc";
const KEYRING_SERVICE: &str = "bakery";
const KEYRING_ENTRY_NAME: &str = "credential-master-key-v1";
const MASTER_KEY_ENV: &str = "BAKERY_MASTER_KEY";
const MAGIC: &[u8; 4] = b"BKC1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Returns the default credential file path.
///
/// # Errors
///
/// Returns [`StoreError::ConfigDirUnavailable`] if no usable config dir is found.
pub fn default_store_path() -> Result<PathBuf, StoreError> {
    Ok(default_config_dir()?.join(CREDENTIAL_FILE_NAME))
}

/// [`KeyValueStore`] persisted to an encrypted file.
///
/// Every write rewrites the whole file under a lock.
pub struct FileStore {
    path: PathBuf,
    key_material: String,
    lock: Mutex<()>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("key_material", &"[REDACTED]")
            .finish()
    }
}

impl FileStore {
    /// Opens the default credential file, loading or creating its key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no config dir or key is available.
    pub fn open_default() -> Result<Self, StoreError> {
        let path = default_store_path()?;
        let key_material = load_or_create_key()?;
        Ok(Self::with_key(path, key_material))
    }

    /// Opens a credential file with explicit key material.
    #[must_use]
    pub fn with_key(path: impl Into<PathBuf>, key_material: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key_material: key_material.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the credential file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&self.path)?;
        let plaintext = decrypt_bytes(&bytes, &self.key_material)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // An unreadable file holds no usable credentials; `Ok(None)` means it is corrupt.
    fn load_readable(&self) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        match self.load() {
            Ok(entries) => Ok(Some(entries)),
            Err(
                e @ (StoreError::InvalidPayload | StoreError::DecryptionFailed | StoreError::Json(_)),
            ) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable credential file");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if entries.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let plaintext = serde_json::to_vec(entries)?;
        let encrypted = encrypt_bytes(&plaintext, &self.key_material)?;
        write_encrypted_payload(&self.path, &encrypted)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load_readable()?.and_then(|mut entries| entries.remove(key)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load_readable()?.unwrap_or_default();
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)?;
        debug!(path = %self.path.display(), key, "persisted credential");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.load_readable()? {
            Some(mut entries) => {
                if entries.remove(key).is_some() {
                    self.save(&entries)?;
                }
            }
            None => {
                fs::remove_file(&self.path)?;
                debug!(path = %self.path.display(), "removed unreadable credential file");
            }
        }
        Ok(())
    }
}

fn default_config_dir() -> Result<PathBuf, StoreError> {
    resolve_config_dir(
        sanitize_env_path(env::var_os("XDG_CONFIG_HOME")),
        sanitize_env_path(env::var_os("HOME")),
        sanitize_env_path(env::var_os("APPDATA")),
    )
}

fn sanitize_env_path(value: Option<OsString>) -> Option<PathBuf> {
    let value = value?;
    if value.to_string_lossy().trim().is_empty() {
        return None;
    }

    Some(PathBuf::from(value))
}

fn resolve_config_dir(
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    app_data: Option<PathBuf>,
) -> Result<PathBuf, StoreError> {
    if let Some(xdg) = xdg_config_home {
        return Ok(xdg.join("bakery"));
    }
    if let Some(home) = home {
        return Ok(home.join(".config").join("bakery"));
    }
    if let Some(app_data) = app_data {
        return Ok(app_data.join("bakery"));
    }

    Err(StoreError::ConfigDirUnavailable)
}

fn load_or_create_key() -> Result<String, StoreError> {
    if let Some(from_env) = env::var_os(MASTER_KEY_ENV) {
        let key = from_env.to_string_lossy().trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let entry = safe_keyring_entry()?;

    match safe_keyring_get_password(&entry) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing),
        _ => {
            let generated = generate_key_material();
            safe_keyring_set_password(&entry, &generated)?;
            Ok(generated)
        }
    }
}

// Some keyring backends panic when no secret service is reachable.
fn safe_keyring_entry() -> Result<keyring::Entry, StoreError> {
    catch_unwind(|| keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY_NAME))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn safe_keyring_get_password(entry: &keyring::Entry) -> Result<String, StoreError> {
    catch_unwind(AssertUnwindSafe(|| entry.get_password()))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn safe_keyring_set_password(entry: &keyring::Entry, password: &str) -> Result<(), StoreError> {
    catch_unwind(AssertUnwindSafe(|| entry.set_password(password)))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn generate_key_material() -> String {
    let mut bytes = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    Sha256::digest(key_material.as_bytes()).into()
}

fn write_encrypted_payload(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, payload)?;
    set_owner_only_permissions(&staging)?;
    fs::rename(&staging, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn encrypt_bytes(plaintext: &[u8], key_material: &str) -> Result<Vec<u8>, StoreError> {
    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(payload: &[u8], key_material: &str) -> Result<Vec<u8>, StoreError> {
    if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
        return Err(StoreError::InvalidPayload);
    }

    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let (nonce, ciphertext) = payload[MAGIC.len()..].split_at(NONCE_LEN);

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::DecryptionFailed)
}
