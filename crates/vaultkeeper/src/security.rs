//! Key material and the key provider boundary
//!
//! The lifecycle manager never generates or persists the store key on its
//! own; it asks a [`KeyProvider`]. Three providers ship with the crate:
//! - [`StaticKeyProvider`]: key handed in by the host
//! - [`KeychainKeyProvider`]: OS keychain, generated on first use
//! - [`PassphraseKeyProvider`]: Argon2id over a passphrase and a stored salt

use argon2::{Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{Connection, OpenFlags};
use std::fs::{self, File};
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;

const ARGON2_MEMORY_COST: u32 = 65536; // 64 MiB
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;

/// First 16 bytes of every plaintext SQLite database
pub const SQLITE_PLAINTEXT_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Permission mode for directories (owner rwx only)
pub const DIR_PERMISSIONS: u32 = 0o700;

/// Permission mode for private files (owner rw only)
pub const FILE_PERMISSIONS: u32 = 0o600;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Keychain error: {0}")]
    Keychain(String),
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),
    #[error("Master key not found")]
    MasterKeyNotFound,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("File I/O error: {0}")]
    FileIO(String),
}

/// Set secure permissions on a path. No-op off Unix.
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_secure_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Create a directory (and parents) with 0o700 permissions
pub fn create_secure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    set_secure_permissions(path, DIR_PERMISSIONS)
}

/// Atomically write a 0o600 file next to its final location
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let parent = path
        .parent()
        .ok_or_else(|| KeyError::FileIO("Missing parent directory".into()))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| KeyError::FileIO(e.to_string()))?;
    temp.write_all(contents)
        .map_err(|e| KeyError::FileIO(e.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| KeyError::FileIO(e.to_string()))?;
    #[cfg(unix)]
    {
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))
            .map_err(|e| KeyError::FileIO(e.to_string()))?;
    }

    temp.persist(path)
        .map_err(|e| KeyError::FileIO(e.to_string()))?;
    Ok(())
}

/// Securely zeroed store key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Parse a 64-character hex key
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidKeyFormat)?;
        if bytes.len() != KEY_LEN {
            bytes.zeroize();
            return Err(KeyError::InvalidKeyFormat);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Hex encoding for the SQLCipher raw-key pragma.
    /// Caller must zeroize the returned string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("key", &"[REDACTED]").finish()
    }
}

/// Issue `PRAGMA <pragma> = "x'<hex>'"` and wipe the statement text afterwards
pub(crate) fn apply_key_pragma(
    conn: &Connection,
    pragma: &str,
    key: &MasterKey,
) -> rusqlite::Result<()> {
    let mut hex_key = key.to_hex();
    let mut statement = format!("PRAGMA {pragma} = \"x'{hex_key}'\";");
    hex_key.zeroize();
    let result = conn.execute_batch(&statement);
    statement.zeroize();
    result
}

/// Whether `path` holds a cipher-at-rest store.
///
/// A plaintext SQLite header answers "no" immediately. Anything else is
/// opened without a key; if the engine then refuses to read the catalog as
/// "not a database" the file is encrypted.
pub fn probe_file_encrypted(path: &Path) -> bool {
    let mut header = [0u8; 16];
    let read = File::open(path).and_then(|mut file| file.read_exact(&mut header));
    if read.is_ok() && &header == SQLITE_PLAINTEXT_HEADER {
        return false;
    }

    let Ok(conn) = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) else {
        return false;
    };
    match conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0)) {
        Ok(_) => false,
        Err(rusqlite::Error::SqliteFailure(err, _)) => err.code == rusqlite::ErrorCode::NotADatabase,
        Err(_) => false,
    }
}

/// Supplies the store key and answers cipher-at-rest detection
pub trait KeyProvider: Send + Sync {
    fn encryption_key(&self) -> Result<MasterKey, KeyError>;

    fn is_file_encrypted(&self, path: &Path) -> bool {
        probe_file_encrypted(path)
    }

    /// Remember the key a store was just rekeyed to. The store is rekeyed
    /// back if this fails, so a provider that cannot hold arbitrary keys
    /// must refuse here.
    fn key_rotated(&self, new_key: &MasterKey) -> Result<(), KeyError>;
}

/// Key handed in by the host process
pub struct StaticKeyProvider {
    key: Mutex<MasterKey>,
}

impl StaticKeyProvider {
    pub fn new(key: MasterKey) -> Self {
        Self { key: Mutex::new(key) }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn encryption_key(&self) -> Result<MasterKey, KeyError> {
        Ok(self.key.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn key_rotated(&self, new_key: &MasterKey) -> Result<(), KeyError> {
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = new_key.clone();
        Ok(())
    }
}

/// Key kept in the OS keychain under a service/account pair
pub struct KeychainKeyProvider {
    service: String,
    account: String,
}

impl KeychainKeyProvider {
    pub const DEFAULT_SERVICE: &'static str = "Vaultkeeper";
    pub const DEFAULT_ACCOUNT: &'static str = "store-key";

    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &self.account).map_err(|e| KeyError::Keychain(e.to_string()))
    }

    /// Read the stored key without generating one
    pub fn load_key(&self) -> Result<MasterKey, KeyError> {
        let mut secret = self.entry()?.get_secret().map_err(|e| match e {
            keyring::Error::NoEntry => KeyError::MasterKeyNotFound,
            other => KeyError::Keychain(other.to_string()),
        })?;

        if secret.len() != KEY_LEN {
            secret.zeroize();
            return Err(KeyError::InvalidKeyFormat);
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&secret);
        secret.zeroize();
        Ok(MasterKey::from_bytes(key))
    }

    /// Persist a key, replacing any previous one (used after a rekey)
    pub fn store_key(&self, key: &MasterKey) -> Result<(), KeyError> {
        self.entry()?
            .set_secret(key.as_bytes())
            .map_err(|e| KeyError::Keychain(e.to_string()))
    }
}

impl Default for KeychainKeyProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SERVICE, Self::DEFAULT_ACCOUNT)
    }
}

impl KeyProvider for KeychainKeyProvider {
    fn encryption_key(&self) -> Result<MasterKey, KeyError> {
        match self.load_key() {
            Ok(key) => Ok(key),
            Err(KeyError::MasterKeyNotFound) => {
                tracing::info!(service = %self.service, "no store key in keychain, generating one");
                let key = MasterKey::generate();
                self.store_key(&key)?;
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }

    fn key_rotated(&self, new_key: &MasterKey) -> Result<(), KeyError> {
        self.store_key(new_key)
    }
}

/// Key derived from a passphrase with Argon2id; the salt lives in a private file
pub struct PassphraseKeyProvider {
    passphrase: Zeroizing<String>,
    salt_path: PathBuf,
}

impl PassphraseKeyProvider {
    pub fn new(passphrase: impl Into<String>, salt_path: impl Into<PathBuf>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            salt_path: salt_path.into(),
        }
    }

    /// Salt file conventionally kept next to the store
    pub fn salt_path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path.as_os_str().to_owned();
        name.push(".salt");
        PathBuf::from(name)
    }

    fn load_or_create_salt(&self) -> Result<[u8; SALT_LEN], KeyError> {
        if self.salt_path.exists() {
            let bytes = fs::read(&self.salt_path).map_err(|e| KeyError::FileIO(e.to_string()))?;
            if bytes.len() != SALT_LEN {
                return Err(KeyError::InvalidKeyFormat);
            }
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&bytes);
            return Ok(salt);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        write_private_file(&self.salt_path, &salt)?;
        Ok(salt)
    }
}

/// Derive a 32-byte key from a passphrase using Argon2id
pub fn derive_key_from_passphrase(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
) -> Result<MasterKey, KeyError> {
    let params = Params::new(
        ARGON2_MEMORY_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| KeyError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| KeyError::KeyDerivation(e.to_string()))?;

    let master = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(master)
}

impl KeyProvider for PassphraseKeyProvider {
    fn encryption_key(&self) -> Result<MasterKey, KeyError> {
        let salt = self.load_or_create_salt()?;
        derive_key_from_passphrase(&self.passphrase, &salt)
    }

    fn key_rotated(&self, _new_key: &MasterKey) -> Result<(), KeyError> {
        Err(KeyError::KeyDerivation(
            "a passphrase-derived key changes only with the passphrase".into(),
        ))
    }
}
