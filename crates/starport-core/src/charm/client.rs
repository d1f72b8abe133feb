// Charm account client and its local backend
//
// The local backend keeps everything under one data directory:
//   account.json        profile (id, name, creation time)
//   charm_ed25519[.pub] identity key pair, unless key_file says otherwise
//   kv/<db>/kv.db       key-value stores
//   fs/                 file store root

use super::files::FileStore;
use super::store::{KvStore, list_stores};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const DEFAULT_HOST: &str = "cloud.charm.sh";
pub const DEFAULT_SSH_PORT: u16 = 35353;
pub const DEFAULT_HTTP_PORT: u16 = 35354;
pub const KEY_FILE_NAME: &str = "charm_ed25519";

const ACCOUNT_FILE: &str = "account.json";
const KEY_TYPE: &str = "starport-sha256";

/// Fully resolved connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmConfig {
    pub host: String,
    pub data_dir: PathBuf,
    pub key_file: PathBuf,
    pub ssh_port: u16,
    pub http_port: u16,
}

/// Account profile as scripts see it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bio {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An authorized public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicKey {
    pub key: String,
    pub fingerprint: String,
}

/// Account and storage access for the charm modules.
pub trait CharmClient: Send + Sync {
    fn id(&self) -> Result<String>;
    fn bio(&self) -> Result<Bio>;
    fn set_name(&self, name: &str) -> Result<Bio>;
    /// `host:ssh_port` of the account server
    fn host(&self) -> String;
    fn data_path(&self) -> PathBuf;
    fn key_files(&self) -> Vec<PathBuf>;
    fn public_keys(&self) -> Result<Vec<PublicKey>>;
    fn open_kv(&self, name: &str) -> Result<KvStore>;
    fn list_kv(&self) -> Result<Vec<String>>;
    fn file_store(&self) -> Result<FileStore>;
}

/// Usernames are 1 to 50 characters of letters, digits, `_` and `-`.
pub fn validate_username(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(1..=50).contains(&len) {
        return Err(Error::Validation(format!(
            "username must be 1 to 50 characters, got {len}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(Error::Validation(format!(
            "username may only contain letters, digits, '_' and '-', got {bad:?}"
        )));
    }
    Ok(())
}

/// Backend that keeps the account and its data on the local disk.
///
/// The profile is read from `account.json` on every call, so clients opened
/// over the same data directory see each other's updates.
pub struct LocalCharm {
    config: CharmConfig,
    account_path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalCharm {
    /// Open the account under `config.data_dir`, creating the profile and
    /// identity key on first use.
    pub fn open(config: CharmConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let account_path = config.data_dir.join(ACCOUNT_FILE);
        load_or_create_account(&account_path)?;
        ensure_identity(&config.key_file)?;
        tracing::debug!(
            data_dir = %config.data_dir.display(),
            host = %config.host,
            "charm account opened"
        );
        Ok(Self {
            config,
            account_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CharmConfig {
        &self.config
    }
}

impl CharmClient for LocalCharm {
    fn id(&self) -> Result<String> {
        Ok(self.bio()?.id)
    }

    fn bio(&self) -> Result<Bio> {
        read_account(&self.account_path)
    }

    fn set_name(&self, name: &str) -> Result<Bio> {
        validate_username(name)?;
        let _guard = self.write_lock.lock();
        let mut account = read_account(&self.account_path)?;
        account.name = Some(name.to_string());
        save_account(&self.account_path, &account)?;
        Ok(account)
    }

    fn host(&self) -> String {
        format!("{}:{}", self.config.host, self.config.ssh_port)
    }

    fn data_path(&self) -> PathBuf {
        self.config.data_dir.clone()
    }

    fn key_files(&self) -> Vec<PathBuf> {
        vec![self.config.key_file.clone()]
    }

    fn public_keys(&self) -> Result<Vec<PublicKey>> {
        let mut keys = Vec::new();
        for path in self.key_files() {
            let line = std::fs::read_to_string(public_key_path(&path))?;
            let line = line.trim().to_string();
            keys.push(PublicKey {
                fingerprint: format!("SHA256:{}", hex::encode(Sha256::digest(line.as_bytes()))),
                key: line,
            });
        }
        Ok(keys)
    }

    fn open_kv(&self, name: &str) -> Result<KvStore> {
        KvStore::open(&self.config.data_dir.join("kv"), name)
    }

    fn list_kv(&self) -> Result<Vec<String>> {
        list_stores(&self.config.data_dir.join("kv"))
    }

    fn file_store(&self) -> Result<FileStore> {
        FileStore::open(self.config.data_dir.join("fs"))
    }
}

fn parse_account(path: &Path, text: &str) -> Result<Bio> {
    serde_json::from_str(text)
        .map_err(|e| Error::Validation(format!("corrupt account file {}: {e}", path.display())))
}

fn read_account(path: &Path) -> Result<Bio> {
    let text = std::fs::read_to_string(path)?;
    parse_account(path, &text)
}

fn load_or_create_account(path: &Path) -> Result<Bio> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_account(path, &text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut id = [0u8; 16];
            rand::rng().fill(&mut id);
            let account = Bio {
                id: hex::encode(id),
                name: None,
                created_at: Utc::now(),
            };
            save_account(path, &account)?;
            tracing::debug!(id = %account.id, "charm account created");
            Ok(account)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file so a crash never leaves half a profile.
fn save_account(path: &Path, account: &Bio) -> Result<()> {
    let text = serde_json::to_string_pretty(account).map_err(|e| Error::Marshal(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn public_key_path(key_file: &Path) -> PathBuf {
    let mut name = key_file.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Create the key pair at `key_file` unless it exists. The public half is
/// derived from the secret, so a lost `.pub` file is recreated.
fn ensure_identity(key_file: &Path) -> Result<()> {
    let secret = match std::fs::read_to_string(key_file) {
        Ok(secret) => secret.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = key_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut bytes = [0u8; 32];
            rand::rng().fill(&mut bytes);
            let secret = hex::encode(bytes);
            write_private(key_file, &secret)?;
            tracing::debug!(key_file = %key_file.display(), "identity key created");
            secret
        }
        Err(e) => return Err(e.into()),
    };

    let public = public_key_path(key_file);
    if !public.exists() {
        let derived = hex::encode(Sha256::digest(secret.as_bytes()));
        std::fs::write(&public, format!("{KEY_TYPE} {derived}\n"))?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
