//! Persistent store for issued device tokens.
//!
//! Tokens are cached in memory and persisted to a JSON file. The hub
//! keys entries by device id and rotates each token on every successful
//! handshake; a client keys entries by hub URL, so every hub it talks
//! to holds its own credential.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

/// Errors from token store operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistent key → token map.
pub struct TokenStore {
    path: PathBuf,
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenStore {
    /// Creates a new token store, loading existing tokens from disk.
    pub fn new(path: PathBuf) -> Result<Self, TokenStoreError> {
        let tokens = load_tokens(&path)?;
        Ok(Self {
            path,
            tokens: RwLock::new(tokens),
        })
    }

    /// Returns the stored token for a key, if any.
    pub fn get_token(&self, key: &str) -> Option<String> {
        self.tokens.read().unwrap().get(key).cloned()
    }

    /// Saves a token under a key, replacing any previous one.
    pub fn save_token(&self, key: &str, token: &str) -> Result<(), TokenStoreError> {
        {
            let mut map = self.tokens.write().unwrap();
            map.insert(key.to_string(), token.to_string());
        }
        self.persist()
    }

    /// Removes the token for a key.
    pub fn remove_token(&self, key: &str) -> Result<(), TokenStoreError> {
        {
            let mut map = self.tokens.write().unwrap();
            map.remove(key);
        }
        self.persist()
    }

    /// Returns every key with a stored token.
    pub fn keys(&self) -> Vec<String> {
        self.tokens.read().unwrap().keys().cloned().collect()
    }

    /// Writes the current tokens to disk.
    fn persist(&self) -> Result<(), TokenStoreError> {
        let map = self.tokens.read().unwrap();
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} token(s) to {:?}", map.len(), self.path);
        Ok(())
    }
}

/// Loads tokens from a JSON file on disk.
fn load_tokens(path: &Path) -> Result<HashMap<String, String>, TokenStoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let tokens: HashMap<String, String> = serde_json::from_str(&data)?;
    debug!("loaded {} token(s) from {:?}", tokens.len(), path);
    Ok(tokens)
}
