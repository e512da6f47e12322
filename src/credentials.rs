use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::AM_RM_TOKEN_KIND;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEntry {
    kind: String,
    service: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TokenSet {
    tokens: Vec<TokenEntry>,
}

/// Delegation tokens forwarded into containers. The AM-to-RM token is
/// stripped - it is not valid anywhere but in this process. A read failure
/// leaves the containers with empty credentials; they surface auth problems
/// through their own reporting.
pub struct CredentialsCache {
    path: Option<PathBuf>,
    cached: Mutex<Option<Arc<Vec<u8>>>>,
}

impl CredentialsCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        CredentialsCache {
            path,
            cached: Mutex::new(None),
        }
    }

    /// The current container-safe credentials blob, reloading after an
    /// invalidation.
    pub fn current(&self) -> Option<Arc<Vec<u8>>> {
        let mut cached = self.cached.lock().unwrap();
        if cached.is_none() {
            *cached = self.load();
        }
        cached.clone()
    }

    /// Drops the cached blob; the next `current` re-reads the store.
    pub fn invalidate(&self) {
        self.cached.lock().unwrap().take();
    }

    fn load(&self) -> Option<Arc<Vec<u8>>> {
        let path = self.path.as_ref()?;
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "failed to read credentials, containers get none: {err}"
                );
                return None;
            }
        };
        let mut tokens: TokenSet = match serde_json::from_slice(&content) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "failed to parse credentials, containers get none: {err}"
                );
                return None;
            }
        };
        let before = tokens.tokens.len();
        tokens.tokens.retain(|token| token.kind != AM_RM_TOKEN_KIND);
        debug!(
            total = before,
            forwarded = tokens.tokens.len(),
            "credentials loaded"
        );
        serde_json::to_vec(&tokens).ok().map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_am_rm_token_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.store");
        let tokens = TokenSet {
            tokens: vec![
                TokenEntry {
                    kind: AM_RM_TOKEN_KIND.to_string(),
                    service: "rm".to_string(),
                    data: vec![1, 2, 3],
                },
                TokenEntry {
                    kind: "HDFS_DELEGATION_TOKEN".to_string(),
                    service: "fs".to_string(),
                    data: vec![4, 5],
                },
            ],
        };
        std::fs::write(&path, serde_json::to_vec(&tokens).unwrap()).unwrap();

        let cache = CredentialsCache::new(Some(path));
        let blob = cache.current().unwrap();
        let filtered: TokenSet = serde_json::from_slice(&blob).unwrap();
        assert_eq!(filtered.tokens.len(), 1);
        assert_eq!(filtered.tokens[0].kind, "HDFS_DELEGATION_TOKEN");
    }

    #[test]
    fn test_missing_file_yields_no_credentials() {
        let cache = CredentialsCache::new(Some(PathBuf::from("/nonexistent/credentials")));
        assert!(cache.current().is_none());
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.store");
        std::fs::write(&path, serde_json::to_vec(&TokenSet::default()).unwrap()).unwrap();

        let cache = CredentialsCache::new(Some(path.clone()));
        let first = cache.current().unwrap();

        let updated = TokenSet {
            tokens: vec![TokenEntry {
                kind: "HDFS_DELEGATION_TOKEN".to_string(),
                service: "fs".to_string(),
                data: vec![9],
            }],
        };
        std::fs::write(&path, serde_json::to_vec(&updated).unwrap()).unwrap();
        // Still cached until invalidated.
        assert_eq!(cache.current().unwrap(), first);

        cache.invalidate();
        let reloaded = cache.current().unwrap();
        assert_ne!(reloaded, first);
    }
}
