//! HTTP Basic Auth for station connections.
//!
//! The username is the node id. Only SHA-256 hashes of `node_id:password`
//! are kept in memory.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ocpp_protocol::NodeId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct BasicAuthTable {
    entries: RwLock<HashMap<NodeId, [u8; 32]>>,
}

impl BasicAuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, node_id: &NodeId, password: &str) {
        self.entries
            .write()
            .await
            .insert(node_id.clone(), hash_credentials(node_id, password));
    }

    pub async fn remove(&self, node_id: &NodeId) -> bool {
        self.entries.write().await.remove(node_id).is_some()
    }

    pub async fn verify(&self, node_id: &NodeId, password: &str) -> bool {
        let expected = hash_credentials(node_id, password);
        self.entries
            .read()
            .await
            .get(node_id)
            .is_some_and(|stored| *stored == expected)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn hash_credentials(node_id: &NodeId, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Splits an `Authorization: Basic ...` header value into user and password.
pub fn extract_basic(authorization: &str) -> Option<(String, String)> {
    let encoded = authorization.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_owned(), password.to_owned()))
}
