// Storage for the map-rendering access token handed to browser clients.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache_store::{CacheStore, MAP_TOKEN_KEY};
use crate::error::TokenError;

const TOKEN_TTL: Duration = Duration::from_secs(86400);
/// Public (browser-safe) Mapbox tokens carry this prefix.
const PUBLIC_TOKEN_PREFIX: &str = "pk.";

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
}

pub struct MapTokenStore {
    cache: Arc<CacheStore>,
    fallback: Option<String>,
}

impl MapTokenStore {
    pub fn new(cache: Arc<CacheStore>, fallback: Option<String>) -> Self {
        MapTokenStore { cache, fallback }
    }

    pub fn set(&self, token: &str) -> Result<(), TokenError> {
        let token = token.trim();
        if !token.starts_with(PUBLIC_TOKEN_PREFIX) {
            return Err(TokenError::Malformed);
        }
        let stored = StoredToken {
            token: token.to_string(),
        };
        if !self.cache.set(MAP_TOKEN_KEY, &stored, Some(TOKEN_TTL)) {
            return Err(TokenError::Unavailable);
        }
        info!(token = %mask(token), "Map token stored");
        Ok(())
    }

    /// The stored token, else the configured default.
    pub fn get(&self) -> Result<String, TokenError> {
        self.cache
            .get::<StoredToken>(MAP_TOKEN_KEY)
            .map(|stored| stored.token)
            .or_else(|| self.fallback.clone())
            .ok_or(TokenError::NotFound)
    }

    pub fn clear(&self) -> bool {
        self.cache.delete(MAP_TOKEN_KEY)
    }
}

/// `pk.e...wxyz` style rendering for logs and responses.
pub fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
