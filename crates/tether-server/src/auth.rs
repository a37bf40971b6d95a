//! Bearer-token authentication for gateway handshakes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use tether_proto::{User, UserId};
use tether_store::MemoryStore;

use crate::error::{ServerError, ServerResult};

/// Resolves an opaque bearer token to the user it belongs to.
pub trait Authenticator: Send + Sync + 'static {
    /// The user behind `token`, or `None` if the token is unknown.
    fn authenticate(&self, token: &str) -> Option<User>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// A fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, User>,
}

#[derive(Deserialize)]
struct TokenTable {
    #[serde(default)]
    tokens: BTreeMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    /// An authenticator that rejects everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: User) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }

    /// Read the `tokens` object (token to user id) of a registry seed file,
    /// resolving each user through `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a token
    /// names a user the store does not know.
    pub fn from_seed_file(path: impl AsRef<Path>, store: &MemoryStore) -> ServerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read registry file '{}': {e}", path.display()))
        })?;
        let table: TokenTable = serde_json::from_str(&content)
            .map_err(|e| ServerError::Config(format!("invalid registry file: {e}")))?;

        let mut auth = Self::new();
        for (token, user_id) in table.tokens {
            let user = store.user_by_id(user_id)?;
            auth = auth.with_token(token, user);
        }
        info!(tokens = auth.len(), "Loaded gateway tokens");
        Ok(auth)
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<User> {
        self.tokens.get(token).cloned()
    }
}
