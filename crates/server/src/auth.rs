use async_trait::async_trait;
use cifrachat_storage::{SessionRecord, Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum AuthError {
    Unauthenticated,
    StoreUnavailable,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "session token rejected"),
            Self::StoreUnavailable => write!(f, "session store unavailable"),
        }
    }
}

impl Error for AuthError {}

/// Account resolved behind an admitted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Lookup seam over the session store.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn session_by_token(&self, token: &str) -> Result<Option<SessionRecord>, StorageError>;
}

#[async_trait]
impl SessionDirectory for Storage {
    async fn session_by_token(&self, token: &str) -> Result<Option<SessionRecord>, StorageError> {
        self.lookup_session(token).await
    }
}

pub struct Authenticator {
    directory: Arc<dyn SessionDirectory>,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self { directory }
    }

    /// Resolves a bearer token to an identity. Store failures reject the
    /// caller instead of letting the connection through unverified.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        let session = self
            .directory
            .session_by_token(token)
            .await
            .map_err(|_| AuthError::StoreUnavailable)?;
        match session {
            Some(record) => Ok(Identity {
                user_id: record.user_id,
                username: record.username,
            }),
            None => Err(AuthError::Unauthenticated),
        }
    }
}

/// Pulls the handshake token out of an upgrade request. The Authorization
/// header wins; the `token` query parameter is the browser fallback.
pub fn extract_token(authorization: Option<&str>, query: Option<&str>) -> Option<String> {
    if let Some(header) = authorization {
        let raw = header.trim();
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            if key == "token" && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    struct StaticDirectory {
        sessions: HashMap<String, SessionRecord>,
    }

    #[async_trait]
    impl SessionDirectory for StaticDirectory {
        async fn session_by_token(
            &self,
            token: &str,
        ) -> Result<Option<SessionRecord>, StorageError> {
            Ok(self.sessions.get(token).cloned())
        }
    }

    struct FailingDirectory;

    #[async_trait]
    impl SessionDirectory for FailingDirectory {
        async fn session_by_token(
            &self,
            _token: &str,
        ) -> Result<Option<SessionRecord>, StorageError> {
            Err(StorageError::Postgres)
        }
    }

    fn directory_with(token: &str, user_id: &str, username: &str) -> Authenticator {
        let mut sessions = HashMap::new();
        sessions.insert(
            token.to_string(),
            SessionRecord {
                token: token.to_string(),
                user_id: user_id.to_string(),
                username: username.to_string(),
                created_at: Utc::now(),
            },
        );
        Authenticator::new(Arc::new(StaticDirectory { sessions }))
    }

    #[tokio::test]
    async fn accepts_known_token() {
        let authenticator = directory_with("abc123", "1f2e3d4c5b6a7988", "ana");
        let identity = authenticator.authenticate("abc123").await.unwrap();
        assert_eq!(identity.user_id, "1f2e3d4c5b6a7988");
        assert_eq!(identity.username, "ana");
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        let authenticator = directory_with("abc123", "1f2e3d4c5b6a7988", "ana");
        let result = authenticator.authenticate("def456").await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn empty_token_short_circuits_store() {
        let authenticator = Authenticator::new(Arc::new(FailingDirectory));
        let result = authenticator.authenticate("").await;
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let authenticator = Authenticator::new(Arc::new(FailingDirectory));
        let result = authenticator.authenticate("abc123").await;
        assert!(matches!(result, Err(AuthError::StoreUnavailable)));
    }

    #[test]
    fn header_wins_over_query() {
        let token = extract_token(Some("Bearer cabeza"), Some("token=consulta"));
        assert_eq!(token.as_deref(), Some("cabeza"));
    }

    #[test]
    fn bare_header_token_accepted() {
        let token = extract_token(Some("sin-prefijo"), None);
        assert_eq!(token.as_deref(), Some("sin-prefijo"));
    }

    #[test]
    fn query_fallback_when_header_missing() {
        let token = extract_token(None, Some("room=general&token=consulta"));
        assert_eq!(token.as_deref(), Some("consulta"));
    }

    #[test]
    fn empty_values_are_treated_as_absent() {
        assert!(extract_token(Some("Bearer "), Some("token=")).is_none());
        assert!(extract_token(None, None).is_none());
    }
}
