use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");
const USER_ID_BYTES: usize = 8;
const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Duplicate,
    Missing,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Duplicate => write!(f, "duplicate record"),
            Self::Missing => write!(f, "missing record"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Opens the PostgreSQL connection and spawns its driver task.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes a lightweight probe against PostgreSQL.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Creates an account row under a freshly generated user id.
    pub async fn create_user(&self, user: &NewUser) -> Result<UserRecord, StorageError> {
        let user_id = generate_user_id();
        let now = Utc::now();
        let row = self
            .client
            .query_one(
                "INSERT INTO app_user (user_id, username, password_hash, salt, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING user_id, username, password_hash, salt, created_at",
                &[
                    &user_id,
                    &user.username,
                    &user.password_hash,
                    &user.salt,
                    &now,
                ],
            )
            .await
            .map_err(|error| {
                if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    StorageError::Duplicate
                } else {
                    StorageError::Postgres
                }
            })?;
        Ok(UserRecord {
            user_id: row.get(0),
            username: row.get(1),
            password_hash: row.get(2),
            salt: row.get(3),
            created_at: row.get(4),
        })
    }

    /// Loads an account row by its unique username.
    pub async fn load_user_by_username(&self, username: &str) -> Result<UserRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT user_id, username, password_hash, salt, created_at FROM app_user WHERE username = $1",
                &[&username],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(UserRecord {
            user_id: row.get(0),
            username: row.get(1),
            password_hash: row.get(2),
            salt: row.get(3),
            created_at: row.get(4),
        })
    }

    /// Issues a session row under a freshly generated bearer token.
    pub async fn create_session(
        &self,
        user_id: &str,
        username: &str,
    ) -> Result<SessionRecord, StorageError> {
        let token = generate_session_token();
        let now = Utc::now();
        let row = self
            .client
            .query_one(
                "INSERT INTO user_session (token, user_id, username, created_at)
                VALUES ($1, $2, $3, $4)
                RETURNING token, user_id, username, created_at",
                &[&token, &user_id, &username, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(SessionRecord {
            token: row.get(0),
            user_id: row.get(1),
            username: row.get(2),
            created_at: row.get(3),
        })
    }

    /// Resolves a bearer token; unknown tokens are a normal outcome.
    pub async fn lookup_session(&self, token: &str) -> Result<Option<SessionRecord>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT token, user_id, username, created_at FROM user_session WHERE token = $1",
                &[&token],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| SessionRecord {
            token: row.get(0),
            user_id: row.get(1),
            username: row.get(2),
            created_at: row.get(3),
        }))
    }
}

fn generate_user_id() -> String {
    random_hex(USER_ID_BYTES)
}

fn generate_session_token() -> String {
    random_hex(SESSION_TOKEN_BYTES)
}

fn random_hex(length: usize) -> String {
    let mut seed = vec![0u8; length];
    OsRng.fill_bytes(&mut seed);
    let mut output = String::with_capacity(length * 2);
    for byte in &seed {
        output.push(hex_digit(byte >> 4));
        output.push(hex_digit(byte & 0x0f));
    }
    output
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => char::from(b'0' + value),
        _ => char::from(b'a' + (value - 10)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_exists() {
        assert!(INIT_SQL.contains("CREATE TABLE"));
    }

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("app_user"));
        assert!(INIT_SQL.contains("user_session"));
    }

    #[test]
    fn user_id_format() {
        let id = generate_user_id();
        assert_eq!(id.len(), USER_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_token_format() {
        let token = generate_session_token();
        assert_eq!(token.len(), SESSION_TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_session_token());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("CIFRACHAT_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: CIFRACHAT_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let storage = connect(&pg).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let new_user = NewUser {
            username: format!("tester{}", suffix),
            password_hash: "aGFzaA==".to_string(),
            salt: "c2FsdA==".to_string(),
        };
        let created = storage.create_user(&new_user).await?;
        assert_eq!(created.username, new_user.username);
        let loaded = storage.load_user_by_username(&new_user.username).await?;
        assert_eq!(loaded.user_id, created.user_id);
        assert!(matches!(
            storage.create_user(&new_user).await,
            Err(StorageError::Duplicate)
        ));
        let session = storage
            .create_session(&created.user_id, &created.username)
            .await?;
        let resolved = storage
            .lookup_session(&session.token)
            .await?
            .ok_or(StorageError::Missing)?;
        assert_eq!(resolved.user_id, created.user_id);
        assert_eq!(resolved.username, created.username);
        assert!(storage.lookup_session("feedfacecafebeef").await?.is_none());
        Ok(())
    }
}
