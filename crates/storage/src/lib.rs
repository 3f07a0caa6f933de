use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Missing,
    Conflict,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Conflict => write!(f, "constraint conflict"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub identifier: String,
    pub identity_public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_label: String,
    pub device_public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_id: String,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePreKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSessionRecord {
    pub id: Uuid,
    pub identifier: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Establishes connectivity to the PostgreSQL backend.
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
    /// Applies the bundled schema migration.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Lightweight liveness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Creates a user bound to its identity public key.
    pub async fn create_user(
        &self,
        identifier: &str,
        identity_public_key: &[u8],
    ) -> Result<Uuid, StorageError> {
        if identity_public_key.len() != 32 {
            return Err(StorageError::Invalid);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO app_user (id, identifier, identity_public_key, created_at) VALUES ($1, $2, $3, $4)",
                &[&id, &identifier, &identity_public_key, &now],
            )
            .await
            .map_err(|err| {
                if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    StorageError::Conflict
                } else {
                    StorageError::Postgres
                }
            })?;
        Ok(id)
    }

    /// Loads a user by its public identifier.
    pub async fn find_user_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<UserRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, identifier, identity_public_key, created_at FROM app_user WHERE identifier = $1",
                &[&identifier],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    /// Loads a user by row id.
    pub async fn load_user(&self, user_id: Uuid) -> Result<UserRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, identifier, identity_public_key, created_at FROM app_user WHERE id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(user_from_row(&row))
    }

    /// Confirms the identity binding for a user.
    ///
    /// Users are always created with their identity key, so binding is a
    /// compare: the same key is an idempotent success, a different key is
    /// a conflict. The stored key never changes after creation.
    pub async fn bind_identity_key(
        &self,
        user_id: Uuid,
        identity_public_key: &[u8],
    ) -> Result<(), StorageError> {
        let user = self.load_user(user_id).await?;
        if user.identity_public_key == identity_public_key {
            Ok(())
        } else {
            Err(StorageError::Conflict)
        }
    }

    /// Registers a device for a user.
    pub async fn create_device(
        &self,
        user_id: Uuid,
        device_label: &str,
        device_public_key: &[u8],
    ) -> Result<Uuid, StorageError> {
        if device_public_key.len() != 32 {
            return Err(StorageError::Invalid);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO user_device (id, user_id, device_label, device_public_key, created_at) VALUES ($1, $2, $3, $4, $5)",
                &[&id, &user_id, &device_label, &device_public_key, &now],
            )
            .await
            .map_err(|err| {
                if err.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                    StorageError::Missing
                } else {
                    StorageError::Postgres
                }
            })?;
        Ok(id)
    }

    /// Lists a user's devices ordered by creation time.
    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, device_label, device_public_key, created_at FROM user_device WHERE user_id = $1 ORDER BY created_at ASC",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .into_iter()
            .map(|row| DeviceRecord {
                id: row.get(0),
                user_id: row.get(1),
                device_label: row.get(2),
                device_public_key: row.get(3),
                created_at: row.get(4),
            })
            .collect())
    }

    /// Inserts a signed pre-key. The Ed25519 gate runs before this call;
    /// the store only persists material that already verified.
    pub async fn insert_signed_prekey(
        &self,
        user_id: Uuid,
        key_id: &str,
        public_key: &[u8],
        signature: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO signed_prekey (id, user_id, key_id, public_key, signature, expires_at, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[&id, &user_id, &key_id, &public_key, &signature, &expires_at, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Returns the newest signed pre-key for a user.
    pub async fn latest_signed_prekey(
        &self,
        user_id: Uuid,
    ) -> Result<SignedPreKeyRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, user_id, key_id, public_key, signature, expires_at, created_at FROM signed_prekey WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(SignedPreKeyRecord {
            id: row.get(0),
            user_id: row.get(1),
            key_id: row.get(2),
            public_key: row.get(3),
            signature: row.get(4),
            expires_at: row.get(5),
            created_at: row.get(6),
        })
    }

    /// Inserts a batch of unused one-time pre-keys.
    pub async fn insert_one_time_prekeys(
        &self,
        user_id: Uuid,
        public_keys: &[Vec<u8>],
    ) -> Result<(), StorageError> {
        for public_key in public_keys {
            let id = Uuid::new_v4();
            let now = Utc::now();
            self.client
                .execute(
                    "INSERT INTO one_time_prekey (id, user_id, public_key, used, created_at) VALUES ($1, $2, $3, false, $4)",
                    &[&id, &user_id, &public_key, &now],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
        }
        Ok(())
    }

    /// Consumes the oldest unused one-time pre-key for a user.
    ///
    /// The select-and-mark runs as one statement so the row lock and the
    /// `used` transition commit together; at most one caller ever observes
    /// a given row as unused. A serialization conflict is retried once,
    /// then reported as depletion per the bundle contract.
    pub async fn consume_one_time_prekey(
        &self,
        user_id: Uuid,
    ) -> Result<OneTimePreKeyRecord, StorageError> {
        let stmt = "WITH candidate AS (
                SELECT id FROM one_time_prekey
                WHERE user_id = $1 AND used = false
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE
            )
            UPDATE one_time_prekey AS otp
            SET used = true
            FROM candidate
            WHERE otp.id = candidate.id
            RETURNING otp.id, otp.user_id, otp.public_key, otp.created_at";
        for attempt in 0..2 {
            match self.client.query_opt(stmt, &[&user_id]).await {
                Ok(Some(row)) => {
                    return Ok(OneTimePreKeyRecord {
                        id: row.get(0),
                        user_id: row.get(1),
                        public_key: row.get(2),
                        created_at: row.get(3),
                    });
                }
                Ok(None) => return Err(StorageError::Missing),
                Err(err) => {
                    let retryable = matches!(
                        err.code(),
                        Some(&SqlState::T_R_SERIALIZATION_FAILURE)
                            | Some(&SqlState::T_R_DEADLOCK_DETECTED)
                    );
                    if retryable && attempt == 0 {
                        continue;
                    }
                    if retryable {
                        return Err(StorageError::Missing);
                    }
                    return Err(StorageError::Postgres);
                }
            }
        }
        Err(StorageError::Missing)
    }

    /// Opens a registration session for an identifier.
    pub async fn create_registration_session(
        &self,
        identifier: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO registration_session (id, identifier, code_hash, expires_at, created_at) VALUES ($1, $2, $3, $4, $5)",
                &[&id, &identifier, &code_hash, &expires_at, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(id)
    }

    /// Returns the newest unexpired session for an identifier. Concurrent
    /// sessions are permitted; verification always targets this one.
    pub async fn latest_unexpired_session(
        &self,
        identifier: &str,
    ) -> Result<RegistrationSessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, identifier, code_hash, expires_at, created_at FROM registration_session WHERE identifier = $1 AND expires_at > now() ORDER BY created_at DESC LIMIT 1",
                &[&identifier],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(RegistrationSessionRecord {
            id: row.get(0),
            identifier: row.get(1),
            code_hash: row.get(2),
            expires_at: row.get(3),
            created_at: row.get(4),
        })
    }

    /// Removes a registration session.
    pub async fn delete_registration_session(&self, id: Uuid) -> Result<(), StorageError> {
        self.client
            .execute("DELETE FROM registration_session WHERE id = $1", &[&id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Reaps registration sessions past their expiry.
    pub async fn purge_expired_sessions(&self) -> Result<u64, StorageError> {
        let affected = self
            .client
            .execute(
                "DELETE FROM registration_session WHERE expires_at <= now()",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected)
    }

    /// Stores or replaces a user's match profile fingerprint.
    pub async fn upsert_match_profile(
        &self,
        user_id: Uuid,
        tag_hash: &str,
    ) -> Result<(), StorageError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO match_profile (id, user_id, tag_hash, created_at) VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id) DO UPDATE SET tag_hash = excluded.tag_hash",
                &[&id, &user_id, &tag_hash, &now],
            )
            .await
            .map_err(|err| {
                if err.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                    StorageError::Missing
                } else {
                    StorageError::Postgres
                }
            })?;
        Ok(())
    }
}

fn user_from_row(row: &tokio_postgres::Row) -> UserRecord {
    UserRecord {
        id: row.get(0),
        identifier: row.get(1),
        identity_public_key: row.get(2),
        created_at: row.get(3),
    }
}
