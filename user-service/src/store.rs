//! Read access to the user collections.
//!
//! Users live in one collection per role (`customer`, `seller`, ...).

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::settings::DatabaseSettings;

/// Fields never sent outside this service
pub const SECRET_FIELDS: [&str; 2] = ["password", "refreshToken"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid user id '{0}'")]
    InvalidId(String),

    #[error("invalid role '{0}'")]
    InvalidRole(String),

    #[error("database unreachable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("malformed user document: {0}")]
    Decode(String),

    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),
}

/// A user document with its `_id` flattened to a hex string
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl UserRecord {
    pub fn from_document(mut document: Document) -> Result<Self, StoreError> {
        let id = match document.remove("_id") {
            Some(Bson::ObjectId(oid)) => oid.to_hex(),
            Some(Bson::String(id)) => id,
            Some(other) => return Err(StoreError::Decode(format!("unexpected _id {other}"))),
            None => return Err(StoreError::Decode("missing _id".to_string())),
        };
        match Bson::Document(document).into_relaxed_extjson() {
            Value::Object(fields) => Ok(Self { id, fields }),
            other => Err(StoreError::Decode(format!("expected an object, got {other}"))),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.fields.get("username").and_then(Value::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.fields.get("role").and_then(Value::as_str)
    }

    /// Full record minus credentials
    pub fn public_view(&self) -> Value {
        let mut fields = self.fields.clone();
        for secret in SECRET_FIELDS {
            fields.remove(secret);
        }
        fields.insert("_id".to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }

    /// `{username, role, _id}`
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "username": self.username(),
            "role": self.role(),
            "_id": self.id,
        })
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: &str, role: &str) -> Result<Option<UserRecord>, StoreError>;
}

/// Connected handle to the user database
#[derive(Debug, Clone)]
pub struct Database {
    inner: mongodb::Database,
}

impl Database {
    /// Connect and ping under the configured bounded retry
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let selection_timeout = Duration::from_millis(settings.server_selection_timeout_ms);
        let result = settings
            .retry_policy()
            .run("database", |_| async move {
                let mut options = ClientOptions::parse(&settings.uri).await?;
                options.server_selection_timeout = Some(selection_timeout);
                options.app_name = Some("user-service".to_string());

                let database = Client::with_options(options)?.database(&settings.name);
                database.run_command(doc! { "ping": 1 }).await?;
                Ok::<_, mongodb::error::Error>(database)
            })
            .await;

        match result {
            Ok(inner) => {
                info!(database = %settings.name, "Connected to database");
                Ok(Self { inner })
            }
            Err(exhausted) => Err(StoreError::Unavailable {
                attempts: exhausted.attempts,
                reason: exhausted.last_error.to_string(),
            }),
        }
    }

    pub fn users(&self) -> MongoUserStore {
        MongoUserStore {
            db: self.inner.clone(),
        }
    }
}

/// [`UserStore`] over MongoDB
#[derive(Debug, Clone)]
pub struct MongoUserStore {
    db: mongodb::Database,
}

/// Collection names come from callers; keep them to plain identifiers
fn validate_role(role: &str) -> Result<(), StoreError> {
    let valid = !role.is_empty()
        && role
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRole(role.to_string()))
    }
}

fn parse_user_id(user_id: &str) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(user_id).map_err(|_| StoreError::InvalidId(user_id.to_string()))
}

#[async_trait]
impl UserStore for MongoUserStore {
    async fn find_by_id(&self, user_id: &str, role: &str) -> Result<Option<UserRecord>, StoreError> {
        validate_role(role)?;
        let id = parse_user_id(user_id)?;

        let document = self
            .db
            .collection::<Document>(role)
            .find_one(doc! { "_id": id })
            .await?;
        document.map(UserRecord::from_document).transpose()
    }
}
