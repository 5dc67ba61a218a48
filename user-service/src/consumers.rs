//! Request queues owned by this service.

use std::sync::Arc;

use async_trait::async_trait;
use relaymesh::{queues, HandlerError, HandlerResult, Request, RequestHandler, Worker};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{StoreError, UserRecord, UserStore};

pub const USER_NOT_FOUND: &str = "USER_NOT_FOUND";
pub const INVALID_USER_ID: &str = "INVALID_USER_ID";
pub const INVALID_ROLE: &str = "INVALID_ROLE";
pub const DATABASE_ERROR: &str = "DATABASE_ERROR";

/// Payload of both lookup queues
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLookup {
    pub user_id: String,
    pub role: String,
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidId(_) => HandlerError::new(INVALID_USER_ID, error.to_string()),
            StoreError::InvalidRole(_) => HandlerError::new(INVALID_ROLE, error.to_string()),
            other => HandlerError::new(DATABASE_ERROR, other.to_string()),
        }
    }
}

async fn lookup(store: &dyn UserStore, request: &Request) -> Result<UserRecord, HandlerError> {
    let lookup: UserLookup = request.deserialize_payload()?;
    debug!(role = %lookup.role, "Looking up user");
    store
        .find_by_id(&lookup.user_id, &lookup.role)
        .await?
        .ok_or_else(|| HandlerError::new(USER_NOT_FOUND, format!("no {} with id {}", lookup.role, lookup.user_id)))
}

/// `get_user_by_id_queue`: the full user record without credentials
pub struct GetUserByIdHandler {
    store: Arc<dyn UserStore>,
}

impl GetUserByIdHandler {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RequestHandler for GetUserByIdHandler {
    async fn handle(&self, request: Request) -> HandlerResult {
        let user = lookup(self.store.as_ref(), &request).await?;
        Ok(user.public_view())
    }

    fn name(&self) -> &str {
        "GetUserByIdHandler"
    }
}

/// `user_info_queue`: `{username, role, _id}`
pub struct UserInfoHandler {
    store: Arc<dyn UserStore>,
}

impl UserInfoHandler {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RequestHandler for UserInfoHandler {
    async fn handle(&self, request: Request) -> HandlerResult {
        let user = lookup(self.store.as_ref(), &request).await?;
        Ok(user.summary())
    }

    fn name(&self) -> &str {
        "UserInfoHandler"
    }
}

/// Serve both lookup queues until the worker stops or the broker is gone
pub async fn serve_lookups(worker: &Worker, store: Arc<dyn UserStore>) -> relaymesh::Result<()> {
    tokio::try_join!(
        worker.serve(queues::GET_USER_BY_ID, GetUserByIdHandler::new(store.clone())),
        worker.serve(queues::USER_INFO, UserInfoHandler::new(store)),
    )?;
    Ok(())
}
