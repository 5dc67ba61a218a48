//! Typed calls from the account controllers to sibling services.

use std::time::Duration;

use relaymesh::{queues, Publisher, RelayError, Result, ServiceClient};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Six hex characters from three random bytes
pub fn generate_otp() -> String {
    let bytes: [u8; 3] = rand::random();
    hex::encode(bytes)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(RelayError::malformed)
}

#[derive(Debug, Serialize)]
struct OtpPayload<'a> {
    email: &'a str,
    otp: &'a str,
    role: &'a str,
}

#[derive(Debug, Deserialize)]
struct OtpVerdict {
    valid: bool,
}

/// Client for the OTP service behind `otp_queue`
#[derive(Debug, Clone)]
pub struct OtpProducer {
    client: ServiceClient,
    timeout: Duration,
}

impl OtpProducer {
    pub fn new(client: ServiceClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Ask the OTP service to remember `otp` for this account
    pub async fn store_otp(&self, email: &str, otp: &str, role: &str) -> Result<()> {
        let payload = OtpPayload { email, otp, role };
        self.client
            .call_with_timeout(queues::OTP, "storeOTP", &payload, self.timeout)
            .await?;
        debug!(role, "OTP stored");
        Ok(())
    }

    pub async fn verify_otp(&self, email: &str, otp: &str, role: &str) -> Result<bool> {
        let payload = OtpPayload { email, otp, role };
        let reply = self
            .client
            .call_with_timeout(queues::OTP, "verifyOTP", &payload, self.timeout)
            .await?;
        Ok(decode::<OtpVerdict>(reply)?.valid)
    }
}

/// Lookups other services make against this one, callable from here too
#[derive(Debug, Clone)]
pub struct UserDirectory {
    client: ServiceClient,
    timeout: Duration,
}

impl UserDirectory {
    pub fn new(client: ServiceClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn get_user_by_id(&self, user_id: &str, role: &str) -> Result<Value> {
        self.client
            .call_with_timeout(
                queues::GET_USER_BY_ID,
                "getUserById",
                json!({ "userId": user_id, "role": role }),
                self.timeout,
            )
            .await
    }

    pub async fn get_user_info(&self, user_id: &str, role: &str) -> Result<Value> {
        self.client
            .call_with_timeout(
                queues::USER_INFO,
                "getUserInfo",
                json!({ "userId": user_id, "role": role }),
                self.timeout,
            )
            .await
    }
}

/// Events and queries for the notification service
#[derive(Debug, Clone)]
pub struct NotificationProducer {
    publisher: Publisher,
    client: ServiceClient,
    timeout: Duration,
}

impl NotificationProducer {
    pub fn new(publisher: Publisher, client: ServiceClient, timeout: Duration) -> Self {
        Self {
            publisher,
            client,
            timeout,
        }
    }

    pub async fn send_create_notification(&self, notification: impl Serialize) -> Result<()> {
        self.publisher
            .publish(queues::CREATE_NOTIFICATION, notification)
            .await
    }

    /// Announce a new account so default preferences get created
    pub async fn register_preferences(&self, user_id: &str, role: &str) -> Result<()> {
        self.publisher
            .publish(
                queues::NOTIFICATION_PREFERENCES,
                json!({ "userId": user_id, "role": role }),
            )
            .await
    }

    pub async fn allowed_preferences(&self, user_id: &str, role: &str) -> Result<Value> {
        self.client
            .call_with_timeout(
                queues::GET_ALLOW_NOTIFICATION_PREFERENCES,
                "getAllowPreferences",
                json!({ "userId": user_id, "role": role }),
                self.timeout,
            )
            .await
    }
}
