// intercom-signaling-service/src/rtc.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::call::clock::Clock;
use crate::error::{RtcError, TokenError};
use crate::token::{AppToken, Privileges, Service};

/// What a participant needs to join a media room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub app_id: String,
    pub token: String,
    /// Epoch seconds.
    pub expires_at: i64,
}

#[async_trait]
pub trait RtcProvider: Send + Sync {
    async fn create_room(&self, party_a: &str, party_b: &str) -> Result<String, RtcError>;

    async fn issue_credential(&self, user_id: &str, room_id: &str) -> Result<Credential, RtcError>;
}

/// Issues room credentials locally with the access-token codec.
pub struct TokenRtcProvider {
    app_id: String,
    app_key: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenRtcProvider {
    pub fn new(app_id: &str, app_key: &str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
            ttl,
            clock,
        }
    }
}

#[async_trait]
impl RtcProvider for TokenRtcProvider {
    async fn create_room(&self, party_a: &str, party_b: &str) -> Result<String, RtcError> {
        if party_a.is_empty() || party_b.is_empty() {
            return Err(RtcError::Room("room needs two participants".to_string()));
        }
        let room_id = format!("room-{}", Uuid::new_v4().simple());
        debug!(room_id = %room_id, party_a = %party_a, party_b = %party_b, "RTC room allocated");
        Ok(room_id)
    }

    async fn issue_credential(&self, user_id: &str, room_id: &str) -> Result<Credential, RtcError> {
        let issued = u32::try_from(self.clock.now().timestamp())
            .map_err(|_| TokenError::IllegalField("issueTimestamp"))?;
        let ttl = u32::try_from(self.ttl.as_secs()).unwrap_or(u32::MAX);
        let expires = issued.saturating_add(ttl);

        let service = Service::new(room_id, user_id).with_privileges(Privileges::all());
        let token = AppToken::new(&self.app_id, &self.app_key, issued, service)
            .with_expire(expires)
            .build()?;

        Ok(Credential {
            app_id: self.app_id.clone(),
            token,
            expires_at: i64::from(expires),
        })
    }
}
