// intercom-signaling-service/src/signaling/orchestrator.rs

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{topics, MessageBus, QoS};
use crate::call::{CallSession, CallState, Clock, SessionStore};
use crate::error::{SessionError, SignalingError};
use crate::rtc::{Credential, RtcProvider};
use crate::signaling::messages::{
    CalleeAction, CallerAction, ControlMessage, IncomingCall, SystemMessage,
};

/// Drives call sessions from request to termination and relays control
/// messages between the two parties.
pub struct CallOrchestrator {
    store: Arc<SessionStore>,
    bus: Arc<dyn MessageBus>,
    rtc: Arc<dyn RtcProvider>,
    clock: Arc<dyn Clock>,
}

impl CallOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        bus: Arc<dyn MessageBus>,
        rtc: Arc<dyn RtcProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, bus, rtc, clock }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn generate_call_id(&self, caller_id: &str, callee_id: &str) -> String {
        let nonce = Uuid::new_v4().simple().to_string();
        format!("call-{}-{}-{}-{}", caller_id, callee_id, self.now_millis(), &nonce[..8])
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, message: &T, retained: bool) -> Result<(), SignalingError> {
        let payload = serde_json::to_vec(message)?;
        self.bus.publish(topic, payload, QoS::AtLeastOnce, retained).await?;
        Ok(())
    }

    /// Sets up a call from a door device to a resident and returns its id.
    #[instrument(skip(self))]
    pub async fn initiate_call(&self, device_id: &str, target_id: &str) -> Result<String, SignalingError> {
        if !topics::is_valid_id(device_id) || !topics::is_valid_id(target_id) {
            return Err(SignalingError::InvalidRequest("malformed participant id".to_string()));
        }
        if device_id == target_id {
            return Err(SignalingError::InvalidRequest("caller and callee are the same".to_string()));
        }

        let call_id = self.generate_call_id(device_id, target_id);

        // Room and credentials are negotiated before the registry is touched.
        let room_id = self.rtc.create_room(device_id, target_id).await?;
        let caller_credential = self.rtc.issue_credential(device_id, &room_id).await?;
        let callee_credential = self.rtc.issue_credential(target_id, &room_id).await?;

        self.store.create_session(&call_id, device_id, target_id, &room_id)?;

        if let Err(e) = self
            .announce_call(&call_id, device_id, target_id, &room_id, caller_credential, callee_credential)
            .await
        {
            error!(event = "CALL_SETUP_FAILED", call_id = %call_id, error = %e, "Call setup aborted");
            if let Err(end_err) = self.store.end_session(&call_id, "failed").await {
                warn!(call_id = %call_id, error = %end_err, "Failed call already gone from registry");
            }
            return Err(e);
        }

        info!(
            event = "CALL_INITIATED",
            call_id = %call_id,
            caller_id = %device_id,
            callee_id = %target_id,
            room_id = %room_id,
            "📞 Call ringing"
        );
        Ok(call_id)
    }

    async fn announce_call(
        &self,
        call_id: &str,
        caller_id: &str,
        callee_id: &str,
        room_id: &str,
        caller_credential: Credential,
        callee_credential: Credential,
    ) -> Result<(), SignalingError> {
        // Marked ringing first so an immediate answer is never overwritten.
        self.store.update_status(call_id, CallState::Ringing)?;

        let incoming = IncomingCall {
            call_id: call_id.to_string(),
            caller_id: caller_id.to_string(),
            room_id: room_id.to_string(),
            credential: callee_credential,
            timestamp: self.now_millis(),
        };
        self.publish_json(&topics::incoming_call(callee_id), &incoming, false).await?;

        let ringing = ControlMessage {
            call_id: call_id.to_string(),
            action: CallState::Ringing.as_str().to_string(),
            reason: None,
            room_id: Some(room_id.to_string()),
            credential: Some(caller_credential),
            timestamp: self.now_millis(),
        };
        if let Err(e) = self.publish_json(&topics::caller_control(caller_id), &ringing, false).await {
            // The callee is already ringing.
            if let Err(cancel_err) = self
                .forward_control(
                    &topics::callee_control(callee_id),
                    call_id,
                    CallerAction::Cancelled.as_str(),
                    Some("failed"),
                )
                .await
            {
                warn!(call_id = %call_id, error = %cancel_err, "Callee could not be told about the aborted call");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn forward_control(
        &self,
        topic: &str,
        call_id: &str,
        action: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let message = ControlMessage {
            call_id: call_id.to_string(),
            action: action.to_string(),
            reason: reason.filter(|r| !r.is_empty()).map(str::to_string),
            room_id: None,
            credential: None,
            timestamp: self.now_millis(),
        };
        self.publish_json(topic, &message, false).await
    }

    /// Claims the session, forwards a terminal action to the counterpart and
    /// ends the call. A failed forward puts the session back so the action
    /// can be retried.
    async fn relay_and_end(
        &self,
        call_id: &str,
        action: &'static str,
        reason: Option<&str>,
        counterpart_topic: fn(&CallSession) -> String,
    ) -> Result<(), SignalingError> {
        let claim = self.store.claim_session(call_id)?;
        let topic = counterpart_topic(claim.session());

        if let Err(e) = self.forward_control(&topic, call_id, action, reason).await {
            if let Err(release_err) = self.store.release_session(claim) {
                error!(call_id = %call_id, error = %release_err, "Claimed session could not be restored");
            }
            return Err(e);
        }

        self.store.finish_session(claim, action).await;
        Ok(())
    }

    /// `cancelled` or `hangup` from the calling device; forwarded to the
    /// callee and the call is closed.
    #[instrument(skip(self))]
    pub async fn handle_caller_action(
        &self,
        call_id: &str,
        action: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let action: CallerAction = action.parse()?;
        self.relay_and_end(call_id, action.as_str(), reason, |s| topics::callee_control(&s.callee_id))
            .await?;

        info!(event = "CALLER_ACTION", call_id = %call_id, action = action.as_str(), "Caller action relayed");
        Ok(())
    }

    /// Callee reply. `answered` moves the call to `connected`; the rest
    /// close it.
    #[instrument(skip(self))]
    pub async fn handle_callee_action(
        &self,
        call_id: &str,
        action: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let action: CalleeAction = action.parse()?;

        if action.ends_call() {
            self.relay_and_end(call_id, action.as_str(), reason, |s| topics::caller_control(&s.caller_id))
                .await?;
        } else {
            let session = self.store.get_session(call_id).ok_or(SessionError::NotFound)?;
            self.store.update_status(call_id, CallState::Connected)?;
            self.forward_control(&topics::caller_control(&session.caller_id), call_id, action.as_str(), reason)
                .await?;
        }

        info!(event = "CALLEE_ACTION", call_id = %call_id, action = action.as_str(), "Callee action relayed");
        Ok(())
    }

    /// Caller action received on a device's own action topic.
    pub async fn handle_device_action(
        &self,
        device_id: &str,
        call_id: &str,
        action: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let session = self.store.get_session(call_id).ok_or(SessionError::NotFound)?;
        if session.caller_id != device_id {
            return Err(SignalingError::ParticipantMismatch(call_id.to_string()));
        }
        self.handle_caller_action(call_id, action, reason).await
    }

    /// Callee action received on a user's own action topic.
    pub async fn handle_user_action(
        &self,
        user_id: &str,
        call_id: &str,
        action: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let session = self.store.get_session(call_id).ok_or(SessionError::NotFound)?;
        if session.callee_id != user_id {
            return Err(SignalingError::ParticipantMismatch(call_id.to_string()));
        }
        self.handle_callee_action(call_id, action, reason).await
    }

    /// Broadcast on `system/{message_type}`.
    pub async fn publish_system_message(
        &self,
        message_type: &str,
        data: serde_json::Value,
        retained: bool,
    ) -> Result<(), SignalingError> {
        let message = SystemMessage {
            message_type: message_type.to_string(),
            data,
            timestamp: self.now_millis(),
        };
        self.publish_json(&topics::system(message_type), &message, retained).await
    }
}
