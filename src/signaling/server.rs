// intercom-signaling-service/src/signaling/server.rs

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::topics::{self, InboundTopic};
use crate::bus::{BusMessage, MessageBus, QoS};
use crate::signaling::messages::{ActionRequest, CallRequest, DeviceStatus};
use crate::signaling::orchestrator::CallOrchestrator;

/// Subscribes to the inbound signaling topics and hands each delivery to
/// the orchestrator on its own task.
pub struct SignalingServer {
    orchestrator: Arc<CallOrchestrator>,
    bus: Arc<dyn MessageBus>,
}

impl SignalingServer {
    pub fn new(orchestrator: Arc<CallOrchestrator>, bus: Arc<dyn MessageBus>) -> Self {
        Self { orchestrator, bus }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut requests = self
            .bus
            .subscribe(topics::CALL_REQUEST_FILTER, QoS::AtLeastOnce)
            .await
            .context("call request subscription failed")?;
        let mut device_actions = self
            .bus
            .subscribe(topics::DEVICE_ACTION_FILTER, QoS::AtLeastOnce)
            .await
            .context("device action subscription failed")?;
        let mut user_actions = self
            .bus
            .subscribe(topics::USER_ACTION_FILTER, QoS::AtLeastOnce)
            .await
            .context("user action subscription failed")?;
        let mut statuses = self
            .bus
            .subscribe(topics::DEVICE_STATUS_FILTER, QoS::AtMostOnce)
            .await
            .context("device status subscription failed")?;

        info!(
            event = "SIGNALING_SERVER_ACTIVE",
            filters = ?[requests.filter(), device_actions.filter(), user_actions.filter(), statuses.filter()],
            "📡 Signaling listener active"
        );

        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(event = "SIGNALING_SHUTDOWN", "Signaling listener stopping");
                        break;
                    }
                    continue;
                }
                Some(m) = requests.recv() => m,
                Some(m) = device_actions.recv() => m,
                Some(m) = user_actions.recv() => m,
                Some(m) = statuses.recv() => m,
                else => {
                    warn!(event = "SIGNALING_SUBSCRIPTIONS_CLOSED", "All subscriptions closed");
                    break;
                }
            };

            debug!(event = "BUS_MESSAGE_RECEIVED", topic = %message.topic, bytes = message.payload.len(), "📥 Message received");
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                dispatch(&orchestrator, message).await;
            });
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(message: &BusMessage) -> Option<T> {
    match serde_json::from_slice(&message.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event = "BUS_PAYLOAD_INVALID", topic = %message.topic, error = %e, "Malformed payload dropped");
            None
        }
    }
}

/// Routes one inbound message. Failures are logged, never propagated.
pub async fn dispatch(orchestrator: &CallOrchestrator, message: BusMessage) {
    let Some(topic) = InboundTopic::parse(&message.topic) else {
        debug!(topic = %message.topic, "Ignoring message on unhandled topic");
        return;
    };

    match topic {
        InboundTopic::CallRequest { device_id } => {
            let Some(request) = decode::<CallRequest>(&message) else { return };
            if let Err(e) = orchestrator.initiate_call(device_id, &request.target_id).await {
                warn!(event = "CALL_REQUEST_FAILED", device_id = %device_id, target_id = %request.target_id, error = %e, "Call request rejected");
            }
        }
        InboundTopic::DeviceAction { device_id } => {
            let Some(request) = decode::<ActionRequest>(&message) else { return };
            if let Err(e) = orchestrator
                .handle_device_action(device_id, &request.call_id, &request.action, request.reason.as_deref())
                .await
            {
                warn!(event = "CALLER_ACTION_FAILED", call_id = %request.call_id, action = %request.action, error = %e, "Caller action rejected");
            }
        }
        InboundTopic::UserAction { user_id } => {
            let Some(request) = decode::<ActionRequest>(&message) else { return };
            if let Err(e) = orchestrator
                .handle_user_action(user_id, &request.call_id, &request.action, request.reason.as_deref())
                .await
            {
                warn!(event = "CALLEE_ACTION_FAILED", call_id = %request.call_id, action = %request.action, error = %e, "Callee action rejected");
            }
        }
        InboundTopic::DeviceStatus { device_id } => {
            let Some(status) = decode::<DeviceStatus>(&message) else { return };
            info!(event = "DEVICE_STATUS", device_id = %device_id, status = %status.status, reported_at = status.timestamp, "Device status update");
        }
    }
}
