// intercom-signaling-service/src/call/store.rs

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::call::clock::Clock;
use crate::call::state::{CallSession, CallState};
use crate::error::SessionError;
use crate::records::{CallRecord, CallRecordSink};

/// A session taken out of the registry by [`SessionStore::claim_session`].
pub struct ClaimedSession {
    handle: Arc<Mutex<CallSession>>,
    snapshot: CallSession,
}

impl ClaimedSession {
    /// State at the time of the claim.
    pub fn session(&self) -> &CallSession {
        &self.snapshot
    }
}

/// Registry of active call sessions.
///
/// The map itself is sharded behind reader/writer locks; each session has
/// its own mutex so updates on one call never wait on another. Lock order
/// is always registry shard first, then session.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<CallSession>>>,
    clock: Arc<dyn Clock>,
    records: Arc<dyn CallRecordSink>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, records: Arc<dyn CallRecordSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            records,
        }
    }

    /// Inserts a new session in `requesting`. Fails if the id is taken.
    pub fn create_session(
        &self,
        call_id: &str,
        caller_id: &str,
        callee_id: &str,
        room_id: &str,
    ) -> Result<CallSession, SessionError> {
        match self.sessions.entry(call_id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyExists),
            Entry::Vacant(slot) => {
                let session = CallSession::new(
                    call_id.to_string(),
                    caller_id.to_string(),
                    callee_id.to_string(),
                    room_id.to_string(),
                    self.clock.now(),
                );
                slot.insert(Arc::new(Mutex::new(session.clone())));
                debug!(call_id = %call_id, "Session created");
                Ok(session)
            }
        }
    }

    fn handle(&self, call_id: &str) -> Option<Arc<Mutex<CallSession>>> {
        self.sessions.get(call_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_session(&self, call_id: &str) -> Option<CallSession> {
        self.handle(call_id).map(|session| session.lock().clone())
    }

    pub fn update_status(&self, call_id: &str, state: CallState) -> Result<(), SessionError> {
        if state == CallState::Ended {
            return Err(SessionError::InvalidTransition(state.as_str()));
        }

        let handle = self.handle(call_id).ok_or(SessionError::NotFound)?;
        let mut session = handle.lock();
        // Lost a race with end_session; the entry is already detached.
        if session.state == CallState::Ended {
            return Err(SessionError::NotFound);
        }
        session.state = state;
        session.last_activity = self.clock.now();
        debug!(call_id = %call_id, state = state.as_str(), "Session state updated");
        Ok(())
    }

    /// Detaches a session for a terminal action. Whoever holds the claim is
    /// the only one that can end it; concurrent actions and the sweep see
    /// `NotFound` until it is finished or released.
    pub fn claim_session(&self, call_id: &str) -> Result<ClaimedSession, SessionError> {
        let (_, handle) = self.sessions.remove(call_id).ok_or(SessionError::NotFound)?;
        let snapshot = {
            let session = handle.lock();
            if session.state == CallState::Ended {
                return Err(SessionError::NotFound);
            }
            session.clone()
        };
        debug!(call_id = %call_id, "Session claimed");
        Ok(ClaimedSession { handle, snapshot })
    }

    /// Puts a claimed session back, untouched, after its action could not
    /// be carried out.
    pub fn release_session(&self, claim: ClaimedSession) -> Result<(), SessionError> {
        match self.sessions.entry(claim.snapshot.call_id.clone()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(claim.handle);
                debug!(call_id = %claim.snapshot.call_id, "Session claim released");
                Ok(())
            }
        }
    }

    /// Finalizes and detaches a session, then hands the record to the sink.
    ///
    /// A failed record write is logged; the session stays ended.
    pub async fn end_session(&self, call_id: &str, reason: &str) -> Result<CallSession, SessionError> {
        let claim = self.claim_session(call_id)?;
        Ok(self.finish_session(claim, reason).await)
    }

    /// Ends a claimed session and writes its record.
    pub async fn finish_session(&self, claim: ClaimedSession, reason: &str) -> CallSession {
        let snapshot = {
            let mut session = claim.handle.lock();
            let now = self.clock.now();
            session.state = CallState::Ended;
            session.end_time = Some(now);
            session.last_activity = now;
            session.end_reason = Some(reason.to_string());
            session.clone()
        };

        let record = CallRecord::from_session(&snapshot);
        if let Err(e) = self.records.save_call_record(&record).await {
            error!(event = "CALL_RECORD_FAILED", call_id = %snapshot.call_id, error = %e, "Call record could not be saved");
        }

        info!(
            event = "CALL_ENDED",
            call_id = %snapshot.call_id,
            reason = %reason,
            duration_seconds = record.duration_seconds,
            "✅ Call session closed"
        );
        snapshot
    }

    /// Drops sessions idle longer than their state's timeout and returns
    /// how many were evicted. Nothing is persisted for them.
    pub fn cleanup_timed_out(&self, ring_timeout: Duration, call_timeout: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        self.sessions.retain(|call_id, handle| {
            let mut session = handle.lock();
            let timeout = if session.state.is_pending() { ring_timeout } else { call_timeout };
            let idle = (now - session.last_activity).to_std().unwrap_or_default();
            if idle > timeout {
                debug!(
                    call_id = %call_id,
                    state = session.state.as_str(),
                    idle_secs = idle.as_secs(),
                    "Session timed out"
                );
                // Handles already fetched by a concurrent update must not revive it.
                session.state = CallState::Ended;
                evicted += 1;
                false
            } else {
                true
            }
        });

        evicted
    }

    pub fn get_all_active(&self) -> Vec<CallSession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::clock::ManualClock;
    use crate::error::RecordError;
    use crate::records::MemoryCallRecordSink;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn store_with(clock: Arc<ManualClock>, sink: Arc<dyn CallRecordSink>) -> SessionStore {
        SessionStore::new(clock, sink)
    }

    fn start() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn update_status_refreshes_last_activity() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock.clone(), Arc::new(MemoryCallRecordSink::new()));
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();

        clock.advance(chrono::Duration::seconds(5));
        store.update_status("c1", CallState::Ringing).unwrap();

        let session = store.get_session("c1").unwrap();
        assert_eq!(session.state, CallState::Ringing);
        assert_eq!(session.last_activity, start() + chrono::Duration::seconds(5));
        assert_eq!(session.start_time, start());
    }

    #[test]
    fn update_status_rejects_unknown_and_ended() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock, Arc::new(MemoryCallRecordSink::new()));
        assert_eq!(store.update_status("nope", CallState::Connected), Err(SessionError::NotFound));

        store.create_session("c1", "dev1", "res2", "room-1").unwrap();
        assert_eq!(
            store.update_status("c1", CallState::Ended),
            Err(SessionError::InvalidTransition("ended"))
        );
    }

    #[tokio::test]
    async fn end_session_records_duration_once() {
        let clock = Arc::new(ManualClock::new(start()));
        let sink = Arc::new(MemoryCallRecordSink::new());
        let store = store_with(clock.clone(), sink.clone());
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();

        clock.advance(chrono::Duration::seconds(42));
        let ended = store.end_session("c1", "completed").await.unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.duration_seconds(), 42);
        assert!(matches!(
            store.end_session("c1", "completed").await,
            Err(SessionError::NotFound)
        ));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, "completed");
        assert_eq!(records[0].duration_seconds, 42);
    }

    struct BrokenSink;

    #[async_trait]
    impl CallRecordSink for BrokenSink {
        async fn save_call_record(&self, _record: &CallRecord) -> Result<(), RecordError> {
            Err(RecordError::Encode(serde_json::from_str::<u8>("x").unwrap_err()))
        }
    }

    #[tokio::test]
    async fn record_failure_does_not_resurrect_session() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock, Arc::new(BrokenSink));
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();

        assert!(store.end_session("c1", "hangup").await.is_ok());
        assert!(store.get_session("c1").is_none());
    }

    #[test]
    fn claimed_session_is_exclusive_until_released() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock, Arc::new(MemoryCallRecordSink::new()));
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();

        let claim = store.claim_session("c1").unwrap();
        assert_eq!(claim.session().callee_id, "res2");
        assert!(matches!(store.claim_session("c1"), Err(SessionError::NotFound)));
        assert_eq!(store.update_status("c1", CallState::Connected), Err(SessionError::NotFound));

        store.release_session(claim).unwrap();
        assert_eq!(store.get_session("c1").unwrap().state, CallState::Requesting);
        assert!(store.claim_session("c1").is_ok());
    }

    #[test]
    fn evicted_session_rejects_late_updates() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock.clone(), Arc::new(MemoryCallRecordSink::new()));
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();
        let handle = store.handle("c1").unwrap();

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600)), 1);
        assert_eq!(handle.lock().state, CallState::Ended);
    }

    #[test]
    fn sweep_boundary_is_exclusive() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_with(clock.clone(), Arc::new(MemoryCallRecordSink::new()));
        store.create_session("c1", "dev1", "res2", "room-1").unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600)), 0);
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600)), 1);
        assert!(store.is_empty());
    }
}
