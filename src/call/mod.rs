// intercom-signaling-service/src/call/mod.rs

pub mod clock;
pub mod state;
pub mod store;
pub mod sweep;

pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{CallSession, CallState};
pub use store::{ClaimedSession, SessionStore};
pub use sweep::{spawn_sweeper, SweepPolicy};
