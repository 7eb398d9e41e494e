// intercom-signaling-service/src/signaling/mod.rs

pub mod messages;
pub mod orchestrator;
pub mod server;

pub use orchestrator::CallOrchestrator;
pub use server::SignalingServer;
