// intercom-signaling-service/src/lib.rs

//! Door-intercom call signaling: session lifecycle, access tokens for the
//! media plane, and the message-bus plumbing between devices and residents.

pub mod app;
pub mod bus;
pub mod call;
pub mod config;
pub mod error;
pub mod records;
pub mod rtc;
pub mod signaling;
pub mod token;
