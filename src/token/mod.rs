// intercom-signaling-service/src/token/mod.rs

//! Versioned, signed and compressed access tokens for the RTC media plane.
//!
//! Wire form: `"001" + base64(zlib(sig_len | sig | padded_payload))`.

pub mod access_token;
pub mod packer;

pub use access_token::{sign_payload, AppToken, Privileges, Service, DEFAULT_TTL_SECS, VERSION};
