// intercom-signaling-service/src/token/access_token.rs

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::ops::BitOr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::TokenError;
use crate::token::packer::{Packer, Unpacker};

type HmacSha256 = Hmac<Sha256>;

/// Wire format version prefix.
pub const VERSION: &str = "001";

/// Default validity when no explicit expiry is set.
pub const DEFAULT_TTL_SECS: u32 = 3600;

const PAD_BASE: usize = 256;

/// Upper bound on an inflated token container.
const MAX_CONTAINER_LEN: usize = 1 << 20;

/// Publish capabilities granted to a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Privileges(u32);

impl Privileges {
    pub const ENABLED: Privileges = Privileges(1);
    pub const AUDIO: Privileges = Privileges(1 << 1);
    pub const VIDEO: Privileges = Privileges(1 << 2);
    pub const SCREEN: Privileges = Privileges(1 << 3);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn all() -> Self {
        Self(Self::ENABLED.0 | Self::AUDIO.0 | Self::VIDEO.0 | Self::SCREEN.0)
    }

    pub const fn contains(self, other: Privileges) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Privileges {
    type Output = Privileges;

    fn bitor(self, rhs: Self) -> Self::Output {
        Privileges(self.0 | rhs.0)
    }
}

/// The room/user pair a token grants access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub channel_id: String,
    pub user_id: String,
    pub privileges: Option<Privileges>,
}

impl Service {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            privileges: None,
        }
    }

    pub fn with_privileges(mut self, privileges: Privileges) -> Self {
        self.privileges = Some(privileges);
        self
    }

    fn pack(&self, p: &mut Packer) -> Result<(), TokenError> {
        p.put_str("channelId", &self.channel_id)?;
        p.put_str("userId", &self.user_id)?;
        match self.privileges {
            Some(privileges) => {
                p.put_bool(true);
                p.put_u32(privileges.bits());
            }
            None => p.put_bool(false),
        }
        Ok(())
    }

    fn unpack(r: &mut Unpacker<'_>) -> Result<Self, TokenError> {
        let channel_id = r.get_string("channelId")?;
        let user_id = r.get_string("userId")?;
        let privileges = if r.get_bool("privilege")? {
            Some(Privileges::from_bits(r.get_u32("privilege")?))
        } else {
            None
        };
        Ok(Self { channel_id, user_id, privileges })
    }
}

/// Signed, compressed credential for joining an RTC room.
///
/// Built tokens carry the shared `app_key`; parsed tokens never do, they
/// only keep the raw payload and signature so the holder of the key can
/// call [`AppToken::verify`].
#[derive(Clone)]
pub struct AppToken {
    pub app_id: String,
    app_key: String,
    pub issue_timestamp: u32,
    pub salt: u32,
    pub expire_timestamp: u32,
    pub service: Service,
    pub options: BTreeMap<String, String>,
    signature: Vec<u8>,
    payload: Vec<u8>,
}

impl fmt::Debug for AppToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppToken")
            .field("app_id", &self.app_id)
            .field("issue_timestamp", &self.issue_timestamp)
            .field("salt", &self.salt)
            .field("expire_timestamp", &self.expire_timestamp)
            .field("service", &self.service)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AppToken {
    /// New token with a random salt and the default expiry.
    pub fn new(
        app_id: impl Into<String>,
        app_key: impl Into<String>,
        issue_timestamp: u32,
        service: Service,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_key: app_key.into(),
            issue_timestamp,
            salt: rand::random::<u32>(),
            expire_timestamp: issue_timestamp.saturating_add(DEFAULT_TTL_SECS),
            service,
            options: BTreeMap::new(),
            signature: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_salt(mut self, salt: u32) -> Self {
        self.salt = salt;
        self
    }

    pub fn with_expire(mut self, expire_timestamp: u32) -> Self {
        self.expire_timestamp = expire_timestamp;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn is_expired(&self, now_secs: u32) -> bool {
        now_secs >= self.expire_timestamp
    }

    fn pack_payload(&self) -> Result<Vec<u8>, TokenError> {
        let mut p = Packer::new();
        p.put_str("appId", &self.app_id)?;
        p.put_u32(self.issue_timestamp);
        p.put_u32(self.salt);
        p.put_u32(self.expire_timestamp);
        self.service.pack(&mut p)?;

        if self.options.is_empty() {
            p.put_bool(false);
        } else {
            p.put_bool(true);
            let count = u32::try_from(self.options.len())
                .map_err(|_| TokenError::IllegalField("options"))?;
            p.put_u32(count);
            // BTreeMap iterates in key order.
            for (key, value) in &self.options {
                p.put_str("optionKey", key)?;
                p.put_str("optionValue", value)?;
            }
        }

        p.pad(PAD_BASE);
        Ok(p.into_inner())
    }

    /// Serializes and signs the token into its wire string.
    pub fn build(&self) -> Result<String, TokenError> {
        if self.app_key.is_empty() {
            return Err(TokenError::IllegalAppKey);
        }
        if self.service.channel_id.is_empty() || self.service.user_id.is_empty() {
            return Err(TokenError::IllegalService);
        }

        let payload = self.pack_payload()?;
        let signature = sign_payload(&self.app_key, self.issue_timestamp, self.salt, &payload)?;

        let mut container = Packer::new();
        container.put_bytes("signature", &signature)?;
        container.put_raw(&payload);

        let compressed = compress(&container.into_inner())?;
        Ok(format!("{}{}", VERSION, STANDARD.encode(compressed)))
    }

    /// Reconstructs a token from its wire string. The signature is not
    /// checked here.
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        if token.len() < VERSION.len() || !token.starts_with(VERSION) {
            return Err(TokenError::IllegalLength);
        }

        let raw = STANDARD
            .decode(&token[VERSION.len()..])
            .map_err(|e| TokenError::DecodeFailed(e.to_string()))?;
        let container = decompress(&raw)?;

        let mut outer = Unpacker::new(&container);
        let signature = outer.get_bytes("signature")?.to_vec();
        let payload = outer.rest().to_vec();

        let mut r = Unpacker::new(&payload);
        let app_id = r.get_string("appId")?;
        let issue_timestamp = r.get_u32("issueTimestamp")?;
        let salt = r.get_u32("salt")?;
        let expire_timestamp = r.get_u32("expireTimestamp")?;
        let service = Service::unpack(&mut r)?;

        let mut options = BTreeMap::new();
        if r.get_bool("options")? {
            let count = r.get_u32("options")?;
            for _ in 0..count {
                let key = r.get_string("optionKey")?;
                let value = r.get_string("optionValue")?;
                options.insert(key, value);
            }
        }

        Ok(Self {
            app_id,
            app_key: String::new(),
            issue_timestamp,
            salt,
            expire_timestamp,
            service,
            options,
            signature,
            payload,
        })
    }

    /// Checks the parsed signature against `app_key`, over the payload
    /// exactly as it was received.
    pub fn verify(&self, app_key: &str) -> Result<bool, TokenError> {
        if app_key.is_empty() {
            return Err(TokenError::IllegalAppKey);
        }
        let mut mac = signing_mac(app_key, self.issue_timestamp, self.salt)?;
        mac.update(&self.payload);
        Ok(mac.verify_slice(&self.signature).is_ok())
    }
}

fn signing_mac(app_key: &str, issue_timestamp: u32, salt: u32) -> Result<HmacSha256, TokenError> {
    let mut mac =
        HmacSha256::new_from_slice(app_key.as_bytes()).map_err(|_| TokenError::GenerateSignFailed)?;
    mac.update(&issue_timestamp.to_be_bytes());
    let stage = mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&stage).map_err(|_| TokenError::GenerateSignFailed)?;
    mac.update(&salt.to_be_bytes());
    let derived = mac.finalize().into_bytes();

    HmacSha256::new_from_slice(&derived).map_err(|_| TokenError::SignFailed)
}

/// Signature over `payload` with the key derived from `{app_key, issue_timestamp, salt}`.
pub fn sign_payload(
    app_key: &str,
    issue_timestamp: u32,
    salt: u32,
    payload: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let mut mac = signing_mac(app_key, issue_timestamp, salt)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn compress(data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|_| TokenError::CompressFailed)?;
    encoder.finish().map_err(|_| TokenError::CompressFailed)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_CONTAINER_LEN as u64 + 1);
    let mut out = Vec::with_capacity((data.len() * 4).clamp(256, 64 * 1024));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TokenError::DecompressFailed(e.to_string()))?;
    if out.len() > MAX_CONTAINER_LEN {
        return Err(TokenError::DecompressFailed(format!(
            "container exceeds {} bytes",
            MAX_CONTAINER_LEN
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_ID: &str = "5f2c7e9a1b";
    const APP_KEY: &str = "c0ffee-door-intercom-secret";
    const ISSUED: u32 = 1_700_000_000;

    fn service() -> Service {
        Service::new("room-lobby-1", "res-204").with_privileges(Privileges::all())
    }

    /// Splits a wire token into (signature, padded payload).
    fn open(token: &str) -> (Vec<u8>, Vec<u8>) {
        let raw = STANDARD.decode(&token[VERSION.len()..]).unwrap();
        let container = decompress(&raw).unwrap();
        let mut r = Unpacker::new(&container);
        let sig = r.get_bytes("signature").unwrap().to_vec();
        (sig, r.rest().to_vec())
    }

    fn seal(signature: &[u8], payload: &[u8]) -> String {
        let mut p = Packer::new();
        p.put_bytes("signature", signature).unwrap();
        p.put_raw(payload);
        format!("{}{}", VERSION, STANDARD.encode(compress(&p.into_inner()).unwrap()))
    }

    #[test]
    fn round_trip_preserves_identity_fields() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).build().unwrap();
        assert!(token.starts_with(VERSION));

        let parsed = AppToken::parse(&token).unwrap();
        assert_eq!(parsed.app_id, APP_ID);
        assert_eq!(parsed.issue_timestamp, ISSUED);
        assert_eq!(parsed.expire_timestamp, ISSUED + DEFAULT_TTL_SECS);
        assert_eq!(parsed.service, service());
        assert!(parsed.options.is_empty());
        assert!(parsed.verify(APP_KEY).unwrap());
    }

    #[test]
    fn service_without_privileges_round_trips() {
        let svc = Service::new("room-9", "dev-1");
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, svc.clone()).build().unwrap();
        assert_eq!(AppToken::parse(&token).unwrap().service, svc);
    }

    #[test]
    fn options_round_trip() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service())
            .with_option("region", "eu")
            .with_option("building", "B7")
            .build()
            .unwrap();
        let parsed = AppToken::parse(&token).unwrap();
        assert_eq!(parsed.options.get("region").map(String::as_str), Some("eu"));
        assert_eq!(parsed.options.get("building").map(String::as_str), Some("B7"));
    }

    #[test]
    fn identical_inputs_build_identical_tokens() {
        let a = AppToken::new(APP_ID, APP_KEY, ISSUED, service())
            .with_salt(42)
            .with_option("b", "2")
            .with_option("a", "1");
        let b = AppToken::new(APP_ID, APP_KEY, ISSUED, service())
            .with_salt(42)
            .with_option("a", "1")
            .with_option("b", "2");
        assert_eq!(a.build().unwrap(), b.build().unwrap());

        let c = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).with_salt(43);
        assert_ne!(a.build().unwrap(), c.with_option("a", "1").with_option("b", "2").build().unwrap());
    }

    #[test]
    fn payload_is_padded_to_power_of_two_multiple() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).build().unwrap();
        assert_eq!(open(&token).1.len(), 256);

        let long_user = "u".repeat(300);
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, Service::new("room", long_user))
            .build()
            .unwrap();
        assert_eq!(open(&token).1.len(), 512);
    }

    #[test]
    fn any_flipped_payload_byte_breaks_the_signature() {
        let salt = 7;
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service())
            .with_salt(salt)
            .build()
            .unwrap();
        let (signature, payload) = open(&token);

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            let resigned = sign_payload(APP_KEY, ISSUED, salt, &tampered).unwrap();
            assert_ne!(resigned, signature, "byte {} not covered by signature", i);
        }
    }

    #[test]
    fn tampered_padding_fails_verify_after_parse() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).build().unwrap();
        let (signature, mut payload) = open(&token);
        let last = payload.len() - 1;
        payload[last] = 0xff;

        let parsed = AppToken::parse(&seal(&signature, &payload)).unwrap();
        assert_eq!(parsed.service, service());
        assert!(!parsed.verify(APP_KEY).unwrap());
    }

    #[test]
    fn wrong_key_fails_verify() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).build().unwrap();
        let parsed = AppToken::parse(&token).unwrap();
        assert!(!parsed.verify("another-key").unwrap());
        assert_eq!(parsed.verify(""), Err(TokenError::IllegalAppKey));
    }

    #[test]
    fn build_rejects_missing_key_and_service_ids() {
        let err = AppToken::new(APP_ID, "", ISSUED, service()).build().unwrap_err();
        assert_eq!(err, TokenError::IllegalAppKey);

        let err = AppToken::new(APP_ID, APP_KEY, ISSUED, Service::new("", "res-1"))
            .build()
            .unwrap_err();
        assert_eq!(err, TokenError::IllegalService);

        let err = AppToken::new(APP_ID, APP_KEY, ISSUED, Service::new("room", ""))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "illegal Service");
    }

    #[test]
    fn parse_rejects_bad_prefix_and_encoding() {
        assert_eq!(AppToken::parse("00").unwrap_err(), TokenError::IllegalLength);
        assert_eq!(AppToken::parse("002abcd").unwrap_err(), TokenError::IllegalLength);
        assert!(matches!(
            AppToken::parse("001***not-base64***"),
            Err(TokenError::DecodeFailed(_))
        ));
        let not_zlib = format!("{}{}", VERSION, STANDARD.encode(b"plain bytes"));
        assert!(matches!(AppToken::parse(&not_zlib), Err(TokenError::DecompressFailed(_))));
    }

    #[test]
    fn parse_reports_truncated_field() {
        let mut p = Packer::new();
        p.put_bytes("signature", &[1, 2, 3]).unwrap();
        p.put_str("appId", APP_ID).unwrap();
        p.put_u32(ISSUED);
        let token = format!("{}{}", VERSION, STANDARD.encode(compress(&p.into_inner()).unwrap()));

        let err = AppToken::parse(&token).unwrap_err();
        assert_eq!(err, TokenError::ParseFailed("salt"));
        assert_eq!(err.to_string(), "parse salt failed");
    }

    #[test]
    fn oversized_container_is_refused() {
        let bomb = compress(&vec![0u8; MAX_CONTAINER_LEN + 4096]).unwrap();
        assert!(bomb.len() < 16 * 1024);
        let token = format!("{}{}", VERSION, STANDARD.encode(bomb));
        assert!(matches!(AppToken::parse(&token), Err(TokenError::DecompressFailed(_))));
    }

    #[test]
    fn expiry_check() {
        let token = AppToken::new(APP_ID, APP_KEY, ISSUED, service()).with_expire(ISSUED + 10);
        assert!(!token.is_expired(ISSUED + 9));
        assert!(token.is_expired(ISSUED + 10));
    }

    #[test]
    fn privilege_bits() {
        let p = Privileges::ENABLED | Privileges::AUDIO;
        assert!(p.contains(Privileges::AUDIO));
        assert!(!p.contains(Privileges::VIDEO));
        assert_eq!(Privileges::all().bits(), 0b1111);
    }
}
