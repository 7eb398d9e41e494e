// intercom-signaling-service/src/config.rs
use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    Amqp,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_listen_addr: SocketAddr,

    // Message bus
    pub bus_backend: BusBackend,
    pub amqp_url: String,
    pub bus_exchange: String,
    pub bus_reconnect_min: Duration,
    pub bus_reconnect_max: Duration,

    // Call records; logged only when unset
    pub redis_url: Option<String>,

    // RTC credentials
    pub rtc_app_id: String,
    pub rtc_app_key: String,
    pub rtc_token_ttl: Duration,

    // Session timeouts
    pub ring_timeout: Duration,
    pub call_timeout: Duration,
    pub sweep_interval: Duration,

    pub env: String,
    pub rust_log: String,
    pub service_version: String,
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .with_context(|| format!("invalid value for {}: {}", name, raw))
}

impl AppConfig {
    pub fn load_from_env() -> Result<Self> {
        let http_port: u16 = parse_var("INTERCOM_SERVICE_HTTP_PORT", "13180")?;
        let http_addr: SocketAddr = format!("[::]:{}", http_port).parse()?;

        let bus_backend = match env::var("BUS_BACKEND").unwrap_or_else(|_| "amqp".to_string()).as_str() {
            "amqp" => BusBackend::Amqp,
            "memory" => BusBackend::Memory,
            other => bail!("unknown BUS_BACKEND: {}", other),
        };
        let amqp_url = match bus_backend {
            BusBackend::Amqp => env::var("AMQP_URL").context("REQUIRED: AMQP_URL")?,
            BusBackend::Memory => env::var("AMQP_URL").unwrap_or_default(),
        };

        let reconnect_min: u64 = parse_var("BUS_RECONNECT_MIN_MS", "500")?;
        let reconnect_max: u64 = parse_var("BUS_RECONNECT_MAX_MS", "30000")?;
        if reconnect_min == 0 || reconnect_min > reconnect_max {
            bail!("BUS_RECONNECT_MIN_MS must be > 0 and <= BUS_RECONNECT_MAX_MS");
        }

        let rtc_app_key = env::var("RTC_APP_KEY").context("REQUIRED: RTC_APP_KEY")?;
        if rtc_app_key.is_empty() {
            bail!("RTC_APP_KEY must not be empty");
        }

        Ok(AppConfig {
            http_listen_addr: http_addr,

            bus_backend,
            amqp_url,
            bus_exchange: env::var("BUS_EXCHANGE").unwrap_or_else(|_| "intercom_signaling".to_string()),
            bus_reconnect_min: Duration::from_millis(reconnect_min),
            bus_reconnect_max: Duration::from_millis(reconnect_max),

            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            rtc_app_id: env::var("RTC_APP_ID").context("REQUIRED: RTC_APP_ID")?,
            rtc_app_key,
            rtc_token_ttl: Duration::from_secs(parse_var("RTC_TOKEN_TTL_SECS", "3600")?),

            ring_timeout: Duration::from_secs(parse_var("CALL_RING_TIMEOUT_SECS", "30")?),
            call_timeout: Duration::from_secs(parse_var("CALL_MAX_DURATION_SECS", "600")?),
            sweep_interval: Duration::from_secs(parse_var("CALL_SWEEP_INTERVAL_SECS", "10")?),

            env: env::var("ENV").unwrap_or_else(|_| "production".to_string()),
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            service_version: env::var("SERVICE_VERSION").unwrap_or_else(|_| "1.0.0".to_string()),
        })
    }
}
