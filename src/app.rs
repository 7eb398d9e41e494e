// intercom-signaling-service/src/app.rs
use crate::bus::{AmqpBus, InMemoryBus, MessageBus};
use crate::call::{spawn_sweeper, Clock, SessionStore, SweepPolicy, SystemClock};
use crate::config::{AppConfig, BusBackend};
use crate::error::ServiceError;
use crate::records::{CallRecordSink, LogCallRecordSink, RedisCallRecordSink};
use crate::rtc::TokenRtcProvider;
use crate::signaling::{CallOrchestrator, SignalingServer};
use anyhow::{Context, Result};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server as HttpServer, StatusCode,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

pub struct App {
    config: Arc<AppConfig>,
}

async fn handle_http_request(_req: Request<Body>, store: Arc<SessionStore>) -> Result<Response<Body>, Infallible> {
    let body = serde_json::json!({
        "status": "ok",
        "service": "intercom-signaling-service",
        "active_calls": store.len(),
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    Ok(response)
}

impl App {
    pub async fn bootstrap() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Arc::new(AppConfig::load_from_env().context("configuration could not be loaded")?);

        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.rust_log))?;
        let subscriber = Registry::default().with(env_filter);

        if config.env == "development" {
            subscriber.with(fmt::layer().with_target(true).with_line_number(true)).init();
        } else {
            subscriber.with(fmt::layer().json().with_current_span(true).with_span_list(true)).init();
        }

        info!(
            service_name = "intercom-signaling-service",
            version = %config.service_version,
            profile = %config.env,
            "🚀 Service starting"
        );
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<(), ServiceError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // 1. Collaborators
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus: Arc<dyn MessageBus> = match self.config.bus_backend {
            BusBackend::Amqp => AmqpBus::start(
                &self.config.amqp_url,
                &self.config.bus_exchange,
                self.config.bus_reconnect_min,
                self.config.bus_reconnect_max,
                shutdown_rx.clone(),
            ),
            BusBackend::Memory => {
                warn!("In-memory message bus active; signaling is local to this process");
                Arc::new(InMemoryBus::new())
            }
        };
        let records: Arc<dyn CallRecordSink> = match &self.config.redis_url {
            Some(url) => Arc::new(RedisCallRecordSink::new(url).await?),
            None => {
                warn!("REDIS_URL not set; call records are only logged");
                Arc::new(LogCallRecordSink)
            }
        };
        let rtc = Arc::new(TokenRtcProvider::new(
            &self.config.rtc_app_id,
            &self.config.rtc_app_key,
            self.config.rtc_token_ttl,
            clock.clone(),
        ));

        // 2. Session store & orchestrator
        let store = Arc::new(SessionStore::new(clock.clone(), records));
        let orchestrator = Arc::new(CallOrchestrator::new(store.clone(), bus.clone(), rtc, clock));

        // 3. Sweep
        let sweep_handle = spawn_sweeper(
            store.clone(),
            SweepPolicy {
                ring_timeout: self.config.ring_timeout,
                call_timeout: self.config.call_timeout,
                interval: self.config.sweep_interval,
            },
            shutdown_rx.clone(),
        );

        // 4. Signaling listener
        let server = SignalingServer::new(orchestrator.clone(), bus.clone());
        let signaling_shutdown = shutdown_rx.clone();
        let mut signaling_handle = tokio::spawn(async move { server.run(signaling_shutdown).await });

        // 5. HTTP health
        let http_addr = self.config.http_listen_addr;
        let http_builder = HttpServer::try_bind(&http_addr)?;
        let http_store = store.clone();
        let mut http_handle = tokio::spawn(async move {
            let make_svc = make_service_fn(move |_conn| {
                let store = http_store.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| handle_http_request(req, store.clone())))
                }
            });
            let server = http_builder.serve(make_svc).with_graceful_shutdown(async {
                http_shutdown_rx.await.ok();
            });
            info!(address = %http_addr, "HTTP health check active");
            server.await
        });

        wait_for_bus(bus.as_ref(), Duration::from_secs(5)).await;
        announce_status(&orchestrator, "online").await;

        let outcome = tokio::select! {
            res = &mut signaling_handle => {
                let reason = match res {
                    Ok(Err(e)) => format!("{:#}", e),
                    Err(e) => format!("task aborted: {}", e),
                    Ok(Ok(())) => "stopped".to_string(),
                };
                error!(error = %reason, "Signaling listener failed");
                Err(ServiceError::Listener(reason))
            },
            res = &mut http_handle => {
                error!("HTTP server stopped");
                match res {
                    Ok(Err(e)) => Err(ServiceError::Http(e)),
                    _ => Ok(()),
                }
            },
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "Ctrl+C handler failed");
                }
                warn!("Shutdown signal received.");
                Ok(())
            },
        };

        announce_status(&orchestrator, "offline").await;

        let _ = shutdown_tx.send(true);
        let _ = http_shutdown_tx.send(());
        let _ = sweep_handle.await;

        info!(active_calls = store.len(), "Service stopped.");
        outcome
    }
}

async fn wait_for_bus(bus: &dyn MessageBus, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !bus.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn announce_status(orchestrator: &CallOrchestrator, status: &str) {
    let data = serde_json::json!({ "service": "intercom-signaling-service", "status": status });
    if let Err(e) = orchestrator.publish_system_message("service_status", data, true).await {
        warn!(error = %e, status = %status, "Service status announcement failed");
    }
}
