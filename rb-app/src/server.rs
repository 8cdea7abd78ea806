//! Relaybot server: wires config, collaborators, the reply coordinator and
//! the HTTP surface.

use crate::adapters::{OpenAiCompletion, WhatsAppReplySink};
use crate::config::RelaybotConfig;
use crate::gateway::Gateway;
use crate::history::SqliteHistoryStore;
use crate::routes;
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use rb_channels::{ChannelAdapter, InboundMessage, OutboundMessage, WhatsAppCloudAdapter};
use rb_core::ReplyCoordinator;
use rb_llm::{LlmClient, SpeechClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

pub struct AppState {
    pub started_at: Instant,
    pub verify_token: String,
    pub app_secret: Option<String>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub coordinator: Arc<ReplyCoordinator>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelaybotConfig::load_with_path(config_path).await?;
    let openai_key_configured = cfg.openai_api_key().is_ok();
    let whatsapp_configured = !cfg.whatsapp.access_token.trim().is_empty()
        && !cfg.whatsapp.phone_number_id.trim().is_empty();
    tracing::info!(
        model = %cfg.general.model,
        config_path = %path.display(),
        bind_addr = %cfg.server.bind_addr()?,
        quiet_window_ms = cfg.debounce.quiet_window_ms,
        history_path = %cfg.history.resolved_path()?.display(),
        history_max_turns = cfg.history.max_turns,
        openai_key_configured,
        whatsapp_configured,
        webhook_signature_required = cfg.whatsapp_app_secret().is_some(),
        speech_configured = cfg.speech_credentials().is_some(),
        "config ok"
    );
    if !openai_key_configured {
        tracing::warn!("no openai api key; serve will refuse to start");
    }
    if !whatsapp_configured {
        tracing::warn!("whatsapp access_token/phone_number_id missing; serve will refuse to start");
    }
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, recipient: &str, message: &str) -> Result<()> {
    let (cfg, _) = RelaybotConfig::load_with_path(config_path).await?;
    let adapter = build_whatsapp(&cfg)?;
    adapter
        .send(recipient, OutboundMessage::text(message))
        .await?;
    tracing::info!(to = %recipient, "message sent");
    Ok(())
}

fn build_whatsapp(cfg: &RelaybotConfig) -> Result<WhatsAppCloudAdapter> {
    let adapter = WhatsAppCloudAdapter::new(&cfg.whatsapp.access_token, &cfg.whatsapp.phone_number_id)
        .context("whatsapp channel")?;
    Ok(match cfg.whatsapp.api_base.as_deref() {
        Some(base) if !base.trim().is_empty() => adapter.with_api_base(base),
        _ => adapter,
    })
}

fn build_speech(cfg: &RelaybotConfig) -> Result<Option<SpeechClient>> {
    let Some((api_key, voice_id)) = cfg.speech_credentials() else {
        return Ok(None);
    };
    let client = SpeechClient::new(api_key, voice_id)?.with_model(cfg.elevenlabs.model_id.clone());
    Ok(Some(client))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelaybotConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.server.bind_addr()?;
    let history_path = cfg.history.resolved_path()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        quiet_window_ms = cfg.debounce.quiet_window_ms,
        history_path = %history_path.display(),
        history_max_turns = cfg.history.max_turns,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        webhook_signature_required = cfg.whatsapp_app_secret().is_some(),
        speech_configured = cfg.speech_credentials().is_some(),
        "server configuration loaded"
    );
    if cfg.whatsapp.verify_token.trim().is_empty() {
        tracing::warn!("whatsapp.verify_token is empty; webhook subscription handshake will fail");
    }
    let listener = preflight_bind_listener(addr).await?;

    let llm = LlmClient::new(cfg.openai_api_key()?, &cfg.general.model)?;
    let channel: Arc<dyn ChannelAdapter> = Arc::new(build_whatsapp(&cfg)?);
    let history = Arc::new(SqliteHistoryStore::open(history_path, cfg.history.max_turns).await?);
    let coordinator = Arc::new(ReplyCoordinator::new(
        cfg.debounce.quiet_window(),
        history,
        Arc::new(OpenAiCompletion::new(llm.clone(), cfg.general.system_prompt.clone())),
        Arc::new(WhatsAppReplySink::new(channel.clone(), build_speech(&cfg)?)),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let gateway = Arc::new(Gateway::new(
        channel.clone(),
        llm,
        coordinator.clone(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(channel = channel.channel_id(), "gateway started");

    let state = Arc::new(AppState {
        started_at,
        verify_token: cfg.whatsapp.verify_token.trim().to_string(),
        app_secret: cfg.whatsapp_app_secret().map(ToOwned::to_owned),
        inbound_tx,
        coordinator: coordinator.clone(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relaybot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    coordinator.shutdown();
    tracing::info!("pending replies and running executions cancelled");

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("preflight bind failed for {addr}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
