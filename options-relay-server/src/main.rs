/// Newline delimited JSON signal and entry timing listener.
mod intake;

/// ThetaData terminal [`UpstreamSource`].
mod theta;

use crate::{
    intake::SignalIntake,
    theta::{ThetaConfig, ThetaUpstream},
};
use futures::{SinkExt, StreamExt};
use options_relay::{
    AnalysisQueue, BroadcastScheduler, Frame, PauseSwitch, QuoteBus, RelayConfig, SessionManager,
    SharedContext, StaticCredentials, SubscriptionRegistry, Transport, UpstreamSource,
    analysis::CompositeScorer,
    auth::session_token_from_cookie,
    market_hours::{Clock, SystemClock},
    upstream::simulated::SimulatedUpstream,
};
use smol_str::SmolStr;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message, Utf8Bytes,
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let json_logs = std::env::var("RELAY_LOG_JSON").is_ok_and(|value| value == "1");
    init_logging(json_logs);

    info!("Starting options relay server");

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            std::process::exit(1);
        }
    };
    let bus = QuoteBus::new(config.bus_capacity);

    let upstream_kind = std::env::var("RELAY_UPSTREAM").unwrap_or_else(|_| "theta".to_string());
    let upstream: Arc<dyn UpstreamSource> = match upstream_kind.as_str() {
        "simulated" => {
            info!("using simulated upstream");
            let upstream = Arc::new(SimulatedUpstream::new(bus.clone()));
            upstream.spawn_feed(Duration::from_secs(1));
            upstream
        }
        _ => {
            let theta = match ThetaConfig::from_env() {
                Ok(theta) => theta,
                Err(error) => {
                    error!(%error, "THETA_HTTP_URL is not a valid URL");
                    std::process::exit(1);
                }
            };

            info!(http_url = %theta.http_url, ws_url = %theta.ws_url, "using ThetaData terminal upstream");
            match ThetaUpstream::connect(theta, bus.clone()) {
                Ok((upstream, _stream_task)) => upstream,
                Err(error) => {
                    error!(%error, "failed to build ThetaData client");
                    std::process::exit(1);
                }
            }
        }
    };

    let credentials = match std::env::var("RELAY_CREDENTIALS_FILE") {
        Ok(path) => load_credentials(&path),
        Err(_) => {
            warn!("RELAY_CREDENTIALS_FILE not set, no client can authenticate");
            StaticCredentials::new()
        }
    };
    info!(tokens = credentials.len(), "credentials loaded");

    let paused = std::env::var("RELAY_PAUSED").is_ok_and(|value| value == "1");
    let context = Arc::new(SharedContext::new(
        config.default_instrument.clone(),
        Arc::new(PauseSwitch::new(paused)),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let analysis = config.analysis;

    let manager = SessionManager::new(
        config,
        context,
        SubscriptionRegistry::new(upstream.clone()),
        upstream.clone(),
        Arc::new(credentials),
        bus,
    );

    manager.spawn_reaper();
    manager.spawn_presence();
    manager.spawn_stats_logger();
    BroadcastScheduler::new(manager.clone(), clock.clone()).spawn();

    let queue = AnalysisQueue::new(
        analysis,
        upstream,
        Arc::new(CompositeScorer),
        clock.clone(),
        manager.clone(),
    );

    // Signal intake
    let signal_addr =
        std::env::var("RELAY_SIGNAL_ADDR").unwrap_or_else(|_| "127.0.0.1:9002".to_string());
    let signal_listener = TcpListener::bind(&signal_addr)
        .await
        .expect("Failed to bind signal intake");
    info!("Signal intake listening on {}", signal_addr);
    tokio::spawn(SignalIntake::new(queue, manager.clone(), clock).serve(signal_listener));

    // WebSocket server
    let addr = std::env::var("RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:9001".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind WebSocket server");
    info!("WebSocket server listening on {}", addr);

    let server = tokio::spawn(async move {
        while let Ok((stream, peer_addr)) = listener.accept().await {
            info!("New connection from {}", peer_addr);
            tokio::spawn(handle_client(stream, peer_addr, manager.clone()));
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = server => error!("WebSocket server stopped accepting connections"),
    }
}

/// Initialise the global tracing subscriber, `RUST_LOG` driven with an `info` default.
fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init()
    }
}

fn load_credentials(path: &str) -> StaticCredentials {
    match std::fs::read_to_string(path)
        .map_err(|error| error.to_string())
        .and_then(|json| StaticCredentials::from_json(&json).map_err(|error| error.to_string()))
    {
        Ok(credentials) => credentials,
        Err(error) => {
            warn!(%path, %error, "failed to load credentials, no client can authenticate");
            StaticCredentials::new()
        }
    }
}

async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, manager: Arc<SessionManager>) {
    let mut cookie = None;
    let capture_cookie = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        cookie = request
            .headers()
            .get("cookie")
            .and_then(|value| value.to_str().ok())
            .and_then(session_token_from_cookie)
            .map(str::to_string);
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, capture_cookie).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    debug!(%peer_addr, has_cookie = cookie.is_some(), "WebSocket handshake completed");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (transport, mut frames) = Transport::channel(manager.config().outbound_capacity);
    let id = manager
        .open(transport, cookie, Some(SmolStr::new(peer_addr.ip().to_string())))
        .await;

    // Drain the session's outbound queue onto the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                Frame::Message(message) => {
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(error) => {
                            warn!(%error, kind = message.kind(), "failed to serialise outbound message");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Frame::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static(reason),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let recv_manager = manager.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => recv_manager.handle_message(id, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.close(id).await;
    info!("Client {} disconnected", peer_addr);
}
