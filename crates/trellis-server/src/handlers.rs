//! Connection handlers for the Trellis server.
//!
//! Each WebSocket connection owns a [`LocalSubscriber`] whose queue is drained
//! into the socket. Inbound frames are mapped onto [`Service`] calls, and the
//! connection is disconnected from the service when the socket goes away.

use crate::config::{Config, StorageKind};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use trellis_core::message::generate_message_id;
use trellis_core::{
    AllowAll, Authorizer, LocalSubscriber, MemoryStorage, NoopNotifier, NoopStorage, Request,
    Service, ServiceError, SharedSubscriber, StaticKeys, Storage, SubscribeOptions, Trie,
};
use trellis_protocol::{negotiate, Frame, FrameCodec};

type Sink = SplitSink<WebSocket, WsMessage>;

/// Shared server state.
pub struct AppState {
    /// The pub/sub service.
    pub service: Service,
    /// Frame codec bounded by the configured message size.
    pub codec: FrameCodec,
    /// Server configuration.
    pub config: Config,
    /// In-memory retained messages, swept periodically.
    pub retained: Option<Arc<MemoryStorage>>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let auth: Arc<dyn Authorizer> = if config.keys.is_empty() {
            warn!("No keys configured, every request is authorized");
            Arc::new(AllowAll::default())
        } else {
            info!(keys = config.keys.len(), "Using static keys");
            Arc::new(StaticKeys::new(config.keys.iter().cloned()))
        };

        let retained = match config.storage.kind {
            StorageKind::None => None,
            StorageKind::Memory => Some(Arc::new(MemoryStorage::new(config.storage.capacity))),
        };
        let store: Arc<dyn Storage> = match &retained {
            Some(memory) => memory.clone(),
            None => Arc::new(NoopStorage),
        };

        let service = Service::with_config(
            auth,
            store,
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
            config.service(),
        );

        Self {
            service,
            codec: FrameCodec::new(config.limits.max_message_size),
            config,
            retained,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    if let Some(retained) = state.retained.clone() {
        let every = Duration::from_millis(config.storage.purge_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                retained.purge_expired();
            }
        });
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Trellis server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscriptions": state.service.trie().count(),
        "presence_channels": state.service.presence().channel_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Wait for the client's `connect` frame.
async fn handshake(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
) -> Result<Option<String>, Frame> {
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let first = tokio::time::timeout(timeout, receiver.next()).await;

    let data = match first {
        Ok(Some(Ok(WsMessage::Binary(data)))) => data,
        Ok(Some(Ok(WsMessage::Text(text)))) => text.into_bytes(),
        Err(_) => return Err(Frame::error(0, 408, "Handshake timed out")),
        _ => return Err(Frame::error(0, 400, "Expected connect frame")),
    };

    match state.codec.decode(&data) {
        Ok(Frame::Connect { version, username }) => match negotiate(version) {
            Ok(_) => Ok(username),
            Err(e) => Err(Frame::error(0, 505, e.to_string())),
        },
        Ok(other) => Err(Frame::error(
            other.request_id().unwrap_or(0),
            400,
            "Expected connect frame",
        )),
        Err(e) => Err(Frame::error(0, 400, e.to_string())),
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    let username = match handshake(&mut receiver, &state).await {
        Ok(username) => username,
        Err(refusal) => {
            debug!(reason = ?refusal, "Handshake refused");
            let _ = send_frame(&mut sender, &state.codec, &refusal).await;
            return;
        }
    };

    let connection_id = format!("conn-{:x}", generate_message_id());
    let (subscriber, mut outbound) = LocalSubscriber::new(
        connection_id.as_str(),
        username,
        state.config.limits.delivery_capacity,
    );
    let subscriber: SharedSubscriber = subscriber;

    let connected = Frame::connected(&connection_id, state.config.heartbeat.interval_ms as u32);
    if send_frame(&mut sender, &state.codec, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }
    debug!(connection = %connection_id, "WebSocket connected");

    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut idle_check = tokio::time::interval(timeout);
    let mut last_seen = Instant::now();
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(message) = outbound.recv() => {
                let frame = Frame::message(message.channel.as_str(), message.payload.to_vec());
                if send_frame(&mut sender, &state.codec, &frame).await.is_err() {
                    break;
                }
            }

            _ = idle_check.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(connection = %connection_id, "Connection idle, closing");
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }

                if drain_frames(&mut read_buffer, &subscriber, &state, &mut sender).await.is_err() {
                    break;
                }
            }
        }
    }

    let removed = state.service.disconnect(&*subscriber);
    metrics::set_active_subscriptions(state.service.trie().count());
    debug!(connection = %connection_id, removed, "WebSocket disconnected");
}

/// Decode and handle every complete frame in the read buffer.
///
/// Fails if the socket is gone or the peer sent an undecodable frame.
async fn drain_frames(
    read_buffer: &mut BytesMut,
    subscriber: &SharedSubscriber,
    state: &AppState,
    sender: &mut Sink,
) -> Result<()> {
    loop {
        let frame = match state.codec.decode_from(read_buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection = %subscriber.id(), error = %e, "Protocol error");
                metrics::record_error("protocol");
                send_frame(sender, &state.codec, &Frame::error(0, 400, e.to_string())).await?;
                return Err(e.into());
            }
        };

        let start = Instant::now();
        if let Some(response) = handle_frame(frame, subscriber, state).await {
            send_frame(sender, &state.codec, &response).await?;
        }
        metrics::record_latency(start.elapsed().as_secs_f64());
    }
}

fn error_frame(id: u16, error: &ServiceError, kind: &'static str) -> Frame {
    metrics::record_error(kind);
    Frame::error(id, error.code(), error.to_string())
}

/// Handle a decoded frame, returning the reply if there is one.
async fn handle_frame(frame: Frame, subscriber: &SharedSubscriber, state: &AppState) -> Option<Frame> {
    let service = &state.service;
    match frame {
        Frame::Subscribe {
            id,
            key,
            channel,
            status,
            last,
        } => {
            let options = SubscribeOptions {
                status,
                last: last as usize,
                request: id,
            };
            let reply = match service.subscribe(subscriber, &key, &channel, options) {
                Ok(subscription) => {
                    metrics::record_subscription();
                    match subscription.status.and_then(|n| n.encode()) {
                        Some(roster) => Frame::response(id, roster.to_vec()),
                        None => Frame::ack(id),
                    }
                }
                Err(e) => {
                    warn!(connection = %subscriber.id(), channel = %channel, error = %e, "Subscribe failed");
                    error_frame(id, &e, "subscribe")
                }
            };
            metrics::set_active_subscriptions(service.trie().count());
            Some(reply)
        }

        Frame::Unsubscribe { id, key, channel } => {
            let reply = match service.unsubscribe(subscriber, &key, &channel) {
                Ok(_) => Frame::ack(id),
                Err(e) => error_frame(id, &e, "unsubscribe"),
            };
            metrics::set_active_subscriptions(service.trie().count());
            Some(reply)
        }

        Frame::Publish {
            id,
            key,
            channel,
            ttl,
            payload,
        } => {
            metrics::record_message(payload.len(), "publish");
            let ttl = ttl.map(|secs| Duration::from_secs(u64::from(secs)));
            match service.publish(&key, &channel, payload, ttl) {
                Ok(report) => {
                    metrics::record_publish(&report);
                    debug!(connection = %subscriber.id(), channel = %channel, delivered = report.delivered, "Published");
                    id.map(Frame::ack)
                }
                Err(e) => {
                    warn!(connection = %subscriber.id(), channel = %channel, error = %e, "Publish failed");
                    Some(error_frame(id.unwrap_or(0), &e, "publish"))
                }
            }
        }

        Frame::Request { id, kind, payload } => {
            metrics::record_request(kind);
            let request = Request {
                id,
                subscriber: subscriber.clone(),
                payload: Bytes::from(payload),
            };
            match service.handle(kind, request).await {
                Ok(response) => Some(Frame::response(id, response.to_vec())),
                Err(e) => Some(error_frame(id, &e, "request")),
            }
        }

        Frame::Ping => Some(Frame::Pong),

        Frame::Pong => None,

        Frame::Connect { .. } => {
            debug!(connection = %subscriber.id(), "Connect frame on established connection");
            None
        }

        other => {
            warn!(connection = %subscriber.id(), frame_type = ?other.frame_type(), "Unexpected frame type");
            Some(Frame::error(
                other.request_id().unwrap_or(0),
                400,
                "Unexpected frame type",
            ))
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut Sink, codec: &FrameCodec, frame: &Frame) -> Result<()> {
    let data = codec.encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(WsMessage::Binary(data.to_vec())).await?;
    Ok(())
}
