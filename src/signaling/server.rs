use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use super::admission::Admission;
use super::client::ClientHandle;
use super::hub::HubHandle;
use super::messages::{ClientMessage, ServerMessage};
use super::registry::HubRegistry;
use super::types::{ClientId, OutboundMessage, RoomId, SignalingError, TransportAddr};
use crate::config::ServerConfig;

pub const DEFAULT_SIGNALING_PORT: u16 = 3479;

/// How long a disconnecting client's writer may keep flushing before it is aborted
const WRITER_GRACE: Duration = Duration::from_secs(1);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone)]
struct Shared {
    registry: HubRegistry,
    admission: Arc<dyn Admission>,
    config: Arc<ServerConfig>,
}

pub struct SignalingServer {
    listener: TcpListener,
    shared: Shared,
}

impl SignalingServer {
    /// Bind the listener; hubs are created lazily as clients join rooms.
    pub async fn bind(config: ServerConfig, admission: impl Admission) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Shared {
                registry: HubRegistry::new(config.hub.clone()),
                admission: Arc::new(admission),
                config: Arc::new(config),
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.shared.registry
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let shared = self.shared.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let mut joined: Option<RoomId> = None;
    let admission = &shared.admission;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        let Some((room_id, token)) = parse_room_path(uri.path(), uri.query()) else {
            return Err(reject(StatusCode::BAD_REQUEST, "expected /room/<room_id>"));
        };
        if !admission.admit(&room_id, token.as_deref()) {
            return Err(reject(StatusCode::UNAUTHORIZED, "admission refused"));
        }
        joined = Some(room_id);
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let room_id = joined.ok_or_else(|| SignalingError::Internal("handshake accepted without a room".to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let config = &shared.config;
    let client = Arc::new(ClientHandle::new(
        ClientId::generate(),
        TransportAddr::tcp(addr),
        config.outbound_capacity,
        config.overflow,
    ));
    let hub = join(&shared.registry, &room_id, &client).await?;

    info!("WebSocket connection from {} joined room {} as {}", addr, room_id, client.id());

    let outbound = client.outbound();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Ok(msg) = msg else { break };
                    if ws_tx.send(frame(msg)).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut ping_interval = tokio::time::interval(config.ping_interval);
    let mut writer_done = false;
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + config.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            _ = client.terminated() => {
                if client.hub_closed() {
                    info!("Room {} closed, disconnecting {}", room_id, addr);
                } else {
                    info!("Client {} closed by hub, disconnecting {}", client.id(), addr);
                }
                break;
            }

            _ = &mut send_task => {
                debug!("Writer for {} finished", addr);
                writer_done = true;
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &client, &hub).await {
                            warn!("Message handling error: {}", e);
                        }
                    }
                    Message::Binary(_) => {
                        debug!("Binary frame from {} refused", addr);
                        reply_error(&client, "binary frames are not supported");
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Err(e) = hub.unregister(client.clone()).await {
        debug!("Unregister of {} skipped: {}", client.id(), e);
    }

    // closed queue + no control sender: the writer drains what is left and exits
    client.close();
    drop(ctrl_tx);
    if !writer_done {
        finish_writer(send_task, WRITER_GRACE).await;
    }
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

/// Wait up to `grace` for the writer to flush and close the socket, then abort it.
async fn finish_writer(mut writer: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut writer).await.is_err() {
        warn!("Writer did not finish within {:?}, aborting", grace);
        writer.abort();
    }
}

/// Register with the room's hub, retrying once if that hub shut down between lookup and registration.
async fn join(
    registry: &HubRegistry,
    room_id: &RoomId,
    client: &Arc<ClientHandle>,
) -> Result<HubHandle, SignalingError> {
    let hub = registry.get_or_create(room_id);
    match hub.register(client.clone()).await {
        Ok(_) => Ok(hub),
        Err(SignalingError::HubClosed(_)) => {
            let hub = registry.get_or_create(room_id);
            hub.register(client.clone()).await?;
            Ok(hub)
        }
        Err(e) => Err(e),
    }
}

async fn handle_text_message(text: &str, client: &ClientHandle, hub: &HubHandle) -> Result<(), BoxError> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            reply_error(client, &format!("Invalid message: {}", e));
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::Relay { remote_id, payload } => {
            let relayed = ServerMessage::Relay {
                remote_id: client.id().clone(),
                payload,
            };
            hub.relay(remote_id, relayed.encode()?).await;
        }

        ClientMessage::RoomInfo => {
            let response = match hub.info().await {
                Some(info) => ServerMessage::RoomInfo(info),
                None => ServerMessage::Error {
                    message: "room is closing".to_string(),
                },
            };
            client.deliver(response.encode()?);
        }
    }

    Ok(())
}

fn reply_error(client: &ClientHandle, message: &str) {
    let err = ServerMessage::Error {
        message: message.to_string(),
    };
    match err.encode() {
        Ok(msg) => {
            client.deliver(msg);
        }
        Err(e) => warn!("Failed to encode error reply for {}: {}", client.id(), e),
    }
}

/// UTF-8 payloads go out as text frames, anything else as binary.
fn frame(msg: OutboundMessage) -> Message {
    let bytes = msg.into_inner();
    match Utf8Bytes::try_from(bytes.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(bytes),
    }
}

/// `/room/<room_id>[/...][?token=<token>]`
fn parse_room_path(path: &str, query: Option<&str>) -> Option<(RoomId, Option<String>)> {
    let room = path.strip_prefix("/room/")?.split('/').next().filter(|s| !s.is_empty())?;
    let token = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
        .map(str::to_owned);
    Some((RoomId::from(room), token))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
