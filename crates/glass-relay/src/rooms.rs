//! Shared-cockpit rooms over WebSocket. The creator is captain; everyone
//! who joins later is first officer.

use crate::RelayState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use glass_core::wire::{
    decode_message, encode_message, ActionPayload, ChatPayload, ErrorPayload,
    PilotChangePayload, RoomCreatedPayload, RoomEvent, RoomJoinedPayload, RoomRequest,
    WidgetStatePayload, DEFAULT_MAX_FRAME_BYTES,
};
use glass_core::{normalize_room_code, now_ms, session_code, CrewRole, Pilot, WidgetState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 256;

struct Member {
    conn_id: u64,
    pilot_name: String,
    role: CrewRole,
    sender: mpsc::Sender<Message>,
}

struct Room {
    members: Vec<Member>,
    state: WidgetState,
}

impl Room {
    fn pilots(&self) -> Vec<Pilot> {
        self.members
            .iter()
            .map(|m| Pilot {
                pilot_name: m.pilot_name.clone(),
                role: m.role,
            })
            .collect()
    }

    fn others(&self, conn_id: u64) -> Vec<mpsc::Sender<Message>> {
        self.members
            .iter()
            .filter(|m| m.conn_id != conn_id)
            .map(|m| m.sender.clone())
            .collect()
    }

    fn everyone(&self) -> Vec<mpsc::Sender<Message>> {
        self.members.iter().map(|m| m.sender.clone()).collect()
    }
}

/// Where one socket currently sits.
struct Seat {
    room_code: String,
    pilot_name: String,
}

struct Connection {
    conn_id: u64,
    sender: mpsc::Sender<Message>,
    seat: Option<Seat>,
}

/// Frames to hand out once the registry lock is released.
type Deliveries = Vec<(mpsc::Sender<Message>, Message)>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    conn_counter: AtomicU64,
}

fn frame(event: &RoomEvent) -> Option<Message> {
    match encode_message(event, DEFAULT_MAX_FRAME_BYTES) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(event = "room_encode_error", error = %err);
            None
        }
    }
}

fn fan_out(targets: Vec<mpsc::Sender<Message>>, event: &RoomEvent, out: &mut Deliveries) {
    if let Some(message) = frame(event) {
        out.extend(targets.into_iter().map(|tx| (tx, message.clone())));
    }
}

fn reply_error(conn: &Connection, message: &str, out: &mut Deliveries) {
    fan_out(
        vec![conn.sender.clone()],
        &RoomEvent::Error(ErrorPayload {
            message: message.to_string(),
        }),
        out,
    );
}

impl RoomRegistry {
    fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn handle(&self, conn: &mut Connection, request: RoomRequest) -> Deliveries {
        let mut out = Deliveries::new();
        match request {
            RoomRequest::CreateRoom(payload) => {
                self.vacate(conn, &mut out).await;
                let mut rooms = self.rooms.write().await;
                let room_code = loop {
                    let candidate = session_code(&uuid::Uuid::new_v4().simple().to_string());
                    if !rooms.contains_key(&candidate) {
                        break candidate;
                    }
                };
                rooms.insert(
                    room_code.clone(),
                    Room {
                        members: vec![Member {
                            conn_id: conn.conn_id,
                            pilot_name: payload.pilot_name.clone(),
                            role: CrewRole::Captain,
                            sender: conn.sender.clone(),
                        }],
                        state: WidgetState::new(),
                    },
                );
                conn.seat = Some(Seat {
                    room_code: room_code.clone(),
                    pilot_name: payload.pilot_name.clone(),
                });
                info!(event = "room_created", room_code = %room_code, conn_id = conn.conn_id);
                fan_out(
                    vec![conn.sender.clone()],
                    &RoomEvent::RoomCreated(RoomCreatedPayload {
                        room_code,
                        pilot_name: payload.pilot_name,
                        role: CrewRole::Captain,
                    }),
                    &mut out,
                );
            }
            RoomRequest::JoinRoom(payload) => {
                let room_code = normalize_room_code(&payload.room_code);
                self.vacate(conn, &mut out).await;
                let mut rooms = self.rooms.write().await;
                let Some(room) = rooms.get_mut(&room_code) else {
                    warn!(event = "room_not_found", room_code = %room_code, conn_id = conn.conn_id);
                    reply_error(conn, "Room not found", &mut out);
                    return out;
                };
                room.members.push(Member {
                    conn_id: conn.conn_id,
                    pilot_name: payload.pilot_name.clone(),
                    role: CrewRole::FirstOfficer,
                    sender: conn.sender.clone(),
                });
                conn.seat = Some(Seat {
                    room_code: room_code.clone(),
                    pilot_name: payload.pilot_name.clone(),
                });
                let pilots = room.pilots();
                info!(
                    event = "room_joined",
                    room_code = %room_code,
                    conn_id = conn.conn_id,
                    pilots = pilots.len()
                );
                fan_out(
                    vec![conn.sender.clone()],
                    &RoomEvent::RoomJoined(RoomJoinedPayload {
                        room_code,
                        pilot_name: payload.pilot_name.clone(),
                        role: CrewRole::FirstOfficer,
                        pilots: pilots.clone(),
                        state: room.state.clone(),
                    }),
                    &mut out,
                );
                fan_out(
                    room.others(conn.conn_id),
                    &RoomEvent::PilotJoined(PilotChangePayload {
                        pilot_name: payload.pilot_name,
                        role: Some(CrewRole::FirstOfficer),
                        pilots,
                    }),
                    &mut out,
                );
            }
            RoomRequest::LeaveRoom => self.vacate(conn, &mut out).await,
            RoomRequest::StateUpdate(payload) => {
                let Some(seat) = conn.seat.as_ref() else {
                    reply_error(conn, "Not in a room", &mut out);
                    return out;
                };
                let mut rooms = self.rooms.write().await;
                if let Some(room) = rooms.get_mut(&seat.room_code) {
                    room.state
                        .insert(payload.widget.clone(), payload.state.clone());
                    fan_out(
                        room.others(conn.conn_id),
                        &RoomEvent::StateUpdate(WidgetStatePayload {
                            from: Some(seat.pilot_name.clone()),
                            ..payload
                        }),
                        &mut out,
                    );
                }
            }
            RoomRequest::Action(payload) => {
                let Some(seat) = conn.seat.as_ref() else {
                    reply_error(conn, "Not in a room", &mut out);
                    return out;
                };
                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(&seat.room_code) {
                    fan_out(
                        room.others(conn.conn_id),
                        &RoomEvent::Action(ActionPayload {
                            from: Some(seat.pilot_name.clone()),
                            ..payload
                        }),
                        &mut out,
                    );
                }
            }
            RoomRequest::Chat(payload) => {
                let Some(seat) = conn.seat.as_ref() else {
                    reply_error(conn, "Not in a room", &mut out);
                    return out;
                };
                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(&seat.room_code) {
                    fan_out(
                        room.everyone(),
                        &RoomEvent::Chat(ChatPayload {
                            message: payload.message,
                            from: Some(seat.pilot_name.clone()),
                            timestamp: Some(now_ms()),
                        }),
                        &mut out,
                    );
                }
            }
        }
        out
    }

    /// Takes `conn` out of its room, announcing the departure and dropping
    /// the room once empty.
    async fn vacate(&self, conn: &mut Connection, out: &mut Deliveries) {
        let Some(seat) = conn.seat.take() else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&seat.room_code) else {
            return;
        };
        let role = room
            .members
            .iter()
            .find(|m| m.conn_id == conn.conn_id)
            .map(|m| m.role);
        room.members.retain(|m| m.conn_id != conn.conn_id);
        if room.members.is_empty() {
            rooms.remove(&seat.room_code);
            info!(event = "room_closed", room_code = %seat.room_code);
            return;
        }
        info!(event = "pilot_left", room_code = %seat.room_code, conn_id = conn.conn_id);
        fan_out(
            room.everyone(),
            &RoomEvent::PilotLeft(PilotChangePayload {
                pilot_name: seat.pilot_name,
                role,
                pilots: room.pilots(),
            }),
            out,
        );
    }
}

async fn deliver(deliveries: Deliveries) {
    for (tx, message) in deliveries {
        if tx.send(message).await.is_err() {
            debug!(event = "room_delivery_dropped");
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<RelayState>>,
) -> impl IntoResponse {
    if !relay.config.allow_lan && !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_socket(relay, socket, addr).await;
    })
}

async fn handle_socket(relay: Arc<RelayState>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let write_timeout = relay.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
    });

    let registry = &relay.rooms;
    let mut conn = Connection {
        conn_id: registry.next_conn_id(),
        sender: tx.clone(),
        seat: None,
    };
    info!(event = "client_connected", conn_id = conn.conn_id, remote = %remote);

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = conn.conn_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = conn.conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if relay.config.debug {
            debug!(event = "message_received", conn_id = conn.conn_id, raw = %String::from_utf8_lossy(&data));
        }
        let deliveries = match decode_message::<RoomRequest>(&data, DEFAULT_MAX_FRAME_BYTES) {
            Ok(request) => registry.handle(&mut conn, request).await,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn.conn_id, error = %err);
                let mut out = Deliveries::new();
                reply_error(&conn, "Invalid message", &mut out);
                out
            }
        };
        deliver(deliveries).await;
    }

    let mut out = Deliveries::new();
    registry.vacate(&mut conn, &mut out).await;
    deliver(out).await;
    info!(event = "client_disconnected", conn_id = conn.conn_id);
    drop(conn);
    drop(tx);
    let _ = write_task.await;
}
