//! # WebSocket Relay Endpoint
//!
//! Accepts client connections on `/` and `/ws` and binds each one to exactly one
//! [`Session`].
//!
//! ## Connection Lifecycle:
//! 1. **Admission**: the upgrade is refused with 503 while the relay is full
//! 2. **Start**: the actor spawns the session task and subscribes to its relay queue
//! 3. **Inbound**: every Text or Binary frame is classified and queued to the session
//! 4. **Outbound**: relay frames are written one at a time, in queue order
//! 5. **Close**: the session's close request (1000 or 1011) or the client going away
//!
//! ## Actor Model:
//! The actor only moves bytes. It never awaits the session or the provider, so a
//! slow engine cannot stall frame handling or heartbeats.

use crate::error::{AppError, AppResult};
use crate::protocol::{classify, InboundMessage};
use crate::relay::{CloseKind, EventRelay, RelayFrame};
use crate::session::{Session, SessionSettings, SessionStats};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A reserved place in the relay's session count, given back on drop.
///
/// Travels with the session rather than the connection: it is held until the
/// session task has finished stopping the provider, and also given back when an
/// upgrade response is dropped before the actor ever starts.
struct SessionSlot(web::Data<AppState>);

impl SessionSlot {
    fn acquire(state: &web::Data<AppState>) -> Option<Self> {
        state.try_admit_session().then(|| SessionSlot(state.clone()))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.release_session();
    }
}

/// Session parts created with the actor and handed to the runtime in `started`.
struct PendingSession {
    session: Session,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    frames: mpsc::Receiver<RelayFrame>,
    slot: SessionSlot,
}

fn spawn_session(
    session: Session,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    slot: SessionSlot,
) -> JoinHandle<SessionStats> {
    tokio::spawn(async move {
        let stats = session.run(inbound).await;
        drop(slot);
        stats
    })
}

pub struct RelaySocket {
    session_id: Uuid,
    peer: String,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
    pending: Option<PendingSession>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl RelaySocket {
    fn new(state: &AppState, slot: SessionSlot, peer: String) -> Self {
        let config = &state.config;
        let session_id = Uuid::new_v4();

        let (relay, frames) = EventRelay::channel(session_id, config.relay.event_queue_capacity);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let session = Session::new(
            session_id,
            state.provider.clone(),
            SessionSettings::from_config(config),
            relay,
        );

        Self {
            session_id,
            peer,
            inbound: Some(inbound_tx),
            pending: Some(PendingSession {
                session,
                inbound,
                frames,
                slot,
            }),
            last_heartbeat: Instant::now(),
            heartbeat_interval: config.relay.heartbeat_interval(),
            client_timeout: config.relay.client_timeout(),
        }
    }

    fn forward(&mut self, payload: Bytes) {
        let Some(inbound) = &self.inbound else {
            return;
        };
        if inbound.send(classify(payload)).is_err() {
            debug!(session_id = %self.session_id, "Session already finished, inbound message dropped");
            self.inbound = None;
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.heartbeat_interval.is_zero() {
            return;
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.last_heartbeat.elapsed() > act.client_timeout {
                warn!(session_id = %act.session_id, peer = %act.peer, "Client heartbeat timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, peer = %self.peer, "WebSocket connection opened");

        if let Some(PendingSession {
            session,
            inbound,
            frames,
            slot,
        }) = self.pending.take()
        {
            spawn_session(session, inbound, slot);
            ctx.add_stream(ReceiverStream::new(frames));
        }

        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender is what tells the session the client is gone.
        self.inbound = None;
        info!(session_id = %self.session_id, peer = %self.peer, "WebSocket connection closed");
    }
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.forward(text.into_bytes()),
            Ok(ws::Message::Binary(data)) => self.forward(data),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, reason = ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Unexpected continuation frame ignored");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Frames queued by the session.
impl StreamHandler<RelayFrame> for RelaySocket {
    fn handle(&mut self, frame: RelayFrame, ctx: &mut Self::Context) {
        match frame {
            RelayFrame::Event(event) => match event.to_json() {
                Ok(json) => ctx.text(json),
                Err(err) => error!(session_id = %self.session_id, error = %err, "Failed to encode event"),
            },
            RelayFrame::Close(kind) => {
                let code = match kind {
                    CloseKind::Completed => ws::CloseCode::Normal,
                    CloseKind::Faulted => ws::CloseCode::Error,
                };
                ctx.close(Some(code.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Session relay ended");
        ctx.stop();
    }
}

/// Upgrade handler for `/` and `/ws`.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();

    let Some(slot) = SessionSlot::acquire(&state) else {
        let max = state.config.relay.max_concurrent_sessions;
        warn!(peer = %peer, max_sessions = max, "Connection refused, relay is full");
        return Err(AppError::ServiceUnavailable(format!(
            "relay is at capacity ({} sessions)",
            max
        )));
    };

    info!(peer = %peer, active_sessions = state.active_sessions(), "Connection admitted");
    let actor = RelaySocket::new(&state, slot, peer);
    let response = ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(state.config.relay.max_frame_bytes)
        .start()?;
    Ok(response)
}
