//! # WebSocket Audio Ingestion Handler
//!
//! The I/O shell around [`IngestionSession`]. Devices connect to
//! `server.audio_path` (default `/ws/audio?device=<id>`), send a JSON `start`,
//! then binary PCM chunks; the server answers with JSON control messages.
//!
//! ## Actor Model:
//! Each connection is one actix actor owning its session. Frames are handled
//! one at a time on the actor; transcription runs on the shared
//! [`TranscriptionPool`](crate::transcription::TranscriptionPool) and its
//! result comes back as a [`TranscriptionDone`] message. A result for an
//! actor that has already stopped is dropped by the mailbox.
//!
//! ## Connection Rules:
//! - Wrong path: the upgrade completes, then the socket closes with 1008
//! - Session limit reached: HTTP 503 before upgrading
//! - Heartbeat: ping every `heartbeat_interval_secs`, drop the peer after
//!   `client_timeout_secs` without any inbound frame

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::session::{IngestionSession, SessionAction, DEFAULT_DEVICE};
use crate::error::AppError;
use crate::state::AppState;
use crate::transcription::worker::TranscriptOutcome;
use crate::wire::control::ControlMessage;

/// A finished transcription, delivered back to the connection that asked for it.
#[derive(Message)]
#[rtype(result = "()")]
pub struct TranscriptionDone {
    pub turn_id: u64,
    pub outcome: TranscriptOutcome,
}

pub struct AudioIngestSocket {
    /// Correlates the log lines of one connection
    id: Uuid,

    state: AppState,

    device: String,

    /// `None` for a connection that is only upgraded to be rejected
    session: Option<IngestionSession>,

    /// Close reason sent right after the upgrade, for rejected connections
    rejection: Option<String>,

    last_heartbeat: Instant,
}

impl AudioIngestSocket {
    pub fn new(state: AppState, device: String, session: IngestionSession) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            device,
            session: Some(session),
            rejection: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// An actor that closes the connection with a policy violation as soon
    /// as it starts.
    pub fn rejecting(state: AppState, device: String, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            device,
            session: None,
            rejection: Some(reason),
            last_heartbeat: Instant::now(),
        }
    }

    /// Perform session actions in the order they were produced.
    fn execute(&mut self, actions: Vec<SessionAction>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                SessionAction::Send(message) => self.send_control(message, ctx),
                SessionAction::Transcribe { turn_id, path } => {
                    let pool = self.state.pool.clone();
                    let addr = ctx.address();
                    tokio::spawn(async move {
                        let outcome = pool.transcribe(path).await;
                        addr.do_send(TranscriptionDone { turn_id, outcome });
                    });
                }
                SessionAction::Close => {
                    ctx.close(None);
                    ctx.stop();
                }
            }
        }
    }

    fn send_control(&self, message: ControlMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match &message {
            ControlMessage::AsrStatus { .. } => self.state.record_turn(true),
            ControlMessage::AsrSkipped { .. } => self.state.record_turn(false),
            ControlMessage::BargeIn { .. } => self.state.record_barge_in(),
            _ => {}
        }

        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => error!(device = %self.device, kind = message.kind(), error = %e, "cannot encode control message"),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let performance = &self.state.config.performance;
        let interval = Duration::from_secs(performance.heartbeat_interval_secs);
        let timeout = Duration::from_secs(performance.client_timeout_secs);

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(device = %act.device, "heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

impl Actor for AudioIngestSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(reason) = self.rejection.take() {
            warn!(device = %self.device, %reason, "closing connection with policy violation");
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Policy,
                description: Some(reason),
            }));
            ctx.stop();
            return;
        }

        info!(device = %self.device, connection = %self.id, "device connected");
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut session) = self.session.take() {
            let summary = session.finish();
            self.state.close_session();
            info!(
                device = %self.device,
                connection = %self.id,
                bytes = summary.bytes_ingested,
                turns_detected = summary.turns_detected,
                turns_accepted = summary.turns_accepted,
                "device disconnected"
            );
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioIngestSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                if let Some(session) = self.session.as_mut() {
                    let actions = session.handle_text(&text);
                    self.execute(actions, ctx);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                if let Some(session) = self.session.as_mut() {
                    self.state.record_bytes(data.len());
                    let actions = session.handle_audio(&data);
                    self.execute(actions, ctx);
                }
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(device = %self.device, ?reason, "client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(device = %self.device, "ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(device = %self.device, error = %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<TranscriptionDone> for AudioIngestSocket {
    type Result = ();

    fn handle(&mut self, msg: TranscriptionDone, ctx: &mut Self::Context) {
        self.state.record_transcription(msg.outcome.error.is_some());
        if let Some(session) = self.session.as_mut() {
            let actions = session.complete_transcription(msg.turn_id, &msg.outcome.text);
            self.execute(actions, ctx);
        }
    }
}

/// Device identifier from the `device` query parameter.
pub fn device_from_query(query: &str) -> String {
    web::Query::<HashMap<String, String>>::from_query(query)
        .ok()
        .and_then(|q| q.get("device").map(|d| d.trim().to_string()))
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
}

/// Upgrade handler for every path not claimed by an HTTP route.
///
/// ## HTTP to WebSocket Upgrade:
/// The handshake is validated first so that nothing is claimed for requests
/// that are not WebSocket upgrades at all.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let state = state.get_ref().clone();
    let path_ok = req.path() == state.config.server.audio_path;

    let mut response = match ws::handshake(&req) {
        Ok(response) => response,
        Err(e) if path_ok => return Err(e.into()),
        Err(_) => return Err(AppError::NotFound(format!("no route for {}", req.path())).into()),
    };

    let device = device_from_query(req.query_string());
    info!(device = %device, peer = ?req.connection_info().peer_addr(), path = req.path(), "upgrade requested");

    if !path_ok {
        let reason = format!("unsupported path {}", req.path());
        let actor = AudioIngestSocket::rejecting(state, device, reason);
        return Ok(response.streaming(ws::WebsocketContext::create(actor, stream)));
    }

    if !state.try_open_session() {
        warn!(device = %device, "session limit reached, refusing connection");
        return Err(AppError::ServiceUnavailable("too many active audio sessions".into()).into());
    }

    let session = match IngestionSession::open(&device, state.session_config(), state.responder.clone()) {
        Ok(session) => session,
        Err(e) => {
            state.close_session();
            error!(device = %device, error = %e, "cannot open session");
            return Err(AppError::from(e).into());
        }
    };

    let actor = AudioIngestSocket::new(state, device, session);
    Ok(response.streaming(ws::WebsocketContext::create(actor, stream)))
}
