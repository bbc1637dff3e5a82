//! # WebSocket Streaming Transport
//!
//! Hosts the interactive codec on `GET /stream/{session_id}`. Each
//! connection is one Actix actor; the session state machine runs in a
//! companion tokio task (the driver) fed through a channel, so slow
//! transcription never blocks the actor's mailbox and inbound events are
//! processed strictly in arrival order.
//!
//! ## Wire Protocol:
//! - **Client → Server**: binary frames — handler-tag byte + PCM; a
//!   length-1 frame ends the stream
//! - **Server → Client**: JSON event frames (`run-start`, `stt-start`,
//!   `stt-vad-start`/`-end`, `stt-end`, `error`, `run-end`)
//!
//! The admission ticket is acquired in the route handler before the
//! protocol upgrade, so a saturated gateway answers with 503 instead of
//! accepting a doomed socket.

use crate::admission::AdmissionTicket;
use crate::error::GatewayError;
use crate::protocol::interactive::{decode_binary_frame, encode_event_json};
use crate::protocol::InboundEvent;
use crate::session::SessionController;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Interval between server heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Client considered gone after this long without any traffic.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket actor for one streaming session.
pub struct StreamSocket {
    session_id: String,
    language: Option<String>,
    state: AppState,
    /// Ticket handed to the session controller when the driver starts.
    ticket: Option<AdmissionTicket>,
    /// Inbound events flow to the driver through this channel; dropping it
    /// ends the driver loop.
    inbound: Option<mpsc::UnboundedSender<InboundEvent>>,
    /// Aborts an in-flight transcription on disconnect.
    cancel: Option<Arc<Notify>>,
    last_heartbeat: Instant,
}

impl StreamSocket {
    pub fn new(
        session_id: String,
        language: Option<String>,
        state: AppState,
        ticket: AdmissionTicket,
    ) -> Self {
        Self {
            session_id,
            language,
            state,
            ticket: Some(ticket),
            inbound: None,
            cancel: None,
            last_heartbeat: Instant::now(),
        }
    }
}

/// Outbound JSON frame for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Driver finished; close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSession;

impl Actor for StreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket session {} connected", self.session_id);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    "WebSocket session {} heartbeat timeout, closing",
                    act.session_id
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        // The ticket is present exactly once, on the first start.
        let Some(ticket) = self.ticket.take() else {
            error!("WebSocket session {} started twice", self.session_id);
            ctx.stop();
            return;
        };

        let controller = SessionController::new(
            self.session_id.clone(),
            &self.state.get_config().audio,
            self.language.clone(),
            Arc::clone(&self.state.registry),
            ticket,
        );
        self.cancel = Some(controller.cancel_handle());

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = Some(tx);

        let addr = ctx.address();
        tokio::spawn(drive_session(controller, rx, addr));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket session {} disconnected", self.session_id);

        // Wake any in-flight transcription so it stops doing wasted work,
        // then close the channel so the driver ends and the ticket drops.
        if let Some(cancel) = &self.cancel {
            cancel.notify_one();
        }
        self.inbound.take();
    }
}

/// Sequential event pump: owns the controller for the whole session.
async fn drive_session(
    mut controller: SessionController,
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    addr: Addr<StreamSocket>,
) {
    for event in controller.begin() {
        addr.do_send(SendText(encode_event_json(&event)));
    }

    while let Some(inbound) = rx.recv().await {
        match controller.handle(inbound).await {
            Ok(events) => {
                for event in &events {
                    addr.do_send(SendText(encode_event_json(event)));
                }
                if controller.is_terminal() {
                    addr.do_send(CloseSession);
                    break;
                }
            }
            Err(GatewayError::ClientDisconnected) => {
                debug!(
                    "Session {} transcription cancelled by disconnect",
                    controller.session_id()
                );
                break;
            }
            Err(err) => {
                error!("Session {} terminated: {}", controller.session_id(), err);
                addr.do_send(CloseSession);
                break;
            }
        }
    }

    let lifetime = chrono::Utc::now().signed_duration_since(controller.started_at());
    debug!(
        "Session {} driver finished after {:.1}s",
        controller.session_id(),
        lifetime.num_milliseconds() as f64 / 1000.0
    );
    // Controller drops here, releasing the admission ticket.
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                match decode_binary_frame(&data) {
                    Ok(event) => {
                        if let Some(inbound) = &self.inbound {
                            // A closed channel means the driver already
                            // finished; the close frame is on its way.
                            let _ = inbound.send(event);
                        }
                    }
                    Err(err) => {
                        ctx.text(encode_event_json(&crate::protocol::SessionEvent::error(&err)));
                    }
                }
            }
            Ok(ws::Message::Text(_)) => {
                warn!(
                    "WebSocket session {} sent a text frame; audio must be binary",
                    self.session_id
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(
                    "WebSocket session {} closed by client: {:?}",
                    self.session_id, reason
                );
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(
                    "WebSocket session {} protocol error: {}",
                    self.session_id, err
                );
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for StreamSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSession> for StreamSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSession, ctx: &mut Self::Context) {
        ctx.close(None);
        ctx.stop();
    }
}

/// GET /stream/{session_id} — upgrade to the interactive streaming protocol.
///
/// Admission happens before the upgrade: a rejected session gets the plain
/// HTTP 503 with its machine-readable code, not a doomed WebSocket.
pub async fn stream_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    let language = req
        .headers()
        .get("X-Language")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let ticket = match state.admission.acquire() {
        Ok(ticket) => ticket,
        Err(err) => {
            warn!("WebSocket session {} rejected: {}", session_id, err);
            return Ok(err.error_response());
        }
    };

    let socket = StreamSocket::new(session_id, language, state.get_ref().clone(), ticket);
    ws::start(socket, &req, stream)
}
