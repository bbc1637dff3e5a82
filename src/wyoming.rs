//! # Wyoming Device Server
//!
//! TCP server speaking the length-framed device protocol to voice
//! satellites. One tokio task per client; within a client connection,
//! `describe` is answered immediately and a `transcribe` event opens a
//! recognition session that consumes audio events until `audio-stop`.
//!
//! The session layer is the same [`SessionController`] the WebSocket path
//! uses; only the codec differs. Events the device protocol cannot express
//! (VAD marks, run markers) are silently skipped by the codec.

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::wyoming as codec;
use crate::protocol::{InboundEvent, SessionEvent};
use crate::session::SessionController;
use crate::state::AppState;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accept loop; runs for the lifetime of the process.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let wyoming = state.get_config().wyoming;
    let listener = TcpListener::bind((wyoming.host.as_str(), wyoming.port)).await?;
    info!(
        "Wyoming server listening on {}:{}",
        wyoming.host, wyoming.port
    );

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Wyoming client connected: {}", peer);
        let state = state.clone();
        tokio::spawn(async move {
            match handle_client(socket, state).await {
                Ok(()) => debug!("Wyoming client {} disconnected", peer),
                Err(GatewayError::ClientDisconnected) => {
                    debug!("Wyoming client {} went away mid-session", peer)
                }
                Err(err) => warn!("Wyoming client {} error: {}", peer, err),
            }
        });
    }
}

async fn handle_client(socket: TcpStream, state: AppState) -> GatewayResult<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(frame) = codec::read_frame(&mut reader).await? {
        let Some(event) = codec::decode_frame(frame) else {
            continue;
        };

        match event {
            codec::DeviceEvent::Describe => {
                send_info(&mut writer, &state).await?;
            }
            codec::DeviceEvent::Transcribe { name, language } => {
                run_session(&mut reader, &mut writer, name, language, &state).await?;
            }
            other => {
                debug!("Ignoring {:?} outside a session", other);
            }
        }
    }
    Ok(())
}

/// One recognition session: admission, then audio events until stop.
async fn run_session(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    model: Option<String>,
    language: Option<String>,
    state: &AppState,
) -> GatewayResult<()> {
    let config = state.get_config();

    // Fail fast, before buffering any audio; the connection stays usable.
    let ticket = match state.admission.acquire() {
        Ok(ticket) => ticket,
        Err(err) => {
            warn!("Wyoming session rejected: {}", err);
            send_events(writer, &[SessionEvent::error(&err)]).await?;
            return Ok(());
        }
    };

    let mut controller = SessionController::new(
        Uuid::new_v4().to_string(),
        &config.audio,
        None,
        state.registry.clone(),
        ticket,
    );

    send_events(writer, &controller.begin()).await?;
    let events = controller
        .handle(InboundEvent::Begin {
            language,
            model,
        })
        .await?;
    send_events(writer, &events).await?;

    while !controller.is_terminal() {
        let Some(frame) = codec::read_frame(reader).await? else {
            return Err(GatewayError::ClientDisconnected);
        };
        let Some(event) = codec::decode_frame(frame) else {
            continue;
        };

        if event == codec::DeviceEvent::Describe {
            send_info(writer, state).await?;
            continue;
        }

        let Some(inbound) = codec::to_inbound(event) else {
            continue;
        };
        let events = controller.handle(inbound).await?;
        send_events(writer, &events).await?;
    }

    Ok(())
}

async fn send_info(writer: &mut OwnedWriteHalf, state: &AppState) -> GatewayResult<()> {
    codec::write_frame(
        writer,
        "info",
        codec::info_data(state.registry.capabilities()),
        &[],
    )
    .await
}

/// Encode and send the events the device protocol can represent.
async fn send_events(writer: &mut OwnedWriteHalf, events: &[SessionEvent]) -> GatewayResult<()> {
    for event in events {
        if let Some((event_type, data)) = codec::encode_event(event) {
            codec::write_frame(writer, event_type, data, &[]).await?;
        }
    }
    Ok(())
}
