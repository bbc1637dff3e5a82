//! # Single-Shot Transcription Handler
//!
//! `POST /transcribe`: multipart audio body in, JSON transcript out. The
//! whole request runs inside one admission ticket, acquired before the body
//! is read so an overloaded server rejects uploads without buffering them.
//!
//! ## Request:
//! - multipart field `audio` (or `file`): the audio payload, any container
//!   ffmpeg can decode
//! - optional `X-Language` header: ISO 639-1 transcription hint
//! - optional `X-Model` header: model override, hot-swapped before use
//!
//! ## Response:
//! `{text, language, segments, processing_time}` plus `confidence` when the
//! engine reports one.

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use std::time::Instant;
use tracing::{debug, info};

pub async fn transcribe(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let started = Instant::now();

    // Fail fast: no body processing before admission.
    let _ticket = state.admission.acquire()?;

    let language = header_value(&req, "X-Language");
    let model = header_value(&req, "X-Model");

    let raw = read_audio_field(payload).await?;
    debug!("Received {} byte upload", raw.len());

    let pcm = state.normalizer.normalize(&raw).await?;

    if let Some(model) = &model {
        state.registry.ensure_loaded(model).await?;
    }

    let result = state.registry.transcribe(&pcm, language.as_deref()).await?;
    let processing_time = started.elapsed().as_secs_f64();

    info!(
        "Transcribed {} byte upload to {} chars in {:.2}s",
        raw.len(),
        result.text.len(),
        processing_time
    );

    // The result serializes as-is; processing_time is request-level data.
    let mut body = serde_json::to_value(&result)?;
    body["processing_time"] = serde_json::json!(processing_time);
    Ok(HttpResponse::Ok().json(body))
}

/// Optional string header, ignoring non-UTF-8 values.
fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Collect the bytes of the first `audio`/`file` multipart field.
async fn read_audio_field(mut payload: Multipart) -> GatewayResult<Vec<u8>> {
    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| GatewayError::BadRequest(format!("multipart error: {}", e)))?;

        let name = field.name().unwrap_or("").to_string();
        if name != "audio" && name != "file" {
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::BadRequest(format!("upload read error: {}", e)))?;
            bytes.extend_from_slice(&chunk);
        }
        return Ok(bytes);
    }

    Err(GatewayError::BadRequest(
        "missing multipart field 'audio'".to_string(),
    ))
}
