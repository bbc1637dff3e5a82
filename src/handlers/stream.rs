//! # Stream Negotiation Handler
//!
//! `POST /stream`: tells a client what to send over the WebSocket that
//! follows — chunk sizing and the one audio format the gateway accepts.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn stream_negotiate(state: web::Data<AppState>) -> HttpResponse {
    let audio = state.get_config().audio;

    HttpResponse::Ok().json(json!({
        "chunk_size": audio.stream_chunk_bytes,
        "sample_rate": audio.sample_rate,
        "channels": audio.channels,
        "sample_format": "s16le"
    }))
}
