use crate::admission::process_rss_bytes;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /health — liveness plus the current model, memory, and capacity view.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let capabilities = state.registry.capabilities();

    let memory = match process_rss_bytes() {
        Some(bytes) => json!({
            "resident_memory_mb": bytes / 1024 / 1024,
            "limit_mb": config.limits.max_memory_mb,
            "available": true
        }),
        None => json!({
            "available": false,
            "note": "memory probe not supported on this platform"
        }),
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "whisper-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "model": {
            "name": state.registry.current_name().await,
            "device": state.registry.current_device().await,
            "loaded": true
        },
        "memory": memory,
        "languages": capabilities.languages,
        "sessions": {
            "active": state.admission.active_sessions(),
            "max": state.admission.max_concurrent()
        },
        "wyoming": {
            "host": config.wyoming.host,
            "port": config.wyoming.port
        }
    }))
}
