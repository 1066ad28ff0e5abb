//! HTTP producer endpoint
//!
//! `POST /v1/campaigns/{campaign_id}/broadcast` accepts one event envelope,
//! optionally carrying `campaignId` and a `channel` override, and fans it out
//! through the hub exactly like a socket frame would.

use crate::error::{AppError, AppResult};
use crate::hub::ChannelId;
use crate::metrics;
use crate::state::AppState;
use actix_middleware::get_trace_id;
use actix_web::{web, HttpRequest, HttpResponse};
use event_schema::{validate_envelope, SchemaError};
use serde_json::{json, Value};
use tracing::info;

pub async fn broadcast(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<Value>,
) -> AppResult<HttpResponse> {
    let raw_path = path.into_inner();
    let path_channel = ChannelId::resolve(&raw_path)?;

    let mut body = body.into_inner();
    let fields = body
        .as_object_mut()
        .ok_or(AppError::InvalidEvent(SchemaError::NotAnObject))?;

    // campaignId is a producer-side cross check, not part of the envelope
    if let Some(campaign_id) = fields.remove("campaignId") {
        let campaign_id = match campaign_id {
            Value::Null => None,
            Value::String(id) => Some(id),
            other => Some(other.to_string()),
        };
        if let Some(id) = campaign_id {
            if id != raw_path && id != path_channel.entity() {
                return Err(AppError::ChannelMismatch(format!(
                    "campaignId `{id}` does not match path `{raw_path}`"
                )));
            }
        }
    }

    let mut message = validate_envelope(&body)?;

    let channel = match message.channel.as_deref() {
        Some(requested) => {
            let requested: ChannelId = requested.parse()?;
            // a full channel id in the path pins the target
            if raw_path.contains(':') && requested != path_channel {
                return Err(AppError::ChannelMismatch(format!(
                    "channel `{requested}` does not match path `{raw_path}`"
                )));
            }
            requested
        }
        None => path_channel,
    };

    if message.trace_id.is_none() {
        message.trace_id = get_trace_id(&req);
    }
    let event_type = message.event_type.clone();
    let trace_id = message.trace_id.clone().unwrap_or_default();

    let delivered = state.hub.publish(&channel, message, true).await?;
    metrics::BROADCASTS_TOTAL
        .with_label_values(&[metrics::SOURCE_HTTP])
        .inc();

    info!(
        channel = %channel,
        event_type = %event_type,
        trace_id = %trace_id,
        delivered,
        "http broadcast accepted"
    );

    Ok(HttpResponse::Accepted().json(json!({
        "accepted": true,
        "delivered": delivered,
    })))
}
