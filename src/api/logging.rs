use serde_json::Value;

use crate::util::parse_bool_str;

const DEBUG_PAYLOAD_ENV: &str = "ASKSTREAM_DEBUG_PAYLOAD";
const MAX_LOGGED_DATA_CHARS: usize = 2048;

pub fn debug_payload_enabled() -> bool {
    std::env::var(DEBUG_PAYLOAD_ENV)
        .ok()
        .and_then(|v| parse_bool_str(&v))
        .unwrap_or(false)
}

pub fn emit_debug_payload(request_url: &str, payload: &Value) {
    let formatted_payload = serde_json::to_string_pretty(payload)
        .unwrap_or_else(|_| "<payload serialization error>".to_string());
    tracing::debug!(url = request_url, payload = %formatted_payload, "upstream request payload");
}

pub fn emit_sse_parse_error(
    event_type: Option<&str>,
    json_data: &str,
    parse_error: &serde_json::Error,
) {
    tracing::warn!(
        error = %parse_error,
        event_type = event_type.unwrap_or("<none>"),
        data = %truncate_for_log(json_data),
        "sse parse failed"
    );
}

fn truncate_for_log(data: &str) -> &str {
    match data.char_indices().nth(MAX_LOGGED_DATA_CHARS) {
        Some((cut, _)) => &data[..cut],
        None => data,
    }
}
