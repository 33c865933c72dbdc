use crate::error::ProxyError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};

/// Upper bound on body bytes included in the debug document.
const MAX_DEBUG_BODY: usize = 1024 * 1024;

/// Build the debug-mode response: instead of dispatching, describe what
/// *would* have been sent — the incoming request, the computed outgoing
/// request, any filter-made response, captured filter panics, and the
/// proxy error if one was produced.
pub async fn debug_response(
    ctx: &mut RequestContext,
    err: Option<&ProxyError>,
) -> hyper::Response<BoxBody> {
    let request_body = match ctx.body.take() {
        Some(body) => collect_capped(body).await,
        None => String::new(),
    };

    let incoming = match &ctx.original_request {
        Some(head) => json!({
            "method": head.method.as_str(),
            "uri": head.uri.to_string(),
            "header": headers_json(&head.headers),
        }),
        None => json!({
            "method": ctx.method.as_str(),
            "uri": ctx.uri.to_string(),
            "header": headers_json(&ctx.headers),
        }),
    };

    let outgoing = json!({
        "method": ctx.method.as_str(),
        "uri": ctx.uri.to_string(),
        "host": ctx.outgoing_host,
        "header": headers_json(&ctx.headers),
    });

    let (response_mod, response_mod_body) = match ctx.response.take() {
        Some(resp) => {
            let (parts, body) = resp.into_parts();
            let body_text = collect_capped(body).await;
            (
                json!({
                    "status": parts.status.as_u16(),
                    "header": headers_json(&parts.headers),
                }),
                body_text,
            )
        }
        None => (Value::Null, String::new()),
    };

    let document = json!({
        "route_id": ctx.route_id(),
        "route": ctx.route.as_ref().map(|r| r.describe()),
        "incoming": incoming,
        "outgoing": outgoing,
        "response_mod": response_mod,
        "request_body": request_body,
        "response_mod_body": response_mod_body,
        "filter_panics": ctx.debug_filter_panics,
        "proxy_error": err.map(|e| e.to_string()),
    });

    hyper::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(document.to_string()))
        .expect("static response")
}

fn headers_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        map.insert(name.to_string(), Value::Array(values));
    }
    Value::Object(map)
}

async fn collect_capped(mut body: BoxBody) -> String {
    let mut collected: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(f) => f,
            Err(_) => break,
        };
        if let Ok(data) = frame.into_data() {
            let room = MAX_DEBUG_BODY.saturating_sub(collected.len());
            collected.extend_from_slice(&data[..data.len().min(room)]);
            if room <= data.len() {
                break;
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
