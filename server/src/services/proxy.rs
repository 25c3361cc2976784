//! HTTP passthrough — server-side fetch for cross-origin canvas embeds.
//!
//! DESIGN
//! ======
//! Fetches an external URL and returns the body with the headers that block
//! framing stripped and permissive CORS added. HTML responses get a small
//! script injected before `</head>` that reports the proxied URL to the
//! parent frame and reroutes anchor clicks and form submits back through
//! this endpoint, so navigation stays inside the embedded frame. Non-HTML
//! bodies stream through untouched.
//!
//! There is deliberately no URL allow/deny policy here; the endpoint trusts
//! its deployment boundary. See DESIGN.md before exposing it publicly.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::warn;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Response headers dropped so the result can be framed and read cross-origin.
const FRAME_PROTECTION_HEADERS: [&str; 3] = [
    "x-frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
];

/// Build the shared outbound client used by the passthrough facet.
///
/// # Errors
///
/// Returns an error if the TLS backend fails to initialize.
pub fn client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
}

/// Fetch `target` and hand its body back, rewritten for embedding.
pub(crate) async fn passthrough(http: &reqwest::Client, target: &str) -> Response {
    let upstream = match http.get(target).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, target, "proxy fetch failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    let is_html = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));
    let headers = passthrough_headers(upstream.headers());

    if is_html {
        // Resolve injected links against the final URL, after any redirects.
        let resolved = upstream.url().to_string();
        match upstream.text().await {
            Ok(body) => {
                let body = inject_navigation_script(&body, &resolved);
                build_response(status, headers, Body::from(body))
            }
            Err(e) => {
                warn!(error = %e, target, "proxy body read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    } else {
        build_response(status, headers, Body::from_stream(upstream.bytes_stream()))
    }
}

// =============================================================================
// HEADER REWRITE
// =============================================================================

fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if should_strip(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, header::HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, header::HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, header::HeaderValue::from_static("*"));
    headers
}

fn should_strip(name: &HeaderName) -> bool {
    if FRAME_PROTECTION_HEADERS.contains(&name.as_str()) {
        return true;
    }
    // Length and transfer framing no longer match once the body is rewritten.
    *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING || *name == header::CONNECTION
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// =============================================================================
// SCRIPT INJECTION
// =============================================================================

/// Insert the navigation script immediately before the first `</head>`.
/// Bodies without a head close tag pass through unchanged.
fn inject_navigation_script(body: &str, target: &str) -> String {
    let Some(idx) = body.find("</head>") else {
        return body.to_owned();
    };

    let script = navigation_script(target);
    let mut out = String::with_capacity(body.len() + script.len());
    out.push_str(&body[..idx]);
    out.push_str(&script);
    out.push_str(&body[idx..]);
    out
}

fn navigation_script(target: &str) -> String {
    // JSON string-escape the URL so it embeds safely inside the script; a
    // literal `</script>` in the target must not close the element early.
    let quoted = serde_json::to_string(target)
        .unwrap_or_else(|_| "\"\"".to_owned())
        .replace("</", "<\\/");
    format!(
        r#"<script>(function () {{
  var target = {quoted};
  var proxy = window.location.pathname + "?url=";
  try {{ window.parent.postMessage({{ source: "room-proxy", url: target }}, "*"); }} catch (err) {{}}
  function reroute(url) {{
    try {{ return proxy + encodeURIComponent(new URL(url, target).href); }} catch (err) {{ return url; }}
  }}
  document.addEventListener("click", function (event) {{
    var anchor = event.target && event.target.closest ? event.target.closest("a[href]") : null;
    if (!anchor) {{ return; }}
    event.preventDefault();
    window.location.href = reroute(anchor.getAttribute("href"));
  }}, true);
  document.addEventListener("submit", function (event) {{
    var form = event.target;
    if (!form || !form.action) {{ return; }}
    event.preventDefault();
    window.location.href = reroute(form.action);
  }}, true);
}})();</script>"#
    )
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
