//! Outbound header assembly: pass-through suppression plus rendered
//! template overlay.

use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue, header};

use crate::domain::error::ProxyError;
use crate::domain::model::HeaderTemplate;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Client headers injected by Cloudflare-style edges; never forwarded.
const EDGE_CLIENT_HEADERS: &[&str] = &["cdn-loop", "true-client-ip"];

/// Remove hop-by-hop headers, including any named as `Connection` options.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut doomed: Vec<HeaderName> = HOP_BY_HOP_HEADERS
        .iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    // RFC 7230 section 6.1: every connection option names a further
    // hop-by-hop header. `HeaderName` parsing normalizes case and rejects
    // empty or malformed options.
    if let Some(options) = headers.get(header::CONNECTION).and_then(|v| v.to_str().ok()) {
        doomed.extend(
            options
                .split(',')
                .filter_map(|option| HeaderName::from_bytes(option.trim().as_bytes()).ok()),
        );
    }

    for name in doomed {
        headers.remove(name);
    }
}

/// Remove `cf-*` and related edge-injected client headers.
pub fn strip_edge_headers(headers: &mut HeaderMap) {
    let cf_named: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("cf-"))
        .cloned()
        .collect();
    for name in cf_named {
        headers.remove(&name);
    }
    for name in EDGE_CLIENT_HEADERS {
        headers.remove(*name);
    }
}

/// Sanitize upstream response headers before returning them to the client.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}

/// Build the outbound header set: client headers minus the suppressed set,
/// overlaid with rendered templates, `Host` replaced by the upstream host.
///
/// `suppress_authorization` is set when the upstream defines its own
/// `Authorization` template or when the inbound header carried the proxy
/// credential — either way it must not leak upstream.
///
/// # Errors
///
/// Returns `ProxyError::Configuration` on an unresolved template variable
/// or an unrepresentable rendered value; neither may reach the upstream.
pub fn build_outbound_headers(
    client: &HeaderMap,
    templates: &[HeaderTemplate],
    bindings: &HashMap<String, String>,
    upstream_host: &str,
    suppress_authorization: bool,
) -> Result<HeaderMap, ProxyError> {
    let mut out = client.clone();

    strip_hop_by_hop(&mut out);
    strip_edge_headers(&mut out);
    out.remove(header::HOST);
    // The executor re-derives the length after rewriting/streaming.
    out.remove(header::CONTENT_LENGTH);

    let templated_authorization = templates
        .iter()
        .any(|t| t.name == header::AUTHORIZATION);
    if suppress_authorization || templated_authorization {
        out.remove(header::AUTHORIZATION);
    }

    for template in templates {
        let rendered = template.value.render(bindings).map_err(|missing| {
            ProxyError::configuration(format!(
                "header '{}' references unbound variable '{missing}'",
                template.name
            ))
        })?;
        let value = HeaderValue::from_str(&rendered).map_err(|_| {
            ProxyError::configuration(format!(
                "header '{}' renders to an invalid value",
                template.name
            ))
        })?;
        out.insert(template.name.clone(), value);
    }

    let host = HeaderValue::from_str(upstream_host)
        .map_err(|_| ProxyError::configuration(format!("invalid upstream host '{upstream_host}'")))?;
    out.insert(header::HOST, host);

    Ok(out)
}

/// Resolve the client IP: `X-Real-IP`, else the first `X-Forwarded-For`
/// entry, else the socket peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: &str) -> String {
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let trimmed = first.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    peer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TemplateString;

    fn template(name: &str, value: &str) -> HeaderTemplate {
        HeaderTemplate {
            name: HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value: TemplateString::compile(value),
        }
    }

    #[test]
    fn hop_by_hop_and_connection_named_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, X-Session-Nonce".parse().unwrap());
        headers.insert("x-session-nonce", "abc".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-keep", "yes".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-session-nonce").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "yes");
    }

    #[test]
    fn edge_headers_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "1.2.3.4".parse().unwrap());
        headers.insert("cf-ray", "abc".parse().unwrap());
        headers.insert("cdn-loop", "cloudflare".parse().unwrap());
        headers.insert("true-client-ip", "1.2.3.4".parse().unwrap());
        headers.insert("x-keep", "yes".parse().unwrap());

        strip_edge_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-keep").unwrap(), "yes");
    }

    #[test]
    fn templates_override_client_headers() {
        let mut client = HeaderMap::new();
        client.insert("x-api-version", "v1".parse().unwrap());
        let bindings = HashMap::new();

        let out = build_outbound_headers(
            &client,
            &[template("x-api-version", "v2")],
            &bindings,
            "api.example.com",
            false,
        )
        .unwrap();
        assert_eq!(out.get("x-api-version").unwrap(), "v2");
    }

    #[test]
    fn host_replaced_and_length_dropped() {
        let mut client = HeaderMap::new();
        client.insert(header::HOST, "proxy.local".parse().unwrap());
        client.insert(header::CONTENT_LENGTH, "42".parse().unwrap());

        let out = build_outbound_headers(
            &client,
            &[template("x-static", "1")],
            &HashMap::new(),
            "api.example.com",
            false,
        )
        .unwrap();
        assert_eq!(out.get(header::HOST).unwrap(), "api.example.com");
        assert!(out.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn inbound_authorization_dropped_when_upstream_defines_its_own() {
        let mut client = HeaderMap::new();
        client.insert(header::AUTHORIZATION, "Bearer client-token".parse().unwrap());

        let bindings = HashMap::from([("keys".to_string(), "sk-up".to_string())]);
        let out = build_outbound_headers(
            &client,
            &[template("authorization", "Bearer ${{keys}}")],
            &bindings,
            "api.example.com",
            false,
        )
        .unwrap();
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer sk-up");
    }

    #[test]
    fn inbound_authorization_kept_without_template_or_proxy_auth() {
        let mut client = HeaderMap::new();
        client.insert(header::AUTHORIZATION, "Bearer client-token".parse().unwrap());

        let out = build_outbound_headers(
            &client,
            &[template("x-static", "1")],
            &HashMap::new(),
            "api.example.com",
            false,
        )
        .unwrap();
        assert_eq!(
            out.get(header::AUTHORIZATION).unwrap(),
            "Bearer client-token"
        );
    }

    #[test]
    fn proxy_credential_never_forwarded() {
        let mut client = HeaderMap::new();
        client.insert(header::AUTHORIZATION, "Bearer proxy-user-token".parse().unwrap());

        let out = build_outbound_headers(
            &client,
            &[template("x-static", "1")],
            &HashMap::new(),
            "api.example.com",
            true,
        )
        .unwrap();
        assert!(out.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn unresolved_variable_is_configuration_error() {
        let err = build_outbound_headers(
            &HeaderMap::new(),
            &[template("authorization", "Bearer ${{keys}}")],
            &HashMap::new(),
            "api.example.com",
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn client_ip_prefers_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        headers.insert("x-forwarded-for", "8.8.8.8, 7.7.7.7".parse().unwrap());
        assert_eq!(client_ip(&headers, "1.1.1.1"), "9.9.9.9");
    }

    #[test]
    fn client_ip_falls_back_to_forwarded_for_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "8.8.8.8, 7.7.7.7".parse().unwrap());
        assert_eq!(client_ip(&headers, "1.1.1.1"), "8.8.8.8");
        assert_eq!(client_ip(&HeaderMap::new(), "1.1.1.1"), "1.1.1.1");
    }
}
