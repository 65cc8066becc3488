//! Body rewrite rules end to end: set/remove, conditions, templates,
//! pass-through byte identity, and compressed bodies.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use polygate::test_support::{AppHarness, MockResponse, MockUpstream};
use serde_json::json;

fn config(template: &str, port: u16) -> String {
    template
        .replace("@PORT@", &port.to_string())
        .replace("@{{", "${{")
}

const DEFAULT_MODEL_CONFIG: &str = r#"
server:
  host: 127.0.0.1
apis:
  svc:
    endpoint: http://127.0.0.1:@PORT@
    headers:
      x-api-key: "@{{keys}}"
    variables:
      keys: [sk-alpha-0001]
    request_body_substitution:
      enabled: true
      rules:
        - name: default model
          operation: set
          path: model
          value: gpt-4
          conditions:
            - field: model
              operator: nexists
"#;

async fn post_json(harness: &AppHarness, body: &str) -> reqwest::Response {
    harness
        .client()
        .post(harness.url("/api/svc/v1/chat"))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn missing_model_gets_default() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(DEFAULT_MODEL_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    let resp = post_json(&harness, r#"{"messages":[{"role":"user","content":"hi"}]}"#).await;
    assert_eq!(resp.status(), 200);

    let recorded = mock.recorded();
    let forwarded: serde_json::Value = serde_json::from_slice(&recorded[0].body).unwrap();
    assert_eq!(forwarded["model"], "gpt-4");
    assert_eq!(forwarded["messages"][0]["content"], "hi");
    // Re-serialized body carries a matching length and no stale encoding.
    assert_eq!(
        recorded[0].header("content-length").unwrap(),
        recorded[0].body.len().to_string()
    );
}

#[tokio::test]
async fn present_model_passes_byte_identical() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(DEFAULT_MODEL_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    // Odd spacing and key order survive only if the body is untouched.
    let original = r#"{ "model" :"x",   "messages": [] }"#;
    let resp = post_json(&harness, original).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.recorded()[0].body.as_ref(), original.as_bytes());
}

#[tokio::test]
async fn non_json_content_type_skips_rewriter() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(DEFAULT_MODEL_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    let resp = harness
        .client()
        .post(harness.url("/api/svc/v1/chat"))
        .header("content-type", "text/plain")
        .body("{\"not\": \"touched\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.recorded()[0].body.as_ref(), b"{\"not\": \"touched\"}");
}

const REMOVE_FIELD_CONFIG: &str = r#"
server:
  host: 127.0.0.1
apis:
  svc:
    endpoint: http://127.0.0.1:@PORT@
    headers:
      x-api-key: "@{{keys}}"
    variables:
      keys: [sk-alpha-0001]
    request_body_substitution:
      enabled: true
      rules:
        - name: drop frequency penalty
          operation: remove
          path: frequency_penalty
          conditions:
            - field: frequency_penalty
              operator: exists
"#;

#[tokio::test]
async fn disallowed_field_removed() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(REMOVE_FIELD_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    let resp = post_json(&harness, r#"{"frequency_penalty":0.5,"model":"x"}"#).await;
    assert_eq!(resp.status(), 200);

    let forwarded: serde_json::Value =
        serde_json::from_slice(&mock.recorded()[0].body).unwrap();
    assert_eq!(forwarded, json!({ "model": "x" }));
}

#[tokio::test]
async fn gzip_body_decoded_before_rewrite() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(REMOVE_FIELD_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(br#"{"frequency_penalty":0.5,"model":"x"}"#)
        .unwrap();
    let compressed = encoder.finish().unwrap();

    let resp = harness
        .client()
        .post(harness.url("/api/svc/v1/chat"))
        .header("content-type", "application/json")
        .header("content-encoding", "gzip")
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let recorded = mock.recorded();
    // Identity-encoded after the rewrite; the stale encoding is dropped.
    assert!(recorded[0].header("content-encoding").is_none());
    let forwarded: serde_json::Value = serde_json::from_slice(&recorded[0].body).unwrap();
    assert_eq!(forwarded, json!({ "model": "x" }));
}

const TEMPLATE_CONFIG: &str = r#"
server:
  host: 127.0.0.1
apis:
  svc:
    endpoint: http://127.0.0.1:@PORT@
    headers:
      x-api-key: "@{{keys}}"
    variables:
      keys: [sk-alpha-0001]
    request_body_substitution:
      enabled: true
      rules:
        - name: normalize model
          operation: set
          path: model
          value: normalized-model
        - name: remember requested model
          operation: set
          path: metadata.requested_model
          value: "@{{model}}"
"#;

#[tokio::test]
async fn value_templates_resolve_against_original_body() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(TEMPLATE_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    let resp = post_json(&harness, r#"{"model":"gpt-4-turbo"}"#).await;
    assert_eq!(resp.status(), 200);

    let forwarded: serde_json::Value =
        serde_json::from_slice(&mock.recorded()[0].body).unwrap();
    // Rule 1 rewrote the field, rule 2 still saw the original value.
    assert_eq!(forwarded["model"], "normalized-model");
    assert_eq!(forwarded["metadata"]["requested_model"], "gpt-4-turbo");
}

const CONDITIONAL_CONFIG: &str = r#"
server:
  host: 127.0.0.1
apis:
  svc:
    endpoint: http://127.0.0.1:@PORT@
    headers:
      x-api-key: "@{{keys}}"
    variables:
      keys: [sk-alpha-0001]
    request_body_substitution:
      enabled: true
      rules:
        - name: clamp legacy models
          operation: set
          path: model
          value: gpt-4
          conditions:
            - field: model
              operator: like
              value: "gpt-3%"
            - field: stream
              operator: ne
              value: true
"#;

#[tokio::test]
async fn rule_applies_only_when_all_conditions_hold() {
    let mock = MockUpstream::start().await;
    let harness = AppHarness::start(&config(CONDITIONAL_CONFIG, mock.port())).await;
    mock.mock("POST", "/v1/chat", MockResponse::ok());

    // Both conditions hold: rewritten.
    post_json(&harness, r#"{"model":"gpt-3.5-turbo","stream":false}"#).await;
    // Second condition fails: untouched.
    post_json(&harness, r#"{"model":"gpt-3.5-turbo","stream":true}"#).await;
    // First condition fails: untouched.
    post_json(&harness, r#"{"model":"claude-3","stream":false}"#).await;

    let recorded = mock.recorded();
    let first: serde_json::Value = serde_json::from_slice(&recorded[0].body).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&recorded[1].body).unwrap();
    let third: serde_json::Value = serde_json::from_slice(&recorded[2].body).unwrap();
    assert_eq!(first["model"], "gpt-4");
    assert_eq!(second["model"], "gpt-3.5-turbo");
    assert_eq!(third["model"], "claude-3");
}
