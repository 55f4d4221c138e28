//! WhatsApp webhook endpoint.
//!
//! GET answers the subscription handshake. POST verifies the signature,
//! parses the delivery and hands it to the ingress adapter. Once the body
//! is accepted the answer is always `200 OK`, whatever happened to the
//! individual messages, so the platform never re-delivers a batch that was
//! already buffered.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::auth::{verify_signature, SignatureError};
use crate::ingress;

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook
///
/// Echoes `hub.challenge` when the mode is `subscribe` and the token matches.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    let expected = state
        .config
        .webhook
        .verify_token
        .as_deref()
        .filter(|t| !t.is_empty());

    match expected {
        Some(expected)
            if params.mode.as_deref() == Some("subscribe")
                && params.verify_token.as_deref() == Some(expected) =>
        {
            info!("webhook subscription verified");
            (StatusCode::OK, params.challenge.unwrap_or_default())
        }
        _ => {
            warn!(mode = ?params.mode, "webhook verification refused");
            (StatusCode::FORBIDDEN, "Forbidden".to_string())
        }
    }
}

/// POST /webhook
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, (StatusCode, &'static str)> {
    let cfg = &state.config.webhook;
    verify_signature(
        &headers,
        &body,
        cfg.app_secret.as_deref(),
        cfg.require_signature,
    )
    .map_err(|e| signature_error(&e))?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid JSON in webhook body");
        (StatusCode::BAD_REQUEST, "Invalid JSON")
    })?;

    let events = ingress::parse_delivery(&payload);
    debug!(bytes = body.len(), messages = events.len(), "webhook delivery parsed");
    if events.is_empty() {
        return Ok("OK");
    }

    let report = ingress::process(&state, events).await;
    info!(
        buffered = report.buffered,
        forwarded = report.forwarded,
        filtered = report.filtered,
        leaders = report.leaders,
        "webhook delivery processed"
    );
    Ok("OK")
}

fn signature_error(e: &SignatureError) -> (StatusCode, &'static str) {
    match e {
        SignatureError::Misconfigured => {
            error!("webhook.app_secret is not set, rejecting delivery")
        }
        other => warn!(reason = %other, "webhook authentication failed"),
    }
    (e.status(), e.body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
        Router,
    };
    use coalesce_core::config::{CoalesceConfig, FilterConfig};
    use coalesce_core::types::OutboundRecord;
    use coalesce_debounce::{
        DebounceSetup, Debouncer, Dispatcher, LeaseDebouncer, PassthroughDebouncer,
        RecordingSink, TimerDebouncer,
    };
    use coalesce_store::{MemoryStore, SharedStore};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::app::{build_router, AppState};
    use crate::auth::{sign, SIGNATURE_HEADER};

    const SECRET: &str = "app-secret";
    const WINDOW: Duration = Duration::from_millis(2000);

    fn config() -> CoalesceConfig {
        let mut cfg = CoalesceConfig::default();
        cfg.webhook.verify_token = Some("verify-me".to_string());
        cfg.webhook.app_secret = Some(SECRET.to_string());
        cfg
    }

    enum Mode {
        Timer,
        Lease,
        Passthrough,
    }

    fn router(cfg: CoalesceConfig, mode: Mode) -> (Router, Arc<RecordingSink>, Arc<AppState>) {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = Dispatcher::new(sink.clone());
        let (debouncer, store): (Arc<dyn Debouncer>, Option<Arc<dyn SharedStore>>) = match mode {
            Mode::Timer => (
                Arc::new(TimerDebouncer::new(WINDOW, dispatcher.clone())),
                None,
            ),
            Mode::Lease => {
                let store: Arc<dyn SharedStore> =
                    Arc::new(MemoryStore::new(Duration::from_secs(300)));
                (
                    Arc::new(LeaseDebouncer::new(
                        Arc::clone(&store),
                        dispatcher.clone(),
                        WINDOW,
                        WINDOW + Duration::from_millis(1000),
                    )),
                    Some(store),
                )
            }
            Mode::Passthrough => (Arc::new(PassthroughDebouncer::new(dispatcher.clone())), None),
        };
        let state = Arc::new(AppState::new(
            cfg,
            DebounceSetup { debouncer, store },
            dispatcher,
        ));
        (build_router(Arc::clone(&state)), sink, state)
    }

    fn delivery(messages: Value) -> String {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"value": {
                "contacts": [{"wa_id": "15551234567", "profile": {"name": "Ana"}}],
                "messages": messages
            }}]}]
        })
        .to_string()
    }

    fn text(body: &str, ts: u64) -> Value {
        json!({"from": "15551234567", "timestamp": ts.to_string(), "type": "text", "text": {"body": body}})
    }

    fn signed_post(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign(SECRET, body.as_bytes()))
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn texts(sink: &RecordingSink) -> Vec<String> {
        sink.records()
            .into_iter()
            .filter_map(|r| match r {
                OutboundRecord::Text(m) => Some(m.text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn handshake_echoes_challenge() {
        let (app, _, _) = router(config(), Mode::Passthrough);
        let req = Request::builder()
            .uri("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "1158201444");
    }

    #[tokio::test]
    async fn handshake_with_wrong_token_is_forbidden() {
        let (app, _, _) = router(config(), Mode::Passthrough);
        for uri in [
            "/webhook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
            "/webhook?hub.verify_token=verify-me&hub.challenge=1",
            "/webhook",
        ] {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{uri}");
        }
    }

    #[tokio::test]
    async fn unsigned_and_badly_signed_posts_are_rejected() {
        let (app, sink, _) = router(config(), Mode::Passthrough);
        let body = delivery(json!([text("Hi", 1)]));

        let unsigned = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from(body.clone()))
            .unwrap();
        let resp = app.clone().oneshot(unsigned).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let forged = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(SIGNATURE_HEADER, sign("wrong-secret", body.as_bytes()))
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(forged).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_a_server_misconfiguration() {
        let mut cfg = config();
        cfg.webhook.app_secret = None;
        let (app, _, _) = router(cfg.clone(), Mode::Passthrough);
        let resp = app.oneshot(signed_post(delivery(json!([])))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        cfg.webhook.require_signature = false;
        let (app, sink, _) = router(cfg, Mode::Passthrough);
        let unsigned = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from(delivery(json!([text("Hi", 1)]))))
            .unwrap();
        let resp = app.oneshot(unsigned).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(texts(&sink), vec!["Hi".to_string()]);
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request() {
        let (app, _, _) = router(config(), Mode::Passthrough);
        let resp = app.oneshot(signed_post("{not json".to_string())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_mode_consolidates_and_bypasses_media() {
        let (app, sink, state) = router(config(), Mode::Timer);
        let body = delivery(json!([
            text("Hi", 100),
            {"from": "15551234567", "timestamp": "101", "type": "audio", "audio": {"id": "aud-1"}},
            text("there", 102),
            text("!", 103)
        ]));
        let resp = app.oneshot(signed_post(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "OK");

        // Media went out at once; text is still buffered.
        let records = sink.records();
        assert_eq!(records.len(), 1);
        match &records[0] {
            OutboundRecord::Immediate(m) => {
                assert_eq!(m.message_type, "audio");
                assert_eq!(m.sender, "+15551234567");
                assert_eq!(m.display_name, "Ana");
            }
            other => panic!("expected immediate record, got {other:?}"),
        }
        assert_eq!(state.debouncer.pending(), Some(1));

        tokio::time::sleep(WINDOW + Duration::from_millis(100)).await;
        assert_eq!(texts(&sink), vec!["Hi there !".to_string()]);
        match &sink.records()[1] {
            OutboundRecord::Text(m) => assert_eq!(m.timestamp, 100),
            other => panic!("expected text record, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_mode_answers_before_the_leader_flushes() {
        let (app, sink, state) = router(config(), Mode::Lease);
        let body = delivery(json!([text("a", 1), text("b", 2)]));
        let started = tokio::time::Instant::now();
        let resp = app.oneshot(signed_post(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(started.elapsed() < WINDOW);
        assert!(texts(&sink).is_empty());
        assert_eq!(state.duties.len(), 1);

        tokio::time::sleep(WINDOW + Duration::from_millis(100)).await;
        assert_eq!(texts(&sink), vec!["a b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drain_finishes_detached_leaders() {
        let (app, sink, state) = router(config(), Mode::Lease);
        let resp = app
            .oneshot(signed_post(delivery(json!([text("last words", 1)]))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(state.duties.drain().await, 1);
        assert_eq!(texts(&sink), vec!["last words".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_sender_has_no_side_effects() {
        let mut cfg = config();
        cfg.filter = FilterConfig {
            allow: vec!["15551234567".to_string()],
            block: vec!["+15551234567".to_string()],
        };
        let (app, sink, state) = router(cfg, Mode::Timer);
        let resp = app
            .oneshot(signed_post(delivery(json!([text("Hi", 1)]))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.debouncer.pending(), Some(0));

        tokio::time::sleep(WINDOW * 2).await;
        assert!(sink.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_sender_leaves_no_lease_or_buffer() {
        let mut cfg = config();
        cfg.filter.block = vec!["15551234567".to_string()];
        let (app, sink, state) = router(cfg, Mode::Lease);
        let resp = app
            .oneshot(signed_post(delivery(json!([text("Hi", 1)]))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.duties.is_empty());

        let store = state.store.clone().unwrap();
        let ttl = WINDOW + Duration::from_millis(1000);
        assert!(store.try_acquire("+15551234567", ttl).await.unwrap().is_some());
        assert!(store.try_acquire("15551234567", ttl).await.unwrap().is_some());
        assert!(store.read_and_clear("15551234567").await.unwrap().is_empty());
        assert!(store.read_and_clear("+15551234567").await.unwrap().is_empty());

        tokio::time::sleep(WINDOW * 2).await;
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn health_reports_mode_and_backend() {
        let (app, _, _) = router(config(), Mode::Lease);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["mode"], "lock");
        assert_eq!(v["store"], "memory");
        assert_eq!(v["sink_enabled"], true);
        assert_eq!(v["leader_duties"], 0);
    }
}
