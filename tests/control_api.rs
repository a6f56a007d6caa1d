mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tigris_sentinel::control::router;
use tower::ServiceExt;

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn put(path: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut b = Request::builder()
        .method("PUT")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(t) = token {
        b = b.header("authorization", format!("Bearer {t}"));
    }
    b.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_and_snapshot_are_public() {
    let h = common::harness(common::settings());
    let app = router(h.ctx.guardrails.clone(), "s3cret");

    let resp = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(Request::get("/guardrails").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["panic_mode"], false);
    assert_eq!(v["dry_run"], false);
}

#[tokio::test]
async fn panic_switch_requires_token() {
    let h = common::harness(common::settings());
    let app = router(h.ctx.guardrails.clone(), "s3cret");

    let resp = app
        .clone()
        .oneshot(put("/guardrails/panic", None, r#"{"enabled": true}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(put("/guardrails/panic", Some("wrong"), r#"{"enabled": true}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(!h.ctx.guardrails.panic_mode());

    let resp = app
        .clone()
        .oneshot(put("/guardrails/panic", Some("s3cret"), r#"{"enabled": true}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["panic_mode"], true);
    assert!(h.ctx.guardrails.panic_mode());

    // null → powrót do konfiguracji
    let resp = app
        .oneshot(put("/guardrails/panic", Some("s3cret"), r#"{"enabled": null}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!h.ctx.guardrails.panic_mode());
}

#[tokio::test]
async fn empty_token_disables_switches() {
    let h = common::harness(common::settings());
    let app = router(h.ctx.guardrails.clone(), "");

    let resp = app
        .oneshot(put("/guardrails/dry-run", Some(""), r#"{"enabled": true}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(!h.ctx.guardrails.dry_run());
}
