// src/control.rs
//! Mały serwer HTTP do sterowania w locie:
//!   GET  /health
//!   GET  /guardrails              – panic / dry-run / aktywne cooldowny
//!   PUT  /guardrails/panic        – {"enabled": true|false|null}, null = wróć do konfiguracji
//!   PUT  /guardrails/dry-run      – j.w.
//! Zmiany wymagają `Authorization: Bearer <control.token>`; pusty token = zmiany wyłączone.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::guardrails::{GuardrailSnapshot, Guardrails};

#[derive(Clone)]
struct ControlState {
    guardrails: Arc<Guardrails>,
    token: Arc<str>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBody {
    pub enabled: Option<bool>,
}

pub fn router(guardrails: Arc<Guardrails>, token: &str) -> Router {
    let state = ControlState {
        guardrails,
        token: Arc::from(token),
    };
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/guardrails", get(get_guardrails))
        .route("/guardrails/panic", put(put_panic))
        .route("/guardrails/dry-run", put(put_dry_run))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, guardrails: Arc<Guardrails>, token: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control api listening");
    axum::serve(listener, router(guardrails, token)).await?;
    Ok(())
}

fn authorized(state: &ControlState, headers: &HeaderMap) -> bool {
    if state.token.is_empty() {
        return false;
    }
    let Some(presented) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    presented.as_bytes().ct_eq(state.token.as_bytes()).into()
}

async fn get_guardrails(State(st): State<ControlState>) -> Json<GuardrailSnapshot> {
    Json(st.guardrails.snapshot())
}

async fn put_panic(
    State(st): State<ControlState>,
    headers: HeaderMap,
    Json(body): Json<SwitchBody>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&st, &headers) {
        warn!("control: unauthorized panic switch attempt");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    st.guardrails.set_panic_override(body.enabled);
    (
        StatusCode::OK,
        Json(json!({"panic_mode": st.guardrails.panic_mode(), "override": body.enabled})),
    )
}

async fn put_dry_run(
    State(st): State<ControlState>,
    headers: HeaderMap,
    Json(body): Json<SwitchBody>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&st, &headers) {
        warn!("control: unauthorized dry-run switch attempt");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    st.guardrails.set_dry_run_override(body.enabled);
    (
        StatusCode::OK,
        Json(json!({"dry_run": st.guardrails.dry_run(), "override": body.enabled})),
    )
}
