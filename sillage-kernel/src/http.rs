/**
 * API REST SILLAGE - Serveur HTTP du kernel de supervision
 *
 * RÔLE :
 * Ce module expose l'API REST sécurisée du kernel : état de flotte,
 * abonnements, traces historiques, vue carte et commandes de relecture.
 * Seul point d'entrée du dashboard vers le sous-système temps réel.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum sur port 8080 avec middleware auth API key
 * - Routes organisées : /health, /system, /fleet, /replay
 * - Sérialisation JSON automatique des réponses
 * - Gestion erreurs HTTP standardisée (404, 401, 502...)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Validation côté middleware avant traitement métier
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::config::{DeviceConf, KernelConfig};
use crate::fleet::SharedFleetRegistry;
use crate::health::HealthTracker;
use crate::history::{self, HistoryQuery, HistorySource, RouteSet};
use crate::mapview;
use crate::models::{DeviceConnectionState, DeviceStatus, LocationSample};
use crate::playback::{PlaybackEngine, PlaybackError, PlaybackFrame};
use crate::session::SessionManager;
use crate::state::Shared;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Shared<KernelConfig>,
    pub fleet: SharedFleetRegistry,
    pub session: SessionManager,
    pub health_tracker: HealthTracker,
    pub playback: PlaybackEngine,
    pub history: Option<Arc<dyn HistorySource>>,
}

#[derive(serde::Serialize)]
struct DeviceView {
    device_id: String,
    status: DeviceStatus,
    label: Option<String>,
    brand: Option<String>,
    model: Option<String>,
    client: Option<String>,
    last_position: Option<LocationSample>,
    battery: Option<f64>,
    last_packet_at: Option<String>,     // RFC3339 pour l'API
    last_connection_at: Option<String>,
    stale: bool,
    stale_for_seconds: i64,
}

fn to_view(
    d: &DeviceConnectionState,
    meta: Option<&DeviceConf>,
    now: OffsetDateTime,
    window: Duration,
) -> DeviceView {
    let age = d.last_packet_at.map(|last| now - last);
    DeviceView {
        device_id: d.device_id.clone(),
        status: d.status,
        label: meta.map(|m| m.label.clone()),
        brand: meta.and_then(|m| m.brand.clone()),
        model: meta.and_then(|m| m.model.clone()),
        client: meta.and_then(|m| m.client.clone()),
        last_position: d.last_position.clone(),
        battery: d.battery,
        last_packet_at: d.last_packet_at.and_then(|t| t.format(&Rfc3339).ok()),
        last_connection_at: d.last_connection_at.and_then(|t| t.format(&Rfc3339).ok()),
        stale: age.map(|a| a > window).unwrap_or(false),
        stale_for_seconds: age.map(|a| a.whole_seconds().max(0)).unwrap_or(0),
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("SILLAGE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        tracing::error!("SILLAGE_API_KEY absente, accès API refusé");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/fleet", get(get_fleet))
        .route("/fleet/watch", post(watch_devices))
        .route("/fleet/unwatch", post(unwatch_devices))
        .route("/fleet/focus", get(get_focus).post(set_focus))
        .route("/fleet/{imei}", get(get_device))
        .route("/fleet/{imei}/route", get(get_route))
        .route("/fleet/{imei}/map", get(get_map))
        .route("/replay", get(get_replay))
        .route("/replay/start", post(replay_start))
        .route("/replay/pause", post(replay_pause))
        .route("/replay/resume", post(replay_resume))
        .route("/replay/stop", post(replay_stop))
        .route("/replay/seek", post(replay_seek))
        .route("/replay/speed", post(replay_speed))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health (état infrastructure)
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    Json(app.health_tracker.snapshot(&app.fleet).await)
}

// GET /fleet (liste)
async fn get_fleet(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    let now = OffsetDateTime::now_utc();
    let (devices, window) = {
        let cfg = app.cfg.lock();
        (cfg.devices.clone(), Duration::seconds(cfg.liveness.window_seconds as i64))
    };
    let mut list: Vec<DeviceView> = app
        .fleet
        .list()
        .await
        .values()
        .map(|d| to_view(d, devices.get(&d.device_id), now, window))
        .collect();
    list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Json(list)
}

// GET /fleet/:imei (détail)
async fn get_device(
    State(app): State<AppState>,
    Path(imei): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let Some(d) = app.fleet.get(&imei).await else { return Err(StatusCode::NOT_FOUND) };
    let now = OffsetDateTime::now_utc();
    let (meta, window) = {
        let cfg = app.cfg.lock();
        (cfg.devices.get(&imei).cloned(), Duration::seconds(cfg.liveness.window_seconds as i64))
    };
    Ok(Json(to_view(&d, meta.as_ref(), now, window)))
}

#[derive(Debug, Deserialize)]
struct WatchBody {
    imeis: Vec<String>,
}

// POST /fleet/watch
async fn watch_devices(
    State(app): State<AppState>,
    Json(body): Json<WatchBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.session.watch(body.imeis).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "watched": app.session.watched_ids() })),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "ok": false, "msg": e.to_string() })),
        ),
    }
}

// POST /fleet/unwatch
async fn unwatch_devices(
    State(app): State<AppState>,
    Json(body): Json<WatchBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.session.unwatch(body.imeis).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "watched": app.session.watched_ids() })),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "ok": false, "msg": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct FocusBody {
    imei: Option<String>,
}

// POST /fleet/focus (None = plus aucun traceur au premier plan)
async fn set_focus(
    State(app): State<AppState>,
    Json(body): Json<FocusBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Some(imei) = &body.imei {
        if !app.session.watched_ids().contains(imei) {
            return Err(StatusCode::NOT_FOUND);
        }
    }
    app.session.set_focus(body.imei.clone());
    Ok(Json(serde_json::json!({ "ok": true, "focused": body.imei })))
}

// GET /fleet/focus — traceur au premier plan + dernier échantillon direct reçu
async fn get_focus(State(app): State<AppState>) -> Json<serde_json::Value> {
    let live = app.session.live_feed().borrow().clone();
    Json(serde_json::json!({ "focused": app.session.focused(), "live": live }))
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: String,
    to: String,
    page: Option<u32>,
    limit: Option<usize>,
}

fn parse_range(params: &RangeParams, imei: &str) -> Result<HistoryQuery, StatusCode> {
    let from = OffsetDateTime::parse(&params.from, &Rfc3339)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let to = OffsetDateTime::parse(&params.to, &Rfc3339)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if from > to {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(HistoryQuery { device_id: imei.to_string(), from, to, page: params.page, limit: params.limit })
}

/// Fenêtre historique + dernier échantillon direct connu, fusionnés.
async fn assemble_route(
    app: &AppState,
    imei: &str,
    query: &HistoryQuery,
) -> Result<RouteSet, StatusCode> {
    let Some(source) = &app.history else {
        tracing::warn!("service historique non configuré");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let live = app.fleet.get(imei).await.and_then(|d| d.last_position);
    history::assemble(source.as_ref(), query, live).await.map_err(|e| {
        tracing::warn!("historique indisponible pour {imei}: {e}");
        StatusCode::BAD_GATEWAY
    })
}

// GET /fleet/:imei/route?from&to&limit — trace fusionnée, récent d'abord
async fn get_route(
    State(app): State<AppState>,
    Path(imei): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<LocationSample>>, StatusCode> {
    let query = parse_range(&params, &imei)?;
    let set = assemble_route(&app, &imei, &query).await?;
    let points = match params.limit {
        Some(k) => set.capped(k).to_vec(),
        None => set.points().to_vec(),
    };
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
struct MapParams {
    from: Option<String>,
    to: Option<String>,
    page: Option<u32>,
    limit: Option<usize>,
}

/// Plage facultative sur la carte : absente = marqueur seul, sans polyligne.
/// Une seule borne fournie reste une requête invalide.
fn parse_map_range(params: &MapParams, imei: &str) -> Result<Option<HistoryQuery>, StatusCode> {
    match (&params.from, &params.to) {
        (Some(from), Some(to)) => {
            let range = RangeParams {
                from: from.clone(),
                to: to.clone(),
                page: params.page,
                limit: params.limit,
            };
            parse_range(&range, imei).map(Some)
        }
        (None, None) => Ok(None),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

// GET /fleet/:imei/map — instantané carte (marqueur + polyligne + rejeu)
async fn get_map(
    State(app): State<AppState>,
    Path(imei): Path<String>,
    Query(params): Query<MapParams>,
) -> Result<Json<mapview::MapFrame>, StatusCode> {
    let Some(device) = app.fleet.get(&imei).await else { return Err(StatusCode::NOT_FOUND) };
    let route = match parse_map_range(&params, &imei)? {
        Some(query) => assemble_route(&app, &imei, &query).await?,
        None => RouteSet::from_history(Vec::new()),
    };
    let frame = app.playback.frame();
    Ok(Json(mapview::build_map_frame(&device, &route, Some(&frame))))
}

#[derive(Debug, Deserialize)]
struct ReplayStartBody {
    imei: String,
    from: String,
    to: String,
    speed: Option<f64>,
}

fn playback_status(e: &PlaybackError) -> StatusCode {
    match e {
        PlaybackError::EmptyRoute => StatusCode::CONFLICT,
        PlaybackError::InvalidSpeed(_) => StatusCode::BAD_REQUEST,
    }
}

// POST /replay/start — charge la fenêtre demandée et lance la relecture
async fn replay_start(
    State(app): State<AppState>,
    Json(body): Json<ReplayStartBody>,
) -> Result<Json<PlaybackFrame>, (StatusCode, Json<serde_json::Value>)> {
    let params = RangeParams { from: body.from, to: body.to, page: None, limit: None };
    let query = parse_range(&params, &body.imei)
        .map_err(|code| (code, Json(serde_json::json!({ "msg": "plage invalide" }))))?;
    let route = assemble_route(&app, &body.imei, &query)
        .await
        .map_err(|code| (code, Json(serde_json::json!({ "msg": "historique indisponible" }))))?;

    app.playback.load(&body.imei, route.chronological());
    if let Some(speed) = body.speed {
        app.playback.set_speed(speed).map_err(|e| {
            (playback_status(&e), Json(serde_json::json!({ "msg": e.to_string() })))
        })?;
    }
    app.playback.play().map_err(|e| {
        (playback_status(&e), Json(serde_json::json!({ "msg": e.to_string() })))
    })?;
    Ok(Json(app.playback.frame()))
}

// GET /replay — instantané du rejeu en cours
async fn get_replay(State(app): State<AppState>) -> Json<PlaybackFrame> {
    Json(app.playback.frame())
}

async fn replay_pause(State(app): State<AppState>) -> Json<PlaybackFrame> {
    app.playback.pause();
    Json(app.playback.frame())
}

async fn replay_resume(
    State(app): State<AppState>,
) -> Result<Json<PlaybackFrame>, (StatusCode, Json<serde_json::Value>)> {
    app.playback.play().map_err(|e| {
        (playback_status(&e), Json(serde_json::json!({ "msg": e.to_string() })))
    })?;
    Ok(Json(app.playback.frame()))
}

async fn replay_stop(State(app): State<AppState>) -> Json<PlaybackFrame> {
    app.playback.stop();
    Json(app.playback.frame())
}

#[derive(Debug, Deserialize)]
struct SeekBody {
    index: usize,
}

async fn replay_seek(
    State(app): State<AppState>,
    Json(body): Json<SeekBody>,
) -> Result<Json<PlaybackFrame>, (StatusCode, Json<serde_json::Value>)> {
    app.playback.seek(body.index).map_err(|e| {
        (playback_status(&e), Json(serde_json::json!({ "msg": e.to_string() })))
    })?;
    Ok(Json(app.playback.frame()))
}

#[derive(Debug, Deserialize)]
struct SpeedBody {
    multiplier: f64,
}

async fn replay_speed(
    State(app): State<AppState>,
    Json(body): Json<SpeedBody>,
) -> Result<Json<PlaybackFrame>, (StatusCode, Json<serde_json::Value>)> {
    app.playback.set_speed(body.multiplier).map_err(|e| {
        (playback_status(&e), Json(serde_json::json!({ "msg": e.to_string() })))
    })?;
    Ok(Json(app.playback.frame()))
}
