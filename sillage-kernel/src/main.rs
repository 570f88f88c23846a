/**
 * SILLAGE KERNEL - Point d'entrée du service de supervision de flotte
 *
 * RÔLE : Orchestration de tous les modules : config, session push, registre
 * de flotte, historique, relecture, API REST, health. Bootstrap du système
 * complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : Event-driven via MQTT + API REST + monitoring temps réel.
 * UTILITÉ : Cerveau central de la supervision Sillage, point d'administration unique.
 */

mod config;
mod fleet;
mod geo;
mod health;
mod history;
mod http;
mod mapview;
mod models;
mod playback;
mod protocol;
mod session;
mod state;

use crate::config::{load_config, KernelConfig};
use crate::fleet::{FleetRegistry, SharedFleetRegistry};
use crate::health::HealthTracker;
use crate::history::{HistorySource, HttpHistorySource};
use crate::http::AppState;
use crate::playback::PlaybackEngine;
use crate::session::SessionManager;
use crate::state::{new_state, Shared};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas
    tracing_subscriber::fmt().init();

    let cfg_loaded: KernelConfig = load_config().await;
    let cfg: Shared<KernelConfig> = new_state(cfg_loaded.clone());

    // registre de flotte + tracker de santé
    let fleet: SharedFleetRegistry = Arc::new(FleetRegistry::new());
    let health_tracker = HealthTracker::new();

    // session push partagée
    let mqtt_conf = cfg_loaded.mqtt.clone().unwrap_or_else(|| crate::config::MqttConf {
        host: "localhost".into(),
        port: 1883,
    });
    let session = SessionManager::new(
        fleet.clone(),
        health_tracker.clone(),
        mqtt_conf,
        cfg_loaded.reconnect.clone(),
    );

    // tous les traceurs du catalogue sont suivis dès le démarrage
    let catalog: Vec<String> = cfg_loaded.devices.keys().cloned().collect();
    if catalog.is_empty() {
        warn!("catalogue vide, aucun traceur suivi au démarrage");
    } else if let Err(e) = session.watch(catalog).await {
        error!("abonnement initial refusé: {e}");
    }

    // source historique REST (optionnelle : sans elle, routes et rejeu en 503)
    let history: Option<Arc<dyn HistorySource>> = match &cfg_loaded.history {
        Some(conf) => {
            let timeout = Duration::from_secs(conf.timeout_seconds.unwrap_or(10));
            match HttpHistorySource::new(&conf.base_url, timeout) {
                Ok(source) => {
                    info!("service historique: {}", conf.base_url);
                    Some(Arc::new(source))
                }
                Err(e) => {
                    error!("client historique inutilisable: {e}");
                    None
                }
            }
        }
        None => {
            warn!("pas de service historique configuré");
            None
        }
    };

    // moteur de relecture unique (celui de la carte au premier plan)
    let playback = PlaybackEngine::new(cfg_loaded.playback.base_interval_ms);

    // surveillance de vivacité + publication auto du health
    FleetRegistry::start_liveness_monitor(fleet.clone(), cfg_loaded.liveness.clone());
    health_tracker.spawn_health_publisher(cfg.clone(), fleet.clone());

    // fabrique l'état unique pour Axum
    let app_state = AppState { cfg, fleet, session, health_tracker, playback, history };

    // HTTP
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("kernel à l'écoute sur http://{addr}");
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {addr} impossible: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("serveur HTTP arrêté: {e}");
        std::process::exit(1);
    }
}
