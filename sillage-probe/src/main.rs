//! Sillage Probe - Balise GPS simulée pour développer le kernel sans matériel
//!
//! La sonde se comporte comme un traceur réel :
//! - Annonce de cycle de vie (connection) au démarrage, disconnection à l'arrêt
//! - Positions périodiques sur un circuit circulaire autour d'un point de base
//! - Alternance des formes de protocole supportées pour exercer le normaliseur
//! - Réponse aux demandes d'instantané du kernel (paquet statut ordinaire)

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

const SNAPSHOT_TOPIC: &str = "sillage/fleet/snapshot@v1";

#[derive(Debug, Clone)]
struct ProbeConfig {
    imei: String,
    mqtt_host: String,
    mqtt_port: u16,
    /// Centre du circuit simulé.
    base_lat: f64,
    base_lon: f64,
    /// Rayon du circuit en degrés (~1.1 km par 0.01 à l'équateur).
    radius_deg: f64,
    interval_secs: u64,
}

impl ProbeConfig {
    fn from_env() -> Self {
        let num = |key: &str, fallback: f64| {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(fallback)
        };
        Self {
            imei: std::env::var("SILLAGE_PROBE_IMEI")
                .unwrap_or_else(|_| "860000000000001".into()),
            mqtt_host: std::env::var("SILLAGE_MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
            mqtt_port: num("SILLAGE_MQTT_PORT", 1883.0) as u16,
            base_lat: num("SILLAGE_PROBE_LAT", 20.6736),
            base_lon: num("SILLAGE_PROBE_LON", -103.3440),
            radius_deg: num("SILLAGE_PROBE_RADIUS", 0.02),
            interval_secs: num("SILLAGE_PROBE_INTERVAL", 5.0) as u64,
        }
    }

    fn packet_topic(&self) -> String {
        format!("sillage/fleet/{}/packet@v1", self.imei)
    }
}

/// Position sur le circuit au pas donné : un tour complet en 72 pas.
fn circuit_point(cfg: &ProbeConfig, step: u64) -> (f64, f64, f64) {
    let angle = (step % 72) as f64 * (std::f64::consts::TAU / 72.0);
    let lat = (cfg.base_lat + cfg.radius_deg * angle.sin()).clamp(-90.0, 90.0);
    let lon = (cfg.base_lon + cfg.radius_deg * angle.cos()).clamp(-180.0, 180.0);
    let course = (angle.to_degrees() + 90.0) % 360.0;
    (lat, lon, course)
}

/// Batterie qui se vide lentement, plancher à 5%.
fn battery_level(step: u64) -> f64 {
    (100.0 - step as f64 * 0.05).max(5.0)
}

/// Trois formes de paquet en rotation : enveloppe versionnée, champs à
/// plat avec alias courts, statut pur sans coordonnées.
fn position_payload(cfg: &ProbeConfig, step: u64, now: OffsetDateTime) -> Value {
    let (lat, lon, course) = circuit_point(cfg, step);
    let ts = now.format(&Rfc3339).unwrap_or_default();
    let speed = 25.0 + 10.0 * ((step % 7) as f64 / 7.0);

    match step % 3 {
        0 => json!({
            "protocol": "gt06",
            "device_id": cfg.imei,
            "event": {
                "type": "position",
                "data": {
                    "latitude": lat,
                    "longitude": lon,
                    "speed": speed,
                    "course": course,
                    "timestamp": ts,
                }
            },
            "battery": battery_level(step),
        }),
        1 => json!({
            "imei": cfg.imei,
            "lat": lat,
            "lng": lon,
            "speed": speed,
            "ts": now.unix_timestamp(),
            "bat": battery_level(step),
        }),
        _ => json!({
            "protocol": "status",
            "device_id": cfg.imei,
            "battery": battery_level(step),
            "timestamp": ts,
        }),
    }
}

fn lifecycle_payload(cfg: &ProbeConfig, status: &str, now: OffsetDateTime) -> Value {
    json!({
        "device_id": cfg.imei,
        "status": status,
        "timestamp": now.format(&Rfc3339).unwrap_or_default(),
    })
}

/// Réponse d'instantané : paquet statut ordinaire, request_id repris.
fn snapshot_reply(cfg: &ProbeConfig, request_id: Option<&str>, step: u64, now: OffsetDateTime) -> Value {
    json!({
        "protocol": "status",
        "device_id": cfg.imei,
        "status": "connection",
        "battery": battery_level(step),
        "request_id": request_id,
        "timestamp": now.format(&Rfc3339).unwrap_or_default(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cfg = ProbeConfig::from_env();
    info!("sonde {} vers {}:{}", cfg.imei, cfg.mqtt_host, cfg.mqtt_port);

    let client_id = format!("sillage-probe-{}", cfg.imei);
    let mut opts = MqttOptions::new(client_id, &cfg.mqtt_host, cfg.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    client.subscribe(SNAPSHOT_TOPIC, QoS::AtLeastOnce).await?;

    // Boucle d'événements : demandes d'instantané du kernel.
    let loop_client = client.clone();
    let loop_cfg = cfg.clone();
    tokio::spawn(async move {
        let mut replies: u64 = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == SNAPSHOT_TOPIC => {
                    let request_id = serde_json::from_slice::<Value>(&p.payload)
                        .ok()
                        .and_then(|v| v.get("request_id").and_then(Value::as_str).map(String::from));
                    let reply = snapshot_reply(
                        &loop_cfg,
                        request_id.as_deref(),
                        replies,
                        OffsetDateTime::now_utc(),
                    );
                    replies += 1;
                    if let Err(e) = loop_client
                        .publish(loop_cfg.packet_topic(), QoS::AtLeastOnce, false, reply.to_string())
                        .await
                    {
                        warn!("réponse instantané refusée: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("boucle MQTT: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // Annonce de connexion avant la première position.
    let topic = cfg.packet_topic();
    client
        .publish(
            &topic,
            QoS::AtLeastOnce,
            false,
            lifecycle_payload(&cfg, "connection", OffsetDateTime::now_utc()).to_string(),
        )
        .await?;

    let mut step: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = position_payload(&cfg, step, OffsetDateTime::now_utc());
                if let Err(e) = client
                    .publish(&topic, QoS::AtLeastOnce, false, payload.to_string())
                    .await
                {
                    warn!("publication position refusée: {e}");
                }
                step += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("arrêt demandé, annonce de déconnexion");
                let bye = lifecycle_payload(&cfg, "disconnection", OffsetDateTime::now_utc());
                let _ = client.publish(&topic, QoS::AtLeastOnce, false, bye.to_string()).await;
                let _ = client.disconnect().await;
                return Ok(());
            }
        }
    }
}
