/**
 * REGISTRE DE FLOTTE - Suivi de connexion par traceur
 *
 * RÔLE : Tenir l'état courant de chaque traceur (statut, dernière position,
 * batterie, horodatages d'activité) et appliquer la machine à états
 * Unknown -> Connected <-> Disconnected.
 *
 * ARCHITECTURE : Map partagée RwLock indexée par IMEI + balayage périodique
 * de vivacité. Les transitions passent exclusivement par apply_packet /
 * apply_timeout, jamais par mutation directe.
 * UTILITÉ : Source de vérité unique de l'état flotte pour l'API REST et la carte.
 */

use crate::config::LivenessConf;
use crate::models::{DeviceStatus, DeviceConnectionState, FleetMap, NormalizedPacket};
use crate::state::{new_state_rw, SharedRw};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Applique un paquet normalisé à l'état d'un traceur. Au plus une
/// transition de statut par paquet.
pub fn apply_packet(state: &mut DeviceConnectionState, pkt: &NormalizedPacket, now: OffsetDateTime) {
    state.last_packet_at = Some(now);

    if let Some(battery) = pkt.battery {
        state.battery = Some(battery);
    }
    if let Some(position) = &pkt.position {
        state.last_position = Some(position.clone());
    }

    if let Some(event) = &pkt.connectivity {
        // Signal explicite : transition immédiate.
        let next = event.kind.status();
        if next == DeviceStatus::Connected {
            state.last_connection_at = Some(event.at);
        }
        state.status = next;
    } else if pkt.position.is_some() && state.status == DeviceStatus::Unknown {
        // Preuve implicite : une position valide ne sort que de Unknown,
        // jamais d'un Disconnected explicite.
        state.status = DeviceStatus::Connected;
    }
}

/// Dégrade Connected -> Disconnected après une fenêtre de silence.
/// Retourne true si une transition a eu lieu.
pub fn apply_timeout(
    state: &mut DeviceConnectionState,
    now: OffsetDateTime,
    window: Duration,
) -> bool {
    if state.status != DeviceStatus::Connected {
        return false;
    }
    match state.last_packet_at {
        Some(last) if now - last > window => {
            state.status = DeviceStatus::Disconnected;
            true
        }
        _ => false,
    }
}

pub struct FleetRegistry {
    devices: SharedRw<FleetMap>,
}

pub type SharedFleetRegistry = Arc<FleetRegistry>;

impl FleetRegistry {
    pub fn new() -> Self {
        Self { devices: new_state_rw(HashMap::new()) }
    }

    /// Pré-enregistre les traceurs du catalogue config en statut Unknown,
    /// pour que la flotte complète apparaisse avant le premier paquet.
    pub async fn seed_catalog(&self, imeis: impl IntoIterator<Item = String>) {
        let mut devices = self.devices.write().await;
        for imei in imeis {
            devices
                .entry(imei.clone())
                .or_insert_with(|| DeviceConnectionState::new(imei));
        }
    }

    pub async fn ingest(&self, pkt: &NormalizedPacket) {
        self.ingest_at(pkt, OffsetDateTime::now_utc()).await;
    }

    pub async fn ingest_at(&self, pkt: &NormalizedPacket, now: OffsetDateTime) {
        let mut devices = self.devices.write().await;
        let state = devices
            .entry(pkt.device_id.clone())
            .or_insert_with(|| DeviceConnectionState::new(pkt.device_id.clone()));
        apply_packet(state, pkt, now);
    }

    /// Oublie un traceur retiré du suivi. Son état n'est plus servi ;
    /// un futur watch repartira de Unknown.
    pub async fn discard(&self, imei: &str) {
        self.devices.write().await.remove(imei);
    }

    /// Balayage de vivacité. Retourne les IMEI dégradés pendant ce passage.
    pub async fn sweep_timeouts(&self, now: OffsetDateTime, window: Duration) -> Vec<String> {
        let mut devices = self.devices.write().await;
        let mut degraded = Vec::new();
        for (imei, state) in devices.iter_mut() {
            if apply_timeout(state, now, window) {
                degraded.push(imei.clone());
            }
        }
        degraded
    }

    pub async fn list(&self) -> FleetMap {
        self.devices.read().await.clone()
    }

    pub async fn get(&self, imei: &str) -> Option<DeviceConnectionState> {
        self.devices.read().await.get(imei).cloned()
    }

    pub async fn connected_count(&self) -> usize {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.status == DeviceStatus::Connected)
            .count()
    }

    /// Surveille la flotte et dégrade les traceurs silencieux.
    pub fn start_liveness_monitor(registry: SharedFleetRegistry, conf: LivenessConf) {
        tracing::info!(
            "démarrage surveillance vivacité (fenêtre {}s, balayage {}s)",
            conf.window_seconds,
            conf.sweep_seconds
        );

        tokio::spawn(async move {
            let window = Duration::seconds(conf.window_seconds as i64);
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(conf.sweep_seconds.max(1)));

            loop {
                interval.tick().await;
                let now = OffsetDateTime::now_utc();
                let degraded = registry.sweep_timeouts(now, window).await;
                for imei in degraded {
                    tracing::warn!("traceur {imei} silencieux depuis plus de {window}, passage disconnected");
                }
            }
        });
    }
}

impl Default for FleetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
