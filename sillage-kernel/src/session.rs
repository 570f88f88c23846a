/**
 * SESSION PUSH - Abonnements multi-traceurs sur canal MQTT partagé
 *
 * RÔLE :
 * Ce module tient l'unique session push du kernel : une connexion MQTT
 * partagée par tous les traceurs suivis, avec routage des paquets vers le
 * registre de flotte et vers le flux direct du traceur au premier plan.
 *
 * FONCTIONNEMENT :
 * - watch/unwatch idempotents : ouverture à la première entrée, fermeture
 *   quand l'ensemble redevient vide
 * - Reconnexion bornée à backoff linéaire ; chaque reconnexion réussie
 *   réabonne tout l'ensemble actif et redemande un instantané d'état
 * - Épuisement des tentatives = état terminal "failed" exposé aux appelants,
 *   jamais de panique
 * - Focus = liaison côté lecture, permutée sous verrou avec contrôle de
 *   l'IMEI au point de consommation
 *
 * UTILITÉ DANS SILLAGE :
 * 🎯 Un seul canal réseau quel que soit le nombre de traceurs suivis
 * 🎯 Jamais de paquet du traceur B affiché sur la fiche du traceur A
 * 🎯 Commandes join/leave acceptées en double forme (IMEI nu ou objet)
 */

use crate::config::{MqttConf, ReconnectConf};
use crate::fleet::SharedFleetRegistry;
use crate::health::HealthTracker;
use crate::models::LocationSample;
use crate::protocol;
use crate::state::{new_state, Shared};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use uuid::Uuid;

pub const JOIN_TOPIC: &str = "sillage/fleet/join@v1";
pub const LEAVE_TOPIC: &str = "sillage/fleet/leave@v1";
pub const SNAPSHOT_TOPIC: &str = "sillage/fleet/snapshot@v1";

pub fn packet_topic(imei: &str) -> String {
    format!("sillage/fleet/{imei}/packet@v1")
}

pub fn parse_packet_topic(topic: &str) -> Option<&str> {
    let imei = topic.strip_prefix("sillage/fleet/")?.strip_suffix("/packet@v1")?;
    if imei.is_empty() || imei.contains('/') {
        return None;
    }
    Some(imei)
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session push non ouverte")]
    NotOpen,
    #[error("transport MQTT: {0}")]
    Transport(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

struct SessionInner {
    watched: HashSet<String>,
    focused: Option<String>,
    state: SessionState,
    client: Option<AsyncClient>,
    /// Génération de session : un task d'événements d'une génération
    /// antérieure se termine de lui-même.
    epoch: u64,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Shared<SessionInner>,
    fleet: SharedFleetRegistry,
    health: HealthTracker,
    mqtt: MqttConf,
    reconnect: ReconnectConf,
    live: watch::Sender<Option<LocationSample>>,
}

impl SessionManager {
    pub fn new(
        fleet: SharedFleetRegistry,
        health: HealthTracker,
        mqtt: MqttConf,
        reconnect: ReconnectConf,
    ) -> Self {
        let (live, _) = watch::channel(None);
        Self {
            inner: new_state(SessionInner {
                watched: HashSet::new(),
                focused: None,
                state: SessionState::Idle,
                client: None,
                epoch: 0,
            }),
            fleet,
            health,
            mqtt,
            reconnect,
            live,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().watched.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn focused(&self) -> Option<String> {
        self.inner.lock().focused.clone()
    }

    /// Flux du traceur au premier plan. None à chaque permutation de focus.
    pub fn live_feed(&self) -> watch::Receiver<Option<LocationSample>> {
        self.live.subscribe()
    }

    /// Ajoute des traceurs à l'ensemble suivi. Ouvre la session au premier,
    /// ré-ajouter un IMEI déjà suivi est sans effet.
    pub async fn watch<I>(&self, ids: I) -> Result<(), SessionError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let (client, to_subscribe, eventloop, epoch, watched_now) = {
            let mut inner = self.inner.lock();
            let mut fresh = Vec::new();
            for id in ids {
                let id = id.into();
                if id.trim().is_empty() {
                    continue;
                }
                if inner.watched.insert(id.clone()) {
                    fresh.push(id);
                }
            }
            // Rien de neuf : ne surtout pas ouvrir une session pour zéro traceur.
            if fresh.is_empty() {
                return Ok(());
            }
            let eventloop = self.ensure_session_locked(&mut inner);
            // Session neuve : tout l'ensemble est à (ré)abonner, pas
            // seulement les nouveaux venus.
            let to_subscribe = if eventloop.is_some() {
                inner.watched.iter().cloned().collect::<Vec<_>>()
            } else {
                fresh
            };
            let client = inner.client.clone().ok_or(SessionError::NotOpen)?;
            (client, to_subscribe, eventloop, inner.epoch, inner.watched.len())
        };

        self.health.set_watched(watched_now);
        self.fleet.seed_catalog(to_subscribe.iter().cloned()).await;

        if let Some(eventloop) = eventloop {
            client.subscribe(JOIN_TOPIC, QoS::AtLeastOnce).await?;
            client.subscribe(LEAVE_TOPIC, QoS::AtLeastOnce).await?;
            self.spawn_event_task(eventloop, epoch);
        }

        for imei in &to_subscribe {
            client.subscribe(packet_topic(imei), QoS::AtLeastOnce).await?;
            let announce = json!({ "device_id": imei }).to_string();
            client.publish(JOIN_TOPIC, QoS::AtLeastOnce, false, announce).await?;
        }
        Ok(())
    }

    /// Retire des traceurs. La session ne ferme que si l'ensemble est vide.
    pub async fn unwatch<I>(&self, ids: I) -> Result<(), SessionError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let (client, removed, close_now, watched_now, focus_dropped) = {
            let mut inner = self.inner.lock();
            let mut removed = Vec::new();
            for id in ids {
                let id = id.into();
                if inner.watched.remove(&id) {
                    removed.push(id);
                }
            }
            let focus_dropped = match &inner.focused {
                Some(f) if removed.contains(f) => {
                    inner.focused = None;
                    true
                }
                _ => false,
            };
            let close_now = inner.watched.is_empty() && inner.client.is_some();
            (inner.client.clone(), removed, close_now, inner.watched.len(), focus_dropped)
        };

        if focus_dropped {
            self.live.send_replace(None);
        }
        self.health.set_watched(watched_now);
        // L'état de connexion d'un traceur retiré ne survit pas au retrait.
        for imei in &removed {
            self.fleet.discard(imei).await;
        }

        let Some(client) = client else { return Ok(()) };
        for imei in &removed {
            client.unsubscribe(packet_topic(imei)).await?;
            let announce = json!({ "device_id": imei }).to_string();
            client.publish(LEAVE_TOPIC, QoS::AtLeastOnce, false, announce).await?;
        }

        if close_now {
            {
                let mut inner = self.inner.lock();
                inner.epoch += 1;
                inner.state = SessionState::Idle;
                inner.client = None;
            }
            let _ = client.disconnect().await;
            self.health.mark_push_disconnected();
            tracing::info!("session push fermée, plus aucun traceur suivi");
        }
        Ok(())
    }

    /// Permute le traceur au premier plan. Purement côté lecture : aucun
    /// abonnement n'est créé ni détruit, l'ancienne liaison est invalidée
    /// avant que le moindre paquet suivant ne soit consommé.
    pub fn set_focus(&self, imei: Option<String>) {
        {
            let mut inner = self.inner.lock();
            if inner.focused == imei {
                return;
            }
            inner.focused = imei;
        }
        self.live.send_replace(None);
    }

    /// Demande un instantané d'état de toute la flotte. Les réponses
    /// reviennent en paquets statut ordinaires sur les topics par traceur.
    pub async fn request_snapshot(&self) -> Result<String, SessionError> {
        let client = self.inner.lock().client.clone().ok_or(SessionError::NotOpen)?;
        let request_id = Uuid::new_v4().to_string();
        let payload = json!({
            "request_id": request_id,
            "requested_at": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        })
        .to_string();
        client.publish(SNAPSHOT_TOPIC, QoS::AtLeastOnce, false, payload).await?;
        Ok(request_id)
    }

    fn ensure_session_locked(&self, inner: &mut SessionInner) -> Option<EventLoop> {
        if inner.client.is_some() {
            return None;
        }
        let mut opts = MqttOptions::new("sillage-kernel", &self.mqtt.host, self.mqtt.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, eventloop) = AsyncClient::new(opts, 64);
        inner.client = Some(client);
        inner.epoch += 1;
        inner.state = SessionState::Connecting;
        Some(eventloop)
    }

    fn set_state(&self, epoch: u64, state: SessionState) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.state = state;
        }
    }

    fn fail_session(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.state = SessionState::Failed;
            inner.client = None;
        }
    }

    fn spawn_event_task(&self, mut eventloop: EventLoop, epoch: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let max = manager.reconnect.max_attempts;
            let base = manager.reconnect.base_delay_seconds;
            let mut attempts: u32 = 0;

            loop {
                if manager.inner.lock().epoch != epoch {
                    return;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        let was_reconnect = attempts > 0;
                        attempts = 0;
                        manager.health.mark_push_connected();
                        manager.set_state(epoch, SessionState::Connected);
                        if was_reconnect {
                            // Hors de la boucle d'événements : le canal de
                            // requêtes ne doit jamais la bloquer.
                            let m = manager.clone();
                            tokio::spawn(async move {
                                m.resubscribe_all().await;
                                if let Err(e) = m.request_snapshot().await {
                                    tracing::warn!("instantané post-reconnexion refusé: {e}");
                                }
                            });
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        manager.dispatch(publish).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if manager.inner.lock().epoch != epoch {
                            return;
                        }
                        attempts += 1;
                        if attempts > max {
                            tracing::error!(
                                "session push abandonnée après {max} tentatives: {e:?}"
                            );
                            manager.health.mark_push_failed();
                            manager.fail_session(epoch);
                            return;
                        }
                        manager.health.increment_reconnects();
                        manager.set_state(epoch, SessionState::Reconnecting);
                        let delay = base.saturating_mul(attempts as u64);
                        tracing::warn!(
                            "push perdu ({e:?}), tentative {attempts}/{max} dans {delay}s"
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        });
    }

    async fn resubscribe_all(&self) {
        let (client, ids) = {
            let inner = self.inner.lock();
            (inner.client.clone(), inner.watched.iter().cloned().collect::<Vec<_>>())
        };
        let Some(client) = client else { return };
        for imei in ids {
            if let Err(e) = client.subscribe(packet_topic(&imei), QoS::AtLeastOnce).await {
                tracing::warn!("réabonnement {imei} refusé: {e}");
                continue;
            }
            let announce = json!({ "device_id": imei }).to_string();
            if let Err(e) = client.publish(JOIN_TOPIC, QoS::AtLeastOnce, false, announce).await {
                tracing::warn!("annonce join {imei} refusée: {e}");
            }
        }
        let _ = client.subscribe(JOIN_TOPIC, QoS::AtLeastOnce).await;
        let _ = client.subscribe(LEAVE_TOPIC, QoS::AtLeastOnce).await;
    }

    /// Routage d'un message entrant : paquet traceur, commande join ou leave.
    async fn dispatch(&self, publish: Publish) {
        let topic = publish.topic.clone();
        if let Some(imei) = parse_packet_topic(&topic) {
            self.consume_packet(imei, &publish.payload).await;
        } else if topic == JOIN_TOPIC {
            match parse_membership_payload(&publish.payload) {
                Some(id) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.watch([id.clone()]).await {
                            tracing::warn!("join {id} refusé: {e}");
                        }
                    });
                }
                None => tracing::warn!("commande join illisible"),
            }
        } else if topic == LEAVE_TOPIC {
            match parse_membership_payload(&publish.payload) {
                Some(id) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.unwatch([id.clone()]).await {
                            tracing::warn!("leave {id} refusé: {e}");
                        }
                    });
                }
                None => tracing::warn!("commande leave illisible"),
            }
        }
    }

    async fn consume_packet(&self, topic_imei: &str, payload: &[u8]) {
        let Some(pkt) = protocol::normalize(payload, OffsetDateTime::now_utc()) else {
            tracing::warn!("paquet illisible sur {}", packet_topic(topic_imei));
            return;
        };
        if pkt.device_id != topic_imei {
            // Un paquet usurpant le topic d'un autre traceur est rejeté,
            // sinon il créerait une entrée de flotte jamais suivie.
            tracing::warn!(
                "IMEI du paquet ({}) différent du topic ({topic_imei}), paquet rejeté",
                pkt.device_id
            );
            return;
        }
        self.fleet.ingest(&pkt).await;

        // Contrôle d'identité au point de consommation : seul le traceur
        // au premier plan alimente le flux direct.
        let focused_hit = {
            let inner = self.inner.lock();
            inner.focused.as_deref() == Some(pkt.device_id.as_str())
        };
        if focused_hit {
            if let Some(position) = &pkt.position {
                self.live.send_replace(Some(position.clone()));
            }
        }
    }
}

/// Double forme tolérée : IMEI nu (chaîne ou nombre) ou objet {device_id}.
fn parse_membership_payload(payload: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        return match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(map) => protocol::string_alias(&map, protocol::DEVICE_ID_ALIASES),
            _ => None,
        };
    }
    let raw = std::str::from_utf8(payload).ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(raw.to_string())
}
