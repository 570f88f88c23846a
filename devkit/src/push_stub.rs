/*!
Stub du canal de flotte pour développement sans broker

Reproduit en mémoire le comportement du canal push Sillage : la remise d'un
paquet n'aboutit que si le topic est effectivement abonné, comme chez un vrai
broker. Le stub connaît la taxonomie des topics de flotte (paquets par IMEI,
commandes join/leave) et sait en restituer une lecture métier pour les
assertions de tests.
*/

use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const JOIN_TOPIC: &str = "sillage/fleet/join@v1";
const LEAVE_TOPIC: &str = "sillage/fleet/leave@v1";

#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Stub du canal push : abonnements, publications et boîte de réception
/// simulés. Clonable, tous les clones partagent le même canal.
#[derive(Clone, Default)]
pub struct PushChannelStub {
    subscriptions: Arc<Mutex<HashSet<String>>>,
    published: Arc<Mutex<Vec<FeedMessage>>>,
    inbox: Arc<Mutex<VecDeque<FeedMessage>>>,
}

impl PushChannelStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<S: Into<String>>(&self, topic: S) {
        self.subscriptions.lock().unwrap().insert(topic.into());
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions.lock().unwrap().remove(topic);
    }

    /// Abonne le topic paquets d'un traceur, comme le ferait un watch.
    pub fn track(&self, imei: &str) {
        self.subscribe(format!("sillage/fleet/{imei}/packet@v1"));
    }

    /// Publication sortante, enregistrée pour les assertions.
    pub fn publish<S, V>(&self, topic: S, payload: V)
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.published
            .lock()
            .unwrap()
            .push(FeedMessage { topic: topic.into(), payload: payload.into() });
    }

    /// Remise entrante. Comme un broker : un topic non abonné ne livre rien.
    /// Retourne true si le message a atteint la boîte de réception.
    pub fn deliver<S, V>(&self, topic: S, payload: V) -> bool
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if !self.subscriptions.lock().unwrap().contains(&topic) {
            return false;
        }
        self.inbox
            .lock()
            .unwrap()
            .push_back(FeedMessage { topic, payload: payload.into() });
        true
    }

    /// Vide la boîte de réception, dans l'ordre de remise.
    pub fn drain_inbox(&self) -> Vec<FeedMessage> {
        self.inbox.lock().unwrap().drain(..).collect()
    }

    /// IMEI dont le topic paquets est abonné, triés.
    pub fn tracked_imeis(&self) -> Vec<String> {
        let mut imeis: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| {
                t.strip_prefix("sillage/fleet/")?
                    .strip_suffix("/packet@v1")
                    .map(str::to_string)
            })
            .collect();
        imeis.sort();
        imeis
    }

    pub fn published_on(&self, topic: &str) -> Vec<FeedMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message publié sur un topic, décodé en JSON.
    pub fn last_json_on(&self, topic: &str) -> Option<Value> {
        let published = self.published.lock().unwrap();
        let last = published.iter().rev().find(|m| m.topic == topic)?;
        serde_json::from_slice(&last.payload).ok()
    }

    /// IMEI annoncés en join, double forme acceptée (objet ou IMEI nu).
    pub fn announced_joins(&self) -> Vec<String> {
        self.membership_ids(JOIN_TOPIC)
    }

    pub fn announced_leaves(&self) -> Vec<String> {
        self.membership_ids(LEAVE_TOPIC)
    }

    fn membership_ids(&self, topic: &str) -> Vec<String> {
        self.published_on(topic)
            .iter()
            .filter_map(|m| membership_id(&m.payload))
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
        self.inbox.lock().unwrap().clear();
    }
}

fn membership_id(payload: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        return match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Object(map) => map
                .get("device_id")
                .or_else(|| map.get("imei"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
    }
    let raw = std::str::from_utf8(payload).ok()?.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_requires_an_active_subscription() {
        let stub = PushChannelStub::new();
        assert!(!stub.deliver("sillage/fleet/IMEI1/packet@v1", b"{}".to_vec()));

        stub.track("IMEI1");
        assert!(stub.deliver("sillage/fleet/IMEI1/packet@v1", b"{}".to_vec()));
        assert!(!stub.deliver("sillage/fleet/IMEI2/packet@v1", b"{}".to_vec()));

        let inbox = stub.drain_inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].topic, "sillage/fleet/IMEI1/packet@v1");
        assert!(stub.drain_inbox().is_empty(), "drain vide la boîte");
    }

    #[test]
    fn tracked_imeis_come_from_packet_topics_only() {
        let stub = PushChannelStub::new();
        stub.track("IMEI2");
        stub.track("IMEI1");
        stub.subscribe(JOIN_TOPIC);
        assert_eq!(stub.tracked_imeis(), vec!["IMEI1", "IMEI2"]);

        stub.unsubscribe("sillage/fleet/IMEI1/packet@v1");
        assert_eq!(stub.tracked_imeis(), vec!["IMEI2"]);
    }

    #[test]
    fn membership_announcements_accept_both_forms() {
        let stub = PushChannelStub::new();
        stub.publish(JOIN_TOPIC, br#"{"device_id": "IMEI1"}"#.to_vec());
        stub.publish(JOIN_TOPIC, b"IMEI2".to_vec());
        stub.publish(LEAVE_TOPIC, br#"{"imei": "IMEI1"}"#.to_vec());

        assert_eq!(stub.announced_joins(), vec!["IMEI1", "IMEI2"]);
        assert_eq!(stub.announced_leaves(), vec!["IMEI1"]);
    }

    #[test]
    fn last_json_wins_over_earlier_publications() {
        let stub = PushChannelStub::new();
        stub.publish("sillage/kernel/health@v1", br#"{"uptime_seconds": 1}"#.to_vec());
        stub.publish("sillage/kernel/health@v1", br#"{"uptime_seconds": 2}"#.to_vec());

        let last = stub.last_json_on("sillage/kernel/health@v1").unwrap();
        assert_eq!(last["uptime_seconds"], 2);
        assert!(stub.last_json_on("autre/topic").is_none());
    }
}
