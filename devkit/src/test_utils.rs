/*!
Harness de test pour le canal de flotte Sillage

Combine le stub de canal et les générateurs de paquets : suivi d'un traceur,
injection de paquets par forme de protocole, attentes sur les publications.
*/

use crate::packet_builders::PacketBuilder;
use crate::push_stub::PushChannelStub;
use anyhow::Result;
use serde_json::Value;

/// Harness de test : un canal stub + injection par forme de protocole.
#[derive(Default)]
pub struct TestHarness {
    pub channel: PushChannelStub,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self::default()
    }

    /// Abonne le topic paquets du traceur, préalable à toute injection.
    pub fn track(&self, imei: &str) {
        self.channel.track(imei);
    }

    /// Attente : N publications sur un topic, vérifiée par verify_expectations.
    pub fn expect_published(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation { topic: topic.to_string(), expected_count: count });
        self
    }

    /// Injecte une position à plat. Retourne false si le traceur n'est pas suivi.
    pub fn send_position(&self, imei: &str, lat: f64, lng: f64) -> Result<bool> {
        let builder = PacketBuilder::new(imei);
        let payload = serde_json::to_vec(&builder.flat_position(lat, lng))?;
        Ok(self.channel.deliver(builder.packet_topic(), payload))
    }

    /// Injecte un signal de cycle de vie explicite.
    pub fn send_lifecycle(&self, imei: &str, tag: &str) -> Result<bool> {
        let builder = PacketBuilder::new(imei);
        let payload = serde_json::to_vec(&builder.lifecycle(tag))?;
        Ok(self.channel.deliver(builder.packet_topic(), payload))
    }

    /// Injecte un paquet statut (batterie, sans position).
    pub fn send_status(&self, imei: &str, battery: f64) -> Result<bool> {
        let builder = PacketBuilder::new(imei);
        let payload = serde_json::to_vec(&builder.status(battery))?;
        Ok(self.channel.deliver(builder.packet_topic(), payload))
    }

    /// Vérifie toutes les attentes configurées sur les publications.
    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual = self.channel.published_on(&expectation.topic).len();
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "topic '{}': {} publications attendues, {} observées",
                    expectation.topic,
                    expectation.expected_count,
                    actual
                );
            }
        }
        Ok(())
    }

    /// Assert qu'un champ (chemin pointé) du dernier message publié sur un
    /// topic porte la valeur attendue.
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.channel.last_json_on(topic) else {
            anyhow::bail!("aucune publication JSON sur {topic}");
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "champ '{field_path}': attendu {expected:?}, observé {actual:?}"
            ),
            None => anyhow::bail!("champ '{field_path}' absent de {topic}"),
        }
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}
