/*!
Générateurs de paquets traceurs conformes aux formes de protocole Sillage

Facilite le développement en fournissant un constructeur par forme connue:
- Enveloppe versionnée `{ protocol, event: { type, data } }`
- Champs à plat avec alias courts (traceurs legacy)
- Statut pur sans coordonnées
- Commandes join/leave (double forme) et demandes d'instantané
*/

use serde_json::{json, Value};

/// Constructeur de paquets pour un traceur donné
pub struct PacketBuilder {
    imei: String,
}

impl PacketBuilder {
    pub fn new<S: Into<String>>(imei: S) -> Self {
        Self { imei: imei.into() }
    }

    pub fn packet_topic(&self) -> String {
        format!("sillage/fleet/{}/packet@v1", self.imei)
    }

    /// Position en enveloppe versionnée (forme la plus riche)
    pub fn envelope_position(&self, latitude: f64, longitude: f64, speed: f64) -> Value {
        json!({
            "protocol": "gt06",
            "device_id": self.imei,
            "event": {
                "type": "position",
                "data": {
                    "latitude": latitude,
                    "longitude": longitude,
                    "speed": speed,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }
            }
        })
    }

    /// Position à plat avec alias courts (lat/lng, epoch secondes)
    pub fn flat_position(&self, lat: f64, lng: f64) -> Value {
        json!({
            "imei": self.imei,
            "lat": lat,
            "lng": lng,
            "ts": chrono::Utc::now().timestamp(),
        })
    }

    /// Paquet statut pur : jamais de coordonnées
    pub fn status(&self, battery: f64) -> Value {
        json!({
            "protocol": "status",
            "device_id": self.imei,
            "battery": battery,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Signal de cycle de vie explicite (connection|login|reconnection|disconnection)
    pub fn lifecycle(&self, tag: &str) -> Value {
        json!({
            "device_id": self.imei,
            "status": tag,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Commande join/leave, forme objet
    pub fn membership_object(&self) -> Value {
        json!({ "device_id": self.imei })
    }

    /// Commande join/leave, forme IMEI nu
    pub fn membership_bare(&self) -> String {
        self.imei.clone()
    }

    /// Demande d'instantané de flotte
    pub fn snapshot_request(request_id: &str) -> Value {
        json!({
            "request_id": request_id,
            "requested_at": chrono::Utc::now().to_rfc3339(),
        })
    }
}
