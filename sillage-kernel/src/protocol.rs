/**
 * NORMALISATEUR PROTOCOLE - Décodage des paquets traceurs hétérogènes
 *
 * RÔLE :
 * Ce module transforme les paquets bruts poussés par les traceurs GPS
 * (familles de protocoles multiples, champs aliasés) en NormalizedPacket
 * canonique. Unique point d'entrée du décodage : tout le reste du kernel
 * ne voit que des paquets normalisés.
 *
 * FONCTIONNEMENT :
 * - Détection de forme par dispatch fermé : Envelope, Flat, StatusOnly, Unknown
 * - Extraction coordonnées par liste d'alias ordonnée (premier alias valide gagne)
 * - Variante "status" : jamais de coordonnées, extraction court-circuitée
 * - Tags cycle de vie : connection|login|reconnection|disconnection
 * - Fonction pure : aucun effet de bord, l'appelant journalise les rejets
 *
 * UTILITÉ DANS SILLAGE :
 * 🎯 Isoler le zoo des protocoles constructeurs du reste du kernel
 * 🎯 Garantir l'invariant coordonnées (lat ∈ [-90,90], lon ∈ [-180,180])
 * 🎯 Classification déterministe et testable des paquets inconnus
 */

use crate::models::{ConnectivityEvent, ConnectivityKind, LocationSample, NormalizedPacket};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub(crate) const DEVICE_ID_ALIASES: &[&str] = &["device_id", "imei", "deviceId"];
pub(crate) const LAT_ALIASES: &[&str] = &["latitude", "lat"];
pub(crate) const LON_ALIASES: &[&str] = &["longitude", "lng", "lon"];
pub(crate) const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "ts", "fix_time"];
const BATTERY_ALIASES: &[&str] = &["battery", "battery_level", "bat"];

/// Familles de paquets reconnues. Unknown est une classification terminale
/// valide : l'extraction continue sur les champs présents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketShape {
    /// Enveloppe versionnée `{ protocol, event: { type, data } }`.
    Envelope,
    /// Champs à plat au premier niveau (traceurs legacy).
    Flat,
    /// Famille statut pur, ne porte jamais de coordonnées.
    StatusOnly,
    Unknown,
}

pub fn detect_shape(root: &Map<String, Value>) -> PacketShape {
    if let Some(tag) = root.get("protocol").and_then(Value::as_str) {
        if tag.eq_ignore_ascii_case("status") {
            return PacketShape::StatusOnly;
        }
        if root.get("event").map(Value::is_object).unwrap_or(false) {
            return PacketShape::Envelope;
        }
        return PacketShape::Flat;
    }
    if root.get("event").map(Value::is_object).unwrap_or(false) {
        return PacketShape::Envelope;
    }
    if DEVICE_ID_ALIASES
        .iter()
        .chain(LAT_ALIASES)
        .chain(LON_ALIASES)
        .any(|k| root.contains_key(*k))
    {
        return PacketShape::Flat;
    }
    PacketShape::Unknown
}

/// Décode un paquet brut. Retourne None si le payload est inexploitable
/// ou ne porte aucun identifiant de traceur.
pub fn normalize(payload: &[u8], received_at: OffsetDateTime) -> Option<NormalizedPacket> {
    let root = parse_root(payload)?;
    let shape = detect_shape(&root);

    let event_obj = root.get("event").and_then(Value::as_object);
    let data = event_obj.and_then(|e| unwrap_data(e.get("data")));

    let device_id = string_alias(&root, DEVICE_ID_ALIASES)
        .or_else(|| data.as_ref().and_then(|d| string_alias(d, DEVICE_ID_ALIASES)))?;

    // Objet porteur de la position : data de l'enveloppe si présent, racine sinon.
    let pos_obj: &Map<String, Value> = data.as_ref().unwrap_or(&root);

    let recorded_at = instant_alias(pos_obj, TIMESTAMP_ALIASES)
        .or_else(|| instant_alias(&root, TIMESTAMP_ALIASES))
        .unwrap_or(received_at);

    let position = if shape == PacketShape::StatusOnly {
        None
    } else {
        extract_position(&device_id, pos_obj, recorded_at, received_at)
    };

    let connectivity = extract_connectivity(&device_id, &root, event_obj, recorded_at);

    let battery = numeric_alias(&root, BATTERY_ALIASES)
        .or_else(|| numeric_alias(pos_obj, BATTERY_ALIASES));

    Some(NormalizedPacket { device_id, position, connectivity, battery })
}

/// Payload JSON direct, ou chaîne contenant elle-même du JSON (un niveau).
fn parse_root(payload: &[u8]) -> Option<Map<String, Value>> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    match value {
        Value::Object(map) => Some(map),
        Value::String(inner) => match serde_json::from_str::<Value>(&inner).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Le champ data d'une enveloppe peut être un objet ou une chaîne JSON.
fn unwrap_data(data: Option<&Value>) -> Option<Map<String, Value>> {
    match data? {
        Value::Object(map) => Some(map.clone()),
        Value::String(inner) => match serde_json::from_str::<Value>(inner).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn extract_position(
    device_id: &str,
    obj: &Map<String, Value>,
    recorded_at: OffsetDateTime,
    received_at: OffsetDateTime,
) -> Option<LocationSample> {
    let latitude = coord_alias(obj, LAT_ALIASES, -90.0, 90.0)?;
    let longitude = coord_alias(obj, LON_ALIASES, -180.0, 180.0)?;
    let mut sample =
        LocationSample::try_new(device_id, latitude, longitude, recorded_at, received_at)?;
    sample.speed = numeric_alias(obj, &["speed"]);
    sample.course = numeric_alias(obj, &["course", "heading"]);
    Some(sample)
}

fn extract_connectivity(
    device_id: &str,
    root: &Map<String, Value>,
    event_obj: Option<&Map<String, Value>>,
    at: OffsetDateTime,
) -> Option<ConnectivityEvent> {
    let candidates = [
        event_obj.and_then(|e| e.get("type")).and_then(Value::as_str),
        root.get("status").and_then(Value::as_str),
        root.get("type").and_then(Value::as_str),
    ];
    let kind = candidates.into_iter().flatten().find_map(lifecycle_kind)?;
    Some(ConnectivityEvent { device_id: device_id.to_string(), kind, at })
}

fn lifecycle_kind(tag: &str) -> Option<ConnectivityKind> {
    let t = tag.trim();
    if t.eq_ignore_ascii_case("connection") {
        Some(ConnectivityKind::Connection)
    } else if t.eq_ignore_ascii_case("login") {
        Some(ConnectivityKind::Login)
    } else if t.eq_ignore_ascii_case("reconnection") {
        Some(ConnectivityKind::Reconnection)
    } else if t.eq_ignore_ascii_case("disconnection") {
        Some(ConnectivityKind::Disconnection)
    } else {
        None
    }
}

/// Premier alias portant une valeur numérique finie dans les bornes.
pub(crate) fn coord_alias(obj: &Map<String, Value>, aliases: &[&str], min: f64, max: f64) -> Option<f64> {
    aliases
        .iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_f64))
        .find(|v| v.is_finite() && *v >= min && *v <= max)
}

pub(crate) fn numeric_alias(obj: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_f64))
        .find(|v| v.is_finite())
}

pub(crate) fn string_alias(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Instant RFC3339, ou epoch (secondes, millisecondes au-delà de 1e12).
pub(crate) fn instant_alias(obj: &Map<String, Value>, aliases: &[&str]) -> Option<OffsetDateTime> {
    aliases.iter().filter_map(|k| obj.get(*k)).find_map(parse_instant)
}

fn parse_instant(v: &Value) -> Option<OffsetDateTime> {
    if let Some(s) = v.as_str() {
        return OffsetDateTime::parse(s, &Rfc3339).ok();
    }
    let n = v.as_f64()?;
    if !n.is_finite() {
        return None;
    }
    let secs = if n.abs() >= 1e12 { n / 1000.0 } else { n };
    OffsetDateTime::from_unix_timestamp_nanos((secs * 1e9) as i128).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceStatus;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn normalize_str(payload: &str) -> Option<NormalizedPacket> {
        normalize(payload.as_bytes(), now())
    }

    #[test]
    fn envelope_position_packet() {
        let pkt = normalize_str(
            r#"{
                "protocol": "gt06",
                "device_id": "860000000000001",
                "event": {
                    "type": "position",
                    "data": {
                        "latitude": 20.6736,
                        "longitude": -103.3440,
                        "speed": 42.5,
                        "course": 180.0,
                        "timestamp": "2026-08-21T10:00:00Z"
                    }
                },
                "battery": 87.5
            }"#,
        )
        .unwrap();
        assert_eq!(pkt.device_id, "860000000000001");
        let pos = pkt.position.unwrap();
        assert_eq!(pos.latitude, 20.6736);
        assert_eq!(pos.longitude, -103.3440);
        assert_eq!(pos.speed, Some(42.5));
        assert_eq!(pos.course, Some(180.0));
        assert_eq!(pos.recorded_at.unix_timestamp(), 1_787_306_400);
        assert_eq!(pkt.battery, Some(87.5));
        assert!(pkt.connectivity.is_none());
    }

    #[test]
    fn flat_packet_with_short_aliases() {
        let pkt = normalize_str(
            r#"{"imei": "860000000000002", "lat": -12.5, "lng": 130.9, "speed": 8.0, "ts": 1755770000}"#,
        )
        .unwrap();
        let pos = pkt.position.unwrap();
        assert_eq!(pos.latitude, -12.5);
        assert_eq!(pos.longitude, 130.9);
        assert_eq!(pos.recorded_at.unix_timestamp(), 1_755_770_000);
    }

    #[test]
    fn first_alias_in_priority_order_wins() {
        let pkt = normalize_str(
            r#"{"device_id": "d1", "latitude": 10.0, "lat": 55.0, "longitude": 20.0, "lng": 66.0}"#,
        )
        .unwrap();
        let pos = pkt.position.unwrap();
        assert_eq!(pos.latitude, 10.0);
        assert_eq!(pos.longitude, 20.0);
    }

    #[test]
    fn out_of_range_alias_falls_through_to_next() {
        let pkt = normalize_str(r#"{"device_id": "d1", "latitude": 120.0, "lat": 45.0, "lng": 6.0}"#)
            .unwrap();
        let pos = pkt.position.unwrap();
        assert_eq!(pos.latitude, 45.0);
    }

    #[test]
    fn non_numeric_alias_is_skipped() {
        let pkt =
            normalize_str(r#"{"device_id": "d1", "latitude": "20.67", "lat": 20.67, "lon": -103.35}"#)
                .unwrap();
        assert_eq!(pkt.position.unwrap().latitude, 20.67);
    }

    #[test]
    fn no_valid_coordinates_means_no_position() {
        let pkt = normalize_str(r#"{"device_id": "d1", "latitude": 999.0, "battery": 64.0}"#).unwrap();
        assert!(pkt.position.is_none());
        assert_eq!(pkt.battery, Some(64.0));
    }

    #[test]
    fn status_shape_short_circuits_stray_coordinates() {
        let pkt = normalize_str(
            r#"{"protocol": "status", "device_id": "d1", "status": "connection", "lat": 20.0, "lng": 10.0, "battery": 91.0}"#,
        )
        .unwrap();
        assert!(pkt.position.is_none());
        let ev = pkt.connectivity.unwrap();
        assert_eq!(ev.kind, ConnectivityKind::Connection);
        assert_eq!(ev.kind.status(), DeviceStatus::Connected);
        assert_eq!(pkt.battery, Some(91.0));
    }

    #[test]
    fn lifecycle_tags_classify() {
        for (tag, status) in [
            ("connection", DeviceStatus::Connected),
            ("login", DeviceStatus::Connected),
            ("reconnection", DeviceStatus::Connected),
            ("disconnection", DeviceStatus::Disconnected),
        ] {
            let pkt = normalize_str(&format!(r#"{{"device_id": "d1", "status": "{tag}"}}"#)).unwrap();
            assert_eq!(pkt.connectivity.unwrap().kind.status(), status, "tag {tag}");
        }
    }

    #[test]
    fn unrecognized_tag_yields_no_connectivity() {
        let pkt = normalize_str(r#"{"device_id": "d1", "status": "heartbeat"}"#).unwrap();
        assert!(pkt.connectivity.is_none());
    }

    #[test]
    fn envelope_lifecycle_event() {
        let pkt = normalize_str(
            r#"{"device_id": "d1", "event": {"type": "disconnection"}, "timestamp": "2026-08-21T09:30:00Z"}"#,
        )
        .unwrap();
        let ev = pkt.connectivity.unwrap();
        assert_eq!(ev.kind, ConnectivityKind::Disconnection);
        assert_eq!(ev.at.unix_timestamp(), 1_787_304_600);
    }

    #[test]
    fn missing_device_id_is_dropped() {
        assert!(normalize_str(r#"{"lat": 20.0, "lng": 10.0}"#).is_none());
    }

    #[test]
    fn garbage_payload_is_dropped() {
        assert!(normalize(b"\x00\x01garbage", now()).is_none());
        assert!(normalize_str("[1, 2, 3]").is_none());
    }

    #[test]
    fn double_encoded_payload_is_unwrapped() {
        let inner = r#"{"device_id": "d9", "lat": 1.5, "lon": 2.5}"#;
        let outer = serde_json::to_string(&Value::String(inner.to_string())).unwrap();
        let pkt = normalize_str(&outer).unwrap();
        assert_eq!(pkt.device_id, "d9");
        assert_eq!(pkt.position.unwrap().longitude, 2.5);
    }

    #[test]
    fn envelope_data_as_json_string() {
        let pkt = normalize_str(
            r#"{"device_id": "d2", "event": {"type": "position", "data": "{\"latitude\": 3.0, \"longitude\": 4.0}"}}"#,
        )
        .unwrap();
        assert_eq!(pkt.position.unwrap().latitude, 3.0);
    }

    #[test]
    fn epoch_milliseconds_accepted() {
        let pkt = normalize_str(
            r#"{"device_id": "d1", "lat": 1.0, "lon": 1.0, "ts": 1755770000000}"#,
        )
        .unwrap();
        assert_eq!(pkt.position.unwrap().recorded_at.unix_timestamp(), 1_755_770_000);
    }

    #[test]
    fn numeric_device_id_is_stringified() {
        let pkt = normalize_str(r#"{"imei": 860000000000003, "lat": 5.0, "lon": 6.0}"#).unwrap();
        assert_eq!(pkt.device_id, "860000000000003");
    }

    #[test]
    fn shape_detection() {
        let obj = |s: &str| -> Map<String, Value> {
            serde_json::from_str::<Value>(s).unwrap().as_object().unwrap().clone()
        };
        assert_eq!(detect_shape(&obj(r#"{"protocol": "status"}"#)), PacketShape::StatusOnly);
        assert_eq!(detect_shape(&obj(r#"{"protocol": "gt06", "event": {}}"#)), PacketShape::Envelope);
        assert_eq!(detect_shape(&obj(r#"{"event": {"type": "position"}}"#)), PacketShape::Envelope);
        assert_eq!(detect_shape(&obj(r#"{"protocol": "h02", "lat": 1.0}"#)), PacketShape::Flat);
        assert_eq!(detect_shape(&obj(r#"{"lat": 1.0}"#)), PacketShape::Flat);
        assert_eq!(detect_shape(&obj(r#"{"foo": 1}"#)), PacketShape::Unknown);
    }
}
