use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Échantillon de position validé (coordonnées garanties dans les bornes).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LocationSample {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: Option<f64>,
    /// degrés, 0..360
    pub course: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl LocationSample {
    pub fn try_new(
        device_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        recorded_at: OffsetDateTime,
        received_at: OffsetDateTime,
    ) -> Option<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return None;
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            device_id: device_id.into(),
            latitude,
            longitude,
            speed: None,
            course: None,
            recorded_at,
            received_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Connected,
    Disconnected,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityKind {
    Connection,
    Login,
    Reconnection,
    Disconnection,
}

impl ConnectivityKind {
    pub fn status(self) -> DeviceStatus {
        match self {
            ConnectivityKind::Connection
            | ConnectivityKind::Login
            | ConnectivityKind::Reconnection => DeviceStatus::Connected,
            ConnectivityKind::Disconnection => DeviceStatus::Disconnected,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnectivityEvent {
    pub device_id: String,
    pub kind: ConnectivityKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Paquet normalisé, sortie unique du décodage protocole.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NormalizedPacket {
    pub device_id: String,
    pub position: Option<LocationSample>,
    pub connectivity: Option<ConnectivityEvent>,
    pub battery: Option<f64>,
}

/// État courant d'un traceur tel que tenu par le registre de flotte.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConnectionState {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_position: Option<LocationSample>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_packet_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_connection_at: Option<OffsetDateTime>,
    pub battery: Option<f64>,
}

impl DeviceConnectionState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: DeviceStatus::Unknown,
            last_position: None,
            last_packet_at: None,
            last_connection_at: None,
            battery: None,
        }
    }
}

pub type FleetMap = HashMap<String, DeviceConnectionState>;
