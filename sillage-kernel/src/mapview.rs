// Vue carte : fonction pure, aucun état propre. Tout vient du registre,
// de la trace et de l'éventuel rejeu en cours.

use crate::geo;
use crate::history::RouteSet;
use crate::models::{DeviceStatus, DeviceConnectionState, LocationSample};
use crate::playback::{PlaybackFrame, PlaybackPhase};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct MarkerView {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl From<&LocationSample> for MarkerView {
    fn from(s: &LocationSample) -> Self {
        Self {
            latitude: s.latitude,
            longitude: s.longitude,
            speed: s.speed,
            course: s.course,
            recorded_at: s.recorded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MapFrame {
    pub device_id: String,
    pub status: DeviceStatus,
    pub marker: Option<MarkerView>,
    /// Trace complète en ordre chronologique, paires [lat, lon].
    pub polyline: Vec<[f64; 2]>,
    /// Segment déjà parcouru : tronqué à l'index de rejeu, sinon la trace entière.
    pub revealed: Vec<[f64; 2]>,
    pub is_playing: bool,
    pub playback_index: Option<usize>,
    pub route_km: f64,
}

pub fn build_map_frame(
    device: &DeviceConnectionState,
    route: &RouteSet,
    playback: Option<&PlaybackFrame>,
) -> MapFrame {
    let chronological = route.chronological();
    let polyline: Vec<[f64; 2]> = chronological.iter().map(|p| [p.latitude, p.longitude]).collect();
    let route_km = geo::route_km(&chronological);

    // Garde obligatoire : un rejeu lié à un autre traceur ne pilote jamais
    // cette vue, même si l'appelant s'est trompé de cadre.
    let bound = playback.filter(|f| f.device_id.as_deref() == Some(device.device_id.as_str()));

    match bound {
        Some(frame) => {
            let cutoff = (frame.index + 1).min(polyline.len());
            MapFrame {
                device_id: device.device_id.clone(),
                status: device.status,
                marker: frame.position.as_ref().map(MarkerView::from),
                revealed: polyline[..cutoff].to_vec(),
                polyline,
                is_playing: frame.phase == PlaybackPhase::Playing,
                playback_index: Some(frame.index),
                route_km,
            }
        }
        None => MapFrame {
            device_id: device.device_id.clone(),
            status: device.status,
            marker: device.last_position.as_ref().map(MarkerView::from),
            revealed: polyline.clone(),
            polyline,
            is_playing: false,
            playback_index: None,
            route_km,
        },
    }
}
