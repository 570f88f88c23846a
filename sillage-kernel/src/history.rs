/**
 * HISTORIQUE DE TRACES - Fenêtres REST fusionnées avec le direct
 *
 * RÔLE :
 * Ce module assemble les traces : fenêtre historique récupérée en REST
 * auprès du service de positions, fusionnée avec au plus un échantillon
 * direct, dédupliquée et triée.
 *
 * FONCTIONNEMENT :
 * - HistorySource trait = interface commune des fournisseurs d'historique
 * - HttpHistorySource = implémentation reqwest (lignes aux champs aliasés)
 * - RouteSet = ensemble canonique trié décroissant, clef (imei, horodatage)
 * - range_to_utc = conversion date+heure locales en instant UTC absolu
 *
 * UTILITÉ DANS SILLAGE :
 * ✅ Une trace cohérente même quand direct et REST s'entrelacent
 * ✅ Plafond de points en vue, sans re-requête au stockage
 * ✅ Un traceur en échec ne fait pas tomber le lot entier
 */

use crate::models::LocationSample;
use crate::protocol;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("plage invalide: {0}")]
    InvalidRange(String),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("réponse {0} du service historique")]
    Status(reqwest::StatusCode),
    #[error("format de réponse inattendu: {0}")]
    Decode(String),
    #[error("horodatage: {0}")]
    TimeFormat(#[from] time::error::Format),
}

/// Fenêtre de requête, bornes absolues UTC.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_id: String,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub page: Option<u32>,
    pub limit: Option<usize>,
}

/// Fournisseur d'historique de positions.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<LocationSample>, HistoryError>;
}

/// Implémentation REST. Tolère les lignes aux champs aliasés ou invalides :
/// une ligne indécodable est ignorée, pas fatale.
pub struct HttpHistorySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistorySource {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<LocationSample>, HistoryError> {
        if query.from > query.to {
            return Err(HistoryError::InvalidRange(format!(
                "début {} après fin {}",
                query.from, query.to
            )));
        }

        let url = format!("{}/devices/{}/positions", self.base_url, query.device_id);
        let mut params = vec![
            ("from".to_string(), query.from.format(&Rfc3339)?),
            ("to".to_string(), query.to.format(&Rfc3339)?),
        ];
        if let Some(page) = query.page {
            params.push(("page".to_string(), page.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self.client.get(&url).query(&params).send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status(response.status()));
        }

        let body: Value = response.json().await.map_err(HistoryError::Transport)?;
        let rows = body
            .as_array()
            .cloned()
            .or_else(|| body.get("positions").and_then(Value::as_array).cloned())
            .or_else(|| body.get("data").and_then(Value::as_array).cloned())
            .ok_or_else(|| HistoryError::Decode("ni tableau ni enveloppe positions".into()))?;

        let mut samples = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in &rows {
            match row_to_sample(row, &query.device_id) {
                Some(s) => samples.push(s),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(
                "{} lignes historiques ignorées pour {}",
                skipped,
                query.device_id
            );
        }
        Ok(samples)
    }
}

/// Lignes hétérogènes : mêmes alias que les paquets directs.
fn row_to_sample(row: &Value, fallback_device: &str) -> Option<LocationSample> {
    let obj = row.as_object()?;
    let recorded_at = protocol::instant_alias(obj, protocol::TIMESTAMP_ALIASES)?;
    let latitude = protocol::coord_alias(obj, protocol::LAT_ALIASES, -90.0, 90.0)?;
    let longitude = protocol::coord_alias(obj, protocol::LON_ALIASES, -180.0, 180.0)?;
    let device_id = protocol::string_alias(obj, protocol::DEVICE_ID_ALIASES)
        .unwrap_or_else(|| fallback_device.to_string());

    let mut sample =
        LocationSample::try_new(device_id, latitude, longitude, recorded_at, recorded_at)?;
    sample.speed = protocol::numeric_alias(obj, &["speed"]);
    sample.course = protocol::numeric_alias(obj, &["course", "heading"]);
    Some(sample)
}

/// Trace canonique : triée décroissante par horodatage, dédupliquée
/// sur (imei, horodatage).
#[derive(Debug, Clone, Default)]
pub struct RouteSet {
    points: Vec<LocationSample>,
}

impl RouteSet {
    pub fn from_history(samples: Vec<LocationSample>) -> Self {
        let mut set = Self { points: samples };
        set.canonicalize();
        set
    }

    /// Insère l'échantillon direct sauf si un point partage déjà sa clef.
    /// Retourne true si le point a été retenu.
    pub fn merge_live(&mut self, live: LocationSample) -> bool {
        let duplicate = self
            .points
            .iter()
            .any(|p| p.device_id == live.device_id && p.recorded_at == live.recorded_at);
        if duplicate {
            return false;
        }
        self.points.insert(0, live);
        self.canonicalize();
        true
    }

    fn canonicalize(&mut self) {
        self.points.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        self.points
            .dedup_by(|a, b| a.recorded_at == b.recorded_at && a.device_id == b.device_id);
    }

    /// Ordre canonique complet, du plus récent au plus ancien.
    pub fn points(&self) -> &[LocationSample] {
        &self.points
    }

    /// Vue plafonnée aux K points les plus récents. Pure vue, aucune re-requête.
    pub fn capped(&self, k: usize) -> &[LocationSample] {
        &self.points[..k.min(self.points.len())]
    }

    /// Copie chronologique (ancien vers récent) pour la relecture.
    pub fn chronological(&self) -> Vec<LocationSample> {
        let mut points = self.points.clone();
        points.reverse();
        points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Fenêtre historique plus au plus un échantillon direct.
pub async fn assemble<S>(
    source: &S,
    query: &HistoryQuery,
    live: Option<LocationSample>,
) -> Result<RouteSet, HistoryError>
where
    S: HistorySource + ?Sized,
{
    let rows = source.fetch(query).await?;
    let mut set = RouteSet::from_history(rows);
    if let Some(sample) = live {
        set.merge_live(sample);
    }
    Ok(set)
}

/// Lot multi-traceurs : un échec individuel dégrade le traceur concerné
/// en trace vide sans interrompre les autres.
pub async fn assemble_many<S>(source: &S, queries: &[HistoryQuery]) -> HashMap<String, RouteSet>
where
    S: HistorySource + ?Sized,
{
    let mut out = HashMap::new();
    for query in queries {
        match source.fetch(query).await {
            Ok(rows) => {
                out.insert(query.device_id.clone(), RouteSet::from_history(rows));
            }
            Err(e) => {
                tracing::warn!("historique indisponible pour {}: {e}", query.device_id);
                out.insert(query.device_id.clone(), RouteSet::default());
            }
        }
    }
    out
}

/// Convertit une paire date+heure locale en instant UTC absolu.
/// L'heure accepte "HH:MM" ou "HH:MM:SS"; l'écart local est en minutes.
pub fn range_to_utc(date: &str, local_time: &str, offset_minutes: i32) -> Result<OffsetDateTime, HistoryError> {
    let date_fmt = format_description!("[year]-[month]-[day]");
    let parsed_date = Date::parse(date, &date_fmt)
        .map_err(|e| HistoryError::InvalidRange(format!("date {date}: {e}")))?;

    let hms = format_description!("[hour]:[minute]:[second]");
    let hm = format_description!("[hour]:[minute]");
    let parsed_time = Time::parse(local_time, &hms)
        .or_else(|_| Time::parse(local_time, &hm))
        .map_err(|e| HistoryError::InvalidRange(format!("heure {local_time}: {e}")))?;

    let offset = UtcOffset::from_whole_seconds(offset_minutes * 60)
        .map_err(|e| HistoryError::InvalidRange(format!("écart {offset_minutes}min: {e}")))?;

    Ok(PrimitiveDateTime::new(parsed_date, parsed_time)
        .assume_offset(offset)
        .to_offset(UtcOffset::UTC))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    fn sample(imei: &str, ts: i64, lat: f64) -> LocationSample {
        LocationSample::try_new(imei, lat, -103.35, at(ts), at(ts)).unwrap()
    }

    #[test]
    fn history_is_sorted_descending() {
        let set = RouteSet::from_history(vec![
            sample("d1", 100, 1.0),
            sample("d1", 300, 3.0),
            sample("d1", 200, 2.0),
        ]);
        let ts: Vec<i64> = set.points().iter().map(|p| p.recorded_at.unix_timestamp()).collect();
        assert_eq!(ts, vec![300, 200, 100]);
    }

    #[test]
    fn duplicate_keys_are_collapsed() {
        let set = RouteSet::from_history(vec![
            sample("d1", 100, 1.0),
            sample("d1", 100, 9.0),
            sample("d1", 200, 2.0),
        ]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn live_sample_prepends_unless_duplicate() {
        let mut set = RouteSet::from_history(vec![sample("d1", 100, 1.0), sample("d1", 200, 2.0)]);

        // Même clef : refusé, l'existant gagne.
        assert!(!set.merge_live(sample("d1", 200, 9.9)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.points()[0].latitude, 2.0);

        // Clef neuve : inséré en tête après tri.
        assert!(set.merge_live(sample("d1", 300, 3.0)));
        assert_eq!(set.points()[0].recorded_at.unix_timestamp(), 300);
    }

    #[test]
    fn merge_is_idempotent_under_replay() {
        let mut set = RouteSet::from_history(vec![sample("d1", 100, 1.0)]);
        let live = sample("d1", 150, 1.5);
        assert!(set.merge_live(live.clone()));
        assert!(!set.merge_live(live.clone()));
        assert!(!set.merge_live(live));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn out_of_order_live_sample_lands_in_place() {
        let mut set = RouteSet::from_history(vec![sample("d1", 100, 1.0), sample("d1", 300, 3.0)]);
        assert!(set.merge_live(sample("d1", 200, 2.0)));
        let ts: Vec<i64> = set.points().iter().map(|p| p.recorded_at.unix_timestamp()).collect();
        assert_eq!(ts, vec![300, 200, 100]);
    }

    #[test]
    fn cap_is_a_view_over_most_recent() {
        let set = RouteSet::from_history(vec![
            sample("d1", 100, 1.0),
            sample("d1", 200, 2.0),
            sample("d1", 300, 3.0),
        ]);
        let capped = set.capped(2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].recorded_at.unix_timestamp(), 300);
        assert_eq!(capped[1].recorded_at.unix_timestamp(), 200);
        assert_eq!(set.capped(50).len(), 3);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn chronological_reverses_canonical_order() {
        let set = RouteSet::from_history(vec![sample("d1", 200, 2.0), sample("d1", 100, 1.0)]);
        let ts: Vec<i64> = set
            .chronological()
            .iter()
            .map(|p| p.recorded_at.unix_timestamp())
            .collect();
        assert_eq!(ts, vec![100, 200]);
    }

    #[test]
    fn local_range_converts_to_utc() {
        // 14:30 à l'écart +02:00 = 12:30 UTC.
        let utc = range_to_utc("2026-08-21", "14:30", 120).unwrap();
        assert_eq!(utc.offset(), UtcOffset::UTC);
        assert_eq!(utc.unix_timestamp(), 1_787_315_400);

        // Sans écart, la paire est déjà absolue.
        let plain = range_to_utc("2026-08-21", "14:30:00", 0).unwrap();
        assert_eq!(plain.unix_timestamp(), 1_787_322_600);

        // Écart négatif (ouest).
        let west = range_to_utc("2026-08-21", "06:00", -360).unwrap();
        assert_eq!(west.unix_timestamp(), 1_787_313_600);
    }

    #[test]
    fn malformed_range_is_rejected() {
        assert!(range_to_utc("21/08/2026", "14:30", 0).is_err());
        assert!(range_to_utc("2026-08-21", "25:99", 0).is_err());
        assert!(range_to_utc("2026-08-21", "14:30", 2_000_000).is_err());
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let rows: Vec<Value> = serde_json::from_str(
            r#"[
                {"lat": 20.0, "lng": -103.0, "ts": 100},
                {"lat": 999.0, "lng": -103.0, "ts": 200},
                {"lat": 21.0, "lng": -103.5},
                "pas un objet",
                {"latitude": 22.0, "lon": -104.0, "fix_time": 300, "speed": 12.5}
            ]"#,
        )
        .unwrap();
        let samples: Vec<_> = rows.iter().filter_map(|r| row_to_sample(r, "d1")).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].device_id, "d1");
        assert_eq!(samples[1].speed, Some(12.5));
    }

    struct StubSource {
        broken: &'static str,
    }

    #[async_trait]
    impl HistorySource for StubSource {
        async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<LocationSample>, HistoryError> {
            if query.device_id == self.broken {
                return Err(HistoryError::Status(reqwest::StatusCode::BAD_GATEWAY));
            }
            Ok(vec![sample(&query.device_id, 100, 1.0), sample(&query.device_id, 200, 2.0)])
        }
    }

    fn query(imei: &str) -> HistoryQuery {
        HistoryQuery { device_id: imei.into(), from: at(0), to: at(1_000), page: None, limit: None }
    }

    #[tokio::test]
    async fn assemble_merges_live_over_fetched_window() {
        let source = StubSource { broken: "none" };
        let set = assemble(&source, &query("d1"), Some(sample("d1", 250, 2.5))).await.unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.points()[0].recorded_at.unix_timestamp(), 250);
    }

    #[tokio::test]
    async fn batch_degrades_broken_device_without_aborting() {
        let source = StubSource { broken: "d2" };
        let queries = vec![query("d1"), query("d2"), query("d3")];
        let routes = assemble_many(&source, &queries).await;
        assert_eq!(routes.len(), 3);
        assert_eq!(routes["d1"].len(), 2);
        assert!(routes["d2"].is_empty());
        assert_eq!(routes["d3"].len(), 2);
    }
}
