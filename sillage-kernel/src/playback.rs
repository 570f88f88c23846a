/**
 * RELECTURE DE TRACE - Machine à états de rejeu d'itinéraire
 *
 * RÔLE :
 * Ce module rejoue une trace chronologique point par point pour animer la
 * carte : Stopped -> Playing -> Paused -> Playing -> Completed.
 *
 * FONCTIONNEMENT :
 * - Un seul ticker tokio actif par moteur, période base_interval / vitesse
 * - Changement de vitesse ou d'état = remplacement atomique du ticker
 *   (abort + génération incrémentée, un tick périmé est ignoré)
 * - L'index n'avance que par le tick, stop() ou seek() explicite
 * - Chaque mutation publie un PlaybackFrame sur un canal watch
 *
 * UTILITÉ DANS SILLAGE :
 * 🎯 Rejeu déterministe d'un trajet à vitesse variable depuis le dashboard
 * 🎯 Dernier point maintenu en fin de trace, jamais de retour en boucle
 * 🎯 Observation du rejeu sans sondage : canal watch partagé
 */

use crate::models::LocationSample;
use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("trace vide, rien à relire")]
    EmptyRoute,
    #[error("vitesse invalide: {0}")]
    InvalidSpeed(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    Stopped,
    Playing,
    Paused,
    Completed,
}

/// Instantané publié à chaque mutation du moteur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackFrame {
    pub device_id: Option<String>,
    pub phase: PlaybackPhase,
    pub index: usize,
    pub total: usize,
    pub speed: f64,
    pub position: Option<LocationSample>,
}

impl PlaybackFrame {
    fn idle() -> Self {
        Self {
            device_id: None,
            phase: PlaybackPhase::Stopped,
            index: 0,
            total: 0,
            speed: 1.0,
            position: None,
        }
    }
}

struct EngineCore {
    device_id: Option<String>,
    /// Trace en ordre chronologique (ancien vers récent).
    points: Vec<LocationSample>,
    index: usize,
    phase: PlaybackPhase,
    speed: f64,
    base_interval_ms: u64,
    /// Génération du ticker courant. Un tick dont la génération ne
    /// correspond plus est un tick d'un ticker remplacé : ignoré.
    epoch: u64,
    ticker: Option<JoinHandle<()>>,
}

impl EngineCore {
    fn tick_interval(&self) -> Duration {
        let millis = self.base_interval_ms as f64 / self.speed;
        Duration::from_secs_f64((millis / 1000.0).max(0.001))
    }

    /// Avance d'un pas. Retourne true quand la trace est épuisée :
    /// index serré sur le dernier point, phase Completed, pas de retour à 0.
    fn advance(&mut self) -> bool {
        let len = self.points.len();
        if len == 0 {
            self.phase = PlaybackPhase::Completed;
            return true;
        }
        self.index += 1;
        if self.index >= len {
            self.index = len - 1;
            self.phase = PlaybackPhase::Completed;
            return true;
        }
        false
    }

    fn frame(&self) -> PlaybackFrame {
        PlaybackFrame {
            device_id: self.device_id.clone(),
            phase: self.phase,
            index: self.index,
            total: self.points.len(),
            speed: self.speed,
            position: self.points.get(self.index).cloned(),
        }
    }

    fn disarm(&mut self) {
        self.epoch += 1;
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct PlaybackEngine {
    core: Shared<EngineCore>,
    frames: watch::Sender<PlaybackFrame>,
}

impl PlaybackEngine {
    pub fn new(base_interval_ms: u64) -> Self {
        let (frames, _) = watch::channel(PlaybackFrame::idle());
        Self {
            core: new_state(EngineCore {
                device_id: None,
                points: Vec::new(),
                index: 0,
                phase: PlaybackPhase::Stopped,
                speed: 1.0,
                base_interval_ms: base_interval_ms.max(1),
                epoch: 0,
                ticker: None,
            }),
            frames,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackFrame> {
        self.frames.subscribe()
    }

    pub fn frame(&self) -> PlaybackFrame {
        self.core.lock().frame()
    }

    /// Charge une nouvelle trace et revient à l'arrêt complet.
    pub fn load(&self, device_id: &str, points: Vec<LocationSample>) {
        let frame = {
            let mut core = self.core.lock();
            core.disarm();
            core.device_id = Some(device_id.to_string());
            core.points = points;
            core.index = 0;
            core.phase = PlaybackPhase::Stopped;
            core.frame()
        };
        let _ = self.frames.send(frame);
    }

    /// Démarre ou reprend. Depuis Completed, repart du début.
    pub fn play(&self) -> Result<(), PlaybackError> {
        let frame = {
            let mut core = self.core.lock();
            if core.points.is_empty() {
                return Err(PlaybackError::EmptyRoute);
            }
            if core.phase == PlaybackPhase::Playing {
                return Ok(());
            }
            if core.phase == PlaybackPhase::Completed {
                core.index = 0;
            }
            core.phase = PlaybackPhase::Playing;
            self.arm_locked(&mut core);
            core.frame()
        };
        let _ = self.frames.send(frame);
        Ok(())
    }

    /// Gèle l'index sans le perdre. Sans effet hors Playing.
    pub fn pause(&self) {
        let frame = {
            let mut core = self.core.lock();
            if core.phase != PlaybackPhase::Playing {
                return;
            }
            core.disarm();
            core.phase = PlaybackPhase::Paused;
            core.frame()
        };
        let _ = self.frames.send(frame);
    }

    /// Arrêt complet : ticker tué, index remis à zéro.
    pub fn stop(&self) {
        let frame = {
            let mut core = self.core.lock();
            core.disarm();
            core.index = 0;
            core.phase = PlaybackPhase::Stopped;
            core.frame()
        };
        let _ = self.frames.send(frame);
    }

    /// Positionne l'index, serré sur la fin de trace. Hors lecture la
    /// phase devient Paused (scrubbing).
    pub fn seek(&self, index: usize) -> Result<(), PlaybackError> {
        let frame = {
            let mut core = self.core.lock();
            if core.points.is_empty() {
                return Err(PlaybackError::EmptyRoute);
            }
            core.index = index.min(core.points.len() - 1);
            if core.phase != PlaybackPhase::Playing {
                core.phase = PlaybackPhase::Paused;
            }
            core.frame()
        };
        let _ = self.frames.send(frame);
        Ok(())
    }

    /// Change la cadence en place : l'index est préservé et le ticker
    /// remplacé atomiquement à la nouvelle période.
    pub fn set_speed(&self, multiplier: f64) -> Result<(), PlaybackError> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(PlaybackError::InvalidSpeed(multiplier));
        }
        let frame = {
            let mut core = self.core.lock();
            core.speed = multiplier;
            if core.phase == PlaybackPhase::Playing {
                self.arm_locked(&mut core);
            }
            core.frame()
        };
        let _ = self.frames.send(frame);
        Ok(())
    }

    fn arm_locked(&self, core: &mut EngineCore) {
        core.disarm();
        let epoch = core.epoch;
        let interval = core.tick_interval();
        let shared = self.core.clone();
        let frames = self.frames.clone();
        core.ticker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let frame = {
                    let mut core = shared.lock();
                    if core.epoch != epoch {
                        return;
                    }
                    let done = core.advance();
                    if done {
                        core.ticker = None;
                    }
                    core.frame()
                };
                let completed = frame.phase == PlaybackPhase::Completed;
                let _ = frames.send(frame);
                if completed {
                    return;
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn route(n: usize) -> Vec<LocationSample> {
        (0..n)
            .map(|i| {
                let ts = OffsetDateTime::from_unix_timestamp(1_787_306_400 + i as i64).unwrap();
                LocationSample::try_new("d1", 20.0 + i as f64 * 0.001, -103.0, ts, ts).unwrap()
            })
            .collect()
    }

    async fn wait_until(
        rx: &mut watch::Receiver<PlaybackFrame>,
        timeout_ms: u64,
        pred: impl Fn(&PlaybackFrame) -> bool,
    ) -> PlaybackFrame {
        tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                {
                    let frame = rx.borrow();
                    if pred(&frame) {
                        return frame.clone();
                    }
                }
                rx.changed().await.expect("canal fermé");
            }
        })
        .await
        .expect("condition jamais atteinte")
    }

    #[tokio::test]
    async fn play_on_empty_route_is_reported() {
        let engine = PlaybackEngine::new(10);
        assert!(matches!(engine.play(), Err(PlaybackError::EmptyRoute)));
        assert_eq!(engine.frame().phase, PlaybackPhase::Stopped);
    }

    #[tokio::test]
    async fn completes_at_last_index_without_wrapping() {
        let engine = PlaybackEngine::new(5);
        engine.load("d1", route(3));
        engine.play().unwrap();

        let mut rx = engine.subscribe();
        let done = wait_until(&mut rx, 1_000, |f| f.phase == PlaybackPhase::Completed).await;
        assert_eq!(done.index, 2);
        let held = done.position.as_ref().unwrap();
        assert_eq!(held.recorded_at.unix_timestamp(), 1_787_306_402);

        // Aucun tick ultérieur : l'index reste serré sur la fin.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let frame = engine.frame();
        assert_eq!(frame.index, 2);
        assert_eq!(frame.phase, PlaybackPhase::Completed);
    }

    #[tokio::test]
    async fn pause_preserves_index_stop_resets_it() {
        let engine = PlaybackEngine::new(5);
        engine.load("d1", route(200));
        engine.play().unwrap();

        let mut rx = engine.subscribe();
        wait_until(&mut rx, 1_000, |f| f.index >= 3).await;
        engine.pause();
        let held = engine.frame();
        assert_eq!(held.phase, PlaybackPhase::Paused);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.frame().index, held.index, "l'index ne bouge plus en pause");

        engine.play().unwrap();
        let resumed = wait_until(&mut rx, 1_000, |f| f.index > held.index).await;
        assert!(resumed.index > held.index);

        engine.stop();
        let stopped = engine.frame();
        assert_eq!(stopped.index, 0);
        assert_eq!(stopped.phase, PlaybackPhase::Stopped);
    }

    #[tokio::test]
    async fn play_after_completed_restarts_from_zero() {
        let engine = PlaybackEngine::new(5);
        engine.load("d1", route(2));
        engine.play().unwrap();

        let mut rx = engine.subscribe();
        wait_until(&mut rx, 1_000, |f| f.phase == PlaybackPhase::Completed).await;

        engine.play().unwrap();
        let frame = engine.frame();
        assert_eq!(frame.phase, PlaybackPhase::Playing);
        assert_eq!(frame.index, 0);
        engine.stop();
    }

    #[tokio::test]
    async fn seek_clamps_to_route_end() {
        let engine = PlaybackEngine::new(1_000);
        assert!(matches!(engine.seek(1), Err(PlaybackError::EmptyRoute)));

        engine.load("d1", route(5));
        engine.seek(999).unwrap();
        let frame = engine.frame();
        assert_eq!(frame.index, 4);
        assert_eq!(frame.phase, PlaybackPhase::Paused);

        engine.seek(1).unwrap();
        assert_eq!(engine.frame().index, 1);
    }

    #[tokio::test]
    async fn speed_change_keeps_index_and_phase() {
        let engine = PlaybackEngine::new(60_000);
        engine.load("d1", route(10));
        engine.play().unwrap();
        engine.seek(3).unwrap();

        engine.set_speed(4.0).unwrap();
        let frame = engine.frame();
        assert_eq!(frame.index, 3);
        assert_eq!(frame.speed, 4.0);

        assert!(matches!(engine.set_speed(0.0), Err(PlaybackError::InvalidSpeed(_))));
        assert!(matches!(engine.set_speed(-2.0), Err(PlaybackError::InvalidSpeed(_))));
        assert!(matches!(engine.set_speed(f64::NAN), Err(PlaybackError::InvalidSpeed(_))));
        assert_eq!(engine.frame().speed, 4.0, "une vitesse refusée ne change rien");
        engine.stop();
    }

    #[tokio::test]
    async fn speed_churn_never_stacks_tickers() {
        let engine = PlaybackEngine::new(40);
        engine.load("d1", route(500));
        engine.play().unwrap();

        for speed in [2.0, 3.0, 4.0, 2.0, 4.0] {
            engine.set_speed(speed).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // À 4x sur 40ms, période 10ms : ~20 ticks en 200ms. Des tickers
        // empilés donneraient un multiple de ce rythme.
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.pause();
        let index = engine.frame().index;
        assert!(index >= 5, "index {index} trop bas, ticker mort");
        assert!(index <= 40, "index {index} trop haut, tickers empilés");
    }

    #[tokio::test]
    async fn loading_a_new_route_resets_the_engine() {
        let engine = PlaybackEngine::new(5);
        engine.load("d1", route(50));
        engine.play().unwrap();
        let mut rx = engine.subscribe();
        wait_until(&mut rx, 1_000, |f| f.index >= 2).await;

        engine.load("d2", route(7));
        let frame = engine.frame();
        assert_eq!(frame.device_id.as_deref(), Some("d2"));
        assert_eq!(frame.phase, PlaybackPhase::Stopped);
        assert_eq!(frame.index, 0);
        assert_eq!(frame.total, 7);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(engine.frame().index, 0, "l'ancien ticker est bien mort");
    }
}
