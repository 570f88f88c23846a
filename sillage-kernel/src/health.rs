use crate::config::KernelConfig;
use crate::fleet::SharedFleetRegistry;
use crate::state::Shared;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub devices_connected: u32,
    pub watched_devices: u32,
    pub memory_usage_mb: f32,
    pub push_status: String,
    pub push_reconnects: u32,
}

/// Compteurs de santé du kernel. Clonable, partagé entre la session push,
/// l'API REST et le publieur périodique.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    push_reconnects: Arc<AtomicU32>,
    push_status: Arc<parking_lot::Mutex<String>>,
    watched: Arc<AtomicUsize>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            push_reconnects: Arc::new(AtomicU32::new(0)),
            push_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
            watched: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn mark_push_connected(&self) {
        *self.push_status.lock() = "connected".to_string();
    }

    pub fn mark_push_disconnected(&self) {
        *self.push_status.lock() = "disconnected".to_string();
    }

    /// État terminal : la session a épuisé ses tentatives de reconnexion.
    pub fn mark_push_failed(&self) {
        *self.push_status.lock() = "failed".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.push_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.push_status.lock() = "reconnecting".to_string();
    }

    pub fn push_status(&self) -> String {
        self.push_status.lock().clone()
    }

    pub fn set_watched(&self, count: usize) {
        self.watched.store(count, Ordering::Relaxed);
    }

    pub async fn snapshot(&self, fleet: &SharedFleetRegistry) -> KernelHealth {
        let devices = fleet.list().await;
        let connected = fleet.connected_count().await;

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: devices.len() as u32,
            devices_connected: connected as u32,
            watched_devices: self.watched.load(Ordering::Relaxed) as u32,
            memory_usage_mb: get_memory_usage_mb(),
            push_status: self.push_status.lock().clone(),
            push_reconnects: self.push_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto de la santé kernel
    pub fn spawn_health_publisher(&self, config: Shared<KernelConfig>, fleet: SharedFleetRegistry) {
        let health_tracker = self.clone();

        task::spawn(async move {
            let cfg = config.lock().clone();
            let mqtt_cfg = cfg.mqtt.unwrap_or_else(|| crate::config::MqttConf {
                host: "localhost".into(),
                port: 1883,
            });

            let mut opts = MqttOptions::new("sillage-kernel-health", &mqtt_cfg.host, mqtt_cfg.port);
            opts.set_keep_alive(Duration::from_secs(15));

            let (client, mut eventloop) = AsyncClient::new(opts, 10);

            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = health_tracker.snapshot(&fleet).await;
                        if let Ok(payload) = serde_json::to_string(&health) {
                            if let Err(e) = client.publish("sillage/kernel/health@v1", QoS::AtLeastOnce, false, payload).await {
                                tracing::warn!("publication santé échouée: {e:?}");
                            } else {
                                tracing::debug!(
                                    "santé publiée (uptime: {}s, flotte: {})",
                                    health.uptime_seconds,
                                    health.devices_tracked
                                );
                            }
                        }
                    },
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            tracing::warn!("MQTT santé: {e:?}");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    // Approximation simple - en production on pourrait utiliser sysinfo
    let pid = std::process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0;
                        }
                    }
                }
            }
        }
    }

    12.0
}
