use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    /// Catalogue statique des traceurs connus, indexé par IMEI.
    #[serde(default)]
    pub devices: HashMap<String, DeviceConf>,
    pub mqtt: Option<MqttConf>,
    #[serde(default)]
    pub liveness: LivenessConf,
    #[serde(default)]
    pub reconnect: ReconnectConf,
    pub history: Option<HistoryConf>,
    #[serde(default)]
    pub playback: PlaybackConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    pub label: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub client: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LivenessConf {
    /// Fenêtre de silence avant dégradation connected -> disconnected.
    pub window_seconds: u64,
    /// Période du balayage de flotte.
    pub sweep_seconds: u64,
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { window_seconds: 120, sweep_seconds: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconnectConf {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay_seconds: 2 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryConf {
    pub base_url: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaybackConf {
    /// Intervalle entre deux pas de relecture à vitesse 1x.
    pub base_interval_ms: u64,
}

impl Default for PlaybackConf {
    fn default() -> Self {
        Self { base_interval_ms: 1000 }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
            liveness: LivenessConf::default(),
            reconnect: ReconnectConf::default(),
            history: None,
            playback: PlaybackConf::default(),
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("SILLAGE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> KernelConfig {
    if Path::new(path).exists() {
        let txt = fs::read_to_string(path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::warn!("config invalide ({path}): {e}");
            KernelConfig::default()
        })
    } else {
        tracing::warn!("pas de {path}, usage config par défaut");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_complete_yaml() {
        let yaml = r#"
devices:
  "860000000000001":
    label: "Fourgon 12"
    brand: "Teltonika"
    model: "FMB920"
    client: "Transports Morel"
mqtt:
  host: "10.0.0.5"
  port: 1884
liveness:
  window_seconds: 90
  sweep_seconds: 15
reconnect:
  max_attempts: 3
  base_delay_seconds: 1
history:
  base_url: "http://127.0.0.1:8081"
playback:
  base_interval_ms: 500
"#;
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.devices["860000000000001"].label, "Fourgon 12");
        assert_eq!(cfg.mqtt.as_ref().unwrap().port, 1884);
        assert_eq!(cfg.liveness.window_seconds, 90);
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.history.as_ref().unwrap().base_url, "http://127.0.0.1:8081");
        assert_eq!(cfg.playback.base_interval_ms, 500);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: KernelConfig = serde_yaml::from_str("mqtt:\n  host: localhost\n  port: 1883\n").unwrap();
        assert!(cfg.devices.is_empty());
        assert_eq!(cfg.liveness.window_seconds, 120);
        assert_eq!(cfg.liveness.sweep_seconds, 30);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.playback.base_interval_ms, 1000);
        assert!(cfg.history.is_none());
    }

    #[tokio::test]
    async fn load_from_file_and_from_missing_path() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "liveness:\n  window_seconds: 45\n  sweep_seconds: 10").unwrap();
        let cfg = load_config_from(tmp.path().to_str().unwrap()).await;
        assert_eq!(cfg.liveness.window_seconds, 45);

        let absent = load_config_from("/nonexistent/sillage-kernel.yaml").await;
        assert_eq!(absent.liveness.window_seconds, 120);
    }
}
