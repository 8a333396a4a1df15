// Configuration for the pipeline, loaded from JSON with environment overrides

use crate::error::{FerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FerConfig {
    /// Broker settings; publishing is disabled when absent
    pub mqtt: Option<MqttConfig>,
    pub pipeline: PipelineConfig,
    pub identity: IdentityConfig,
    pub camera: CameraConfig,
    pub models: ModelConfig,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// e.g. `mqtt://localhost:1883` or `wss://broker.example.com:8884/mqtt`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    /// 0 (at most once) or 1 (at least once)
    pub qos: u8,
    /// Fixed client identity; overrides the persisted one
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub prediction_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub data_dir: PathBuf,
    pub cookie_jar: PathBuf,
    pub cookie_max_age_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Memory layout of the emotion model's input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    Nhwc,
    Nchw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub cascade_path: PathBuf,
    pub emotion_model_path: PathBuf,
    pub input_layout: InputLayout,
}

impl Default for FerConfig {
    fn default() -> Self {
        Self {
            mqtt: None,
            pipeline: PipelineConfig::default(),
            identity: IdentityConfig::default(),
            camera: CameraConfig::default(),
            models: ModelConfig::default(),
            log_file: PathBuf::from("fer_pipeline.log"),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            topic: "fer/events".to_string(),
            qos: 0,
            client_id: None,
            keep_alive_secs: 30,
            reconnect_interval_ms: 2000,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prediction_interval_ms: 300,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".fer"),
            cookie_jar: PathBuf::from(".fer/cookies.txt"),
            cookie_max_age_days: 365,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cascade_path: PathBuf::from("assets/models/haarcascade_frontalface_default.xml"),
            emotion_model_path: PathBuf::from("assets/models/emotion.onnx"),
            input_layout: InputLayout::Nhwc,
        }
    }
}

impl FerConfig {
    /// Loads the configuration file, falling back to defaults when it does
    /// not exist, then applies `FER_MQTT_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            let config = Self::from_json(&content)
                .map_err(|e| FerError::Config(format!("{}: {e}", path.display())))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            warn!("Configuration file {} not found, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Applies broker overrides from a variable lookup. A URL override
    /// enables publishing even if the file has no `mqtt` section.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FER_MQTT_URL") {
            self.mqtt.get_or_insert_with(MqttConfig::default).url = url;
        }

        let Some(mqtt) = self.mqtt.as_mut() else {
            return Ok(());
        };
        if let Some(username) = lookup("FER_MQTT_USERNAME") {
            mqtt.username = Some(username);
        }
        if let Some(password) = lookup("FER_MQTT_PASSWORD") {
            mqtt.password = Some(password);
        }
        if let Some(topic) = lookup("FER_MQTT_TOPIC") {
            mqtt.topic = topic;
        }
        if let Some(qos) = lookup("FER_MQTT_QOS") {
            mqtt.qos = qos
                .trim()
                .parse()
                .map_err(|_| FerError::Config(format!("FER_MQTT_QOS must be 0 or 1, got {qos:?}")))?;
        }
        if let Some(client_id) = lookup("FER_MQTT_CLIENT_ID") {
            mqtt.client_id = Some(client_id);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mqtt) = &self.mqtt {
            mqtt.validate()?;
        }
        if self.pipeline.prediction_interval_ms == 0 {
            return Err(FerError::Config(
                "pipeline.prediction_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.prediction_interval_ms)
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(FerError::Config("mqtt.url is empty".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(FerError::Config("mqtt.topic is empty".to_string()));
        }
        if self.qos > 1 {
            return Err(FerError::Config(format!(
                "mqtt.qos must be 0 or 1, got {}",
                self.qos
            )));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}
