use serde::{Deserialize, Serialize};

use crate::{climate::TempRange, error::ConfigError, types::LoopVariant};

/// Longest an iteration may take, including the delay after it. Runners with a
/// task watchdog set its timeout above this.
pub const ITERATION_BUDGET_MS: u64 = 75_000;

// Remote-command mode fetches two fields and publishes once.
const REQUESTS_PER_ITERATION: u64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass")]
    pub wifi_pass: String,
    #[serde(rename = "connectTimeoutSecs")]
    pub connect_timeout_secs: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "channelId")]
    pub channel_id: u64,
    #[serde(rename = "writeApiKey")]
    pub write_api_key: String,
    #[serde(rename = "readApiKey")]
    pub read_api_key: String,
    #[serde(rename = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.thingspeak.com".to_string(),
            channel_id: 0,
            write_api_key: String::new(),
            read_api_key: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub variant: LoopVariant,
    #[serde(rename = "updateIntervalMs")]
    pub update_interval_ms: u32,
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval_ms: u32,
    #[serde(rename = "errorDelayMs")]
    pub error_delay_ms: u32,
    #[serde(rename = "fakeTempRange")]
    pub fake_temp_range: TempRange,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            variant: LoopVariant::RemoteCommand,
            update_interval_ms: 5_000,
            poll_interval_ms: 1_000,
            error_delay_ms: 1_000,
            fake_temp_range: TempRange::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    #[serde(rename = "dhtPin")]
    pub dht_pin: i32,
    #[serde(rename = "relayPin")]
    pub relay_pin: i32,
    #[serde(rename = "relayActiveLow")]
    pub relay_active_low: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            dht_pin: 4,
            relay_pin: 5,
            relay_active_low: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.connect_timeout_secs = self.network.connect_timeout_secs.clamp(1, 300);
        self.telemetry.sanitize();
        self.control.sanitize();
        self.hardware.sanitize();
    }

    /// Every request timing out, followed by the longer of the two delays.
    pub fn worst_case_iteration_ms(&self) -> u64 {
        let delay = self.control.poll_interval_ms.max(self.control.error_delay_ms);
        REQUESTS_PER_ITERATION * self.telemetry.request_timeout_ms + u64::from(delay)
    }

    /// Checks what the node cannot run without. Wi-Fi credentials are left to
    /// the link, which knows whether it needs them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.telemetry.validate(self.control.variant)
    }
}

impl TelemetryConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.base_url.trim().trim_end_matches('/').to_string();
        self.base_url = trimmed;
        self.write_api_key = self.write_api_key.trim().to_string();
        self.read_api_key = self.read_api_key.trim().to_string();
        self.request_timeout_ms = self.request_timeout_ms.clamp(500, 15_000);
    }

    pub fn validate(&self, variant: LoopVariant) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "telemetry.baseUrl",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.write_api_key.is_empty() {
            return Err(ConfigError::Missing("telemetry.writeApiKey"));
        }
        if variant == LoopVariant::RemoteCommand {
            if self.read_api_key.is_empty() {
                return Err(ConfigError::Missing("telemetry.readApiKey"));
            }
            if self.channel_id == 0 {
                return Err(ConfigError::Missing("telemetry.channelId"));
            }
        }
        Ok(())
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.update_interval_ms = self.update_interval_ms.clamp(1_000, 3_600_000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 30_000);
        self.error_delay_ms = self.error_delay_ms.clamp(100, 30_000);
        self.fake_temp_range.sanitize();
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        if self.dht_pin < 0 {
            self.dht_pin = 4;
        }
        if self.relay_pin < 0 {
            self.relay_pin = 5;
        }
    }
}
