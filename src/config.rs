//! Configuration (spec §6).
//!
//! File/YAML loading is out of scope (spec §1's external collaborators);
//! this module only owns the in-process configuration struct and its
//! environment-variable overlay, the Rust analogue of
//! `original_source/config/config.go`'s `LoadEnvs`.

use std::env;
use std::str::FromStr;

/// Message bus connection options (`original_source/config/message_bus_options.go`).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBusConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
    /// Carried for configuration parity with the original's MQTT QoS
    /// knob; the NATS adapter ([`crate::bus::nats::NatsMessageBus`]) does
    /// not use it, since NATS core delivery has no QoS levels.
    pub qos: u8,
    /// Same as `qos`: carried for parity, unused by the NATS adapter.
    pub clean_session: bool,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4222,
            protocol: "nats".to_string(),
            connect_timeout_ms: 3_000,
            timeout_ms: 5_000,
            qos: 1,
            clean_session: true,
        }
    }
}

/// Driver-wide timing options (`original_source/internal/driver/twin_runner.go`,
/// `handle_operations_meta.go`, `handle_operations_data.go`).
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    pub driver_health_check_interval_second: u64,
    pub device_health_check_interval_second: u64,
    pub protocol_register_interval_second: u64,
    pub device_auto_reconnect: bool,
    pub device_auto_reconnect_interval_second: u64,
    /// Property cache TTL (spec §3, default 30s).
    pub property_cache_expiration_second: u64,
    /// Property cache janitor sweep interval (spec §3, default 60s — the
    /// original hardcodes this as `2 * PropertyCacheExpiration` rather than
    /// exposing it as its own env override).
    pub property_cache_cleanup_interval_second: u64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            driver_health_check_interval_second: 60,
            device_health_check_interval_second: 60,
            protocol_register_interval_second: 30,
            device_auto_reconnect: true,
            device_auto_reconnect_interval_second: 10,
            property_cache_expiration_second: 30,
            property_cache_cleanup_interval_second: 60,
        }
    }
}

/// The full configuration a driver process needs at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverConfig {
    pub message_bus: MessageBusConfig,
    pub driver_options: DriverOptions,
}

impl DriverConfig {
    /// Build the default configuration, then apply environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Overwrite any field whose corresponding environment variable is set
    /// and parses. Mirrors `LoadEnvs`: missing or unparseable values leave
    /// the existing field untouched rather than failing the whole load.
    pub fn apply_env_overrides(&mut self) {
        load_env(&mut self.message_bus.host, "MESSAGE_BUS_HOST");
        load_env_parsed(&mut self.message_bus.port, "MESSAGE_BUS_PORT");
        load_env(&mut self.message_bus.protocol, "MESSAGE_BUS_PROTOCOL");
        load_env_parsed(&mut self.message_bus.connect_timeout_ms, "MESSAGE_BUS_CONNECT_TIMEOUT_MS");
        load_env_parsed(&mut self.message_bus.timeout_ms, "MESSAGE_BUS_TIMEOUT_MS");
        load_env_parsed(&mut self.message_bus.qos, "MESSAGE_BUS_QOS");
        load_env_parsed(&mut self.message_bus.clean_session, "MESSAGE_BUS_CLEAN_SESSION");

        load_env_parsed(
            &mut self.driver_options.driver_health_check_interval_second,
            "DriverHealthCheckIntervalSecond",
        );
        load_env_parsed(
            &mut self.driver_options.device_health_check_interval_second,
            "DeviceHealthCheckIntervalSecond",
        );
        load_env_parsed(
            &mut self.driver_options.protocol_register_interval_second,
            "ProtocolRegisterIntervalSecond",
        );
        load_env_parsed(&mut self.driver_options.device_auto_reconnect, "DeviceAutoReconnect");
        load_env_parsed(
            &mut self.driver_options.device_auto_reconnect_interval_second,
            "DeviceAutoReconnectIntervalSecond",
        );
    }
}

fn load_env(target: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn load_env_parsed<T: FromStr>(target: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec() {
        let config = DriverConfig::default();
        assert_eq!(config.message_bus.port, 4222);
        assert_eq!(config.driver_options.property_cache_expiration_second, 30);
        assert_eq!(config.driver_options.property_cache_cleanup_interval_second, 60);
    }

    #[test]
    fn env_override_replaces_host_and_leaves_others() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("MESSAGE_BUS_HOST", "bus.internal");
        let mut config = DriverConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.message_bus.host, "bus.internal");
        assert_eq!(config.message_bus.port, 4222);
        env::remove_var("MESSAGE_BUS_HOST");
    }

    #[test]
    fn unparseable_env_value_is_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("MESSAGE_BUS_PORT", "not-a-number");
        let mut config = DriverConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.message_bus.port, 4222);
        env::remove_var("MESSAGE_BUS_PORT");
    }
}
