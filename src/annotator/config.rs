/*
 * Copyright (C) 2024 The Annotator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::annotator::k8s::WorkloadKind;
use crate::annotator::logger::{LogFormat, LogLevel};
use std::env;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Config {
    GrafanaUrl,
    GrafanaApiKey,
    MaxConcurrentReconciles,
    HttpTimeout,
    SinkTimeout,
    RequeueDelay,
    MetricsBindAddress,
    HealthProbeBindAddress,
    LogLevel,
    LogFormat,
    LogDevelopment,
    WatchKinds,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::GrafanaUrl => "GRAFANA_URL",
            Config::GrafanaApiKey => "GRAFANA_API_KEY",
            Config::MaxConcurrentReconciles => "MAX_CONCURRENT_RECONCILES",
            Config::HttpTimeout => "HTTP_TIMEOUT_SECONDS",
            Config::SinkTimeout => "SINK_TIMEOUT_SECONDS",
            Config::RequeueDelay => "REQUEUE_DELAY_SECONDS",
            Config::MetricsBindAddress => "METRICS_BIND_ADDRESS",
            Config::HealthProbeBindAddress => "HEALTH_PROBE_BIND_ADDRESS",
            Config::LogLevel => "LOG_LEVEL",
            Config::LogFormat => "LOG_FORMAT",
            Config::LogDevelopment => "LOG_DEVELOPMENT",
            Config::WatchKinds => "WATCH_KINDS",
        }
    }

    /// Default value, or `None` for settings that must be provided.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::GrafanaUrl | Config::GrafanaApiKey => None,
            Config::MaxConcurrentReconciles => Some("2"),
            Config::HttpTimeout => Some("30"),
            Config::SinkTimeout => Some("20"),
            Config::RequeueDelay => Some("60"),
            Config::MetricsBindAddress => Some("0.0.0.0:8081"),
            Config::HealthProbeBindAddress => Some("0.0.0.0:8080"),
            Config::LogLevel => Some("info"),
            Config::LogFormat => Some("text"),
            Config::LogDevelopment => Some("false"),
            Config::WatchKinds => Some("deployment,statefulset,daemonset"),
        }
    }

    /// Returns the effective value, either from the environment or the default.
    pub fn get(&self) -> Option<String> {
        self.resolve(&|name| env::var(name).ok())
    }

    fn resolve(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
        lookup(self.env_var())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.default_value().map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "{name} must be set"),
            ConfigError::Invalid { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
        }
    }
}

impl Error for ConfigError {}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatorConfig {
    pub grafana_url: String,
    pub grafana_api_key: String,
    pub max_concurrent_reconciles: usize,
    pub http_timeout: Duration,
    pub sink_timeout: Duration,
    pub requeue_delay: Duration,
    pub metrics_bind_address: SocketAddr,
    pub health_probe_bind_address: SocketAddr,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub watch_kinds: Vec<WorkloadKind>,
}

impl AnnotatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Resolves every setting through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |config: Config| {
            config
                .resolve(&lookup)
                .ok_or(ConfigError::Missing(config.env_var()))
        };

        let grafana_url = value(Config::GrafanaUrl)?
            .trim_end_matches('/')
            .to_string();
        if !(grafana_url.starts_with("http://") || grafana_url.starts_with("https://")) {
            return Err(invalid(Config::GrafanaUrl, &grafana_url));
        }

        let development = parse_bool(Config::LogDevelopment, &value(Config::LogDevelopment)?)?;
        let (log_level, log_format) = if development {
            (LogLevel::Debug, LogFormat::Text)
        } else {
            let level = value(Config::LogLevel)?;
            let format = value(Config::LogFormat)?;
            (
                LogLevel::parse(&level).ok_or_else(|| invalid(Config::LogLevel, &level))?,
                LogFormat::parse(&format).ok_or_else(|| invalid(Config::LogFormat, &format))?,
            )
        };

        let max_concurrent_reconciles =
            parse_number(Config::MaxConcurrentReconciles, &value(Config::MaxConcurrentReconciles)?)?;
        if max_concurrent_reconciles == 0 {
            return Err(invalid(Config::MaxConcurrentReconciles, "0"));
        }

        Ok(Self {
            grafana_url,
            grafana_api_key: value(Config::GrafanaApiKey)?,
            max_concurrent_reconciles: max_concurrent_reconciles as usize,
            http_timeout: parse_seconds(Config::HttpTimeout, &value(Config::HttpTimeout)?)?,
            sink_timeout: parse_seconds(Config::SinkTimeout, &value(Config::SinkTimeout)?)?,
            requeue_delay: parse_seconds(Config::RequeueDelay, &value(Config::RequeueDelay)?)?,
            metrics_bind_address: parse_address(
                Config::MetricsBindAddress,
                &value(Config::MetricsBindAddress)?,
            )?,
            health_probe_bind_address: parse_address(
                Config::HealthProbeBindAddress,
                &value(Config::HealthProbeBindAddress)?,
            )?,
            log_level,
            log_format,
            watch_kinds: parse_kinds(&value(Config::WatchKinds)?)?,
        })
    }
}

fn invalid(config: Config, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name: config.env_var(),
        value: value.to_string(),
    }
}

fn parse_number(config: Config, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid(config, value))
}

fn parse_seconds(config: Config, value: &str) -> Result<Duration, ConfigError> {
    match parse_number(config, value)? {
        0 => Err(invalid(config, value)),
        seconds => Ok(Duration::from_secs(seconds)),
    }
}

fn parse_address(config: Config, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse::<SocketAddr>().map_err(|_| invalid(config, value))
}

fn parse_bool(config: Config, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(config, value)),
    }
}

fn parse_kinds(value: &str) -> Result<Vec<WorkloadKind>, ConfigError> {
    let mut kinds = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let kind = WorkloadKind::parse(entry).ok_or_else(|| invalid(Config::WatchKinds, entry))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err(invalid(Config::WatchKinds, value));
    }
    Ok(kinds)
}
