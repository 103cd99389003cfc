//! Startup configuration: optional TOML file overlaid by `HERMES_*` env vars
//!
//! Read once; the resulting [`PipelineConfig`] is immutable for the run.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use thiserror::Error;
use tracing::info;

use crate::encode::QualityFallback;
use crate::{PipelineConfig, Settings, MAX_UDP_PAYLOAD};

/// Looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "hermes.toml";

/// `HERMES_PIPELINE__PORT=9999` sets `pipeline.port`
pub const ENV_PREFIX: &str = "HERMES";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load settings from `path` (must exist) or [`DEFAULT_CONFIG_FILE`] (may be
/// absent), then apply environment overrides.
pub fn load(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let settings: Settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    settings.validate()?;
    info!(
        "Configuration loaded: capture {} -> {}",
        settings.capture.device,
        settings.pipeline.destination()
    );
    Ok(settings)
}

/// Parse settings from TOML text alone, without touching the environment.
pub fn from_toml_str(text: &str) -> Result<Settings, SettingsError> {
    let settings: Settings = Config::builder()
        .add_source(File::from_str(text, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.pipeline.validate()?;
        // A stop must be able to outlast one blocked device read
        if self.pipeline.shutdown_grace_ms < self.capture.read_timeout_ms {
            return Err(SettingsError::Invalid(format!(
                "shutdown grace {} ms is shorter than the capture read timeout {} ms",
                self.pipeline.shutdown_grace_ms, self.capture.read_timeout_ms
            )));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: String| Err(SettingsError::Invalid(msg));

        if self.host.is_empty() {
            return invalid("destination host is empty".into());
        }
        if self.port == 0 {
            return invalid("destination port must be non-zero".into());
        }
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "target resolution {}x{} has a zero dimension",
                self.width, self.height
            ));
        }
        if self.quality > 100 {
            return invalid(format!("quality {} is outside 0-100", self.quality));
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_UDP_PAYLOAD {
            return invalid(format!(
                "max payload {} must be between 1 and {}",
                self.max_payload_bytes, MAX_UDP_PAYLOAD
            ));
        }
        if let QualityFallback::StepDown { step, floor } = self.fallback {
            if step == 0 {
                return invalid("fallback step must be non-zero".into());
            }
            if !(1..=100).contains(&floor) {
                return invalid(format!("fallback floor {floor} is outside 1-100"));
            }
        }
        if self.send_timeout_ms == 0 {
            return invalid("send timeout must be non-zero".into());
        }
        if self.window_frames == 0 {
            return invalid("metrics window must hold at least one frame".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DeviceSelector, PixelFormat};

    #[test]
    fn test_defaults_are_valid() {
        let settings = from_toml_str("").unwrap();
        assert_eq!(settings.pipeline.port, 5000);
        assert_eq!(settings.pipeline.quality, 40);
        assert_eq!((settings.pipeline.width, settings.pipeline.height), (320, 240));
        assert_eq!(settings.pipeline.fallback, QualityFallback::default());
    }

    #[test]
    fn test_toml_overrides() {
        let settings = from_toml_str(
            r#"
            [capture]
            device = { index = 2 }
            format = "yuyv4"
            width = 1280
            height = 720

            [pipeline]
            host = "10.0.0.7"
            port = 9999
            quality = 55
            max_payload_bytes = 5000

            [pipeline.fallback]
            policy = "fail"
            "#,
        )
        .unwrap();

        assert_eq!(settings.capture.device, DeviceSelector::Index(2));
        assert_eq!(settings.capture.format, PixelFormat::Yuyv4);
        assert_eq!(settings.capture.width, 1280);
        assert_eq!(settings.pipeline.destination(), "10.0.0.7:9999");
        assert_eq!(settings.pipeline.quality, 55);
        assert_eq!(settings.pipeline.max_payload_bytes, 5000);
        assert_eq!(settings.pipeline.fallback, QualityFallback::Fail);
        // untouched keys keep their defaults
        assert_eq!(settings.pipeline.width, 320);
    }

    #[test]
    fn test_step_down_from_toml() {
        let settings = from_toml_str(
            r#"
            [pipeline.fallback]
            policy = "step_down"
            step = 5
            floor = 20
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.pipeline.fallback,
            QualityFallback::StepDown { step: 5, floor: 20 }
        );
    }

    #[test]
    fn test_out_of_range_quality_rejected() {
        let err = from_toml_str("[pipeline]\nquality = 101\n").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn test_quality_zero_is_accepted() {
        let settings = from_toml_str("[pipeline]\nquality = 0\n").unwrap();
        assert_eq!(settings.pipeline.quality, 0);
    }

    #[test]
    fn test_grace_must_cover_read_timeout() {
        let err = from_toml_str(
            r#"
            [capture]
            read_timeout_ms = 2000

            [pipeline]
            shutdown_grace_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));

        let settings = from_toml_str("[capture]\nread_timeout_ms = 500\n").unwrap();
        assert!(settings.pipeline.shutdown_grace_ms >= settings.capture.read_timeout_ms);
    }

    #[test]
    fn test_payload_ceiling_bounded_by_udp() {
        let config = PipelineConfig {
            max_payload_bytes: 70_000,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            max_payload_bytes: MAX_UDP_PAYLOAD,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_takes_prefix_then_double_underscore() {
        std::env::set_var("HERMES_PIPELINE__PORT", "9999");
        let settings = load(None);
        std::env::remove_var("HERMES_PIPELINE__PORT");
        assert_eq!(settings.unwrap().pipeline.port, 9999);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/hermes.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::Load(_)));
    }
}
