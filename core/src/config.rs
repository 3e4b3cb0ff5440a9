//! Capture session configuration.
//!
//! All knobs live in [`CaptureConfig`]. A config can be built in code, taken
//! wholesale from [`Default`], or loaded from a TOML file with
//! [`load_config`]; every field is optional in the file and falls back to
//! its default. Durations are written as short human strings (`"500ms"`,
//! `"1s"`, `"2m"`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Device to capture on. The name `any` requests all interfaces.
    pub device: String,
    /// BPF filter expression applied before reassembly.
    pub filter: String,
    /// Maximum captured bytes per packet.
    pub snaplen: i32,
    /// Put the interface(s) in promiscuous mode.
    pub promisc: bool,
    /// Capture driver read timeout. Zero blocks forever, which also defers
    /// cancellation until the next captured packet.
    #[serde(deserialize_with = "duration_str")]
    pub read_timeout: Duration,
    /// Half-flows with no traffic for this long are torn down.
    #[serde(deserialize_with = "duration_str")]
    pub idle_timeout: Duration,
    /// Per-half-flow cap on buffered out-of-order bytes.
    pub max_buffered_bytes: usize,
    /// Emit a transaction for a response that had no observed request.
    pub emit_lone_responses: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            device: "any".to_string(),
            filter: "tcp and port 80".to_string(),
            snaplen: 1500,
            promisc: false,
            read_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            max_buffered_bytes: 1 << 20,
            emit_lone_responses: true,
        }
    }
}

/// Loads a [`CaptureConfig`] from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CaptureConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: CaptureConfig =
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))?;
    Ok(config)
}

/// Parses a short duration string: an integer followed by `ms`, `s`, `m` or
/// `h`. A bare `0` means zero (block forever where that is the meaning).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("duration {s:?} is missing a unit (ms, s, m, h)"))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("duration {s:?} has an invalid value"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => anyhow::bail!("duration {s:?} has an unknown unit {unit:?}"),
    }
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.device, "any");
        assert_eq!(config.filter, "tcp and port 80");
        assert_eq!(config.snaplen, 1500);
        assert!(!config.promisc);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.emit_lone_responses);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1d").is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config: CaptureConfig = toml::from_str(
            r#"
            device = "eth0"
            filter = "tcp and port 8080"
            read_timeout = "250ms"
            promisc = true
            "#,
        )
        .unwrap();
        assert_eq!(config.device, "eth0");
        assert_eq!(config.filter, "tcp and port 8080");
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert!(config.promisc);
        // untouched fields keep their defaults
        assert_eq!(config.snaplen, 1500);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<CaptureConfig>("devise = \"eth0\"").is_err());
    }
}
