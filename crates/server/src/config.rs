use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use recast_transcoder::{CommandTemplate, TranscoderConfig};
use tracing::warn;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Startup configuration, from the command line and `RECAST_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub bind: String,
    pub transcoder: TranscoderConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(std::env::args().nth(1), |name| std::env::var(name).ok())
    }

    /// `arg` is the first command line argument; `var` looks up environment
    /// variables.
    pub fn from_lookup(
        arg: Option<String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let Some(root) = arg.or_else(|| var("RECAST_ROOT")) else {
            bail!("media directory required: pass it as the first argument or set RECAST_ROOT");
        };

        let bind = match (var("RECAST_BIND"), var("PORT")) {
            (Some(bind), _) => bind,
            (None, Some(port)) => match port.parse::<u16>() {
                Ok(port) => format!("127.0.0.1:{port}"),
                Err(_) => {
                    warn!(value = %port, "invalid PORT, using default");
                    DEFAULT_BIND.to_string()
                }
            },
            (None, None) => DEFAULT_BIND.to_string(),
        };

        let defaults = TranscoderConfig::default();
        let ffmpeg = var("RECAST_FFMPEG").unwrap_or_else(|| "ffmpeg".to_string());
        let idle_secs = parse_or(
            &var,
            "RECAST_IDLE_TIMEOUT_SECS",
            defaults.idle_timeout.as_secs(),
        );
        let transcoder = TranscoderConfig {
            command: CommandTemplate::ffmpeg(ffmpeg),
            idle_timeout: Duration::from_secs(idle_secs),
            spill_threshold: parse_or(&var, "RECAST_SPILL_THRESHOLD_BYTES", defaults.spill_threshold),
            spill_dir: var("RECAST_SPILL_DIR").map(PathBuf::from),
            ..defaults
        };

        Ok(Self {
            root: PathBuf::from(root),
            bind,
            transcoder,
        })
    }
}

fn parse_or<T: FromStr + Copy>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match var(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "invalid value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(Some("/media".into()), lookup(&[])).unwrap();
        assert_eq!(config.root, PathBuf::from("/media"));
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.transcoder.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.transcoder.command.program, PathBuf::from("ffmpeg"));
        assert!(config.transcoder.spill_dir.is_none());
    }

    #[test]
    fn root_is_required() {
        assert!(ServerConfig::from_lookup(None, lookup(&[])).is_err());
        let config =
            ServerConfig::from_lookup(None, lookup(&[("RECAST_ROOT", "/srv")])).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv"));
    }

    #[test]
    fn overrides_and_fallbacks() {
        let config = ServerConfig::from_lookup(
            Some("/media".into()),
            lookup(&[
                ("PORT", "8080"),
                ("RECAST_FFMPEG", "/opt/ffmpeg"),
                ("RECAST_IDLE_TIMEOUT_SECS", "5"),
                ("RECAST_SPILL_THRESHOLD_BYTES", "lots"),
                ("RECAST_SPILL_DIR", "/var/tmp"),
            ]),
        )
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.transcoder.command.program, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(config.transcoder.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.transcoder.spill_threshold, 32 * 1024 * 1024);
        assert_eq!(config.transcoder.spill_dir, Some(PathBuf::from("/var/tmp")));

        let config = ServerConfig::from_lookup(
            Some("/media".into()),
            lookup(&[("RECAST_BIND", "0.0.0.0:9000"), ("PORT", "8080")]),
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
    }
}
