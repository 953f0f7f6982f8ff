use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000/api";
pub const DEFAULT_OUT_DIR: &str = ".xray-dash";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub const ENV_API_BASE: &str = "XRAY_API_BASE_URL";
pub const ENV_OUT_DIR: &str = "XRAY_OUT_DIR";
pub const ENV_TIMEOUT_SECS: &str = "XRAY_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base: String,
    pub out_dir: PathBuf,
    pub timeout: Duration,
}

/// Values given on the command line; anything left `None` falls back to the
/// environment and then to the defaults.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub api_base: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

impl ClientConfig {
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        Self::resolve_with(overrides, |key| env::var(key).ok())
    }

    pub fn resolve_with<F>(overrides: ConfigOverrides, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_base = overrides
            .api_base
            .or_else(|| from_env(ENV_API_BASE))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let out_dir = overrides
            .out_dir
            .or_else(|| from_env(ENV_OUT_DIR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));
        let timeout_secs = overrides
            .timeout_secs
            .or_else(|| from_env(ENV_TIMEOUT_SECS).and_then(|v| v.trim().parse().ok()))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            api_base,
            out_dir,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = ClientConfig::resolve_with(ConfigOverrides::default(), |_| None);
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.out_dir, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(cfg.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn environment_fills_gaps() {
        let env = env_of(&[
            (ENV_API_BASE, "http://diag:9000/api"),
            (ENV_OUT_DIR, "  "),
            (ENV_TIMEOUT_SECS, "30"),
        ]);
        let cfg = ClientConfig::resolve_with(ConfigOverrides::default(), |k| env.get(k).cloned());
        assert_eq!(cfg.api_base, "http://diag:9000/api");
        assert_eq!(cfg.out_dir, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn flags_beat_environment() {
        let env = env_of(&[(ENV_API_BASE, "http://env/api"), (ENV_TIMEOUT_SECS, "junk")]);
        let cfg = ClientConfig::resolve_with(
            ConfigOverrides {
                api_base: Some("http://flag/api".into()),
                out_dir: Some(PathBuf::from("out")),
                timeout_secs: None,
            },
            |k| env.get(k).cloned(),
        );
        assert_eq!(cfg.api_base, "http://flag/api");
        assert_eq!(cfg.out_dir, PathBuf::from("out"));
        assert_eq!(cfg.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
