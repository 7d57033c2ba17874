use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_reconcile::BackoffPolicy;

use crate::controller::ReconcilerSettings;
use crate::platform::memory::FleetManifest;
use crate::runtime::ControllerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub concurrency: usize,
    pub reconcile_timeout: Duration,
    pub resync_interval: Duration,
    pub stuck_pending_threshold: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub seed_file: Option<PathBuf>,
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let concurrency: usize = parse_or(&lookup, "FLEET_CONCURRENCY", 4)?;
        if concurrency == 0 {
            anyhow::bail!("FLEET_CONCURRENCY must be at least 1");
        }

        let reconcile_timeout = secs(&lookup, "FLEET_RECONCILE_TIMEOUT_SECS", 30)?;
        let resync_interval = secs(&lookup, "FLEET_RESYNC_INTERVAL_SECS", 300)?;
        let stuck_pending_threshold = secs(&lookup, "FLEET_STUCK_PENDING_SECS", 300)?;
        let backoff_max = secs(&lookup, "FLEET_BACKOFF_MAX_SECS", 300)?;
        let backoff_base = Duration::from_millis(parse_or(&lookup, "FLEET_BACKOFF_BASE_MS", 200)?);

        let seed_file = lookup("FLEET_SEED_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let dev_mode = lookup("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            log_level,
            concurrency,
            reconcile_timeout,
            resync_interval,
            stuck_pending_threshold,
            backoff_base,
            backoff_max,
            seed_file,
            dev_mode,
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            concurrency: self.concurrency,
            reconcile_timeout: self.reconcile_timeout,
            resync_interval: self.resync_interval,
            backoff: BackoffPolicy {
                base: self.backoff_base,
                max: self.backoff_max,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            stuck_pending_threshold: self.stuck_pending_threshold,
            ..ReconcilerSettings::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

/// Whole seconds; zero is rejected.
fn secs<F>(lookup: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(lookup, name, default)?;
    if value == 0 {
        anyhow::bail!("{name} must be at least 1");
    }
    Ok(Duration::from_secs(value))
}

/// Read fleet manifests from a JSON array file.
pub async fn load_seed_file(path: &Path) -> Result<Vec<FleetManifest>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.reconcile_timeout, Duration::from_secs(30));
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.stuck_pending_threshold, Duration::from_secs(300));
        assert_eq!(config.backoff_base, Duration::from_millis(200));
        assert!(config.seed_file.is_none());
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FLEET_CONCURRENCY", "8"),
            ("FLEET_STUCK_PENDING_SECS", "60"),
            ("FLEET_SEED_FILE", "/etc/fleets.json"),
            ("FLEET_DEV", "true"),
        ]))
        .unwrap();

        assert_eq!(config.controller_config().concurrency, 8);
        assert_eq!(
            config.reconciler_settings().stuck_pending_threshold,
            Duration::from_secs(60)
        );
        assert_eq!(config.seed_file, Some(PathBuf::from("/etc/fleets.json")));
        assert!(config.dev_mode);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = Config::from_lookup(lookup(&[("FLEET_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("FLEET_CONCURRENCY"));

        assert!(Config::from_lookup(lookup(&[("FLEET_CONCURRENCY", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FLEET_RESYNC_INTERVAL_SECS", "0")])).is_err());
    }

    #[tokio::test]
    async fn test_load_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"namespace": "default", "name": "web", "replicas": 3,
                "template": {{"spec": {{"image": "app:v1"}}}}}}]"#
        )
        .unwrap();

        let manifests = load_seed_file(file.path()).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].replicas, 3);
        assert_eq!(manifests[0].template.spec["image"], "app:v1");
    }

    #[tokio::test]
    async fn test_load_seed_file_reports_path() {
        let err = load_seed_file(Path::new("/nonexistent/fleets.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleets.json"));
    }
}
