//! Controller configuration read from environment variables.

use crate::error::ControllerError;
use declarative::{ReadyCheckStrategy, RequeueIntervals};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Field manager used when the environment does not name one.
pub const DEFAULT_FIELD_OWNER: &str = "declarative.operator.io/applier";

/// Which reconciliation path drives the instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Render, diff, prune and apply in one pass
    Declarative,
    /// One job per installation on a worker pool
    WorkerPool,
}

impl FromStr for Strategy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "declarative" => Ok(Strategy::Declarative),
            "worker-pool" => Ok(Strategy::WorkerPool),
            other => Err(ControllerError::InvalidConfig(format!(
                "RECONCILE_STRATEGY must be 'declarative' or 'worker-pool', got '{other}'"
            ))),
        }
    }
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub watch_namespace: Option<String>,
    pub field_owner: String,
    pub install_namespace: String,
    pub create_namespace: bool,
    pub strategy: Strategy,
    pub workers: usize,
    pub max_concurrent_reconciles: u16,
    pub requeue: RequeueIntervals,
    pub ready_check: ReadyCheckStrategy,
    pub delete_prerequisites: bool,
    pub manifest_root: PathBuf,
}

fn parse<T>(key: &str, value: Option<String>, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key} has an invalid value '{raw}': {e}"))),
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = RequeueIntervals::default();
        let seconds = |key: &str, default: Duration| -> Result<Duration, ControllerError> {
            parse(key, lookup(key), default.as_secs()).map(Duration::from_secs)
        };

        let ready_check = match lookup("READY_CHECK") {
            None => ReadyCheckStrategy::default(),
            Some(raw) => raw
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("READY_CHECK: {e}")))?,
        };

        let config = Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            field_owner: lookup("FIELD_OWNER").unwrap_or_else(|| DEFAULT_FIELD_OWNER.to_string()),
            install_namespace: lookup("INSTALL_NAMESPACE").unwrap_or_default(),
            create_namespace: parse("CREATE_NAMESPACE", lookup("CREATE_NAMESPACE"), false)?,
            strategy: match lookup("RECONCILE_STRATEGY") {
                None => Strategy::Declarative,
                Some(raw) => raw.parse()?,
            },
            workers: parse("WORKER_COUNT", lookup("WORKER_COUNT"), 4)?,
            max_concurrent_reconciles: parse("MAX_CONCURRENT_RECONCILES", lookup("MAX_CONCURRENT_RECONCILES"), 1)?,
            requeue: RequeueIntervals {
                success: seconds("REQUEUE_SUCCESS_SECONDS", defaults.success)?,
                failure: seconds("REQUEUE_FAILURE_SECONDS", defaults.failure)?,
                waiting: seconds("REQUEUE_WAITING_SECONDS", defaults.waiting)?,
            },
            ready_check,
            delete_prerequisites: parse("DELETE_PREREQUISITES", lookup("DELETE_PREREQUISITES"), false)?,
            manifest_root: lookup("MANIFEST_ROOT").map_or_else(|| PathBuf::from("/manifests"), PathBuf::from),
        };

        if config.workers == 0 {
            return Err(ControllerError::InvalidConfig("WORKER_COUNT must be at least 1".to_string()));
        }
        if config.max_concurrent_reconciles == 0 {
            return Err(ControllerError::InvalidConfig(
                "MAX_CONCURRENT_RECONCILES must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.field_owner, DEFAULT_FIELD_OWNER);
        assert_eq!(config.strategy, Strategy::Declarative);
        assert_eq!(config.requeue, RequeueIntervals::default());
        assert_eq!(config.ready_check, ReadyCheckStrategy::Deep);
        assert_eq!(config.manifest_root, PathBuf::from("/manifests"));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("WATCH_NAMESPACE", "kyma-system"),
            ("RECONCILE_STRATEGY", "worker-pool"),
            ("WORKER_COUNT", "8"),
            ("REQUEUE_SUCCESS_SECONDS", "120"),
            ("READY_CHECK", "exists"),
            ("CREATE_NAMESPACE", "true"),
        ])
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("kyma-system"));
        assert_eq!(config.strategy, Strategy::WorkerPool);
        assert_eq!(config.workers, 8);
        assert_eq!(config.requeue.success, Duration::from_secs(120));
        assert_eq!(config.ready_check, ReadyCheckStrategy::Exists);
        assert!(config.create_namespace);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(config(&[("WORKER_COUNT", "many")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("WORKER_COUNT", "0")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("RECONCILE_STRATEGY", "helm")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("READY_CHECK", "maybe")]), Err(ControllerError::InvalidConfig(_))));
    }
}
