//! Configuration types.
//!
//! Every value has a default and can be overridden through a `JEDI_*`
//! environment variable. Parsing is done through a lookup function so the
//! rules can be exercised without touching the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::error::ConfigError;

/// Upper bound on a single store or catalog call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Watchdog tuning.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Upper bound for any single store or catalog call.
    pub call_timeout: Duration,
    /// Tasks reassigned concurrently.
    pub max_workers: usize,
    /// Soft locks older than this are released.
    pub lock_timeout: TimeDelta,
    /// Base hold for throttled tasks, multiplied by the throttle counter.
    pub wait_for_throttled: TimeDelta,
    /// Pending timeout when no VO/label specific value applies.
    pub timeout_for_pending: Option<TimeDelta>,
    /// Pending timeouts keyed by `(vo, prod_source_label)`.
    pub timeout_for_pending_vo_label: HashMap<(String, String), TimeDelta>,
    /// `(min priority, idle time)` pairs for high-priority reactivation.
    pub high_prio_pending: Vec<(i64, TimeDelta)>,
    /// Priority given to nearly finished tasks.
    pub boosted_priority: i64,
    /// Finished fraction of the master input that triggers the boost.
    pub boost_ratio: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_workers: 8,
            lock_timeout: TimeDelta::minutes(60),
            wait_for_throttled: TimeDelta::minutes(120),
            timeout_for_pending: Some(TimeDelta::hours(7 * 24)),
            timeout_for_pending_vo_label: HashMap::new(),
            high_prio_pending: vec![
                (950, TimeDelta::minutes(10)),
                (900, TimeDelta::minutes(30)),
            ],
            boosted_priority: 900,
            boost_ratio: 0.95,
        }
    }
}

impl WatchdogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let call_timeout = parse_var(&lookup, "JEDI_CALL_TIMEOUT_SECS")?
            .map_or(defaults.call_timeout, Duration::from_secs);
        let max_workers: usize =
            parse_var(&lookup, "JEDI_MAX_WORKERS")?.unwrap_or(defaults.max_workers);
        if max_workers == 0 {
            return Err(invalid("JEDI_MAX_WORKERS", "must be at least 1"));
        }
        let lock_timeout = parse_var(&lookup, "JEDI_LOCK_TIMEOUT_MINUTES")?
            .map_or(defaults.lock_timeout, TimeDelta::minutes);
        let wait_for_throttled = parse_var(&lookup, "JEDI_WAIT_FOR_THROTTLED_MINUTES")?
            .map_or(defaults.wait_for_throttled, TimeDelta::minutes);
        let timeout_for_pending = match parse_var::<i64>(&lookup, "JEDI_TIMEOUT_FOR_PENDING")? {
            Some(hours) if hours <= 0 => None,
            Some(hours) => Some(TimeDelta::hours(hours)),
            None => defaults.timeout_for_pending,
        };
        let timeout_for_pending_vo_label = match lookup("JEDI_TIMEOUT_FOR_PENDING_VO_LABEL") {
            Some(raw) => parse_pending_timeouts(&raw)?,
            None => HashMap::new(),
        };
        let boosted_priority =
            parse_var(&lookup, "JEDI_BOOSTED_PRIORITY")?.unwrap_or(defaults.boosted_priority);
        let boost_ratio: f64 = parse_var(&lookup, "JEDI_BOOST_RATIO")?.unwrap_or(defaults.boost_ratio);
        if !(0.0..=1.0).contains(&boost_ratio) {
            return Err(invalid("JEDI_BOOST_RATIO", "must be within 0 and 1"));
        }

        Ok(Self {
            call_timeout,
            max_workers,
            lock_timeout,
            wait_for_throttled,
            timeout_for_pending,
            timeout_for_pending_vo_label,
            boosted_priority,
            boost_ratio,
            ..defaults
        })
    }

    /// Pending timeout for a VO and source label, falling back to the global value.
    pub fn timeout_for_pending(&self, vo: &str, prod_source_label: &str) -> Option<TimeDelta> {
        self.timeout_for_pending_vo_label
            .get(&(vo.to_string(), prod_source_label.to_string()))
            .copied()
            .or(self.timeout_for_pending)
    }
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub topology_path: PathBuf,
    pub vo: String,
    /// One watchdog runs per label.
    pub prod_source_labels: Vec<String>,
    pub interval: Duration,
    pub watchdog: WatchdogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jedi.db"),
            topology_path: PathBuf::from("./topology.json"),
            vo: "atlas".to_string(),
            prod_source_labels: vec!["managed".to_string()],
            interval: Duration::from_secs(600),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let prod_source_labels = match lookup("JEDI_PROD_SOURCE_LABELS") {
            Some(raw) => {
                let labels: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if labels.is_empty() {
                    return Err(invalid("JEDI_PROD_SOURCE_LABELS", "no labels given"));
                }
                labels
            }
            None => defaults.prod_source_labels,
        };
        let interval = parse_var(&lookup, "JEDI_WATCHDOG_INTERVAL_SECS")?
            .map_or(defaults.interval, Duration::from_secs);
        if interval.is_zero() {
            return Err(invalid("JEDI_WATCHDOG_INTERVAL_SECS", "must be positive"));
        }

        Ok(Self {
            db_path: lookup("JEDI_DB_PATH").map_or(defaults.db_path, PathBuf::from),
            topology_path: lookup("JEDI_TOPOLOGY_PATH").map_or(defaults.topology_path, PathBuf::from),
            vo: lookup("JEDI_VO").unwrap_or(defaults.vo),
            prod_source_labels,
            interval,
            watchdog: WatchdogConfig::from_lookup(lookup)?,
        })
    }
}

/// Parse a `vo:label:hours` comma list.
pub fn parse_pending_timeouts(raw: &str) -> Result<HashMap<(String, String), TimeDelta>, ConfigError> {
    const KEY: &str = "JEDI_TIMEOUT_FOR_PENDING_VO_LABEL";
    let mut table = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let [vo, label, hours] = parts.as_slice() else {
            return Err(invalid(KEY, format!("expected vo:label:hours, got {entry:?}")));
        };
        let hours: i64 = hours
            .parse()
            .map_err(|e| invalid(KEY, format!("{entry:?}: {e}")))?;
        table.insert((vo.to_string(), label.to_string()), TimeDelta::hours(hours));
    }
    Ok(table)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
