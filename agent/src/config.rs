//! Trace request configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tandem_shared::utils::{parse_duration, serde_duration};
use tandem_shared::ActivityKind;

/// Duration of an on-demand trace when the request leaves it unset
pub const DEFAULT_TRACE_DURATION: Duration = Duration::from_millis(500);

/// Default bound on device records queued by the async delivery path
pub const DEFAULT_MAX_PENDING_DEVICE_RECORDS: usize = 1_000_000;

/// Settings for one trace request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Keep only nets whose name contains one of these (empty keeps all)
    pub name_filters: Vec<String>,

    /// Minimum device op count for a net iteration to be kept
    pub device_op_count_threshold: i32,

    /// Net whose iterations bound the trace
    pub iterations_target: Option<String>,

    /// Iterations of the target net to record (0 = no budget)
    pub iterations_target_count: i32,

    #[serde(with = "serde_duration")]
    pub warmup: Duration,

    #[serde(with = "serde_duration")]
    pub duration: Duration,

    /// When the request was issued, epoch nanoseconds in files
    #[serde(with = "epoch_nanos")]
    pub request_timestamp: Option<SystemTime>,

    /// Grace period added to the request timestamp before warmup starts
    #[serde(with = "serde_duration")]
    pub max_request_age: Duration,

    pub activity_kinds: BTreeSet<ActivityKind>,

    pub max_pending_device_records: usize,

    /// Write the finished trace here as JSON
    pub log_file: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            name_filters: Vec::new(),
            device_op_count_threshold: 0,
            iterations_target: None,
            iterations_target_count: 0,
            warmup: Duration::ZERO,
            duration: DEFAULT_TRACE_DURATION,
            request_timestamp: None,
            max_request_age: Duration::from_secs(10),
            activity_kinds: default_activity_kinds(),
            max_pending_device_records: DEFAULT_MAX_PENDING_DEVICE_RECORDS,
            log_file: None,
        }
    }
}

/// Everything except the kinds that are costly to record
pub fn default_activity_kinds() -> BTreeSet<ActivityKind> {
    ActivityKind::ALL
        .into_iter()
        .filter(|kind| {
            !matches!(
                kind,
                ActivityKind::ProfilerRange
                    | ActivityKind::DriverApi
                    | ActivityKind::DeviceSync
                    | ActivityKind::GpuPmCounter
            )
        })
        .collect()
}

impl TraceConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("Failed to parse trace configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    /// Apply `TANDEM_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TANDEM_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(value) = lookup("TANDEM_TRACE_DURATION") {
            self.duration = parse_duration(&value).context("Invalid TANDEM_TRACE_DURATION")?;
        }
        if let Some(value) = lookup("TANDEM_WARMUP") {
            self.warmup = parse_duration(&value).context("Invalid TANDEM_WARMUP")?;
        }
        if let Some(value) = lookup("TANDEM_TRACE_LOG_FILE") {
            self.log_file = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.duration.is_zero() {
            anyhow::bail!("Duration must be greater than 0");
        }

        if self.iterations_target_count < 0 {
            anyhow::bail!("Iteration target count must not be negative");
        }

        if self.device_op_count_threshold < 0 {
            anyhow::bail!("Device op count threshold must not be negative");
        }

        if self.max_pending_device_records == 0 {
            anyhow::bail!("Pending device record cap must be greater than 0");
        }

        Ok(())
    }
}

/// Serde adapter for an optional wall-clock time stored as epoch nanoseconds
mod epoch_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    use tandem_shared::utils::time::{from_epoch_nanos, to_epoch_nanos};

    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => serializer.serialize_some(&to_epoch_nanos(*t)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SystemTime>, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.map(from_epoch_nanos))
    }
}
