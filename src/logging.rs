//! # Structured Logging - Substrate Operational Telemetry
//!
//! Structured logging with performance monitoring and category counters for
//! the QVM substrate. Tracks admission decisions, capability mediation,
//! firewall verdicts, resource movements, and per-job execution progress.
//!
//! This layer is operational telemetry only. The tamper-evident record of
//! admissions and executions is the Merkle-accumulating audit log; nothing
//! here is normative.

use dashmap::DashMap;
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{QvmError, Result};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Global logger instance with safe initialization
pub static LOGGER: Lazy<Arc<SubstrateLogger>> = Lazy::new(|| {
    let config = LoggingConfig {
        console_enabled: false, // Disable console in production
        file_enabled: true,
        ..LoggingConfig::default()
    };

    match SubstrateLogger::with_config(config) {
        Ok(logger) => Arc::new(logger),
        Err(_) => Arc::new(SubstrateLogger::new_minimal()),
    }
});

/// Log levels for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Log categories for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    /// Graph admission: certification and rejection
    Admission,
    /// Token issuance, attenuation, revocation, and mediation
    Capability,
    /// Entanglement firewall verdicts and channel lifecycle
    Firewall,
    /// Physical qubit pool movements and quotas
    Resource,
    /// Per-job engine progress and state transitions
    Execution,
    /// Logical qubit operations and measurements
    Quantum,
    /// Audit log appends and root updates
    Audit,
    /// Security-relevant events across components
    Security,
    /// System startup, shutdown, configuration
    System,
    /// Performance metrics and timing
    Performance,
    /// Error events
    Error,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogCategory::Admission => "admission",
            LogCategory::Capability => "capability",
            LogCategory::Firewall => "firewall",
            LogCategory::Resource => "resource",
            LogCategory::Execution => "execution",
            LogCategory::Quantum => "quantum",
            LogCategory::Audit => "audit",
            LogCategory::Security => "security",
            LogCategory::System => "system",
            LogCategory::Performance => "performance",
            LogCategory::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp when the log entry was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Log level
    pub level: LogLevel,
    /// Log category
    pub category: LogCategory,
    /// Main log message
    pub message: String,
    /// Additional structured data
    pub data: serde_json::Value,
    /// Source location (file:line)
    pub source: Option<String>,
    /// Job id for correlating per-job entries
    pub job_id: Option<String>,
    /// Operation duration in milliseconds
    pub duration_ms: Option<u64>,
}

/// Logging performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMetrics {
    /// Total log entries processed
    pub total_entries: u64,
    /// Entries by level
    pub entries_by_level: std::collections::HashMap<String, u64>,
    /// Entries by category
    pub entries_by_category: std::collections::HashMap<String, u64>,
    /// Error rate
    pub error_rate: f64,
}

/// Configuration for substrate logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level
    pub min_level: LogLevel,
    /// Enable console output
    pub console_enabled: bool,
    /// Enable file logging
    pub file_enabled: bool,
    /// Log file directory
    pub log_dir: String,
    /// Enable structured JSON logging
    pub json_format: bool,
    /// Enable performance monitoring
    pub performance_monitoring: bool,
    /// Retain recent security entries in memory
    pub security_buffer_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            console_enabled: true,
            file_enabled: true,
            log_dir: "./logs".to_string(),
            json_format: true,
            performance_monitoring: true,
            security_buffer_enabled: true,
        }
    }
}

/// Substrate logging system
pub struct SubstrateLogger {
    config: LoggingConfig,
    metrics: Arc<RwLock<LoggingMetrics>>,
    category_counters: Arc<DashMap<LogCategory, u64>>,
    /// Recent security/capability entries for diagnostics
    security_buffer: Arc<RwLock<Vec<LogEntry>>>,
}

impl SubstrateLogger {
    pub fn new() -> Result<Self> {
        Self::with_config(LoggingConfig::default())
    }

    /// Create a minimal logger that doesn't initialize tracing (for fallback)
    pub fn new_minimal() -> Self {
        Self {
            config: LoggingConfig {
                console_enabled: false,
                file_enabled: false,
                ..LoggingConfig::default()
            },
            metrics: Arc::new(RwLock::new(LoggingMetrics {
                total_entries: 0,
                entries_by_level: std::collections::HashMap::new(),
                entries_by_category: std::collections::HashMap::new(),
                error_rate: 0.0,
            })),
            category_counters: Arc::new(DashMap::new()),
            security_buffer: Arc::new(RwLock::new(Vec::with_capacity(4096))),
        }
    }

    /// Create logger with custom configuration
    pub fn with_config(config: LoggingConfig) -> Result<Self> {
        if config.file_enabled {
            fs::create_dir_all(&config.log_dir).map_err(|e| {
                QvmError::Configuration(format!("failed to create log directory: {e}"))
            })?;
        }

        Self::init_tracing(&config)?;

        let logger = Self {
            config,
            metrics: Arc::new(RwLock::new(LoggingMetrics {
                total_entries: 0,
                entries_by_level: std::collections::HashMap::new(),
                entries_by_category: std::collections::HashMap::new(),
                error_rate: 0.0,
            })),
            category_counters: Arc::new(DashMap::new()),
            security_buffer: Arc::new(RwLock::new(Vec::with_capacity(4096))),
        };

        info!(
            category = %LogCategory::System,
            "substrate logger initialized with config: {:?}",
            logger.config
        );

        Ok(logger)
    }

    /// Initialize tracing subscriber (thread-safe, can be called multiple times)
    fn init_tracing(config: &LoggingConfig) -> Result<()> {
        if TRACING_INITIALIZED
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Ok(());
        }

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(Self::level_to_string(config.min_level))
        });

        let mut layers = Vec::new();

        if config.console_enabled {
            let console_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            if config.json_format {
                layers.push(console_layer.json().boxed());
            } else {
                layers.push(console_layer.pretty().boxed());
            }
        }

        if config.file_enabled {
            let file_appender = rolling::daily(&config.log_dir, "substrate.log");
            let (non_blocking, _guard) = non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            if config.json_format {
                layers.push(file_layer.json().boxed());
            } else {
                layers.push(file_layer.boxed());
            }
        }

        match tracing_subscriber::registry()
            .with(env_filter)
            .with(layers)
            .try_init()
        {
            Ok(()) => Ok(()),
            Err(_) => {
                // Another subscriber won the race; that is fine for tests
                TRACING_INITIALIZED.store(false, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn level_to_string(level: LogLevel) -> &'static str {
        match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Log a structured entry
    pub fn log(&self, entry: LogEntry) {
        self.update_metrics(&entry);

        if self.config.security_buffer_enabled
            && matches!(entry.category, LogCategory::Security | LogCategory::Capability)
        {
            let mut buffer = self.security_buffer.write();
            buffer.push(entry.clone());
            if buffer.len() > 4096 {
                buffer.drain(0..1024);
            }
        }

        if entry.level < self.config.min_level {
            return;
        }

        let level: Level = entry.level.into();
        let category = entry.category.to_string();

        match level {
            Level::TRACE => trace!(
                category = category,
                job_id = entry.job_id.as_deref(),
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::DEBUG => debug!(
                category = category,
                job_id = entry.job_id.as_deref(),
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::INFO => info!(
                category = category,
                job_id = entry.job_id.as_deref(),
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::WARN => warn!(
                category = category,
                job_id = entry.job_id.as_deref(),
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::ERROR => error!(
                category = category,
                job_id = entry.job_id.as_deref(),
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
        }

        if self.config.performance_monitoring {
            counter!("substrate_log_entries_total", 1,
                "category" => category, "level" => Self::level_to_string(entry.level));
        }
    }

    fn update_metrics(&self, entry: &LogEntry) {
        let mut metrics = self.metrics.write();
        metrics.total_entries += 1;

        let level_key = Self::level_to_string(entry.level).to_string();
        *metrics.entries_by_level.entry(level_key).or_insert(0) += 1;

        let category_key = entry.category.to_string();
        *metrics.entries_by_category.entry(category_key).or_insert(0) += 1;

        *self
            .category_counters
            .entry(entry.category.clone())
            .or_insert(0) += 1;

        let error_count = metrics.entries_by_level.get("error").copied().unwrap_or(0);
        metrics.error_rate = if metrics.total_entries > 0 {
            (error_count as f64 / metrics.total_entries as f64) * 100.0
        } else {
            0.0
        };
    }

    /// Get current metrics
    pub fn get_metrics(&self) -> LoggingMetrics {
        self.metrics.read().clone()
    }

    /// Recent security/capability entries
    pub fn get_security_trail(&self) -> Vec<LogEntry> {
        self.security_buffer.read().clone()
    }

    /// Clear the security trail
    pub fn clear_security_trail(&self) {
        self.security_buffer.write().clear();
    }
}

fn base_entry(level: LogLevel, category: LogCategory, message: &str) -> LogEntry {
    LogEntry {
        timestamp: chrono::Utc::now(),
        level,
        category,
        message: message.to_string(),
        data: serde_json::Value::Null,
        source: None,
        job_id: None,
        duration_ms: None,
    }
}

/// Global logging functions
pub fn log_info(category: LogCategory, message: &str) {
    LOGGER.log(base_entry(LogLevel::Info, category, message));
}

pub fn log_warn(category: LogCategory, message: &str) {
    LOGGER.log(base_entry(LogLevel::Warn, category, message));
}

pub fn log_error(category: LogCategory, message: &str) {
    LOGGER.log(base_entry(LogLevel::Error, category, message));
}

pub fn log_security(message: &str, data: serde_json::Value) {
    let mut entry = base_entry(LogLevel::Info, LogCategory::Security, message);
    entry.data = data;
    LOGGER.log(entry);
}

pub fn log_execution(job_id: &str, message: &str, data: serde_json::Value) {
    let mut entry = base_entry(LogLevel::Info, LogCategory::Execution, message);
    entry.job_id = Some(job_id.to_string());
    entry.data = data;
    LOGGER.log(entry);
}

/// Performance measurement helper
pub struct PerformanceTimer {
    start_time: Instant,
    category: LogCategory,
    operation: String,
    job_id: Option<String>,
}

impl PerformanceTimer {
    /// Start a new performance timer
    pub fn start(category: LogCategory, operation: &str) -> Self {
        Self {
            start_time: Instant::now(),
            category,
            operation: operation.to_string(),
            job_id: None,
        }
    }

    /// Start a performance timer correlated to a job
    pub fn start_for_job(category: LogCategory, operation: &str, job_id: String) -> Self {
        Self {
            start_time: Instant::now(),
            category,
            operation: operation.to_string(),
            job_id: Some(job_id),
        }
    }

    /// Get the elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish the timer and log the result
    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;

        LOGGER.log(LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            category: self.category.clone(),
            message: format!("operation '{}' completed", self.operation),
            data: serde_json::json!({
                "operation": self.operation.clone(),
                "duration_ms": duration_ms
            }),
            source: None,
            job_id: self.job_id,
            duration_ms: Some(duration_ms),
        });

        if LOGGER.config.performance_monitoring {
            histogram!("substrate_operation_duration_ms", duration_ms as f64,
                "operation" => self.operation, "category" => self.category.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter("debug")
                .try_init();
        });
    }

    #[test]
    fn test_logger_creation() {
        init_test_logging();

        let logger = SubstrateLogger::with_config(LoggingConfig {
            console_enabled: false,
            file_enabled: false,
            ..LoggingConfig::default()
        });
        assert!(logger.is_ok());
    }

    #[test]
    fn test_file_logging_creates_the_log_directory() {
        init_test_logging();

        let temp_dir = tempfile::TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("substrate-logs");
        let logger = SubstrateLogger::with_config(LoggingConfig {
            log_dir: log_dir.to_string_lossy().to_string(),
            console_enabled: false,
            file_enabled: true,
            ..LoggingConfig::default()
        });
        assert!(logger.is_ok());
        assert!(log_dir.exists());
    }

    #[test]
    fn test_structured_logging_updates_metrics() {
        init_test_logging();

        let logger = SubstrateLogger::new_minimal();
        logger.log(LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            category: LogCategory::Admission,
            message: "graph certified".to_string(),
            data: serde_json::json!({"nodes": 6}),
            source: None,
            job_id: Some("job-1".to_string()),
            duration_ms: Some(2),
        });

        let metrics = logger.get_metrics();
        assert_eq!(metrics.total_entries, 1);
        assert!(metrics.entries_by_category.contains_key("admission"));
    }

    #[test]
    fn test_security_trail_captures_capability_entries() {
        init_test_logging();

        let logger = SubstrateLogger::new_minimal();
        logger.log(base_entry(
            LogLevel::Warn,
            LogCategory::Capability,
            "access denied for op MEASURE_Z",
        ));
        logger.log(base_entry(LogLevel::Info, LogCategory::Resource, "alloc"));

        let trail = logger.get_security_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].category, LogCategory::Capability);

        logger.clear_security_trail();
        assert!(logger.get_security_trail().is_empty());
    }

    #[test]
    fn test_performance_timer_measures_elapsed() {
        init_test_logging();

        let timer = PerformanceTimer::start(LogCategory::Performance, "certify");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed().as_millis() >= 5);
        timer.finish();

        let job_timer =
            PerformanceTimer::start_for_job(LogCategory::Execution, "execute", "job-7".into());
        assert_eq!(job_timer.job_id.as_deref(), Some("job-7"));
        job_timer.finish();
    }
}
