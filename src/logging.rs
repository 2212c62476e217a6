//! # Structured Logging Module
//!
//! Environment-aware structured logging for the execution engine, the
//! constraint queue and the verification state machine.

use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(get_log_level(&environment)));

        // Production ships JSON lines; everything else gets readable output
        let layer = if environment == "production" {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
pub(crate) fn get_environment() -> String {
    std::env::var("STEPRUNNER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for execution node operations
pub fn log_execution_operation(
    operation: &str,
    execution_id: &str,
    step_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        step_type = step_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "⚙️ EXECUTION_OPERATION"
    );
}

/// Log structured data for resource constraint operations
pub fn log_restraint_operation(
    operation: &str,
    resource_unit: &str,
    consumer_id: Option<&str>,
    order: Option<i64>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        resource_unit = %resource_unit,
        consumer_id = consumer_id,
        order = order,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚦 RESTRAINT_OPERATION"
    );
}

/// Log structured data for verification state machine operations
pub fn log_verification_operation(
    operation: &str,
    verification_task_id: &str,
    state: &str,
    retry_count: u32,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        verification_task_id = %verification_task_id,
        state = %state,
        retry_count = retry_count,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔬 VERIFICATION_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
