/*!
 * Entry Point Tracing
 * Structured spans around every psynch entry using the tracing crate
 *
 * Features:
 * - Trace ID per entry for correlating park and wake sides
 * - JSON-formatted output on request
 * - Slow-entry warnings (parked time included)
 */

use crate::core::limits::SLOW_ENTRY_THRESHOLD;
use crate::core::types::{Address, Tid};
use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - PSYNCH_TRACE_JSON: Enable JSON output (default: false)
///
/// `log` records are bridged into the subscriber. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("PSYNCH_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
    };

    if result.is_ok() {
        info!(json = use_json, "psynch tracing initialized");
    }
}

/// Generate a unique trace ID for request correlation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one entry point call, from acquire to return
pub struct EntrySpan {
    span: Span,
    start: Instant,
    entry: &'static str,
    trace_id: String,
}

impl EntrySpan {
    pub fn new(entry: &'static str, tid: Tid, addr: Address) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::DEBUG,
            "psynch",
            trace_id = %trace_id,
            entry = entry,
            tid = tid,
            addr = addr,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
            bits = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            entry,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Record the update bits handed back
    pub fn record_bits(&self, bits: u32) {
        self.span.record("bits", bits);
        self.span.record("result", "ok");
    }

    pub fn record_error(&self, errno: i32) {
        self.span.record("result", errno);
    }
}

impl Drop for EntrySpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration > SLOW_ENTRY_THRESHOLD {
            warn!(
                trace_id = %self.trace_id,
                entry = self.entry,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow psynch entry"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                entry = self.entry,
                duration_us = duration.as_micros() as u64,
                "psynch entry completed"
            );
        }
    }
}

/// Open a span for an entry point
#[inline]
pub fn span_entry(entry: &'static str, tid: Tid, addr: Address) -> EntrySpan {
    EntrySpan::new(entry, tid, addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_ids_unique() {
        let a = span_entry("mutex_wait", 1, 0x1000);
        let b = span_entry("mutex_wait", 1, 0x1000);
        assert_ne!(a.trace_id(), b.trace_id());
        assert_eq!(a.trace_id().len(), 36);
    }
}
