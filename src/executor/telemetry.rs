//! Instrumentation points of the orchestrator.

use std::time::Instant;

use tracing::Span;
use tracing::field::Empty;

use crate::error::DbError;
use crate::options::DbOptions;
use crate::request::{CommandRequest, ExecutionResult};

/// Rows and payload read through a reader or stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetrics {
    pub rows: u64,
    pub result_sets: u64,
    pub bytes: u64,
    pub characters: u64,
}

impl StreamMetrics {
    pub(crate) fn record_row(&mut self, values: &[crate::types::DbValue]) {
        self.rows += 1;
        for value in values {
            let (bytes, chars) = value.payload_size();
            self.bytes += bytes;
            self.characters += chars;
        }
    }
}

/// An in-flight operation as seen by a [`TelemetrySink`].
#[derive(Debug, Clone)]
pub struct SpanHandle {
    pub operation: &'static str,
    pub span: Span,
    pub started: Instant,
}

impl SpanHandle {
    #[must_use]
    pub fn new(operation: &'static str, span: Span) -> Self {
        Self {
            operation,
            span,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Receives the instrumentation events of every public operation.
pub trait TelemetrySink: Send + Sync {
    fn start_span(
        &self,
        operation: &'static str,
        request: &CommandRequest,
        options: &DbOptions,
    ) -> SpanHandle;

    /// `count` carries the number of rows or records the operation produced, if any.
    fn record_result(&self, span: &SpanHandle, result: &ExecutionResult, count: Option<u64>);

    fn record_stream(&self, span: &SpanHandle, metrics: &StreamMetrics);

    fn record_error(&self, span: &SpanHandle, error: &DbError);
}

/// Emits one `db.operation` span per call through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn start_span(
        &self,
        operation: &'static str,
        request: &CommandRequest,
        options: &DbOptions,
    ) -> SpanHandle {
        let span = tracing::info_span!(
            "db.operation",
            operation,
            provider = %options.provider,
            command = request.label(),
            parameters = request.parameters.len(),
            rows_affected = Empty,
            records = Empty,
            bytes = Empty,
            characters = Empty,
            elapsed_ms = Empty,
            error = Empty,
        );
        SpanHandle::new(operation, span)
    }

    fn record_result(&self, span: &SpanHandle, result: &ExecutionResult, count: Option<u64>) {
        span.span.record("rows_affected", result.rows_affected);
        if let Some(count) = count {
            span.span.record("records", count);
        }
        span.span.record("elapsed_ms", span.elapsed_ms());
    }

    fn record_stream(&self, span: &SpanHandle, metrics: &StreamMetrics) {
        span.span.record("records", metrics.rows);
        span.span.record("bytes", metrics.bytes);
        span.span.record("characters", metrics.characters);
        span.span.record("elapsed_ms", span.elapsed_ms());
    }

    fn record_error(&self, span: &SpanHandle, error: &DbError) {
        span.span.record("error", tracing::field::display(error));
        span.span.record("elapsed_ms", span.elapsed_ms());
        tracing::debug!(parent: &span.span, operation = span.operation, error = %error, "operation failed");
    }
}
