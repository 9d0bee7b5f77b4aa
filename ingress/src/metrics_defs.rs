//! Metrics definitions for the ingress. Per-project metrics are labeled with
//! [`shared::metrics_defs::PROJECT_LABEL`].

use shared::metrics_defs::{MetricDef, MetricType};

pub const INVALID_PAYLOAD: MetricDef = MetricDef {
    name: "invalid.payload",
    metric_type: MetricType::Counter,
    description: "Messages dropped because the payload was missing or malformed. Tagged with reason.",
};

pub const INVALID_PROJECT_CONFIG: MetricDef = MetricDef {
    name: "invalid.project_config",
    metric_type: MetricType::Counter,
    description: "Messages dropped because the project configuration was missing or unreadable",
};

pub const INVALID_ORIGIN: MetricDef = MetricDef {
    name: "invalid.origin",
    metric_type: MetricType::Counter,
    description: "Messages dropped because of a disallowed origin. Tagged with dev (loopback origins).",
};

pub const OVER_USAGE_COUNT: MetricDef = MetricDef {
    name: "over_usage.count",
    metric_type: MetricType::Counter,
    description: "Messages dropped because the project exceeded its daily limit",
};

pub const OVER_USAGE_USAGE: MetricDef = MetricDef {
    name: "over_usage.usage",
    metric_type: MetricType::Gauge,
    description: "Usage of the project at the time of the last dropped over-limit message",
};

pub const OVER_USAGE_REMAINING: MetricDef = MetricDef {
    name: "over_usage.remaining",
    metric_type: MetricType::Gauge,
    description: "Milliseconds until the daily limit resets, at the last dropped over-limit message",
};

pub const PROCESSED_COUNT: MetricDef = MetricDef {
    name: "processed.count",
    metric_type: MetricType::Counter,
    description: "Messages stored and announced",
};

pub const PROCESSED_PERF: MetricDef = MetricDef {
    name: "processed.perf",
    metric_type: MetricType::Histogram,
    description: "Client-reported encryption time of stored messages in milliseconds",
};

pub const PROCESSED_SIZE: MetricDef = MetricDef {
    name: "processed.size",
    metric_type: MetricType::Histogram,
    description: "Payload length of stored messages in bytes",
};

pub const PROCESSED_COUNTRY: MetricDef = MetricDef {
    name: "processed.country",
    metric_type: MetricType::Counter,
    description: "Stored messages by country of origin. Tagged with country.",
};

pub const INTERNAL_ERROR: MetricDef = MetricDef {
    name: "internal_error",
    metric_type: MetricType::Counter,
    description: "Messages dropped because of an infrastructure failure",
};

pub const RATE_LIMITED: MetricDef = MetricDef {
    name: "rate_limited",
    metric_type: MetricType::Counter,
    description: "Requests denied by the per-client rate limiter",
};

pub const CATCH_ALL: MetricDef = MetricDef {
    name: "catch_all",
    metric_type: MetricType::Counter,
    description: "GET requests to unknown paths",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Push request duration in seconds. Tagged with outcome.",
};

/// Every metric emitted by the ingress. Keep in sync with the definitions above.
pub const ALL_METRICS: &[MetricDef] = &[
    INVALID_PAYLOAD,
    INVALID_PROJECT_CONFIG,
    INVALID_ORIGIN,
    OVER_USAGE_COUNT,
    OVER_USAGE_USAGE,
    OVER_USAGE_REMAINING,
    PROCESSED_COUNT,
    PROCESSED_PERF,
    PROCESSED_SIZE,
    PROCESSED_COUNTRY,
    INTERNAL_ERROR,
    RATE_LIMITED,
    CATCH_ALL,
    REQUEST_DURATION,
];
