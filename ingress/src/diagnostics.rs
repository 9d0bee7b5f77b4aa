//! Out-of-band error reporting.
//!
//! Reports never block the caller and never fail; the pipeline calls
//! [`Diagnostics::report`] and carries on.

use std::error::Error;

/// Key/value context attached to a report.
pub type Context<'a> = &'a [(&'static str, String)];

pub trait Diagnostics: Send + Sync {
    fn report(&self, error: &(dyn Error + 'static), context: Context<'_>);
}

/// Sends reports to Sentry. Each `project_id` context entry becomes a tag,
/// everything else an extra.
pub struct SentryDiagnostics;

impl Diagnostics for SentryDiagnostics {
    fn report(&self, error: &(dyn Error + 'static), context: Context<'_>) {
        sentry::with_scope(
            |scope| {
                for (key, value) in context {
                    match *key {
                        "project_id" => scope.set_tag(key, value),
                        _ => scope.set_extra(key, value.clone().into()),
                    }
                }
            },
            || sentry::capture_error(error),
        );
    }
}

/// Discards every report. Used when no Sentry DSN is configured.
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {
    fn report(&self, _error: &(dyn Error + 'static), _context: Context<'_>) {}
}
