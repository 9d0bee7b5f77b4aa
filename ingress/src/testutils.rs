use crate::diagnostics::{Context, Diagnostics};
use parking_lot::Mutex;
use std::error::Error;

/// A report captured by [`RecordingDiagnostics`].
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub error: String,
    pub context: Vec<(&'static str, String)>,
}

impl Report {
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct RecordingDiagnostics {
    reports: Mutex<Vec<Report>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn report(&self, error: &(dyn Error + 'static), context: Context<'_>) {
        self.reports.lock().push(Report {
            error: error.to_string(),
            context: context.to_vec(),
        });
    }
}
