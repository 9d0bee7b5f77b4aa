//! Admission of one inbound message.
//!
//! A message moves through a fixed sequence of states, each transition
//! consuming the previous state and short-circuiting to a terminal
//! [`Outcome`] on the first failed check:
//!
//! ```text
//! InboundMessage ──validate──▶ Validated ──authorize──▶ Authorized
//!       ──prepare──▶ Prepared ──commit──▶ Accepted | OverLimit
//! ```
//!
//! The quota decision is taken inside the commit transaction, so the usage
//! that drives the branch is exactly the usage that gets persisted. There is
//! a single increment per message whether it is stored or dropped.
//!
//! The pipeline holds no locks. Correctness under concurrent requests for the
//! same project comes from the store's atomic primitives only.

use crate::diagnostics::Diagnostics;
use crate::errors::AdmissionError;
use crate::keys::{KeyKind, project_key};
use crate::ledger::UsageLedger;
use crate::message::{OverageStats, PAYLOAD_MARKER, SerializedMessage, parse_perf};
use crate::metrics_defs::{
    INTERNAL_ERROR, INVALID_ORIGIN, INVALID_PAYLOAD, INVALID_PROJECT_CONFIG, OVER_USAGE_COUNT,
    OVER_USAGE_REMAINING, OVER_USAGE_USAGE, PROCESSED_COUNT, PROCESSED_COUNTRY, PROCESSED_PERF,
    PROCESSED_SIZE,
};
use crate::project_config::{ProjectConfig, get_project_config};
use crate::store::{Commit, CommitOutcome, Store};
use shared::metrics_defs::PROJECT_LABEL;
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use url::Url;

/// Number of payload characters attached to diagnostics reports.
const REPORTED_PAYLOAD_PREFIX: usize = 64;

/// A message as received from the HTTP layer, before any check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub project_id: String,
    /// `None` when the request carried no payload at all
    pub payload: Option<String>,
    pub origin: Option<String>,
    pub country: Option<String>,
    /// Raw `perf` query value, coerced with [`parse_perf`]
    pub perf: Option<String>,
    /// Admission time, milliseconds since the epoch
    pub now: i64,
}

/// Terminal state of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted { usage: u64 },
    InvalidPayload,
    MissingPayload,
    UnknownProject,
    InvalidOrigin,
    DevOriginIgnored,
    OverLimit(OverageStats),
    InternalError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted { .. } => "accepted",
            Outcome::InvalidPayload => "invalid-payload",
            Outcome::MissingPayload => "missing-payload",
            Outcome::UnknownProject => "unknown-project",
            Outcome::InvalidOrigin => "invalid-origin",
            Outcome::DevOriginIgnored => "dev-origin-ignored",
            Outcome::OverLimit(_) => "over-limit",
            Outcome::InternalError => "internal-error",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }
}

/// The payload has the expected envelope.
#[derive(Debug)]
pub struct Validated {
    inbound: InboundMessage,
    payload: String,
}

/// The project exists and the origin is allowed.
#[derive(Debug)]
pub struct Authorized {
    validated: Validated,
    config: ProjectConfig,
}

/// The transaction to run against the store, built but not yet issued.
#[derive(Debug)]
pub struct Prepared {
    pub commit: Commit,
    pub message: SerializedMessage,
}

/// Returns true for `http(s)://localhost` and `http(s)://127.0.0.1` on any port.
pub fn is_loopback_origin(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    matches!(url.scheme(), "http" | "https")
        && matches!(url.host_str(), Some("localhost" | "127.0.0.1"))
        && url.username().is_empty()
        && url.path() == "/"
        && url.query().is_none()
        && url.fragment().is_none()
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    store: Arc<dyn Store>,
    ledger: UsageLedger,
    diagnostics: Arc<dyn Diagnostics>,
}

impl AdmissionPipeline {
    pub fn new(store: Arc<dyn Store>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        AdmissionPipeline {
            ledger: UsageLedger::new(store.clone()),
            store,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }

    /// Runs every check and, if they pass, the commit transaction.
    ///
    /// Never fails: every rejection and every infrastructure error is
    /// converted into an [`Outcome`].
    pub async fn admit(&self, inbound: InboundMessage) -> Outcome {
        let validated = match self.validate(inbound) {
            Ok(validated) => validated,
            Err(outcome) => return outcome,
        };
        let authorized = match self.authorize(validated).await {
            Ok(authorized) => authorized,
            Err(outcome) => return outcome,
        };
        let prepared = match self.prepare(authorized) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        self.commit(prepared).await
    }

    /// Shape check: the payload must be present and carry the envelope marker.
    pub fn validate(&self, inbound: InboundMessage) -> Result<Validated, Outcome> {
        let project_id = inbound.project_id.as_str();
        let payload = match inbound.payload.as_deref() {
            None => {
                tracing::warn!(project_id, "Missing payload");
                self.reject_payload(project_id, AdmissionError::MissingPayload, "", "missing");
                return Err(Outcome::MissingPayload);
            }
            Some(payload) if !payload.starts_with(PAYLOAD_MARKER) => {
                tracing::warn!(project_id, payload_len = payload.len(), "Invalid payload format");
                self.reject_payload(project_id, AdmissionError::InvalidPayload, payload, "invalid");
                return Err(Outcome::InvalidPayload);
            }
            Some(payload) => payload.to_owned(),
        };

        Ok(Validated { inbound, payload })
    }

    /// Configuration lookup followed by the origin check.
    ///
    /// Requests without an origin pass; only browsers send one. Loopback
    /// origins are dropped like any other disallowed origin but are not
    /// reported, they are local development traffic.
    pub async fn authorize(&self, validated: Validated) -> Result<Authorized, Outcome> {
        let project_id = validated.inbound.project_id.as_str();

        let Some(config) =
            get_project_config(self.store.as_ref(), self.diagnostics.as_ref(), project_id).await
        else {
            counter!(INVALID_PROJECT_CONFIG, PROJECT_LABEL => project_id.to_owned()).increment(1);
            return Err(Outcome::UnknownProject);
        };

        if let Some(origin) = validated.inbound.origin.as_deref()
            && !config.allows_origin(origin)
        {
            if is_loopback_origin(origin) {
                tracing::debug!(project_id, origin, "Ignoring loopback origin");
                counter!(INVALID_ORIGIN, PROJECT_LABEL => project_id.to_owned(), "dev" => "true")
                    .increment(1);
                return Err(Outcome::DevOriginIgnored);
            }

            tracing::warn!(
                project_id,
                request_origin = origin,
                project_origins = ?config.origins,
                "Invalid origin"
            );
            counter!(INVALID_ORIGIN, PROJECT_LABEL => project_id.to_owned(), "dev" => "false")
                .increment(1);
            self.diagnostics.report(
                &AdmissionError::InvalidOrigin,
                &[
                    ("project_id", project_id.to_owned()),
                    ("request_origin", origin.to_owned()),
                    ("project_origins", config.origins.join(", ")),
                ],
            );
            return Err(Outcome::InvalidOrigin);
        }

        Ok(Authorized { validated, config })
    }

    /// Builds the message and the commit transaction, stamping the
    /// admission time and the usage counter expiry.
    pub fn prepare(&self, authorized: Authorized) -> Result<Prepared, Outcome> {
        let Authorized { validated, config } = authorized;
        let Validated { inbound, payload } = validated;
        let project_id = inbound.project_id;
        let now = inbound.now;

        let message = SerializedMessage {
            payload,
            received: now,
            perf: parse_perf(inbound.perf.as_deref()),
            country: inbound.country.filter(|country| !country.is_empty()),
        };
        let serialized = match serde_json::to_string(&message) {
            Ok(serialized) => serialized,
            Err(e) => return Err(self.internal_error(&project_id, e.into())),
        };

        Ok(Prepared {
            commit: Commit {
                count_key: UsageLedger::count_key(&project_id),
                data_key: project_key(&project_id, KeyKind::Data),
                expire_at: UsageLedger::expires_at(now),
                daily_limit: config.daily_limit(),
                message: serialized,
                now,
                project_id,
            },
            message,
        })
    }

    /// Issues the single atomic transaction: count usage, then either store
    /// and announce the message, or announce the overage.
    pub async fn commit(&self, prepared: Prepared) -> Outcome {
        let Prepared { commit, message } = prepared;
        let project_id = commit.project_id.as_str();

        let outcome = match self.ledger.increment_and_get(&commit).await {
            Ok(outcome) => outcome,
            Err(e) => return self.internal_error(project_id, e.into()),
        };
        tracing::trace!(project_id, usage = outcome.usage(), "Usage counted");

        match outcome {
            CommitOutcome::Stored { usage } => {
                tracing::debug!(project_id, usage, "Message stored");
                counter!(PROCESSED_COUNT, PROJECT_LABEL => project_id.to_owned()).increment(1);
                histogram!(PROCESSED_PERF, PROJECT_LABEL => project_id.to_owned())
                    .record(message.perf as f64);
                histogram!(PROCESSED_SIZE, PROJECT_LABEL => project_id.to_owned())
                    .record(message.payload.len() as f64);
                if let Some(country) = &message.country {
                    counter!(
                        PROCESSED_COUNTRY,
                        PROJECT_LABEL => project_id.to_owned(),
                        "country" => country.clone()
                    )
                    .increment(1);
                }
                Outcome::Accepted { usage }
            }
            CommitOutcome::OverLimit { usage } => {
                let limit = commit.daily_limit.unwrap_or(0);
                let stats = OverageStats {
                    project_id: project_id.to_owned(),
                    usage,
                    over_usage: usage.saturating_sub(limit),
                    current_time: commit.now,
                    remaining_time: commit.remaining_time(),
                };
                tracing::warn!(
                    project_id,
                    usage,
                    daily_limit = limit,
                    remaining_time = stats.remaining_time,
                    "Daily limit exceeded"
                );
                counter!(OVER_USAGE_COUNT, PROJECT_LABEL => project_id.to_owned()).increment(1);
                gauge!(OVER_USAGE_USAGE, PROJECT_LABEL => project_id.to_owned()).set(usage as f64);
                gauge!(OVER_USAGE_REMAINING, PROJECT_LABEL => project_id.to_owned())
                    .set(stats.remaining_time as f64);
                Outcome::OverLimit(stats)
            }
        }
    }

    /// Reports an infrastructure failure and converts it into a drop.
    pub fn internal_error(&self, project_id: &str, error: AdmissionError) -> Outcome {
        tracing::error!(project_id, error = %error, "Message dropped on internal error");
        counter!(INTERNAL_ERROR, PROJECT_LABEL => project_id.to_owned()).increment(1);
        self.diagnostics
            .report(&error, &[("project_id", project_id.to_owned())]);
        Outcome::InternalError
    }

    fn reject_payload(
        &self,
        project_id: &str,
        error: AdmissionError,
        payload: &str,
        reason: &'static str,
    ) {
        counter!(INVALID_PAYLOAD, PROJECT_LABEL => project_id.to_owned(), "reason" => reason)
            .increment(1);
        let prefix: String = payload.chars().take(REPORTED_PAYLOAD_PREFIX).collect();
        self.diagnostics.report(
            &error,
            &[
                ("project_id", project_id.to_owned()),
                ("payload", prefix),
                ("payload_len", payload.len().to_string()),
            ],
        );
    }
}
