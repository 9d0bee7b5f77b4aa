use crate::errors::{AdmissionError, IngressError};
use crate::metrics_defs::{CATCH_ALL, INVALID_PAYLOAD, RATE_LIMITED, REQUEST_DURATION};
use crate::pipeline::{AdmissionPipeline, InboundMessage, Outcome};
use crate::rate_limit::{Decision, RateLimiter};
use chrono::Utc;
use http::header::{HeaderName, HeaderValue, LOCATION, RETRY_AFTER};
use http::{HeaderMap, Method};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{PeerAddr, make_empty_response};
use shared::metrics_defs::PROJECT_LABEL;
use shared::{counter, histogram};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const EVENT_PREFIX: &str = "/event/";

/// Paths probed by vulnerability scanners. Answered without logging.
const SPAM_PATHS: &[&str] = &[
    "/wp-login.php",
    "/data.zip",
    "/bak.rar",
    "/web.rar",
    "/www.rar",
    "/db.zip",
    "/backup.7z",
];

static CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");
static CF_IPCOUNTRY: HeaderName = HeaderName::from_static("cf-ipcountry");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

type ServiceResponse = Response<BoxBody<Bytes, IngressError>>;

/// The public push endpoint.
#[derive(Clone)]
pub struct IngressService {
    pipeline: AdmissionPipeline,
    limiter: Arc<dyn RateLimiter>,
    max_payload_bytes: usize,
    homepage: Option<Url>,
}

impl IngressService {
    pub fn new(
        pipeline: AdmissionPipeline,
        limiter: Arc<dyn RateLimiter>,
        max_payload_bytes: usize,
        homepage: Option<Url>,
    ) -> Self {
        IngressService {
            pipeline,
            limiter,
            max_payload_bytes,
            homepage,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> ServiceResponse
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        if SPAM_PATHS.contains(&path.as_str()) {
            return make_empty_response(StatusCode::NO_CONTENT);
        }

        let project_id = path
            .strip_prefix(EVENT_PREFIX)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(str::to_owned);

        match (method, project_id) {
            (Method::POST | Method::GET, Some(project_id)) => {
                self.handle_event(project_id, req).await
            }
            (Method::GET, None) if path == "/" => match &self.homepage {
                Some(homepage) => redirect(homepage),
                None => make_empty_response(StatusCode::NO_CONTENT),
            },
            (Method::GET, None) => {
                tracing::debug!(path = %path, "Unknown path");
                counter!(CATCH_ALL).increment(1);
                make_empty_response(StatusCode::NO_CONTENT)
            }
            _ => make_empty_response(StatusCode::NOT_FOUND),
        }
    }

    async fn handle_event<B>(&self, project_id: String, req: Request<B>) -> ServiceResponse
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let client = client_fingerprint(req.headers(), req.extensions().get::<PeerAddr>());

        let checked_at = Utc::now().timestamp_millis();
        if let Some(retry_after) = self.rate_limited(&project_id, &client, checked_at).await {
            counter!(RATE_LIMITED, PROJECT_LABEL => project_id.clone()).increment(1);
            tracing::warn!(project_id = %project_id, client = %client, "Request rate limited");
            let mut response = make_empty_response(StatusCode::TOO_MANY_REQUESTS);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after)));
            return response;
        }

        let outcome = match self.read_inbound(project_id.clone(), req).await {
            Some(inbound) => self.admit(inbound).await,
            None => Outcome::InvalidPayload,
        };

        histogram!(
            REQUEST_DURATION,
            PROJECT_LABEL => project_id,
            "outcome" => outcome.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        make_empty_response(StatusCode::NO_CONTENT)
    }

    /// Returns how long the client has to wait, or `None` if the request may
    /// proceed. A limiter failure lets the request through.
    async fn rate_limited(&self, project_id: &str, client: &str, now: i64) -> Option<Duration> {
        match self.limiter.check(project_id, client, now).await {
            Ok(Decision::Allowed { .. }) => None,
            Ok(Decision::Denied { retry_after }) => Some(retry_after),
            Err(e) => {
                tracing::error!(project_id, error = %e, "Rate limiter unavailable");
                self.pipeline
                    .diagnostics()
                    .report(&e, &[("project_id", project_id.to_owned())]);
                None
            }
        }
    }

    /// Extracts the message fields. Returns `None` when the body cannot be
    /// used as a payload at all.
    ///
    /// The admission time is taken once the body has been fully received.
    async fn read_inbound<B>(&self, project_id: String, req: Request<B>) -> Option<InboundMessage>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let mut query_payload = None;
        let mut perf = None;
        if let Some(query) = parts.uri.query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "payload" => query_payload = Some(value.into_owned()),
                    "perf" => perf = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        let payload = match parts.method {
            Method::POST => self.read_body(&project_id, body).await?,
            _ => query_payload,
        };

        Some(InboundMessage {
            project_id,
            payload: payload.filter(|p| !p.is_empty()),
            origin: header_str(&parts.headers, &http::header::ORIGIN),
            country: header_str(&parts.headers, &CF_IPCOUNTRY),
            perf,
            now: Utc::now().timestamp_millis(),
        })
    }

    async fn read_body<B>(&self, project_id: &str, body: B) -> Option<Option<String>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, self.max_payload_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::warn!(project_id, limit = self.max_payload_bytes, "Payload too large");
                counter!(INVALID_PAYLOAD, PROJECT_LABEL => project_id.to_owned(), "reason" => "too_large")
                    .increment(1);
                return None;
            }
            Err(e) => {
                tracing::debug!(project_id, error = %e, "Could not read request body");
                return Some(None);
            }
        };

        match String::from_utf8(bytes.to_vec()) {
            Ok(payload) => Some(Some(payload)),
            Err(_) => {
                tracing::warn!(project_id, "Payload is not valid UTF-8");
                counter!(INVALID_PAYLOAD, PROJECT_LABEL => project_id.to_owned(), "reason" => "encoding")
                    .increment(1);
                None
            }
        }
    }

    /// Runs admission on its own task so a dropped connection cannot abort a
    /// commit halfway.
    async fn admit(&self, inbound: InboundMessage) -> Outcome {
        let project_id = inbound.project_id.clone();
        let pipeline = self.pipeline.clone();
        match tokio::spawn(async move { pipeline.admit(inbound).await }).await {
            Ok(outcome) => outcome,
            Err(e) => self
                .pipeline
                .internal_error(&project_id, AdmissionError::Task(e.to_string())),
        }
    }
}

impl Service<Request<Incoming>> for IngressService {
    type Response = ServiceResponse;
    type Error = IngressError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

/// Identifies the requesting client for rate limiting: the address reported
/// by the CDN, then the first forwarded hop, then the TCP peer.
pub fn client_fingerprint(headers: &HeaderMap, peer: Option<&PeerAddr>) -> String {
    if let Some(ip) = header_str(headers, &CF_CONNECTING_IP) {
        return ip;
    }
    let forwarded = header_str(headers, &X_FORWARDED_FOR).and_then(|value| {
        value
            .split(',')
            .map(str::trim)
            .find(|hop| !hop.is_empty())
            .map(str::to_owned)
    });
    if let Some(hop) = forwarded {
        return hop;
    }
    match peer {
        Some(PeerAddr(addr)) => addr.ip().to_string(),
        None => "unknown".to_owned(),
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn ceil_secs(duration: Duration) -> u64 {
    (duration.as_secs() + u64::from(duration.subsec_nanos() > 0)).max(1)
}

fn redirect(location: &Url) -> ServiceResponse {
    let mut response = make_empty_response(StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = HeaderValue::from_str(location.as_str()) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}
