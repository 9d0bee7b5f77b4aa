use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves `/health` (process is up) and `/ready` (dependencies answer).
///
/// The readiness probe is evaluated lazily, only for `/ready` requests.
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<fn() -> E>,
}

impl<F, Fut, E> AdminService<F, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

impl<F, Fut, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let readiness = match req.uri().path() {
            "/ready" => Some((self.is_ready)()),
            _ => None,
        };
        let path = req.uri().path().to_owned();

        Box::pin(async move {
            let ok_body = || Full::new(Bytes::from("ok\n")).map_err(|e| match e {}).boxed();

            let res = match (path.as_str(), readiness) {
                ("/health", _) => Response::new(ok_body()),
                ("/ready", Some(probe)) => match probe.await {
                    true => Response::new(ok_body()),
                    false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                },
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
