use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::{Service, service_fn};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Address of the TCP peer, attached to every request as an extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

pub async fn run_http_service<S, E>(
    host: &str,
    port: u16,
    service: S,
    shutdown: impl Future<Output = ()>,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    serve_listener(listener, service, shutdown).await
}

/// Accept loop over an already bound listener. Stops accepting once `shutdown`
/// resolves and waits for in-flight connections to finish.
pub async fn serve_listener<S, E>(
    listener: TcpListener,
    service: S,
    shutdown: impl Future<Output = ()>,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let service_arc = Arc::new(service);
    let builder = Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => break,
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();
        let svc = service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(PeerAddr(peer_addr));
            svc.call(req)
        });

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        let conn = graceful.watch(builder.serve_connection(io, svc).into_owned());
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }

    tracing::info!("listener closed, draining open connections");
    graceful.shutdown().await;
    Ok(())
}

pub fn make_boxed_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Full::new(Bytes::from(message)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status_code;
    response
}

/// A response with no body, e.g. `204 No Content`.
pub fn make_empty_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|e: Infallible| match e {}).boxed());
    *response.status_mut() = status_code;
    response
}
