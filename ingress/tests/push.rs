use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use ingress::message::Channel;
use ingress::pipeline::AdmissionPipeline;
use ingress::rate_limit::FixedWindowLimiter;
use ingress::service::IngressService;
use ingress::store::MemoryStore;
use ingress::testutils::RecordingDiagnostics;
use shared::http::serve_listener;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    client: Client<HttpConnector, Full<Bytes>>,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(max_requests: u64) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.set("foo.config", r#"{"origins":["https://foo.com"],"dailyLimit":3}"#);
        store.set("bar.config", r#"{"origins":["https://bar.com"]}"#);

        let pipeline = AdmissionPipeline::new(store.clone(), Arc::new(RecordingDiagnostics::new()));
        let limiter = Arc::new(FixedWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            max_requests,
            Duration::from_secs(60),
        ));
        let service = IngressService::new(pipeline, limiter, 64 * 1024, None);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            serve_listener(listener, service, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        let client = Client::builder(TokioExecutor::new()).build_http();
        TestServer {
            addr,
            store,
            client,
            stop,
            handle,
        }
    }

    async fn send(&self, method: Method, path: &str, origin: &str, body: &str) -> StatusCode {
        let req = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header("origin", origin)
            .body(Full::new(Bytes::from(body.to_owned())))
            .unwrap();
        let response = self.client.request(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
        status
    }

    async fn shutdown(self) {
        self.stop.send(()).unwrap();
        drop(self.client);
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_push_until_over_limit() {
    let server = TestServer::start(100).await;
    let mut events = server.store.subscribe();

    for _ in 0..5 {
        let status = server
            .send(Method::POST, "/event/foo?perf=7", "https://foo.com", "v1.naclbox.abc")
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    assert_eq!(server.store.list_len("foo.data"), 3);
    assert_eq!(server.store.counter("foo.count"), Some(5));

    let mut new_data = 0;
    let mut over_limit = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.channel == Channel::NewDataAvailable.as_str() {
            assert_eq!(event.message, "foo.data");
            new_data += 1;
        } else {
            assert_eq!(event.channel, Channel::OverLimit.as_str());
            over_limit.push(serde_json::from_str::<serde_json::Value>(&event.message).unwrap());
        }
    }
    assert_eq!(new_data, 3);
    assert_eq!(over_limit.len(), 2);
    assert_eq!(over_limit[0]["projectID"], "foo");
    assert_eq!(over_limit[0]["usage"], 4);
    assert_eq!(over_limit[0]["overUsage"], 1);
    assert_eq!(over_limit[1]["usage"], 5);
    assert_eq!(over_limit[1]["overUsage"], 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_messages_are_not_stored() {
    let server = TestServer::start(100).await;

    let cases = [
        (Method::POST, "/event/bar", "https://evil.com", "v1.naclbox.abc"),
        (Method::POST, "/event/bar", "http://localhost:8080", "v1.naclbox.abc"),
        (Method::POST, "/event/bar", "https://bar.com", "garbage"),
        (Method::POST, "/event/bar", "https://bar.com", ""),
        (Method::POST, "/event/nope", "https://bar.com", "v1.naclbox.abc"),
    ];
    for (method, path, origin, body) in cases {
        assert_eq!(
            server.send(method, path, origin, body).await,
            StatusCode::NO_CONTENT
        );
    }
    assert_eq!(server.store.list_len("bar.data"), 0);
    assert_eq!(server.store.counter("bar.count"), None);

    let status = server
        .send(Method::GET, "/event/bar?payload=v1.naclbox.q", "https://bar.com", "")
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(server.store.list_len("bar.data"), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_is_per_project() {
    let server = TestServer::start(2).await;

    for expected in [
        StatusCode::NO_CONTENT,
        StatusCode::NO_CONTENT,
        StatusCode::TOO_MANY_REQUESTS,
    ] {
        let status = server
            .send(Method::POST, "/event/bar", "https://bar.com", "v1.naclbox.abc")
            .await;
        assert_eq!(status, expected);
    }
    assert_eq!(server.store.list_len("bar.data"), 2);

    let status = server
        .send(Method::POST, "/event/foo", "https://foo.com", "v1.naclbox.abc")
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(server.store.list_len("foo.data"), 1);

    server.shutdown().await;
}
