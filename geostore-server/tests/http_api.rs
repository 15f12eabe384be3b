//! End-to-end HTTP tests against a server on an ephemeral port

use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use geostore_engine::{Backend, Storage, StorageConfig};
use geostore_server::GeoStoreServer;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(storage: Storage) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            GeoStoreServer::new(storage)
                .serve_listener(listener, async move {
                    let _ = rx.await;
                })
                .await
        });
        TestServer {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let body = body.map(|v| v.to_string()).unwrap_or_default();
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost")
            .body(Full::new(Bytes::from(body)))
            .unwrap();

        let response = sender.send_request(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).unwrap();
        }
        self.handle.await.unwrap().unwrap();
    }
}

fn point(x: f64, y: f64, props: Value) -> Value {
    json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [x, y]},
        "properties": props
    })
}

#[tokio::test]
async fn health() {
    let server = TestServer::start(Storage::memory()).await;
    let (status, body) = server.request(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    server.stop().await;
}

#[tokio::test]
async fn optimistic_concurrency_over_http() {
    let server = TestServer::start(Storage::memory()).await;

    let (status, info) = server.request(Method::PUT, "/v1/b1?srid=4326", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(info["srid"], 4326);

    let (status, _) = server.request(Method::PUT, "/v1/b1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, first) = server
        .request(Method::PUT, "/v1/b1/alice", Some(point(1.0, 1.0, json!({"x": 1}))))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["key"], "b1.alice");
    let r1 = first["revision"].as_str().unwrap().to_string();

    let (status, second) = server
        .request(
            Method::PUT,
            &format!("/v1/b1/alice?parent={}", r1),
            Some(point(2.0, 2.0, json!({"x": 2}))),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(second["revision"], first["revision"]);

    let (status, err) = server
        .request(
            Method::PUT,
            &format!("/v1/b1/alice?parent={}", r1),
            Some(point(3.0, 3.0, json!({"x": 3}))),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(err["error"].as_str().unwrap().contains("b1.alice"));

    let (status, old) = server
        .request(Method::GET, &format!("/v1/b1/alice?revision={}", r1), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(old["feature"]["properties"]["x"], 1);
    assert_eq!(old["commit"]["revision"], r1.as_str());

    let (_, live) = server.request(Method::GET, "/v1/b1/alice", None).await;
    assert_eq!(live["feature"]["properties"]["x"], 2);
    assert_eq!(live["feature"]["geometry"]["coordinates"], json!([2.0, 2.0]));

    let (status, history) = server.request(Method::GET, "/v1/b1/alice/history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["revisions"].as_array().unwrap().len(), 2);

    server.stop().await;
}

#[tokio::test]
async fn delete_and_not_found() {
    let server = TestServer::start(Storage::memory()).await;

    let (status, _) = server.request(Method::GET, "/v1/nope/alice", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.request(Method::PUT, "/v1/b1", None).await;
    let (_, put) = server
        .request(Method::PUT, "/v1/b1/alice", Some(point(1.0, 1.0, json!({}))))
        .await;
    let r1 = put["revision"].as_str().unwrap().to_string();

    let (status, deleted) = server.request(Method::DELETE, "/v1/b1/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["revision"], Value::Null);

    let (status, _) = server.request(Method::GET, "/v1/b1/alice", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = server
        .request(Method::GET, &format!("/v1/b1/alice?revision={}", r1), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server.request(Method::DELETE, "/v1/b1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = server.request(Method::DELETE, "/v1/b1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn random_names_and_listing() {
    let server = TestServer::start(Storage::memory()).await;
    server.request(Method::PUT, "/v1/pois", None).await;

    let (status, created) = server
        .request(Method::POST, "/v1/pois", Some(point(13.4, 52.5, json!({"kind": "cafe"}))))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["key"].as_str().unwrap();
    let name = key.strip_prefix("pois.").unwrap().to_string();

    let (status, info) = server.request(Method::GET, "/v1/pois", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["names"], json!([name]));
    assert_eq!(info["bucket"]["name"], "pois");

    server.stop().await;
}

#[tokio::test]
async fn bad_input_is_rejected() {
    let server = TestServer::start(Storage::memory()).await;
    server.request(Method::PUT, "/v1/b1", None).await;

    let bad_point = json!({"type": "Point"});
    let (status, _) = server.request(Method::PUT, "/v1/b1/alice", Some(bad_point)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.request(Method::PUT, "/v1/b1?srid=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.request(Method::GET, "/v1/1bad", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.request(Method::PATCH, "/v1/b1/alice", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    server.stop().await;
}

#[tokio::test]
async fn time_travel_read_with_encoded_offset() {
    let server = TestServer::start(Storage::memory()).await;
    server.request(Method::PUT, "/v1/b1", None).await;

    let (_, first) = server
        .request(Method::PUT, "/v1/b1/alice", Some(point(1.0, 1.0, json!({"x": 1}))))
        .await;
    let r1 = first["revision"].as_str().unwrap().to_string();
    server
        .request(
            Method::PUT,
            &format!("/v1/b1/alice?parent={}", r1),
            Some(point(2.0, 2.0, json!({"x": 2}))),
        )
        .await;

    let created_at = DateTime::parse_from_rfc3339(first["created_at"].as_str().unwrap()).unwrap();
    let offset = FixedOffset::east_opt(2 * 3600).unwrap();
    let at = created_at.with_timezone(&offset).to_rfc3339();
    assert!(at.contains('+'));
    let encoded: String = form_urlencoded::byte_serialize(at.as_bytes()).collect();

    let (status, body) = server
        .request(Method::GET, &format!("/v1/b1/alice?at={}", encoded), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commit"]["revision"], r1.as_str());
    assert_eq!(body["feature"]["properties"]["x"], 1);

    server.stop().await;
}

#[tokio::test]
async fn fjall_backend_survives_restart() {
    let temp = tempfile::tempdir().unwrap();
    let open = || Storage::open(Backend::Fjall, StorageConfig::new(temp.path())).unwrap();

    let server = TestServer::start(open()).await;
    let (status, _) = server.request(Method::PUT, "/v1/b1?srid=3857", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, put) = server
        .request(Method::PUT, "/v1/b1/alice", Some(point(1000.0, 2000.0, json!({"x": 1}))))
        .await;
    server.stop().await;
    // let lingering connection tasks drop their storage handles
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let server = TestServer::start(open()).await;
    let (status, got) = server.request(Method::GET, "/v1/b1/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(got["commit"]["revision"], put["revision"]);
    assert_eq!(got["feature"]["srid"], 3857);
    assert_eq!(got["feature"]["geometry"]["coordinates"], json!([1000.0, 2000.0]));

    let (status, _) = server.request(Method::PUT, "/v1/b1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    server.stop().await;
}
