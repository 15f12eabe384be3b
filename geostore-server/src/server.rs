//! HTTP/1.1 server implementation

use bytes::Bytes;
use geostore_engine::Storage;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::handlers::handle_request;

pub type BoxBody = Full<Bytes>;

pub struct GeoStoreServer {
    storage: Storage,
}

impl GeoStoreServer {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Bind `addr` and serve until the process is interrupted.
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        })
        .await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close the storage.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        info!("geostore server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => break,
            };
            debug!("New connection from {}", remote_addr);

            let storage = self.storage.clone();
            tokio::spawn(async move {
                Self::handle_connection(stream, storage, remote_addr).await;
            });
        }

        info!("Shutting down");
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.close()).await??;
        Ok(())
    }

    async fn handle_connection(stream: TcpStream, storage: Storage, remote_addr: SocketAddr) {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let storage = storage.clone();
            async move { handle_request(req, storage).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            error!("Connection error from {}: {}", remote_addr, err);
        }
    }
}

/// JSON response with the given status
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        hyper::header::SERVER,
        hyper::header::HeaderValue::from_static(concat!("geostore/", env!("CARGO_PKG_VERSION"))),
    );
    response
}
