//! HTTPS endpoint that holds one uploaded SSH public key
//!
//! `POST /transfer` stores the request body if it looks like an OpenSSH public key,
//! `GET /transfer` hands the stored key back. Only the most recent upload is kept.

use crate::error::{KeyswapError, Result};
use crate::process;
use crate::transfer::{fingerprint, PAIRING_KEY_HEADER, TRANSFER_PATH};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Prefix every OpenSSH public key line starts with
const SSH_KEY_PREFIX: &str = "ssh-";

/// How long in-flight requests get once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Single-slot storage for the uploaded key
pub struct KeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored key
    pub async fn store(&self, key: &str) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, key).await
    }

    /// The stored key, or None if nothing was uploaded yet
    pub async fn load(&self) -> io::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn upload_handler(State(store): State<Arc<KeyStore>>, body: Bytes) -> Response {
    let key = match std::str::from_utf8(&body) {
        Ok(text) if text.starts_with(SSH_KEY_PREFIX) => text,
        _ => {
            warn!("Rejected upload of {} bytes: not an SSH public key", body.len());
            return (StatusCode::BAD_REQUEST, "Invalid SSH Key").into_response();
        }
    };

    match store.store(key).await {
        Ok(()) => {
            info!("Stored uploaded key (sha256 {})", fingerprint(key.as_bytes()));
            (StatusCode::CREATED, "Storage success").into_response()
        }
        Err(e) => {
            error!("Failed to write {:?}: {}", store.path(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage failed").into_response()
        }
    }
}

async fn retrieve_handler(State(store): State<Arc<KeyStore>>, headers: HeaderMap) -> Response {
    match headers.get(PAIRING_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(pairing_key) => debug!("Retrieval with pairing key {:?}", pairing_key),
        None => debug!("Retrieval without pairing key"),
    }

    match store.load().await {
        Ok(Some(key)) => {
            info!("Serving stored key (sha256 {})", fingerprint(&key));
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], key).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "No data stored").into_response(),
        Err(e) => {
            error!("Failed to read {:?}: {}", store.path(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable").into_response()
        }
    }
}

/// Build the axum router for the transfer endpoint
pub fn create_router(store: Arc<KeyStore>) -> Router {
    Router::new()
        .route(TRANSFER_PATH, get(retrieve_handler).post(upload_handler))
        .with_state(store)
}

/// TLS-terminating transfer endpoint
pub struct Endpoint {
    router: Router,
    tls: RustlsConfig,
    handle: Handle,
}

impl Endpoint {
    /// Load the certificate pair and prepare the router
    pub async fn new(cert_path: &Path, key_path: &Path, store: Arc<KeyStore>) -> Result<Self> {
        process::install_crypto_provider();

        for path in [cert_path, key_path] {
            if !path.is_file() {
                return Err(KeyswapError::Config(format!(
                    "{:?} not found. Run `keyswap certs` first.",
                    path
                )));
            }
        }

        let tls = RustlsConfig::from_pem_file(cert_path, key_path).await?;

        Ok(Self {
            router: create_router(store),
            tls,
            handle: Handle::new(),
        })
    }

    /// Handle for shutting the server down or learning its bound address
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serve until the handle is told to shut down
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        // Port 0 only resolves once the listener is bound
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Some(bound) = handle.listening().await {
                info!("Endpoint listening on https://{}{}", bound, TRANSFER_PATH);
            }
        });
        debug!("Binding {}", addr);

        axum_server::bind_rustls(addr, self.tls)
            .handle(self.handle)
            .serve(self.router.into_make_service())
            .await?;

        info!("Endpoint stopped");
        Ok(())
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run_until_signal(self, addr: SocketAddr) -> Result<()> {
        let handle = self.handle();
        tokio::spawn(async move {
            match process::shutdown_signal().await {
                Ok(()) => info!("Shutdown requested, draining connections"),
                Err(e) => error!("Signal handler failed: {}", e),
            }
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        self.run(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertificateProvisioner;
    use crate::config::CertificateConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl alice@example\n";

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn upload(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(TRANSFER_PATH)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn retrieve() -> Request<Body> {
        Request::builder()
            .uri(TRANSFER_PATH)
            .header(PAIRING_KEY_HEADER, "1234")
            .body(Body::empty())
            .unwrap()
    }

    fn test_router() -> (tempfile::TempDir, Arc<KeyStore>, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::new(dir.path().join("store").join("uploaded_key.pub")));
        let router = create_router(store.clone());
        (dir, store, router)
    }

    #[tokio::test]
    async fn test_retrieve_before_upload() {
        let (_dir, _store, router) = test_router();

        let (status, _, body) = send(&router, retrieve()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "No data stored");
    }

    #[tokio::test]
    async fn test_upload_then_retrieve() {
        let (_dir, store, router) = test_router();

        let (status, _, body) = send(&router, upload(KEY)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "Storage success");
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), KEY);

        let (status, headers, body) = send(&router, retrieve()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert_eq!(body, KEY);
    }

    #[tokio::test]
    async fn test_rejects_non_ssh_payload() {
        let (_dir, store, router) = test_router();

        let (status, _, body) = send(&router, upload("-----BEGIN CERTIFICATE-----")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid SSH Key");
        assert!(!store.path().exists());

        let invalid_utf8 = Request::builder()
            .method("POST")
            .uri(TRANSFER_PATH)
            .body(Body::from(vec![b's', b's', b'h', b'-', 0xff, 0xfe]))
            .unwrap();
        let (status, _, _) = send(&router, invalid_utf8).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_latest_upload_wins() {
        let (_dir, _store, router) = test_router();

        send(&router, upload(KEY)).await;
        send(&router, upload("ssh-rsa AAAAB3NzaC1yc2E bob@example")).await;

        let (_, _, body) = send(&router, retrieve()).await;
        assert_eq!(body, "ssh-rsa AAAAB3NzaC1yc2E bob@example");
    }

    #[tokio::test]
    async fn test_unsupported_routes() {
        let (_dir, _store, router) = test_router();

        let put = Request::builder()
            .method("PUT")
            .uri(TRANSFER_PATH)
            .body(Body::from(KEY))
            .unwrap();
        let (status, _, _) = send(&router, put).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let elsewhere = Request::builder().uri("/upload").body(Body::empty()).unwrap();
        let (status, _, _) = send(&router, elsewhere).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_bound_address() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = CertificateProvisioner::new(
            CertificateConfig {
                key_bits: 2048,
                ..CertificateConfig::default()
            },
            dir.path().join("certs"),
        );
        provisioner.provision(false).unwrap();

        let log_path = dir.path().join("endpoint.log");
        let subscriber = tracing_subscriber::fmt()
            .with_writer(Arc::new(std::fs::File::create(&log_path).unwrap()))
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(KeyStore::new(dir.path().join("uploaded_key.pub")));
        let endpoint = Endpoint::new(&provisioner.cert_path(), &provisioner.key_path(), store)
            .await
            .unwrap();
        let handle = endpoint.handle();
        let server = tokio::spawn(endpoint.run("127.0.0.1:0".parse().unwrap()));

        let addr = handle.listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        server.await.unwrap().unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains(&format!("https://{}/transfer", addr)), "{}", log);
        assert!(!log.contains("127.0.0.1:0/"), "{}", log);
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::new(dir.path().join("uploaded_key.pub")));

        let result = Endpoint::new(
            &dir.path().join("server.crt"),
            &dir.path().join("server.key"),
            store,
        )
        .await;
        assert!(matches!(result, Err(KeyswapError::Config(_))));
    }
}
