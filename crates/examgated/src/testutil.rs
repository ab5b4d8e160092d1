//! Scriptable HTTP endpoint for exercising the reqwest clients.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

struct Shared {
    status: AtomicU16,
    body: Mutex<String>,
    requests: Mutex<Vec<Request>>,
}

pub struct FakeHttp {
    pub url: String,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl FakeHttp {
    /// Listen on an ephemeral port, answering every request with
    /// `status` and the JSON `body`.
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shared = Arc::new(Shared {
            status: AtomicU16::new(status),
            body: Mutex::new(body.to_string()),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(record)
            .with_state(Arc::clone(&shared));
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { url, shared, handle }
    }

    pub fn respond(&self, status: u16, body: &str) {
        self.shared.status.store(status, Ordering::SeqCst);
        *self.shared.body.lock().unwrap() = body.to_string();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeHttp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    shared.requests.lock().unwrap().push(Request {
        method: method.to_string(),
        path: uri.path().to_string(),
        content_type,
        body: body.to_vec(),
    });

    let status = StatusCode::from_u16(shared.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let reply = shared.body.lock().unwrap().clone();
    (status, [(header::CONTENT_TYPE, "application/json")], reply).into_response()
}
