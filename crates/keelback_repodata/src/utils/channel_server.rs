//! A minimal in-process conda channel for tests: serves the files of a
//! directory over HTTP with ETag-based revalidation, and counts requests so
//! tests can assert on traffic.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use keelback_digest::digest_bytes;
use url::Url;

struct ServerState {
    root: PathBuf,
    requests: AtomicUsize,
}

pub(crate) struct ChannelServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    _handle: tokio::task::JoinHandle<()>,
}

impl ChannelServer {
    /// Starts serving the given directory on an ephemeral localhost port.
    pub(crate) async fn serve(root: impl Into<PathBuf>) -> Self {
        let state = Arc::new(ServerState {
            root: root.into(),
            requests: AtomicUsize::new(0),
        });

        let app = Router::new()
            .fallback(serve_file)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("an ephemeral port is always available");
        let address = listener.local_addr().expect("listener has an address");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server failed");
        });

        ChannelServer {
            address,
            state,
            _handle: handle,
        }
    }

    /// The base url of the served directory.
    pub(crate) fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.address)).expect("socket addresses form valid urls")
    }

    /// The number of requests handled so far.
    pub(crate) fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let relative = uri.path().trim_start_matches('/');
    let path = state.root.join(relative);
    let Ok(contents) = std::fs::read(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let etag = format!("\"{:x}\"", digest_bytes::<md5::Md5>(&contents));
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|candidate| candidate == etag)
    {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)], ()).into_response();
    }

    let body = if method == Method::HEAD {
        Vec::new()
    } else {
        contents
    };
    ([(header::ETAG, etag)], body).into_response()
}
