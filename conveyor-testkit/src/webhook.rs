use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// One request captured by [`WebhookReceiver`].
#[derive(Clone, Debug)]
pub struct ReceivedWebhook {
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

#[derive(Default)]
struct ReceiverState {
    script: Mutex<VecDeque<u16>>,
    fallback: Mutex<u16>,
    received: Mutex<Vec<ReceivedWebhook>>,
}

/// Local HTTP endpoint on an ephemeral port that records webhook deliveries
/// and answers with scripted status codes.
pub struct WebhookReceiver {
    addr: SocketAddr,
    state: Arc<ReceiverState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl WebhookReceiver {
    /// Bind `127.0.0.1:0` and answer every request with 200.
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(ReceiverState::default());
        *state.fallback.lock() = 200;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(Arc::clone(&state));

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            state,
            shutdown: Some(tx),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    /// Status for requests not covered by the script.
    pub fn respond_with(&self, status: u16) {
        *self.state.fallback.lock() = status;
    }

    /// Queue a status for the next unscripted request.
    pub fn then_respond(&self, status: u16) {
        self.state.script.lock().push_back(status);
    }

    pub fn received(&self) -> Vec<ReceivedWebhook> {
        self.state.received.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.received.lock().len()
    }
}

impl Drop for WebhookReceiver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    state.received.lock().push(ReceivedWebhook { headers, body });

    let status = state
        .script
        .lock()
        .pop_front()
        .unwrap_or_else(|| *state.fallback.lock());
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
