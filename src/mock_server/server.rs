//! Mock GData server.
//!
//! Provides an axum-based HTTP server that simulates a GData service.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::fixtures::{DefaultScenario, Fixtures};
use super::handlers;
use super::state::MockState;

/// Largest request body the server accepts.
const MAX_BODY: usize = 64 * 1024 * 1024;

/// A mock GData server for testing.
///
/// The server runs in the background and keeps its collections in memory,
/// so a test can drive a whole workflow against it.
pub struct MockServer {
    /// The URL where the server is listening.
    url: String,
    /// Handle to the server task.
    handle: JoinHandle<()>,
    /// Shared state that can be modified during tests.
    state: Arc<RwLock<MockState>>,
}

impl MockServer {
    /// Start a new mock server with default fixtures.
    ///
    /// The server listens on a random available port and returns immediately.
    /// Use `url()` to get the server's base URL.
    pub async fn start() -> Self {
        Self::with_state(Self::default_state()).await
    }

    /// Start a mock server with empty state.
    pub async fn start_empty() -> Self {
        Self::with_state(MockState::new()).await
    }

    /// Start a mock server with custom state.
    pub async fn with_state(mut state: MockState) -> Self {
        // Bind to a random available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let addr = listener.local_addr().expect("Failed to get local address");
        let url = format!("http://{addr}");

        state.base_url = url.clone();
        let shared_state = state.shared();
        let app = Self::create_router(shared_state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Server error");
        });

        Self {
            url,
            handle,
            state: shared_state,
        }
    }

    /// Get the base URL of the mock server.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL of a path on this server.
    pub fn uri(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    /// Get access to the server's shared state.
    ///
    /// This allows modifying the mock data during a test.
    pub fn state(&self) -> Arc<RwLock<MockState>> {
        self.state.clone()
    }

    /// Blob response bodies currently being streamed.
    pub async fn open_streams(&self) -> usize {
        self.state.read().await.open_streams.load(Ordering::SeqCst)
    }

    /// Shutdown the server.
    ///
    /// This aborts the server task. It's safe to call multiple times.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }

    /// Create the default state with common test fixtures.
    fn default_state() -> MockState {
        Self::state_from_scenario(Fixtures::default_scenario())
    }

    /// Create state from a scenario.
    fn state_from_scenario(scenario: DefaultScenario) -> MockState {
        let mut state = MockState::new();
        for entry in scenario.entries {
            state.insert_entry(entry);
        }
        for task in scenario.tasks {
            state.insert_task(task);
        }
        state
    }

    /// Create the axum router with all routes.
    fn create_router(state: Arc<RwLock<MockState>>) -> Router {
        Router::new()
            // Atom collection
            .route(
                "/feeds/entries",
                get(handlers::list_entries).post(handlers::insert_entry),
            )
            .route("/feeds/entries/batch", post(handlers::run_batch))
            .route(
                "/feeds/entries/:key",
                get(handlers::get_entry)
                    .put(handlers::update_entry)
                    .delete(handlers::delete_entry),
            )
            // JSON collection
            .route("/tasks", get(handlers::list_tasks).post(handlers::insert_task))
            .route(
                "/tasks/:id",
                get(handlers::get_task)
                    .put(handlers::update_task)
                    .delete(handlers::delete_task),
            )
            // Media
            .route("/upload/entries", post(handlers::start_upload))
            .route("/upload/sessions/:id", put(handlers::upload_chunk))
            .route("/media/:key", get(handlers::get_media))
            .route("/blobs/large", get(handlers::get_blob))
            // OAuth
            .route("/oauth2/token", post(handlers::issue_token))
            // Health check
            .route("/health", get(health_check))
            .layer(DefaultBodyLimit::max(MAX_BODY))
            .with_state(state)
    }
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "ok"
}
