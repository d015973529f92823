//! Mock GData server for E2E testing.
//!
//! This module provides an in-memory server that behaves like a GData
//! service for integration and end-to-end testing. Unlike wiremock, which
//! mocks at the HTTP level per test, this server keeps state across
//! requests: ETags change on writes, OAuth tokens expire and are reissued,
//! resumable uploads accumulate chunks.
//!
//! Routes:
//!
//! - `/feeds/entries`: an Atom collection with `start-index` paging, a
//!   batch endpoint at `/feeds/entries/batch`
//! - `/tasks`: a JSON collection with `pageToken` paging
//! - `/upload/entries` and `/upload/sessions/{id}`: simple, multipart and
//!   resumable media uploads, with optional withheld chunk responses
//! - `/blobs/large`: a streamed blob that counts open response bodies
//! - `/oauth2/token`: the refresh-token grant
//!
//! # Example
//!
//! ```ignore
//! use gdata::mock_server::MockServer;
//! use gdata::{Entry, Get, Service, ServiceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::test]
//! async fn test_workflow() {
//!     let server = MockServer::start().await;
//!     let service = Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap();
//!
//!     // Server comes with default fixtures
//!     let entry = Entry::get(&service, &server.uri("/feeds/entries/1"), None, &CancellationToken::new())
//!         .await
//!         .unwrap();
//!     assert_eq!(entry.title.as_deref(), Some("Quarterly Report"));
//!
//!     server.shutdown().await;
//! }
//! ```

mod fixtures;
mod handlers;
mod server;
mod state;

pub use fixtures::{DefaultScenario, Fixtures};
pub use server::MockServer;
pub use state::{MockState, OAuthPolicy, UploadSession, DEFAULT_BLOB_SIZE, DEFAULT_TASK_PAGE_SIZE};
