//! GData client library.
//!
//! A Rust runtime for the Google Data family of HTTP APIs: entities that
//! travel as Atom entries or JSON objects, feeds with three pagination
//! styles, conditional requests with ETags, OAuth 2.0 bearer tokens that
//! are refreshed once per logical request, streaming uploads (plain,
//! multipart and resumable), streaming downloads and batch operations.
//!
//! Individual services (documents, contacts, tasks, ...) define their own
//! entity types by implementing [`Parsable`]; everything else in this crate
//! works with any such type.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gdata::auth::{domains, OAuth2Authorizer, OAuth2Config};
//! use gdata::{Entry, List, PaginationType, Query, Service, ServiceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> gdata::Result<()> {
//!     let authorizer = OAuth2Authorizer::new(OAuth2Config::new("client-id", "client-secret"), vec![domains::documents()])
//!         .with_tokens(None, Some("refresh-token"));
//!     let service = Service::new(Arc::new(authorizer), ServiceConfig::new("my-app/1.0"))?;
//!
//!     let mut query = Query::new(PaginationType::Indexed);
//!     query.set_max_results(100);
//!     let documents = Entry::list_all(
//!         &service,
//!         "https://docs.google.com/feeds/default/private/full",
//!         &mut query,
//!         Some(domains::documents()),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//!     println!("Found {} documents", documents.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`Service`] owns the HTTP client and the [`auth::Authorizer`], and runs
//!   every request through one pipeline (headers, ETags, refresh-and-retry,
//!   error classification).
//! - [`Get`], [`List`], [`Insert`], [`Update`] and [`Delete`] are
//!   implemented for every [`Parsable`] entity.
//! - [`upload::UploadStream`] and [`download::DownloadStream`] implement the
//!   `tokio::io` traits; [`batch::BatchOperation`] groups sub-operations
//!   into one request.
//! - [`blocking`] offers the same operations without async.
//!
//! Every operation takes a [`CancellationToken`](tokio_util::sync::CancellationToken);
//! the library imposes no timeouts of its own.

pub mod auth;
pub mod batch;
pub mod blocking;
mod config;
pub mod download;
mod error;
mod models;
mod pagination;
pub mod parsable;
mod query;
mod request;
mod service;
mod traits;
pub mod upload;

#[cfg(feature = "test-server")]
pub mod mock_server;

// Re-export core types
pub use config::{ServiceConfig, DEFAULT_CHUNK_SIZE, DEFAULT_UPLOAD_BUFFER_CHUNKS};
pub use error::{GDataError, ParseError, ParseErrorKind, Result};
pub use request::{Conditional, RequestBody, ServiceRequest, GDATA_VERSION};
pub use service::Service;

// Re-export query types
pub use pagination::PaginationType;
pub use query::{Query, QueryOps, QueryParams};

// Re-export traits
pub use parsable::Parsable;
pub use traits::{Delete, Get, Insert, List, Update, MAX_PAGES};

// Re-export models
pub use models::{rel, Author, Category, Content, Entry, Feed, Link};
