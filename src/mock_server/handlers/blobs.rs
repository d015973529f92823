//! Large streamed download.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use futures::stream;

use super::{authorize, SharedState};

const BLOB_CHUNK: u64 = 64 * 1024;

/// Counts a live response body; decrements when the body is dropped,
/// which happens when the client disconnects.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn open(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// GET /blobs/large
pub async fn get_blob(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let (size, counter) = {
        let mut state = state.write().await;
        if let Err(response) = authorize(&mut state, &headers) {
            return response;
        }
        (state.blob_size, state.open_streams.clone())
    };

    let guard = StreamGuard::open(counter);
    let chunks = stream::unfold((size, guard), |(remaining, guard)| async move {
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(BLOB_CHUNK);
        let chunk = Bytes::from(vec![b'x'; len as usize]);
        Some((Ok::<_, std::io::Error>(chunk), (remaining - len, guard)))
    });

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        Body::from_stream(chunks),
    )
        .into_response();
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(size));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = StreamGuard::open(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
