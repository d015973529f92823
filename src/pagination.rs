//! Pagination state for GData queries.

/// How a service pages through a feed. Fixed when the query is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaginationType {
    /// Numeric `start-index` plus `max-results`.
    #[default]
    Indexed,
    /// Follow the feed's `next`/`previous` link URIs.
    Uris,
    /// Opaque `pageToken` returned by the previous feed.
    Tokens,
}

/// Cursor carried from one feed to the next query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PageCursor {
    pub next_uri: Option<String>,
    pub previous_uri: Option<String>,
    pub next_page_token: Option<String>,
    pub use_next_page: bool,
    pub use_previous_page: bool,
}

impl PageCursor {
    /// Forget the cursor values that `pagination` uses.
    pub fn clear(&mut self, pagination: PaginationType) {
        match pagination {
            // Indexes can always be incremented.
            PaginationType::Indexed => {}
            PaginationType::Uris => {
                self.next_uri = None;
                self.previous_uri = None;
            }
            PaginationType::Tokens => self.next_page_token = None,
        }
        self.use_next_page = false;
        self.use_previous_page = false;
    }

    /// Whether the caller asked for a next page that the last feed did not
    /// advertise.
    pub fn is_finished(&self, pagination: PaginationType) -> bool {
        match pagination {
            PaginationType::Indexed => false,
            PaginationType::Uris => self.next_uri.is_none() && self.use_next_page,
            PaginationType::Tokens => self.next_page_token.is_none() && self.use_next_page,
        }
    }

    /// The URI to request instead of building one from parameters.
    pub fn pagination_uri(&self, pagination: PaginationType) -> Option<&str> {
        if pagination != PaginationType::Uris {
            return None;
        }
        if self.use_next_page {
            return self.next_uri.as_deref();
        }
        if self.use_previous_page {
            return self.previous_uri.as_deref();
        }
        None
    }

    /// The `pageToken` to send, if any.
    pub fn page_token(&self, pagination: PaginationType) -> Option<&str> {
        if pagination != PaginationType::Tokens || !self.use_next_page {
            return None;
        }
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}
