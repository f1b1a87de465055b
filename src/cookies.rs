//! Paged search continuity across rewritten requests.
//!
//! A directory binds a paging cookie to the exact search that produced it. Because
//! every page of a search would otherwise be rewritten differently, the tracker
//! remembers the rewritten request sent for page 1 and replays it, with the
//! server's cookie reinjected verbatim, for every following page.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::ldap_protocol::SearchRequest;

#[derive(Debug, Clone)]
struct TrackedSearch {
    signature: String,
    request: SearchRequest,
}

/// What to send for a follow-up page.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPage {
    pub cookie: Vec<u8>,
    // None when the follow-up carries a different search
    pub request: Option<SearchRequest>,
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<i32, TrackedSearch>,
    // keyed by server cookie
    cookies: HashMap<Vec<u8>, TrackedSearch>,
}

/// Per-connection cookie map, shared by the two pumps of one session.
#[derive(Debug, Default)]
pub struct SearchCookieTracker {
    state: Mutex<TrackerState>,
}

impl SearchCookieTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `signature` identifies the search as the client wrote it.
    pub fn record_request(&self, message_id: i32, signature: String, request: SearchRequest) {
        self.state()
            .pending
            .insert(message_id, TrackedSearch { signature, request });
    }

    /// Handle the paged control of a SearchResultDone. A non-empty cookie makes the
    /// search resumable; an empty one ends it. Returns false for untracked IDs.
    pub fn on_response(&self, message_id: i32, cookie: &[u8]) -> bool {
        let mut state = self.state();
        let Some(search) = state.pending.remove(&message_id) else {
            return false;
        };
        if !cookie.is_empty() {
            state.cookies.insert(cookie.to_vec(), search);
        }
        true
    }

    /// Resolve the cookie of a follow-up page. The entry is consumed; the caller
    /// records the follow-up again with `record_request`.
    pub fn lookup(&self, cookie: &[u8], signature: &str) -> Option<TrackedPage> {
        let search = self.state().cookies.remove(cookie)?;
        let request = (search.signature == signature).then_some(search.request);
        Some(TrackedPage {
            cookie: cookie.to_vec(),
            request,
        })
    }

    pub fn forget(&self, message_id: i32) {
        self.state().pending.remove(&message_id);
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn cookie_len(&self) -> usize {
        self.state().cookies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::query_to_filter;
    use crate::ldap_protocol::SearchScope;

    fn search(filter: &str) -> SearchRequest {
        SearchRequest {
            base_object: "dc=example,dc=com".to_string(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: query_to_filter(filter).unwrap(),
            attributes: vec!["cn".to_string()],
        }
    }

    #[test]
    fn test_cookie_follows_server_response() {
        let tracker = SearchCookieTracker::new();
        let original = search("(cn=John)");
        let rewritten = search("(!(!(cn=John)))");
        tracker.record_request(1, original.signature(), rewritten.clone());
        assert_eq!(tracker.pending_len(), 1);

        assert!(tracker.on_response(1, b"C1"));
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.cookie_len(), 1);

        let page = tracker.lookup(b"C1", &original.signature()).unwrap();
        assert_eq!(page.cookie, b"C1");
        assert_eq!(page.request, Some(rewritten));
        assert_eq!(tracker.cookie_len(), 0);
    }

    #[test]
    fn test_different_search_keeps_cookie_only() {
        let tracker = SearchCookieTracker::new();
        tracker.record_request(1, search("(cn=John)").signature(), search("(cn=JOHN)"));
        tracker.on_response(1, b"C1");

        let page = tracker.lookup(b"C1", &search("(sn=Doe)").signature()).unwrap();
        assert_eq!(page.cookie, b"C1");
        assert!(page.request.is_none());
    }

    #[test]
    fn test_empty_cookie_ends_search() {
        let tracker = SearchCookieTracker::new();
        tracker.record_request(3, search("(cn=a)").signature(), search("(cn=a)"));
        assert!(tracker.on_response(3, b""));
        assert_eq!(tracker.cookie_len(), 0);
        assert!(tracker.lookup(b"", &search("(cn=a)").signature()).is_none());
    }

    #[test]
    fn test_untracked_response_and_unknown_cookie() {
        let tracker = SearchCookieTracker::new();
        assert!(!tracker.on_response(9, b"C9"));
        assert!(tracker.lookup(b"C9", "x").is_none());
    }

    #[test]
    fn test_forget_drops_pending() {
        let tracker = SearchCookieTracker::new();
        tracker.record_request(4, "sig".to_string(), search("(cn=a)"));
        tracker.forget(4);
        assert!(!tracker.on_response(4, b"C4"));
    }
}
