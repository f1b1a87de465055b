// Observability hook. The engine reports what it does; implementations decide
// how (or whether) to present it.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::error::{CodecError, ProxyError};
use crate::ldap_protocol::InterceptedOp;

pub trait ProxyObserver: Send + Sync {
    fn on_connection(&self, _conn_id: u64, _peer: SocketAddr) {}

    /// An intercepted request is about to be rewritten.
    fn on_intercept(&self, _conn_id: u64, _op: InterceptedOp, _message_id: i32) {}

    /// A chain step is about to run (verbose mode only).
    fn on_step(&self, _chain: &str, _step: &str) {}

    /// Rewriting failed and the original packet is forwarded instead.
    fn on_rewrite_error(&self, _conn_id: u64, _op: InterceptedOp, _message_id: i32, _error: &CodecError) {}

    /// A tracked paging cookie replaced the one in a follow-up search.
    fn on_cookie_reinjected(&self, _conn_id: u64, _message_id: i32) {}

    fn on_session_end(&self, _conn_id: u64, _error: Option<&ProxyError>) {}
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProxyObserver for TracingObserver {
    fn on_connection(&self, conn_id: u64, peer: SocketAddr) {
        info!(conn_id, %peer, "Client connected");
    }

    fn on_intercept(&self, conn_id: u64, op: InterceptedOp, message_id: i32) {
        info!(conn_id, message_id, op = op.name(), "Intercepted request");
    }

    fn on_step(&self, chain: &str, step: &str) {
        info!(chain, step, "Applying middleware");
    }

    fn on_rewrite_error(&self, conn_id: u64, op: InterceptedOp, message_id: i32, error: &CodecError) {
        warn!(conn_id, message_id, op = op.name(), error = %error, "Rewrite failed, forwarding original packet");
    }

    fn on_cookie_reinjected(&self, conn_id: u64, message_id: i32) {
        debug!(conn_id, message_id, "Reinjected tracked paging cookie");
    }

    fn on_session_end(&self, conn_id: u64, error: Option<&ProxyError>) {
        match error {
            Some(e) => warn!(conn_id, error = %e, "Session ended with error"),
            None => info!(conn_id, "Session closed"),
        }
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProxyObserver for NoopObserver {}
