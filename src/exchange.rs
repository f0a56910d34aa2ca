//! Transport boundary: outbound send capability and the two inbound signals.
//!
//! The engine consumes the transport through exactly two operations: sending
//! a line, and being told about each received line. A link-loss signal fires
//! once when the connection terminates. [`MessageExchange`] bundles the two
//! dispatcher instances the transport binding feeds.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::error::{LinkResult, TransportError};

/// Outbound send capability of the link.
///
/// Implemented by the transport binding that owns the physical connection.
pub trait Transport: Send + Sync {
    /// Write one line to the link.
    ///
    /// Fails with [`TransportError`] if the link cannot accept the write.
    fn send(&self, line: &str) -> Result<(), TransportError>;
}

/// Link-loss event delivered to the connection-loss dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Disconnect {
    /// Optional cause reported by the transport.
    pub cause: Option<String>,
}

/// The two inbound dispatchers of one link.
///
/// `receive` fans out each fully-framed inbound line; `link_lost` fires once
/// per connection loss. Clones share the same dispatchers, so the transport
/// binding and the command layer can hold independent copies.
#[derive(Clone, Default)]
pub struct MessageExchange {
    receive: Arc<Dispatcher<String>>,
    link_lost: Arc<Dispatcher<Disconnect>>,
}

impl MessageExchange {
    /// Create an exchange with empty dispatchers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher for inbound lines.
    pub fn receive(&self) -> &Arc<Dispatcher<String>> {
        &self.receive
    }

    /// Dispatcher for the link-loss signal.
    pub fn link_lost(&self) -> &Arc<Dispatcher<Disconnect>> {
        &self.link_lost
    }

    /// Entry point for the transport: deliver one framed inbound line.
    pub fn notify_line(&self, line: &str) -> LinkResult<()> {
        trace!(%line, "inbound line");
        self.receive.notify(&line.to_string())
    }

    /// Entry point for the transport: report the link as lost.
    pub fn notify_link_lost(&self, cause: Option<String>) -> LinkResult<()> {
        debug!(?cause, "link lost");
        self.link_lost.notify(&Disconnect { cause })
    }
}
