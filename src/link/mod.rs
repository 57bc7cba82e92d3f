pub mod exchange;

use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::protocol::frame::Frame;

/// The byte-level link to the endpoint - a serial port in production, an
///  in-memory double in tests. Implementations are injected at composition
///  time and driven exclusively by the exchange channel; nothing else reads
///  or writes the wire.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, timeout: Duration) -> anyhow::Result<()>;

    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    /// discard anything buffered in either direction
    async fn flush(&self) -> anyhow::Result<()>;

    /// ask the transport to begin (or continue) sending; it pulls the bytes
    ///  through [LinkHandler::send_data] from its own context
    async fn trigger(&self);

    /// Drives the link until cancelled, invoking the handler's callbacks for
    ///  everything that happens on the wire. Run this on its own task.
    async fn run_loop(&self, handler: Arc<dyn LinkHandler>) -> anyhow::Result<()>;

    fn cancel_run_loop(&self);
}

/// The callback side of [Transport]. This trait decouples transport
///  implementations from the transaction logic that reacts to wire activity;
///  it is passed around as an `Arc<dyn ...>` to keep transports free of any
///  dependency on the channel.
#[async_trait::async_trait]
pub trait LinkHandler: Send + Sync {
    /// The wire is ready for outbound bytes. Returns how many bytes were
    ///  placed into `buf`; 0 means there is nothing (more) to send and the
    ///  transport can stop pulling.
    async fn send_data(&self, buf: &mut [u8]) -> usize;

    /// Inbound bytes arrived. Returns how many were consumed - always all of
    ///  them, this layer never pushes back.
    async fn receive_data(&self, data: &[u8]) -> usize;

    /// the link transitioned (opened, closed, error)
    fn state_change(&self);
}

/// Extension points for logging and telemetry around the exchange channel.
///  These hooks take no part in correlation; the default implementations do
///  nothing.
pub trait ExchangeObserver: Send + Sync {
    /// the link state changed
    fn state_change(&self) {}

    /// an outbound frame went fully onto the wire
    fn send(&self, _frame: &Frame) {}

    /// an inbound frame arrived that was not the awaited response - an
    ///  endpoint event, or a stale / duplicate echo
    fn received(&self, _frame: &Frame) {}
}

/// observer for embedders that do not need the hooks
pub struct NullObserver;
impl ExchangeObserver for NullObserver {}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// a transaction is already outstanding; the channel never queues, the
    ///  caller has to retry later
    #[error("a transaction is already in flight")]
    Busy,

    /// no matching, complete response arrived within the allowed time; the
    ///  endpoint may still answer late, in which case the reply surfaces as
    ///  an unsolicited frame
    #[error("timed out waiting for the response")]
    Timeout,

    /// a response was correlated to the request but failed the CRC gate, or
    ///  the exchange was flushed from under the caller
    #[error("response failed the integrity check")]
    Integrity,

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
