//! Test doubles and convenience builders for exercising the channel and the
//!  communicator without serial hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tracing::trace;

use crate::link::{LinkHandler, Transport};
use crate::protocol::frame::{Frame, Operation};

/// convenience builder: a finalized frame with the given header fields.
///  `field` is byte 2 - the address of a request, the result code of a
///  response.
pub fn frame(operation: Operation, sequence: u8, field: u8, payload: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.set_operation(operation);
    frame.set_sequence(sequence);
    frame.set_address(field);
    frame.set_payload(payload).expect("test payload fits a frame");
    frame.finalize();
    frame
}

/// Scripted endpoint function: receives each fully assembled outbound frame
///  and returns the raw byte bursts the fake endpoint answers with.
pub type Responder = Box<dyn FnMut(&Frame) -> Vec<Vec<u8>> + Send>;

/// In-memory stand-in for a serial link. When triggered, the run loop pulls
///  the outbound frame through the handler in deliberately small chunks,
///  hands it to the scripted [Responder], and feeds the scripted replies back
///  through `receive_data`, again chunked, to exercise partial reads and
///  writes the way a real UART does.
///
/// Tests that do not need a live run loop can drive the handler callbacks
///  directly and merely use [ScriptedLink::wait_trigger] for sequencing.
pub struct ScriptedLink {
    open: AtomicBool,
    triggered: Notify,
    cancelled: Notify,
    flushes: AtomicUsize,
    responder: Mutex<Option<Responder>>,
    handler: Mutex<Option<Arc<dyn LinkHandler>>>,
}

/// chunk sizes small enough to split every realistic frame
const SEND_CHUNK: usize = 7;
const RECEIVE_CHUNK: usize = 3;

impl ScriptedLink {
    pub fn new() -> ScriptedLink {
        ScriptedLink {
            open: AtomicBool::new(false),
            triggered: Notify::new(),
            cancelled: Notify::new(),
            flushes: AtomicUsize::new(0),
            responder: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    pub fn respond_with(&self, responder: Responder) {
        *self.responder.lock().unwrap() = Some(responder);
    }

    /// Delivers unsolicited bytes (an endpoint event) through the handler,
    ///  chunked like everything else. Waits for the run loop to come up if it
    ///  was only just spawned.
    pub async fn inject(&self, bytes: &[u8]) {
        let handler = loop {
            if let Some(handler) = self.handler.lock().unwrap().clone() {
                break handler;
            }
            tokio::task::yield_now().await;
        };
        for chunk in bytes.chunks(RECEIVE_CHUNK) {
            handler.receive_data(chunk).await;
        }
    }

    /// completes once the channel asked for a (re)send; a pending trigger is
    ///  remembered, so the order of trigger and wait does not matter
    pub async fn wait_trigger(&self) {
        self.triggered.notified().await;
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedLink {
    async fn open(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger(&self) {
        self.triggered.notify_one();
    }

    async fn run_loop(&self, handler: Arc<dyn LinkHandler>) -> anyhow::Result<()> {
        *self.handler.lock().unwrap() = Some(handler.clone());
        handler.state_change();

        loop {
            select! {
                _ = self.triggered.notified() => {
                    let mut wire = Vec::new();
                    let mut chunk = [0u8; SEND_CHUNK];
                    loop {
                        let n = handler.send_data(&mut chunk).await;
                        if n == 0 {
                            break;
                        }
                        wire.extend_from_slice(&chunk[..n]);
                    }
                    if wire.is_empty() {
                        continue;
                    }

                    let mut outbound = Frame::new();
                    outbound.deserialize(&wire);
                    trace!(frame = ?outbound, "scripted link pulled outbound frame");

                    let replies = {
                        let mut responder = self.responder.lock().unwrap();
                        match responder.as_mut() {
                            Some(respond) => respond(&outbound),
                            None => Vec::new(),
                        }
                    };
                    for reply in replies {
                        for chunk in reply.chunks(RECEIVE_CHUNK) {
                            handler.receive_data(chunk).await;
                        }
                    }
                }
                _ = self.cancelled.notified() => {
                    return Ok(());
                }
            }
        }
    }

    fn cancel_run_loop(&self) {
        self.cancelled.notify_one();
    }
}
