//! Typed host-side operations on top of the exchange channel: reset, key
//!  injection, peripheral settings and device enumeration, plus forwarding of
//!  endpoint-initiated events to the embedding application.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::link::exchange::ExchangeChannel;
use crate::link::{ChannelError, ExchangeObserver, LinkHandler, Transport};
use crate::protocol::frame::{Frame, Operation, ResultCode};
use crate::protocol::payload::{BleSettings, Device, DeviceReader, IrSettings, KeyEvent};
use crate::protocol::sequence::SequenceCounter;

/// request address of the endpoint itself; peripherals start at 1
pub const ROOT_ADDRESS: u8 = 0x00;

#[derive(Debug)]
pub struct CommunicatorConfig {
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    /// how long an exchange waits for the endpoint's response
    pub exchange_timeout: Duration,
}

impl CommunicatorConfig {
    pub fn new() -> CommunicatorConfig {
        CommunicatorConfig {
            open_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            exchange_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// settings payload for [EndpointCommunicator::setup], by peripheral kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralSettings {
    Ble(BleSettings),
    Ir(IrSettings),
}

/// Unsolicited, endpoint-initiated notifications, decoded from EVENT frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// an empty-payload poke, sent e.g. right after the endpoint (re)boots
    Attention { address: u8 },
    /// a key action originating on the endpoint
    Key { address: u8, event: KeyEvent },
    /// an event payload this library does not know how to decode
    Raw { address: u8, payload: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// the exchange itself succeeded, but the endpoint reported a failure in
    ///  the response's result byte
    #[error("endpoint reported {0:?}")]
    Endpoint(ResultCode),

    #[error("settings do not fit a frame payload")]
    PayloadTooLarge,

    #[error("malformed response payload: {0}")]
    MalformedResponse(#[source] anyhow::Error),
}

/// observer wired into the channel: decodes EVENT frames and pushes them onto
///  the application's event queue
struct EventForwarder {
    events: mpsc::Sender<EndpointEvent>,
}

impl ExchangeObserver for EventForwarder {
    fn state_change(&self) {
        info!("link state changed");
    }

    fn send(&self, frame: &Frame) {
        trace!(?frame, "frame sent");
    }

    fn received(&self, frame: &Frame) {
        if !frame.is_valid() {
            warn!(?frame, "discarding invalid unsolicited frame");
            return;
        }
        if frame.operation_byte() != u8::from(Operation::Event) {
            warn!(?frame, "unsolicited non-event frame (late or duplicate response?) - ignoring");
            return;
        }

        let event = decode_event(frame);
        debug!(?event, "endpoint event");
        if let Err(e) = self.events.try_send(event) {
            warn!("dropping endpoint event, queue full or closed: {}", e);
        }
    }
}

fn decode_event(frame: &Frame) -> EndpointEvent {
    let address = frame.address();
    let payload = frame.payload();

    if payload.is_empty() {
        return EndpointEvent::Attention { address };
    }
    if payload.len() == KeyEvent::WIRE_SIZE {
        if let Ok(event) = KeyEvent::try_deser(&mut &*payload) {
            return EndpointEvent::Key { address, event };
        }
    }
    EndpointEvent::Raw {
        address,
        payload: payload.to_vec(),
    }
}

/// The host's view of one serial endpoint. Owns the transport, the exchange
///  channel and the sequence counter; endpoint events are pushed onto the
///  queue handed in at construction.
pub struct EndpointCommunicator {
    config: CommunicatorConfig,
    transport: Arc<dyn Transport>,
    channel: Arc<ExchangeChannel>,
    sequence: SequenceCounter,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointCommunicator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: CommunicatorConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> EndpointCommunicator {
        let observer = Arc::new(EventForwarder { events });
        let channel = Arc::new(ExchangeChannel::new(transport.clone(), observer));

        EndpointCommunicator {
            config,
            transport,
            channel,
            sequence: SequenceCounter::new(),
            pump: Mutex::new(None),
        }
    }

    /// Opens the transport, starts the run loop that drives the channel
    ///  callbacks, and flushes any stale bytes off the wire.
    pub async fn initialize(&self) -> Result<(), EndpointError> {
        self.transport
            .open(self.config.open_timeout)
            .await
            .map_err(ChannelError::Transport)?;

        let transport = self.transport.clone();
        let handler: Arc<dyn LinkHandler> = self.channel.clone();
        let pump = tokio::spawn(async move {
            if let Err(e) = transport.run_loop(handler).await {
                error!("transport loop terminated: {:#}", e);
            }
        });
        *self.pump.lock().await = Some(pump);

        self.channel.flush().await?;

        info!("endpoint link up");
        Ok(())
    }

    pub async fn deinitialize(&self) -> Result<(), EndpointError> {
        if self.transport.is_open() {
            self.channel.flush().await?;

            self.transport.cancel_run_loop();
            if let Some(pump) = self.pump.lock().await.take() {
                pump.await.ok();
            }

            self.transport
                .close(self.config.close_timeout)
                .await
                .map_err(ChannelError::Transport)?;

            info!("endpoint link down");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Resets a peripheral. Address 0 reboots the whole endpoint.
    pub async fn reset(&self, address: u8) -> Result<(), EndpointError> {
        debug!(address, "reset");

        let mut request = self.request(Operation::Reset, address);
        self.post_checked(&mut request).await
    }

    /// Injects a key press or release on the addressed peripheral.
    pub async fn key_event(&self, address: u8, event: KeyEvent) -> Result<(), EndpointError> {
        debug!(address, ?event, "key event");

        let mut payload = BytesMut::new();
        event.ser(&mut payload);

        let mut request = self.request(Operation::Key, address);
        request
            .set_payload(&payload)
            .map_err(|_| EndpointError::PayloadTooLarge)?;
        self.post_checked(&mut request).await
    }

    /// Pushes settings to the addressed peripheral.
    pub async fn setup(&self, address: u8, settings: PeripheralSettings) -> Result<(), EndpointError> {
        debug!(address, ?settings, "setup");

        let mut payload = BytesMut::new();
        match &settings {
            PeripheralSettings::Ble(s) => s.ser(&mut payload),
            PeripheralSettings::Ir(s) => s.ser(&mut payload),
        }

        let mut request = self.request(Operation::Settings, address);
        request
            .set_payload(&payload)
            .map_err(|_| EndpointError::PayloadTooLarge)?;
        self.post_checked(&mut request).await
    }

    /// Asks the endpoint for its device table. The root device (the endpoint
    ///  itself) is part of the report.
    pub async fn devices(&self) -> Result<Vec<Device>, EndpointError> {
        let mut request = self.request(Operation::State, ROOT_ADDRESS);
        self.post_checked(&mut request).await?;

        let devices = DeviceReader::new(request.payload())
            .collect::<anyhow::Result<Vec<Device>>>()
            .map_err(EndpointError::MalformedResponse)?;

        debug!(count = devices.len(), "device report");
        Ok(devices)
    }

    fn request(&self, operation: Operation, address: u8) -> Frame {
        let mut frame = Frame::new();
        frame.set_operation(operation);
        frame.set_sequence(self.sequence.next());
        frame.set_address(address);
        frame.set_payload_length(0);
        frame
    }

    /// posts the request and maps a non-OK application result to an error
    async fn post_checked(&self, request: &mut Frame) -> Result<(), EndpointError> {
        self.channel.post(request, self.config.exchange_timeout).await?;

        match request.result().map_err(EndpointError::MalformedResponse)? {
            ResultCode::Ok => Ok(()),
            code => {
                warn!(?code, "exchange failed");
                Err(EndpointError::Endpoint(code))
            }
        }
    }
}
