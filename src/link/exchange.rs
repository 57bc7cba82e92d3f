use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{trace, warn};

use crate::link::{ChannelError, ExchangeObserver, LinkHandler, Transport};
use crate::protocol::frame::{Frame, Operation};

/// Multiplexes exactly one in-flight request/response plus any number of
///  unsolicited inbound frames over one half-duplex transport.
///
/// Callers run [ExchangeChannel::post] / [ExchangeChannel::exchange] /
///  [ExchangeChannel::submit]; the transport's run loop drives the
///  [LinkHandler] callbacks from its own task. A single lock guards the
///  in-flight record and the scratch frame that inbound bytes are assembled
///  into; the callbacks hold it only for bounded work, and `exchange` never
///  suspends while holding it.
///
/// The single-flight rule is deliberate: the wire is half duplex and the
///  endpoint processes one request at a time, so a second concurrent request
///  fails fast with [ChannelError::Busy] instead of being queued.
pub struct ExchangeChannel {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn ExchangeObserver>,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    current: Option<Pending>,
    /// inbound bytes are assembled here until a frame completes
    scratch: Frame,
}

/// The transaction: a copy of the caller's finalized request (the serialize
///  cursor advances on this copy) plus the slot its correlated response lands
///  in. An `exchange` drops it before returning, on every outcome; a
///  fire-and-forget send drops it once the last byte is on the wire.
struct Pending {
    request: Frame,
    response: Option<Frame>,
    /// present while an `exchange` caller is blocked; completing - or merely
    ///  dropping - the sender wakes it
    completed: Option<oneshot::Sender<()>>,
}

impl ExchangeChannel {
    pub fn new(transport: Arc<dyn Transport>, observer: Arc<dyn ExchangeObserver>) -> ExchangeChannel {
        ExchangeChannel {
            transport,
            observer,
            state: Mutex::new(ChannelState {
                current: None,
                scratch: Frame::new(),
            }),
        }
    }

    /// Finalizes the frame and dispatches it: EVENT frames are fire-and-forget
    ///  ([ExchangeChannel::submit]), everything else expects a response
    ///  ([ExchangeChannel::exchange]).
    pub async fn post(&self, frame: &mut Frame, timeout: Duration) -> Result<(), ChannelError> {
        frame.finalize();

        if frame.operation_byte() == u8::from(Operation::Event) {
            self.submit(frame).await
        } else {
            self.exchange(frame, timeout).await
        }
    }

    /// Fire-and-forget send of a finalized frame. Returns as soon as the frame
    ///  is registered for sending; no response is ever expected, the slot
    ///  frees up once the last byte is on the wire.
    pub async fn submit(&self, frame: &Frame) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock().await;
            if state.current.is_some() {
                return Err(ChannelError::Busy);
            }
            state.current = Some(Pending {
                request: frame.clone(),
                response: None,
                completed: None,
            });
        }

        self.transport.trigger().await;
        Ok(())
    }

    /// Sends a finalized request and blocks the calling task until the
    ///  matching response arrives, the timeout expires, or the channel is
    ///  flushed. On success the response is written into `frame`; on timeout
    ///  the frame is left untouched. The in-flight record is cleared before
    ///  returning, whatever the outcome.
    pub async fn exchange(&self, frame: &mut Frame, timeout: Duration) -> Result<(), ChannelError> {
        let completed = {
            let mut state = self.state.lock().await;
            if state.current.is_some() {
                return Err(ChannelError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            state.current = Some(Pending {
                request: frame.clone(),
                response: None,
                completed: Some(tx),
            });
            rx
        };

        self.transport.trigger().await;

        match tokio::time::timeout(timeout, completed).await {
            Ok(_) => {
                // woken by a correlated response, or by a flush (which drops
                // the sender and leaves no response behind)
                let response = {
                    let mut state = self.state.lock().await;
                    state.current.take().and_then(|pending| pending.response)
                };

                match response {
                    Some(response) => {
                        *frame = response;
                        if frame.is_valid() {
                            Ok(())
                        } else {
                            Err(ChannelError::Integrity)
                        }
                    }
                    None => Err(ChannelError::Integrity),
                }
            }
            Err(_elapsed) => {
                self.state.lock().await.current = None;
                Err(ChannelError::Timeout)
            }
        }
    }

    /// The sole cancellation path: resets the transport, discards the
    ///  half-assembled scratch frame and drops the in-flight transaction
    ///  without copying anything into it. A caller blocked in `exchange`
    ///  wakes up and observes the missing response as an integrity failure.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;

        self.transport.flush().await?;
        state.scratch.clear();
        state.current = None; // dropping the sender wakes a blocked exchange

        Ok(())
    }
}

#[async_trait::async_trait]
impl LinkHandler for ExchangeChannel {
    async fn send_data(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().await;

        let Some(pending) = state.current.as_mut() else {
            return 0;
        };

        let written = pending.request.serialize(buf);
        trace!(bytes = written, "filling send buffer");

        if written == 0 {
            // the frame is fully on the wire
            self.observer.send(&pending.request);

            if pending.request.operation_byte() == u8::from(Operation::Event) {
                // events never get a response, free the slot right away
                state.current = None;
            }
        }

        written
    }

    async fn receive_data(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock().await;
        let mut consumed = 0;

        // a single burst may carry several frames plus a partial one
        while consumed < data.len() {
            let ChannelState { current, scratch } = &mut *state;

            let n = scratch.deserialize(&data[consumed..]);
            consumed += n;

            if scratch.is_complete() {
                trace!(frame = ?scratch, "inbound frame complete");

                match current {
                    Some(pending)
                        if pending.request.operation_byte() == scratch.operation_byte()
                            && pending.request.sequence() == scratch.sequence() =>
                    {
                        // the awaited response; validity is the caller's call
                        pending.response = Some(scratch.clone());
                        if let Some(tx) = pending.completed.take() {
                            let _ = tx.send(());
                        }
                    }
                    _ => {
                        self.observer.received(scratch);
                    }
                }

                scratch.clear();
            } else if n == 0 {
                // an overstated length byte can never complete within the
                // frame ceiling; drop the bytes and resync on what follows
                warn!(frame = ?scratch, "discarding unparseable inbound frame");
                scratch.clear();
            }
        }

        data.len()
    }

    fn state_change(&self) {
        self.observer.state_change();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use rstest::rstest;

    use crate::protocol::frame::ResultCode;
    use crate::test_util::{frame, ScriptedLink};

    use super::*;

    struct RecordingObserver {
        received: StdMutex<Vec<Frame>>,
        sent: StdMutex<Vec<Frame>>,
    }
    impl RecordingObserver {
        fn new() -> Arc<RecordingObserver> {
            Arc::new(RecordingObserver {
                received: StdMutex::new(Vec::new()),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }
    impl ExchangeObserver for RecordingObserver {
        fn send(&self, frame: &Frame) {
            self.sent.lock().unwrap().push(frame.clone());
        }
        fn received(&self, frame: &Frame) {
            self.received.lock().unwrap().push(frame.clone());
        }
    }

    fn channel_with_observer() -> (Arc<ScriptedLink>, Arc<RecordingObserver>, Arc<ExchangeChannel>) {
        let link = Arc::new(ScriptedLink::new());
        let observer = RecordingObserver::new();
        let channel = Arc::new(ExchangeChannel::new(link.clone(), observer.clone()));
        (link, observer, channel)
    }

    async fn drain(channel: &ExchangeChannel) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut chunk = [0u8; 16];
        loop {
            let n = channel.send_data(&mut chunk).await;
            if n == 0 {
                break;
            }
            wire.extend_from_slice(&chunk[..n]);
        }
        wire
    }

    #[tokio::test]
    async fn test_exchange_completes_on_matching_response() {
        let (link, _, channel) = channel_with_observer();

        let request = frame(Operation::Key, 5, 0x01, &[0x01, 0x34, 0x12]);
        let worker = {
            let channel = channel.clone();
            let mut request = request.clone();
            tokio::spawn(async move {
                let result = channel.exchange(&mut request, Duration::from_secs(1)).await;
                (result, request)
            })
        };

        link.wait_trigger().await;

        // the channel serializes the request on demand, partial writes included
        assert_eq!(drain(&channel).await, request.data());

        let response = frame(Operation::Key, 5, ResultCode::Ok.into(), &[]);
        channel.receive_data(response.data()).await;

        let (result, completed) = worker.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(completed, response);
        assert_eq!(completed.result().unwrap(), ResultCode::Ok);
    }

    #[tokio::test]
    async fn test_second_caller_gets_busy() {
        let (link, _, channel) = channel_with_observer();

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = frame(Operation::Reset, 0, 0x00, &[]);
                channel.exchange(&mut request, Duration::from_secs(1)).await
            })
        };

        link.wait_trigger().await;

        let mut competing = frame(Operation::State, 1, 0x00, &[]);
        assert!(matches!(
            channel.exchange(&mut competing, Duration::from_secs(1)).await,
            Err(ChannelError::Busy)
        ));
        assert!(matches!(
            channel.submit(&competing).await,
            Err(ChannelError::Busy)
        ));
        // the pending request is untouched by the rejected attempts
        let response = frame(Operation::Reset, 0, ResultCode::Ok.into(), &[]);
        channel.receive_data(response.data()).await;
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_times_out_without_response() {
        let (link, _, channel) = channel_with_observer();

        let request = frame(Operation::Settings, 7, 0x02, &[0xde, 0xad]);
        let worker = {
            let channel = channel.clone();
            let mut pending = request.clone();
            tokio::spawn(async move {
                let result = channel.exchange(&mut pending, Duration::from_millis(100)).await;
                (result, pending)
            })
        };

        link.wait_trigger().await;
        drain(&channel).await;

        let (result, untouched) = worker.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Timeout)));
        // timeout must not write anything into the caller's frame
        assert_eq!(untouched, request);

        // the slot is free again
        let next = frame(Operation::Reset, 8, 0x00, &[]);
        assert!(channel.submit(&next).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupted_response_is_an_integrity_error() {
        let (link, _, channel) = channel_with_observer();

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = frame(Operation::State, 3, 0x00, &[]);
                channel.exchange(&mut request, Duration::from_secs(1)).await
            })
        };

        link.wait_trigger().await;
        drain(&channel).await;

        // matching (operation, sequence) but a flipped payload byte
        let mut wire = frame(Operation::State, 3, ResultCode::Ok.into(), &[0x11, 0x22])
            .data()
            .to_vec();
        wire[4] ^= 0x01;
        channel.receive_data(&wire).await;

        assert!(matches!(
            worker.await.unwrap(),
            Err(ChannelError::Integrity)
        ));
    }

    #[tokio::test]
    async fn test_event_is_demultiplexed_from_pending_response() {
        let (link, observer, channel) = channel_with_observer();

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = frame(Operation::Key, 5, 0x01, &[0x01, 0x34, 0x12]);
                channel.exchange(&mut request, Duration::from_secs(1)).await
            })
        };

        link.wait_trigger().await;
        drain(&channel).await;

        // one burst: an interleaved event frame first, then the response
        let mut burst = frame(Operation::Event, 9, 0x00, &[]).data().to_vec();
        burst.extend_from_slice(frame(Operation::Key, 5, ResultCode::Ok.into(), &[]).data());
        channel.receive_data(&burst).await;

        assert!(worker.await.unwrap().is_ok());

        let received = observer.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].operation_byte(), u8::from(Operation::Event));
        assert_eq!(received[0].sequence(), 9);
    }

    #[tokio::test]
    async fn test_unsolicited_frame_without_pending_request_goes_to_observer() {
        let (_, observer, channel) = channel_with_observer();

        let stale = frame(Operation::Key, 77, ResultCode::Ok.into(), &[]);
        channel.receive_data(stale.data()).await;

        assert_eq!(observer.received.lock().unwrap().clone(), vec![stale]);
    }

    #[tokio::test]
    async fn test_flush_wakes_a_blocked_exchange() {
        let (link, _, channel) = channel_with_observer();

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = frame(Operation::Reset, 2, 0x00, &[]);
                channel.exchange(&mut request, Duration::from_secs(30)).await
            })
        };

        link.wait_trigger().await;

        channel.flush().await.unwrap();

        assert!(matches!(
            worker.await.unwrap(),
            Err(ChannelError::Integrity)
        ));
        assert_eq!(link.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_frees_the_slot_once_fully_sent() {
        let (link, observer, channel) = channel_with_observer();

        let event = frame(Operation::Event, 11, 0x00, &[]);
        channel.submit(&event).await.unwrap();
        link.wait_trigger().await;

        assert_eq!(drain(&channel).await, event.data());

        // fully sent: the send hook fired and no response is awaited
        assert_eq!(observer.sent.lock().unwrap().clone(), vec![event.clone()]);
        let next = frame(Operation::Event, 12, 0x00, &[]);
        assert!(channel.submit(&next).await.is_ok());
    }

    #[tokio::test]
    async fn test_receive_resyncs_after_unparseable_frame() {
        let (link, _, channel) = channel_with_observer();

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = frame(Operation::State, 6, 0x00, &[]);
                channel.exchange(&mut request, Duration::from_secs(1)).await
            })
        };

        link.wait_trigger().await;
        drain(&channel).await;

        // a header declaring 255 payload bytes can never complete; the channel
        // must discard it and still parse the response that follows
        let mut poison = vec![0x04, 0x00, 0x00, 0xff];
        poison.extend_from_slice(&[0u8; 251]);
        channel.receive_data(&poison).await;
        channel
            .receive_data(frame(Operation::State, 6, ResultCode::Ok.into(), &[]).data())
            .await;

        assert!(worker.await.unwrap().is_ok());
    }

    #[rstest]
    #[case::event_is_fire_and_forget(Operation::Event, true)]
    #[case::request_expects_a_response(Operation::Reset, false)]
    #[tokio::test]
    async fn test_post_dispatches_on_operation(#[case] operation: Operation, #[case] fire_and_forget: bool) {
        let (link, _, channel) = channel_with_observer();

        let mut posted = Frame::new();
        posted.set_operation(operation);
        posted.set_sequence(1);
        posted.set_address(0);
        posted.set_payload_length(0);

        let worker = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.post(&mut posted, Duration::from_secs(1)).await })
        };

        link.wait_trigger().await;

        if fire_and_forget {
            // submit returns before (and without) any response
            assert!(worker.await.unwrap().is_ok());
        } else {
            drain(&channel).await;
            let response = frame(Operation::Reset, 1, ResultCode::Ok.into(), &[]);
            channel.receive_data(response.data()).await;
            assert!(worker.await.unwrap().is_ok());
        }
    }
}
