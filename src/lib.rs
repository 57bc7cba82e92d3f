//! Host-side library for driving a resource-constrained peripheral endpoint
//!  (BLE / IR keyboard emulation) over a single half-duplex serial link.
//!
//! The wire protocol is deliberately minimal: fixed-size header, one byte of
//!  payload length, a CRC8 trailer, 255 bytes per frame at most. The same frame
//!  layout is used in both directions:
//!
//! ```ascii
//! 0:  operation (u8): RESET=01, ALLOCATE=02, FREE=03, KEY=04, SETTINGS=05,
//!      STATE=06, EVENT=80
//! 1:  sequence (u8): wrapping counter assigned by the host, echoed verbatim by
//!      the endpoint in its response
//! 2:  peripheral address in a request (00 = the endpoint itself) / result code
//!      in a response
//! 3:  payload length (u8), 0..250
//! 4:  payload, operation specific
//! *:  CRC8 over header and payload (poly 0x31, seed 0xFF, MSB first)
//! ```
//!
//! The link is half duplex and the endpoint is single threaded, so the channel
//!  enforces a single outstanding request: a second caller gets a `Busy` error
//!  instead of being queued. Unsolicited `EVENT` frames can arrive interleaved
//!  with a pending response at any time; they are demultiplexed by comparing
//!  `(operation, sequence)` against the in-flight request and handed to an
//!  observer instead of the waiting caller.
//!
//! Layering, bottom up:
//! * [protocol::frame] - the frame codec, pure data logic without I/O
//! * [protocol::payload] - operation specific payload codecs
//! * [link] - the transport abstraction and the single-flight exchange channel
//! * [communicator] - typed operations (reset, key event, settings, device
//!    enumeration) and endpoint event forwarding

pub mod protocol;
pub mod link;
pub mod communicator;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
