//! uTP ('micro transport protocol', BEP 29) is a reliable, ordered, connection-oriented byte
//!  stream on top of UDP. It uses LEDBAT congestion control, which keeps queuing delay on the
//!  path close to a fixed target: uTP transfers yield to interactive traffic instead of
//!  competing with it, which makes the protocol a good fit for bulk background transfers.
//!
//! ## Structure
//!
//! * An [`EndPoint`] owns a UDP socket. It is listener and dialer at the same time, and all its
//!   connections are multiplexed over the socket, identified by the peer's address and a
//!   16 bit connection id.
//! * Datagrams that are not valid uTP are not discarded: they can be read from the end point as
//!   'out-of-band' traffic, so that other UDP based protocols (e.g. DHT messages) can share the
//!   port.
//! * Each connection processes its inbound packets in a task of its own, so a slow application
//!   reader never stalls the dispatcher or other connections.
//! * The application works with [`UtpStream`] handles that provide blocking (async) reads and
//!   writes with optional deadlines.
//!
//! ## Header
//!
//! All numbers are in network byte order (BE):
//! ```ascii
//!  0: type (4 bits: DATA=0, FIN=1, STATE=2, RESET=3, SYN=4) | version (4 bits, always 1)
//!  1: type of the first extension (u8, 0 for none)
//!  2: connection id (u16)
//!  4: timestamp (u32): sender's clock in microseconds
//!  8: timestamp difference (u32): the sender's most recent one-way delay measurement
//! 12: window (u32): free space in the sender's receive buffer in bytes
//! 16: sequence number (u16)
//! 18: ack number (u16): the last packet received in sequence
//! 20: extensions: a chain of (type of next extension: u8, length: u8, data)
//! ```
//!
//! The only extension that is interpreted is the selective ACK (type 1): a bitmask where bit
//!  `i` (LSB first within each byte) stands for packet `ack_nr + 2 + i`. Unknown extensions are
//!  skipped.
//!
//! ## Connection setup and teardown
//!
//! The initiator picks a random `recv_id` and sends a SYN with `connection_id = recv_id`. All
//!  later packets it sends carry `recv_id + 1`, and it expects the peer to send with `recv_id`.
//!  The responder answers with a STATE, which completes the handshake. There is no third leg:
//!  the initiator's first DATA is its confirmation.
//!
//! Either side ends its sending direction with a FIN, which is sequenced like DATA. A connection
//!  is torn down when both FINs are acknowledged, when a RESET arrives, or when a packet is not
//!  acknowledged within the send timeout.
//!
//! ## Reliability and congestion control
//!
//! Unacknowledged packets are retransmitted after an RTO derived from the smoothed round trip
//!  time (RFC 6298), or earlier after duplicate ACKs or selective ACKs that indicate a gap.
//!  Loss halves the congestion window. The window grows and shrinks with the measured queuing
//!  delay (LEDBAT, RFC 6817).

pub mod buffers;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod packet;
pub mod safe_converter;
pub mod send_pipeline;
pub mod seq_nr;
pub mod stream;
pub mod util;

pub use config::UtpConfig;
pub use end_point::{dial, EndPoint};
pub use error::{UtpError, UtpResult};
pub use stream::UtpStream;
