//! # rtp-ingress
//!
//! Receive-side RTP pipeline for a real-time media session.
//!
//! Takes raw RTP and RTCP datagrams from the transport, validates and parses
//! them, unwraps RTX retransmissions and RED/ULPFEC redundancy, classifies
//! sequence ordering, maintains per-stream receive statistics and hands the
//! media payload to a decoder sink.
//!
//! ## Crate structure
//!
//! - [`wire`]: RTP header parsing, header extensions, RTX and RED framing
//! - [`payload`]: Payload type registry and RTX associations
//! - [`ordering`]: Extended sequence numbers and ordering verdicts
//! - [`pool`]: Reusable scratch buffer for RTX restoration
//! - [`stats`]: Per-SSRC receive statistics
//! - [`rtcp`]: Compound RTCP parsing and building
//! - [`clock`]: NTP wall clock and RTP → NTP estimation
//! - [`observer`]: Registrable observer slots
//! - [`config`]: TOML configuration
//! - [`error`]: Drop reasons and configuration errors
//! - [`receiver`]: The packet receiver itself

pub mod clock;
pub mod config;
pub mod error;
pub mod observer;
pub mod ordering;
pub mod payload;
pub mod pool;
pub mod receiver;
pub mod rtcp;
pub mod stats;
pub mod wire;

pub use config::ReceiverConfig;
pub use error::{ConfigError, DropReason};
pub use receiver::{Collaborators, Delivery, PacketReceiver};
