#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! RTP session management.
//!
//! A [`Session`](session::Session) tracks the participants of an RTP/RTCP
//! session, one [`Source`](source::Source) per SSRC. Incoming RTP packets are
//! validated against the RFC 3550 probation and sequence rules before they are
//! handed to the application, per-source statistics (interarrival jitter,
//! extended sequence numbers, packet and octet counts) are maintained along
//! the way, and RTCP sender/receiver reports are recorded on the source they
//! describe.
//!
//! The session owns no I/O and spawns no tasks: the transport drives it by
//! calling [`Session::process_rtp`](session::Session::process_rtp) and
//! [`Session::process_rtcp`](session::Session::process_rtcp) from its receive
//! threads, and packets flow back out through the [`SessionCallbacks`] wired
//! at construction.

use std::sync::Arc;
use std::time::SystemTime;

pub mod config;
mod error;
pub mod session;
pub mod source;
pub mod stats;

pub use error::{Error, Result};

use source::Source;

/// Callbacks wiring a session to its transport and application.
///
/// All methods have "drop silently" defaults, so an implementation only
/// overrides the directions it cares about. The data-path methods are invoked
/// with the session lock held; implementations must not call back into the
/// session from them.
pub trait SessionCallbacks {
    /// A validated receiver source has a packet ready for the application.
    fn process_rtp(&self, _source: &Source, _pkt: &rtp::packet::Packet) -> Result<()> {
        Ok(())
    }

    /// The local sender source has a packet ready for network transmission.
    fn send_rtp(&self, _source: &Source, _pkt: &rtp::packet::Packet) -> Result<usize> {
        Ok(0)
    }

    /// An RTCP compound packet is ready for network transmission.
    fn send_rtcp(
        &self,
        _source: &Source,
        _pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
        _is_eos: bool,
    ) -> Result<usize> {
        Ok(0)
    }

    /// Resolve a payload type to its RTP clock rate, -1 when unknown.
    fn clock_rate(&self, _payload_type: u8) -> i32 {
        -1
    }

    /// The wall clock used for arrival-time stamping. Returning `None` skips
    /// jitter computation for the packet at hand.
    fn get_time(&self) -> Option<SystemTime> {
        None
    }
}

/// Callbacks that drop every packet.
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {}

/// Source lifecycle notifications.
///
/// Observers run after the state mutation that triggered them, with no
/// session locks held, before the triggering operation returns to its caller.
pub trait SessionObserver {
    /// A previously unknown SSRC was just created.
    fn on_new_ssrc(&self, _source: &Arc<Source>) {}

    /// An SSRC collision was detected. Collision detection is currently a
    /// stub, so this never fires.
    fn on_ssrc_collision(&self, _source: &Arc<Source>) {}

    /// A source transitioned from unvalidated to validated.
    fn on_ssrc_validated(&self, _source: &Arc<Source>) {}

    /// A BYE was processed for this source.
    fn on_bye_ssrc(&self, _source: &Arc<Source>) {}
}
