use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use util::sync::Mutex;

/// Sequence numbers live in a 16 bit space.
pub(crate) const RTP_SEQ_MOD: i64 = 1 << 16;

/// Per-packet arrival metadata, captured at the session boundary before any
/// source is touched.
#[derive(Debug, Default, Clone)]
pub struct ArrivalStats {
    /// Arrival wall-clock time, `None` when the session has no time source.
    pub time: Option<SystemTime>,
    /// Datagram size including the fixed lower-layer header overhead.
    pub bytes: usize,
    /// RTP payload length, 0 for RTCP.
    pub payload_len: usize,
    /// Network address the datagram came from, when the transport knows it.
    pub address: Option<SocketAddr>,
}

/// Receive and send statistics for a single source, including the RFC 3550
/// A.1 sequence tracking state.
#[derive(Debug, Clone)]
pub struct SourceStats {
    /// First sequence number of the current baseline.
    pub base_seq: u16,
    /// Highest sequence number seen.
    pub max_seq: u16,
    /// Accumulated sequence wraps, scaled by 65536. -1 until the first
    /// packet is observed.
    pub cycles: i64,
    /// Resynchronisation watermark after a large jump. One past the 16 bit
    /// space when unset, so no sequence number compares equal.
    pub bad_seq: u32,
    pub packets_received: u64,
    /// Payload octets received.
    pub octets_received: u64,
    /// Total bytes received, lower-layer headers included.
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub bytes_sent: u64,
    /// Interarrival jitter estimate in RTP timestamp units, scaled by 16
    /// (RFC 3550 A.8).
    pub jitter: u32,
    /// Transit time of the last packet in RTP units, `None` before the first
    /// jitter update.
    pub transit: Option<u32>,
}

impl SourceStats {
    /// Extended highest sequence number (`cycles + max_seq`), `None` until a
    /// packet was observed.
    pub fn ext_highest_seq(&self) -> Option<u64> {
        if self.cycles < 0 {
            None
        } else {
            Some((self.cycles + self.max_seq as i64) as u64)
        }
    }
}

impl Default for SourceStats {
    fn default() -> Self {
        SourceStats {
            base_seq: 0,
            max_seq: 0,
            cycles: -1,
            bad_seq: (RTP_SEQ_MOD + 1) as u32,
            packets_received: 0,
            octets_received: 0,
            bytes_received: 0,
            packets_sent: 0,
            octets_sent: 0,
            bytes_sent: 0,
            jitter: 0,
            transit: None,
        }
    }
}

/// Sender info from the most recent SR received from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReportInfo {
    /// NTP timestamp, 32.32 fixed point.
    pub ntp_time: u64,
    /// RTP timestamp corresponding to `ntp_time`.
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    /// Arrival time of the report.
    pub time: Option<SystemTime>,
}

/// The most recent report block a source sent about our own stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReportInfo {
    /// Fraction of packets lost since the previous report, fixed point /256.
    pub fraction_lost: u8,
    /// Cumulative packets lost.
    pub packets_lost: u32,
    /// Extended highest sequence number the reporter received from us.
    pub ext_highest_seq: u32,
    /// Interarrival jitter as seen by the reporter, in RTP units.
    pub jitter: u32,
    /// Middle 32 bits of the NTP time of the last SR the reporter saw.
    pub last_sr: u32,
    /// Delay between that SR and this report, 16.16 fixed point seconds.
    pub delay: u32,
}

/// Double-buffered report storage.
///
/// The writer fills the slot that is not current and publishes it with a
/// release store of the slot index; readers acquire the index and read the
/// published slot. A reader can observe the old report or the complete new
/// one, never a partially written slot, and never contends with the writer.
pub(crate) struct ReportBuffer<T> {
    slots: [Mutex<Option<T>>; 2],
    current: AtomicUsize,
}

impl<T: Clone> ReportBuffer<T> {
    pub(crate) fn new() -> Self {
        ReportBuffer {
            slots: [Mutex::new(None), Mutex::new(None)],
            current: AtomicUsize::new(0),
        }
    }

    pub(crate) fn publish(&self, value: T) {
        let next = self.current.load(Ordering::Relaxed) ^ 1;
        *self.slots[next].lock() = Some(value);
        self.current.store(next, Ordering::Release);
    }

    /// The most recently published report, `None` before the first publish.
    pub(crate) fn get(&self) -> Option<T> {
        let current = self.current.load(Ordering::Acquire);
        self.slots[current].lock().clone()
    }
}

/// Aggregate session statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Sources that are validated and have not left.
    pub active_sources: u32,
    /// Sources we have seen RTP data or an SR from.
    pub sender_sources: u32,
    /// Running average compound RTCP packet size including lower-layer
    /// overhead, 0 until the first RTCP packet arrives.
    pub avg_rtcp_packet_size: u32,
    /// Configured session bandwidth in bits per second.
    pub bandwidth: f64,
    /// Configured RTCP bandwidth in bits per second.
    pub rtcp_bandwidth: f64,
}

impl SessionStats {
    /// Exponential moving average with weight 1/16, seeded by the first
    /// sample. RTCP interval computation downstream depends on this exact
    /// formula.
    pub(crate) fn update_avg_rtcp_size(&mut self, size: u32) {
        if self.avg_rtcp_packet_size == 0 {
            self.avg_rtcp_packet_size = size;
        } else {
            self.avg_rtcp_packet_size = (size + 15 * self.avg_rtcp_packet_size) >> 4;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_report_buffer_empty() {
        let buf: ReportBuffer<u32> = ReportBuffer::new();
        assert_eq!(buf.get(), None);
    }

    #[test]
    fn test_report_buffer_publish_and_overwrite() {
        let buf = ReportBuffer::new();
        buf.publish(7u32);
        assert_eq!(buf.get(), Some(7));
        buf.publish(8u32);
        buf.publish(9u32);
        assert_eq!(buf.get(), Some(9));
    }

    #[test]
    fn test_avg_rtcp_size_seeds_then_averages() {
        let mut stats = SessionStats {
            active_sources: 0,
            sender_sources: 0,
            avg_rtcp_packet_size: 0,
            bandwidth: 0.0,
            rtcp_bandwidth: 0.0,
        };
        stats.update_avg_rtcp_size(100);
        assert_eq!(stats.avg_rtcp_packet_size, 100);
        stats.update_avg_rtcp_size(200);
        assert_eq!(stats.avg_rtcp_packet_size, (200 + 15 * 100) >> 4);
    }

    #[test]
    fn test_ext_highest_seq() {
        let mut stats = SourceStats::default();
        assert_eq!(stats.ext_highest_seq(), None);
        stats.cycles = 65536;
        stats.max_seq = 10;
        assert_eq!(stats.ext_highest_seq(), Some(65546));
    }
}
