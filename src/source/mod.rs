#[cfg(test)]
mod source_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use util::marshal::MarshalSize;
use util::sync::Mutex;

use crate::config::SessionConfig;
use crate::stats::{
    ArrivalStats, ReceiverReportInfo, ReportBuffer, SenderReportInfo, SourceStats, RTP_SEQ_MOD,
};
use crate::{Result, SessionCallbacks};

/// A participant in an RTP session, identified by its SSRC.
///
/// A source tracks everything the session knows about one participant: the
/// RFC 3550 §6.3 probation and validation state machine, sequence number
/// tracking with wrap detection (A.1), the interarrival jitter estimator
/// (A.8), and the most recent sender/receiver report data. Sources are
/// created by the [`Session`](crate::session::Session) when an unknown SSRC
/// is referenced by RTP or RTCP, and shared out as `Arc` handles.
pub struct Source {
    ssrc: u32,
    /// Whether this is the sending source owned by this endpoint.
    internal: bool,

    max_dropout: u16,
    max_misorder: u16,
    max_probation_queue: usize,
    header_overhead: usize,

    callbacks: Arc<dyn SessionCallbacks + Send + Sync>,
    state: Mutex<SourceState>,
    sender_reports: ReportBuffer<SenderReportInfo>,
    receiver_reports: ReportBuffer<ReceiverReportInfo>,
}

struct SourceState {
    /// Configured probation count, reloaded on a probation violation.
    probation: u32,
    /// Remaining consecutive packets required before validation.
    curr_probation: u32,
    validated: bool,
    is_csrc: bool,
    is_sender: bool,
    received_bye: bool,
    bye_reason: Option<String>,
    cname: Option<String>,

    /// Clock rate for the current payload type, -1 while unresolved.
    clock_rate: i32,
    payload_type: Option<u8>,

    rtp_from: Option<SocketAddr>,
    rtcp_from: Option<SocketAddr>,

    probation_queue: VecDeque<QueuedPacket>,
    stats: SourceStats,
}

struct QueuedPacket {
    pkt: rtp::packet::Packet,
    /// Datagram size including lower-layer overhead, kept so the packet can
    /// be folded into the statistics when probation completes.
    bytes: usize,
}

/// What the sequence machinery decided about an incoming packet.
enum SeqOutcome {
    /// Count the packet and forward it.
    Accept,
    /// Held back in the probation queue.
    Queued,
    /// Dropped; flow continues normally.
    Dropped,
}

impl SourceState {
    /// Establish `seq` as the new sequence baseline and reset the receive
    /// counters, folding any queued probation packets back in.
    fn init_seq(&mut self, seq: u16) {
        self.stats.base_seq = seq;
        self.stats.max_seq = seq;
        self.stats.bad_seq = (RTP_SEQ_MOD + 1) as u32;
        self.stats.cycles = 0;
        self.stats.packets_received = 0;
        self.stats.octets_received = 0;
        self.stats.bytes_received = 0;

        for queued in &self.probation_queue {
            self.stats.packets_received += 1;
            self.stats.octets_received += queued.pkt.payload.len() as u64;
            self.stats.bytes_received += queued.bytes as u64;
        }

        log::debug!("base_seq {}", seq);
    }

    /// RFC 3550 A.1 sequence validation, probation included.
    fn update_receiver_stats(
        &mut self,
        pkt: &rtp::packet::Packet,
        arrival: &ArrivalStats,
        max_dropout: u16,
        max_misorder: u16,
        max_probation_queue: usize,
    ) -> SeqOutcome {
        let seq = pkt.header.sequence_number;

        if self.stats.cycles == -1 {
            log::debug!("received first packet, seq {}", seq);
            self.init_seq(seq);
            // make the first comparison below come out as "expected next"
            self.stats.max_seq = seq.wrapping_sub(1);
            self.curr_probation = self.probation;
        }

        let udelta = seq.wrapping_sub(self.stats.max_seq);

        if self.curr_probation > 0 {
            // while in probation we require consecutive sequence numbers
            if udelta == 1 {
                self.curr_probation -= 1;
                if seq < self.stats.max_seq {
                    self.stats.cycles += RTP_SEQ_MOD;
                }
                self.stats.max_seq = seq;

                if self.curr_probation == 0 {
                    log::debug!("probation done");
                    self.init_seq(seq);
                } else {
                    log::debug!("probation {}: queue packet", self.curr_probation);
                    self.probation_queue.push_back(QueuedPacket {
                        pkt: pkt.clone(),
                        bytes: arrival.bytes,
                    });
                    while self.probation_queue.len() > max_probation_queue {
                        self.probation_queue.pop_front();
                    }
                    return SeqOutcome::Queued;
                }
            } else {
                log::warn!(
                    "probation: seq {} != expected {}",
                    seq,
                    self.stats.max_seq.wrapping_add(1)
                );
                self.curr_probation = self.probation;
                self.stats.max_seq = seq;
                self.probation_queue.clear();
                return SeqOutcome::Dropped;
            }
        } else if udelta < max_dropout {
            // in order, with permissible gap
            self.stats.bad_seq = (RTP_SEQ_MOD + 1) as u32;
            self.probation_queue.clear();
            if seq < self.stats.max_seq {
                // sequence number wrapped, count another 64K cycle
                self.stats.cycles += RTP_SEQ_MOD;
            }
            self.stats.max_seq = seq;
        } else if (udelta as i64) < RTP_SEQ_MOD - max_misorder as i64 {
            // the sequence number made a very large jump
            if u32::from(seq) == self.stats.bad_seq {
                // two sequential packets: the other side probably restarted
                // without telling us, re-sync as if this was the first packet
                self.init_seq(seq);
            } else {
                log::warn!("unacceptable seq {} (delta {})", seq, udelta);
                self.stats.bad_seq = u32::from(seq.wrapping_add(1));
                return SeqOutcome::Dropped;
            }
        } else {
            // duplicate or reordered packet, a downstream reordering buffer
            // is expected to filter these
            self.stats.bad_seq = (RTP_SEQ_MOD + 1) as u32;
            log::debug!(
                "duplicate or reordered packet (seq {}, expected {})",
                seq,
                self.stats.max_seq.wrapping_add(1)
            );
        }

        self.stats.packets_received += 1;
        self.stats.octets_received += pkt.payload.len() as u64;
        self.stats.bytes_received += arrival.bytes as u64;

        log::trace!(
            "seq {}, packets {}, octets {}",
            seq,
            self.stats.packets_received,
            self.stats.octets_received
        );

        SeqOutcome::Accept
    }

    /// RFC 3550 A.8 interarrival jitter. Skipped without error when no
    /// arrival time is available or the clock rate is unresolved.
    fn calculate_jitter(&mut self, pkt: &rtp::packet::Packet, arrival: &ArrivalStats) {
        let time = match arrival.time {
            Some(time) => time,
            None => return,
        };
        if self.clock_rate <= 0 {
            return;
        }
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_nanos(),
            Err(_) => return,
        };

        // arrival time in RTP timestamp units, truncated to 32 bits; only
        // differences matter
        let rtp_arrival = (nanos * self.clock_rate as u128 / 1_000_000_000) as u32;
        let transit = rtp_arrival.wrapping_sub(pkt.header.timestamp);

        let diff = match self.stats.transit {
            Some(prev) => {
                if transit > prev {
                    transit - prev
                } else {
                    prev - transit
                }
            }
            None => 0,
        };
        self.stats.transit = Some(transit);

        // the stored value is scaled by 16 to keep precision
        self.stats.jitter = self
            .stats
            .jitter
            .wrapping_add(diff)
            .wrapping_sub(self.stats.jitter.wrapping_add(8) >> 4);

        log::trace!(
            "rtp_arrival {}, rtp_time {}, diff {}, jitter {}",
            rtp_arrival,
            pkt.header.timestamp,
            diff,
            self.stats.jitter >> 4
        );
    }
}

impl Source {
    pub(crate) fn new(
        ssrc: u32,
        probation: u32,
        internal: bool,
        config: &SessionConfig,
        callbacks: Arc<dyn SessionCallbacks + Send + Sync>,
    ) -> Self {
        Source {
            ssrc,
            internal,
            max_dropout: config.max_dropout,
            max_misorder: config.max_misorder,
            max_probation_queue: config.max_probation_queue,
            header_overhead: config.header_overhead,
            callbacks,
            state: Mutex::new(SourceState {
                probation,
                curr_probation: probation,
                validated: internal,
                is_csrc: false,
                is_sender: false,
                received_bye: false,
                bye_reason: None,
                cname: None,
                clock_rate: -1,
                payload_type: None,
                rtp_from: None,
                rtcp_from: None,
                probation_queue: VecDeque::new(),
                stats: SourceStats::default(),
            }),
            sender_reports: ReportBuffer::new(),
            receiver_reports: ReportBuffer::new(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Whether this is the sending source owned by this endpoint.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_validated(&self) -> bool {
        self.state.lock().validated
    }

    pub fn is_sender(&self) -> bool {
        self.state.lock().is_sender
    }

    pub fn is_csrc(&self) -> bool {
        self.state.lock().is_csrc
    }

    /// Validated and has not left the session.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.validated && !state.received_bye
    }

    pub fn received_bye(&self) -> bool {
        self.state.lock().received_bye
    }

    pub fn bye_reason(&self) -> Option<String> {
        self.state.lock().bye_reason.clone()
    }

    pub fn cname(&self) -> Option<String> {
        self.state.lock().cname.clone()
    }

    /// Snapshot of the source statistics.
    pub fn stats(&self) -> SourceStats {
        self.state.lock().stats.clone()
    }

    pub(crate) fn set_cname(&self, cname: &str) {
        self.state.lock().cname = Some(cname.to_string());
    }

    /// Mark as a contributing source; CSRCs skip probation entirely.
    pub(crate) fn set_as_csrc(&self) {
        let mut state = self.state.lock();
        state.is_csrc = true;
        state.validated = true;
        state.probation = 0;
        state.curr_probation = 0;
    }

    pub(crate) fn set_validated(&self) {
        self.state.lock().validated = true;
    }

    pub(crate) fn rtp_from(&self) -> Option<SocketAddr> {
        self.state.lock().rtp_from
    }

    pub(crate) fn rtcp_from(&self) -> Option<SocketAddr> {
        self.state.lock().rtcp_from
    }

    pub(crate) fn set_rtp_from(&self, addr: SocketAddr) {
        self.state.lock().rtp_from = Some(addr);
    }

    pub(crate) fn set_rtcp_from(&self, addr: SocketAddr) {
        self.state.lock().rtcp_from = Some(addr);
    }

    /// Handle an incoming RTP packet for this source.
    ///
    /// The packet has already passed structural validation. Sequence
    /// anomalies are policy decisions (queue, drop, accept), never errors;
    /// the only failure that propagates is a failing push callback.
    pub fn process_rtp(&self, pkt: rtp::packet::Packet, arrival: &ArrivalStats) -> Result<()> {
        let flushed: Vec<QueuedPacket> = {
            let mut state = self.state.lock();

            // resolve the clock rate whenever the payload type changes
            let pt = pkt.header.payload_type;
            if state.payload_type != Some(pt) {
                let clock_rate = self.callbacks.clock_rate(pt);
                log::debug!("new payload type {}, clock-rate {}", pt, clock_rate);
                state.payload_type = Some(pt);
                state.clock_rate = clock_rate;
            }

            match state.update_receiver_stats(
                &pkt,
                arrival,
                self.max_dropout,
                self.max_misorder,
                self.max_probation_queue,
            ) {
                SeqOutcome::Queued | SeqOutcome::Dropped => return Ok(()),
                SeqOutcome::Accept => {}
            }

            // the source that sent a valid packet is a validated sender
            state.is_sender = true;
            state.validated = true;

            state.calculate_jitter(&pkt, arrival);

            state.probation_queue.drain(..).collect()
        };

        // deliver packets held during probation first, oldest first
        for queued in &flushed {
            self.push(&queued.pkt)?;
        }
        self.push(&pkt)
    }

    fn push(&self, pkt: &rtp::packet::Packet) -> Result<()> {
        if self.internal {
            // we do not receive from ourselves
            log::warn!("internal source {:08x} cannot receive", self.ssrc);
            return Ok(());
        }
        self.callbacks.process_rtp(self, pkt)
    }

    /// Send a packet originating from this source. The SSRC in the header is
    /// rewritten when it differs; the packet is owned here, so the rewrite
    /// never aliases a buffer the caller still holds.
    pub fn send_rtp(&self, mut pkt: rtp::packet::Packet) -> Result<usize> {
        if pkt.header.ssrc != self.ssrc {
            pkt.header.ssrc = self.ssrc;
        }
        {
            let mut state = self.state.lock();
            state.is_sender = true;
            state.stats.packets_sent += 1;
            state.stats.octets_sent += pkt.payload.len() as u64;
            state.stats.bytes_sent += (pkt.marshal_size() + self.header_overhead) as u64;
        }
        self.callbacks.send_rtp(self, &pkt)
    }

    /// Mark this source as having left the session. Idempotent; the last
    /// reason wins.
    pub fn process_bye(&self, reason: &str) {
        log::debug!("marking SSRC {:08x} as BYE, reason: {}", self.ssrc, reason);
        let mut state = self.state.lock();
        state.received_bye = true;
        state.bye_reason = Some(reason.to_string());
    }

    /// Record the sender info of a received SR.
    pub fn process_sr(
        &self,
        time: Option<std::time::SystemTime>,
        ntp_time: u64,
        rtp_time: u32,
        packet_count: u32,
        octet_count: u32,
    ) {
        log::debug!(
            "got SR: SSRC {:08x}, NTP {:08x}:{:08x}, RTP {}, PC {}, OC {}",
            self.ssrc,
            (ntp_time >> 32) as u32,
            (ntp_time & 0xffff_ffff) as u32,
            rtp_time,
            packet_count,
            octet_count
        );
        self.state.lock().is_sender = true;
        self.sender_reports.publish(SenderReportInfo {
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            time,
        });
    }

    /// Record a report block this source sent about our own stream.
    pub fn process_rb(
        &self,
        fraction_lost: u8,
        packets_lost: u32,
        ext_highest_seq: u32,
        jitter: u32,
        last_sr: u32,
        delay: u32,
    ) {
        log::debug!(
            "got RB: SSRC {:08x}, FL {}, PL {}, HS {}, jitter {}",
            self.ssrc,
            fraction_lost,
            packets_lost,
            ext_highest_seq,
            jitter
        );
        self.receiver_reports.publish(ReceiverReportInfo {
            fraction_lost,
            packets_lost,
            ext_highest_seq,
            jitter,
            last_sr,
            delay,
        });
    }

    /// The most recent sender report, `None` until one was received. Safe to
    /// call concurrently with report processing.
    pub fn last_sr(&self) -> Option<SenderReportInfo> {
        self.sender_reports.get()
    }

    /// The most recent report block about our stream, `None` until one was
    /// received.
    pub fn last_rb(&self) -> Option<ReceiverReportInfo> {
        self.receiver_reports.get()
    }
}
