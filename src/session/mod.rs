
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rtcp::goodbye::Goodbye;
use rtcp::header::PacketType;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescription};
use util::marshal::Unmarshal;
use util::sync::Mutex;

use crate::config::SessionConfig;
use crate::source::Source;
use crate::stats::{ArrivalStats, SessionStats};
use crate::{Error, Result, SessionCallbacks, SessionObserver};

/// An RTP session: the table of participants and the aggregate statistics
/// RTCP scheduling feeds on.
///
/// The session is driven entirely by its caller. The transport feeds raw
/// datagrams into [`process_rtp`](Session::process_rtp) and
/// [`process_rtcp`](Session::process_rtcp), the application sends through
/// [`send_rtp`](Session::send_rtp), and everything flowing the other way goes
/// through the [`SessionCallbacks`] given at construction. All entry points
/// may be called from any thread.
pub struct Session {
    config: SessionConfig,
    callbacks: Arc<dyn SessionCallbacks + Send + Sync>,
    observers: Mutex<Vec<Arc<dyn SessionObserver + Send + Sync>>>,
    local_source: Arc<Source>,
    internal: Mutex<SessionInternal>,
}

struct SessionInternal {
    sources: HashMap<u32, Arc<Source>>,
    /// CNAME to SSRC, filled from SDES chunks.
    cnames: HashMap<String, u32>,
    /// Sources ever created, including removed ones.
    total_sources: u32,
    stats: SessionStats,
    ssrc_rng: StdRng,
}

/// Lifecycle notifications collected under the session lock and fired after
/// it is released, in the order the transitions happened.
enum SourceEvent {
    NewSsrc(Arc<Source>),
    Collision(Arc<Source>),
    Validated(Arc<Source>),
    Bye(Arc<Source>),
}

impl Session {
    pub fn new(
        config: SessionConfig,
        callbacks: Arc<dyn SessionCallbacks + Send + Sync>,
    ) -> Result<Self> {
        let seed = config.ssrc_seed.unwrap_or_else(rand::random);
        let mut ssrc_rng = StdRng::seed_from_u64(seed);
        let ssrc = ssrc_rng.next_u32();

        let local_source = Arc::new(Source::new(ssrc, 0, true, &config, Arc::clone(&callbacks)));
        log::debug!("created session, SSRC {:08x}", ssrc);

        let mut sources = HashMap::new();
        sources.insert(ssrc, Arc::clone(&local_source));

        let stats = SessionStats {
            // the local source is validated from the start
            active_sources: 1,
            sender_sources: 0,
            avg_rtcp_packet_size: 0,
            bandwidth: config.bandwidth,
            rtcp_bandwidth: config.rtcp_bandwidth,
        };

        Ok(Session {
            config,
            callbacks,
            observers: Mutex::new(vec![]),
            local_source,
            internal: Mutex::new(SessionInternal {
                sources,
                cnames: HashMap::new(),
                total_sources: 1,
                stats,
                ssrc_rng,
            }),
        })
    }

    /// The sending source owned by this endpoint.
    pub fn local_source(&self) -> Arc<Source> {
        Arc::clone(&self.local_source)
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver + Send + Sync>) {
        self.observers.lock().push(observer);
    }

    /// Sources currently known, the local one included.
    pub fn num_sources(&self) -> usize {
        self.internal.lock().sources.len()
    }

    /// Validated sources that have not left the session.
    pub fn num_active_sources(&self) -> u32 {
        self.internal.lock().stats.active_sources
    }

    /// Sources ever created over the lifetime of the session.
    pub fn total_sources(&self) -> u32 {
        self.internal.lock().total_sources
    }

    pub fn source_by_ssrc(&self, ssrc: u32) -> Option<Arc<Source>> {
        self.internal.lock().sources.get(&ssrc).cloned()
    }

    pub fn source_by_cname(&self, cname: &str) -> Option<Arc<Source>> {
        let internal = self.internal.lock();
        let ssrc = internal.cnames.get(cname)?;
        internal.sources.get(ssrc).cloned()
    }

    pub fn bandwidth(&self) -> f64 {
        self.internal.lock().stats.bandwidth
    }

    pub fn set_bandwidth(&self, bandwidth: f64) {
        self.internal.lock().stats.bandwidth = bandwidth;
    }

    pub fn rtcp_bandwidth(&self) -> f64 {
        self.internal.lock().stats.rtcp_bandwidth
    }

    pub fn set_rtcp_bandwidth(&self, bandwidth: f64) {
        self.internal.lock().stats.rtcp_bandwidth = bandwidth;
    }

    /// Snapshot of the aggregate session statistics.
    pub fn stats(&self) -> SessionStats {
        self.internal.lock().stats.clone()
    }

    fn new_unique_ssrc(internal: &mut SessionInternal, max_retries: usize) -> Result<u32> {
        for _ in 0..max_retries {
            let ssrc = internal.ssrc_rng.next_u32();
            if !internal.sources.contains_key(&ssrc) {
                return Ok(ssrc);
            }
        }
        Err(Error::ErrSsrcExhausted)
    }

    /// Create a new source with a freshly allocated unique SSRC and add it to
    /// the session. The source goes through the normal probation before it
    /// validates.
    pub fn create_source(&self) -> Result<Arc<Source>> {
        let source = {
            let mut internal = self.internal.lock();
            let ssrc = Self::new_unique_ssrc(&mut internal, self.config.max_ssrc_retries)?;
            let source = Arc::new(Source::new(
                ssrc,
                self.config.probation,
                false,
                &self.config,
                Arc::clone(&self.callbacks),
            ));
            internal.sources.insert(ssrc, Arc::clone(&source));
            internal.total_sources += 1;
            source
        };
        self.fire(vec![SourceEvent::NewSsrc(Arc::clone(&source))]);
        Ok(source)
    }

    /// Verify that the packet at hand is consistent with what we know about
    /// the source, recording transport addresses along the way.
    ///
    /// Returns true when the packet must be discarded because of an SSRC
    /// collision. Third-party collision detection is not implemented, so
    /// today this only tracks addresses and never reports a collision.
    fn check_collision(source: &Arc<Source>, arrival: &ArrivalStats, is_rtp: bool) -> bool {
        let addr = match arrival.address {
            Some(addr) => addr,
            None => return false,
        };
        let known = if is_rtp {
            source.rtp_from()
        } else {
            source.rtcp_from()
        };
        match known {
            None => {
                if is_rtp {
                    source.set_rtp_from(addr);
                } else {
                    source.set_rtcp_from(addr);
                }
            }
            Some(prev) if prev != addr => {
                // an address change would feed real collision detection; for
                // now the first recorded address stays authoritative
                log::debug!(
                    "SSRC {:08x} now seen from {}, first seen from {}",
                    source.ssrc(),
                    addr,
                    prev
                );
            }
            _ => {}
        }
        false
    }

    /// Look up or create the source for `ssrc`. Returns `None` when the
    /// packet collides and must be dropped; the bool is true when the source
    /// was just created.
    fn obtain_source(
        &self,
        internal: &mut SessionInternal,
        ssrc: u32,
        arrival: &ArrivalStats,
        is_rtp: bool,
    ) -> Option<(Arc<Source>, bool)> {
        if let Some(source) = internal.sources.get(&ssrc) {
            let source = Arc::clone(source);
            if Self::check_collision(&source, arrival, is_rtp) {
                return None;
            }
            return Some((source, false));
        }

        // RTP sources start on probation, sources first seen through RTCP
        // validate through other means
        let probation = if is_rtp { self.config.probation } else { 0 };
        let source = Arc::new(Source::new(
            ssrc,
            probation,
            false,
            &self.config,
            Arc::clone(&self.callbacks),
        ));
        Self::check_collision(&source, arrival, is_rtp);
        log::debug!("creating source {:08x} (rtp: {})", ssrc, is_rtp);
        internal.sources.insert(ssrc, Arc::clone(&source));
        internal.total_sources += 1;
        Some((source, true))
    }

    /// Feed a raw RTP datagram received from the network into the session.
    ///
    /// Malformed packets are logged and dropped without error; an `Err` only
    /// reflects a failing application callback.
    pub fn process_rtp(&self, raw: &Bytes, from: Option<SocketAddr>) -> Result<()> {
        let mut buf = raw.clone();
        let pkt = match rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::debug!("invalid RTP packet dropped: {}", err);
                return Ok(());
            }
        };

        let arrival = ArrivalStats {
            time: self.callbacks.get_time(),
            bytes: raw.len() + self.config.header_overhead,
            payload_len: pkt.payload.len(),
            address: from,
        };

        let mut events = vec![];
        let result = {
            let mut internal = self.internal.lock();

            if self.local_source.received_bye() {
                log::debug!("ignoring RTP while leaving the session");
                return Ok(());
            }

            let ssrc = pkt.header.ssrc;
            let (source, created) = match self.obtain_source(&mut internal, ssrc, &arrival, true) {
                Some(obtained) => obtained,
                None => {
                    drop(internal);
                    self.fire(vec![SourceEvent::Collision(Arc::clone(&self.local_source))]);
                    return Ok(());
                }
            };

            let csrcs = pkt.header.csrc.clone();
            let prev_sender = source.is_sender();
            let prev_validated = source.is_validated();

            let result = source.process_rtp(pkt, &arrival);

            if !prev_sender && source.is_sender() {
                internal.stats.sender_sources += 1;
            }
            if created {
                events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
            }
            if !prev_validated && source.is_validated() {
                internal.stats.active_sources += 1;
                events.push(SourceEvent::Validated(Arc::clone(&source)));
            }

            // contributing sources named by a validated packet are known to
            // exist and skip probation
            if source.is_validated() {
                for csrc in csrcs {
                    self.register_csrc(&mut internal, csrc, &arrival, &mut events);
                }
            }

            result
        };

        self.fire(events);
        result
    }

    fn register_csrc(
        &self,
        internal: &mut SessionInternal,
        csrc: u32,
        arrival: &ArrivalStats,
        events: &mut Vec<SourceEvent>,
    ) {
        let (source, created) = match self.obtain_source(internal, csrc, arrival, true) {
            Some(obtained) => obtained,
            None => return,
        };
        if source.is_csrc() {
            return;
        }
        let was_validated = source.is_validated();
        source.set_as_csrc();
        log::debug!("source {:08x} is a CSRC", csrc);
        if created {
            events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
        }
        if !was_validated {
            internal.stats.active_sources += 1;
            events.push(SourceEvent::Validated(source));
        }
    }

    /// Feed a raw RTCP datagram received from the network into the session.
    ///
    /// The compound packet is taken apart and each part dispatched to the
    /// source it concerns. Malformed packets are logged and dropped without
    /// error.
    pub fn process_rtcp(&self, raw: &Bytes, from: Option<SocketAddr>) -> Result<()> {
        let mut buf = raw.clone();
        let pkts = match rtcp::packet::unmarshal(&mut buf) {
            Ok(pkts) => pkts,
            Err(err) => {
                log::debug!("invalid RTCP packet dropped: {}", err);
                return Ok(());
            }
        };

        let arrival = ArrivalStats {
            time: self.callbacks.get_time(),
            bytes: raw.len() + self.config.header_overhead,
            payload_len: 0,
            address: from,
        };

        let mut events = vec![];
        {
            let mut internal = self.internal.lock();

            internal.stats.update_avg_rtcp_size(arrival.bytes as u32);

            for pkt in &pkts {
                if let Some(sr) = pkt.as_any().downcast_ref::<SenderReport>() {
                    self.process_sr(&mut internal, sr, &arrival, &mut events);
                } else if let Some(rr) = pkt.as_any().downcast_ref::<ReceiverReport>() {
                    self.process_rr(&mut internal, rr, &arrival, &mut events);
                } else if let Some(sdes) = pkt.as_any().downcast_ref::<SourceDescription>() {
                    self.process_sdes(&mut internal, sdes, &arrival, &mut events);
                } else if let Some(bye) = pkt.as_any().downcast_ref::<Goodbye>() {
                    self.process_bye(&mut internal, bye, &arrival, &mut events);
                } else {
                    match pkt.header().packet_type {
                        PacketType::ApplicationDefined => {
                            log::debug!("received APP packet, ignoring");
                        }
                        PacketType::TransportSpecificFeedback
                        | PacketType::PayloadSpecificFeedback => {
                            log::trace!("received feedback packet, ignoring");
                        }
                        other => {
                            log::warn!("unknown RTCP packet type {}, ignoring", other);
                        }
                    }
                }
            }
        }

        self.fire(events);
        Ok(())
    }

    fn process_sr(
        &self,
        internal: &mut SessionInternal,
        sr: &SenderReport,
        arrival: &ArrivalStats,
        events: &mut Vec<SourceEvent>,
    ) {
        let (source, created) = match self.obtain_source(internal, sr.ssrc, arrival, false) {
            Some(obtained) => obtained,
            None => return,
        };

        let prev_sender = source.is_sender();
        source.process_sr(
            arrival.time,
            sr.ntp_time,
            sr.rtp_time,
            sr.packet_count,
            sr.octet_count,
        );
        if !prev_sender {
            internal.stats.sender_sources += 1;
        }
        if created {
            events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
        }

        self.process_report_blocks(&source, &sr.reports);
    }

    fn process_rr(
        &self,
        internal: &mut SessionInternal,
        rr: &ReceiverReport,
        arrival: &ArrivalStats,
        events: &mut Vec<SourceEvent>,
    ) {
        let (source, created) = match self.obtain_source(internal, rr.ssrc, arrival, false) {
            Some(obtained) => obtained,
            None => return,
        };
        if created {
            events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
        }

        self.process_report_blocks(&source, &rr.reports);
    }

    /// Record the report blocks that talk about our own stream on the source
    /// that reported them.
    fn process_report_blocks(&self, reporter: &Arc<Source>, reports: &[ReceptionReport]) {
        for rb in reports {
            if rb.ssrc != self.local_source.ssrc() {
                continue;
            }
            reporter.process_rb(
                rb.fraction_lost,
                rb.total_lost,
                rb.last_sequence_number,
                rb.jitter,
                rb.last_sender_report,
                rb.delay,
            );
        }
    }

    fn process_sdes(
        &self,
        internal: &mut SessionInternal,
        sdes: &SourceDescription,
        arrival: &ArrivalStats,
        events: &mut Vec<SourceEvent>,
    ) {
        for chunk in &sdes.chunks {
            let (source, created) = match self.obtain_source(internal, chunk.source, arrival, false)
            {
                Some(obtained) => obtained,
                None => continue,
            };
            if created {
                events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
            }

            for item in &chunk.items {
                if item.sdes_type != SdesType::SdesCname {
                    continue;
                }
                let cname = String::from_utf8_lossy(&item.text).into_owned();
                log::debug!("SSRC {:08x} CNAME {}", chunk.source, cname);
                source.set_cname(&cname);
                internal.cnames.insert(cname, chunk.source);

                // a participant that describes itself is a real participant
                if !source.is_validated() {
                    source.set_validated();
                    internal.stats.active_sources += 1;
                    events.push(SourceEvent::Validated(Arc::clone(&source)));
                }
            }
        }
    }

    fn process_bye(
        &self,
        internal: &mut SessionInternal,
        bye: &Goodbye,
        arrival: &ArrivalStats,
        events: &mut Vec<SourceEvent>,
    ) {
        let reason = String::from_utf8_lossy(&bye.reason).into_owned();

        for &ssrc in &bye.sources {
            if ssrc == self.local_source.ssrc() {
                log::debug!("ignoring BYE for own SSRC {:08x}", ssrc);
                continue;
            }
            let (source, created) = match self.obtain_source(internal, ssrc, arrival, false) {
                Some(obtained) => obtained,
                None => continue,
            };
            if created {
                events.push(SourceEvent::NewSsrc(Arc::clone(&source)));
            }

            let was_active = source.is_active();
            source.process_bye(&reason);
            if was_active {
                internal.stats.active_sources = internal.stats.active_sources.saturating_sub(1);
            }
            events.push(SourceEvent::Bye(source));
        }
    }

    /// Send an RTP packet as the local source. The header SSRC is rewritten
    /// to the local SSRC when it differs.
    pub fn send_rtp(&self, pkt: rtp::packet::Packet) -> Result<usize> {
        let was_sender = self.local_source.is_sender();
        let n = self.local_source.send_rtp(pkt)?;
        if !was_sender {
            self.internal.lock().stats.sender_sources += 1;
        }
        Ok(n)
    }

    /// Remove a source from the session, fixing up the aggregate counters.
    /// The local source cannot be removed.
    pub fn remove_source(&self, ssrc: u32) -> Option<Arc<Source>> {
        if ssrc == self.local_source.ssrc() {
            return None;
        }
        let mut internal = self.internal.lock();
        let source = internal.sources.remove(&ssrc)?;
        if let Some(cname) = source.cname() {
            if internal.cnames.get(&cname) == Some(&ssrc) {
                internal.cnames.remove(&cname);
            }
        }
        if source.is_active() {
            internal.stats.active_sources = internal.stats.active_sources.saturating_sub(1);
        }
        if source.is_sender() {
            internal.stats.sender_sources = internal.stats.sender_sources.saturating_sub(1);
        }
        log::debug!("removed source {:08x}", ssrc);
        Some(source)
    }

    fn fire(&self, events: Vec<SourceEvent>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.lock().clone();
        for event in &events {
            for observer in &observers {
                match event {
                    SourceEvent::NewSsrc(source) => observer.on_new_ssrc(source),
                    SourceEvent::Collision(source) => observer.on_ssrc_collision(source),
                    SourceEvent::Validated(source) => observer.on_ssrc_validated(source),
                    SourceEvent::Bye(source) => observer.on_bye_ssrc(source),
                }
            }
        }
    }
}
