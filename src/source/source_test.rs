use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use util::marshal::MarshalSize;
use util::sync::Mutex;

use super::*;
use crate::config::SessionConfig;
use crate::stats::ArrivalStats;
use crate::{Result, SessionCallbacks};

const TEST_SSRC: u32 = 0x0102_0304;
const TEST_PT: u8 = 96;
const PAYLOAD_LEN: usize = 16;

struct RecordingCallbacks {
    pushed: Mutex<Vec<u16>>,
    sent: Mutex<Vec<u32>>,
    rate: i32,
}

impl RecordingCallbacks {
    fn new(rate: i32) -> Arc<Self> {
        Arc::new(RecordingCallbacks {
            pushed: Mutex::new(vec![]),
            sent: Mutex::new(vec![]),
            rate,
        })
    }
}

impl SessionCallbacks for RecordingCallbacks {
    fn process_rtp(&self, _source: &Source, pkt: &rtp::packet::Packet) -> Result<()> {
        self.pushed.lock().push(pkt.header.sequence_number);
        Ok(())
    }

    fn send_rtp(&self, _source: &Source, pkt: &rtp::packet::Packet) -> Result<usize> {
        self.sent.lock().push(pkt.header.ssrc);
        Ok(pkt.payload.len())
    }

    fn clock_rate(&self, _payload_type: u8) -> i32 {
        self.rate
    }
}

fn packet(seq: u16, ts: u32) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: TEST_PT,
            sequence_number: seq,
            timestamp: ts,
            ssrc: TEST_SSRC,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0u8; PAYLOAD_LEN]),
    }
}

fn arrival(time: Option<SystemTime>) -> ArrivalStats {
    ArrivalStats {
        time,
        bytes: 12 + PAYLOAD_LEN + 28,
        payload_len: PAYLOAD_LEN,
        address: None,
    }
}

fn new_source(probation: u32, callbacks: Arc<RecordingCallbacks>) -> Source {
    Source::new(
        TEST_SSRC,
        probation,
        false,
        &SessionConfig::default(),
        callbacks,
    )
}

#[test]
fn test_probation_admits_consecutive_packets() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(2, callbacks.clone());

    source.process_rtp(packet(100, 0), &arrival(None))?;
    assert!(!source.is_validated());
    assert!(callbacks.pushed.lock().is_empty());

    source.process_rtp(packet(101, 160), &arrival(None))?;
    assert!(source.is_validated());
    assert!(source.is_sender());
    assert_eq!(*callbacks.pushed.lock(), vec![100, 101]);

    let stats = source.stats();
    assert_eq!(stats.packets_received, 2);
    assert_eq!(stats.octets_received, 2 * PAYLOAD_LEN as u64);
    assert_eq!(stats.base_seq, 101);
    assert_eq!(stats.max_seq, 101);
    Ok(())
}

#[test]
fn test_probation_resets_on_gap() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(2, callbacks.clone());

    source.process_rtp(packet(100, 0), &arrival(None))?;
    source.process_rtp(packet(105, 800), &arrival(None))?;
    assert!(!source.is_validated());
    assert!(callbacks.pushed.lock().is_empty());

    // the queued packet from the failed run must not resurface
    source.process_rtp(packet(106, 960), &arrival(None))?;
    source.process_rtp(packet(107, 1120), &arrival(None))?;
    assert!(source.is_validated());
    assert_eq!(*callbacks.pushed.lock(), vec![106, 107]);
    assert_eq!(source.stats().packets_received, 2);
    Ok(())
}

#[test]
fn test_probation_queue_is_bounded() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let mut config = SessionConfig::default();
    config.max_probation_queue = 4;
    let source = Source::new(TEST_SSRC, 10, false, &config, callbacks.clone());

    for seq in 1..=10u16 {
        source.process_rtp(packet(seq, seq as u32 * 160), &arrival(None))?;
    }

    // only the newest queued packets survive the cap
    assert_eq!(*callbacks.pushed.lock(), vec![6, 7, 8, 9, 10]);
    assert_eq!(source.stats().packets_received, 5);
    Ok(())
}

#[test]
fn test_sequence_wraparound_counts_cycle() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(0, callbacks);

    source.process_rtp(packet(65535, 0), &arrival(None))?;
    source.process_rtp(packet(0, 160), &arrival(None))?;

    let stats = source.stats();
    assert_eq!(stats.cycles, 65536);
    assert_eq!(stats.max_seq, 0);
    assert_eq!(stats.ext_highest_seq(), Some(65536));
    assert_eq!(stats.packets_received, 2);
    Ok(())
}

#[test]
fn test_large_jump_drops_then_resyncs() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(0, callbacks.clone());

    for seq in 98..=100u16 {
        source.process_rtp(packet(seq, 0), &arrival(None))?;
    }
    assert_eq!(source.stats().packets_received, 3);

    // a jump beyond max_dropout is dropped and remembered
    source.process_rtp(packet(5000, 0), &arrival(None))?;
    let stats = source.stats();
    assert_eq!(stats.packets_received, 3);
    assert_eq!(stats.max_seq, 100);
    assert_eq!(stats.bad_seq, 5001);

    // the consecutive follow-up proves a restart and resyncs
    source.process_rtp(packet(5001, 0), &arrival(None))?;
    let stats = source.stats();
    assert_eq!(stats.base_seq, 5001);
    assert_eq!(stats.max_seq, 5001);
    assert_eq!(stats.packets_received, 1);
    assert_eq!(*callbacks.pushed.lock(), vec![98, 99, 100, 5001]);
    Ok(())
}

#[test]
fn test_duplicate_is_counted_without_advancing() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(0, callbacks);

    source.process_rtp(packet(500, 0), &arrival(None))?;
    source.process_rtp(packet(500, 0), &arrival(None))?;

    let stats = source.stats();
    assert_eq!(stats.max_seq, 500);
    assert_eq!(stats.packets_received, 2);
    Ok(())
}

#[test]
fn test_jitter_zero_under_constant_delay() -> Result<()> {
    let callbacks = RecordingCallbacks::new(8000);
    let source = new_source(0, callbacks);

    let t0 = UNIX_EPOCH + Duration::from_secs(1000);
    for i in 0..5u32 {
        let time = t0 + Duration::from_millis(20 * i as u64);
        source.process_rtp(packet(i as u16, 160 * i), &arrival(Some(time)))?;
    }

    assert_eq!(source.stats().jitter, 0);
    Ok(())
}

#[test]
fn test_jitter_grows_on_late_packet() -> Result<()> {
    let callbacks = RecordingCallbacks::new(8000);
    let source = new_source(0, callbacks);

    let t0 = UNIX_EPOCH + Duration::from_secs(1000);
    source.process_rtp(packet(0, 0), &arrival(Some(t0)))?;
    source.process_rtp(
        packet(1, 160),
        &arrival(Some(t0 + Duration::from_millis(20))),
    )?;
    // 40 ms late: transit moves by 320 RTP units
    source.process_rtp(
        packet(2, 320),
        &arrival(Some(t0 + Duration::from_millis(80))),
    )?;

    let stats = source.stats();
    assert_eq!(stats.jitter, 320);
    assert_eq!(stats.jitter >> 4, 20);
    Ok(())
}

#[test]
fn test_jitter_skipped_without_time_or_rate() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(0, callbacks);

    let t0 = UNIX_EPOCH + Duration::from_secs(1000);
    source.process_rtp(packet(0, 0), &arrival(Some(t0)))?;
    source.process_rtp(
        packet(1, 160),
        &arrival(Some(t0 + Duration::from_millis(200))),
    )?;

    let callbacks = RecordingCallbacks::new(8000);
    let timeless = new_source(0, callbacks);
    timeless.process_rtp(packet(0, 0), &arrival(None))?;
    timeless.process_rtp(packet(1, 160), &arrival(None))?;

    assert_eq!(source.stats().jitter, 0);
    assert_eq!(source.stats().transit, None);
    assert_eq!(timeless.stats().jitter, 0);
    assert_eq!(timeless.stats().transit, None);
    Ok(())
}

#[test]
fn test_send_rtp_rewrites_ssrc() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = Source::new(
        TEST_SSRC,
        0,
        true,
        &SessionConfig::default(),
        callbacks.clone(),
    );

    let mut pkt = packet(42, 0);
    pkt.header.ssrc = 999;
    let marshal_size = pkt.marshal_size();
    source.send_rtp(pkt)?;

    assert_eq!(*callbacks.sent.lock(), vec![TEST_SSRC]);
    assert!(source.is_sender());
    let stats = source.stats();
    assert_eq!(stats.packets_sent, 1);
    assert_eq!(stats.octets_sent, PAYLOAD_LEN as u64);
    assert_eq!(stats.bytes_sent, (marshal_size + 28) as u64);
    Ok(())
}

#[test]
fn test_internal_source_never_pushes() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = Source::new(
        TEST_SSRC,
        0,
        true,
        &SessionConfig::default(),
        callbacks.clone(),
    );

    source.process_rtp(packet(1, 0), &arrival(None))?;
    assert!(callbacks.pushed.lock().is_empty());
    Ok(())
}

#[test]
fn test_sender_report_double_buffer() {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(2, callbacks);

    assert_eq!(source.last_sr(), None);
    assert_eq!(source.last_rb(), None);

    source.process_sr(None, 0x0001_0000_0000_0000, 1000, 10, 1600);
    source.process_sr(None, 0x0002_0000_0000_0000, 2000, 20, 3200);
    let sr = source.last_sr().unwrap();
    assert_eq!(sr.ntp_time, 0x0002_0000_0000_0000);
    assert_eq!(sr.rtp_time, 2000);
    assert_eq!(sr.packet_count, 20);
    assert_eq!(sr.octet_count, 3200);
    assert!(source.is_sender());

    source.process_rb(25, 3, 70000, 48, 0x1111_2222, 655);
    let rb = source.last_rb().unwrap();
    assert_eq!(rb.fraction_lost, 25);
    assert_eq!(rb.packets_lost, 3);
    assert_eq!(rb.ext_highest_seq, 70000);
    assert_eq!(rb.jitter, 48);
    assert_eq!(rb.last_sr, 0x1111_2222);
    assert_eq!(rb.delay, 655);
}

#[test]
fn test_bye_is_idempotent_last_reason_wins() {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(0, callbacks);
    source.set_validated();
    assert!(source.is_active());

    source.process_bye("shutting down");
    source.process_bye("really gone");

    assert!(source.received_bye());
    assert!(!source.is_active());
    assert_eq!(source.bye_reason(), Some("really gone".to_string()));
}

#[test]
fn test_csrc_skips_probation() -> Result<()> {
    let callbacks = RecordingCallbacks::new(-1);
    let source = new_source(2, callbacks.clone());
    source.set_as_csrc();
    assert!(source.is_csrc());
    assert!(source.is_validated());

    source.process_rtp(packet(7, 0), &arrival(None))?;
    assert_eq!(*callbacks.pushed.lock(), vec![7]);
    Ok(())
}
