#![allow(dead_code)]

use rand::prelude::*;
use rand_xoshiro::Xoshiro128StarStar;
use std::{
    collections::VecDeque,
    io::{Error, ErrorKind, Result},
    sync::Once,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usbh_midi::MidiPipe;

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

/// Simulated MIDI streaming endpoints.
///
/// In loopback mode every transfer written is queued to be read back, like a device
/// with its MIDI OUT jack patched to its MIDI IN jack.
#[derive(Debug)]
pub struct MockPipe {
    pub incoming: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub max_packet_size: usize,
    pub loopback: bool,
    pub fail: Option<ErrorKind>,
}

impl MockPipe {
    pub fn new(max_packet_size: usize) -> Self {
        Self { incoming: VecDeque::new(), sent: Vec::new(), max_packet_size, loopback: false, fail: None }
    }

    pub fn loopback(max_packet_size: usize) -> Self {
        Self { loopback: true, ..Self::new(max_packet_size) }
    }

    pub fn with_incoming(mut self, transfer: &[u8]) -> Self {
        self.incoming.push_back(transfer.to_vec());
        self
    }
}

impl MidiPipe for MockPipe {
    fn read_packets(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(kind) = self.fail {
            return Err(Error::new(kind, "simulated transfer failure"));
        }

        let Some(data) = self.incoming.pop_front() else { return Ok(0) };
        assert!(data.len() <= buf.len(), "transfer of {} bytes exceeds receive buffer", data.len());
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn write_packets(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(kind) = self.fail {
            return Err(Error::new(kind, "simulated transfer failure"));
        }

        assert!(data.len() <= self.max_packet_size.max(4), "transfer exceeds max packet size");
        if self.loopback {
            self.incoming.push_back(data.to_vec());
        }
        self.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

/// Generates SysEx messages with seeded random content.
pub struct TestData {
    rng: Xoshiro128StarStar,
    pre_lengths: VecDeque<usize>,
}

impl TestData {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Xoshiro128StarStar::seed_from_u64(seed),
            pre_lengths: [2, 3, 4, 5, 6, 7, 47, 48, 49, 50, 63, 64, 65, 255, 256].into(),
        }
    }

    /// Total message length, including start and end byte.
    pub fn next_len(&mut self, max_len: usize) -> usize {
        match self.pre_lengths.pop_front() {
            Some(len) => len,
            None => self.rng.random_range(2..=max_len),
        }
    }

    pub fn sysex(&mut self, len: usize) -> Vec<u8> {
        let mut data = vec![0xf0];
        data.extend((2..len).map(|_| self.rng.random_range(0..0x80u8)));
        data.push(0xf7);
        data
    }
}
