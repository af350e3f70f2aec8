//! MIDI multiplexing against the audio timeline.
//!
//! Wire side: 4-byte USB-MIDI events, carried in fixed 512-byte bulk
//! transfers. Host side: the same 4 bytes plus the host timestamp, crossing
//! the rings as a fixed 12-byte little-endian record.

use crate::context::Ring;
use crate::{MIDI_EVENT_SIZE, USB_BULK_MIDI_SIZE};
use tracing::{debug, error};

/// One MIDI event with the host-clock time it was seen (inbound) or is due
/// (outbound).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    pub time: f64,
    pub bytes: [u8; MIDI_EVENT_SIZE],
}

impl MidiEvent {
    /// Bytes one event occupies on a host ring.
    pub const RING_SIZE: usize = 8 + MIDI_EVENT_SIZE;

    /// Standard voice messages plus single-byte, by USB-MIDI code index.
    pub fn is_voice(bytes: &[u8]) -> bool {
        (0x08..=0x0f).contains(&bytes[0])
    }

    pub fn to_ring_bytes(&self) -> [u8; Self::RING_SIZE] {
        let mut out = [0u8; Self::RING_SIZE];
        out[..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..].copy_from_slice(&self.bytes);
        out
    }

    pub fn from_ring_bytes(raw: &[u8; Self::RING_SIZE]) -> Self {
        let mut time = [0u8; 8];
        time.copy_from_slice(&raw[..8]);
        let mut bytes = [0u8; MIDI_EVENT_SIZE];
        bytes.copy_from_slice(&raw[8..]);
        Self {
            time: f64::from_le_bytes(time),
            bytes,
        }
    }
}

/// Walk one inbound bulk transfer and push every valid event to the host
/// ring, all stamped with the same callback-entry time.
pub(crate) fn forward_inbound(data: &[u8], time: f64, ring: &mut dyn Ring) {
    for chunk in data.chunks_exact(MIDI_EVENT_SIZE) {
        if !MidiEvent::is_voice(chunk) {
            continue;
        }
        let mut bytes = [0u8; MIDI_EVENT_SIZE];
        bytes.copy_from_slice(chunk);
        let event = MidiEvent { time, bytes };
        debug!(
            "o2p midi: {:02x} {:02x} {:02x} {:02x} ({time})",
            bytes[0], bytes[1], bytes[2], bytes[3]
        );
        if ring.write_space() >= MidiEvent::RING_SIZE {
            ring.write(&event.to_ring_bytes());
        } else {
            error!("o2p: midi ring buffer overflow, discarding event");
        }
    }
}

/// One collected outbound batch: `len` wire bytes in the transfer buffer
/// and the seconds to hold off before looking at the ring again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Batch {
    pub len: usize,
    pub diff: f64,
}

/// Batches outbound events against the host clock.
///
/// Events stamped at or before `last_time` accumulate into one transfer;
/// the first later-stamped event closes the batch, carries the wait until
/// its due time, and stays pending so the next batch opens with it.
#[derive(Debug)]
pub(crate) struct OutboundScheduler {
    last_time: f64,
    pending: Option<MidiEvent>,
}

impl OutboundScheduler {
    pub fn new(now: f64) -> Self {
        Self {
            last_time: now,
            pending: None,
        }
    }

    pub fn collect(&mut self, ring: &mut dyn Ring, buf: &mut [u8; USB_BULK_MIDI_SIZE]) -> Batch {
        let mut pos = 0;
        let mut diff = 0.0;
        loop {
            let event = match self.pending.take() {
                Some(event) => event,
                None => {
                    if pos >= buf.len() || ring.read_space() < MidiEvent::RING_SIZE {
                        break;
                    }
                    let mut raw = [0u8; MidiEvent::RING_SIZE];
                    ring.read(&mut raw);
                    MidiEvent::from_ring_bytes(&raw)
                }
            };
            if event.time > self.last_time {
                diff = event.time - self.last_time;
                self.last_time = event.time;
                self.pending = Some(event);
                break;
            }
            if pos == 0 {
                buf.fill(0);
            }
            buf[pos..pos + MIDI_EVENT_SIZE].copy_from_slice(&event.bytes);
            pos += MIDI_EVENT_SIZE;
        }
        Batch { len: pos, diff }
    }
}
