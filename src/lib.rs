//! Transport engine for Overbridge-class USB audio/MIDI hardware.
//!
//! The device side speaks a framed alternate setting: interrupt transfers
//! of big-endian 32-bit PCM blocks, plus bulk transfers of 4-byte USB-MIDI
//! events. The host side is a pair of lock-free float rings and a pair of
//! MIDI rings owned by the audio adapter. This crate owns everything in
//! between: the overlapping USB transfers, the block codec, MIDI
//! timestamping and pacing, drift recovery hooks, and the two realtime
//! driver threads.

pub mod blocks;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod midi;
mod mutex;
mod resample;
pub mod rt;
mod usb;

pub use context::{Clock, Context, Dll, Options, Ring, RtPriorityHook};
pub use device::DeviceDesc;
pub use engine::{Engine, Status};
pub use error::Error;
pub use midi::MidiEvent;

/// Frames in one wire block. Fixed by the device protocol.
pub const FRAMES_PER_BLOCK: usize = 7;

/// Device sample rate; the alternate setting only streams at this rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Bytes in one USB-MIDI event.
pub const MIDI_EVENT_SIZE: usize = 4;

/// Fixed size of every bulk MIDI transfer, in either direction.
pub const USB_BULK_MIDI_SIZE: usize = 512;

pub(crate) const SAMPLE_TIME_NS: f64 = 1e9 / SAMPLE_RATE as f64;

pub(crate) const DUMP_BLOCKS_ENV: &str = "OVERBRIDGE_DUMP_BLOCKS";

pub(crate) fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}
