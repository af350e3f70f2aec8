//! Seams between the engine and its host-side collaborators.
//!
//! The host owns the ring buffers, the clock, and (optionally) the clock
//! recovery state; the engine only ever talks to them through the traits
//! here. Activation validates that everything an enabled option needs is
//! actually present and names the missing piece in the error.

use crate::error::Error;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Which directions the engine drives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Options: u32 {
        const O2P_AUDIO = 1 << 0;
        const P2O_AUDIO = 1 << 1;
        const O2P_MIDI = 1 << 2;
        const P2O_MIDI = 1 << 3;
        const DLL = 1 << 4;
    }
}

/// One side of a lock-free single-producer/single-consumer byte ring.
///
/// Non-blocking by contract: the engine reacts to the reported space, it
/// never waits on a ring. The engine is the producer of `o2p_*` rings and
/// the consumer of `p2o_*` rings.
pub trait Ring: Send {
    fn read_space(&self) -> usize;
    fn write_space(&self) -> usize;
    /// Read exactly `dst.len()` bytes; returns the bytes actually read.
    fn read(&mut self, dst: &mut [u8]) -> usize;
    /// Discard `bytes` bytes; returns the bytes actually discarded.
    fn skip(&mut self, bytes: usize) -> usize;
    /// Write exactly `src.len()` bytes; returns the bytes actually written.
    fn write(&mut self, src: &[u8]) -> usize;
}

/// Host clock, in seconds. Shared by both driver threads.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Delay-locked loop the host uses to line its callback clock up with the
/// device sample clock. Opaque state; the engine only initializes it per
/// boot and feeds it one increment per inbound transfer, always under the
/// engine state lock.
pub trait Dll: Send {
    fn init(&mut self, sample_rate: u32, frames_per_transfer: usize, now: f64);
    fn increment(&mut self, frames_per_transfer: usize, now: f64);
    /// Whether the loop has settled. The engine holds the inbound path in
    /// its warm-up state until this reports true, and falls back to a
    /// re-boot when it goes false again.
    fn locked(&self) -> bool {
        true
    }
}

/// Hook that raises the calling thread to realtime priority. A default is
/// installed when the host leaves it out.
pub type RtPriorityHook = dyn Fn(i32) -> Result<(), String> + Send + Sync;

/// Everything the host hands over on activation.
pub struct Context {
    pub options: Options,
    pub p2o_audio: Option<Box<dyn Ring>>,
    pub o2p_audio: Option<Box<dyn Ring>>,
    pub p2o_midi: Option<Box<dyn Ring>>,
    pub o2p_midi: Option<Box<dyn Ring>>,
    pub clock: Option<Arc<dyn Clock>>,
    pub dll: Option<Box<dyn Dll>>,
    pub set_rt_priority: Option<Arc<RtPriorityHook>>,
    pub priority: Option<i32>,
}

impl Context {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            p2o_audio: None,
            o2p_audio: None,
            p2o_midi: None,
            o2p_midi: None,
            clock: None,
            dll: None,
            set_rt_priority: None,
            priority: None,
        }
    }

    /// Check that every field an enabled option relies on is present.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.options.is_empty() {
            return Err(Error::Generic);
        }
        if self.options.contains(Options::O2P_AUDIO) && self.o2p_audio.is_none() {
            return Err(Error::NoO2pAudioBuf);
        }
        if self.options.contains(Options::P2O_AUDIO) && self.p2o_audio.is_none() {
            return Err(Error::NoP2oAudioBuf);
        }
        if self.options.contains(Options::O2P_MIDI) {
            if self.clock.is_none() {
                return Err(Error::NoGetTime);
            }
            if self.o2p_midi.is_none() {
                return Err(Error::NoO2pMidiBuf);
            }
        }
        if self.options.contains(Options::P2O_MIDI) {
            if self.clock.is_none() {
                return Err(Error::NoGetTime);
            }
            if self.p2o_midi.is_none() {
                return Err(Error::NoP2oMidiBuf);
            }
        }
        if self.options.contains(Options::DLL) {
            if self.clock.is_none() {
                return Err(Error::NoGetTime);
            }
            if self.dll.is_none() {
                return Err(Error::NoDll);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_are_rejected() {
        let ctx = Context::new(Options::empty());
        assert_eq!(ctx.validate(), Err(Error::Generic));
    }

    #[test]
    fn each_option_names_its_missing_field() {
        let ctx = Context::new(Options::O2P_AUDIO);
        assert_eq!(ctx.validate(), Err(Error::NoO2pAudioBuf));

        let ctx = Context::new(Options::P2O_AUDIO);
        assert_eq!(ctx.validate(), Err(Error::NoP2oAudioBuf));

        let ctx = Context::new(Options::O2P_MIDI);
        assert_eq!(ctx.validate(), Err(Error::NoGetTime));

        let ctx = Context::new(Options::DLL);
        assert_eq!(ctx.validate(), Err(Error::NoGetTime));
    }
}
