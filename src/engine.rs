//! The transport engine: owns the USB transfer ring, marshals audio and
//! MIDI in both directions, and runs the two realtime driver threads.
//!
//! Thread map: the audio thread owns the libusb event pump and therefore
//! runs all four completion callbacks; the MIDI-out thread paces outbound
//! batches against the host clock; everything the control thread touches
//! (status, stats, toggles) is atomic or behind the short-held state lock.

use crate::blocks::{self, BlockLayout};
use crate::context::{Clock, Context, Dll, Options, Ring, RtPriorityHook};
use crate::device::DeviceDesc;
use crate::error::Error;
use crate::midi::{self, OutboundScheduler};
use crate::mutex::UnsafeMutex;
use crate::resample::{SincStretcher, Stretcher, stretch_to_transfer};
use crate::rt;
use crate::usb::{
    self, AUDIO_IN_EP, AUDIO_OUT_EP, MIDI_IN_EP, MIDI_OUT_EP, TransferSlot, UsbDevice,
};
use crate::{DUMP_BLOCKS_ENV, SAMPLE_RATE, SAMPLE_TIME_NS, USB_BULK_MIDI_SIZE, env_flag};
use libusb1_sys as ffi;
use libusb1_sys::constants::{
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_BULK,
    LIBUSB_TRANSFER_TYPE_INTERRUPT,
};
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Engine lifecycle state. Ordering matters: callbacks compare against
/// `Run` to gate publication and against `Stop`/`Wait` to decide shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    Error = 0,
    Stop = 1,
    Ready = 2,
    Boot = 3,
    Wait = 4,
    Run = 5,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Error,
            1 => Status::Stop,
            2 => Status::Ready,
            3 => Status::Boot,
            4 => Status::Wait,
            _ => Status::Run,
        }
    }
}

/// Round a byte count down to a whole number of frames.
pub fn whole_frame_bytes(bytes: usize, frame_size: usize) -> usize {
    (bytes / frame_size) * frame_size
}

fn floats_to_bytes(src: &[f32], dst: &mut [u8]) {
    for (f, b) in src.iter().zip(dst.chunks_exact_mut(4)) {
        b.copy_from_slice(&f.to_le_bytes());
    }
}

fn bytes_to_floats(src: &[u8], dst: &mut [f32]) {
    for (b, f) in src.chunks_exact(4).zip(dst.iter_mut()) {
        *f = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
}

/// State owned by the USB event thread: the wire buffers, the host-domain
/// float buffers, and the rings this thread produces into or consumes from.
struct EngineIo {
    data_in: Box<[u8]>,
    data_out: Box<[u8]>,
    o2p_transfer_buf: Box<[f32]>,
    p2o_transfer_buf: Box<[f32]>,
    p2o_resampler_buf: Box<[f32]>,
    ring_scratch: Box<[u8]>,
    o2p_midi_data: Box<[u8]>,
    frames: u16,
    reading_at_p2o_end: bool,
    o2p_audio: Option<Box<dyn Ring>>,
    p2o_audio: Option<Box<dyn Ring>>,
    o2p_midi: Option<Box<dyn Ring>>,
    clock: Option<Arc<dyn Clock>>,
    stretcher: Box<dyn Stretcher>,
}

/// State owned by the MIDI-out thread.
struct MidiOut {
    data: Box<[u8; USB_BULK_MIDI_SIZE]>,
    ring: Option<Box<dyn Ring>>,
    clock: Option<Arc<dyn Clock>>,
}

struct Transfers {
    audio_in: TransferSlot,
    audio_out: TransferSlot,
    midi_in: TransferSlot,
    midi_out: TransferSlot,
}

/// Field order is load-bearing: the device handle drops first, which
/// cancels anything still in flight, and only then are the slots freed.
struct UsbLink {
    device: UsbDevice,
    transfers: Transfers,
}

struct RtSetup {
    hook: Option<Arc<RtPriorityHook>>,
    priority: i32,
}

pub(crate) struct EngineShared {
    name: String,
    desc: &'static DeviceDesc,
    layout: BlockLayout,
    usb: Option<UsbLink>,
    status: AtomicU8,
    options: AtomicU32,
    p2o_audio_enabled: AtomicBool,
    p2o_midi_ready: AtomicBool,
    o2p_latency: AtomicUsize,
    o2p_max_latency: AtomicUsize,
    p2o_latency: AtomicUsize,
    p2o_max_latency: AtomicUsize,
    dll: Mutex<Option<Box<dyn Dll>>>,
    rt: Mutex<RtSetup>,
    dump_blocks: bool,
    io: UnsafeMutex<EngineIo>,
    midi_out: UnsafeMutex<MidiOut>,
}

impl EngineShared {
    fn new(
        name: String,
        desc: &'static DeviceDesc,
        layout: BlockLayout,
        usb: Option<UsbLink>,
    ) -> Self {
        let samples_per_transfer_out = layout.frames_per_transfer * desc.inputs;
        let samples_per_transfer_in = layout.frames_per_transfer * desc.outputs;
        Self {
            name,
            desc,
            layout,
            usb,
            status: AtomicU8::new(Status::Ready as u8),
            options: AtomicU32::new(0),
            p2o_audio_enabled: AtomicBool::new(false),
            p2o_midi_ready: AtomicBool::new(false),
            o2p_latency: AtomicUsize::new(0),
            o2p_max_latency: AtomicUsize::new(0),
            p2o_latency: AtomicUsize::new(0),
            p2o_max_latency: AtomicUsize::new(0),
            dll: Mutex::new(None),
            rt: Mutex::new(RtSetup {
                hook: None,
                priority: rt::DEFAULT_RT_PRIORITY,
            }),
            dump_blocks: env_flag(DUMP_BLOCKS_ENV),
            io: UnsafeMutex::new(EngineIo {
                data_in: vec![0; layout.data_in_len].into_boxed_slice(),
                data_out: vec![0; layout.data_out_len].into_boxed_slice(),
                o2p_transfer_buf: vec![0.0; samples_per_transfer_in].into_boxed_slice(),
                p2o_transfer_buf: vec![0.0; samples_per_transfer_out].into_boxed_slice(),
                p2o_resampler_buf: vec![0.0; samples_per_transfer_out].into_boxed_slice(),
                ring_scratch: vec![
                    0;
                    layout.o2p_transfer_size.max(layout.p2o_transfer_size)
                ]
                .into_boxed_slice(),
                o2p_midi_data: vec![0; USB_BULK_MIDI_SIZE].into_boxed_slice(),
                frames: 0,
                reading_at_p2o_end: false,
                o2p_audio: None,
                p2o_audio: None,
                o2p_midi: None,
                clock: None,
                stretcher: Box::new(SincStretcher),
            }),
            midi_out: UnsafeMutex::new(MidiOut {
                data: Box::new([0; USB_BULK_MIDI_SIZE]),
                ring: None,
                clock: None,
            }),
        }
    }

    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn store_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Fatal submission failure. Stop and Error stay terminal: a shutdown
    /// already in progress is never demoted back to Error.
    fn set_error(&self) {
        let mut cur = self.status.load(Ordering::SeqCst);
        while Status::from_u8(cur) > Status::Stop {
            match self.status.compare_exchange(
                cur,
                Status::Error as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }

    fn options(&self) -> Options {
        Options::from_bits_truncate(self.options.load(Ordering::SeqCst))
    }

    fn callback_ctx(&self) -> *mut c_void {
        self as *const EngineShared as *mut c_void
    }

    /// Inbound audio cycle, run from the audio-in completion callback.
    fn audio_in_done(&self) {
        let io = self.io.lock();
        if self.dump_blocks {
            blocks::dump_blocks(
                self.layout.blocks_per_transfer,
                self.layout.data_in_blk_len,
                self.desc.outputs,
                &io.data_in,
            );
        }

        if self.options().contains(Options::DLL)
            && let Some(clock) = io.clock.as_ref()
        {
            let now = clock.now();
            let mut dll = self.dll.lock().expect("state mutex poisoned");
            if let Some(dll) = dll.as_mut() {
                dll.increment(self.layout.frames_per_transfer, now);
                if dll.locked() {
                    self.transition(Status::Wait, Status::Run);
                } else {
                    // Lock lost mid-stream: fall back to a fresh boot.
                    self.transition(Status::Run, Status::Boot);
                }
            }
        }
        let status = self.status();

        // Decode even before Run so the wire buffer alignment never drifts.
        blocks::read_input_blocks(
            &self.layout,
            self.desc.output_track_scales,
            &io.data_in,
            &mut io.o2p_transfer_buf,
        );

        if status < Status::Run {
            return;
        }

        let Some(ring) = io.o2p_audio.as_mut() else {
            return;
        };
        let latency = ring.read_space();
        self.o2p_latency.store(latency, Ordering::Relaxed);
        self.o2p_max_latency.fetch_max(latency, Ordering::Relaxed);

        if ring.write_space() >= self.layout.o2p_transfer_size {
            let scratch = &mut io.ring_scratch[..self.layout.o2p_transfer_size];
            floats_to_bytes(&io.o2p_transfer_buf, scratch);
            ring.write(scratch);
        } else {
            error!("o2p: audio ring buffer overflow, discarding data");
        }
    }

    /// Outbound audio cycle, run from the audio-out completion callback
    /// before the transfer is submitted again.
    fn audio_out_ready(&self) {
        let io = self.io.lock();
        let layout = self.layout;
        'fill: {
            if !self.p2o_audio_enabled.load(Ordering::SeqCst) {
                io.reading_at_p2o_end = false;
                debug!("p2o: clearing buffer and stopping");
                io.p2o_transfer_buf.fill(0.0);
                break 'fill;
            }
            let Some(ring) = io.p2o_audio.as_mut() else {
                io.p2o_transfer_buf.fill(0.0);
                break 'fill;
            };
            let rsp2o = ring.read_space();

            if !io.reading_at_p2o_end {
                // One-shot resync: wait until the host supplied a full
                // buffer, throw it away frame-aligned, and read from the
                // ring end from the next cycle on.
                if rsp2o >= layout.p2o_transfer_size {
                    debug!("p2o: emptying buffer and running");
                    ring.skip(whole_frame_bytes(rsp2o, layout.p2o_frame_size));
                    io.reading_at_p2o_end = true;
                }
                break 'fill;
            }

            self.p2o_latency.store(rsp2o, Ordering::Relaxed);
            self.p2o_max_latency.fetch_max(rsp2o, Ordering::Relaxed);

            if rsp2o >= layout.p2o_transfer_size {
                let scratch = &mut io.ring_scratch[..layout.p2o_transfer_size];
                ring.read(scratch);
                bytes_to_floats(scratch, &mut io.p2o_transfer_buf);
            } else {
                debug!(
                    "p2o: audio ring buffer underflow ({rsp2o} < {}), resampling",
                    layout.p2o_transfer_size
                );
                let frames = rsp2o / layout.p2o_frame_size;
                if frames > 0 {
                    let bytes = frames * layout.p2o_frame_size;
                    let scratch = &mut io.ring_scratch[..bytes];
                    ring.read(scratch);
                    bytes_to_floats(
                        scratch,
                        &mut io.p2o_resampler_buf[..frames * self.desc.inputs],
                    );
                    stretch_to_transfer(
                        io.stretcher.as_mut(),
                        &io.p2o_resampler_buf,
                        frames,
                        layout.frames_per_transfer,
                        self.desc.inputs,
                        &mut io.p2o_transfer_buf,
                    );
                }
            }
        }

        let EngineIo {
            frames,
            p2o_transfer_buf,
            data_out,
            ..
        } = io;
        blocks::write_output_blocks(&layout, self.desc.inputs, frames, p2o_transfer_buf, data_out);
    }

    /// Inbound MIDI cycle; all events in the packet share one timestamp.
    fn midi_in_done(&self, len: usize) {
        let io = self.io.lock();
        let Some(clock) = io.clock.as_ref() else {
            return;
        };
        let time = clock.now();
        let Some(ring) = io.o2p_midi.as_mut() else {
            return;
        };
        let len = len.min(io.o2p_midi_data.len());
        midi::forward_inbound(&io.o2p_midi_data[..len], time, ring.as_mut());
    }

    fn submit_audio_in(&self) {
        let Some(link) = self.usb.as_ref() else {
            return;
        };
        let io = self.io.lock();
        let res = unsafe {
            link.transfers.audio_in.fill(
                link.device.handle.as_raw(),
                AUDIO_IN_EP,
                LIBUSB_TRANSFER_TYPE_INTERRUPT as u8,
                io.data_in.as_mut_ptr(),
                self.layout.data_in_len,
                cb_audio_in,
                self.callback_ctx(),
            );
            link.transfers.audio_in.submit()
        };
        if let Err(rc) = res {
            error!(
                "o2p: error when submitting usb audio in transfer: {}",
                usb::error_name(rc)
            );
            self.set_error();
        }
    }

    fn submit_audio_out(&self) {
        let Some(link) = self.usb.as_ref() else {
            return;
        };
        let io = self.io.lock();
        let res = unsafe {
            link.transfers.audio_out.fill(
                link.device.handle.as_raw(),
                AUDIO_OUT_EP,
                LIBUSB_TRANSFER_TYPE_INTERRUPT as u8,
                io.data_out.as_mut_ptr(),
                self.layout.data_out_len,
                cb_audio_out,
                self.callback_ctx(),
            );
            link.transfers.audio_out.submit()
        };
        if let Err(rc) = res {
            error!(
                "p2o: error when submitting usb audio transfer: {}",
                usb::error_name(rc)
            );
            self.set_error();
        }
    }

    fn submit_midi_in(&self) {
        let Some(link) = self.usb.as_ref() else {
            return;
        };
        let io = self.io.lock();
        let res = unsafe {
            link.transfers.midi_in.fill(
                link.device.handle.as_raw(),
                MIDI_IN_EP,
                LIBUSB_TRANSFER_TYPE_BULK as u8,
                io.o2p_midi_data.as_mut_ptr(),
                USB_BULK_MIDI_SIZE,
                cb_midi_in,
                self.callback_ctx(),
            );
            link.transfers.midi_in.submit()
        };
        if let Err(rc) = res {
            error!(
                "o2p: error when submitting usb midi transfer: {}",
                usb::error_name(rc)
            );
            self.set_error();
        }
    }

    // The buffer pointer comes from the MIDI thread, which holds the
    // `midi_out` state across its whole loop.
    fn submit_midi_out(&self, buffer: *mut u8) {
        let Some(link) = self.usb.as_ref() else {
            return;
        };
        let res = unsafe {
            link.transfers.midi_out.fill(
                link.device.handle.as_raw(),
                MIDI_OUT_EP,
                LIBUSB_TRANSFER_TYPE_BULK as u8,
                buffer,
                USB_BULK_MIDI_SIZE,
                cb_midi_out,
                self.callback_ctx(),
            );
            link.transfers.midi_out.submit()
        };
        if let Err(rc) = res {
            error!(
                "p2o: error when submitting usb midi transfer: {}",
                usb::error_name(rc)
            );
            self.set_error();
        }
    }

    fn apply_rt_priority(&self, label: &str) {
        let (hook, priority) = {
            let setup = self.rt.lock().expect("rt mutex poisoned");
            (setup.hook.clone(), setup.priority)
        };
        let result = match hook {
            Some(hook) => hook(priority),
            None => rt::set_thread_rt_priority(priority),
        };
        if let Err(e) = result {
            error!("{label} thread realtime priority not enabled: {e}");
        }
    }
}

extern "system" fn cb_audio_in(xfr: *mut ffi::libusb_transfer) {
    let (engine, status) = unsafe {
        let xfr = &*xfr;
        (&*(xfr.user_data as *const EngineShared), xfr.status)
    };
    if status == LIBUSB_TRANSFER_COMPLETED {
        engine.audio_in_done();
    } else {
        error!(
            "o2p: error on usb audio transfer: {}",
            usb::transfer_status_name(status)
        );
    }
    // Start the next cycle even if this one did not succeed.
    engine.submit_audio_in();
}

extern "system" fn cb_audio_out(xfr: *mut ffi::libusb_transfer) {
    let (engine, status) = unsafe {
        let xfr = &*xfr;
        (&*(xfr.user_data as *const EngineShared), xfr.status)
    };
    if status != LIBUSB_TRANSFER_COMPLETED {
        error!(
            "p2o: error on usb audio transfer: {}",
            usb::transfer_status_name(status)
        );
    }
    // The out cycle must be refilled before it is submitted again.
    engine.audio_out_ready();
    engine.submit_audio_out();
}

extern "system" fn cb_midi_in(xfr: *mut ffi::libusb_transfer) {
    let (engine, status, actual) = unsafe {
        let xfr = &*xfr;
        (
            &*(xfr.user_data as *const EngineShared),
            xfr.status,
            xfr.actual_length,
        )
    };
    if engine.status() >= Status::Run {
        if status == LIBUSB_TRANSFER_COMPLETED {
            engine.midi_in_done(actual.max(0) as usize);
        } else if status != LIBUSB_TRANSFER_TIMED_OUT {
            error!(
                "error on usb midi in transfer: {}",
                usb::transfer_status_name(status)
            );
        }
    }
    engine.submit_midi_in();
}

extern "system" fn cb_midi_out(xfr: *mut ffi::libusb_transfer) {
    let (engine, status) = unsafe {
        let xfr = &*xfr;
        (&*(xfr.user_data as *const EngineShared), xfr.status)
    };
    engine.p2o_midi_ready.store(true, Ordering::SeqCst);
    if status != LIBUSB_TRANSFER_COMPLETED {
        error!(
            "error on usb midi out transfer: {}",
            usb::transfer_status_name(status)
        );
    }
}

/// Audio + inbound-MIDI driver: owns the event pump for the whole stream.
fn run_audio(shared: Arc<EngineShared>) {
    shared.apply_rt_priority("audio");

    if shared.options().contains(Options::DLL) {
        // Handoff point: the clock-recovery side boots the engine.
        while shared.status() == Status::Ready {
            std::hint::spin_loop();
        }
    } else {
        shared.transition(Status::Ready, Status::Boot);
    }
    if shared.status() <= Status::Stop {
        return;
    }

    shared.submit_audio_in();
    shared.submit_audio_out();
    if shared.options().contains(Options::O2P_MIDI) {
        shared.submit_midi_in();
    }
    let Some(link) = shared.usb.as_ref() else {
        return;
    };

    loop {
        shared.o2p_latency.store(0, Ordering::Relaxed);
        shared.o2p_max_latency.store(0, Ordering::Relaxed);
        shared.p2o_latency.store(0, Ordering::Relaxed);
        shared.p2o_max_latency.store(0, Ordering::Relaxed);
        {
            let io = shared.io.lock();
            io.reading_at_p2o_end = false;
            let now = io.clock.as_ref().map(|c| c.now()).unwrap_or_default();
            let mut dll = shared.dll.lock().expect("state mutex poisoned");
            let target = match dll.as_mut() {
                Some(dll) => {
                    dll.init(SAMPLE_RATE, shared.layout.frames_per_transfer, now);
                    Status::Wait
                }
                None => Status::Run,
            };
            drop(dll);
            if !shared.transition(Status::Boot, target) {
                shared.transition(Status::Ready, target);
            }
        }

        while shared.status() >= Status::Wait {
            usb::handle_events(&link.device.context);
        }

        // Leave no stale audio behind, whether this is a re-boot or the
        // final exit: drop a frame-aligned count from the host ring and
        // silence the outbound buffer.
        {
            let io = shared.io.lock();
            if let Some(ring) = io.p2o_audio.as_mut() {
                let bytes = whole_frame_bytes(ring.read_space(), shared.layout.p2o_frame_size);
                ring.skip(bytes);
            }
            io.p2o_transfer_buf.fill(0.0);
        }

        if shared.status() <= Status::Stop {
            return;
        }
    }
}

/// Outbound-MIDI driver: batches ring events and paces them on the clock.
fn run_midi_out(shared: Arc<EngineShared>) {
    shared.apply_rt_priority("midi out");

    let mo = shared.midi_out.lock();
    let Some(clock) = mo.clock.clone() else {
        return;
    };
    let Some(ring) = mo.ring.as_mut() else {
        return;
    };

    let mut sched = OutboundScheduler::new(clock.now());
    shared.p2o_midi_ready.store(true, Ordering::SeqCst);
    // Average wait for a 32-sample buffer to fill at the device rate.
    let min_tick = Duration::from_nanos((SAMPLE_TIME_NS * 32.0 / 2.0) as u64);

    loop {
        let batch = sched.collect(ring.as_mut(), &mut mo.data);
        if batch.len > 0 {
            shared.p2o_midi_ready.store(false, Ordering::SeqCst);
            shared.submit_midi_out(mo.data.as_mut_ptr());
        }

        if batch.diff > 0.0 {
            thread::sleep(Duration::from_secs_f64(batch.diff));
        } else {
            thread::sleep(min_tick);
        }

        while !shared.p2o_midi_ready.load(Ordering::SeqCst) {
            if shared.status() <= Status::Stop {
                break;
            }
            thread::sleep(min_tick);
        }

        if shared.status() <= Status::Stop {
            return;
        }
    }
}

/// The engine. Create one with a factory, `activate` it with a host
/// context, `stop` it from any thread, `wait` for the drivers to drain.
pub struct Engine {
    shared: Arc<EngineShared>,
    audio_thread: Option<JoinHandle<()>>,
    midi_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Open the table-matched device at `(bus, address)`.
    pub fn open_bus_address(
        bus: u8,
        address: u8,
        blocks_per_transfer: usize,
    ) -> Result<Self, Error> {
        Self::from_device(usb::open_bus_address(bus, address)?, blocks_per_transfer)
    }

    /// Wrap a device file descriptor the host already opened. For hosts
    /// that cannot enumerate the bus themselves.
    #[cfg(unix)]
    pub fn open_fd(fd: std::os::fd::RawFd, blocks_per_transfer: usize) -> Result<Self, Error> {
        Self::from_device(usb::open_fd(fd)?, blocks_per_transfer)
    }

    fn from_device(mut device: UsbDevice, blocks_per_transfer: usize) -> Result<Self, Error> {
        usb::bring_up(&mut device.handle)?;
        let transfers = Transfers {
            audio_in: TransferSlot::alloc()?,
            audio_out: TransferSlot::alloc()?,
            midi_in: TransferSlot::alloc()?,
            midi_out: TransferSlot::alloc()?,
        };
        let layout = BlockLayout::new(device.desc, blocks_per_transfer);
        let name = format!("{}@{:03},{:03}", device.desc.name, device.bus, device.address);
        let desc = device.desc;
        let shared = Arc::new(EngineShared::new(
            name,
            desc,
            layout,
            Some(UsbLink { device, transfers }),
        ));
        Ok(Self {
            shared,
            audio_thread: None,
            midi_thread: None,
        })
    }

    /// Wire the host context in and start the driver threads for the
    /// enabled options.
    pub fn activate(&mut self, mut context: Context) -> Result<(), Error> {
        context.validate()?;
        let options = context.options;
        self.shared.options.store(options.bits(), Ordering::SeqCst);
        self.shared
            .p2o_audio_enabled
            .store(options.contains(Options::P2O_AUDIO), Ordering::SeqCst);
        {
            let io = self.shared.io.lock();
            io.o2p_audio = context.o2p_audio.take();
            io.p2o_audio = context.p2o_audio.take();
            io.o2p_midi = context.o2p_midi.take();
            io.clock = context.clock.clone();
        }
        {
            let mo = self.shared.midi_out.lock();
            mo.ring = context.p2o_midi.take();
            mo.clock = context.clock.clone();
        }
        *self.shared.dll.lock().expect("state mutex poisoned") = context.dll.take();
        {
            let mut setup = self.shared.rt.lock().expect("rt mutex poisoned");
            setup.hook = context.set_rt_priority.take();
            setup.priority = context.priority.unwrap_or(rt::DEFAULT_RT_PRIORITY);
        }
        self.shared.store_status(Status::Ready);

        if options.contains(Options::P2O_MIDI) {
            debug!("starting p2o midi thread");
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("ob-midi-out".into())
                .spawn(move || run_midi_out(shared))
                .map_err(|e| {
                    error!("could not start midi thread: {e}");
                    Error::Generic
                })?;
            self.midi_thread = Some(handle);
        }
        if options.intersects(Options::O2P_MIDI | Options::O2P_AUDIO | Options::P2O_AUDIO) {
            debug!("starting audio and o2p midi thread");
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("ob-audio".into())
                .spawn(move || run_audio(shared))
                .map_err(|e| {
                    error!("could not start device thread: {e}");
                    Error::Generic
                })?;
            self.audio_thread = Some(handle);
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// Boot a Ready engine. With clock recovery enabled this is the
    /// external trigger the audio thread spins on.
    pub fn start(&self) {
        self.shared.transition(Status::Ready, Status::Boot);
    }

    /// Request termination; the drivers observe it within one transfer
    /// period (audio) or one minimum tick (MIDI).
    pub fn stop(&self) {
        self.shared.store_status(Status::Stop);
    }

    /// Block until both driver threads have drained and returned.
    pub fn wait(&mut self) {
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.midi_thread.take() {
            let _ = handle.join();
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn device_desc(&self) -> &'static DeviceDesc {
        self.shared.desc
    }

    pub fn is_p2o_audio_enabled(&self) -> bool {
        self.shared.p2o_audio_enabled.load(Ordering::SeqCst)
    }

    pub fn set_p2o_audio_enabled(&self, enabled: bool) {
        if self
            .shared
            .p2o_audio_enabled
            .swap(enabled, Ordering::SeqCst)
            != enabled
        {
            debug!("setting p2o audio to {enabled}");
        }
    }

    /// Ring fill levels in bytes, sampled once per cycle while running.
    pub fn o2p_latency(&self) -> usize {
        self.shared.o2p_latency.load(Ordering::Relaxed)
    }

    pub fn o2p_max_latency(&self) -> usize {
        self.shared.o2p_max_latency.load(Ordering::Relaxed)
    }

    pub fn p2o_latency(&self) -> usize {
        self.shared.p2o_latency.load(Ordering::Relaxed)
    }

    pub fn p2o_max_latency(&self) -> usize {
        self.shared.p2o_max_latency.load(Ordering::Relaxed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
        self.wait();
        // The shared state follows once the last clone is gone; closing
        // the device handle there cancels anything still in flight before
        // the transfer slots are freed.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixedClock, VecRing};

    const UNITY: [f32; 2] = [1.0; 2];
    static TEST_DESC: DeviceDesc = DeviceDesc {
        name: "test",
        vendor_id: 0,
        product_id: 0,
        inputs: 2,
        outputs: 2,
        output_track_scales: &UNITY,
    };

    fn shared(blocks: usize) -> EngineShared {
        let layout = BlockLayout::new(&TEST_DESC, blocks);
        EngineShared::new("test@000,000".into(), &TEST_DESC, layout, None)
    }

    struct RecordingStretcher {
        calls: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl Stretcher for RecordingStretcher {
        fn stretch(
            &mut self,
            _input: &[f32],
            frames_in: usize,
            frames_out: usize,
            channels: usize,
            output: &mut [f32],
        ) -> Result<usize, String> {
            self.calls
                .lock()
                .expect("recorder poisoned")
                .push((frames_in, frames_out));
            output[..frames_out * channels].fill(0.25);
            Ok(frames_out)
        }
    }

    #[test]
    fn silent_loopback_publishes_one_transfer() {
        let engine = shared(8);
        engine.store_status(Status::Run);
        {
            let io = engine.io.lock();
            io.o2p_audio = Some(Box::new(VecRing::with_capacity(1024)));
        }
        engine.audio_in_done();
        let io = engine.io.lock();
        assert_eq!(io.o2p_transfer_buf.len(), 56 * 2);
        assert!(io.o2p_transfer_buf.iter().all(|&f| f == 0.0));
        assert_eq!(io.o2p_audio.as_ref().unwrap().read_space(), 448);
    }

    #[test]
    fn inbound_before_run_decodes_but_does_not_publish() {
        let engine = shared(8);
        engine.store_status(Status::Wait);
        {
            let io = engine.io.lock();
            io.o2p_audio = Some(Box::new(VecRing::with_capacity(1024)));
        }
        engine.audio_in_done();
        let io = engine.io.lock();
        assert_eq!(io.o2p_audio.as_ref().unwrap().read_space(), 0);
    }

    #[test]
    fn inbound_overflow_drops_whole_transfer_and_recovers() {
        let engine = shared(8);
        engine.store_status(Status::Run);
        {
            let io = engine.io.lock();
            io.o2p_audio = Some(Box::new(VecRing::with_capacity(447)));
        }
        engine.audio_in_done();
        assert_eq!(engine.io.lock().o2p_audio.as_ref().unwrap().read_space(), 0);

        // Next cycle with room again goes through whole.
        {
            let io = engine.io.lock();
            io.o2p_audio = Some(Box::new(VecRing::with_capacity(448)));
        }
        engine.audio_in_done();
        assert_eq!(
            engine.io.lock().o2p_audio.as_ref().unwrap().read_space(),
            448
        );
    }

    #[test]
    fn latency_stats_track_ring_fill() {
        let engine = shared(8);
        engine.store_status(Status::Run);
        {
            let io = engine.io.lock();
            let mut ring = VecRing::with_capacity(4096);
            ring.write(&[0u8; 800]);
            io.o2p_audio = Some(Box::new(ring));
        }
        engine.audio_in_done();
        assert_eq!(engine.o2p_latency.load(Ordering::Relaxed), 800);
        assert_eq!(engine.o2p_max_latency.load(Ordering::Relaxed), 800);

        {
            let io = engine.io.lock();
            let ring = io.o2p_audio.as_mut().unwrap();
            ring.skip(800 + 448);
        }
        engine.audio_in_done();
        assert_eq!(engine.o2p_latency.load(Ordering::Relaxed), 0);
        // The running maximum never decreases.
        assert_eq!(engine.o2p_max_latency.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn disabled_p2o_packs_silence() {
        let engine = shared(8);
        engine.p2o_audio_enabled.store(false, Ordering::SeqCst);
        {
            let io = engine.io.lock();
            io.p2o_transfer_buf.fill(0.7);
            io.reading_at_p2o_end = true;
        }
        engine.audio_out_ready();
        let io = engine.io.lock();
        assert!(!io.reading_at_p2o_end);
        for blk in 0..8 {
            let base = blk * engine.layout.data_out_blk_len;
            assert_eq!(&io.data_out[base..base + 2], &[0x07, 0xff]);
            assert!(io.data_out[base + 4..base + engine.layout.data_out_blk_len]
                .iter()
                .all(|&b| b == 0));
        }
    }

    #[test]
    fn first_full_buffer_is_drained_to_resync() {
        let engine = shared(8);
        engine.p2o_audio_enabled.store(true, Ordering::SeqCst);
        {
            let io = engine.io.lock();
            let mut ring = VecRing::with_capacity(4096);
            ring.write(&vec![1u8; 500]);
            io.p2o_audio = Some(Box::new(ring));
        }
        engine.audio_out_ready();
        let io = engine.io.lock();
        assert!(io.reading_at_p2o_end);
        // 500 bytes drained down to the 62-frame boundary (496 bytes).
        assert_eq!(io.p2o_audio.as_ref().unwrap().read_space(), 4);
        assert!(io.p2o_transfer_buf.iter().all(|&f| f == 0.0));
    }

    #[test]
    fn underflow_stretches_available_frames_to_a_full_transfer() {
        let engine = shared(8);
        engine.p2o_audio_enabled.store(true, Ordering::SeqCst);
        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let io = engine.io.lock();
            io.reading_at_p2o_end = true;
            io.stretcher = Box::new(RecordingStretcher {
                calls: calls.clone(),
            });
            let mut ring = VecRing::with_capacity(4096);
            // Exactly half a transfer: 28 frames of 8 bytes.
            ring.write(&vec![0u8; 224]);
            io.p2o_audio = Some(Box::new(ring));
        }
        engine.audio_out_ready();
        let calls = calls.lock().expect("recorder poisoned");
        assert_eq!(calls.as_slice(), &[(28, 56)]);
        let (frames_in, frames_out) = calls[0];
        assert_eq!(frames_out as f64 / frames_in as f64, 2.0);
        // The stretched signal went out on the wire at full size.
        let io = engine.io.lock();
        let v = (0.25f32 * i32::MAX as f32) as i32;
        assert_eq!(&io.data_out[4..8], &v.to_be_bytes());
    }

    #[test]
    fn steady_state_reads_exactly_one_transfer() {
        let engine = shared(8);
        engine.p2o_audio_enabled.store(true, Ordering::SeqCst);
        {
            let io = engine.io.lock();
            io.reading_at_p2o_end = true;
            let mut ring = VecRing::with_capacity(4096);
            let mut bytes = Vec::new();
            for _ in 0..56 * 2 {
                bytes.extend_from_slice(&0.5f32.to_le_bytes());
            }
            bytes.extend_from_slice(&[0u8; 16]);
            ring.write(&bytes);
            io.p2o_audio = Some(Box::new(ring));
        }
        engine.audio_out_ready();
        let io = engine.io.lock();
        assert_eq!(io.p2o_audio.as_ref().unwrap().read_space(), 16);
        assert!(io.p2o_transfer_buf.iter().all(|&f| f == 0.5));
    }

    #[test]
    fn inbound_midi_events_are_stamped_at_callback_entry() {
        let engine = shared(8);
        engine.store_status(Status::Run);
        {
            let io = engine.io.lock();
            io.clock = Some(Arc::new(FixedClock(42.0)));
            io.o2p_midi = Some(Box::new(VecRing::with_capacity(256)));
            io.o2p_midi_data[..8].copy_from_slice(&[
                0x07, 0x11, 0x22, 0x33, // filtered out
                0x09, 0x90, 0x3c, 0x64,
            ]);
        }
        engine.midi_in_done(8);
        let io = engine.io.lock();
        let ring = io.o2p_midi.as_mut().unwrap();
        assert_eq!(ring.read_space(), crate::midi::MidiEvent::RING_SIZE);
        let mut raw = [0u8; crate::midi::MidiEvent::RING_SIZE];
        ring.read(&mut raw);
        let event = crate::midi::MidiEvent::from_ring_bytes(&raw);
        assert_eq!(event.time, 42.0);
        assert_eq!(event.bytes, [0x09, 0x90, 0x3c, 0x64]);
    }

    #[test]
    fn status_never_leaves_the_terminal_states() {
        let engine = shared(1);
        engine.store_status(Status::Run);
        engine.set_error();
        assert_eq!(engine.status(), Status::Error);

        // A shutdown already requested is not demoted to Error.
        engine.store_status(Status::Stop);
        engine.set_error();
        assert_eq!(engine.status(), Status::Stop);

        // Boot transitions only fire from the states they name.
        assert!(!engine.transition(Status::Ready, Status::Boot));
        assert_eq!(engine.status(), Status::Stop);
    }

    #[test]
    fn whole_frame_rounding() {
        assert_eq!(whole_frame_bytes(500, 8), 496);
        assert_eq!(whole_frame_bytes(7, 8), 0);
        assert_eq!(whole_frame_bytes(448, 8), 448);
    }
}
