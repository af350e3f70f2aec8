//! On-wire audio block codec.
//!
//! A transfer is `blocks_per_transfer` contiguous blocks. Each block is a
//! 4-byte header (big-endian magic `0x07ff`, big-endian running frame
//! counter) followed by `FRAMES_PER_BLOCK` frames of interleaved big-endian
//! `i32` samples, one per channel. Device-to-host blocks carry `outputs`
//! channels, host-to-device blocks `inputs` channels.
//!
//! Pure conversion: no allocation, no I/O.

use crate::FRAMES_PER_BLOCK;
use crate::device::DeviceDesc;
use tracing::{debug, trace};

pub const BLOCK_MAGIC: u16 = 0x07ff;
pub const BLOCK_HEADER_LEN: usize = 4;
pub const BYTES_PER_SAMPLE: usize = 4;

// Normalization between wire i32 and host float. The encode side uses the
// same constant, so unity-scaled samples round-trip within one wire unit.
const SAMPLE_SCALE: f32 = 1.0 / i32::MAX as f32;

/// Byte geometry of one transfer in each direction, fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    pub blocks_per_transfer: usize,
    pub frames_per_transfer: usize,
    /// Bytes of one host-to-device float frame (`4 × inputs`).
    pub p2o_frame_size: usize,
    /// Bytes of one device-to-host float frame (`4 × outputs`).
    pub o2p_frame_size: usize,
    pub p2o_transfer_size: usize,
    pub o2p_transfer_size: usize,
    pub data_in_blk_len: usize,
    pub data_out_blk_len: usize,
    pub data_in_len: usize,
    pub data_out_len: usize,
}

impl BlockLayout {
    pub fn new(desc: &DeviceDesc, blocks_per_transfer: usize) -> Self {
        let frames_per_transfer = FRAMES_PER_BLOCK * blocks_per_transfer;
        let data_in_blk_len =
            BLOCK_HEADER_LEN + BYTES_PER_SAMPLE * FRAMES_PER_BLOCK * desc.outputs;
        let data_out_blk_len =
            BLOCK_HEADER_LEN + BYTES_PER_SAMPLE * FRAMES_PER_BLOCK * desc.inputs;
        let p2o_frame_size = BYTES_PER_SAMPLE * desc.inputs;
        let o2p_frame_size = BYTES_PER_SAMPLE * desc.outputs;
        Self {
            blocks_per_transfer,
            frames_per_transfer,
            p2o_frame_size,
            o2p_frame_size,
            p2o_transfer_size: frames_per_transfer * p2o_frame_size,
            o2p_transfer_size: frames_per_transfer * o2p_frame_size,
            data_in_blk_len,
            data_out_blk_len,
            data_in_len: data_in_blk_len * blocks_per_transfer,
            data_out_len: data_out_blk_len * blocks_per_transfer,
        }
    }
}

/// Decode one inbound wire transfer into interleaved host floats, applying
/// the per-track scales. Always decodes the whole transfer.
pub fn read_input_blocks(
    layout: &BlockLayout,
    scales: &[f32],
    wire: &[u8],
    out: &mut [f32],
) {
    let mut f = 0;
    for blk in 0..layout.blocks_per_transfer {
        let mut s = blk * layout.data_in_blk_len + BLOCK_HEADER_LEN;
        for _ in 0..FRAMES_PER_BLOCK {
            for scale in scales {
                let v = i32::from_be_bytes([wire[s], wire[s + 1], wire[s + 2], wire[s + 3]]);
                out[f] = v as f32 * scale * SAMPLE_SCALE;
                f += 1;
                s += BYTES_PER_SAMPLE;
            }
        }
    }
}

/// Encode interleaved host floats into one outbound wire transfer. Writes
/// the magic and the running frame counter into every block header and
/// advances the counter by `FRAMES_PER_BLOCK` per block, wrapping at u16.
///
/// The float-to-int conversion is the wire-compatible unclamped multiply;
/// the `as i32` cast saturates at the rails, so exactly `+1.0` lands on
/// `i32::MAX` and `-1.0` on `i32::MIN`.
pub fn write_output_blocks(
    layout: &BlockLayout,
    inputs: usize,
    counter: &mut u16,
    input: &[f32],
    wire: &mut [u8],
) {
    let mut f = 0;
    for blk in 0..layout.blocks_per_transfer {
        let base = blk * layout.data_out_blk_len;
        wire[base..base + 2].copy_from_slice(&BLOCK_MAGIC.to_be_bytes());
        wire[base + 2..base + 4].copy_from_slice(&counter.to_be_bytes());
        *counter = counter.wrapping_add(FRAMES_PER_BLOCK as u16);
        let mut s = base + BLOCK_HEADER_LEN;
        for _ in 0..FRAMES_PER_BLOCK {
            for _ in 0..inputs {
                let v = (input[f] * i32::MAX as f32) as i32;
                wire[s..s + 4].copy_from_slice(&v.to_be_bytes());
                f += 1;
                s += BYTES_PER_SAMPLE;
            }
        }
    }
}

/// Dump the headers (and, at trace level, the samples) of a wire buffer.
pub fn dump_blocks(blocks_per_transfer: usize, blk_len: usize, channels: usize, wire: &[u8]) {
    for blk in 0..blocks_per_transfer {
        let base = blk * blk_len;
        let header = u16::from_be_bytes([wire[base], wire[base + 1]]);
        let frames = u16::from_be_bytes([wire[base + 2], wire[base + 3]]);
        debug!("block {blk}: header {header:#06x} frames {frames:#06x}");
        let mut s = base + BLOCK_HEADER_LEN;
        for frame in 0..FRAMES_PER_BLOCK {
            for track in 0..channels {
                let v = i32::from_be_bytes([wire[s], wire[s + 1], wire[s + 2], wire[s + 3]]);
                trace!("frame {frame:2}, track {track:2}: {v}");
                s += BYTES_PER_SAMPLE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITY: [f32; 2] = [1.0; 2];

    fn stereo_desc() -> DeviceDesc {
        DeviceDesc {
            name: "test",
            vendor_id: 0,
            product_id: 0,
            inputs: 2,
            outputs: 2,
            output_track_scales: &UNITY,
        }
    }

    #[test]
    fn layout_matches_silent_loopback_geometry() {
        let layout = BlockLayout::new(&stereo_desc(), 8);
        assert_eq!(layout.frames_per_transfer, 56);
        assert_eq!(layout.o2p_transfer_size, 448);
        assert_eq!(layout.p2o_transfer_size, 448);
        assert_eq!(layout.data_in_blk_len, 4 + 4 * 7 * 2);
        assert_eq!(layout.data_in_len, 8 * (4 + 56));
    }

    #[test]
    fn zero_wire_decodes_to_silence() {
        let layout = BlockLayout::new(&stereo_desc(), 8);
        let wire = vec![0u8; layout.data_in_len];
        let mut out = vec![1.0f32; layout.frames_per_transfer * 2];
        read_input_blocks(&layout, &UNITY, &wire, &mut out);
        assert!(out.iter().all(|&f| f == 0.0));
    }

    #[test]
    fn encode_decode_round_trip_within_one_unit() {
        let layout = BlockLayout::new(&stereo_desc(), 8);
        let samples = layout.frames_per_transfer * 2;
        let input: Vec<f32> = (0..samples)
            .map(|i| ((i as f32 / samples as f32) * 2.0 - 1.0) * 0.999)
            .collect();
        let mut wire = vec![0u8; layout.data_out_len];
        let mut counter = 0u16;
        write_output_blocks(&layout, 2, &mut counter, &input, &mut wire);
        let mut out = vec![0.0f32; samples];
        read_input_blocks(&layout, &UNITY, &wire, &mut out);
        for (a, b) in input.iter().zip(out.iter()) {
            assert!((a - b).abs() <= 1.0 / 2147483648.0, "{a} vs {b}");
        }
    }

    #[test]
    fn headers_carry_magic_and_running_counter() {
        let layout = BlockLayout::new(&stereo_desc(), 8);
        let input = vec![0.0f32; layout.frames_per_transfer * 2];
        let mut wire = vec![0u8; layout.data_out_len];
        let mut counter = 0xfff0u16;
        write_output_blocks(&layout, 2, &mut counter, &input, &mut wire);
        for blk in 0..8 {
            let base = blk * layout.data_out_blk_len;
            assert_eq!(&wire[base..base + 2], &[0x07, 0xff]);
            let frames = u16::from_be_bytes([wire[base + 2], wire[base + 3]]);
            assert_eq!(frames, 0xfff0u16.wrapping_add((blk * 7) as u16));
        }
        assert_eq!(counter, 0xfff0u16.wrapping_add(56));
    }

    #[test]
    fn full_scale_samples_hit_the_rails() {
        let layout = BlockLayout::new(&stereo_desc(), 8);
        let input: Vec<f32> = (0..layout.frames_per_transfer * 2)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let mut wire = vec![0u8; layout.data_out_len];
        let mut counter = 0u16;
        write_output_blocks(&layout, 2, &mut counter, &input, &mut wire);
        for blk in 0..8 {
            let mut s = blk * layout.data_out_blk_len + BLOCK_HEADER_LEN;
            for i in 0..7 * 2 {
                let v = i32::from_be_bytes([wire[s], wire[s + 1], wire[s + 2], wire[s + 3]]);
                if i % 2 == 0 {
                    assert_eq!(v, i32::MAX);
                } else {
                    assert_eq!(v, i32::MIN);
                }
                s += BYTES_PER_SAMPLE;
            }
        }
    }

    #[test]
    fn inbound_scales_are_per_track() {
        const SCALES: [f32; 2] = [0.5, 2.0];
        let desc = DeviceDesc {
            output_track_scales: &SCALES,
            ..stereo_desc()
        };
        let layout = BlockLayout::new(&desc, 1);
        let mut wire = vec![0u8; layout.data_in_len];
        let v = (0.25f32 * i32::MAX as f32) as i32;
        for frame in 0..FRAMES_PER_BLOCK {
            let s = BLOCK_HEADER_LEN + frame * 8;
            wire[s..s + 4].copy_from_slice(&v.to_be_bytes());
            wire[s + 4..s + 8].copy_from_slice(&v.to_be_bytes());
        }
        let mut out = vec![0.0f32; layout.frames_per_transfer * 2];
        read_input_blocks(&layout, &SCALES, &wire, &mut out);
        for frame in out.chunks(2) {
            assert!((frame[0] - 0.125).abs() < 1e-6);
            assert!((frame[1] - 0.5).abs() < 1e-6);
        }
    }
}
