//! Fallback stretch for outbound underflow.
//!
//! When the host ring comes up short, whatever whole frames are available
//! get stretched to exactly one transfer's worth. One seam so constrained
//! builds can swap the sinc converter for something cheaper.

use tracing::error;

pub(crate) trait Stretcher: Send {
    /// Stretch `frames_in` interleaved frames from `input` to `frames_out`
    /// frames in `output`. Returns the frames actually produced.
    fn stretch(
        &mut self,
        input: &[f32],
        frames_in: usize,
        frames_out: usize,
        channels: usize,
        output: &mut [f32],
    ) -> Result<usize, String>;
}

/// One-shot sinc stretch with the ratio `frames_out / frames_in`. Quality
/// over a streaming converter is accepted; underflow is rare and mostly a
/// startup artifact.
#[derive(Debug, Default)]
pub(crate) struct SincStretcher;

impl Stretcher for SincStretcher {
    fn stretch(
        &mut self,
        input: &[f32],
        frames_in: usize,
        frames_out: usize,
        channels: usize,
        output: &mut [f32],
    ) -> Result<usize, String> {
        let produced = samplerate::convert(
            frames_in as u32,
            frames_out as u32,
            channels,
            samplerate::ConverterType::SincFastest,
            &input[..frames_in * channels],
        )
        .map_err(|e| e.to_string())?;
        let n = produced.len().min(output.len());
        output[..n].copy_from_slice(&produced[..n]);
        Ok(produced.len() / channels.max(1))
    }
}

/// Run one underflow stretch and report the places it can come up short.
pub(crate) fn stretch_to_transfer(
    stretcher: &mut dyn Stretcher,
    input: &[f32],
    frames_in: usize,
    frames_out: usize,
    channels: usize,
    output: &mut [f32],
) {
    match stretcher.stretch(input, frames_in, frames_out, channels, output) {
        Ok(produced) => {
            if produced != frames_out {
                error!(
                    "p2o: unexpected frames with ratio {} (output {produced}, expected {frames_out})",
                    frames_out as f64 / frames_in as f64
                );
            }
        }
        Err(e) => {
            error!("p2o: error while resampling: {e}");
        }
    }
}
