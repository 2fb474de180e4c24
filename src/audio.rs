use std::path::Path;

use crate::errors::Result;

/// Turns predicted mel spectrograms back into audio
pub trait AudioProcessor: Send + Sync {
    /// Waveform of `mel`, laid out `[channels][frames]`
    fn inv_melspectrogram(&self, mel: &[Vec<f32>]) -> Vec<f32>;

    fn sample_rate(&self) -> u32;

    /// Write `wav` as mono 16-bit PCM at the processor's sample rate
    fn save_wav(&self, wav: &[f32], path: &Path) -> Result<()> {
        write_wav(wav, self.sample_rate(), path)
    }
}

/// Write samples in `[-1, 1]` as mono 16-bit PCM, clipping the rest
pub fn write_wav(samples: &[f32], sample_rate: u32, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}
