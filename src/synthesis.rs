use std::fs;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::audio::AudioProcessor;
use crate::characters::TextEncoder;
use crate::config::GlowTtsTrainingConfig;
use crate::errors::{Result, ResultExt};
use crate::format::{FormattedBatch, SpeakerConditioning};
use crate::model::GlowModel;
use crate::speakers::SpeakerMapping;
use crate::visual::Figure;

pub const DEFAULT_TEST_SENTENCES: [&str; 5] = [
    "It took me quite a long time to develop a voice, and now that I have it I'm not going to be silent.",
    "Be a voice, not an echo.",
    "I'm sorry Dave. I'm afraid I can't do that.",
    "This cake is great. It's so delicious and moist.",
    "Prior to November 22, 1963.",
];

/// Sentences from `test_sentences_file`, one per non-empty line, or the built-in list
pub fn load_test_sentences(config: &GlowTtsTrainingConfig) -> Result<Vec<String>> {
    match &config.test_sentences_file {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read test sentences from {}", path))?;
            Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect())
        }
        None => Ok(DEFAULT_TEST_SENTENCES.iter().map(|s| s.to_string()).collect()),
    }
}

/// Speaker the test sentences are spoken by
#[derive(Debug, Clone, PartialEq)]
pub enum TestSpeaker {
    None,
    Id(usize),
    Embedding(Vec<f32>),
}

/// Id 0 in id mode, a random mapped clip's embedding in external-embedding mode
pub fn select_test_speaker(
    config: &GlowTtsTrainingConfig,
    mapping: Option<&SpeakerMapping>,
    seed: u64,
) -> TestSpeaker {
    if !config.use_speaker_embedding {
        return TestSpeaker::None;
    }
    match mapping {
        Some(SpeakerMapping::Embeddings(map)) if !map.is_empty() => {
            let mut rng = StdRng::seed_from_u64(seed);
            let index = rng.gen_range(0..map.len());
            map.values()
                .nth(index)
                .map(|entry| TestSpeaker::Embedding(entry.embedding.clone()))
                .unwrap_or(TestSpeaker::None)
        }
        Some(SpeakerMapping::Embeddings(_)) => TestSpeaker::None,
        _ => TestSpeaker::Id(0),
    }
}

impl TestSpeaker {
    fn conditioning<B: Backend>(&self, device: &B::Device) -> Option<SpeakerConditioning<B>> {
        match self {
            TestSpeaker::None => None,
            TestSpeaker::Id(id) => Some(SpeakerConditioning::Ids(Tensor::from_data(
                TensorData::new(vec![*id as i64], [1]),
                device,
            ))),
            TestSpeaker::Embedding(embedding) => Some(SpeakerConditioning::Embeddings(
                Tensor::from_data(TensorData::new(embedding.clone(), [1, embedding.len()]), device),
            )),
        }
    }
}

/// Audio and figures of one synthesized sentence
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub wav: Vec<f32>,
    pub spectrogram: Figure,
    pub alignment: Figure,
}

#[derive(Debug, Clone)]
pub enum SynthesisOutcome {
    Ok(Synthesis),
    Failed(String),
}

/// Synthesize `sentence` with the model's own durations.
///
/// Failures are reported in the outcome so one bad sentence never stops the run.
pub fn synthesize<B: Backend, G: GlowModel<B>>(
    model: &G,
    sentence: &str,
    encoder: &dyn TextEncoder,
    speaker: &TestSpeaker,
    audio: &dyn AudioProcessor,
    device: &B::Device,
) -> SynthesisOutcome {
    let tokens = encoder.encode(sentence);
    if tokens.is_empty() {
        return SynthesisOutcome::Failed("sentence contains no known symbols".to_string());
    }

    let len = tokens.len();
    let text = Tensor::<B, 2, Int>::from_data(TensorData::new(tokens, [1, len]), device);
    let lengths = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![len as i64], [1]), device);
    let output = model.inference(text, lengths, speaker.conditioning(device));

    let [_, channels, frames] = output.spec.dims();
    if frames == 0 {
        return SynthesisOutcome::Failed("model produced an empty spectrogram".to_string());
    }
    let [_, align_frames, align_tokens] = output.alignments.dims();

    let figures = Figure::spectrogram(output.spec.reshape([channels, frames])).and_then(|spec| {
        let alignment = Figure::alignment(output.alignments.reshape([align_frames, align_tokens]))?;
        Ok((spec, alignment))
    });
    let (spectrogram, alignment) = match figures {
        Ok(figures) => figures,
        Err(err) => return SynthesisOutcome::Failed(err.to_string()),
    };

    let wav = audio.inv_melspectrogram(&spectrogram.to_rows());
    if wav.iter().any(|s| !s.is_finite()) {
        return SynthesisOutcome::Failed("waveform contains non-finite samples".to_string());
    }

    SynthesisOutcome::Ok(Synthesis {
        wav,
        spectrogram,
        alignment,
    })
}

/// Prediction, ground truth and alignment of the first example of a batch
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub figures: Vec<(String, Figure)>,
    pub wav: Vec<f32>,
}

/// Run single-example inference on the first item of `batch` and collect the
/// figures and reconstructed waveform.
///
/// `alignments` are the `[batch, frames, tokens]` alignments of the forward pass.
pub fn diagnose<B: Backend, G: GlowModel<B>>(
    model: &G,
    batch: &FormattedBatch<B>,
    alignments: Tensor<B, 3>,
    audio: &dyn AudioProcessor,
) -> Result<Diagnostics> {
    let [_, max_tokens] = batch.text_input.dims();
    let text = batch.text_input.clone().slice([0..1, 0..max_tokens]);
    let lengths = batch.text_lengths.clone().slice([0..1]);
    let speaker = batch.speaker.as_ref().map(SpeakerConditioning::first);

    let spec = model.inference(text, lengths, speaker).spec;
    let [_, channels, frames] = spec.dims();
    let prediction = Figure::spectrogram(spec.reshape([channels, frames]))?;

    let [_, mel_channels, mel_frames] = batch.mel_input.dims();
    let ground_truth = Figure::spectrogram(
        batch
            .mel_input
            .clone()
            .slice([0..1, 0..mel_channels, 0..mel_frames])
            .reshape([mel_channels, mel_frames]),
    )?;

    let [_, align_frames, align_tokens] = alignments.dims();
    let alignment = Figure::alignment(
        alignments
            .detach()
            .slice([0..1, 0..align_frames, 0..align_tokens])
            .reshape([align_frames, align_tokens]),
    )?;

    let wav = audio.inv_melspectrogram(&prediction.to_rows());
    Ok(Diagnostics {
        figures: vec![
            ("prediction".to_string(), prediction),
            ("ground_truth".to_string(), ground_truth),
            ("alignment".to_string(), alignment),
        ],
        wav,
    })
}
