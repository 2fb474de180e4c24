//! Fixtures shared by the unit tests: a tiny flow model, small configs and
//! recording collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use burn::{
    backend::{ndarray::NdArray, Autodiff},
    config::Config,
    module::Module,
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use tempfile::TempDir;

use crate::audio::AudioProcessor;
use crate::characters::CharacterSet;
use crate::collector::{MetricsCollector, Scope};
use crate::config::{AudioConfig, GlowTtsTrainingConfig};
use crate::context::TrainingContext;
use crate::dataset::TtsItem;
use crate::distributed::{ProcessGroup, SingleProcess};
use crate::errors::Result;
use crate::flows::{ActNorm, ActNormConfig, DdiFlow};
use crate::format::{FormattedBatch, SpeakerConditioning};
use crate::model::{FlowOutput, GlowModel, InferenceOutput};
use crate::visual::Figure;

pub type TestBackend = Autodiff<NdArray<f32>>;

pub const TEST_CHANNELS: usize = 4;

/// Item with `frames` smooth 4-channel mel frames
pub fn item(text: &str, speaker: &str, frames: usize) -> TtsItem {
    let mel = (0..frames)
        .map(|t| {
            (0..TEST_CHANNELS)
                .map(|c| ((t * TEST_CHANNELS + c) as f32 * 0.1).sin())
                .collect()
        })
        .collect();
    TtsItem {
        text: text.to_string(),
        tokens: Vec::new(),
        speaker_name: speaker.to_string(),
        item_name: format!("clip_{}", text),
        mel,
        attn: None,
    }
}

pub fn test_config() -> GlowTtsTrainingConfig {
    GlowTtsTrainingConfig::recipe()
        .with_audio(AudioConfig::new().with_num_mels(TEST_CHANNELS).with_sample_rate(8000))
        .with_epochs(2)
        .with_batch_size(2)
        .with_eval_batch_size(2)
        .with_min_seq_len(1)
        .with_lr(1e-3)
        .with_warmup_steps(10)
        .with_print_step(1)
        .with_tb_plot_step(1)
        .with_save_step(2)
        .with_test_delay_epochs(0)
        .with_data_dep_init_steps(1)
        .with_keep_after(0)
        .with_num_loader_workers(0)
        .with_num_val_loader_workers(0)
}

/// Context whose output folder lives as long as the returned `TempDir`
pub fn context(config: GlowTtsTrainingConfig) -> (TempDir, TrainingContext<TestBackend>) {
    context_with_group(config, Arc::new(SingleProcess))
}

pub fn context_with_group(
    config: GlowTtsTrainingConfig,
    group: Arc<dyn ProcessGroup>,
) -> (TempDir, TrainingContext<TestBackend>) {
    let dir = TempDir::new().unwrap();
    let characters = CharacterSet::from_config(&config);
    let ctx = TrainingContext::new(
        config,
        characters,
        None,
        Default::default(),
        group,
        dir.path().to_path_buf(),
    );
    (dir, ctx)
}

/// Items whose texts the default grapheme set encodes to 2..=6 ids
pub fn corpus(n: usize) -> Vec<TtsItem> {
    (0..n)
        .map(|i| {
            let text = "abcdef"[..2 + i % 5].to_string();
            item(&text, if i % 2 == 0 { "adam" } else { "zoe" }, 3 + i % 4)
        })
        .collect()
}

/// World of one that counts collective calls
#[derive(Debug, Default)]
pub struct CountingGroup {
    pub calls: AtomicUsize,
}

impl ProcessGroup for CountingGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Event recorded by [`RecordingCollector`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Scalars(Scope, usize, Vec<String>),
    Figures(Scope, usize, Vec<String>),
    Audios(Scope, usize, Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct RecordingCollector {
    pub events: Arc<Mutex<Vec<Recorded>>>,
    /// `(scope, name, rows, cols)` of every figure
    pub figure_shapes: Arc<Mutex<Vec<(Scope, String, usize, usize)>>>,
}

impl RecordingCollector {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn figure_shape(&self, scope: Scope, name: &str) -> Option<(usize, usize)> {
        self.figure_shapes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, n, _, _)| *s == scope && n == name)
            .map(|&(_, _, rows, cols)| (rows, cols))
    }
}

impl MetricsCollector for RecordingCollector {
    fn scalars(&mut self, scope: Scope, step: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        let names = values.keys().cloned().collect();
        self.events.lock().unwrap().push(Recorded::Scalars(scope, step, names));
        Ok(())
    }

    fn figures(&mut self, scope: Scope, step: usize, figures: &[(String, Figure)]) -> Result<()> {
        let names = figures.iter().map(|(n, _)| n.clone()).collect();
        self.events.lock().unwrap().push(Recorded::Figures(scope, step, names));
        self.figure_shapes
            .lock()
            .unwrap()
            .extend(figures.iter().map(|(n, f)| (scope, n.clone(), f.rows, f.cols)));
        Ok(())
    }

    fn audios(
        &mut self,
        scope: Scope,
        step: usize,
        audios: &[(String, Vec<f32>)],
        _sample_rate: u32,
    ) -> Result<()> {
        let names = audios.iter().map(|(n, _)| n.clone()).collect();
        self.events.lock().unwrap().push(Recorded::Audios(scope, step, names));
        Ok(())
    }
}

/// Each frame becomes the mean of its channels, repeated 4 times
pub struct MeanAudio;

impl AudioProcessor for MeanAudio {
    fn inv_melspectrogram(&self, mel: &[Vec<f32>]) -> Vec<f32> {
        let frames = mel.first().map(Vec::len).unwrap_or(0);
        (0..frames)
            .flat_map(|t| {
                let mean = mel.iter().map(|row| row[t]).sum::<f32>() / mel.len() as f32;
                std::iter::repeat(mean.tanh()).take(4)
            })
            .collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}

#[derive(Config, Debug)]
pub struct TinyGlowConfig {
    num_chars: usize,
    #[config(default = 4)]
    channels: usize,
    #[config(default = 2)]
    num_flows: usize,
    #[config(default = 0)]
    num_speakers: usize,
}

impl TinyGlowConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinyGlow<B> {
        TinyGlow {
            embedding: EmbeddingConfig::new(self.num_chars, self.channels).init(device),
            proj_mean: LinearConfig::new(self.channels, self.channels).init(device),
            proj_logs: LinearConfig::new(self.channels, self.channels).init(device),
            proj_dur: LinearConfig::new(self.channels, 1).init(device),
            speaker: (self.num_speakers > 0)
                .then(|| EmbeddingConfig::new(self.num_speakers, self.channels).init(device)),
            flows: (0..self.num_flows)
                .map(|_| ActNormConfig::new(self.channels).init(device))
                .collect(),
        }
    }
}

/// Text encoder with linear projections, a uniform hard alignment and a stack
/// of ActNorm flows as decoder
#[derive(Module, Debug)]
pub struct TinyGlow<B: Backend> {
    embedding: Embedding<B>,
    proj_mean: Linear<B>,
    proj_logs: Linear<B>,
    proj_dur: Linear<B>,
    speaker: Option<Embedding<B>>,
    flows: Vec<ActNorm<B>>,
}

struct Prior<B: Backend> {
    /// `[batch, channels, tokens]`
    mean: Tensor<B, 3>,
    logs: Tensor<B, 3>,
    /// `[batch, 1, tokens]`
    dur_log_pred: Tensor<B, 3>,
    x_mask: Tensor<B, 3>,
}

fn host_lengths<B: Backend>(lengths: &Tensor<B, 1, Int>) -> Vec<usize> {
    lengths
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap()
        .into_iter()
        .map(|l| l.max(0) as usize)
        .collect()
}

fn sequence_mask<B: Backend>(lengths: &[usize], max_len: usize, device: &B::Device) -> Tensor<B, 3> {
    let values = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0f32 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(values, [lengths.len(), 1, max_len]), device)
}

/// `[batch, frames, tokens]` hard alignment giving token `i` the frames of `spans[b][i]`
fn alignment_from_spans<B: Backend>(
    spans: &[Vec<usize>],
    max_tokens: usize,
    max_frames: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let mut values = vec![0f32; spans.len() * max_frames * max_tokens];
    for (b, durations) in spans.iter().enumerate() {
        let mut frame = 0;
        for (token, &duration) in durations.iter().enumerate() {
            for _ in 0..duration {
                if frame < max_frames {
                    values[(b * max_frames + frame) * max_tokens + token] = 1.0;
                }
                frame += 1;
            }
        }
    }
    Tensor::from_data(TensorData::new(values, [spans.len(), max_frames, max_tokens]), device)
}

/// Spread `frames` as evenly as possible over `tokens`
fn uniform_durations(tokens: usize, frames: usize) -> Vec<usize> {
    if tokens == 0 {
        return Vec::new();
    }
    (0..tokens)
        .map(|i| (i + 1) * frames / tokens - i * frames / tokens)
        .collect()
}

impl<B: Backend> TinyGlow<B> {
    fn prior(
        &self,
        text: Tensor<B, 2, Int>,
        text_lengths: &[usize],
        speaker: Option<&SpeakerConditioning<B>>,
    ) -> Prior<B> {
        let device = text.device();
        let [_, max_tokens] = text.dims();
        let mut x = self.embedding.forward(text);
        if let (Some(SpeakerConditioning::Ids(ids)), Some(table)) = (speaker, &self.speaker) {
            let [batch] = ids.dims();
            x = x + table.forward(ids.clone().reshape([batch, 1]));
        }
        let x_mask = sequence_mask::<B>(text_lengths, max_tokens, &device);
        let mean = self.proj_mean.forward(x.clone()).swap_dims(1, 2) * x_mask.clone();
        let logs = self.proj_logs.forward(x.clone()).tanh().swap_dims(1, 2) * x_mask.clone();
        let dur_log_pred = self.proj_dur.forward(x).swap_dims(1, 2) * x_mask.clone();
        Prior {
            mean,
            logs,
            dur_log_pred,
            x_mask,
        }
    }

    fn training_prior(&self, batch: &FormattedBatch<B>) -> (Prior<B>, Tensor<B, 3>, Tensor<B, 3>) {
        let device = batch.mel_input.device();
        let [_, _, max_frames] = batch.mel_input.dims();
        let text_lengths = host_lengths(&batch.text_lengths);
        let mel_lengths = host_lengths(&batch.mel_lengths);
        let prior = self.prior(batch.text_input.clone(), &text_lengths, batch.speaker.as_ref());
        let [_, _, max_tokens] = prior.mean.dims();

        let spans: Vec<Vec<usize>> = text_lengths
            .iter()
            .zip(&mel_lengths)
            .map(|(&t, &m)| uniform_durations(t, m))
            .collect();
        let attn = alignment_from_spans::<B>(&spans, max_tokens, max_frames, &device);
        let y_mask = sequence_mask::<B>(&mel_lengths, max_frames, &device);
        (prior, attn, y_mask)
    }

    fn assemble(
        &self,
        prior: Prior<B>,
        attn: Tensor<B, 3>,
        y_mask: Tensor<B, 3>,
        z: Tensor<B, 3>,
        logdet: Tensor<B, 1>,
    ) -> FlowOutput<B> {
        let y_mean = attn.clone().matmul(prior.mean.swap_dims(1, 2)).swap_dims(1, 2) * y_mask.clone();
        let y_log_scale = attn.clone().matmul(prior.logs.swap_dims(1, 2)).swap_dims(1, 2) * y_mask;
        let dur_log_total = (attn.clone().sum_dim(1).add_scalar(1.0)).log() * prior.x_mask.clone();
        FlowOutput {
            z,
            logdet,
            y_mean,
            y_log_scale,
            alignments: attn,
            dur_log_pred: prior.dur_log_pred,
            dur_log_total,
        }
    }
}

impl<B: Backend> GlowModel<B> for TinyGlow<B> {
    fn forward(&self, batch: &FormattedBatch<B>) -> FlowOutput<B> {
        let (prior, attn, y_mask) = self.training_prior(batch);
        let mut z = batch.mel_input.clone() * y_mask.clone();
        let mut logdet = Tensor::zeros([batch.batch_size()], &z.device());
        for flow in &self.flows {
            let (out, ld) = flow.forward(z, y_mask.clone());
            z = out;
            logdet = logdet + ld;
        }
        self.assemble(prior, attn, y_mask, z, logdet)
    }

    fn forward_initializing(&mut self, batch: &FormattedBatch<B>) -> FlowOutput<B> {
        let (prior, attn, y_mask) = self.training_prior(batch);
        let mut z = batch.mel_input.clone() * y_mask.clone();
        let mut logdet = Tensor::zeros([batch.batch_size()], &z.device());
        for flow in self.flows.iter_mut() {
            let (out, ld) = flow.forward_initializing(z, y_mask.clone());
            z = out;
            logdet = logdet + ld;
        }
        self.assemble(prior, attn, y_mask, z, logdet)
    }

    fn inference(
        &self,
        text: Tensor<B, 2, Int>,
        text_lengths: Tensor<B, 1, Int>,
        speaker: Option<SpeakerConditioning<B>>,
    ) -> InferenceOutput<B> {
        let device = text.device();
        let lengths = host_lengths(&text_lengths);
        let prior = self.prior(text, &lengths, speaker.as_ref());
        let [batch, _, max_tokens] = prior.mean.dims();

        let durations: Vec<f32> = prior
            .dur_log_pred
            .clone()
            .exp()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        let spans: Vec<Vec<usize>> = (0..batch)
            .map(|b| {
                (0..lengths[b])
                    .map(|i| durations[b * max_tokens + i].ceil().clamp(1.0, 8.0) as usize)
                    .collect()
            })
            .collect();
        let frames: Vec<usize> = spans.iter().map(|s| s.iter().sum()).collect();
        let max_frames = frames.iter().copied().max().unwrap_or(0).max(1);

        let attn = alignment_from_spans::<B>(&spans, max_tokens, max_frames, &device);
        let y_mask = sequence_mask::<B>(&frames, max_frames, &device);
        let mut y = attn.clone().matmul(prior.mean.swap_dims(1, 2)).swap_dims(1, 2) * y_mask.clone();
        for flow in self.flows.iter().rev() {
            y = flow.reverse(y, y_mask.clone());
        }
        InferenceOutput {
            spec: y * y_mask,
            alignments: attn,
        }
    }

    fn decoder_flows_mut(&mut self) -> Vec<&mut dyn DdiFlow> {
        self.flows.iter_mut().map(|f| f as &mut dyn DdiFlow).collect()
    }
}

impl<B: Backend> TinyGlow<B> {
    pub fn flows(&self) -> &[ActNorm<B>] {
        &self.flows
    }
}

pub fn tiny_model(ctx: &TrainingContext<TestBackend>) -> TinyGlow<TestBackend> {
    TinyGlowConfig::new(ctx.characters.num_chars()).init(&ctx.device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characters::TextEncoder;
    use crate::dataset::TtsBatcher;
    use crate::format::format_batch;
    use burn::data::dataloader::batcher::Batcher;

    #[test]
    fn test_tiny_model_shapes() {
        let (_dir, ctx) = context(test_config());
        let model = tiny_model(&ctx);
        let items: Vec<(usize, TtsItem)> = corpus(2)
            .into_iter()
            .map(|mut it| {
                it.tokens = ctx.characters.encode(&it.text);
                it
            })
            .enumerate()
            .collect();
        let raw = TtsBatcher::<TestBackend>::new(ctx.device.clone(), 1, None).batch(items);
        let batch = format_batch(&ctx.config, None, raw, &ctx.device).unwrap();
        let out = model.forward(&batch);

        assert_eq!(out.z.dims(), [2, TEST_CHANNELS, 4]);
        assert_eq!(out.alignments.dims(), [2, 4, 3]);
        assert_eq!(out.dur_log_pred.dims(), [2, 1, 3]);
        assert_eq!(out.logdet.dims(), [2]);

        let inf = model.inference(batch.text_input, batch.text_lengths, None);
        assert_eq!(inf.spec.dims()[1], TEST_CHANNELS);
    }
}
