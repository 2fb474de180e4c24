use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::characters::TextEncoder;
use crate::speakers::SpeakerMapping;

/// One utterance of the training metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsItem {
    pub text: String,
    /// Input ids, filled from `text` when the dataset is built
    #[serde(default)]
    pub tokens: Vec<i64>,
    pub speaker_name: String,
    /// Clip name, the key of external speaker embeddings
    pub item_name: String,
    /// Mel frames, `[frames][channels]`
    pub mel: Vec<Vec<f32>>,
    /// Precomputed attention, `[tokens][frames]`
    #[serde(default)]
    pub attn: Option<Vec<Vec<f32>>>,
}

impl TtsItem {
    pub fn num_frames(&self) -> usize {
        self.mel.len()
    }

    pub fn num_channels(&self) -> usize {
        self.mel.first().map(Vec::len).unwrap_or(0)
    }
}

/// Length-filtered utterances sorted by input length
#[derive(Debug, Clone)]
pub struct TtsDataset {
    items: Vec<TtsItem>,
}

impl TtsDataset {
    /// Encode every item and keep those with `min_seq_len <= tokens <= max_seq_len`
    pub fn new(
        items: Vec<TtsItem>,
        encoder: &dyn TextEncoder,
        min_seq_len: usize,
        max_seq_len: usize,
    ) -> Self {
        let total = items.len();
        let mut items: Vec<TtsItem> = items
            .into_iter()
            .map(|mut item| {
                item.tokens = encoder.encode(&item.text);
                item
            })
            .filter(|item| (min_seq_len..=max_seq_len).contains(&item.tokens.len()))
            .collect();
        items.sort_by_key(|item| item.tokens.len());

        let ignored = total - items.len();
        if ignored > 0 {
            println!(
                "Ignored {} of {} items outside [{}, {}] input symbols",
                ignored, total, min_seq_len, max_seq_len
            );
        }

        Self { items }
    }

    /// Shuffle consecutive groups of `group_size` items, keeping the rough length order
    pub fn shuffle_groups(&mut self, group_size: usize, seed: u64) {
        if group_size <= 1 {
            return;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for group in self.items.chunks_mut(group_size) {
            group.shuffle(&mut rng);
        }
    }

    pub fn items(&self) -> &[TtsItem] {
        &self.items
    }
}

impl Dataset<TtsItem> for TtsDataset {
    fn get(&self, index: usize) -> Option<TtsItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Collated batch as produced by the loader
#[derive(Debug, Clone)]
pub struct RawBatch<B: Backend> {
    /// `[batch, max_tokens]`, zero padded
    pub text: Tensor<B, 2, Int>,
    pub text_lengths: Tensor<B, 1, Int>,
    pub speaker_names: Vec<String>,
    /// `[batch, frames, channels]`, frames padded to a multiple of `r`
    pub mel: Tensor<B, 3>,
    pub mel_lengths: Tensor<B, 1, Int>,
    pub item_idx: Vec<usize>,
    /// `[batch, max_tokens, frames]`, present when every item carries one
    pub attn_mask: Option<Tensor<B, 3>>,
    /// `[batch, embedding_dim]`, present in external embedding mode
    pub speaker_embeddings: Option<Tensor<B, 2>>,
}

impl<B: Backend> RawBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.text.dims()[0]
    }
}

/// Pads and stacks items into a [`RawBatch`]
#[derive(Clone, Debug)]
pub struct TtsBatcher<B: Backend> {
    device: B::Device,
    r: usize,
    speakers: Option<Arc<SpeakerMapping>>,
}

impl<B: Backend> TtsBatcher<B> {
    pub fn new(device: B::Device, r: usize, speakers: Option<Arc<SpeakerMapping>>) -> Self {
        Self {
            device,
            r: r.max(1),
            speakers,
        }
    }

    fn speaker_embeddings(&self, items: &[(usize, TtsItem)]) -> Option<Tensor<B, 2>> {
        let mapping = self.speakers.as_deref()?;
        let dim = mapping.embedding_dim()?;
        let mut values = Vec::with_capacity(items.len() * dim);
        for (_, item) in items {
            values.extend_from_slice(mapping.embedding(&item.item_name)?);
        }
        Some(Tensor::from_data(TensorData::new(values, [items.len(), dim]), &self.device))
    }
}

impl<B: Backend> Batcher<(usize, TtsItem), RawBatch<B>> for TtsBatcher<B> {
    fn batch(&self, items: Vec<(usize, TtsItem)>) -> RawBatch<B> {
        let batch_size = items.len();
        let max_tokens = items.iter().map(|(_, item)| item.tokens.len()).max().unwrap_or(0);
        let max_frames = items.iter().map(|(_, item)| item.num_frames()).max().unwrap_or(0);
        let max_frames = max_frames.div_ceil(self.r) * self.r;
        let channels = items.iter().map(|(_, item)| item.num_channels()).max().unwrap_or(0);

        let mut text = vec![0i64; batch_size * max_tokens];
        let mut mel = vec![0f32; batch_size * max_frames * channels];
        let mut text_lengths = Vec::with_capacity(batch_size);
        let mut mel_lengths = Vec::with_capacity(batch_size);

        for (b, (_, item)) in items.iter().enumerate() {
            text[b * max_tokens..b * max_tokens + item.tokens.len()].copy_from_slice(&item.tokens);
            for (t, frame) in item.mel.iter().enumerate() {
                let offset = (b * max_frames + t) * channels;
                let len = frame.len().min(channels);
                mel[offset..offset + len].copy_from_slice(&frame[..len]);
            }
            text_lengths.push(item.tokens.len() as i64);
            mel_lengths.push(item.num_frames() as i64);
        }

        let attn_mask = if batch_size > 0 && items.iter().all(|(_, item)| item.attn.is_some()) {
            let mut attn = vec![0f32; batch_size * max_tokens * max_frames];
            for (b, (_, item)) in items.iter().enumerate() {
                for (i, row) in item.attn.iter().flatten().take(max_tokens).enumerate() {
                    let offset = (b * max_tokens + i) * max_frames;
                    let len = row.len().min(max_frames);
                    attn[offset..offset + len].copy_from_slice(&row[..len]);
                }
            }
            Some(Tensor::from_data(
                TensorData::new(attn, [batch_size, max_tokens, max_frames]),
                &self.device,
            ))
        } else {
            None
        };

        RawBatch {
            text: Tensor::from_data(TensorData::new(text, [batch_size, max_tokens]), &self.device),
            text_lengths: Tensor::from_data(TensorData::new(text_lengths, [batch_size]), &self.device),
            speaker_names: items.iter().map(|(_, item)| item.speaker_name.clone()).collect(),
            mel: Tensor::from_data(
                TensorData::new(mel, [batch_size, max_frames, channels]),
                &self.device,
            ),
            mel_lengths: Tensor::from_data(TensorData::new(mel_lengths, [batch_size]), &self.device),
            speaker_embeddings: self.speaker_embeddings(&items),
            item_idx: items.iter().map(|(idx, _)| *idx).collect(),
            attn_mask,
        }
    }
}
