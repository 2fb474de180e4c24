use burn::tensor::{backend::Backend, cast::ToElement, Int, Tensor, TensorData};

use crate::config::GlowTtsTrainingConfig;
use crate::dataset::RawBatch;
use crate::errors::{Result, TrainError};
use crate::speakers::SpeakerMapping;

/// Speaker input of the model for one batch
#[derive(Debug, Clone)]
pub enum SpeakerConditioning<B: Backend> {
    /// `[batch]` indices into the speaker embedding table
    Ids(Tensor<B, 1, Int>),
    /// `[batch, embedding_dim]` precomputed embeddings
    Embeddings(Tensor<B, 2>),
}

impl<B: Backend> SpeakerConditioning<B> {
    pub fn batch_size(&self) -> usize {
        match self {
            SpeakerConditioning::Ids(ids) => ids.dims()[0],
            SpeakerConditioning::Embeddings(embeddings) => embeddings.dims()[0],
        }
    }

    /// Conditioning of the first example only
    pub fn first(&self) -> Self {
        match self {
            SpeakerConditioning::Ids(ids) => SpeakerConditioning::Ids(ids.clone().slice([0..1])),
            SpeakerConditioning::Embeddings(embeddings) => {
                let dim = embeddings.dims()[1];
                SpeakerConditioning::Embeddings(embeddings.clone().slice([0..1, 0..dim]))
            }
        }
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        match self {
            SpeakerConditioning::Ids(ids) => SpeakerConditioning::Ids(ids.to_device(device)),
            SpeakerConditioning::Embeddings(embeddings) => {
                SpeakerConditioning::Embeddings(embeddings.to_device(device))
            }
        }
    }
}

/// Model-ready batch with named tensors on the compute device
#[derive(Debug, Clone)]
pub struct FormattedBatch<B: Backend> {
    /// `[batch, max_tokens]`
    pub text_input: Tensor<B, 2, Int>,
    pub text_lengths: Tensor<B, 1, Int>,
    /// `[batch, channels, frames]`
    pub mel_input: Tensor<B, 3>,
    pub mel_lengths: Tensor<B, 1, Int>,
    pub speaker: Option<SpeakerConditioning<B>>,
    pub avg_text_length: f64,
    pub avg_spec_length: f64,
    pub attn_mask: Option<Tensor<B, 3>>,
    pub item_idx: Vec<usize>,
}

impl<B: Backend> FormattedBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.text_input.dims()[0]
    }
}

/// Name the fields of a collated batch, transpose the mels to channel-major and
/// resolve speaker conditioning.
///
/// Speaker conditioning is present iff `use_speaker_embedding` is set. A speaker
/// name missing from the mapping is an upstream loader bug and is reported as
/// [`TrainError::UnknownSpeaker`].
pub fn format_batch<B: Backend>(
    config: &GlowTtsTrainingConfig,
    speakers: Option<&SpeakerMapping>,
    batch: RawBatch<B>,
    device: &B::Device,
) -> Result<FormattedBatch<B>> {
    let batch_size = batch.batch_size();

    let speaker = if !config.use_speaker_embedding {
        None
    } else if config.use_external_speaker_embedding_file {
        let embeddings = batch.speaker_embeddings.ok_or_else(|| {
            TrainError::Speakers("batch carries no precomputed speaker embeddings".to_string())
        })?;
        Some(SpeakerConditioning::Embeddings(embeddings))
    } else {
        let mapping = speakers.ok_or_else(|| {
            TrainError::Speakers("speaker embedding is enabled without a speaker mapping".to_string())
        })?;
        let ids = batch
            .speaker_names
            .iter()
            .map(|name| {
                mapping
                    .speaker_id(name)
                    .map(|id| id as i64)
                    .ok_or_else(|| TrainError::UnknownSpeaker(name.clone()))
            })
            .collect::<Result<Vec<i64>>>()?;
        Some(SpeakerConditioning::Ids(Tensor::from_data(
            TensorData::new(ids, [batch_size]),
            device,
        )))
    };

    let avg_text_length = mean_length(&batch.text_lengths);
    let avg_spec_length = mean_length(&batch.mel_lengths);

    Ok(FormattedBatch {
        text_input: batch.text.to_device(device),
        text_lengths: batch.text_lengths.to_device(device),
        mel_input: batch.mel.swap_dims(1, 2).to_device(device),
        mel_lengths: batch.mel_lengths.to_device(device),
        speaker: speaker.map(|s| s.to_device(device)),
        avg_text_length,
        avg_spec_length,
        attn_mask: batch.attn_mask.map(|mask| mask.to_device(device)),
        item_idx: batch.item_idx,
    })
}

fn mean_length<B: Backend>(lengths: &Tensor<B, 1, Int>) -> f64 {
    if lengths.dims()[0] == 0 {
        return 0.0;
    }
    lengths.clone().float().mean().into_scalar().to_f64()
}
