//! Training loop for Glow-TTS style flow models on burn.
//!
//! The model, the vocoder and text processing are collaborators behind traits
//! ([`GlowModel`], [`AudioProcessor`], [`TextEncoder`]); this crate drives them
//! through data-dependent initialization, the train and evaluation epochs,
//! checkpointing and best-model selection, on one device or several replicas.

pub mod audio;
pub mod average;
pub mod characters;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod console;
pub mod context;
pub mod dataset;
pub mod ddi;
pub mod distributed;
pub mod errors;
pub mod evaluate;
pub mod flows;
pub mod format;
pub mod grad;
pub mod loader;
pub mod loss;
pub mod measures;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod record;
pub mod schedule;
pub mod speakers;
pub mod synthesis;
pub mod train;
pub mod visual;

#[cfg(all(test, feature = "ndarray"))]
pub mod testing;

pub use audio::AudioProcessor;
pub use characters::{CharacterSet, TextEncoder};
pub use checkpoint::{RestoreOutcome, Restored};
pub use collector::{EventLogCollector, MetricsCollector, NullCollector, Scope};
pub use config::{AudioConfig, CharactersConfig, GlowTtsTrainingConfig};
pub use context::TrainingContext;
pub use dataset::TtsItem;
pub use distributed::{ProcessGroup, SingleProcess, ThreadGroup};
pub use errors::{Result, TrainError};
pub use flows::{ActNorm, ActNormConfig, DdiFlow};
pub use format::{FormattedBatch, SpeakerConditioning};
pub use loss::{Criterion, GlowTtsLoss, LossTerms};
pub use model::{DistributedModel, FlowOutput, GlowModel, InferenceOutput, ModelWrapper, PlainModel};
pub use orchestrator::{install_interrupt_handler, run, run_main, ModelSpec, RunStatus, RunSummary, TrainArgs};
pub use speakers::SpeakerMapping;
pub use synthesis::SynthesisOutcome;

pub use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};
