use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::tensor::backend::Backend;

use crate::characters::CharacterSet;
use crate::config::GlowTtsTrainingConfig;
use crate::distributed::ProcessGroup;
use crate::errors::{Result, TrainError};
use crate::speakers::SpeakerMapping;

/// Everything the loops read but never change, built once per replica
pub struct TrainingContext<B: Backend> {
    pub config: GlowTtsTrainingConfig,
    pub characters: CharacterSet,
    pub speakers: Option<Arc<SpeakerMapping>>,
    pub device: B::Device,
    pub group: Arc<dyn ProcessGroup>,
    /// Experiment folder holding checkpoints and logs
    pub output_path: PathBuf,
    /// Root of the synthesized test sentences
    pub audio_path: PathBuf,
    pub interrupt: Arc<AtomicBool>,
}

impl<B: Backend> TrainingContext<B> {
    pub fn new(
        config: GlowTtsTrainingConfig,
        characters: CharacterSet,
        speakers: Option<Arc<SpeakerMapping>>,
        device: B::Device,
        group: Arc<dyn ProcessGroup>,
        output_path: PathBuf,
    ) -> Self {
        let audio_path = output_path.join("test_audios");
        Self {
            config,
            characters,
            speakers,
            device,
            group,
            output_path,
            audio_path,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an interrupt flag set from outside the loops
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Rank 0 owns checkpoints, console output and diagnostics
    pub fn is_primary(&self) -> bool {
        self.group.is_primary()
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// `Interrupted` once the flag is set on any replica.
    ///
    /// With several replicas this is a collective call, so every replica
    /// stops at the same step.
    pub fn check_interrupt(&self) -> Result<()> {
        let mut flag = [if self.interrupt.load(Ordering::SeqCst) { 1.0 } else { 0.0 }];
        if self.is_distributed() {
            self.group.all_reduce_sum(&mut flag)?;
        }
        if flag[0] > 0.0 {
            return Err(TrainError::Interrupted);
        }
        Ok(())
    }
}
