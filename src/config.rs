use burn::{config::Config, optim::AdamConfig};

/// Audio parameters the training loop needs to know about
#[derive(Config, Debug)]
pub struct AudioConfig {
    /// Output sample rate of reconstructed waveforms
    #[config(default = 22050)]
    pub sample_rate: u32,

    /// Number of mel channels per frame
    #[config(default = 80)]
    pub num_mels: usize,
}

/// Custom symbol inventory, overriding the built-in character set
#[derive(Config, Debug)]
pub struct CharactersConfig {
    pub pad: String,
    pub eos: String,
    pub bos: String,
    pub characters: String,
    pub punctuations: String,
    pub phonemes: String,
}

/// Configuration for Glow-TTS training
#[derive(Config)]
pub struct GlowTtsTrainingConfig {
    /// Optimizer configuration
    pub optimizer: AdamConfig,

    /// Audio configuration
    #[config(default = "AudioConfig::new()")]
    pub audio: AudioConfig,

    /// Custom characters, the built-in set is used when absent
    pub characters: Option<CharactersConfig>,

    /// Train on phonemes instead of graphemes
    #[config(default = false)]
    pub use_phonemes: bool,

    /// Intersperse a blank token between input symbols
    #[config(default = false)]
    pub add_blank: bool,

    /// Number of epochs to train
    #[config(default = 1000)]
    pub epochs: usize,

    /// Training batch size
    #[config(default = 32)]
    pub batch_size: usize,

    /// Evaluation batch size
    #[config(default = 16)]
    pub eval_batch_size: usize,

    /// Items shuffled together after length sorting, in batches (0 to disable)
    #[config(default = 0)]
    pub batch_group_size: usize,

    /// Minimum text length kept by the loader
    #[config(default = 3)]
    pub min_seq_len: usize,

    /// Maximum text length kept by the loader
    #[config(default = 500)]
    pub max_seq_len: usize,

    /// Reduction factor, stored with checkpoints
    #[config(default = 1)]
    pub r: usize,

    /// Base learning rate
    #[config(default = 1e-3)]
    pub lr: f64,

    /// Global gradient norm threshold
    #[config(default = 5.0)]
    pub grad_clip: f64,

    /// Use the Noam warmup schedule
    #[config(default = true)]
    pub noam_schedule: bool,

    /// Warmup steps of the Noam schedule
    #[config(default = 4000)]
    pub warmup_steps: usize,

    /// Dynamic loss scaling: the loss is multiplied before backward, steps
    /// with non-finite gradients are skipped and the scale backs off. The
    /// compute precision itself is the float element of the backend the
    /// caller picks (e.g. a half precision wgpu backend).
    #[config(default = false)]
    pub mixed_precision: bool,

    /// Worker threads of the training loader, 0 batches on the training thread
    #[config(default = 4)]
    pub num_loader_workers: usize,

    /// Worker threads of the evaluation loader
    #[config(default = 4)]
    pub num_val_loader_workers: usize,

    /// Console print interval (in steps)
    #[config(default = 25)]
    pub print_step: usize,

    /// Metrics emission interval (in steps)
    #[config(default = 10)]
    pub tb_plot_step: usize,

    /// Checkpoint and diagnostics interval (in steps)
    #[config(default = 5000)]
    pub save_step: usize,

    /// Write checkpoints at `save_step`
    #[config(default = true)]
    pub checkpoint: bool,

    /// Print every evaluation step
    #[config(default = false)]
    pub print_eval: bool,

    /// Run the evaluation loader
    #[config(default = true)]
    pub run_eval: bool,

    /// Epochs to wait before synthesizing test sentences
    #[config(default = 5)]
    pub test_delay_epochs: usize,

    /// File with one test sentence per line
    pub test_sentences_file: Option<String>,

    /// Warm-up batches for data-dependent initialization
    #[config(default = 10)]
    pub data_dep_init_steps: usize,

    /// Condition the model on speakers
    #[config(default = false)]
    pub use_speaker_embedding: bool,

    /// Read speaker embeddings from a precomputed file
    #[config(default = false)]
    pub use_external_speaker_embedding_file: bool,

    /// Path of the precomputed speaker embedding file
    pub external_speaker_embedding_file: Option<String>,

    /// Keep every improving best model instead of only the latest
    #[config(default = false)]
    pub keep_all_best: bool,

    /// Step after which `keep_all_best` takes effect
    #[config(default = 10000)]
    pub keep_after: usize,

    /// Emit per-parameter statistics at the end of each epoch
    #[config(default = false)]
    pub tb_model_param_stats: bool,

    /// Take evaluation diagnostics from the last batch (first batch otherwise)
    #[config(default = true)]
    pub eval_diagnostics_from_last_batch: bool,

    /// Random seed for reproducibility
    #[config(default = 54321)]
    pub seed: u64,
}

impl GlowTtsTrainingConfig {
    /// Adam with the betas and epsilon the Glow-TTS recipe trains with
    pub fn default_optimizer() -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.98)
            .with_epsilon(1e-9)
    }

    /// Create a configuration with the recipe defaults
    pub fn recipe() -> Self {
        Self::new(Self::default_optimizer())
    }
}
