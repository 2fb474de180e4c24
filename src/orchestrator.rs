use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::Optimizer,
    tensor::backend::AutodiffBackend,
};
use clap::Parser;

use crate::audio::AudioProcessor;
use crate::characters::CharacterSet;
use crate::checkpoint::{
    load_best_loss, remove_experiment_folder, restore_checkpoint, save_best_model, CheckpointMeta,
    RestoreOutcome,
};
use crate::collector::{EventLogCollector, MetricsCollector, NullCollector};
use crate::config::GlowTtsTrainingConfig;
use crate::console::ConsoleLogger;
use crate::context::TrainingContext;
use crate::dataset::TtsItem;
use crate::ddi::data_dependent_init;
use crate::distributed::{launch_replicas, ProcessGroup};
use crate::errors::{Result, ResultExt, TrainError};
use crate::evaluate::evaluate;
use crate::grad::GradScaler;
use crate::loader::setup_loader;
use crate::loss::GlowTtsLoss;
use crate::model::{DistributedModel, GlowModel, ModelWrapper, PlainModel};
use crate::schedule::{LearningRate, NoamLr};
use crate::speakers::{parse_speakers, SpeakerSetup};
use crate::train::{train_epoch, Optimization, Reporting};

const CONFIG_FILE: &str = "config.json";

/// Command line of a training run
#[derive(Parser, Debug, Clone)]
#[command(name = "train_glow_tts", about = "Train a Glow-TTS model")]
pub struct TrainArgs {
    /// Training configuration (JSON)
    #[arg(long)]
    pub config_path: PathBuf,

    /// Experiment folder for checkpoints, logs and test audio
    #[arg(long)]
    pub output_path: PathBuf,

    /// Checkpoint directory to continue from
    #[arg(long)]
    pub restore_path: Option<PathBuf>,

    /// Best model directory whose loss the run has to beat
    #[arg(long)]
    pub best_path: Option<PathBuf>,

    /// Replicas trained in lockstep, one per device
    #[arg(long, default_value_t = 1)]
    pub num_devices: usize,

    /// Training items (JSON list)
    #[arg(long)]
    pub train_metadata: PathBuf,

    /// Evaluation items (JSON list)
    #[arg(long)]
    pub eval_metadata: Option<PathBuf>,
}

/// Read a JSON list of items
pub fn load_metadata(path: &Path) -> Result<Vec<TtsItem>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata from {}", path.display()))?;
    Ok(serde_json::from_str(&contents)?)
}

/// What the model builder needs to know about the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub num_chars: usize,
    pub num_speakers: usize,
    pub speaker_embedding_dim: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub global_step: usize,
    pub best_loss: f64,
    pub epochs_run: usize,
    pub restore: Option<RestoreOutcome>,
}

/// State built once and shared by every replica
struct Setup {
    config: GlowTtsTrainingConfig,
    characters: CharacterSet,
    train_items: Vec<TtsItem>,
    eval_items: Vec<TtsItem>,
    speakers: SpeakerSetup,
}

impl Setup {
    fn load(args: &TrainArgs) -> Result<Self> {
        let config = GlowTtsTrainingConfig::load(&args.config_path).map_err(|e| TrainError::ConfigLoad {
            path: args.config_path.clone(),
            reason: e.to_string(),
        })?;
        let characters = CharacterSet::from_config(&config);

        let train_items = load_metadata(&args.train_metadata)?;
        let eval_items = match &args.eval_metadata {
            Some(path) => load_metadata(path)?,
            None => Vec::new(),
        };

        fs::create_dir_all(&args.output_path)?;
        let speakers = parse_speakers(
            &config,
            args.restore_path.as_deref(),
            &train_items,
            &args.output_path,
        )?;
        config.save(args.output_path.join(CONFIG_FILE))?;

        Ok(Self {
            config,
            characters,
            train_items,
            eval_items,
            speakers,
        })
    }

    fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            num_chars: self.characters.num_chars(),
            num_speakers: self.speakers.num_speakers,
            speaker_embedding_dim: self.speakers.embedding_dim,
        }
    }
}

/// Train a model built by `build_model` on `args.num_devices` of `devices`.
///
/// Configuration, metadata and speakers are prepared once; every replica then
/// builds, restores and trains its own copy of the model. Returns the summary
/// of rank 0.
pub fn run<B, M, F>(
    args: &TrainArgs,
    audio: &dyn AudioProcessor,
    devices: &[B::Device],
    build_model: F,
    interrupt: Arc<AtomicBool>,
) -> Result<RunSummary>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    M::InnerModule: GlowModel<B::InnerBackend>,
    F: Fn(&ModelSpec, &B::Device) -> M + Sync,
{
    let world_size = args.num_devices.max(1);
    if devices.len() < world_size {
        return Err(TrainError::InvalidParameter(format!(
            "{} devices requested, {} available",
            world_size,
            devices.len()
        )));
    }

    let setup = Setup::load(args)?;
    let spec = setup.model_spec();

    let mut summaries = launch_replicas(world_size, |group| {
        let device = devices[group.rank()].clone();
        let ctx = TrainingContext::<B>::new(
            setup.config.clone(),
            setup.characters.clone(),
            setup.speakers.mapping.clone(),
            device,
            group.clone(),
            args.output_path.clone(),
        )
        .with_interrupt(interrupt.clone());
        run_replica(&ctx, &setup, args, audio, build_model(&spec, &ctx.device), group)
    })?;

    Ok(summaries.swap_remove(0))
}

fn run_replica<B, M>(
    ctx: &TrainingContext<B>,
    setup: &Setup,
    args: &TrainArgs,
    audio: &dyn AudioProcessor,
    model: M,
    group: Arc<dyn ProcessGroup>,
) -> Result<RunSummary>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    M::InnerModule: GlowModel<B::InnerBackend>,
{
    let config = &ctx.config;
    let optimizer = config.optimizer.init::<B, M>();
    let mut scaler = GradScaler::new(config.mixed_precision);

    let (model, optimizer, restore_step, restore) = match &args.restore_path {
        Some(path) => {
            let restored = restore_checkpoint::<B, M, _>(path, model, optimizer, &ctx.device)?;
            if restored.meta.scaler.is_enabled() == config.mixed_precision {
                scaler = restored.meta.scaler.clone();
            }
            (
                restored.model,
                restored.optimizer,
                restored.meta.step,
                Some(restored.outcome),
            )
        }
        None => (model, optimizer, 0, None),
    };

    if ctx.is_primary() {
        println!("\n > Model has {} parameters", model.num_params());
    }

    let schedule = if config.noam_schedule {
        LearningRate::Noam(NoamLr::new(config.lr, config.warmup_steps, restore_step))
    } else {
        LearningRate::Constant(config.lr)
    };
    let optim = Optimization {
        optimizer,
        schedule,
        scaler,
    };

    if ctx.is_distributed() {
        let model = DistributedModel::new::<B>(model, group)?;
        run_epochs(ctx, setup, args, audio, model, optim, restore_step, restore)
    } else {
        run_epochs(ctx, setup, args, audio, PlainModel::new(model), optim, restore_step, restore)
    }
}

fn initial_best_loss(ctx: &TrainingContext<impl AutodiffBackend>, args: &TrainArgs, restore_step: usize) -> Result<f64> {
    let best_path = match &args.best_path {
        Some(path) if restore_step != 0 => path,
        _ => {
            if ctx.is_primary() {
                println!(" > Starting with inf best loss.");
            }
            return Ok(f64::INFINITY);
        }
    };
    let best_loss = load_best_loss(best_path)?;
    if ctx.is_primary() {
        println!(" > Restoring best loss from {} ...", best_path.display());
        println!(" > Starting with loaded last best loss {}.", best_loss);
    }
    Ok(best_loss)
}

#[allow(clippy::too_many_arguments)]
fn run_epochs<B, M, W, O>(
    ctx: &TrainingContext<B>,
    setup: &Setup,
    args: &TrainArgs,
    audio: &dyn AudioProcessor,
    mut model: W,
    mut optim: Optimization<O>,
    restore_step: usize,
    restore: Option<RestoreOutcome>,
) -> Result<RunSummary>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    M::InnerModule: GlowModel<B::InnerBackend>,
    W: ModelWrapper<B, M>,
    O: Optimizer<M, B>,
{
    let config = &ctx.config;
    let mut best_loss = initial_best_loss(ctx, args, restore_step)?;

    let mut train_loader = setup_loader::<B, B>(ctx, setup.train_items.clone(), false)
        .ok_or_else(|| TrainError::Generic("no training loader".to_string()))?;
    let mut eval_loader = setup_loader::<B::InnerBackend, B>(ctx, setup.eval_items.clone(), true);

    if restore == Some(RestoreOutcome::Full) {
        if ctx.is_primary() {
            println!(" > Skipping data depended initialization of a fully restored model");
        }
    } else {
        data_dependent_init(ctx, &train_loader, &mut model)?;
    }

    let mut collector: Box<dyn MetricsCollector> = if ctx.is_primary() {
        Box::new(EventLogCollector::new(&ctx.output_path)?)
    } else {
        Box::new(NullCollector)
    };
    let mut console = ConsoleLogger::new(ctx.is_primary());
    let criterion = GlowTtsLoss::new();

    let mut global_step = restore_step;
    let mut epochs_run = 0;
    for epoch in 0..config.epochs {
        ctx.check_interrupt()?;
        train_loader.set_epoch(epoch as u64);
        if let Some(loader) = eval_loader.as_mut() {
            loader.set_epoch(epoch as u64);
        }

        console.print_epoch_start(epoch, config.epochs);
        let mut reporting = Reporting {
            audio,
            collector: collector.as_mut(),
            console: &mut console,
        };
        let train = train_epoch(
            ctx,
            &train_loader,
            &mut model,
            &criterion,
            &mut optim,
            &mut reporting,
            global_step,
            epoch,
        )?;
        global_step = train.global_step;

        let eval = evaluate(
            ctx,
            eval_loader.as_ref(),
            &model,
            &criterion,
            &mut reporting,
            global_step,
            epoch,
        )?;
        reporting.console.print_epoch_end(epoch, &eval);

        let target_loss = match (config.run_eval, eval.get("avg_loss")) {
            (true, Some(loss)) => *loss,
            _ => train.averages.get("avg_loss").copied().unwrap_or(f64::INFINITY),
        };
        if ctx.is_primary() {
            let meta = CheckpointMeta::new(
                global_step,
                epoch,
                config.r,
                target_loss,
                ctx.characters.symbols().to_vec(),
            )
            .with_scheduler_step(optim.schedule.scheduler_step())
            .with_scaler(optim.scaler.clone());
            best_loss = save_best_model(
                best_loss,
                model.unwrap(),
                &optim.optimizer,
                &meta,
                &ctx.output_path,
                config.keep_all_best,
                config.keep_after,
            )?;
        }
        epochs_run += 1;
    }

    Ok(RunSummary {
        global_step,
        best_loss,
        epochs_run,
        restore,
    })
}

/// How a run ended
#[derive(Debug)]
pub enum RunStatus {
    Completed(RunSummary),
    Interrupted,
    Failed(TrainError),
}

impl RunStatus {
    /// Process exit code, 0 for completed and interrupted runs
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed(_) | RunStatus::Interrupted => 0,
            RunStatus::Failed(_) => 1,
        }
    }
}

/// [`run`], removing the experiment folder when the run fails or is interrupted
/// before writing any checkpoint
pub fn run_main<B, M, F>(
    args: &TrainArgs,
    audio: &dyn AudioProcessor,
    devices: &[B::Device],
    build_model: F,
    interrupt: Arc<AtomicBool>,
) -> RunStatus
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    M::InnerModule: GlowModel<B::InnerBackend>,
    F: Fn(&ModelSpec, &B::Device) -> M + Sync,
{
    let err = match run::<B, M, F>(args, audio, devices, build_model, interrupt) {
        Ok(summary) => return RunStatus::Completed(summary),
        Err(err) => err,
    };

    if let Err(cleanup) = remove_experiment_folder(&args.output_path) {
        eprintln!(" ! Failed to remove {}: {}", args.output_path.display(), cleanup);
    }
    match err {
        TrainError::Interrupted => RunStatus::Interrupted,
        err => {
            eprintln!(" ! Training failed: {}", err);
            RunStatus::Failed(err)
        }
    }
}

/// Flag raised by Ctrl-C, checked by the loops before every step
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        println!("\n ! Interrupt received, stopping before the next step");
        handler_flag.store(true, Ordering::SeqCst);
    })?;
    Ok(interrupt)
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::checkpoint::BEST_MODEL_DIR;
    use crate::testing::{corpus, test_config, MeanAudio, TestBackend, TinyGlow, TinyGlowConfig};
    use tempfile::TempDir;

    fn build(spec: &ModelSpec, device: &<TestBackend as burn::tensor::backend::Backend>::Device) -> TinyGlow<TestBackend> {
        TinyGlowConfig::new(spec.num_chars)
            .with_num_speakers(spec.num_speakers)
            .init(device)
    }

    fn write_inputs(dir: &Path, config: &GlowTtsTrainingConfig) -> TrainArgs {
        let config_path = dir.join("input_config.json");
        config.save(&config_path).unwrap();
        let train_metadata = dir.join("train.json");
        fs::write(&train_metadata, serde_json::to_string(&corpus(6)).unwrap()).unwrap();
        let eval_metadata = dir.join("eval.json");
        fs::write(&eval_metadata, serde_json::to_string(&corpus(3)).unwrap()).unwrap();

        TrainArgs {
            config_path,
            output_path: dir.join("run"),
            restore_path: None,
            best_path: None,
            num_devices: 1,
            train_metadata,
            eval_metadata: Some(eval_metadata),
        }
    }

    fn train(args: &TrainArgs, interrupt: bool) -> RunStatus {
        run_main::<TestBackend, _, _>(
            args,
            &MeanAudio,
            &[Default::default()],
            build,
            Arc::new(AtomicBool::new(interrupt)),
        )
    }

    #[test]
    fn test_args_parse() {
        let args = TrainArgs::try_parse_from([
            "train_glow_tts",
            "--config-path",
            "config.json",
            "--output-path",
            "out",
            "--train-metadata",
            "train.json",
        ])
        .unwrap();
        assert_eq!(args.num_devices, 1);
        assert!(args.restore_path.is_none());
        assert!(TrainArgs::try_parse_from(["train_glow_tts", "--output-path", "out"]).is_err());
    }

    #[test]
    fn test_full_run_then_resume() {
        let dir = TempDir::new().unwrap();
        let args = write_inputs(dir.path(), &test_config());

        let summary = match train(&args, false) {
            RunStatus::Completed(summary) => summary,
            other => panic!("unexpected status {:?}", other),
        };
        // 6 items in batches of 2, two epochs
        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.epochs_run, 2);
        assert!(summary.best_loss.is_finite());
        assert_eq!(summary.restore, None);

        let out = &args.output_path;
        for file in ["config.json", "events.jsonl", "checkpoint_2", "checkpoint_4", "checkpoint_6"] {
            assert!(out.join(file).exists(), "missing {}", file);
        }
        let best = CheckpointMeta::load(&out.join(BEST_MODEL_DIR)).unwrap();
        assert_eq!(best.model_loss, summary.best_loss);
        assert!(out.join("test_audios").join("3").join("TestSentence_0.wav").exists());

        let resume = TrainArgs {
            output_path: dir.path().join("resumed"),
            restore_path: Some(out.join("checkpoint_6")),
            best_path: Some(out.join(BEST_MODEL_DIR)),
            ..args.clone()
        };
        let resumed = match train(&resume, false) {
            RunStatus::Completed(summary) => summary,
            other => panic!("unexpected status {:?}", other),
        };
        assert_eq!(resumed.restore, Some(RestoreOutcome::Full));
        assert_eq!(resumed.global_step, 12);
        assert!(resumed.best_loss <= summary.best_loss);
    }

    #[test]
    fn test_interrupt_removes_fresh_folder_and_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        let args = write_inputs(dir.path(), &test_config());
        let status = train(&args, true);
        assert!(matches!(status, RunStatus::Interrupted));
        assert_eq!(status.exit_code(), 0);
        assert!(!args.output_path.exists());
    }

    #[test]
    fn test_bad_config_fails_with_exit_code_one() {
        let dir = TempDir::new().unwrap();
        let mut args = write_inputs(dir.path(), &test_config());
        args.config_path = dir.path().join("missing.json");
        let status = train(&args, false);
        assert!(matches!(status, RunStatus::Failed(TrainError::ConfigLoad { .. })));
        assert_eq!(status.exit_code(), 1);
    }

    #[test]
    fn test_missing_devices_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut args = write_inputs(dir.path(), &test_config());
        args.num_devices = 2;
        let status = train(&args, false);
        assert!(matches!(status, RunStatus::Failed(TrainError::InvalidParameter(_))));
    }
}
