use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TrainError};
use crate::grad::GradScaler;
use crate::record::{param_layout, StoredParams};

const META_FILE: &str = "meta.json";
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
/// Extension the recorder appends to `MODEL_FILE` and `OPTIMIZER_FILE`
const RECORD_EXTENSION: &str = "mpk";

/// Directory name of the latest best model
pub const BEST_MODEL_DIR: &str = "best_model";
const BEST_MODEL_PREFIX: &str = "best_model_";
const CHECKPOINT_PREFIX: &str = "checkpoint_";

/// Training state stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub epoch: usize,
    pub r: usize,
    pub model_loss: f64,
    /// Symbols the model embeds, in id order
    pub characters: Vec<String>,
    pub scheduler_step: Option<usize>,
    pub scaler: GradScaler,
    /// Seconds since the Unix epoch
    pub saved_at: u64,
}

impl CheckpointMeta {
    pub fn new(step: usize, epoch: usize, r: usize, model_loss: f64, characters: Vec<String>) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            step,
            epoch,
            r,
            model_loss,
            characters,
            scheduler_step: None,
            scaler: GradScaler::new(false),
            saved_at,
        }
    }

    pub fn with_scheduler_step(mut self, step: Option<usize>) -> Self {
        self.scheduler_step = step;
        self
    }

    pub fn with_scaler(mut self, scaler: GradScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        let contents = fs::read_to_string(&path).map_err(|e| TrainError::Checkpoint {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// How much of a checkpoint made it into the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Model and optimizer restored exactly
    Full,
    /// Layouts differ or the full load failed: tensors whose path and shape
    /// match are loaded, the optimizer starts fresh
    Partial { loaded: usize, skipped: usize },
}

/// Model, optimizer and state read back from a checkpoint
pub struct Restored<M, O> {
    pub model: M,
    pub optimizer: O,
    pub meta: CheckpointMeta,
    pub outcome: RestoreOutcome,
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Debug) -> TrainError {
    TrainError::Checkpoint {
        path: path.to_path_buf(),
        reason: format!("{:?}", err),
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::new()
}

fn write_checkpoint<B, M, O>(dir: &Path, model: &M, optimizer: &O, meta: &CheckpointMeta) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fs::create_dir_all(dir)?;
    let recorder = recorder();

    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder)
        .map_err(|e| checkpoint_error(dir, e))?;
    Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join(OPTIMIZER_FILE))
        .map_err(|e| checkpoint_error(dir, e))?;
    meta.save(dir)
}

/// Write `checkpoint_<step>/` under `output_path`
pub fn save_checkpoint<B, M, O>(
    model: &M,
    optimizer: &O,
    meta: &CheckpointMeta,
    output_path: &Path,
) -> Result<PathBuf>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let dir = output_path.join(format!("{}{}", CHECKPOINT_PREFIX, meta.step));
    println!(" > CHECKPOINT : {}", dir.display());
    write_checkpoint(&dir, model, optimizer, meta)?;
    Ok(dir)
}

/// Save a new best model when `meta.model_loss` is strictly below `best_loss`.
///
/// Older `best_model_<step>` directories are pruned unless `keep_all_best` is
/// set and the step has reached `keep_after`. `best_model/` always mirrors the
/// latest best. Returns the updated best loss.
pub fn save_best_model<B, M, O>(
    best_loss: f64,
    model: &M,
    optimizer: &O,
    meta: &CheckpointMeta,
    output_path: &Path,
    keep_all_best: bool,
    keep_after: usize,
) -> Result<f64>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    if !(meta.model_loss < best_loss) {
        return Ok(best_loss);
    }

    let name = format!("{}{}", BEST_MODEL_PREFIX, meta.step);
    let dir = output_path.join(&name);
    println!(" > BEST MODEL : {}", dir.display());
    write_checkpoint(&dir, model, optimizer, meta)?;

    if !keep_all_best || meta.step < keep_after {
        for entry in fs::read_dir(output_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(BEST_MODEL_PREFIX) && file_name != name {
                fs::remove_dir_all(entry.path())?;
            }
        }
    }

    let shortcut = output_path.join(BEST_MODEL_DIR);
    if shortcut.exists() {
        fs::remove_dir_all(&shortcut)?;
    }
    copy_dir(&dir, &shortcut)?;

    Ok(meta.model_loss)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::copy(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

/// `model_loss` stored in the checkpoint at `best_path`
pub fn load_best_loss(best_path: &Path) -> Result<f64> {
    Ok(CheckpointMeta::load(best_path)?.model_loss)
}

fn load_full<B, M, O>(dir: &Path, model: M, device: &B::Device) -> Result<(M, O::Record)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let recorder = recorder();
    let model = model
        .load_file(dir.join(MODEL_FILE), &recorder, device)
        .map_err(|e| checkpoint_error(dir, e))?;
    let record = Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_FILE), device)
        .map_err(|e| checkpoint_error(dir, e))?;
    Ok((model, record))
}

/// Restore model and optimizer from a checkpoint directory.
///
/// When the stored parameters do not match `model` path for path and shape
/// for shape, or the model or optimizer record cannot be loaded, every tensor
/// whose path and shape match is loaded, the rest keep their initialization
/// and `optimizer` is returned untouched. Fails only when the stored model
/// cannot be read at all.
pub fn restore_checkpoint<B, M, O>(
    dir: &Path,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> Result<Restored<M, O>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    println!(" > Restoring from {} ...", dir.display());
    let meta = CheckpointMeta::load(dir)?;
    let stored = StoredParams::read(&dir.join(MODEL_FILE).with_extension(RECORD_EXTENSION))?;

    if stored.matches(&param_layout(&model)?) {
        match load_full::<B, M, O>(dir, model.clone(), device) {
            Ok((model, record)) => {
                let optimizer = optimizer.load_record(record);
                println!(" > Model restored from step {}", meta.step);
                return Ok(Restored {
                    model,
                    optimizer,
                    meta,
                    outcome: RestoreOutcome::Full,
                });
            }
            Err(err) => println!(" > WARNING: full restore failed: {}", err),
        }
    }

    let (model, report) = stored.apply(model)?;
    println!(
        " > WARNING: partial model initialization, {} tensors loaded, {} skipped",
        report.loaded, report.skipped
    );
    println!(" > Model restored from step {}", meta.step);
    Ok(Restored {
        model,
        optimizer,
        meta,
        outcome: RestoreOutcome::Partial {
            loaded: report.loaded,
            skipped: report.skipped,
        },
    })
}

/// Whether `dir` holds a checkpoint or best model written by this run
pub fn has_checkpoint(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(CHECKPOINT_PREFIX) || name.starts_with(BEST_MODEL_PREFIX))
                    && entry.path().join(META_FILE).exists()
            })
        })
        .unwrap_or(false)
}

/// Delete an experiment folder that never produced a checkpoint
pub fn remove_experiment_folder(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    if has_checkpoint(dir) {
        println!(" ! Run is kept in {}", dir.display());
        return Ok(false);
    }
    fs::remove_dir_all(dir)?;
    println!(" ! Run is removed from {}", dir.display());
    Ok(true)
}
