use std::collections::BTreeMap;
use std::time::Instant;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::backend::{AutodiffBackend, Backend},
};

use crate::audio::AudioProcessor;
use crate::average::KeepAverage;
use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::collector::{MetricsCollector, Scope};
use crate::console::ConsoleLogger;
use crate::context::TrainingContext;
use crate::distributed::reduce_mean;
use crate::errors::Result;
use crate::format::format_batch;
use crate::grad::{clip_grad_norm, scale_gradients, GradScaler};
use crate::loader::TtsDataLoader;
use crate::loss::{Criterion, LossTerms};
use crate::measures::alignment_diagonal_score;
use crate::model::{GlowModel, ModelWrapper};
use crate::params::param_stats;
use crate::schedule::LearningRate;
use crate::synthesis::diagnose;

/// Optimizer together with the state that moves with it
pub struct Optimization<O> {
    pub optimizer: O,
    pub schedule: LearningRate,
    pub scaler: GradScaler,
}

/// Where the loops send their output
pub struct Reporting<'a> {
    pub audio: &'a dyn AudioProcessor,
    pub collector: &'a mut dyn MetricsCollector,
    pub console: &'a mut ConsoleLogger,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Epoch means, keyed `avg_<name>`
    pub averages: BTreeMap<String, f64>,
    pub global_step: usize,
}

pub(crate) fn every(step: usize, interval: usize) -> bool {
    interval > 0 && step % interval == 0
}

/// Loss terms, averaged over replicas when distributed, plus the local
/// alignment error
pub(crate) fn batch_losses<B: Backend, C: Backend>(
    ctx: &TrainingContext<C>,
    terms: &LossTerms<B>,
    align_error: f64,
) -> Result<Vec<(&'static str, f64)>> {
    let mut values: Vec<f64> = terms.values().to_vec();
    if ctx.is_distributed() {
        let mut reduced: Vec<f32> = values.iter().map(|&v| v as f32).collect();
        reduce_mean(ctx.group.as_ref(), &mut reduced)?;
        values = reduced.into_iter().map(f64::from).collect();
    }
    values.push(align_error);
    Ok(LossTerms::<B>::NAMES
        .iter()
        .copied()
        .chain(std::iter::once("align_error"))
        .zip(values)
        .collect())
}

/// One pass over the training loader.
///
/// Every step formats the batch, runs forward and backward, averages and clips
/// the gradients and updates the model. Rank 0 additionally emits metrics,
/// writes checkpoints and renders diagnostics at the configured intervals.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, M, W, O, C>(
    ctx: &TrainingContext<B>,
    loader: &TtsDataLoader<B>,
    model: &mut W,
    criterion: &C,
    optim: &mut Optimization<O>,
    reporting: &mut Reporting<'_>,
    mut global_step: usize,
    epoch: usize,
) -> Result<TrainOutcome>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    W: ModelWrapper<B, M>,
    O: Optimizer<M, B>,
    C: Criterion<B>,
{
    let config = &ctx.config;
    let num_batches = loader.num_batches();
    let mut keep_avg = KeepAverage::new();
    let epoch_start = Instant::now();
    reporting.console.print_train_start(num_batches);

    let mut batch_start = Instant::now();
    for (num_iter, raw) in loader.iter().enumerate() {
        ctx.check_interrupt()?;
        let loader_time = batch_start.elapsed().as_secs_f64();
        let step_start = Instant::now();

        let batch = format_batch(config, ctx.speakers.as_deref(), raw, &ctx.device)?;
        global_step += 1;

        let output = model.unwrap().forward(&batch);
        let terms = criterion.loss(&output, batch.mel_lengths.clone(), batch.text_lengths.clone());

        let scale = optim.scaler.scale();
        let grads = terms.loss.clone().mul_scalar(scale).backward();
        let grads = GradientsParams::from_grads(grads, model.unwrap());
        let grads = model.average_gradients(grads)?;
        let grads = if scale != 1.0 {
            scale_gradients(model.unwrap(), grads, 1.0 / scale)
        } else {
            grads
        };
        let (grads, grad_norm) = clip_grad_norm(model.unwrap(), grads, config.grad_clip);

        let found_inf = !grad_norm.is_finite();
        if optim.scaler.is_enabled() && found_inf {
            reporting
                .console
                .step(format!("skipped step {}, non-finite gradients", global_step));
        } else {
            let lr = optim.schedule.current_lr();
            let updated = optim.optimizer.step(lr, model.unwrap().clone(), grads);
            *model.unwrap_mut() = updated;
        }
        optim.scaler.update(found_inf);
        optim.schedule.step();
        let current_lr = optim.schedule.current_lr();

        let align_error = 1.0 - alignment_diagonal_score(output.alignments.clone(), true);
        let losses = batch_losses(ctx, &terms, align_error)?;
        let step_time = step_start.elapsed().as_secs_f64();

        keep_avg.update_values(losses.iter().copied());
        keep_avg.update_value("avg_loader_time", loader_time);
        keep_avg.update_value("avg_step_time", step_time);

        let loss = losses[0].1;
        reporting.console.step(format!("loss: {:.5}", loss));
        if every(global_step, config.print_step) {
            let log = [
                ("avg_spec_length", batch.avg_spec_length),
                ("avg_text_length", batch.avg_text_length),
                ("step_time", step_time),
                ("loader_time", loader_time),
                ("current_lr", current_lr),
                ("grad_norm", grad_norm),
            ];
            reporting.console.print_train_step(
                num_batches,
                num_iter,
                global_step,
                &log,
                &losses,
                keep_avg.avg_values(),
            );
        }

        if ctx.is_primary() {
            if every(global_step, config.tb_plot_step) {
                let mut scalars: BTreeMap<String, f64> =
                    losses.iter().map(|(name, value)| (name.to_string(), *value)).collect();
                scalars.insert("lr".to_string(), current_lr);
                scalars.insert("grad_norm".to_string(), grad_norm);
                scalars.insert("step_time".to_string(), step_time);
                reporting.collector.scalars(Scope::TrainIter, global_step, &scalars)?;
            }

            if every(global_step, config.save_step) {
                if config.checkpoint {
                    let meta = CheckpointMeta::new(
                        global_step,
                        epoch,
                        config.r,
                        loss,
                        ctx.characters.symbols().to_vec(),
                    )
                    .with_scheduler_step(optim.schedule.scheduler_step())
                    .with_scaler(optim.scaler.clone());
                    save_checkpoint(model.unwrap(), &optim.optimizer, &meta, &ctx.output_path)?;
                }

                B::sync(&ctx.device);
                let diagnostics = diagnose(model.unwrap(), &batch, output.alignments, reporting.audio)?;
                reporting
                    .collector
                    .figures(Scope::TrainIter, global_step, &diagnostics.figures)?;
                reporting.collector.audios(
                    Scope::TrainIter,
                    global_step,
                    &[("TrainAudio".to_string(), diagnostics.wav)],
                    reporting.audio.sample_rate(),
                )?;
            }
        }

        batch_start = Instant::now();
    }

    let epoch_time = epoch_start.elapsed().as_secs_f64();
    let averages = keep_avg.into_values();
    reporting
        .console
        .print_train_epoch_end(global_step, epoch, epoch_time, &averages);

    if ctx.is_primary() {
        let mut scalars = averages.clone();
        scalars.insert("epoch_time".to_string(), epoch_time);
        reporting.collector.scalars(Scope::TrainEpoch, global_step, &scalars)?;
        if config.tb_model_param_stats {
            reporting
                .collector
                .param_stats(global_step, &param_stats(model.unwrap())?)?;
        }
    }

    Ok(TrainOutcome {
        averages,
        global_step,
    })
}
