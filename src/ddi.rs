use burn::{
    module::AutodiffModule,
    tensor::backend::{AutodiffBackend, Backend},
};

use crate::context::TrainingContext;
use crate::errors::Result;
use crate::flows::DdiFlow;
use crate::format::format_batch;
use crate::loader::TtsDataLoader;
use crate::model::{GlowModel, ModelWrapper};

fn set_ddi<B: Backend, M: GlowModel<B>>(model: &mut M, ddi: bool) -> usize {
    let mut armed = 0;
    for flow in model.decoder_flows_mut() {
        if flow.supports_ddi() {
            flow.set_ddi(ddi);
            armed += 1;
        }
    }
    armed
}

/// Fit the decoder flows to the statistics of the first training batches.
///
/// Runs `data_dep_init_steps + 1` forward passes (fewer if the loader runs
/// out), then disarms the flows and brings the replicas to the same
/// parameters. Returns the number of batches seen.
pub fn data_dependent_init<B, M, W>(
    ctx: &TrainingContext<B>,
    loader: &TtsDataLoader<B>,
    model: &mut W,
) -> Result<usize>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    W: ModelWrapper<B, M>,
{
    let armed = set_ddi::<B, M>(model.unwrap_mut(), true);
    if ctx.is_primary() {
        println!(" > Data depended initialization of {} flows ... ", armed);
    }

    let mut batches = 0;
    for (num_iter, raw) in loader.iter().enumerate() {
        ctx.check_interrupt()?;
        let batch = format_batch(&ctx.config, ctx.speakers.as_deref(), raw, &ctx.device)?;
        let _ = model.unwrap_mut().forward_initializing(&batch);
        batches += 1;
        if num_iter == ctx.config.data_dep_init_steps {
            break;
        }
    }

    set_ddi::<B, M>(model.unwrap_mut(), false);
    model.synchronize_parameters()?;
    Ok(batches)
}
