use std::collections::BTreeMap;
use std::fs;

use burn::{module::AutodiffModule, tensor::backend::AutodiffBackend};

use crate::average::KeepAverage;
use crate::collector::Scope;
use crate::context::TrainingContext;
use crate::errors::Result;
use crate::format::{format_batch, FormattedBatch};
use crate::loader::TtsDataLoader;
use crate::loss::Criterion;
use crate::measures::alignment_diagonal_score;
use crate::model::{GlowModel, ModelWrapper};
use crate::synthesis::{diagnose, load_test_sentences, select_test_speaker, synthesize, SynthesisOutcome};
use crate::train::{batch_losses, Reporting};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Evaluation pass followed by test-sentence synthesis.
///
/// Returns the averaged evaluation losses, empty when there is no loader.
/// Synthesis runs on rank 0 once `epoch` reaches `test_delay_epochs`, even
/// without an evaluation loader.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<B, M, W, C>(
    ctx: &TrainingContext<B>,
    loader: Option<&TtsDataLoader<Inner<B>>>,
    model: &W,
    criterion: &C,
    reporting: &mut Reporting<'_>,
    global_step: usize,
    epoch: usize,
) -> Result<BTreeMap<String, f64>>
where
    B: AutodiffBackend,
    M: GlowModel<B> + AutodiffModule<B>,
    M::InnerModule: GlowModel<Inner<B>>,
    W: ModelWrapper<B, M>,
    C: Criterion<Inner<B>>,
{
    let config = &ctx.config;
    let model = model.unwrap().valid();
    let mut keep_avg = KeepAverage::new();
    reporting
        .console
        .print_eval_start(loader.map(TtsDataLoader::num_batches).unwrap_or(0));

    if let Some(loader) = loader {
        let mut diagnostic: Option<(FormattedBatch<Inner<B>>, _)> = None;

        for (num_iter, raw) in loader.iter().enumerate() {
            ctx.check_interrupt()?;
            let batch = format_batch(config, ctx.speakers.as_deref(), raw, &ctx.device)?;
            let output = model.forward(&batch);
            let terms = criterion.loss(&output, batch.mel_lengths.clone(), batch.text_lengths.clone());

            let align_error = 1.0 - alignment_diagonal_score(output.alignments.clone(), false);
            let losses = batch_losses(ctx, &terms, align_error)?;
            keep_avg.update_values(losses.iter().copied());

            reporting.console.step(format!("loss: {:.5}", losses[0].1));
            if config.print_eval {
                reporting
                    .console
                    .print_eval_step(num_iter, &losses, keep_avg.avg_values());
            }

            if diagnostic.is_none() || config.eval_diagnostics_from_last_batch {
                diagnostic = Some((batch, output.alignments));
            }
        }

        if ctx.is_primary() {
            if let Some((batch, alignments)) = diagnostic {
                let diagnostics = diagnose(&model, &batch, alignments, reporting.audio)?;
                reporting.collector.audios(
                    Scope::Eval,
                    global_step,
                    &[("ValAudio".to_string(), diagnostics.wav)],
                    reporting.audio.sample_rate(),
                )?;
                reporting
                    .collector
                    .scalars(Scope::Eval, global_step, keep_avg.avg_values())?;
                reporting
                    .collector
                    .figures(Scope::Eval, global_step, &diagnostics.figures)?;
            }
        }
    }

    if ctx.is_primary() && epoch >= config.test_delay_epochs {
        synthesize_test_sentences(ctx, &model, reporting, global_step)?;
    }

    Ok(keep_avg.into_values())
}

fn synthesize_test_sentences<B, G>(
    ctx: &TrainingContext<B>,
    model: &G,
    reporting: &mut Reporting<'_>,
    global_step: usize,
) -> Result<()>
where
    B: AutodiffBackend,
    G: GlowModel<Inner<B>>,
{
    let sentences = load_test_sentences(&ctx.config)?;
    let speaker = select_test_speaker(
        &ctx.config,
        ctx.speakers.as_deref(),
        ctx.config.seed.wrapping_add(global_step as u64),
    );

    println!(" | > Synthesizing test sentences");
    let mut audios = Vec::new();
    let mut figures = Vec::new();
    for (idx, sentence) in sentences.iter().enumerate() {
        let synthesis = match synthesize(
            model,
            sentence,
            &ctx.characters,
            &speaker,
            reporting.audio,
            &ctx.device,
        ) {
            SynthesisOutcome::Ok(synthesis) => synthesis,
            SynthesisOutcome::Failed(reason) => {
                println!(" !! Error creating Test Sentence - {}: {}", idx, reason);
                continue;
            }
        };

        let dir = ctx.audio_path.join(global_step.to_string());
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("TestSentence_{}.wav", idx));
        if let Err(err) = reporting.audio.save_wav(&synthesis.wav, &path) {
            println!(" !! Error creating Test Sentence - {}: {}", idx, err);
            continue;
        }

        audios.push((format!("{}-audio", idx), synthesis.wav));
        figures.push((format!("{}-prediction", idx), synthesis.spectrogram));
        figures.push((format!("{}-alignment", idx), synthesis.alignment));
    }

    reporting
        .collector
        .audios(Scope::Test, global_step, &audios, reporting.audio.sample_rate())?;
    reporting.collector.figures(Scope::Test, global_step, &figures)
}
