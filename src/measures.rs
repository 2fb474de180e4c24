use burn::tensor::{backend::Backend, cast::ToElement, Tensor};

/// How diagonal a batch of alignments is, in `[0, 1]` for normalized attention.
///
/// `alignments` is `[batch, decoder_steps, encoder_steps]`. For every encoder
/// step the strongest decoder weight is taken, then averaged over steps and
/// batch. With `binary` any non-zero maximum counts as a full hit.
pub fn alignment_diagonal_score<B: Backend>(alignments: Tensor<B, 3>, binary: bool) -> f64 {
    let maxs = alignments.detach().max_dim(1);
    let maxs = if binary {
        maxs.greater_elem(0.0).float()
    } else {
        maxs
    };
    maxs.mean().into_scalar().to_f64()
}
