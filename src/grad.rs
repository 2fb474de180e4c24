use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{backend::AutodiffBackend, cast::ToElement, Tensor, TensorData},
};
use serde::{Deserialize, Serialize};

use crate::distributed::{reduce_mean, ProcessGroup};
use crate::errors::{Result, TrainError};

struct GradNormVisitor<'a> {
    grads: &'a GradientsParams,
    sum_sq: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_sq += grad.powf_scalar(2.0).sum().into_scalar().to_f64();
        }
    }
}

/// L2 norm over every gradient of `model`
pub fn global_grad_norm<B, M>(model: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = GradNormVisitor { grads, sum_sq: 0.0 };
    model.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

struct GradScaleVisitor<'a> {
    grads: &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScaleVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
    }
}

/// Multiply every gradient of `model` by `factor`
pub fn scale_gradients<B, M>(model: &M, mut grads: GradientsParams, factor: f64) -> GradientsParams
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = GradScaleVisitor {
        grads: &mut grads,
        factor,
    };
    model.visit(&mut visitor);
    grads
}

/// Rescale the gradients so their global norm is at most `max_norm`.
///
/// Returns the gradients and their norm before clipping.
pub fn clip_grad_norm<B, M>(model: &M, grads: GradientsParams, max_norm: f64) -> (GradientsParams, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let total_norm = global_grad_norm(model, &grads);
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        (scale_gradients(model, grads, clip_coef), total_norm)
    } else {
        (grads, total_norm)
    }
}

struct GradFlattenVisitor<'a> {
    grads: &'a GradientsParams,
    values: Vec<f32>,
    error: Option<TrainError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradFlattenVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) else {
            return;
        };
        match grad.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => self.values.extend(values),
            Err(err) => {
                self.error
                    .get_or_insert(TrainError::TensorData(format!("{:?}", err)));
            }
        }
    }
}

struct GradUnflattenVisitor<'a> {
    grads: &'a mut GradientsParams,
    values: &'a [f32],
    offset: usize,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradUnflattenVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let dims = grad.dims();
        let len: usize = dims.iter().product();
        let end = (self.offset + len).min(self.values.len());
        let slice = self.values[self.offset..end].to_vec();
        self.offset = end;
        if slice.len() != len {
            self.grads.register::<B::InnerBackend, D>(id, grad);
            return;
        }
        let device = grad.device();
        let averaged = Tensor::from_data(TensorData::new(slice, dims), &device);
        self.grads.register::<B::InnerBackend, D>(id, averaged);
    }
}

/// Replace every gradient with its mean over the replicas of `group`
pub fn average_gradients<B, M>(
    model: &M,
    mut grads: GradientsParams,
    group: &dyn ProcessGroup,
) -> Result<GradientsParams>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut flatten = GradFlattenVisitor {
        grads: &grads,
        values: Vec::new(),
        error: None,
    };
    model.visit(&mut flatten);
    if let Some(err) = flatten.error {
        return Err(err);
    }
    let mut values = flatten.values;

    reduce_mean(group, &mut values)?;

    let mut unflatten = GradUnflattenVisitor {
        grads: &mut grads,
        values: &values,
        offset: 0,
    };
    model.visit(&mut unflatten);
    if unflatten.offset != values.len() {
        return Err(TrainError::DimensionMismatch {
            expected: format!("{} gradient values", values.len()),
            actual: format!("{} consumed", unflatten.offset),
        });
    }
    Ok(grads)
}

/// Dynamic loss scaling for reduced precision training.
///
/// Only the scale lives here; running in half precision means choosing a
/// backend with a half precision float element.
///
/// The scale doubles after `growth_interval` consecutive finite steps and is
/// halved whenever the gradients overflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    /// Start from `scale` instead of 2^16
    pub fn with_init_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Factor the loss is multiplied by before backward, 1 when disabled
    pub fn scale(&self) -> f64 {
        if self.enabled { self.scale } else { 1.0 }
    }

    /// Adjust the scale after a step; `found_inf` means the step was skipped
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}
