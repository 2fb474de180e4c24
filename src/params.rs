use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::distributed::{broadcast_from_primary, ProcessGroup};
use crate::errors::{Result, TrainError};

/// Host copy of one float parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Host copy of every float parameter of a module, in traversal order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSnapshot {
    pub tensors: Vec<ParamTensor>,
}

/// Outcome of applying a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub loaded: usize,
    pub skipped: usize,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

struct CaptureVisitor {
    tensors: Vec<ParamTensor>,
    error: Option<TrainError>,
}

impl<B: Backend> ModuleVisitor<B> for CaptureVisitor {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let shape = tensor.dims().to_vec();
        match tensor.to_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => self.tensors.push(ParamTensor { shape, values }),
            Err(err) => {
                self.error
                    .get_or_insert(TrainError::TensorData(format!("{:?}", err)));
            }
        }
    }
}

struct ApplyMapper<'a> {
    tensors: &'a [ParamTensor],
    index: usize,
    report: ApplyReport,
}

impl<B: Backend> ModuleMapper<B> for ApplyMapper<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let source = self.tensors.get(self.index);
        self.index += 1;

        let dims = tensor.dims();
        match source {
            Some(source) if source.shape.as_slice() == dims.as_slice() => {
                self.report.loaded += 1;
                let require_grad = tensor.is_require_grad();
                let loaded = Tensor::<B, D>::from_data(
                    TensorData::new(source.values.clone(), dims),
                    &tensor.device(),
                );
                if require_grad {
                    loaded.require_grad()
                } else {
                    loaded
                }
            }
            _ => {
                self.report.skipped += 1;
                tensor
            }
        }
    }
}

impl ParamSnapshot {
    pub fn capture<B: Backend, M: Module<B>>(module: &M) -> Result<Self> {
        let mut visitor = CaptureVisitor {
            tensors: Vec::new(),
            error: None,
        };
        module.visit(&mut visitor);
        match visitor.error {
            Some(err) => Err(err),
            None => Ok(Self {
                tensors: visitor.tensors,
            }),
        }
    }

    /// Copy every tensor whose position and shape match, keep the rest.
    ///
    /// Positions only line up between modules of the same layout; restores
    /// across layouts go through [`crate::record::StoredParams`].
    pub fn apply<B: Backend, M: Module<B>>(&self, module: M) -> (M, ApplyReport) {
        let mut mapper = ApplyMapper {
            tensors: &self.tensors,
            index: 0,
            report: ApplyReport::default(),
        };
        let module = module.map(&mut mapper);
        let mut report = mapper.report;
        report.skipped += self.tensors.len().saturating_sub(mapper.index);
        (module, report)
    }
}

/// Give every replica the parameters of rank 0
pub fn synchronize_params<B: Backend, M: Module<B>>(module: M, group: &dyn ProcessGroup) -> Result<M> {
    let mut snapshot = ParamSnapshot::capture(&module)?;
    let mut flat: Vec<f32> = snapshot
        .tensors
        .iter()
        .flat_map(|t| t.values.iter().copied())
        .collect();

    broadcast_from_primary(group, &mut flat)?;

    let mut offset = 0;
    for tensor in snapshot.tensors.iter_mut() {
        let len = tensor.values.len();
        tensor.values.copy_from_slice(&flat[offset..offset + len]);
        offset += len;
    }

    let (module, report) = snapshot.apply(module);
    if !report.is_complete() {
        return Err(TrainError::Distributed(format!(
            "{} parameters could not be synchronized",
            report.skipped
        )));
    }
    Ok(module)
}

/// Summary of one parameter tensor
#[derive(Debug, Clone, PartialEq)]
pub struct ParamStats {
    pub index: usize,
    pub shape: Vec<usize>,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

pub fn param_stats<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<ParamStats>> {
    let snapshot = ParamSnapshot::capture(module)?;
    Ok(snapshot
        .tensors
        .iter()
        .enumerate()
        .map(|(index, tensor)| {
            let n = tensor.values.len().max(1) as f64;
            let mean = tensor.values.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = tensor
                .values
                .iter()
                .map(|&v| (v as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            ParamStats {
                index,
                shape: tensor.shape.clone(),
                min: tensor.values.iter().copied().fold(f32::INFINITY, f32::min) as f64,
                max: tensor.values.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64,
                mean,
                std: var.sqrt(),
            }
        })
        .collect())
}
