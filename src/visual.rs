use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FigureKind {
    Spectrogram,
    Alignment,
}

/// Row-major matrix handed to the metrics collector for plotting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub kind: FigureKind,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

impl Figure {
    /// Spectrogram of a `[channels, frames]` tensor
    pub fn spectrogram<B: Backend>(spec: Tensor<B, 2>) -> Result<Self> {
        Self::from_tensor(FigureKind::Spectrogram, spec)
    }

    /// Alignment of a `[frames, tokens]` tensor, plotted tokens by frames
    pub fn alignment<B: Backend>(alignment: Tensor<B, 2>) -> Result<Self> {
        Self::from_tensor(FigureKind::Alignment, alignment.transpose())
    }

    fn from_tensor<B: Backend>(kind: FigureKind, tensor: Tensor<B, 2>) -> Result<Self> {
        let [rows, cols] = tensor.dims();
        let values = tensor_values(tensor)?;
        Ok(Self {
            kind,
            rows,
            cols,
            values,
        })
    }

    /// Rows as separate vectors
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.values.chunks(self.cols).map(<[f32]>::to_vec).collect()
    }
}

/// Host copy of a tensor's values in row-major order
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::TensorData(format!("{:?}", e)))
}
