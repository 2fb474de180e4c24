//! Parameter paths of burn module records.
//!
//! Records written with named fields can be walked without knowing the module
//! type, so a checkpoint can be matched against a module parameter by
//! parameter, even when the two layouts differ.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    record::{FullPrecisionSettings, Record},
    tensor::{backend::Backend, Bool, Int, Tensor, TensorData},
};
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};

use crate::errors::{Result, TrainError};
use crate::params::ApplyReport;

/// Key under which burn's file recorders store the module record
const ITEM_KEY: &str = "item";

type Collected = Vec<(String, Option<TensorData>)>;

/// Collects the parameters of a serialized record with their dotted paths.
///
/// A parameter is a map whose first entry is a scalar `id` followed by
/// `param`; struct fields and sequence indices make up the path.
struct ParamWalker<'a> {
    path: String,
    params: &'a mut Collected,
    keep_values: bool,
}

impl ParamWalker<'_> {
    fn child(&mut self, key: &str) -> ParamWalker<'_> {
        let path = if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        };
        ParamWalker {
            path,
            params: &mut *self.params,
            keep_values: self.keep_values,
        }
    }
}

impl<'de> DeserializeSeed<'de> for ParamWalker<'_> {
    /// Whether the value was a scalar that can serve as a parameter id
    type Value = bool;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<bool, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ParamWalker<'_> {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a module record")
    }

    fn visit_map<A: MapAccess<'de>>(mut self, mut map: A) -> std::result::Result<bool, A::Error> {
        let mut after_id = false;
        let mut first = true;
        while let Some(key) = map.next_key::<String>()? {
            if after_id && key == "param" {
                let data = if self.keep_values {
                    Some(map.next_value::<TensorData>()?)
                } else {
                    map.next_value::<IgnoredAny>()?;
                    None
                };
                self.params.push((self.path.clone(), data));
                after_id = false;
            } else {
                let scalar = map.next_value_seed(self.child(&key))?;
                after_id = first && key == "id" && scalar;
            }
            first = false;
        }
        Ok(false)
    }

    fn visit_seq<A: SeqAccess<'de>>(mut self, mut seq: A) -> std::result::Result<bool, A::Error> {
        let mut index = 0usize;
        while seq.next_element_seed(self.child(&index.to_string()))?.is_some() {
            index += 1;
        }
        Ok(false)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<bool, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<bool, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<bool, E> {
        Ok(false)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<bool, E> {
        Ok(false)
    }

    fn visit_bool<E: de::Error>(self, _v: bool) -> std::result::Result<bool, E> {
        Ok(false)
    }

    fn visit_i64<E: de::Error>(self, _v: i64) -> std::result::Result<bool, E> {
        Ok(true)
    }

    fn visit_u64<E: de::Error>(self, _v: u64) -> std::result::Result<bool, E> {
        Ok(true)
    }

    fn visit_f64<E: de::Error>(self, _v: f64) -> std::result::Result<bool, E> {
        Ok(false)
    }

    fn visit_str<E: de::Error>(self, _v: &str) -> std::result::Result<bool, E> {
        Ok(true)
    }

    fn visit_bytes<E: de::Error>(self, _v: &[u8]) -> std::result::Result<bool, E> {
        Ok(false)
    }
}

fn walk<'de, D: Deserializer<'de>>(deserializer: D, keep_values: bool) -> std::result::Result<Collected, D::Error> {
    let mut params = Vec::new();
    ParamWalker {
        path: String::new(),
        params: &mut params,
        keep_values,
    }
    .deserialize(deserializer)?;
    Ok(params)
}

/// Dotted path of every parameter of `module`, float, int and bool alike, in
/// visiting order
pub fn param_paths<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<String>> {
    let item = module.clone().into_record().into_item::<FullPrecisionSettings>();
    let bytes = rmp_serde::to_vec_named(&item)?;
    let mut deserializer = rmp_serde::Deserializer::new(bytes.as_slice());
    let params = walk(&mut deserializer, false)?;
    Ok(params.into_iter().map(|(path, _)| path).collect())
}

struct KindVisitor {
    /// Shape of float parameters, `None` for int and bool ones
    shapes: Vec<Option<Vec<usize>>>,
}

impl<B: Backend> ModuleVisitor<B> for KindVisitor {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(Some(tensor.dims().to_vec()));
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {
        self.shapes.push(None);
    }

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {
        self.shapes.push(None);
    }
}

/// Path of every parameter with its shape when it is a float parameter
pub type ParamLayout = Vec<(String, Option<Vec<usize>>)>;

pub fn param_layout<B: Backend, M: Module<B>>(module: &M) -> Result<ParamLayout> {
    let paths = param_paths(module)?;
    let mut visitor = KindVisitor { shapes: Vec::new() };
    module.visit(&mut visitor);
    if paths.len() != visitor.shapes.len() {
        return Err(TrainError::DimensionMismatch {
            expected: format!("{} parameters in the record", paths.len()),
            actual: format!("{} visited", visitor.shapes.len()),
        });
    }
    Ok(paths.into_iter().zip(visitor.shapes).collect())
}

struct NamedApplyMapper<'a> {
    stored: &'a StoredParams,
    paths: &'a [String],
    index: usize,
    report: ApplyReport,
}

impl<B: Backend> ModuleMapper<B> for NamedApplyMapper<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let source = self
            .paths
            .get(self.index)
            .and_then(|path| self.stored.tensors.get(path));
        self.index += 1;

        let dims = tensor.dims();
        match source {
            Some(data) if data.shape.as_slice() == dims.as_slice() => {
                self.report.loaded += 1;
                let require_grad = tensor.is_require_grad();
                let loaded = Tensor::<B, D>::from_data(data.clone().convert::<B::FloatElem>(), &tensor.device());
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

    fn map_int<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D, Int>) -> Tensor<B, D, Int> {
        self.index += 1;
        tensor
    }

    fn map_bool<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D, Bool>) -> Tensor<B, D, Bool> {
        self.index += 1;
        tensor
    }
}

/// Tensors of a record file written with named fields, keyed by parameter path
#[derive(Debug, Clone, Default)]
pub struct StoredParams {
    tensors: BTreeMap<String, TensorData>,
}

impl StoredParams {
    /// Read a `.mpk` record written by `NamedMpkFileRecorder`
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut deserializer = rmp_serde::Deserializer::new(BufReader::new(file));
        let params = walk(&mut deserializer, true)?;

        let prefix = format!("{}.", ITEM_KEY);
        let tensors = params
            .into_iter()
            .filter_map(|(path, data)| Some((path.strip_prefix(&prefix)?.to_string(), data?)))
            .collect();
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn shape(&self, path: &str) -> Option<&[usize]> {
        self.tensors.get(path).map(|data| data.shape.as_slice())
    }

    /// Same parameter paths as `layout`, float parameters with the same shapes
    pub fn matches(&self, layout: &ParamLayout) -> bool {
        layout.len() == self.tensors.len()
            && layout.iter().all(|(path, shape)| match (self.shape(path), shape) {
                (Some(stored), Some(shape)) => stored == shape.as_slice(),
                (Some(_), None) => true,
                (None, _) => false,
            })
    }

    /// Load every float parameter whose path and shape match, keep the rest
    pub fn apply<B: Backend, M: Module<B>>(&self, module: M) -> Result<(M, ApplyReport)> {
        let paths = param_paths(&module)?;
        let mut mapper = NamedApplyMapper {
            stored: self,
            paths: &paths,
            index: 0,
            report: ApplyReport::default(),
        };
        let module = module.map(&mut mapper);
        if mapper.index != paths.len() {
            return Err(TrainError::DimensionMismatch {
                expected: format!("{} parameters in the record", paths.len()),
                actual: format!("{} mapped", mapper.index),
            });
        }
        let report = mapper.report;
        Ok((module, report))
    }
}
