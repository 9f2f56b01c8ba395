//! Initializer lookup in an exported ONNX graph.
//!
//! Only the parts of `onnx.proto` needed to map parameter names onto graph
//! initializers are decoded; tensor payloads and every other field are
//! skipped by the decoder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;

use crate::backbone::InitializerOverride;
use crate::error::ConfigError;

#[derive(Clone, PartialEq, prost::Message)]
struct ModelProto {
    #[prost(message, optional, tag = "7")]
    graph: Option<GraphProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    node: Vec<NodeProto>,
    #[prost(message, repeated, tag = "5")]
    initializer: Vec<TensorProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    input: Vec<String>,
    #[prost(string, tag = "3")]
    name: String,
    #[prost(string, tag = "4")]
    op_type: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    dims: Vec<i64>,
    #[prost(string, tag = "8")]
    name: String,
}

/// Initializer shapes of a graph plus the weight operand of every `MatMul`,
/// keyed by the module scope of the node (`/layer.11/mlp/fc1/MatMul` is
/// scope `layer.11.mlp.fc1`).
#[derive(Debug, Clone)]
pub struct GraphInitializers {
    path: PathBuf,
    shapes: HashMap<String, Vec<usize>>,
    matmul_weights: Vec<(String, String)>,
}

impl GraphInitializers {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::io(path, e))?;
        Self::decode(path, &bytes)
    }

    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self, ConfigError> {
        let model = ModelProto::decode(bytes).map_err(|e| ConfigError::Graph {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let graph = model.graph.unwrap_or_default();

        let shapes: HashMap<String, Vec<usize>> = graph
            .initializer
            .into_iter()
            .map(|t| (t.name, t.dims.iter().map(|&d| d.max(0) as usize).collect()))
            .collect();
        let matmul_weights = graph
            .node
            .iter()
            .filter(|n| n.op_type == "MatMul")
            .filter_map(|n| {
                let weight = n.input.get(1).filter(|w| shapes.contains_key(*w))?;
                Some((node_scope(&n.name), weight.clone()))
            })
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            shapes,
            matmul_weights,
        })
    }

    /// Map parameter names onto the initializers they replace.
    ///
    /// A name that is itself an initializer of the same shape is kept. A 2-D
    /// `<module>.weight` without such an initializer is matched to the weight
    /// operand of the `MatMul` in scope `<module>` and transposed. Anything
    /// else fails, listing every parameter that could not be placed.
    pub fn resolve(&self, overrides: &[InitializerOverride]) -> Result<Vec<InitializerOverride>, ConfigError> {
        let mut resolved = Vec::with_capacity(overrides.len());
        let mut unmatched = Vec::new();
        for o in overrides {
            match self.place(o) {
                Some(placed) => resolved.push(placed),
                None => unmatched.push(o.name.clone()),
            }
        }
        if !unmatched.is_empty() {
            return Err(ConfigError::UnmatchedInitializers {
                path: self.path.clone(),
                names: unmatched,
            });
        }
        Ok(resolved)
    }

    fn place(&self, o: &InitializerOverride) -> Option<InitializerOverride> {
        if let Some(shape) = self.shapes.get(&o.name) {
            return (shape.as_slice() == o.value.shape()).then(|| o.clone());
        }

        let module = o.name.strip_suffix(".weight")?;
        let [rows, cols] = o.value.shape() else {
            return None;
        };
        let (_, initializer) = self
            .matmul_weights
            .iter()
            .find(|(scope, _)| scope == module || scope.ends_with(&format!(".{module}")))?;
        if self.shapes.get(initializer)?.as_slice() != [*cols, *rows] {
            return None;
        }
        debug!("{} maps to transposed MatMul operand {initializer}", o.name);
        Some(InitializerOverride {
            name: initializer.clone(),
            value: o.value.clone().reversed_axes().as_standard_layout().into_owned(),
        })
    }
}

/// `/encoder/layer.11/attention/MatMul_1` -> `encoder.layer.11.attention`
fn node_scope(node_name: &str) -> String {
    let mut segments: Vec<&str> = node_name.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    segments.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn tensor(name: &str, dims: &[i64]) -> TensorProto {
        TensorProto {
            dims: dims.to_vec(),
            name: name.into(),
        }
    }

    fn graph() -> GraphInitializers {
        let model = ModelProto {
            graph: Some(GraphProto {
                node: vec![
                    NodeProto {
                        input: vec!["hidden".into(), "onnx::MatMul_812".into()],
                        name: "/model/layer.11/mlp/fc1/MatMul".into(),
                        op_type: "MatMul".into(),
                    },
                    NodeProto {
                        input: vec!["a".into(), "b".into()],
                        name: "/model/layer.11/attention/MatMul".into(),
                        op_type: "MatMul".into(),
                    },
                ],
                initializer: vec![
                    tensor("onnx::MatMul_812", &[3, 2]),
                    tensor("layer.11.mlp.fc1.bias", &[2]),
                    tensor("norm.weight", &[3]),
                ],
            }),
        };
        GraphInitializers::decode(Path::new("model.onnx"), &model.encode_to_vec()).unwrap()
    }

    fn param(name: &str, shape: &[usize]) -> InitializerOverride {
        let len: usize = shape.iter().product();
        InitializerOverride {
            name: name.into(),
            value: ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap(),
        }
    }

    #[test]
    fn scope_drops_the_op_segment() {
        assert_eq!(node_scope("/encoder/layer.11/attention/MatMul_1"), "encoder.layer.11.attention");
        assert_eq!(node_scope("MatMul"), "");
    }

    #[test]
    fn named_initializers_are_kept() {
        let resolved = graph()
            .resolve(&[param("layer.11.mlp.fc1.bias", &[2]), param("norm.weight", &[3])])
            .unwrap();
        assert_eq!(resolved[0].name, "layer.11.mlp.fc1.bias");
        assert_eq!(resolved[1].value.shape(), &[3]);
    }

    #[test]
    fn linear_weights_map_to_transposed_matmul_operands() {
        let resolved = graph().resolve(&[param("layer.11.mlp.fc1.weight", &[2, 3])]).unwrap();
        let placed = &resolved[0];
        assert_eq!(placed.name, "onnx::MatMul_812");
        assert_eq!(placed.value.shape(), &[3, 2]);
        // torch [out, in] row 1 is [3, 4, 5]; it becomes column 1.
        assert_eq!(placed.value.as_slice().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn every_unplaced_parameter_is_reported() {
        let err = graph()
            .resolve(&[
                param("layer.99.mlp.fc1.bias", &[2]),
                param("norm.weight", &[4]),
                param("layer.11.mlp.fc1.weight", &[3, 2]),
                param("norm.bias", &[3]),
            ])
            .unwrap_err();
        match err {
            ConfigError::UnmatchedInitializers { names, .. } => assert_eq!(
                names,
                ["layer.99.mlp.fc1.bias", "norm.weight", "layer.11.mlp.fc1.weight", "norm.bias"]
            ),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_graph_error() {
        let err = GraphInitializers::decode(Path::new("x.onnx"), b"\xff\xff\xff").unwrap_err();
        assert!(matches!(err, ConfigError::Graph { .. }));
    }
}
