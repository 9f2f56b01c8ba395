//! A tiny ONNX graph with the backbone's input and output names.
//!
//! ```text
//! pixel_values [B,3,H,W] -> GlobalAveragePool -> Flatten      [B,3]
//!   -> MatMul onnx::MatMul_7 [3,2]   (/layer.11/mlp/fc1/MatMul) [B,2]
//!   -> Add layer.11.mlp.fc1.bias [2]
//!   -> Add norm.bias [2]             -> pooler_output           [B,2]
//! ```
//!
//! With the exported values the output is the mean of channels 0 and 1.

use std::path::{Path, PathBuf};

use prost::Message;

const FLOAT: i32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
struct ModelProto {
    #[prost(int64, tag = "1")]
    ir_version: i64,
    #[prost(string, tag = "2")]
    producer_name: String,
    #[prost(message, optional, tag = "7")]
    graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    domain: String,
    #[prost(int64, tag = "2")]
    version: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(message, repeated, tag = "5")]
    initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    output: Vec<String>,
    #[prost(string, tag = "3")]
    name: String,
    #[prost(string, tag = "4")]
    op_type: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    data_type: i32,
    #[prost(string, tag = "8")]
    name: String,
    #[prost(bytes = "vec", tag = "9")]
    raw_data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ValueInfoProto {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(message, optional, tag = "2")]
    r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct TypeProto {
    #[prost(message, optional, tag = "1")]
    tensor_type: Option<TensorTypeProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    elem_type: i32,
    #[prost(message, optional, tag = "2")]
    shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    dim: Vec<Dimension>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Dimension {
    #[prost(int64, optional, tag = "1")]
    dim_value: Option<i64>,
    #[prost(string, optional, tag = "2")]
    dim_param: Option<String>,
}

fn node(name: &str, op: &str, inputs: &[&str], output: &str) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: vec![output.into()],
        name: name.into(),
        op_type: op.into(),
    }
}

fn initializer(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: FLOAT,
        name: name.into(),
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn float_value(name: &str, dims: &[&str]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| match d.parse::<i64>() {
            Ok(v) => Dimension {
                dim_value: Some(v),
                dim_param: None,
            },
            Err(_) => Dimension {
                dim_value: None,
                dim_param: Some(d.to_string()),
            },
        })
        .collect();
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type: FLOAT,
                shape: Some(TensorShapeProto { dim }),
            }),
        }),
    }
}

pub fn pooled_mean_model() -> Vec<u8> {
    let graph = GraphProto {
        node: vec![
            node("/pool/GlobalAveragePool", "GlobalAveragePool", &["pixel_values"], "pooled_4d"),
            node("/pool/Flatten", "Flatten", &["pooled_4d"], "pooled"),
            node("/layer.11/mlp/fc1/MatMul", "MatMul", &["pooled", "onnx::MatMul_7"], "fc1"),
            node("/layer.11/mlp/fc1/Add", "Add", &["fc1", "layer.11.mlp.fc1.bias"], "fc1_biased"),
            node("/norm/Add", "Add", &["fc1_biased", "norm.bias"], "pooler_output"),
        ],
        name: "pooled_mean".into(),
        initializer: vec![
            initializer("onnx::MatMul_7", &[3, 2], &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]),
            initializer("layer.11.mlp.fc1.bias", &[2], &[0.0, 0.0]),
            initializer("norm.bias", &[2], &[0.0, 0.0]),
        ],
        input: vec![float_value("pixel_values", &["batch", "3", "height", "width"])],
        output: vec![float_value("pooler_output", &["batch", "2"])],
    };
    ModelProto {
        ir_version: 8,
        producer_name: "dino_server-tests".into(),
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
    }
    .encode_to_vec()
}

pub fn write_pooled_mean_model(dir: &Path) -> PathBuf {
    let path = dir.join("pooled_mean.onnx");
    std::fs::write(&path, pooled_mean_model()).unwrap();
    path
}
