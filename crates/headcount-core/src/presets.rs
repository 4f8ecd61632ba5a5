//! Verification model presets.
//!
//! Each preset describes how to feed one embedding model (input size, tensor
//! layout, normalization) and how to turn two embeddings into a decision
//! (metric and threshold). Built-in presets are embedded at compile time from
//! `contrib/models/*.toml`; additional presets can be loaded from a file.

use crate::types::DistanceMetric;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const PRESET_VGG_FACE: &str = include_str!("../../../contrib/models/vgg-face.toml");
const PRESET_FACENET: &str = include_str!("../../../contrib/models/facenet.toml");
const PRESET_ARCFACE: &str = include_str!("../../../contrib/models/arcface.toml");

static PRESET_DB: OnceLock<Vec<ModelPreset>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum PresetError {
    #[error("unknown model preset: {0}")]
    Unknown(String),
    #[error("failed to read preset file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("bad preset TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level preset file structure (one per `contrib/models/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPreset {
    pub model: ModelInfo,
    pub input: InputInfo,
    pub embedding: EmbeddingInfo,
}

/// `[model]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    /// Identifier reported in verification outcomes.
    pub name: String,
    /// ONNX file name, resolved against the model directory.
    pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// `[input]` section. Pixel `p` of channel `c` is fed as `(p - mean[c]) / std[c]`,
/// with channels indexed in `channel_order`.
#[derive(Debug, Clone, Deserialize)]
pub struct InputInfo {
    pub size: u32,
    pub layout: TensorLayout,
    pub channel_order: ChannelOrder,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// `[embedding]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingInfo {
    /// Expected output length; unchecked when absent.
    pub dim: Option<usize>,
    pub metric: DistanceMetric,
    /// A pair is the same identity when `distance <= threshold`.
    pub threshold: f32,
}

impl ModelPreset {
    pub fn from_toml(src: &str) -> Result<Self, PresetError> {
        Ok(toml::from_str(src)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, PresetError> {
        let src = std::fs::read_to_string(path).map_err(|source| PresetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&src)
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }
}

fn preset_db() -> &'static Vec<ModelPreset> {
    PRESET_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [PRESET_VGG_FACE, PRESET_FACENET, PRESET_ARCFACE] {
            match ModelPreset::from_toml(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::error!(error = %e, "bad built-in model preset"),
            }
        }
        db
    })
}

/// Look up a built-in preset by name.
pub fn lookup_preset(name: &str) -> Option<&'static ModelPreset> {
    preset_db().iter().find(|p| p.model.name == name)
}

/// List all built-in presets.
pub fn list_presets() -> &'static [ModelPreset] {
    preset_db()
}

/// Resolve preset names in order, consulting `extra` before the built-ins.
pub fn resolve_presets(
    names: &[String],
    extra: &[ModelPreset],
) -> Result<Vec<ModelPreset>, PresetError> {
    names
        .iter()
        .map(|name| {
            extra
                .iter()
                .find(|p| &p.model.name == name)
                .or_else(|| lookup_preset(name))
                .cloned()
                .ok_or_else(|| PresetError::Unknown(name.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_presets_parse() {
        let names: Vec<&str> = list_presets().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["vgg-face", "facenet", "arcface"]);
    }

    #[test]
    fn test_vgg_face_preset_values() {
        let p = lookup_preset("vgg-face").unwrap();
        assert_eq!(p.input.size, 224);
        assert_eq!(p.input.layout, TensorLayout::Nhwc);
        assert_eq!(p.input.channel_order, ChannelOrder::Bgr);
        assert_eq!(p.embedding.metric, DistanceMetric::Cosine);
        assert!((p.embedding.threshold - 0.68).abs() < 1e-6);
    }

    #[test]
    fn test_resolve_prefers_extra() {
        let mut custom = lookup_preset("facenet").unwrap().clone();
        custom.embedding.threshold = 0.25;

        let resolved =
            resolve_presets(&["vgg-face".to_string(), "facenet".to_string()], &[custom]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name(), "vgg-face");
        assert!((resolved[1].embedding.threshold - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let err = resolve_presets(&["dlib".to_string()], &[]).unwrap_err();
        assert!(matches!(err, PresetError::Unknown(ref n) if n == "dlib"));
    }

    #[test]
    fn test_preset_without_dim() {
        let src = r#"
            [model]
            name = "sface"
            file = "sface.onnx"

            [input]
            size = 112
            layout = "nchw"
            channel_order = "rgb"
            mean = [0.0, 0.0, 0.0]
            std = [1.0, 1.0, 1.0]

            [embedding]
            metric = "euclidean_l2"
            threshold = 1.055
        "#;
        let p = ModelPreset::from_toml(src).unwrap();
        assert_eq!(p.embedding.dim, None);
        assert_eq!(p.embedding.metric, DistanceMetric::EuclideanL2);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(
            ModelPreset::from_toml("[model]\nname = 3"),
            Err(PresetError::Parse(_))
        ));
    }
}
