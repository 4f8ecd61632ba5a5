//! Face embedding models via ONNX Runtime.
//!
//! One `FaceRecognizer` wraps one embedding network described by a
//! [`ModelPreset`]. Inputs are whole face crops resized to the preset's input
//! size; there is no detection or landmark alignment step.

use crate::presets::{ChannelOrder, ModelPreset, TensorLayout};
use crate::types::Embedding;
use crate::verifier::{ModelVote, Reference, VerificationModel};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::{RunOptions, Session, SessionOutputs};
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — export the model to ONNX and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("inference stopped at the deadline")]
    DeadlineExceeded,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX face embedding model.
pub struct FaceRecognizer {
    session: Session,
    preset: ModelPreset,
    cache: EmbeddingCache,
}

impl FaceRecognizer {
    /// Load the ONNX model at `model_path`, fed according to `preset`.
    pub fn load(model_path: &str, preset: ModelPreset) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            model = %preset.model.name,
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session,
            preset,
            cache: EmbeddingCache::default(),
        })
    }

    pub fn preset(&self) -> &ModelPreset {
        &self.preset
    }

    /// Extract an embedding from a face crop of any size.
    pub fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        embed(&mut self.session, &self.preset, face, None)
    }
}

impl VerificationModel for FaceRecognizer {
    fn id(&self) -> &str {
        &self.preset.model.name
    }

    fn begin_run(&mut self) {
        self.cache.clear();
    }

    fn vote(
        &mut self,
        candidate: &RgbImage,
        reference: Reference<'_>,
        deadline: Option<Instant>,
    ) -> Result<ModelVote, RecognizerError> {
        let a = self
            .cache
            .candidate(candidate, |face| embed(&mut self.session, &self.preset, face, deadline))?
            .clone();
        let b = self
            .cache
            .reference(reference, |face| embed(&mut self.session, &self.preset, face, deadline))?;
        Ok(decide(&a, b, &self.preset))
    }
}

/// Embeddings this model has already computed.
///
/// A candidate is checked against every roster photo in turn, so the latest
/// one is kept by content. Reference embeddings are kept by roster index
/// until the next run.
#[derive(Default)]
struct EmbeddingCache {
    candidate: Option<(RgbImage, Embedding)>,
    references: HashMap<usize, Embedding>,
}

impl EmbeddingCache {
    fn clear(&mut self) {
        self.candidate = None;
        self.references.clear();
    }

    fn candidate<F>(&mut self, face: &RgbImage, embed: F) -> Result<&Embedding, RecognizerError>
    where
        F: FnOnce(&RgbImage) -> Result<Embedding, RecognizerError>,
    {
        let hit = matches!(&self.candidate, Some((cached, _)) if cached == face);
        if !hit {
            self.candidate = Some((face.clone(), embed(face)?));
        }
        match &self.candidate {
            Some((_, embedding)) => Ok(embedding),
            None => Err(RecognizerError::InferenceFailed("candidate cache empty".into())),
        }
    }

    fn reference<F>(&mut self, reference: Reference<'_>, embed: F) -> Result<&Embedding, RecognizerError>
    where
        F: FnOnce(&RgbImage) -> Result<Embedding, RecognizerError>,
    {
        if !self.references.contains_key(&reference.index) {
            let embedding = embed(reference.image)?;
            self.references.insert(reference.index, embedding);
        }
        self.references
            .get(&reference.index)
            .ok_or_else(|| RecognizerError::InferenceFailed("reference cache empty".into()))
    }
}

/// Run one face crop through `session`, stopping at `deadline` if given.
fn embed(
    session: &mut Session,
    preset: &ModelPreset,
    face: &RgbImage,
    deadline: Option<Instant>,
) -> Result<Embedding, RecognizerError> {
    if face.width() == 0 || face.height() == 0 {
        return Err(RecognizerError::InferenceFailed("empty face crop".into()));
    }

    let tensor = preprocess(face, preset);
    let input = TensorRef::from_array_view(tensor.view())?;

    let values = match deadline {
        None => {
            let outputs = session.run(ort::inputs![input])?;
            read_embedding(&outputs, preset)?
        }
        Some(deadline) => {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|left| !left.is_zero())
                .ok_or(RecognizerError::DeadlineExceeded)?;
            let options = RunOptions::new()?;

            let result = std::thread::scope(|scope| {
                let (done_tx, done_rx) = mpsc::channel::<()>();
                let watched = &options;
                scope.spawn(move || terminate_after(watched, done_rx, remaining));

                let result = session
                    .run_with_options(ort::inputs![input], &options)
                    .map_err(RecognizerError::from)
                    .and_then(|outputs| read_embedding(&outputs, preset));
                drop(done_tx);
                result
            });

            // A terminated run surfaces as a generic ort error.
            match result {
                Err(_) if Instant::now() >= deadline => return Err(RecognizerError::DeadlineExceeded),
                other => other?,
            }
        }
    };

    Ok(Embedding {
        values,
        model_version: Some(preset.model.name.clone()),
    })
}

/// Watchdog: flag the run for termination unless `done` fires within `after`.
fn terminate_after(options: &RunOptions, done: mpsc::Receiver<()>, after: Duration) {
    if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(after) {
        if let Err(e) = options.terminate() {
            tracing::warn!(error = %e, "could not interrupt inference");
        }
    }
}

fn read_embedding(outputs: &SessionOutputs<'_>, preset: &ModelPreset) -> Result<Vec<f32>, RecognizerError> {
    let (_, raw) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
        RecognizerError::InferenceFailed(format!("embedding extraction: {e}"))
    })?;

    if let Some(dim) = preset.embedding.dim {
        if raw.len() != dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {dim}-dim embedding, got {}",
                raw.len()
            )));
        }
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed(
            "embedding contains non-finite values".into(),
        ));
    }
    Ok(raw.to_vec())
}

/// Compare two embeddings under the preset's metric and threshold.
fn decide(a: &Embedding, b: &Embedding, preset: &ModelPreset) -> ModelVote {
    let distance = a.distance(b, preset.embedding.metric);
    ModelVote {
        verified: distance <= preset.embedding.threshold,
        distance,
    }
}

/// Resize a face crop to the model input and pack it as a float tensor.
fn preprocess(face: &RgbImage, preset: &ModelPreset) -> Array4<f32> {
    let input = &preset.input;
    let size = input.size as usize;

    let resized;
    let face = if face.dimensions() == (input.size, input.size) {
        face
    } else {
        resized = imageops::resize(face, input.size, input.size, FilterType::Triangle);
        &resized
    };

    let shape = match input.layout {
        TensorLayout::Nchw => (1, 3, size, size),
        TensorLayout::Nhwc => (1, size, size, 3),
    };
    let mut tensor = Array4::<f32>::zeros(shape);

    for (x, y, pixel) in face.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let src = match input.channel_order {
                ChannelOrder::Rgb => c,
                ChannelOrder::Bgr => 2 - c,
            };
            let value = (pixel.0[src] as f32 - input.mean[c]) / input.std[c];
            match input.layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::lookup_preset;
    use crate::types::DistanceMetric;
    use image::Rgb;

    fn preset(name: &str) -> ModelPreset {
        lookup_preset(name).unwrap().clone()
    }

    #[test]
    fn test_preprocess_nhwc_bgr_shape_and_order() {
        let p = preset("vgg-face");
        let face = RgbImage::from_pixel(224, 224, Rgb([255, 0, 51]));
        let tensor = preprocess(&face, &p);

        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        // BGR: channel 0 is blue.
        assert!((tensor[[0, 5, 5, 0]] - 0.2).abs() < 1e-6);
        assert!(tensor[[0, 5, 5, 1]].abs() < 1e-6);
        assert!((tensor[[0, 5, 5, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_nchw_rgb_normalization() {
        let p = preset("arcface");
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = preprocess(&face, &p);

        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - 127.5) / 127.5;
        for c in 0..3 {
            assert!((tensor[[0, c, 0, 0]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_preprocess_resizes_candidate() {
        // A 224 candidate feeds a 160 input.
        let p = preset("facenet");
        let face = RgbImage::from_pixel(224, 224, Rgb([10, 20, 30]));
        let tensor = preprocess(&face, &p);
        assert_eq!(tensor.shape(), &[1, 160, 160, 3]);
        assert!((tensor[[0, 159, 159, 0]] - 30.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_decide_threshold_is_inclusive() {
        let mut p = preset("facenet");
        p.embedding.metric = DistanceMetric::Euclidean;
        p.embedding.threshold = 5.0;

        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0], model_version: None };
        let vote = decide(&a, &b, &p);
        assert!(vote.verified);
        assert!((vote.distance - 5.0).abs() < 1e-6);

        p.embedding.threshold = 4.99;
        assert!(!decide(&a, &b, &p).verified);
    }

    #[test]
    fn test_decide_cosine_preset() {
        let p = preset("vgg-face");
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let same = Embedding { values: vec![0.9, 0.1], model_version: None };
        let other = Embedding { values: vec![0.0, 1.0], model_version: None };
        assert!(decide(&a, &same, &p).verified);
        assert!(!decide(&a, &other, &p).verified);
    }

    fn counting(calls: &mut usize) -> impl FnMut(&RgbImage) -> Result<Embedding, RecognizerError> + '_ {
        move |face| {
            *calls += 1;
            let p = face.get_pixel(0, 0).0;
            Ok(Embedding { values: vec![p[0] as f32, p[1] as f32], model_version: None })
        }
    }

    #[test]
    fn test_reference_embedded_once_per_run() {
        let mut cache = EmbeddingCache::default();
        let photo = RgbImage::from_pixel(4, 4, Rgb([7, 8, 9]));
        let mut calls = 0;
        let mut embed = counting(&mut calls);

        for _ in 0..3 {
            let e = cache.reference(Reference { index: 2, image: &photo }, &mut embed).unwrap();
            assert_eq!(e.values, vec![7.0, 8.0]);
        }
        cache.reference(Reference { index: 3, image: &photo }, &mut embed).unwrap();
        drop(embed);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_new_run_forgets_references() {
        let mut cache = EmbeddingCache::default();
        let before = RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]));
        let after = RgbImage::from_pixel(4, 4, Rgb([5, 5, 5]));
        let mut calls = 0;
        let mut embed = counting(&mut calls);

        cache.reference(Reference { index: 0, image: &before }, &mut embed).unwrap();
        cache.clear();
        let e = cache.reference(Reference { index: 0, image: &after }, &mut embed).unwrap();
        assert_eq!(e.values, vec![5.0, 5.0]);
    }

    #[test]
    fn test_candidate_reused_until_it_changes() {
        let mut cache = EmbeddingCache::default();
        let first = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let second = RgbImage::from_pixel(4, 4, Rgb([4, 5, 6]));
        let mut calls = 0;
        let mut embed = counting(&mut calls);

        cache.candidate(&first, &mut embed).unwrap();
        cache.candidate(&first, &mut embed).unwrap();
        let e = cache.candidate(&second, &mut embed).unwrap();
        assert_eq!(e.values, vec![4.0, 5.0]);
        drop(embed);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_failed_embedding_is_not_cached() {
        let mut cache = EmbeddingCache::default();
        let photo = RgbImage::new(4, 4);
        let reference = Reference { index: 0, image: &photo };

        let err = cache
            .reference(reference, |_| Err(RecognizerError::DeadlineExceeded))
            .unwrap_err();
        assert!(matches!(err, RecognizerError::DeadlineExceeded));
        assert!(cache.reference(reference, |_| Ok(Embedding { values: vec![1.0], model_version: None })).is_ok());
    }
}
