use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Side length of the canonical face crop handed to the verification models.
pub const CANDIDATE_SIZE: u32 = 224;

/// Axis-aligned bounding box for a detected face, in scene pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Distance metric used to compare two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`.
    Cosine,
    Euclidean,
    /// Euclidean distance between the L2-normalized vectors.
    EuclideanL2,
}

/// Face embedding vector produced by one recognition model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "vgg-face").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit length. Zero vectors are returned as-is.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Distance under `metric`. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self
                .l2_normalized()
                .euclidean_distance(&other.l2_normalized()),
        }
    }
}

/// One enrolled identity with its decoded reference photo.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    /// Registration number; the identity key used in every report.
    pub identity_id: String,
    pub display_name: String,
    pub image_path: PathBuf,
    pub reference_image: RgbImage,
}

/// A face cropped out of a scene and resized to [`CANDIDATE_SIZE`] square.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub pixels: RgbImage,
    /// Where the crop came from in the scene, before resizing.
    pub bounding_box: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.distance(&b, DistanceMetric::Cosine) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![3.0, 4.0]);
        assert!((a.distance(&b, DistanceMetric::Euclidean) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let a = emb(vec![2.0, 0.0]);
        let b = emb(vec![10.0, 0.0]);
        assert!(a.distance(&b, DistanceMetric::EuclideanL2).abs() < 1e-6);

        // Orthogonal unit vectors are sqrt(2) apart.
        let c = emb(vec![0.0, 7.0]);
        let d = a.distance(&c, DistanceMetric::EuclideanL2);
        assert!((d - 2.0f32.sqrt()).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_bounding_box_area_negative_extent() {
        let b = BoundingBox { x: 0.0, y: 0.0, width: -5.0, height: 10.0, confidence: 1.0 };
        assert_eq!(b.area(), 0.0);
    }
}
