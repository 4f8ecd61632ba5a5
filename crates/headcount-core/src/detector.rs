//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the anchor-free SCRFD model over a grayscale scene at several input
//! sizes (an image pyramid whose coarseness is set by `scale_step`), then
//! merges the raw anchor hits with neighbor-count grouping so that isolated
//! false positives are suppressed.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Input sizes must be divisible by the coarsest stride.
const SCRFD_SIZE_ALIGN: usize = 32;

/// Rectangle similarity tolerance used when grouping raw hits.
const GROUP_EPS: f32 = 0.2;
const MAX_PYRAMID_LEVELS: usize = 16;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download det_10g.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection sensitivity knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    /// Growth factor between consecutive pyramid input sizes. Must be > 1.0;
    /// values close to 1.0 give a finer (slower) pyramid.
    pub scale_step: f32,
    /// A face is kept only when more than this many raw hits agree on it.
    /// Zero disables grouping and falls back to plain NMS.
    pub min_neighbor_count: usize,
    /// Smallest (first) detector input size in pixels.
    pub base_input_size: usize,
    /// Largest detector input size in pixels.
    pub max_input_size: usize,
    /// Minimum anchor score for a raw hit.
    pub confidence_threshold: f32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_step: 1.1,
            min_neighbor_count: 5,
            base_input_size: 640,
            max_input_size: 1280,
            confidence_threshold: 0.5,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_step > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale_step must be > 1.0, got {}",
                self.scale_step
            )));
        }
        if self.base_input_size < SCRFD_SIZE_ALIGN {
            return Err(DetectorError::InvalidParams(format!(
                "base_input_size must be at least {SCRFD_SIZE_ALIGN}, got {}",
                self.base_input_size
            )));
        }
        if self.max_input_size < self.base_input_size {
            return Err(DetectorError::InvalidParams(format!(
                "max_input_size ({}) is smaller than base_input_size ({})",
                self.max_input_size, self.base_input_size
            )));
        }
        if !(0.0..1.0).contains(&self.confidence_threshold) {
            return Err(DetectorError::InvalidParams(format!(
                "confidence_threshold must be in [0, 1), got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    /// Square detector input sizes for every pyramid level, smallest first.
    pub fn pyramid_sizes(&self) -> Vec<usize> {
        let snap = |size: f32| {
            let cells = (size / SCRFD_SIZE_ALIGN as f32).round().max(1.0) as usize;
            cells * SCRFD_SIZE_ALIGN
        };

        let mut sizes = vec![snap(self.base_input_size as f32)];
        if !(self.scale_step > 1.0) {
            return sizes;
        }

        let mut size = self.base_input_size as f32 * self.scale_step;
        while size <= self.max_input_size as f32 && sizes.len() < MAX_PYRAMID_LEVELS {
            let snapped = snap(size);
            if sizes.last() != Some(&snapped) {
                sizes.push(snapped);
            }
            size *= self.scale_step;
        }
        sizes
    }
}

/// Strategy for finding face boxes in a grayscale scene.
pub trait Detector {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes,
    /// returning boxes sorted by confidence, highest first.
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Keypoint heads are present but unused; alignment is crop-and-resize only.
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {num_outputs} outputs"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Run one inference at a square `input_size` and return every anchor hit
    /// above `threshold`, mapped back to scene coordinates.
    fn detect_raw(
        &mut self,
        gray: &[u8],
        width: usize,
        height: usize,
        input_size: usize,
        threshold: f32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(gray, width, height, input_size);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut hits = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            hits.extend(decode_stride(
                scores, bboxes, stride, input_size, &letterbox, threshold,
            ));
        }

        Ok(hits)
    }
}

impl Detector for FaceDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        params.validate()?;
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || gray.len() < w * h {
            return Err(DetectorError::InferenceFailed(format!(
                "grayscale buffer of {} bytes does not cover {width}x{height}",
                gray.len()
            )));
        }

        let mut raw = Vec::new();
        for size in params.pyramid_sizes() {
            let hits = self.detect_raw(gray, w, h, size, params.confidence_threshold)?;
            tracing::trace!(input_size = size, hits = hits.len(), "pyramid level");
            raw.extend(hits);
        }

        let raw_count = raw.len();
        let mut faces = if params.min_neighbor_count == 0 {
            nms(raw, SCRFD_NMS_THRESHOLD)
        } else {
            group_rectangles(raw, params.min_neighbor_count, GROUP_EPS)
        };
        sort_by_confidence(&mut faces);

        tracing::debug!(raw = raw_count, faces = faces.len(), "detection pass complete");
        Ok(faces)
    }
}

/// Letterbox a grayscale frame into a square NCHW float tensor of `input_size`.
///
/// Resizes with bilinear interpolation and replicates the gray channel into
/// all three model channels.
fn preprocess(
    frame: &[u8],
    width: usize,
    height: usize,
    input_size: usize,
) -> (Array4<f32>, LetterboxInfo) {
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_size);
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    let letterbox = LetterboxInfo { scale, pad_x, pad_y };
    let resized = bilinear_resize(frame, width, height, new_w, new_h);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for y in 0..input_size {
        for x in 0..input_size {
            let inside = y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w;
            let pixel = if inside {
                resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
            } else {
                SCRFD_MEAN // pad normalizes to 0.0
            };

            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (tensor, letterbox)
}

fn bilinear_resize(frame: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let inv_x = width as f32 / new_w as f32;
    let inv_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;
            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// Map output tensors to stride slots.
///
/// Exports that name their heads `score_8`, `bbox_8`, ... are mapped by name;
/// anything else uses the insightface positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => {
                tracing::info!(
                    ?names,
                    "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
                );
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }

    tracing::info!("SCRFD: using name-based output tensor mapping");
    named
}

/// Decode anchor hits for a single stride level into scene coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let stride_f = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride_f;
        let anchor_cy = (anchor_idx / grid) as f32 * stride_f;

        let x1 = anchor_cx - bboxes[bbox_off] * stride_f;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride_f;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride_f;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride_f;

        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        detections.push(BoundingBox {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
        });
    }

    detections
}

fn sort_by_confidence(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Two rectangles belong to the same face when every edge is within
/// `eps` of the mean of their smaller dimensions.
fn similar_rects(a: &BoundingBox, b: &BoundingBox, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    (a.x - b.x).abs() <= delta
        && (a.y - b.y).abs() <= delta
        && (a.x + a.width - b.x - b.width).abs() <= delta
        && (a.y + a.height - b.y - b.height).abs() <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits and keep clusters with more than `min_neighbors` members.
///
/// Each surviving cluster becomes its members' average rectangle carrying the
/// highest member confidence. A weak cluster lying inside a stronger one
/// (within `eps` of its size) is dropped.
fn group_rectangles(raw: Vec<BoundingBox>, min_neighbors: usize, eps: f32) -> Vec<BoundingBox> {
    if raw.is_empty() {
        return raw;
    }

    let mut parent: Vec<usize> = (0..raw.len()).collect();
    for i in 0..raw.len() {
        for j in (i + 1)..raw.len() {
            if similar_rects(&raw[i], &raw[j], eps) {
                let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Per-root accumulators: [sum_x, sum_y, sum_w, sum_h], count, best confidence.
    let mut roots: Vec<usize> = Vec::new();
    let mut sums: Vec<([f32; 4], usize, f32)> = Vec::new();
    for i in 0..raw.len() {
        let root = find_root(&mut parent, i);
        let slot = match roots.iter().position(|&r| r == root) {
            Some(slot) => slot,
            None => {
                roots.push(root);
                sums.push(([0.0; 4], 0, 0.0));
                roots.len() - 1
            }
        };
        let (acc, count, best) = &mut sums[slot];
        acc[0] += raw[i].x;
        acc[1] += raw[i].y;
        acc[2] += raw[i].width;
        acc[3] += raw[i].height;
        *count += 1;
        *best = best.max(raw[i].confidence);
    }

    let clusters: Vec<(BoundingBox, usize)> = sums
        .into_iter()
        .map(|(acc, count, best)| {
            let n = count as f32;
            (
                BoundingBox {
                    x: acc[0] / n,
                    y: acc[1] / n,
                    width: acc[2] / n,
                    height: acc[3] / n,
                    confidence: best,
                },
                count,
            )
        })
        .collect();

    let mut kept = Vec::new();
    for (i, (r1, n1)) in clusters.iter().enumerate() {
        if *n1 <= min_neighbors {
            continue;
        }

        let nested = clusters.iter().enumerate().any(|(j, (r2, n2))| {
            if i == j || *n2 <= min_neighbors {
                return false;
            }
            let dx = r2.width * eps;
            let dy = r2.height * eps;
            let inside = r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy;
            inside && (*n2 > (*n1).max(3) || *n1 < 3)
        });

        if !nested {
            kept.push(r1.clone());
        }
    }

    kept
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
