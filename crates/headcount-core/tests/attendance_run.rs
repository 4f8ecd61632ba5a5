//! End-to-end run over the public API: roster CSV on disk, stub detector and
//! stub embedding models, CSV records out.

use headcount_core::detector::{DetectionParams, Detector, DetectorError};
use headcount_core::recognizer::RecognizerError;
use headcount_core::report::{read_records, Status, ABSENT_FILE, PRESENT_FILE};
use headcount_core::verifier::{ModelVote, Reference};
use headcount_core::{
    aggregate, AttendanceReport, BoundingBox, ConsensusVerifier, CropLocalizer, Roster,
    VerificationModel,
};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Votes "same" when one color channel of the two images is within 8 levels.
struct ChannelModel {
    id: &'static str,
    channel: usize,
    broken_on: Option<u8>,
}

impl VerificationModel for ChannelModel {
    fn id(&self) -> &str {
        self.id
    }

    fn vote(
        &mut self,
        candidate: &RgbImage,
        reference: Reference<'_>,
        _: Option<Instant>,
    ) -> Result<ModelVote, RecognizerError> {
        let p = candidate.get_pixel(candidate.width() / 2, candidate.height() / 2).0;
        let r = reference.image.get_pixel(0, 0).0;
        if Some(r[2]) == self.broken_on {
            return Err(RecognizerError::InferenceFailed("corrupt reference".into()));
        }
        let distance = (p[self.channel] as f32 - r[self.channel] as f32).abs();
        Ok(ModelVote { verified: distance <= 8.0, distance })
    }
}

/// Reports a fixed set of boxes regardless of the scene.
struct FixedDetector(Vec<BoundingBox>);

impl Detector for FixedDetector {
    fn detect(
        &mut self,
        _: &[u8],
        _: u32,
        _: u32,
        _: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.0.clone())
    }
}

fn verifier(broken_on: Option<u8>) -> ConsensusVerifier<ChannelModel> {
    ConsensusVerifier::new(vec![
        ChannelModel { id: "vgg-face", channel: 0, broken_on },
        ChannelModel { id: "facenet", channel: 1, broken_on },
    ])
    .unwrap()
}

fn photo(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(16, 16, Rgb(color)).save(&path).unwrap();
    path
}

fn roster_csv(dir: &Path, rows: &[(&str, &Path)]) -> PathBuf {
    let mut csv = String::from("regno,name,image_path\n");
    for (regno, path) in rows {
        csv.push_str(&format!("{regno},Student {regno},{}\n", path.display()));
    }
    let path = dir.join("students.csv");
    std::fs::write(&path, csv).unwrap();
    path
}

/// 300x100 scene with three 100x100 colored tiles.
fn scene(tiles: [[u8; 3]; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(300, 100, |x, _| Rgb(tiles[(x / 100) as usize])))
}

fn tile_boxes(n: usize) -> Vec<BoundingBox> {
    (0..n)
        .map(|i| BoundingBox {
            x: i as f32 * 100.0 + 10.0,
            y: 10.0,
            width: 80.0,
            height: 80.0,
            confidence: 0.9,
        })
        .collect()
}

#[test]
fn classroom_run_writes_records() {
    let dir = tempfile::tempdir().unwrap();
    let s1 = photo(dir.path(), "s1.png", [200, 10, 1]);
    let s2 = photo(dir.path(), "s2.png", [10, 200, 2]);
    let s3 = photo(dir.path(), "s3.png", [90, 90, 3]);
    let missing = dir.path().join("s4.png");
    let roster = Roster::load(&roster_csv(
        dir.path(),
        &[("S1", &s1), ("S2", &s2), ("S3", &s3), ("S4", &missing)],
    ))
    .unwrap();
    assert_eq!(roster.len(), 3);
    assert_eq!(roster.skipped.len(), 1);

    // Tile 0 matches S1 on the red model only, tile 1 matches S2 on the
    // green model only, tile 2 matches nobody.
    let scene = scene([[200, 90, 0], [40, 205, 0], [0, 0, 0]]);
    let mut localizer = CropLocalizer::new(FixedDetector(tile_boxes(3)), DetectionParams::default());
    let mut verifier = verifier(None);

    let partition = aggregate(&scene, &roster.entries, &mut localizer, &mut verifier).unwrap();
    assert_eq!(partition.present(), ["S1", "S2"]);
    assert_eq!(partition.absent(), ["S3"]);
    assert_eq!(partition.unknown_count(), 1);

    let report = AttendanceReport::build(&partition);
    report.write_to_dir(dir.path()).unwrap();

    let present = read_records(&dir.path().join(PRESENT_FILE)).unwrap();
    let absent = read_records(&dir.path().join(ABSENT_FILE)).unwrap();
    assert_eq!(present.len(), 2);
    assert!(present.iter().all(|r| r.status == Status::Present));
    assert_eq!(absent.len(), 1);
    assert_eq!(absent[0].regno, "S3");
    assert!(report.summary.contains("Unknown Faces Detected: 1"));
}

#[test]
fn empty_scene_marks_everyone_absent() {
    let dir = tempfile::tempdir().unwrap();
    let s1 = photo(dir.path(), "s1.png", [200, 10, 1]);
    let s2 = photo(dir.path(), "s2.png", [10, 200, 2]);
    let roster = Roster::load(&roster_csv(dir.path(), &[("S1", &s1), ("S2", &s2)])).unwrap();

    let mut localizer = CropLocalizer::new(FixedDetector(vec![]), DetectionParams::default());
    let partition = aggregate(
        &scene([[200, 10, 0]; 3]),
        &roster.entries,
        &mut localizer,
        &mut verifier(None),
    )
    .unwrap();

    assert!(partition.present().is_empty());
    assert_eq!(partition.absent(), ["S1", "S2"]);
    assert_eq!(partition.unknown_count(), 0);

    let report = AttendanceReport::build(&partition);
    assert!(report.summary.contains("Present Students:\nNone"));
}

#[test]
fn broken_reference_never_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // S1's photo trips the models on every comparison.
    let s1 = photo(dir.path(), "s1.png", [200, 10, 66]);
    let s2 = photo(dir.path(), "s2.png", [10, 200, 2]);
    let roster = Roster::load(&roster_csv(dir.path(), &[("S1", &s1), ("S2", &s2)])).unwrap();

    let scene = scene([[200, 10, 0], [10, 200, 0], [200, 10, 0]]);
    let mut localizer = CropLocalizer::new(FixedDetector(tile_boxes(3)), DetectionParams::default());

    let partition = aggregate(&scene, &roster.entries, &mut localizer, &mut verifier(Some(66))).unwrap();
    assert_eq!(partition.present(), ["S2"]);
    assert_eq!(partition.absent(), ["S1"]);
    assert_eq!(partition.unknown_count(), 2);
}
