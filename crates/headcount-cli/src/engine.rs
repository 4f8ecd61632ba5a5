use crate::config::Config;
use headcount_core::localizer::Localizer;
use headcount_core::{
    aggregate, AttendancePartition, ConsensusVerifier, CropLocalizer, FaceCandidate, FaceDetector,
    FaceRecognizer, RosterEntry,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] headcount_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] headcount_core::recognizer::RecognizerError),
    #[error("model preset error: {0}")]
    Preset(#[from] headcount_core::presets::PresetError),
    #[error(transparent)]
    NoModels(#[from] headcount_core::verifier::NoModelsError),
    #[error("cannot read scene {path}: {source}")]
    Scene {
        path: String,
        source: image::ImageError,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the command layer to the engine thread.
enum EngineRequest {
    TakeAttendance {
        scene: PathBuf,
        roster: Vec<RosterEntry>,
        reply: oneshot::Sender<Result<AttendancePartition, EngineError>>,
    },
    Localize {
        scene: PathBuf,
        reply: oneshot::Sender<Result<Vec<FaceCandidate>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Localize faces in `scene` and verify them against `roster`.
    pub async fn take_attendance(
        &self,
        scene: PathBuf,
        roster: Vec<RosterEntry>,
    ) -> Result<AttendancePartition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::TakeAttendance {
                scene,
                roster,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Localize faces in `scene` only.
    pub async fn localize(&self, scene: PathBuf) -> Result<Vec<FaceCandidate>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Localize {
                scene,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the detector and, when `with_verifier` is set, every configured
/// verification model before returning. Fails fast if any model is missing.
pub fn spawn_engine(config: &Config, with_verifier: bool) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let params = config.detection_params();
    params.validate()?;
    let mut localizer = CropLocalizer::new(detector, params);

    let mut verifier = if with_verifier {
        let mut models = Vec::new();
        for preset in config.presets()? {
            let path = config.model_path(&preset);
            let name = preset.name().to_string();
            models.push(FaceRecognizer::load(&path, preset)?);
            tracing::info!(model = %name, path = %path, "verification model loaded");
        }
        Some(ConsensusVerifier::new(models)?.with_pair_budget(config.pair_budget()))
    } else {
        None
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("headcount-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::TakeAttendance {
                        scene,
                        roster,
                        reply,
                    } => {
                        let result = match verifier.as_mut() {
                            Some(verifier) => {
                                run_attendance(&scene, &roster, &mut localizer, verifier)
                            }
                            None => Err(EngineError::NoModels(
                                headcount_core::verifier::NoModelsError,
                            )),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Localize { scene, reply } => {
                        let result = open_scene(&scene)
                            .and_then(|img| Ok(localizer.localize(&img)?));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn open_scene(path: &Path) -> Result<image::DynamicImage, EngineError> {
    let img = image::open(path).map_err(|source| EngineError::Scene {
        path: path.display().to_string(),
        source,
    })?;
    tracing::debug!(
        path = %path.display(),
        width = img.width(),
        height = img.height(),
        "scene loaded"
    );
    Ok(img)
}

fn run_attendance(
    scene: &Path,
    roster: &[RosterEntry],
    localizer: &mut CropLocalizer<FaceDetector>,
    verifier: &mut ConsensusVerifier<FaceRecognizer>,
) -> Result<AttendancePartition, EngineError> {
    let img = open_scene(scene)?;
    Ok(aggregate(&img, roster, localizer, verifier)?)
}
