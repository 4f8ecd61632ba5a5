use headcount_core::presets::{resolve_presets, ModelPreset, PresetError};
use headcount_core::DetectionParams;
use std::path::PathBuf;
use std::time::Duration;

/// Run configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name, relative to `model_dir`.
    pub detector_model: String,
    /// Verification presets to run, in order.
    pub verify_models: Vec<String>,
    /// Optional extra preset TOML, consulted before the built-ins.
    pub extra_preset: Option<PathBuf>,
    pub scale_step: f32,
    pub min_neighbors: usize,
    pub detect_max_input: usize,
    pub detect_confidence: f32,
    /// Per-pair verification budget in milliseconds; 0 disables it.
    pub pair_timeout_ms: u64,
    /// Wall-clock limit for a whole attendance run.
    pub run_timeout_secs: u64,
    /// Where the summary goes. No notification when unset.
    pub notify_destination: Option<String>,
    pub notify_delay_secs: u64,
    /// Spool directory for outgoing notifications; log only when unset.
    pub notify_spool_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `HEADCOUNT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("HEADCOUNT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| headcount_core::default_model_dir());

        let verify_models = std::env::var("HEADCOUNT_VERIFY_MODELS")
            .map(|v| parse_list(&v))
            .unwrap_or_else(|_| vec!["vgg-face".to_string(), "facenet".to_string()]);

        let defaults = DetectionParams::default();

        Self {
            model_dir,
            detector_model: std::env::var("HEADCOUNT_DETECTOR_MODEL")
                .unwrap_or_else(|_| "det_10g.onnx".to_string()),
            verify_models,
            extra_preset: env_path("HEADCOUNT_MODEL_PRESETS"),
            scale_step: env_f32("HEADCOUNT_SCALE_STEP", defaults.scale_step),
            min_neighbors: env_usize("HEADCOUNT_MIN_NEIGHBORS", defaults.min_neighbor_count),
            detect_max_input: env_usize("HEADCOUNT_DETECT_MAX_INPUT", defaults.max_input_size),
            detect_confidence: env_f32(
                "HEADCOUNT_DETECT_CONFIDENCE",
                defaults.confidence_threshold,
            ),
            pair_timeout_ms: env_u64("HEADCOUNT_PAIR_TIMEOUT_MS", 5000),
            run_timeout_secs: env_u64("HEADCOUNT_RUN_TIMEOUT_SECS", 600),
            notify_destination: std::env::var("HEADCOUNT_NOTIFY_DESTINATION")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            notify_delay_secs: env_u64("HEADCOUNT_NOTIFY_DELAY_SECS", 60),
            notify_spool_dir: env_path("HEADCOUNT_NOTIFY_SPOOL_DIR"),
        }
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            scale_step: self.scale_step,
            min_neighbor_count: self.min_neighbors,
            max_input_size: self.detect_max_input,
            confidence_threshold: self.detect_confidence,
            ..DetectionParams::default()
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to a verification model file named by a preset.
    pub fn model_path(&self, preset: &ModelPreset) -> String {
        self.model_dir
            .join(&preset.model.file)
            .to_string_lossy()
            .into_owned()
    }

    /// Resolve `verify_models` to presets, loading the extra preset file if set.
    pub fn presets(&self) -> Result<Vec<ModelPreset>, PresetError> {
        let extra = match &self.extra_preset {
            Some(path) => vec![ModelPreset::from_file(path)?],
            None => Vec::new(),
        };
        resolve_presets(&self.verify_models, &extra)
    }

    pub fn pair_budget(&self) -> Option<Duration> {
        (self.pair_timeout_ms > 0).then(|| Duration::from_millis(self.pair_timeout_ms))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_secs(self.notify_delay_secs)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            model_dir: PathBuf::from("/models"),
            detector_model: "det_10g.onnx".into(),
            verify_models: vec!["vgg-face".into(), "facenet".into()],
            extra_preset: None,
            scale_step: 1.2,
            min_neighbors: 0,
            detect_max_input: 960,
            detect_confidence: 0.6,
            pair_timeout_ms: 0,
            run_timeout_secs: 600,
            notify_destination: None,
            notify_delay_secs: 60,
            notify_spool_dir: None,
        }
    }

    #[test]
    fn test_parse_list_trims_and_skips_empty() {
        assert_eq!(parse_list(" vgg-face, ,facenet ,"), vec!["vgg-face", "facenet"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_detection_params_carry_overrides() {
        let p = config().detection_params();
        assert!((p.scale_step - 1.2).abs() < 1e-6);
        assert_eq!(p.min_neighbor_count, 0);
        assert_eq!(p.max_input_size, 960);
        assert_eq!(p.base_input_size, DetectionParams::default().base_input_size);
    }

    #[test]
    fn test_zero_pair_timeout_disables_budget() {
        let mut c = config();
        assert_eq!(c.pair_budget(), None);
        c.pair_timeout_ms = 250;
        assert_eq!(c.pair_budget(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_model_paths_join_model_dir() {
        let c = config();
        assert_eq!(c.detector_model_path(), "/models/det_10g.onnx");
        let presets = c.presets().unwrap();
        assert_eq!(c.model_path(&presets[0]), "/models/vgg_face.onnx");
    }

    #[test]
    fn test_unknown_preset_is_rejected() {
        let mut c = config();
        c.verify_models = vec!["nope".into()];
        assert!(matches!(c.presets(), Err(PresetError::Unknown(n)) if n == "nope"));
    }

    #[test]
    fn test_extra_preset_file_is_consulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[model]
name = "custom"
file = "custom.onnx"

[input]
size = 112
layout = "nchw"
channel_order = "rgb"
mean = [127.5, 127.5, 127.5]
std = [128.0, 128.0, 128.0]

[embedding]
dim = 512
metric = "cosine"
threshold = 0.5
"#,
        )
        .unwrap();

        let mut c = config();
        c.extra_preset = Some(path);
        c.verify_models = vec!["custom".into(), "arcface".into()];
        let names: Vec<String> = c.presets().unwrap().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["custom", "arcface"]);
    }
}
