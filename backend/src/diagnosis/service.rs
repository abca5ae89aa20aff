use std::sync::Arc;
use std::time::Instant;

use shared::{DiagnosisLabel, PredictionResponse};

use super::audio::{AudioPreprocessor, DegenerateAudioPolicy};
use super::error::InferenceError;
use super::network::FusionModel;
use super::xray::ImagePreprocessor;

/// Class probabilities as percentages, rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub healthy: f64,
    pub pneumonia: f64,
}

impl Prediction {
    pub fn from_logits(logits: [f32; 2]) -> Self {
        let probs = softmax(logits);
        Self {
            healthy: round_percent(probs[DiagnosisLabel::Healthy.index()]),
            pneumonia: round_percent(probs[DiagnosisLabel::Pneumonia.index()]),
        }
    }

    pub fn into_response(self) -> PredictionResponse {
        PredictionResponse::success(self.healthy, self.pneumonia)
    }
}

fn softmax(logits: [f32; 2]) -> [f64; 2] {
    let max = logits[0].max(logits[1]) as f64;
    let exp = logits.map(|l| (l as f64 - max).exp());
    let sum = exp[0] + exp[1];
    exp.map(|e| e / sum)
}

fn round_percent(p: f64) -> f64 {
    (p * 100.0 * 100.0).round() / 100.0
}

/// Runs the full X-ray + audio pipeline against an injected model.
#[derive(Clone)]
pub struct InferenceService {
    model: Arc<dyn FusionModel>,
    image: Arc<ImagePreprocessor>,
    audio: Arc<AudioPreprocessor>,
}

impl InferenceService {
    pub fn new(model: Arc<dyn FusionModel>, policy: DegenerateAudioPolicy) -> Self {
        Self {
            model,
            image: Arc::new(ImagePreprocessor::new()),
            audio: Arc::new(AudioPreprocessor::new(policy)),
        }
    }

    pub fn predict(&self, xray: &[u8], audio: &[u8]) -> Result<Prediction, InferenceError> {
        let started = Instant::now();
        let image_tensor = self.image.preprocess(xray)?;
        let spectrogram = self.audio.preprocess(audio)?;
        let preprocessed = started.elapsed();

        let logits = self.model.logits(&image_tensor, &spectrogram)?;
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(InferenceError::Internal("model produced non-finite logits".to_string()));
        }

        let prediction = Prediction::from_logits(logits);
        log::debug!(
            "Prediction {:?} (preprocess {:?}, total {:?})",
            prediction,
            preprocessed,
            started.elapsed()
        );
        Ok(prediction)
    }
}
