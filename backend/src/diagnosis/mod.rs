pub mod audio;
pub mod error;
pub mod mel;
pub mod network;
pub mod service;
pub mod xray;

pub use audio::DegenerateAudioPolicy;
pub use error::InferenceError;
pub use network::{FusionModel, TorchFusionModel};
pub use service::{InferenceService, Prediction};
