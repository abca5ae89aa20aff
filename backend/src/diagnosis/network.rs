use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};

use super::error::InferenceError;

pub const VISION_CHANNELS: [i64; 5] = [3, 32, 64, 128, 256];
pub const AUDIO_CHANNELS: [i64; 4] = [1, 32, 64, 128];
pub const FUSED_FEATURES: i64 = 256 + 128;
pub const HIDDEN_FEATURES: i64 = 128;
pub const NUM_CLASSES: i64 = 2;
const DROPOUT: f64 = 0.5;

/// Conv(3x3, padding 2) -> BatchNorm -> ReLU -> MaxPool(2).
///
/// The padding is wider than the kernel needs, so each block grows the map by
/// two pixels before halving it. Trained weights depend on this.
#[derive(Debug)]
pub struct ConvBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBlock {
    pub fn new(p: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            padding: 2,
            ..Default::default()
        };
        let conv = nn::conv2d(&p / 0, in_channels, out_channels, 3, conv_cfg);
        let bn = nn::batch_norm2d(&p / 1, out_channels, Default::default());
        Self { conv, bn }
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv)
            .apply_t(&self.bn, train)
            .relu()
            .max_pool2d_default(2)
    }
}

/// Stack of conv blocks followed by global average pooling, `[N, C, H, W] -> [N, C_out]`.
#[derive(Debug)]
pub struct FeatureBranch {
    blocks: Vec<ConvBlock>,
}

impl FeatureBranch {
    pub fn new(p: nn::Path, channels: &[i64]) -> Self {
        let blocks = channels
            .windows(2)
            .enumerate()
            .map(|(i, pair)| ConvBlock::new(&p / i, pair[0], pair[1]))
            .collect();
        Self { blocks }
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

impl ModuleT for FeatureBranch {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = self
            .blocks
            .iter()
            .fold(xs.shallow_clone(), |acc, block| block.forward_t(&acc, train));
        features.adaptive_avg_pool2d([1, 1]).flatten(1, -1)
    }
}

/// Linear -> ReLU -> Dropout -> Linear over the fused feature vector.
#[derive(Debug)]
pub struct FusionHead {
    hidden: nn::Linear,
    output: nn::Linear,
}

impl FusionHead {
    pub fn new(p: nn::Path) -> Self {
        // Indices 1 and 2 are the parameterless ReLU and Dropout.
        let hidden = nn::linear(&p / 0, FUSED_FEATURES, HIDDEN_FEATURES, Default::default());
        let output = nn::linear(&p / 3, HIDDEN_FEATURES, NUM_CLASSES, Default::default());
        Self { hidden, output }
    }
}

impl ModuleT for FusionHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.hidden)
            .relu()
            .dropout(DROPOUT, train)
            .apply(&self.output)
    }
}

/// Two-branch X-ray + audio classifier. Vision features come first in the
/// fused vector.
#[derive(Debug)]
pub struct PneumoniaNet {
    vision: FeatureBranch,
    audio: FeatureBranch,
    classifier: FusionHead,
}

impl PneumoniaNet {
    pub fn new(root: &nn::Path) -> Self {
        Self {
            vision: FeatureBranch::new(root / "vision_branch", &VISION_CHANNELS),
            audio: FeatureBranch::new(root / "audio_branch", &AUDIO_CHANNELS),
            classifier: FusionHead::new(root / "classifier"),
        }
    }

    pub fn forward_t(&self, xray: &Tensor, spectrogram: &Tensor, train: bool) -> Tensor {
        let vision = self.vision.forward_t(xray, train);
        let audio = self.audio.forward_t(spectrogram, train);
        let fused = Tensor::cat(&[vision, audio], 1);
        self.classifier.forward_t(&fused, train)
    }
}

/// Anything that maps a preprocessed X-ray and spectrogram to the two class logits.
pub trait FusionModel: Send + Sync {
    fn logits(&self, xray: &Array4<f32>, spectrogram: &Array4<f32>) -> Result<[f32; 2], InferenceError>;
}

/// `PneumoniaNet` backed by libtorch, weights frozen after load.
pub struct TorchFusionModel {
    // Owns the parameters referenced by `net`.
    _vs: nn::VarStore,
    net: Mutex<PneumoniaNet>,
    device: Device,
}

impl TorchFusionModel {
    /// Loads weights from a `.safetensors`, `.ot` or `.npz` file whose tensor
    /// names follow the `vision_branch.*`, `audio_branch.*`, `classifier.*` layout.
    pub fn load(path: &Path, device: Device) -> Result<Self, InferenceError> {
        if !path.is_file() {
            return Err(InferenceError::ModelLoad(format!(
                "weights file not found: {}",
                path.display()
            )));
        }

        let mut vs = nn::VarStore::new(device);
        let net = PneumoniaNet::new(&vs.root());
        vs.load(path)
            .map_err(|e| InferenceError::ModelLoad(format!("{}: {}", path.display(), e)))?;
        vs.freeze();

        log::info!(
            "Loaded {} parameter tensors from {} on {:?} ({} vision blocks, {} audio blocks)",
            vs.variables().len(),
            path.display(),
            device,
            net.vision.depth(),
            net.audio.depth()
        );
        Ok(Self::from_parts(vs, net, device))
    }

    fn from_parts(vs: nn::VarStore, net: PneumoniaNet, device: Device) -> Self {
        Self {
            _vs: vs,
            net: Mutex::new(net),
            device,
        }
    }

    fn to_tensor(&self, array: &Array4<f32>) -> Result<Tensor, InferenceError> {
        let contiguous = array.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| InferenceError::Internal("non-contiguous input tensor".to_string()))?;
        let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
        Ok(Tensor::from_slice(data)
            .f_view(shape.as_slice())?
            .to_device(self.device))
    }
}

impl FusionModel for TorchFusionModel {
    fn logits(&self, xray: &Array4<f32>, spectrogram: &Array4<f32>) -> Result<[f32; 2], InferenceError> {
        let xray = self.to_tensor(xray)?;
        let spectrogram = self.to_tensor(spectrogram)?;

        let output = {
            let net = self
                .net
                .lock()
                .map_err(|_| InferenceError::Internal("model lock poisoned".to_string()))?;
            let _guard = tch::no_grad_guard();
            net.forward_t(&xray, &spectrogram, false)
        };

        let flat = output
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .f_view([-1])?;
        let numel = flat.numel();
        if numel != NUM_CLASSES as usize {
            return Err(InferenceError::Internal(format!(
                "expected {} logits, model produced {}",
                NUM_CLASSES, numel
            )));
        }
        let mut logits = [0f32; 2];
        flat.copy_data(&mut logits, numel);
        Ok(logits)
    }
}
