use std::f64::consts::PI;

use ndarray::Array2;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;
pub const N_MELS: usize = 128;
pub const AMIN: f32 = 1e-10;

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

/// Triangular mel filters with Slaney area normalization, `[n_mels, n_fft / 2 + 1]`.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let mel_freqs: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let (left, center, right) = (mel_freqs[m], mel_freqs[m + 1], mel_freqs[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            let w = lower.min(upper).max(0.0);
            weights[[m, k]] = (w * enorm) as f32;
        }
    }
    weights
}

/// Periodic Hann window.
fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f64 / size as f64).cos()) as f32)
        .collect()
}

/// Mel power spectrogram over centered, zero-padded frames.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    filterbank: Array2<f32>,
}

impl MelSpectrogram {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            n_fft: N_FFT,
            hop_length: HOP_LENGTH,
            window: hann_window(N_FFT),
            filterbank: mel_filterbank(sample_rate, N_FFT, N_MELS, 0.0, sample_rate as f64 / 2.0),
        }
    }

    pub fn frame_count(&self, n_samples: usize) -> usize {
        1 + n_samples / self.hop_length
    }

    /// Returns `[n_mels, frames]` power values.
    pub fn compute(&self, samples: &[f32]) -> Array2<f32> {
        let pad = self.n_fft / 2;
        let mut padded = vec![0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let frames = self.frame_count(samples.len());
        let n_freqs = self.n_fft / 2 + 1;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.n_fft);
        let mut buffer = vec![Complex::new(0f32, 0f32); self.n_fft];
        let mut power = Array2::<f32>::zeros((n_freqs, frames));

        for t in 0..frames {
            let frame = &padded[t * self.hop_length..t * self.hop_length + self.n_fft];
            for ((slot, &s), &w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                *slot = Complex::new(s * w, 0.0);
            }
            fft.process(&mut buffer);
            for k in 0..n_freqs {
                power[[k, t]] = buffer[k].norm_sqr();
            }
        }

        self.filterbank.dot(&power)
    }
}

/// Converts power to decibels relative to the loudest bin, floored at `max - top_db`.
pub fn power_to_db(power: &Array2<f32>, top_db: f32) -> Array2<f32> {
    let reference = power.iter().cloned().fold(f32::NEG_INFINITY, f32::max).max(AMIN);
    let ref_db = 10.0 * reference.log10();

    let mut db = power.mapv(|p| 10.0 * p.max(AMIN).log10() - ref_db);
    let max_db = db.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let floor = max_db - top_db;
    db.mapv_inplace(|v| v.max(floor));
    db
}

/// Scales to `[0, 1]` using the array's own extremes. `None` when the array is
/// constant or contains non-finite values.
pub fn normalize_min_max(values: &Array2<f32>) -> Option<Array2<f32>> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !min.is_finite() || !max.is_finite() || values.iter().any(|v| !v.is_finite()) || range <= 0.0 {
        return None;
    }
    Some(values.mapv(|v| (v - min) / range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn slaney_scale_round_trips_and_is_linear_below_1khz() {
        assert!((hz_to_mel(500.0) - 7.5).abs() < 1e-9);
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        for hz in [0.0, 250.0, 999.0, 1000.0, 4000.0, 11025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn filterbank_shape_and_coverage() {
        let fb = mel_filterbank(22_050, N_FFT, N_MELS, 0.0, 11_025.0);
        assert_eq!(fb.dim(), (128, 1025));
        assert!(fb.iter().all(|&w| w >= 0.0));
        for row in fb.rows() {
            assert!(row.iter().any(|&w| w > 0.0));
        }
    }

    #[test]
    fn three_second_clip_has_130_frames() {
        let mel = MelSpectrogram::new(22_050);
        let power = mel.compute(&vec![0.0; 66_150]);
        assert_eq!(power.dim(), (128, 130));
    }

    #[test]
    fn tone_energy_lands_in_matching_band() {
        let sr = 22_050u32;
        let samples: Vec<f32> = (0..66_150)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sr as f32).sin())
            .collect();
        let power = MelSpectrogram::new(sr).compute(&samples);

        let column = power.column(65);
        let (peak_band, _) = column
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });

        let mel_max = hz_to_mel(sr as f64 / 2.0);
        let center_hz = mel_to_hz(mel_max * (peak_band + 1) as f64 / (N_MELS + 1) as f64);
        assert!((center_hz - 1000.0).abs() < 60.0, "peak band centered at {center_hz} Hz");
    }

    #[test]
    fn loudest_bin_maps_to_zero_db() {
        let power = array![[1.0f32, 10.0], [100.0, 0.1]];
        let db = power_to_db(&power, 80.0);
        assert!((db[[1, 0]] - 0.0).abs() < 1e-5);
        assert!((db[[0, 1]] + 10.0).abs() < 1e-4);
        assert!((db[[1, 1]] + 30.0).abs() < 1e-4);
    }

    #[test]
    fn decibels_are_floored_by_top_db() {
        let power = array![[1.0f32, 1e-12], [0.0, 1e-3]];
        let db = power_to_db(&power, 80.0);
        assert!(db.iter().all(|&v| v >= -80.0 && v <= 0.0));
        assert!((db[[1, 0]] + 80.0).abs() < 1e-4);
    }

    #[test]
    fn normalization_uses_own_extremes() {
        let db = array![[-80.0f32, -40.0], [0.0, -20.0]];
        let norm = normalize_min_max(&db).unwrap();
        assert_eq!(norm[[0, 0]], 0.0);
        assert_eq!(norm[[1, 0]], 1.0);
        assert!((norm[[0, 1]] - 0.5).abs() < 1e-6);
        assert!(norm.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn constant_input_is_degenerate() {
        let silent = power_to_db(&Array2::zeros((4, 4)), 80.0);
        assert!(silent.iter().all(|&v| v == 0.0));
        assert!(normalize_min_max(&silent).is_none());
        assert!(normalize_min_max(&array![[1.0f32, f32::NAN]]).is_none());
    }
}
