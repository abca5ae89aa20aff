//! Cough/breath clip decoding and the spectrogram input of the audio branch.

use std::io::Cursor;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ndarray::{Array2, Array4};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::error::InferenceError;
use super::mel::{MelSpectrogram, normalize_min_max, power_to_db};

pub const TARGET_SAMPLE_RATE: u32 = 22_050;
pub const CLIP_SECONDS: f32 = 3.0;
pub const SPECTROGRAM_SIZE: u32 = 128;
pub const TOP_DB: f32 = 80.0;
const MAX_FLUSHES: usize = 16;

/// What to do with a clip whose decibel spectrogram is constant (silence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegenerateAudioPolicy {
    /// Feed an all-zero spectrogram to the model.
    #[default]
    Zero,
    /// Fail the request with `DegenerateAudio`.
    Reject,
}

impl FromStr for DegenerateAudioPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(DegenerateAudioPolicy::Zero),
            "reject" => Ok(DegenerateAudioPolicy::Reject),
            other => Err(format!("unknown degenerate audio policy '{}'", other)),
        }
    }
}

/// Decoded mono waveform.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decodes an uploaded clip to mono, keeping at most `max_seconds` of audio at
/// the native rate. RIFF/WAVE goes through `hound`, every other container
/// through symphonia's probe.
pub fn decode_audio(bytes: &[u8], max_seconds: f32) -> Result<Waveform, InferenceError> {
    if bytes.is_empty() {
        return Err(InferenceError::InvalidAudio("empty upload".to_string()));
    }
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes, max_seconds)
    } else {
        decode_container(bytes, max_seconds)
    }
}

/// Averages interleaved frames into one channel; non-finite frames become silence.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    interleaved
        .chunks(channels.max(1))
        .map(|frame| {
            let mean = frame.iter().sum::<f32>() / frame.len() as f32;
            if mean.is_finite() { mean } else { 0.0 }
        })
        .collect()
}

fn decode_container(bytes: &[u8], max_seconds: f32) -> Result<Waveform, InferenceError> {
    let invalid = |what: &str, e: SymphoniaError| InferenceError::InvalidAudio(format!("{}: {}", what, e));

    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| invalid("unrecognized audio container", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| InferenceError::InvalidAudio("no decodable audio track".to_string()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| invalid("unsupported codec", e))?;

    let mut samples = Vec::new();
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut max_frames = usize::MAX;

    while samples.len() < max_frames {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(invalid("failed to read packet", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping corrupt audio packet: {}", e);
                continue;
            }
            Err(e) => return Err(invalid("failed to decode audio", e)),
        };

        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        max_frames = (max_seconds * sample_rate as f32).ceil() as usize;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(downmix(buffer.samples(), spec.channels.count()));
    }

    if sample_rate == 0 {
        return Err(InferenceError::InvalidAudio("sample rate is zero".to_string()));
    }
    samples.truncate(max_frames);
    if samples.is_empty() {
        return Err(InferenceError::InvalidAudio("clip contains no samples".to_string()));
    }

    Ok(Waveform {
        samples,
        sample_rate,
    })
}

fn decode_wav(bytes: &[u8], max_seconds: f32) -> Result<Waveform, InferenceError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| InferenceError::InvalidAudio(format!("failed to parse WAV: {}", e)))?;

    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(InferenceError::InvalidAudio("sample rate is zero".to_string()));
    }
    let channels = spec.channels.max(1) as usize;
    let max_frames = (max_seconds * spec.sample_rate as f32).ceil() as usize;
    let max_samples = max_frames.saturating_mul(channels);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .take(max_samples)
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<f32>, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .take(max_samples)
            .collect::<Result<Vec<f32>, _>>(),
    }
    .map_err(|e| InferenceError::InvalidAudio(format!("failed to read samples: {}", e)))?;

    let samples = downmix(&interleaved, channels);

    if samples.is_empty() {
        return Err(InferenceError::InvalidAudio("clip contains no samples".to_string()));
    }

    Ok(Waveform {
        samples,
        sample_rate: spec.sample_rate,
    })
}

pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Result<Vec<f32>, InferenceError> {
    if samples.is_empty() || src_rate == dst_rate {
        return Ok(samples.to_vec());
    }
    if samples.len() < 32 {
        return Ok(resample_linear(samples, src_rate, dst_rate));
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = dst_rate as f64 / src_rate as f64;
    let expected = (samples.len() as f64 * ratio).ceil() as usize;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
        .map_err(|e| InferenceError::Internal(format!("resampler init failed: {}", e)))?;

    let mut output = match resampler.process(&[samples], None) {
        Ok(mut out) => out.pop().unwrap_or_default(),
        Err(e) => {
            log::warn!("Sinc resampling failed ({}), using linear interpolation", e);
            return Ok(resample_linear(samples, src_rate, dst_rate));
        }
    };

    // The filter holds back the last half-kernel of input; push silence
    // through it until the tail comes out.
    let mut flushes = 0;
    while output.len() < expected && flushes < MAX_FLUSHES {
        let tail = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| InferenceError::Internal(format!("resampler flush failed: {}", e)))?;
        let before = output.len();
        output.extend(tail.into_iter().next().unwrap_or_default());
        if output.len() == before {
            break;
        }
        flushes += 1;
    }

    output.truncate(expected);
    if output.len() < expected {
        let linear = resample_linear(samples, src_rate, dst_rate);
        let (start, end) = (output.len(), expected.min(linear.len()));
        if start < end {
            output.extend_from_slice(&linear[start..end]);
        }
    }
    Ok(output)
}

fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((samples.len() as f64) * ratio).ceil().max(1.0) as usize;
    let last = samples.len().saturating_sub(1);

    (0..out_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let left = (pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let frac = (pos - left as f64) as f32;
            samples[left] * (1.0 - frac) + samples[right] * frac
        })
        .collect()
}

/// Truncates or right-pads with zeros to exactly `seconds * sample_rate` samples.
pub fn fit_to_duration(mut samples: Vec<f32>, sample_rate: u32, seconds: f32) -> Vec<f32> {
    let target = (seconds * sample_rate as f32) as usize;
    samples.resize(target, 0.0);
    samples
}

/// Turns an uploaded clip into the `[1, 1, 128, 128]` input of the audio branch.
#[derive(Debug, Clone)]
pub struct AudioPreprocessor {
    mel: MelSpectrogram,
    sample_rate: u32,
    clip_seconds: f32,
    output_size: u32,
    policy: DegenerateAudioPolicy,
}

impl AudioPreprocessor {
    pub fn new(policy: DegenerateAudioPolicy) -> Self {
        Self {
            mel: MelSpectrogram::new(TARGET_SAMPLE_RATE),
            sample_rate: TARGET_SAMPLE_RATE,
            clip_seconds: CLIP_SECONDS,
            output_size: SPECTROGRAM_SIZE,
            policy,
        }
    }

    pub fn preprocess(&self, bytes: &[u8]) -> Result<Array4<f32>, InferenceError> {
        let waveform = decode_audio(bytes, self.clip_seconds)?;
        let samples = self.prepare_waveform(waveform)?;
        let power = self.mel.compute(&samples);
        let db = power_to_db(&power, TOP_DB);
        self.spectrogram_tensor(&db)
    }

    /// Resample to the analysis rate, then fix the clip length.
    pub fn prepare_waveform(&self, waveform: Waveform) -> Result<Vec<f32>, InferenceError> {
        let samples = resample(&waveform.samples, waveform.sample_rate, self.sample_rate)?;
        Ok(fit_to_duration(samples, self.sample_rate, self.clip_seconds))
    }

    /// Min-max normalizes a decibel spectrogram, renders it as an 8-bit image
    /// and resizes it to the branch input size.
    pub fn spectrogram_tensor(&self, db: &Array2<f32>) -> Result<Array4<f32>, InferenceError> {
        let side = self.output_size as usize;
        let normalized = match normalize_min_max(db) {
            Some(normalized) => normalized,
            None => match self.policy {
                DegenerateAudioPolicy::Zero => {
                    log::warn!("Audio spectrogram is constant (silent clip), using zero input");
                    return Ok(Array4::zeros((1, 1, side, side)));
                }
                DegenerateAudioPolicy::Reject => {
                    return Err(InferenceError::DegenerateAudio(
                        "clip is silent or constant".to_string(),
                    ));
                }
            },
        };

        let (n_mels, frames) = normalized.dim();
        let rendered = GrayImage::from_fn(frames as u32, n_mels as u32, |x, y| {
            Luma([(normalized[[y as usize, x as usize]] * 255.0) as u8])
        });
        let resized = imageops::resize(
            &rendered,
            self.output_size,
            self.output_size,
            FilterType::CatmullRom,
        );

        let mut tensor = Array4::<f32>::zeros((1, 1, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample((s * 32767.0) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// 16-bit big-endian PCM in an AIFF container.
    fn aiff_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
        let frames = (samples.len() / channels as usize) as u32;
        let pcm: Vec<u8> = samples
            .iter()
            .flat_map(|&s| ((s * 32767.0) as i16).to_be_bytes())
            .collect();

        // 80-bit extended sample rate.
        let exponent = 31 - sample_rate.leading_zeros();
        let mantissa = (sample_rate as u64) << (63 - exponent);
        let mut rate = Vec::with_capacity(10);
        rate.extend_from_slice(&((16_383 + exponent) as u16).to_be_bytes());
        rate.extend_from_slice(&mantissa.to_be_bytes());

        let mut comm = Vec::new();
        comm.extend_from_slice(&channels.to_be_bytes());
        comm.extend_from_slice(&frames.to_be_bytes());
        comm.extend_from_slice(&16u16.to_be_bytes());
        comm.extend_from_slice(&rate);

        let mut ssnd = vec![0u8; 8];
        ssnd.extend_from_slice(&pcm);

        let mut body = b"AIFF".to_vec();
        for (id, chunk) in [(b"COMM", &comm), (b"SSND", &ssnd)] {
            body.extend_from_slice(id);
            body.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            body.extend_from_slice(chunk);
        }

        let mut out = b"FORM".to_vec();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn tone(freq: f32, seconds: f32, sample_rate: u32) -> Vec<f32> {
        let n = (seconds * sample_rate as f32) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn short_clip_pads_with_zero_tail() {
        let sr = 16_000;
        let clip = vec![0.25f32; sr as usize];
        let padded = fit_to_duration(clip, sr, 3.0);
        assert_eq!(padded.len(), 48_000);
        assert!(padded[..16_000].iter().all(|&s| s == 0.25));
        assert!(padded[16_000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn long_clip_is_truncated() {
        let padded = fit_to_duration(vec![1.0; 100_000], TARGET_SAMPLE_RATE, 3.0);
        assert_eq!(padded.len(), 66_150);
    }

    #[test]
    fn decode_is_duration_limited_and_downmixed() {
        let sr = 8_000;
        // 5 seconds stereo, left = 0.5, right = -0.5.
        let frames = 5 * sr as usize;
        let interleaved: Vec<f32> = (0..frames).flat_map(|_| [0.5f32, -0.5f32]).collect();
        let wave = decode_audio(&wav_bytes(&interleaved, sr, 2), 3.0).unwrap();
        assert_eq!(wave.sample_rate, sr);
        assert_eq!(wave.samples.len(), 3 * sr as usize);
        assert!(wave.samples.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn prepared_waveform_has_exact_length_at_target_rate() {
        let pre = AudioPreprocessor::new(DegenerateAudioPolicy::Zero);
        let wave = Waveform {
            samples: tone(440.0, 1.2, 16_000),
            sample_rate: 16_000,
        };
        let samples = pre.prepare_waveform(wave).unwrap();
        assert_eq!(samples.len(), (CLIP_SECONDS * TARGET_SAMPLE_RATE as f32) as usize);
        assert!(samples[samples.len() - 1000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn full_clip_at_44k_keeps_its_tail() {
        let input = tone(100.0, 3.0, 44_100);
        let out = resample(&input, 44_100, TARGET_SAMPLE_RATE).unwrap();
        assert_eq!(out.len(), 66_150);

        let expected = |i: usize| {
            0.5 * (2.0 * std::f32::consts::PI * 100.0 * i as f32 / TARGET_SAMPLE_RATE as f32).sin()
        };
        for i in [33_000, 66_060, 66_100] {
            assert!((out[i] - expected(i)).abs() < 0.05, "sample {i}: {} vs {}", out[i], expected(i));
        }
        let tail_peak = out[66_150 - 65..].iter().fold(0f32, |m, s| m.max(s.abs()));
        assert!(tail_peak > 0.1, "tail peak {tail_peak}");
    }

    #[test]
    fn full_clip_needs_no_padding_after_resampling() {
        let pre = AudioPreprocessor::new(DegenerateAudioPolicy::Zero);
        let wave = decode_audio(&wav_bytes(&tone(100.0, 3.0, 44_100), 44_100, 1), CLIP_SECONDS).unwrap();
        let samples = pre.prepare_waveform(wave).unwrap();
        assert_eq!(samples.len(), 66_150);
        assert!(samples[66_150 - 65..].iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn aiff_clip_decodes_through_container_probe() {
        let sr = 16_000;
        let frames = 4 * sr as usize;
        let interleaved: Vec<f32> = tone(440.0, 4.0, sr)
            .into_iter()
            .flat_map(|s| [s, s])
            .collect();
        assert_eq!(interleaved.len(), frames * 2);

        let wave = decode_audio(&aiff_bytes(&interleaved, sr, 2), 3.0).unwrap();
        assert_eq!(wave.sample_rate, sr);
        assert_eq!(wave.samples.len(), 3 * sr as usize);
        let reference = tone(440.0, 3.0, sr);
        assert!(wave.samples.iter().zip(&reference).all(|(a, b)| (a - b).abs() < 1e-3));

        let tensor = AudioPreprocessor::new(DegenerateAudioPolicy::Reject)
            .preprocess(&aiff_bytes(&tone(660.0, 2.0, sr), sr, 1))
            .unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 128, 128]);
    }

    #[test]
    fn unknown_container_is_invalid_audio() {
        assert!(matches!(decode_audio(b"fLaC garbage", 3.0), Err(InferenceError::InvalidAudio(_))));
        assert!(matches!(decode_audio(b"OggS", 3.0), Err(InferenceError::InvalidAudio(_))));
    }

    #[test]
    fn linear_resampling_scales_length() {
        let out = resample_linear(&[0.0, 1.0, 0.0, -1.0], 8_000, 16_000);
        assert_eq!(out.len(), 8);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn tone_yields_unit_range_spectrogram_tensor() {
        let pre = AudioPreprocessor::new(DegenerateAudioPolicy::Reject);
        let bytes = wav_bytes(&tone(660.0, 2.0, TARGET_SAMPLE_RATE), TARGET_SAMPLE_RATE, 1);
        let tensor = pre.preprocess(&bytes).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 128, 128]);
        assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(tensor.iter().any(|&v| v > 0.9));
    }

    #[test]
    fn silent_clip_follows_policy() {
        let bytes = wav_bytes(&vec![0.0; 3 * TARGET_SAMPLE_RATE as usize], TARGET_SAMPLE_RATE, 1);

        let zero = AudioPreprocessor::new(DegenerateAudioPolicy::Zero)
            .preprocess(&bytes)
            .unwrap();
        assert_eq!(zero.shape(), &[1, 1, 128, 128]);
        assert!(zero.iter().all(|&v| v == 0.0));

        let rejected = AudioPreprocessor::new(DegenerateAudioPolicy::Reject).preprocess(&bytes);
        assert!(matches!(rejected, Err(InferenceError::DegenerateAudio(_))));
    }

    #[test]
    fn malformed_audio_is_rejected() {
        let pre = AudioPreprocessor::new(DegenerateAudioPolicy::Zero);
        assert!(matches!(pre.preprocess(b"RIFF nope"), Err(InferenceError::InvalidAudio(_))));
        assert!(matches!(pre.preprocess(&[]), Err(InferenceError::InvalidAudio(_))));
        let empty_wav = wav_bytes(&[], TARGET_SAMPLE_RATE, 1);
        assert!(matches!(pre.preprocess(&empty_wav), Err(InferenceError::InvalidAudio(_))));
    }

    #[test]
    fn policy_parses_from_env_strings() {
        assert_eq!("Zero".parse::<DegenerateAudioPolicy>(), Ok(DegenerateAudioPolicy::Zero));
        assert_eq!(" reject ".parse::<DegenerateAudioPolicy>(), Ok(DegenerateAudioPolicy::Reject));
        assert!("clamp".parse::<DegenerateAudioPolicy>().is_err());
    }
}
