//! Media handling: downloading task attachments, converting them to a
//! normalized WAV via ffmpeg, and decoding that WAV into a mono sample
//! buffer engines can consume.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, info};
use url::Url;

use crate::api::ApiDocument;
use crate::error::MediaError;

/// All engines consume audio at this rate.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Normalized mono audio.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Downloads the first media attachment of `document` into `dir`.
///
/// Fails with [`MediaError::Missing`] when the document has no media at all;
/// callers check this before doing any replica or sync work.
pub async fn fetch_media(
    http: &reqwest::Client,
    base: &Url,
    document: &ApiDocument,
    dir: &Path,
) -> Result<PathBuf, MediaError> {
    // TODO: smarter selection when documents grow multiple media tags
    let media_file = document
        .media_files
        .first()
        .ok_or_else(|| MediaError::Missing {
            document_id: document.id.clone(),
        })?;

    let url = base
        .join(&media_file.url)
        .map_err(|e| MediaError::Download(format!("bad media url '{}': {e}", media_file.url)))?;
    info!(%url, document_id = %document.id, "downloading media");

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| MediaError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(MediaError::Download(format!(
            "media request returned {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| MediaError::Download(e.to_string()))?;

    let path = dir.join(format!(
        "doc_audio.{}",
        extension_for(&media_file.content_type)
    ));
    std::fs::write(&path, &bytes)?;
    Ok(path)
}

/// File extension for a media content type, used to name scratch files so
/// ffmpeg can sniff the container.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/opus" => "opus",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/mp4" | "audio/x-m4a" | "audio/m4a" => "m4a",
        "audio/aac" => "aac",
        "video/mp4" => "mp4",
        "video/webm" | "audio/webm" => "webm",
        "video/x-matroska" => "mkv",
        _ => "bin",
    }
}

/// Media duration in seconds, via ffprobe.
pub fn probe_duration(path: &Path) -> Result<f64, MediaError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .map_err(|e| MediaError::Convert(format!("failed to execute ffprobe: {e}")))?;
    if !output.status.success() {
        return Err(MediaError::Convert(format!(
            "ffprobe failed with status {}",
            output.status
        )));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .map_err(|e| MediaError::Convert(format!("unparsable ffprobe duration: {e}")))
}

/// Converts any container ffmpeg understands into 16 kHz mono PCM WAV,
/// reporting progress in [0, 1] parsed from ffmpeg's `-progress` key=value
/// stream.
pub fn convert_to_wav(
    input: &Path,
    output: &Path,
    progress: &mut dyn FnMut(f64),
) -> Result<(), MediaError> {
    let duration = probe_duration(input)?;
    info!("converting {} to wav", input.display());

    let mut child = Command::new("ffmpeg")
        .arg("-i")
        .arg(input)
        .arg("-map")
        .arg("0:a")
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("-map_metadata")
        .arg("-1")
        .arg("-loglevel")
        .arg("quiet")
        .arg("-progress")
        .arg("pipe:1")
        .arg("-y")
        .arg(output)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| MediaError::Convert(format!("failed to execute ffmpeg: {e}")))?;

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            if let Some(("out_time_ms", value)) = line.split_once('=').map(|(k, v)| (k.trim(), v)) {
                if let (Ok(out_time_ms), true) = (value.trim().parse::<i64>(), duration > 0.0) {
                    let out_time_s = out_time_ms as f64 / 1e6;
                    progress((out_time_s / duration).clamp(0.0, 1.0));
                }
            }
        }
    }

    let status = child
        .wait()
        .map_err(|e| MediaError::Convert(e.to_string()))?;
    if !status.success() {
        return Err(MediaError::Convert(format!(
            "ffmpeg conversion failed with status: {status}"
        )));
    }
    Ok(())
}

/// Decodes a 16-bit PCM WAV into a normalized mono buffer at
/// [`TARGET_SAMPLE_RATE`].
pub fn decode_wav(path: &Path) -> Result<AudioBuffer, MediaError> {
    let mut reader =
        WavReader::open(path).map_err(|e| MediaError::Decode(format!("open wav: {e}")))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(MediaError::UnsupportedFormat(format!(
            "expected 16-bit integer PCM, got {:?} at {} bits",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    debug!(sample_rate = spec.sample_rate, channels = spec.channels, "decoding wav");

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<Result<_, _>>()
        .map_err(|e| MediaError::Decode(format!("read samples: {e}")))?;

    let mono = convert_to_mono(&samples, spec.channels as usize);
    let normalized = normalize(&mono);
    let samples = if spec.sample_rate == TARGET_SAMPLE_RATE {
        normalized
    } else {
        resample(&normalized, spec.sample_rate, TARGET_SAMPLE_RATE)?
    };

    Ok(AudioBuffer {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

/// Loads any supported media file as a normalized buffer, converting through
/// ffmpeg first when it is not already a WAV.
pub fn load_audio(path: &Path) -> Result<AudioBuffer, MediaError> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        return decode_wav(path);
    }
    let wav_path = path.with_extension("wav");
    convert_to_wav(path, &wav_path, &mut |ratio| {
        debug!(ratio, "media conversion progress");
    })?;
    decode_wav(&wav_path)
}

/// Writes a buffer back out as 16-bit PCM WAV, e.g. for subprocess engines.
pub fn write_wav(path: &Path, audio: &AudioBuffer) -> Result<(), MediaError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(path, spec).map_err(|e| MediaError::Decode(format!("create wav: {e}")))?;
    for &sample in &audio.samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(value)
            .map_err(|e| MediaError::Decode(format!("write sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| MediaError::Decode(format!("finalize wav: {e}")))?;
    Ok(())
}

fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / num_channels as f32)
        .collect()
}

fn normalize(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs == 0.0 {
        return samples.to_vec();
    }
    samples.iter().map(|s| s / max_abs).collect()
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, MediaError> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    debug!(from_rate, to_rate, "resampling audio");

    let params = SincInterpolationParameters {
        sinc_len: 512,
        f_cutoff: 0.98,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 512,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| MediaError::Decode(format!("create resampler: {e}")))?;

    let mut resampled = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| MediaError::Decode(format!("resample: {e}")))?;
    Ok(resampled.remove(0))
}
