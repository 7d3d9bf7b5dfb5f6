//! Best-effort playback duration of an uploaded asset.
//!
//! A probe failure never fails an upload: [`bounded_probe`] turns timeouts
//! and errors into a zero duration with a warning flag.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::time::Duration;
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::race::{race, Raced};
use crate::ProbeError;

/// Reads the playback duration of the asset behind a public URL
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<f64, ProbeError>;
}

/// Duration or the reason it is missing, folded into what a result carries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub duration_seconds: f64,
    /// Set when the duration could not be read and defaulted to `0.0`
    pub warning: bool,
}

impl ProbeOutcome {
    pub fn measured(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            warning: false,
        }
    }

    pub fn missing() -> Self {
        Self {
            duration_seconds: 0.0,
            warning: true,
        }
    }
}

/// Run `probe` under its own `timeout`.
///
/// Returns `None` only when `cancel` fires first.
pub async fn bounded_probe(
    probe: &dyn DurationProbe,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<ProbeOutcome> {
    match race(cancel, Some(Instant::now() + timeout), probe.probe(url)).await {
        Raced::Settled(Ok(seconds)) if seconds.is_finite() && seconds >= 0.0 => {
            debug!("Probed duration of {}: {:.2}s", url, seconds);
            Some(ProbeOutcome::measured(seconds))
        }
        Raced::Settled(Ok(seconds)) => {
            warn!("Duration probe returned an unusable value ({}), defaulting to 0", seconds);
            Some(ProbeOutcome::missing())
        }
        Raced::Settled(Err(err)) => {
            warn!("Duration probe failed, defaulting to 0: {}", err);
            Some(ProbeOutcome::missing())
        }
        Raced::TimedOut => {
            warn!("Duration probe timed out after {:?}, defaulting to 0", timeout);
            Some(ProbeOutcome::missing())
        }
        Raced::Cancelled => None,
    }
}

/// Downloads the asset and decodes its container with symphonia
#[derive(Debug, Clone, Default)]
pub struct HttpDurationProbe {
    client: reqwest::Client,
}

impl HttpDurationProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DurationProbe for HttpDurationProbe {
    async fn probe(&self, url: &str) -> Result<f64, ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::Fetch(e.to_string()))?;

        let hint = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| extension_of(url));

        let data = response.bytes().await.map_err(|e| ProbeError::Fetch(e.to_string()))?;

        tokio::task::spawn_blocking(move || duration_from_bytes(data, hint.as_deref()))
            .await
            .map_err(|e| ProbeError::Decode(format!("probe task failed: {e}")))?
    }
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// Playback duration of an encoded audio file.
///
/// `hint` is a MIME type (`audio/mpeg`) or a file extension (`mp3`).
/// Codec parameters are used when the container declares a frame count,
/// otherwise packet durations are summed.
pub fn duration_from_bytes(data: Bytes, hint: Option<&str>) -> Result<f64, ProbeError> {
    let media_source = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let mut probe_hint = Hint::new();
    match hint {
        Some(h) if h.contains('/') => {
            probe_hint.mime_type(h);
        }
        Some(h) => {
            probe_hint.with_extension(h);
        }
        None => {}
    }

    let probed = symphonia::default::get_probe()
        .format(&probe_hint, media_source, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| ProbeError::Decode(e.to_string()))?;
    let mut format = probed.format;

    let (track_id, time_base, n_frames) = {
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| ProbeError::Decode("no audio track".to_string()))?;
        let params = &track.codec_params;
        let time_base = params
            .time_base
            .or_else(|| params.sample_rate.map(|rate| TimeBase::new(1, rate)))
            .ok_or(ProbeError::UnknownDuration)?;
        (track.id, time_base, params.n_frames)
    };

    let ticks = match n_frames {
        Some(frames) => frames,
        None => {
            let mut total = 0u64;
            loop {
                match format.next_packet() {
                    Ok(packet) if packet.track_id() == track_id => total += packet.dur,
                    Ok(_) => {}
                    Err(SymphoniaError::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(SymphoniaError::ResetRequired) => break,
                    Err(e) => return Err(ProbeError::Decode(e.to_string())),
                }
            }
            total
        }
    };

    if ticks == 0 {
        return Err(ProbeError::UnknownDuration);
    }

    Ok(ticks as f64 * time_base.numer as f64 / time_base.denom as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        delay: Duration,
        result: Result<f64, ProbeError>,
    }

    #[async_trait]
    impl DurationProbe for FixedProbe {
        async fn probe(&self, _url: &str) -> Result<f64, ProbeError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    /// Mono 16-bit PCM WAV with `frames` silent samples
    fn wav(sample_rate: u32, frames: u32) -> Bytes {
        let data_len = frames * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(44 + data_len as usize, 0);
        Bytes::from(out)
    }

    #[test]
    fn test_wav_duration() {
        let seconds = duration_from_bytes(wav(8000, 8000), Some("wav")).unwrap();
        assert!((seconds - 1.0).abs() < 1e-9);

        let seconds = duration_from_bytes(wav(8000, 20000), Some("audio/wav")).unwrap();
        assert!((seconds - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err =
            duration_from_bytes(Bytes::from_static(b"definitely not audio"), None).unwrap_err();
        assert!(matches!(err, ProbeError::Decode(_)));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("https://cdn.example.com/a/ep.MP3?sig=1"), Some("mp3".to_string()));
        assert_eq!(extension_of("https://cdn.example.com/a/ep"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_probe_success() {
        let probe = FixedProbe {
            delay: Duration::from_millis(500),
            result: Ok(125.4),
        };
        let outcome =
            bounded_probe(&probe, "u", Duration::from_secs(10), &CancellationToken::new()).await;
        assert_eq!(outcome, Some(ProbeOutcome::measured(125.4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_probe_timeout_is_a_warning() {
        let probe = FixedProbe {
            delay: Duration::from_secs(60),
            result: Ok(10.0),
        };
        let outcome =
            bounded_probe(&probe, "u", Duration::from_secs(10), &CancellationToken::new()).await;
        assert_eq!(outcome, Some(ProbeOutcome::missing()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_probe_error_and_nan_are_warnings() {
        let failing = FixedProbe {
            delay: Duration::ZERO,
            result: Err(ProbeError::UnknownDuration),
        };
        let nan = FixedProbe {
            delay: Duration::ZERO,
            result: Ok(f64::NAN),
        };
        let token = CancellationToken::new();
        assert_eq!(
            bounded_probe(&failing, "u", Duration::from_secs(1), &token).await,
            Some(ProbeOutcome::missing())
        );
        assert_eq!(
            bounded_probe(&nan, "u", Duration::from_secs(1), &token).await,
            Some(ProbeOutcome::missing())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_probe_cancelled() {
        let probe = FixedProbe {
            delay: Duration::from_secs(5),
            result: Ok(1.0),
        };
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(bounded_probe(&probe, "u", Duration::from_secs(10), &token).await, None);
    }
}
