//! Mikrofon-Capture über cpal
//!
//! Hält das Standard-Mikrofon für die Dauer des Anrufs geöffnet. Mute
//! wirkt über das Enable-Flag des Tracks, nicht über den Stream.

use super::devices::{CaptureProfile, MediaError};
use super::track::CaptureHandle;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

pub struct MicrophoneCapture {
    stream: Option<Stream>,
}

// cpal::Stream ist nicht Send. Der Stream wird nur erzeugt und gedroppt,
// nie aus einem anderen Thread benutzt.
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Öffnet das Standard-Mikrofon und startet die Aufnahme
    pub fn open(profile: &CaptureProfile) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            MediaError::DeviceUnavailable("no audio input device found".to_string())
        })?;

        let config = find_input_config(&device, profile.sample_rate)?;
        tracing::info!(
            "Starting microphone capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let stream = device
            .build_input_stream(
                &config,
                |_data: &[f32], _: &cpal::InputCallbackInfo| {},
                |err| {
                    tracing::error!("Microphone capture error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
        })
    }
}

impl CaptureHandle for MicrophoneCapture {
    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Microphone capture stopped");
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn map_build_error(err: BuildStreamError) -> MediaError {
    match err {
        BuildStreamError::BackendSpecific { err } if err.description.contains("ermission") => {
            MediaError::PermissionDenied(err.description)
        }
        other => MediaError::DeviceUnavailable(other.to_string()),
    }
}

fn find_input_config(device: &Device, sample_rate: u32) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    select_config(configs.collect(), sample_rate)
}

/// Bevorzugt F32 mit der gewünschten Rate
fn select_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, MediaError> {
    let target = cpal::SampleRate(sample_rate);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target && c.max_sample_rate() >= target;

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32 && supports_target(c))
    {
        return Ok(config.clone().with_sample_rate(target).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(MediaError::DeviceUnavailable(
        "no f32 microphone configuration available".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(format: SampleFormat, min: u32, max: u32) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            1,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_select_config_prefers_target_rate() {
        let config = select_config(
            vec![
                range(SampleFormat::I16, 8000, 96000),
                range(SampleFormat::F32, 8000, 96000),
            ],
            48000,
        )
        .unwrap();
        assert_eq!(config.sample_rate, SampleRate(48000));
    }

    #[test]
    fn test_select_config_falls_back_to_max_rate() {
        let config = select_config(vec![range(SampleFormat::F32, 8000, 44100)], 48000).unwrap();
        assert_eq!(config.sample_rate, SampleRate(44100));
    }

    #[test]
    fn test_select_config_requires_f32() {
        let err = select_config(vec![range(SampleFormat::I16, 8000, 48000)], 48000).unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnavailable(_)));
    }
}
