//! Audio Handler - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Der Handler ist der
//! lokale Audio-Stream einer Session: er wird beim ersten Anruf geöffnet
//! und mit `stop()` wieder freigegeben.

use super::LocalAudio;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Lautstärke ohne Lautsprecher-Modus
const EARPIECE_GAIN: f32 = 0.5;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO HANDLER
// ============================================================================

/// Offene cpal-Streams
#[derive(Default)]
struct Streams {
    input: Option<Stream>,
    output: Option<Stream>,
}

// Stream ist nicht Send; die Streams werden nur hinter dem Mutex
// angefasst und nie über Threads hinweg benutzt
unsafe impl Send for Streams {}

/// Mikrofon und Lautsprecher einer Session
pub struct AudioHandler {
    streams: Mutex<Streams>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    is_muted: Arc<Mutex<bool>>,
    playback_gain: Arc<Mutex<f32>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

impl AudioHandler {
    /// Öffnet Mikrofon und Lautsprecher.
    ///
    /// Schlägt fehl wenn kein Eingabegerät vorhanden ist oder der Zugriff
    /// verweigert wird; ein fehlendes Ausgabegerät wird nur geloggt.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let output_device = host.default_output_device();

        let handler = Self {
            streams: Mutex::new(Streams::default()),
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            is_muted: Arc::new(Mutex::new(false)),
            playback_gain: Arc::new(Mutex::new(EARPIECE_GAIN)),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
        };

        let input = handler.start_capture(&input_device)?;
        let output = match output_device {
            Some(device) => Some(handler.start_playback(&device)?),
            None => {
                tracing::warn!("No audio output device found, playback disabled");
                None
            }
        };

        {
            let mut streams = handler.streams.lock();
            streams.input = Some(input);
            streams.output = output;
        }

        tracing::info!(
            "AudioHandler opened: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(handler)
    }

    /// Startet Audio Capture (Mikrofon)
    fn start_capture(&self, device: &Device) -> Result<Stream, AudioError> {
        let config = Self::select_best_config(
            device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let source_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    *input_level.lock() = rms(data);

                    if *is_muted.lock() {
                        return;
                    }

                    let samples = resample_linear(data, source_rate, SAMPLE_RATE);
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(stream)
    }

    /// Startet Audio Playback (Lautsprecher)
    fn start_playback(&self, device: &Device) -> Result<Stream, AudioError> {
        let config = Self::select_best_config(
            device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let playback_gain = Arc::clone(&self.playback_gain);
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let gain = *playback_gain.lock();
                    let mut buffer = playback_buffer.lock();
                    let mut level_sum = 0.0f32;
                    let frames = data.len() / channels;

                    // Mono auf alle Kanäle verteilen
                    for i in 0..frames {
                        let sample = buffer.try_pop().unwrap_or(0.0) * gain;
                        level_sum += sample.abs();
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }

                    if frames > 0 {
                        *output_level.lock() = (level_sum / frames as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(stream)
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Schreibt Audio-Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);
        let supports_target = |c: &SupportedStreamConfigRange| {
            c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
        };

        if let Some(config) = configs
            .iter()
            .find(|c| supports_target(*c) && c.sample_format() == SampleFormat::F32)
        {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }

        if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
            return Ok(config.clone().with_max_sample_rate().into());
        }

        configs
            .first()
            .map(|c| c.clone().with_max_sample_rate().into())
            .ok_or_else(|| {
                AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
            })
    }
}

impl LocalAudio for AudioHandler {
    fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    fn set_speaker(&self, enabled: bool) {
        *self.playback_gain.lock() = if enabled { 1.0 } else { EARPIECE_GAIN };
        tracing::debug!("Speaker enabled: {}", enabled);
    }

    fn stop(&self) {
        let mut streams = self.streams.lock();
        streams.input = None;
        streams.output = None;
        tracing::info!("Audio streams stopped");
    }
}

// ============================================================================
// DSP HELPERS
// ============================================================================

/// RMS-Pegel, auf 1.0 begrenzt
fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32)
        .sqrt()
        .min(1.0)
}

/// Einfaches lineares Resampling
fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
