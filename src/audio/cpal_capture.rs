//! cpal-based microphone engine
//!
//! Uses the cpal crate for cross-platform audio input.
//! Works with PipeWire, PulseAudio, and ALSA backends.
//!
//! Note: cpal::Stream is not Send, so the stream lives on a dedicated
//! thread and is controlled through channels.

use super::AudioEngine;
use crate::config::AudioConfig;
use crate::error::CaptureError;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long to wait for the capture thread to start or stop
const ENGINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters for building an audio input stream
struct TapParams {
    tx: mpsc::Sender<Vec<f32>>,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
}

/// cpal microphone engine
pub struct CpalCapture {
    config: AudioConfig,
    /// Input the route policy prefers; falls back to `config.device`
    preferred_input: Option<String>,
    /// Dropping or signalling this stops the capture thread
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            preferred_input: None,
            stop_tx: None,
            thread_handle: None,
        }
    }

    pub fn with_preferred_input(mut self, name: &str) -> Self {
        self.preferred_input = Some(name.to_string());
        self
    }

    fn select_device(&self, host: &cpal::Host) -> Result<cpal::Device, CaptureError> {
        use cpal::traits::HostTrait;

        if let Some(ref preferred) = self.preferred_input {
            match find_input_device(host, preferred) {
                Ok(device) => return Ok(device),
                Err(e) => {
                    tracing::warn!("Preferred input unavailable, using configured device: {}", e)
                }
            }
        }

        if self.config.device == "default" {
            host.default_input_device()
                .ok_or_else(|| CaptureError::DeviceNotFound("default".to_string()))
        } else {
            find_input_device(host, &self.config.device)
        }
    }
}

/// Index of the device best matching `search`.
///
/// Matching strategy (in order):
/// 1. Exact match (case-sensitive)
/// 2. Exact match (case-insensitive)
/// 3. Substring match (case-insensitive)
fn match_device_name(names: &[String], search: &str) -> Option<usize> {
    let search_lower = search.to_lowercase();
    names
        .iter()
        .position(|name| name == search)
        .or_else(|| {
            names
                .iter()
                .position(|name| name.to_lowercase() == search_lower)
        })
        .or_else(|| {
            names
                .iter()
                .position(|name| name.to_lowercase().contains(&search_lower))
        })
}

/// Find an input device by name, listing the alternatives on failure
fn find_input_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| CaptureError::Connection(e.to_string()))?
        .filter_map(|device| device.name().ok().map(|name| (name, device)))
        .collect();

    let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();

    if let Some(index) = match_device_name(&names, device_name) {
        tracing::debug!(
            "Found audio device: {} (searched for: {})",
            names[index],
            device_name
        );
        if let Some((_, device)) = devices.into_iter().nth(index) {
            return Ok(device);
        }
    }

    let available = if names.is_empty() {
        "No audio input devices found.".to_string()
    } else {
        format!(
            "Available devices:\n{}",
            names
                .iter()
                .map(|n| format!("  - {}", n))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };

    Err(CaptureError::DeviceNotFoundWithList {
        requested: device_name.to_string(),
        available,
    })
}

#[async_trait::async_trait]
impl AudioEngine for CpalCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, CaptureError> {
        use cpal::traits::{DeviceTrait, StreamTrait};

        if self.stop_tx.is_some() {
            return Err(CaptureError::StreamError("engine already running".to_string()));
        }

        let host = cpal::default_host();
        let device = self.select_device(&host)?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Using audio device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| CaptureError::Connection(e.to_string()))?;

        let source_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let target_rate = self.config.sample_rate;
        let buffer_frames = self.config.buffer_frames;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}, {} frame buffer",
            source_rate,
            source_channels,
            sample_format,
            buffer_frames
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();

        let thread_handle = thread::spawn(move || {
            let build = |buffer_size| {
                let stream_config = cpal::StreamConfig {
                    channels: supported_config.channels(),
                    sample_rate: supported_config.sample_rate(),
                    buffer_size,
                };
                let params = TapParams {
                    tx: chunk_tx.clone(),
                    source_rate,
                    target_rate,
                    source_channels,
                };
                let err_fn =
                    |err: cpal::StreamError| tracing::error!("Audio stream error: {}", err);
                match sample_format {
                    cpal::SampleFormat::F32 => {
                        install_tap::<f32>(&device, &stream_config, params, err_fn)
                    }
                    cpal::SampleFormat::I16 => {
                        install_tap::<i16>(&device, &stream_config, params, err_fn)
                    }
                    cpal::SampleFormat::U16 => {
                        install_tap::<u16>(&device, &stream_config, params, err_fn)
                    }
                    format => Err(CaptureError::StreamError(format!(
                        "unsupported sample format: {:?}",
                        format
                    ))),
                }
            };

            // Not every backend honours a fixed buffer size
            let stream = match build(cpal::BufferSize::Fixed(buffer_frames)) {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    tracing::debug!(
                        "Fixed {} frame buffer refused ({}), using default",
                        buffer_frames,
                        e
                    );
                    build(cpal::BufferSize::Default)
                }
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            tracing::debug!("Audio capture thread started");

            // Runs until stop is signalled or the engine is dropped
            let _ = stop_rx.recv();
            drop(stream);

            tracing::debug!("Audio capture thread stopped");
        });

        match tokio::time::timeout(ENGINE_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Ok(Err(_)) => {
                let _ = thread_handle.join();
                return Err(CaptureError::StreamError(
                    "capture thread exited during startup".to_string(),
                ));
            }
            Err(_) => {
                drop(stop_tx);
                return Err(CaptureError::Timeout(ENGINE_TIMEOUT.as_secs() as u32));
            }
        }

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(thread_handle);

        Ok(chunk_rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(stop_tx) = self.stop_tx.take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());

        if let Some(handle) = self.thread_handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(ENGINE_TIMEOUT, joined).await {
                Ok(_) => tracing::debug!("Microphone released"),
                Err(_) => return Err(CaptureError::Timeout(ENGINE_TIMEOUT.as_secs() as u32)),
            }
        }

        Ok(())
    }
}

/// Build an input stream for a specific sample type. The callback is the tap:
/// it mixes to mono, resamples, and forwards each buffer.
fn install_tap<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: TapParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let TapParams {
        tx,
        source_rate,
        target_rate,
        source_channels,
    } = params;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = mix_to_mono(data, source_channels);
                let chunk = resample(&mono, source_rate, target_rate);
                // Receiver may be gone or lagging; dropping a buffer is fine
                let _ = tx.try_send(chunk);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamError(e.to_string()))
}

/// Average interleaved frames down to one channel
fn mix_to_mono<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                .sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;

    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx.floor() as usize;
            let frac = (src_idx - idx as f64) as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
                (Some(a), None) => *a,
                _ => 0.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_device_exact_first() {
        let devices = names(&["USB Mic", "usb mic", "Internal"]);
        assert_eq!(match_device_name(&devices, "usb mic"), Some(1));
        assert_eq!(match_device_name(&devices, "USB Mic"), Some(0));
    }

    #[test]
    fn test_match_device_case_insensitive_and_substring() {
        let devices = names(&[
            "alsa_input.pci-0000_00_1f.3.analog-stereo",
            "bluez_input.AA_BB_CC_DD_EE_FF.0",
        ]);
        assert_eq!(
            match_device_name(&devices, "BLUEZ_INPUT.AA_BB_CC_DD_EE_FF.0"),
            Some(1)
        );
        assert_eq!(match_device_name(&devices, "analog-stereo"), Some(0));
        assert_eq!(match_device_name(&devices, "webcam"), None);
    }

    #[test]
    fn test_mix_to_mono() {
        let stereo: Vec<f32> = vec![1.0, 0.0, 0.5, 0.5];
        assert_eq!(mix_to_mono(&stereo, 2), vec![0.5, 0.5]);
        assert_eq!(mix_to_mono(&stereo, 1), stereo);
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let result = resample(&samples, 48000, 16000);
        assert_eq!(result.len(), 16);
        assert!((result[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_resample_upsample() {
        let result = resample(&[1.0, 2.0], 8000, 16000);
        assert_eq!(result, vec![1.0, 1.5, 2.0, 2.0]);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut engine = CpalCapture::new(&AudioConfig::default());
        assert!(engine.stop().await.is_ok());
        assert!(engine.stop().await.is_ok());
    }
}
