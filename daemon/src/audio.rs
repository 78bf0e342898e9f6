/// Audible alert output.
///
/// [`ToneSink`] plays a short two-tone alert on the default output device via
/// cpal.  The output device is modelled as a resource that moves through
/// Uninitialized → Unlocking → Ready, or to Failed when no usable device
/// exists.  An unlock gesture retries a Failed device.  When the device is
/// not Ready (or a stream cannot be built) the terminal bell is used instead.
/// Every failure is best-effort: nothing here may take down the host.
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use thiserror::Error;

pub const DEFAULT_VOLUME: f32 = 0.9;

/// Sample rate used for the pre-rendered alert before a device is known.
const RENDER_SAMPLE_RATE: u32 = 48_000;
/// Length of the silent unlock probe.
const UNLOCK_PROBE: Duration = Duration::from_millis(10);
/// Extra time the stream is kept alive after the last sample.
const DRAIN_MARGIN: Duration = Duration::from_millis(60);

/// (frequency Hz, duration ms) of each tone in the alert.
const ALERT_TONES: &[(f32, u64)] = &[(880.0, 120), (587.0, 180)];
const FADE_MS: u64 = 6;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no default output device")]
    NoDevice,

    #[error("output config unavailable: {0}")]
    Config(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to build output stream: {0}")]
    Build(String),

    #[error("failed to start output stream: {0}")]
    Play(String),

    #[error("failed to spawn playback thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Output sink used by the notifier.
pub trait AudioSink: Send + Sync {
    /// Starts a short audible alert.  Must not block the caller for the
    /// duration of the sound.
    fn play_alert(&self) -> Result<(), AudioError>;

    /// Initialises the output path silently so that later alerts start
    /// without delay.
    fn unlock(&self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Observable state of the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStatus {
    Uninitialized,
    Unlocking,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
struct OutputProfile {
    config: StreamConfig,
    format: SampleFormat,
    /// Mono alert samples rendered at `config.sample_rate`.
    alert: Arc<Vec<f32>>,
}

#[derive(Debug)]
enum DeviceState {
    Uninitialized,
    Unlocking,
    Ready(OutputProfile),
    Failed(String),
}

/// Opens the output device and plays a silent buffer on it.
type Probe = dyn Fn(f32, &Arc<Vec<f32>>) -> Result<OutputProfile, AudioError> + Send + Sync;

struct Inner {
    state: Mutex<DeviceState>,
    probe: Box<Probe>,
    volume: f32,
    /// Rendered at construction; re-rendered if the device rate differs.
    prerendered: Arc<Vec<f32>>,
}

#[derive(Clone)]
pub struct ToneSink {
    inner: Arc<Inner>,
}

impl ToneSink {
    pub fn new(volume: f32) -> Self {
        Self::with_probe(volume, Box::new(probe_output))
    }

    fn with_probe(volume: f32, probe: Box<Probe>) -> Self {
        let volume = volume.clamp(0.0, 1.0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DeviceState::Uninitialized),
                probe,
                volume,
                prerendered: Arc::new(render_alert(RENDER_SAMPLE_RATE, volume)),
            }),
        }
    }

    pub fn status(&self) -> AudioStatus {
        match &*self.inner.lock_state() {
            DeviceState::Uninitialized => AudioStatus::Uninitialized,
            DeviceState::Unlocking => AudioStatus::Unlocking,
            DeviceState::Ready(_) => AudioStatus::Ready,
            DeviceState::Failed(_) => AudioStatus::Failed,
        }
    }
}

impl Default for ToneSink {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME)
    }
}

impl AudioSink for ToneSink {
    fn play_alert(&self) -> Result<(), AudioError> {
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("fail-ding-alert".into())
            .spawn(move || {
                let played = match inner.acquire() {
                    Some(profile) => play_samples(&profile, &profile.alert),
                    None => Err(AudioError::NoDevice),
                };
                if let Err(e) = played {
                    tracing::debug!(error = %e, "tone playback unavailable, using bell");
                    ring_bell();
                }
            })
            .map(|_| ())
            .map_err(AudioError::Spawn)
    }

    /// Initialises the device from Uninitialized, or retries it from Failed
    /// so a device attached later is picked up.  A no-op otherwise.
    fn unlock(&self) -> Result<(), AudioError> {
        {
            let mut state = self.inner.lock_state();
            if !matches!(*state, DeviceState::Uninitialized | DeviceState::Failed(_)) {
                return Ok(());
            }
            *state = DeviceState::Unlocking;
        }
        self.inner.initialise().map(|_| ())
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a ready output profile, initialising the device on first use.
    /// Unlocking (in progress elsewhere) and Failed yield `None`.
    fn acquire(&self) -> Option<OutputProfile> {
        {
            let mut state = self.lock_state();
            if let DeviceState::Ready(profile) = &*state {
                return Some(profile.clone());
            }
            if !matches!(*state, DeviceState::Uninitialized) {
                return None;
            }
            *state = DeviceState::Unlocking;
        }
        self.initialise().ok()
    }

    /// Runs the silent probe and records Ready or Failed.  The caller must
    /// have moved the state to Unlocking.
    fn initialise(&self) -> Result<OutputProfile, AudioError> {
        let result = (self.probe)(self.volume, &self.prerendered);
        let mut state = self.lock_state();
        match result {
            Ok(profile) => {
                tracing::debug!(
                    sample_rate = profile.config.sample_rate.0,
                    channels = profile.config.channels,
                    "audio output ready"
                );
                *state = DeviceState::Ready(profile.clone());
                Ok(profile)
            }
            Err(e) => {
                tracing::debug!(error = %e, "audio output unavailable");
                *state = DeviceState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

/// Opens the default output device and plays a short silent buffer.
fn probe_output(volume: f32, prerendered: &Arc<Vec<f32>>) -> Result<OutputProfile, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Config(e.to_string()))?;
    let format = supported.sample_format();
    let config = supported.config();

    let alert = if config.sample_rate.0 == RENDER_SAMPLE_RATE {
        Arc::clone(prerendered)
    } else {
        Arc::new(render_alert(config.sample_rate.0, volume))
    };
    let profile = OutputProfile { config, format, alert };

    let silence_len = (profile.config.sample_rate.0 as u128 * UNLOCK_PROBE.as_millis() / 1000) as usize;
    play_samples(&profile, &Arc::new(vec![0.0; silence_len]))?;
    Ok(profile)
}

/// Plays mono `samples` on the default device, blocking until they are done.
fn play_samples(profile: &OutputProfile, samples: &Arc<Vec<f32>>) -> Result<(), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

    let stream = match profile.format {
        SampleFormat::F32 => build_stream::<f32>(&device, &profile.config, samples),
        SampleFormat::I16 => build_stream::<i16>(&device, &profile.config, samples),
        SampleFormat::U16 => build_stream::<u16>(&device, &profile.config, samples),
        other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }?;
    stream.play().map_err(|e| AudioError::Play(e.to_string()))?;

    let rate = profile.config.sample_rate.0.max(1) as u64;
    let millis = samples.len() as u64 * 1000 / rate;
    std::thread::sleep(Duration::from_millis(millis) + DRAIN_MARGIN);
    Ok(())
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: &Arc<Vec<f32>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let samples = Arc::clone(samples);
    let mut cursor = 0usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = samples.get(cursor).copied().unwrap_or(0.0);
                    cursor = cursor.saturating_add(1);
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            |e| tracing::debug!(error = %e, "audio stream error"),
            None,
        )
        .map_err(|e| AudioError::Build(e.to_string()))
}

/// Renders the alert as mono f32 samples in [-volume, volume] with a short
/// fade at both ends of every tone to avoid clicks.
pub fn render_alert(sample_rate: u32, volume: f32) -> Vec<f32> {
    let rate = sample_rate.max(1) as f32;
    let fade = (sample_rate as u64 * FADE_MS / 1000) as usize;
    let mut out = Vec::new();

    for &(freq, ms) in ALERT_TONES {
        let len = (sample_rate as u64 * ms / 1000) as usize;
        for i in 0..len {
            let envelope = if fade == 0 {
                1.0
            } else {
                let from_start = i.min(fade) as f32 / fade as f32;
                let from_end = (len - 1 - i).min(fade) as f32 / fade as f32;
                from_start.min(from_end)
            };
            let phase = 2.0 * std::f32::consts::PI * freq * i as f32 / rate;
            out.push(phase.sin() * envelope * volume);
        }
    }
    out
}

/// Simplest playback path: the terminal bell.
pub fn ring_bell() {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(b"\x07");
    let _ = stderr.flush();
}
