use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use ringbuf::{Consumer, HeapRb, Producer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Sample rates probed in preference order; the first one the device
/// accepts is used for the whole capture session.
pub const SAMPLE_RATE_CANDIDATES: [u32; 4] = [44100, 48000, 22050, 16000];

#[derive(Debug, Error)]
pub enum AudioError {
    /// The device could not be opened at any candidate sample rate, or is
    /// missing entirely.
    #[error("no usable audio input device: {0}")]
    Unavailable(String),

    /// The device stopped delivering samples mid-session.
    #[error("audio device read failed: {0}")]
    ReadFailed(String),
}

/// A mono audio input delivering samples normalized to [-1, 1].
///
/// `read` returns however many samples are currently available, possibly
/// zero; the caller owns the block-until-full retry discipline. Dropping the
/// source releases the device.
pub trait AudioSource {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize, AudioError>;
    fn sample_rate(&self) -> u32;
}

/// Factory seam for acquiring an input device.
///
/// The capture thread opens the device itself (a `cpal::Stream` must stay on
/// the thread that created it), so the opener crosses the thread boundary
/// instead of the source.
pub trait SourceOpener: Send + Sync {
    fn open(&self, candidates: &[u32]) -> Result<Box<dyn AudioSource>, AudioError>;
}

/// Opens the system default input device through cpal.
pub struct CpalOpener;

impl SourceOpener for CpalOpener {
    fn open(&self, candidates: &[u32]) -> Result<Box<dyn AudioSource>, AudioError> {
        CpalSource::open(candidates).map(|source| Box::new(source) as Box<dyn AudioSource>)
    }
}

/// Live input stream bridged into a ring buffer.
///
/// The cpal callback pushes downmixed mono samples into the producer half;
/// `read` drains the consumer half without blocking.
pub struct CpalSource {
    _stream: cpal::Stream,
    consumer: Consumer<f32, Arc<HeapRb<f32>>>,
    sample_rate: u32,
    failed: Arc<AtomicBool>,
}

impl CpalSource {
    /// Opens the default input device at the first accepted candidate rate.
    pub fn open(candidates: &[u32]) -> Result<Self, AudioError> {
        let host = cpal::default_host();

        //
        // Log all available input devices for debugging.
        //
        log::info!("--- AVAILABLE INPUT DEVICES ---");
        if let Ok(devices) = host.input_devices() {
            for (i, dev) in devices.enumerate() {
                let name = dev.name().unwrap_or("Unknown".into());
                log::info!("  [{}]: {}", i, name);
            }
        }
        log::info!("-------------------------------");

        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::Unavailable("no default input device".into()))?;

        log::info!(
            "Selected audio device: {}",
            device.name().unwrap_or("Unknown".into())
        );

        //
        // Probe the candidate rates in preference order. An exhausted list
        // is a hard failure; guessing at an unverified rate is not useful.
        //
        let mut last_reason = String::from("no candidate rates supplied");
        for &rate in candidates {
            match Self::open_at(&device, rate) {
                Ok(source) => return Ok(source),
                Err(reason) => {
                    log::debug!("{} Hz rejected: {}", rate, reason);
                    last_reason = reason;
                }
            }
        }

        Err(AudioError::Unavailable(format!(
            "no candidate sample rate accepted (last: {})",
            last_reason
        )))
    }

    fn open_at(device: &cpal::Device, rate: u32) -> Result<Self, String> {
        let ranges = device
            .supported_input_configs()
            .map_err(|e| e.to_string())?;

        let range = ranges
            .into_iter()
            .find(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            .ok_or_else(|| format!("{} Hz outside the device's supported ranges", rate))?;

        let supported = range.with_sample_rate(cpal::SampleRate(rate));
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;

        log::info!(
            "Audio config: {:?} @ {}Hz, Channels: {}",
            sample_format,
            rate,
            channels
        );

        //
        // Quarter-second ring buffer between the callback and the reader.
        //
        let capacity = (rate as usize / 4).max(8192);
        let (mut producer, consumer) = HeapRb::<f32>::new(capacity).split();

        let failed = Arc::new(AtomicBool::new(false));
        let fail_flag = failed.clone();
        let err_fn = move |err: cpal::StreamError| {
            log::error!("audio stream error: {}", err);
            fail_flag.store(true, Ordering::Relaxed);
        };

        let mut push_mono = move |data: &[f32]| downmix_into(data, channels, &mut producer);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &_| {
                    push_mono(data);
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &_| {
                    //
                    // Convert i16 samples to f32 before downmixing.
                    //
                    let f32_data: Vec<f32> = data.iter().map(|&s| (s as f32) / 32768.0).collect();
                    push_mono(&f32_data);
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &_| {
                    //
                    // Convert u16 samples to signed f32 before downmixing.
                    //
                    let f32_data: Vec<f32> = data
                        .iter()
                        .map(|&s| (s as f32 - 32768.0) / 32768.0)
                        .collect();
                    push_mono(&f32_data);
                },
                err_fn,
                None,
            ),
            other => return Err(format!("unsupported sample format: {:?}", other)),
        }
        .map_err(|e| e.to_string())?;

        stream.play().map_err(|e| e.to_string())?;

        Ok(Self {
            _stream: stream,
            consumer,
            sample_rate: rate,
            failed,
        })
    }
}

impl AudioSource for CpalSource {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize, AudioError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(AudioError::ReadFailed(
                "input stream reported an error".into(),
            ));
        }
        Ok(self.consumer.pop_slice(buf))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Pushes `data` into the ring buffer as mono samples (downmix if needed).
fn downmix_into(data: &[f32], channels: usize, producer: &mut Producer<f32, Arc<HeapRb<f32>>>) {
    if channels == 1 {
        let _ = producer.push_slice(data);
    } else if channels == 2 {
        //
        // Downmix stereo to mono using averaged samples.
        //
        for chunk in data.chunks_exact(2) {
            let mono = (chunk[0] + chunk[1]) * 0.5;
            let _ = producer.push(mono);
        }
    } else {
        //
        // Downmix multi-channel audio by selecting the first channel.
        //
        for chunk in data.chunks_exact(channels) {
            if let Some(&sample) = chunk.first() {
                let _ = producer.push(sample);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(consumer: &mut Consumer<f32, Arc<HeapRb<f32>>>) -> Vec<f32> {
        let mut out = vec![0.0f32; consumer.len()];
        consumer.pop_slice(&mut out);
        out
    }

    #[test]
    fn mono_passes_through() {
        let (mut producer, mut consumer) = HeapRb::<f32>::new(64).split();
        downmix_into(&[0.1, -0.2, 0.3], 1, &mut producer);
        assert_eq!(drain(&mut consumer), vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn stereo_averages_pairs() {
        let (mut producer, mut consumer) = HeapRb::<f32>::new(64).split();
        downmix_into(&[1.0, 0.0, -0.5, 0.5], 2, &mut producer);
        assert_eq!(drain(&mut consumer), vec![0.5, 0.0]);
    }

    #[test]
    fn multichannel_takes_first_channel() {
        let (mut producer, mut consumer) = HeapRb::<f32>::new(64).split();
        downmix_into(&[0.1, 0.9, 0.9, 0.2, 0.8, 0.8], 3, &mut producer);
        assert_eq!(drain(&mut consumer), vec![0.1, 0.2]);
    }
}
