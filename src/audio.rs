use anyhow::Result;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::config::AudioConfig;

/// Live PipeWire capture that accumulates samples until drained.
pub struct CaptureStream {
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    buffer: Arc<Mutex<Vec<f32>>>,
}

impl CaptureStream {
    pub async fn open(config: &AudioConfig, name: &'static str) -> Result<Self> {
        info!("Opening microphone stream '{}'", name);

        let sample_rate = config.sample_rate;
        let channels = config.channels as u32;

        let running = Arc::new(AtomicBool::new(true));
        let capturing = Arc::new(AtomicBool::new(true));
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let thread_running = running.clone();
        let sink = CaptureBuffer {
            samples: buffer.clone(),
            capturing: capturing.clone(),
        };
        let thread = std::thread::spawn(move || {
            if let Err(e) = run_pipewire_capture(thread_running, sink, name, sample_rate, channels)
            {
                error!("Audio capture error: {}", e);
            }
        });

        // Brief delay for PipeWire to connect
        tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;

        if thread.is_finished() {
            return Err(anyhow::anyhow!("Microphone stream '{}' failed to start", name));
        }

        Ok(Self {
            sample_rate,
            channels: config.channels as u16,
            running,
            capturing,
            thread: Some(thread),
            buffer,
        })
    }

    /// Takes everything captured since the previous drain.
    pub fn drain(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Pauses or resumes buffering. The device stays open while paused.
    pub fn set_capturing(&self, on: bool) {
        self.capturing.store(on, Ordering::SeqCst);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stops capture and waits until PipeWire has let go of the device.
    pub async fn close(mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await?
                .map_err(|_| anyhow::anyhow!("Capture thread panicked"))?;
        }

        debug!("Microphone stream closed");
        Ok(())
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Shared sample buffer filled from the PipeWire thread.
struct CaptureBuffer {
    samples: Arc<Mutex<Vec<f32>>>,
    capturing: Arc<AtomicBool>,
}

impl CaptureBuffer {
    fn append(&self, samples: &[f32]) {
        if !self.capturing.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut buf) = self.samples.try_lock() {
            buf.extend_from_slice(samples);
        }
    }
}

/// Root-mean-square level of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Down-mixes interleaved samples to mono.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Linear resampling, good enough for speech recognition input.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = src_idx - idx as f64;

        let sample = if idx + 1 < input.len() {
            input[idx] as f64 * (1.0 - frac) + input[idx + 1] as f64 * frac
        } else if idx < input.len() {
            input[idx] as f64
        } else {
            0.0
        };

        output.push(sample as f32);
    }

    output
}

/// Encodes interleaved f32 samples as an in-memory WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

fn run_pipewire_capture(
    running: Arc<AtomicBool>,
    buffer: CaptureBuffer,
    name: &'static str,
    sample_rate: u32,
    channels: u32,
) -> Result<()> {
    pipewire::init();

    let mainloop = pipewire::main_loop::MainLoop::new(None)
        .map_err(|e| anyhow::anyhow!("Failed to create PipeWire main loop: {:?}", e))?;
    let context = pipewire::context::Context::new(&mainloop)
        .map_err(|e| anyhow::anyhow!("Failed to create PipeWire context: {:?}", e))?;
    let core = context
        .connect(None)
        .map_err(|e| anyhow::anyhow!("Failed to connect to PipeWire: {:?}", e))?;

    let props = pipewire::properties::properties! {
        *pipewire::keys::MEDIA_TYPE => "Audio",
        *pipewire::keys::MEDIA_CATEGORY => "Capture",
        *pipewire::keys::MEDIA_ROLE => "Communication",
    };

    let stream = pipewire::stream::Stream::new(&core, name, props)
        .map_err(|e| anyhow::anyhow!("Failed to create PipeWire stream: {:?}", e))?;

    let audio_params = build_audio_params(sample_rate, channels)?;
    let pod = pipewire::spa::pod::Pod::from_bytes(&audio_params)
        .ok_or_else(|| anyhow::anyhow!("Failed to create SPA pod from audio params"))?;

    // Get raw pointer for quitting from callback (safe: same thread)
    let raw_mainloop = mainloop.as_raw_ptr();
    let running_check = running.clone();

    let _listener = stream
        .add_local_listener_with_user_data(buffer)
        .process(move |stream, buffer| {
            if !running_check.load(Ordering::Relaxed) {
                unsafe {
                    pipewire::sys::pw_main_loop_quit(raw_mainloop);
                }
                return;
            }

            if let Some(mut pw_buffer) = stream.dequeue_buffer() {
                let datas = pw_buffer.datas_mut();
                if let Some(d) = datas.first_mut() {
                    let size = d.chunk().size() as usize;
                    if size == 0 {
                        return;
                    }
                    if let Some(raw) = d.data() {
                        let audio_bytes = &raw[..size.min(raw.len())];
                        if audio_bytes.as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
                            return; // Skip unaligned buffer
                        }
                        let samples: &[f32] = unsafe {
                            std::slice::from_raw_parts(
                                audio_bytes.as_ptr() as *const f32,
                                audio_bytes.len() / std::mem::size_of::<f32>(),
                            )
                        };

                        buffer.append(samples);
                    }
                }
            }
        })
        .register()
        .map_err(|e| anyhow::anyhow!("Failed to register stream listener: {:?}", e))?;

    stream
        .connect(
            pipewire::spa::utils::Direction::Input,
            None,
            pipewire::stream::StreamFlags::AUTOCONNECT
                | pipewire::stream::StreamFlags::MAP_BUFFERS
                | pipewire::stream::StreamFlags::RT_PROCESS,
            &mut [pod],
        )
        .map_err(|e| anyhow::anyhow!("Failed to connect PipeWire stream: {:?}", e))?;

    debug!("PipeWire capture '{}' started", name);
    mainloop.run();
    debug!("PipeWire capture '{}' stopped", name);

    Ok(())
}

fn build_audio_params(sample_rate: u32, channels: u32) -> Result<Vec<u8>> {
    use pipewire::spa::pod::serialize::PodSerializer;
    use pipewire::spa::pod::{Object, Property, PropertyFlags, Value};
    use pipewire::spa::sys;
    use pipewire::spa::utils::Id;

    let bytes = PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &Value::Object(Object {
            type_: pipewire::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
            id: pipewire::spa::param::ParamType::EnumFormat.as_raw(),
            properties: vec![
                Property {
                    key: sys::SPA_FORMAT_mediaType,
                    flags: PropertyFlags::empty(),
                    value: Value::Id(Id(sys::SPA_MEDIA_TYPE_audio)),
                },
                Property {
                    key: sys::SPA_FORMAT_mediaSubtype,
                    flags: PropertyFlags::empty(),
                    value: Value::Id(Id(sys::SPA_MEDIA_SUBTYPE_raw)),
                },
                Property {
                    key: sys::SPA_FORMAT_AUDIO_format,
                    flags: PropertyFlags::empty(),
                    value: Value::Id(Id(sys::SPA_AUDIO_FORMAT_F32_LE)),
                },
                Property {
                    key: sys::SPA_FORMAT_AUDIO_rate,
                    flags: PropertyFlags::empty(),
                    value: Value::Int(sample_rate as i32),
                },
                Property {
                    key: sys::SPA_FORMAT_AUDIO_channels,
                    flags: PropertyFlags::empty(),
                    value: Value::Int(channels as i32),
                },
            ],
        }),
    )
    .map_err(|e| anyhow::anyhow!("Failed to serialize audio params: {:?}", e))?
    .0
    .into_inner();

    Ok(bytes)
}
