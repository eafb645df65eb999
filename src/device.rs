use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::error::{PlayerError, Result};
use crate::settings::EngineSettings;
use crate::sink::{SinkMonitor, SinkRenderer};

/// The host audio output as the session sees it.
///
/// A device pulls interleaved `f32` buffers from the `SinkRenderer` it is
/// handed in `open`. `suspend` stops it asking for more without tearing the
/// stream down, `close` drops the stream (and the renderer with it).
pub trait AudioDevice: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Frames per buffer request the renderer should be sized for.
    fn block_size(&self) -> u32;
    fn is_open(&self) -> bool;
    fn open(&mut self, renderer: SinkRenderer) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn suspend(&mut self) -> Result<()>;
    fn close(&mut self);
}

// cpal::Stream isn't Send, so it lives on its own thread and we talk to it
// over a channel.
enum HostCommand {
    Open(SinkRenderer, mpsc::Sender<Result<()>>),
    Resume(mpsc::Sender<Result<()>>),
    Suspend(mpsc::Sender<Result<()>>),
    Close(mpsc::Sender<()>),
}

struct HostInfo {
    sample_rate: u32,
    channels: u16,
    block_size: u32,
    name: String,
}

pub struct CpalDevice {
    commands: Option<mpsc::Sender<HostCommand>>,
    thread: Option<JoinHandle<()>>,
    info: HostInfo,
    open: bool,
}

impl CpalDevice {
    pub fn open(settings: &EngineSettings) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let settings = settings.clone();

        let thread = thread::Builder::new()
            .name("chipdeck-audio".to_string())
            .spawn(move || host_thread(settings, ready_tx, cmd_rx))
            .map_err(|e| PlayerError::NotInitialized(format!("audio thread: {}", e)))?;

        let info = ready_rx
            .recv()
            .map_err(|_| PlayerError::NotInitialized("audio thread exited during startup".to_string()))??;

        info!(
            "Audio output '{}': {} Hz, {} channels, {} frame buffers",
            info.name, info.sample_rate, info.channels, info.block_size
        );

        Ok(CpalDevice {
            commands: Some(cmd_tx),
            thread: Some(thread),
            info,
            open: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    fn request<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> HostCommand) -> Result<T> {
        let lost = || PlayerError::NoActiveDevice("audio thread is gone".to_string());
        let commands = self.commands.as_ref().ok_or_else(lost)?;
        let (tx, rx) = mpsc::channel();
        commands.send(make(tx)).map_err(|_| lost())?;
        rx.recv().map_err(|_| lost())
    }
}

impl AudioDevice for CpalDevice {
    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    fn channels(&self) -> u16 {
        self.info.channels
    }

    fn block_size(&self) -> u32 {
        self.info.block_size
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self, renderer: SinkRenderer) -> Result<()> {
        self.request(|reply| HostCommand::Open(renderer, reply))??;
        self.open = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.request(HostCommand::Resume)?
    }

    fn suspend(&mut self) -> Result<()> {
        self.request(HostCommand::Suspend)?
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.request(HostCommand::Close);
            self.open = false;
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        // hanging up ends the host thread's loop, which drops the stream
        self.commands = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn host_thread(
    settings: EngineSettings,
    ready: mpsc::Sender<Result<HostInfo>>,
    commands: mpsc::Receiver<HostCommand>,
) {
    let (device, config, format) = match pick_output(&settings) {
        Ok(picked) => picked,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let info = HostInfo {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
        block_size: settings.block_size,
        name: device.name().unwrap_or_else(|_| "unknown".to_string()),
    };
    if ready.send(Ok(info)).is_err() {
        return;
    }

    let mut stream: Option<cpal::Stream> = None;
    while let Ok(command) = commands.recv() {
        match command {
            HostCommand::Open(renderer, reply) => {
                stream = None;
                let built = build_stream(&device, &config, format, renderer);
                let _ = reply.send(built.map(|s| {
                    stream = Some(s);
                }));
            }
            HostCommand::Resume(reply) => {
                let result = match &stream {
                    Some(s) => s.play().map_err(|e| PlayerError::NoActiveDevice(e.to_string())),
                    None => Err(PlayerError::NoActiveDevice("no open stream".to_string())),
                };
                let _ = reply.send(result);
            }
            HostCommand::Suspend(reply) => {
                let result = match &stream {
                    Some(s) => s.pause().map_err(|e| PlayerError::Audio(e.to_string())),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            HostCommand::Close(reply) => {
                stream = None;
                let _ = reply.send(());
            }
        }
    }
    debug!("Audio thread exiting");
}

fn pick_output(settings: &EngineSettings) -> Result<(cpal::Device, cpal::StreamConfig, cpal::SampleFormat)> {
    let host = cpal::default_host();

    let named = settings.device_name.as_deref().and_then(|wanted| {
        let found = host
            .output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
        if found.is_none() {
            warn!("Output device '{}' not found, using the default", wanted);
        }
        found
    });

    let device = match named {
        Some(device) => device,
        None => host
            .default_output_device()
            .ok_or_else(|| PlayerError::NotInitialized("No output device found".to_string()))?,
    };

    let wanted_rate = cpal::SampleRate(settings.sample_rate);
    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == settings.channels
                    && c.min_sample_rate() <= wanted_rate
                    && wanted_rate <= c.max_sample_rate()
                    && matches!(c.sample_format(), cpal::SampleFormat::F32 | cpal::SampleFormat::I16)
            })
        })
        .map(|c| c.with_sample_rate(wanted_rate));

    let supported = match supported {
        Some(c) => c,
        None => {
            let fallback = device
                .default_output_config()
                .map_err(|e| PlayerError::NotInitialized(e.to_string()))?;
            debug!(
                "No exact match for {} Hz / {} channels, using {:?}",
                settings.sample_rate, settings.channels, fallback
            );
            fallback
        }
    };

    let format = supported.sample_format();
    let mut config = supported.config();
    config.buffer_size = match supported.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&settings.block_size) => {
            cpal::BufferSize::Fixed(settings.block_size)
        }
        _ => {
            debug!("Host won't take {} frame buffers, using its default", settings.block_size);
            cpal::BufferSize::Default
        }
    };
    Ok((device, config, format))
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    renderer: SinkRenderer,
) -> Result<cpal::Stream> {
    let monitor = renderer.monitor();
    let mut renderer = renderer;

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data),
            stream_error(monitor),
            None,
        ),
        cpal::SampleFormat::I16 => {
            // Pre-allocated, the callback renders through it in chunks
            let mut scratch = vec![0.0f32; 1024 * renderer.channels()];
            device.build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(scratch.len()) {
                        let buf = &mut scratch[..chunk.len()];
                        renderer.render(buf);
                        for (dst, &src) in chunk.iter_mut().zip(buf.iter()) {
                            *dst = (src * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                    }
                },
                stream_error(monitor),
                None,
            )
        }
        other => return Err(PlayerError::Audio(format!("Unsupported sample format: {:?}", other))),
    };

    stream.map_err(|e| PlayerError::Audio(format!("Failed to build audio stream: {}", e)))
}

// Runs on the host's thread: flag it and let the session report it.
fn stream_error(monitor: SinkMonitor) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => monitor.mark_device_lost(),
        _ => monitor.record_fault(),
    }
}

/// A device with no host behind it: buffers are pulled by hand through an
/// [`OfflineHandle`]. Used for headless runs and tests.
pub struct OfflineDevice {
    sample_rate: u32,
    channels: u16,
    block_size: u32,
    inner: Arc<Mutex<OfflineInner>>,
}

#[derive(Default)]
struct OfflineInner {
    renderer: Option<SinkRenderer>,
    monitor: Option<SinkMonitor>,
    running: bool,
    opens: usize,
    fail_resume: bool,
}

#[derive(Clone)]
pub struct OfflineHandle {
    channels: u16,
    inner: Arc<Mutex<OfflineInner>>,
}

impl OfflineDevice {
    pub fn new(sample_rate: u32, channels: u16, block_size: u32) -> Self {
        OfflineDevice {
            sample_rate,
            channels: channels.max(1),
            block_size: block_size.max(1),
            inner: Arc::new(Mutex::new(OfflineInner::default())),
        }
    }

    pub fn handle(&self) -> OfflineHandle {
        OfflineHandle { channels: self.channels, inner: Arc::clone(&self.inner) }
    }

    fn lock(&self) -> MutexGuard<'_, OfflineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioDevice for OfflineDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn is_open(&self) -> bool {
        self.lock().renderer.is_some()
    }

    fn open(&mut self, renderer: SinkRenderer) -> Result<()> {
        let mut inner = self.lock();
        inner.monitor = Some(renderer.monitor());
        inner.renderer = Some(renderer);
        inner.running = false;
        inner.opens += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_resume {
            return Err(PlayerError::NoActiveDevice("offline device unplugged".to_string()));
        }
        if inner.renderer.is_none() {
            return Err(PlayerError::NoActiveDevice("no open stream".to_string()));
        }
        inner.running = true;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.lock().running = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = self.lock();
        inner.renderer = None;
        inner.running = false;
    }
}

impl OfflineHandle {
    /// Requests `frames` frames the way a host callback would. A suspended
    /// stream still renders, like a host draining a buffer it already asked
    /// for; with no stream open the result is silence.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.channels as usize];
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(renderer) = inner.renderer.as_mut() {
            renderer.render(&mut out);
        }
        out
    }

    /// Whether the "host" would be asking for buffers right now.
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).renderer.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).opens
    }

    /// Simulates the output disappearing underneath a running stream.
    pub fn unplug(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.fail_resume = true;
        inner.running = false;
        if let Some(monitor) = &inner.monitor {
            monitor.mark_device_lost();
        }
    }

    pub fn replug(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).fail_resume = false;
    }
}
