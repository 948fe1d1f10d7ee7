//! The polling (push) feeder.
//!
//! Used when the endpoint cannot signal buffer completion, or when poll
//! mode is forced. The caller's `push` writes whatever fits into the
//! device buffer directly; after end-of-stream a *silence feed* thread
//! tops the buffer up every `bufferDuration/4` so the device never
//! underruns while consumers wait for playback to end.
//!
//! Realtime sources get a dedicated time-critical *realtime feed* thread
//! instead: `push` only queues (at most 250 ms), the thread drains the
//! queue in a 1 ms loop and injects silence whenever the device gets
//! within `streamLatency + 2 ms` of running dry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use salida_core::{time, Chunk, RefTime, TICKS_PER_MS, TICKS_PER_SEC};

use crate::backend::{DeviceBackend, DeviceDescriptor};
use crate::endpoint::{EndpointClient, EndpointClock};
use crate::sync::Event;
use crate::{Error, Result};

enum Pace {
    /// Run another pass immediately.
    Immediate,
    /// Sleep briefly (interruptible by the wake event).
    Millis(u64),
    /// Idle until woken; set after a sticky error.
    Park,
}

#[derive(Default)]
struct RtQueue {
    frames: usize,
    chunks: VecDeque<Chunk>,
}

struct PushShared {
    descriptor: DeviceDescriptor,
    io: Mutex<Box<dyn EndpointClient>>,
    clock: Arc<dyn EndpointClock>,
    wake: Event,
    woken: Event,
    exit: AtomicBool,
    error: AtomicBool,
    /// End-of-stream position in ticks; 0 while streaming.
    eos: AtomicI64,
    pushed_frames: AtomicU64,
    silence_frames: AtomicU64,
    queue: Mutex<RtQueue>,
}

impl PushShared {
    fn rate(&self) -> u32 {
        self.descriptor.wave_format.sample_rate
    }

    fn position(&self) -> Result<RefTime> {
        let frequency = self.clock.frequency()?;
        let (position, _) = self.clock.position()?;
        Ok(time::mul_div(
            position as i64,
            TICKS_PER_SEC,
            frequency as i64,
        ))
    }

    fn end(&self) -> RefTime {
        time::frames_to_ticks(self.pushed_frames.load(Ordering::Acquire), self.rate())
    }

    fn silence(&self) -> RefTime {
        time::frames_to_ticks(self.silence_frames.load(Ordering::Acquire), self.rate())
    }

    fn push_to_device(
        &self,
        client: &mut dyn EndpointClient,
        chunk: &mut Chunk,
        filled: Option<&Event>,
    ) -> Result<()> {
        let buffer_frames = client.buffer_size()?;
        let padding = client.current_padding()?;
        let do_frames = (buffer_frames - padding).min(chunk.frame_count() as u32);
        if do_frames == 0 {
            return Ok(());
        }

        let frame_size = chunk.frame_size();
        debug_assert_eq!(frame_size, self.descriptor.wave_format.frame_size());
        {
            let source = &chunk.bytes()[..do_frames as usize * frame_size];
            let target = client.render_buffer(do_frames)?;
            target.copy_from_slice(source);
        }
        client.release_buffer(do_frames, false)?;

        if let Some(filled) = filled {
            if padding + do_frames == buffer_frames {
                filled.set();
            }
        }

        chunk.shrink_head(chunk.frame_count() - do_frames as usize);
        self.pushed_frames
            .fetch_add(u64::from(do_frames), Ordering::AcqRel);
        Ok(())
    }

    fn push_silence(&self, client: &mut dyn EndpointClient, frames: u32) -> Result<u32> {
        let buffer_frames = client.buffer_size()?;
        let padding = client.current_padding()?;
        let do_frames = (buffer_frames - padding).min(frames);
        if do_frames == 0 {
            return Ok(0);
        }

        client.render_buffer(do_frames)?;
        client.release_buffer(do_frames, true)?;

        tracing::debug!(
            ms = do_frames as f64 * 1000.0 / f64::from(self.rate()),
            "pushed silence"
        );
        self.pushed_frames
            .fetch_add(u64::from(do_frames), Ordering::AcqRel);
        Ok(do_frames)
    }

    fn queue_chunk(&self, chunk: &mut Chunk) -> Result<()> {
        if self.error.load(Ordering::Acquire) {
            return Err(Error::Endpoint("feeder worker failed".to_string()));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        // Let the producer recycle its buffer while the chunk waits.
        chunk.materialize();

        let mut queue = self.queue.lock();
        if queue.frames > self.rate() as usize / 4 {
            // Over the 250 ms cap: leave the chunk with the caller, who
            // blocks on the filled event and retries.
            return Ok(());
        }
        queue.frames += chunk.frame_count();
        queue.chunks.push_back(chunk.take());
        Ok(())
    }

    fn realtime_pass(&self, client: &mut dyn EndpointClient) -> Result<Pace> {
        let chunk = {
            let mut queue = self.queue.lock();
            match queue.chunks.pop_front() {
                Some(chunk) => {
                    queue.frames -= chunk.frame_count();
                    Some(chunk)
                }
                None => None,
            }
        };

        match chunk {
            None => {
                let latency = self.descriptor.latency + 2 * TICKS_PER_MS;
                let remaining = self.end() - self.position()?;
                if remaining < latency {
                    let frames =
                        time::ticks_to_frames(latency - remaining, self.rate()) as u32;
                    let done = self.push_silence(client, frames)?;
                    self.silence_frames
                        .fetch_add(u64::from(done), Ordering::AcqRel);
                }
                Ok(Pace::Millis(1))
            }
            Some(mut chunk) => {
                self.push_to_device(client, &mut chunk, None)?;
                if chunk.is_empty() {
                    Ok(Pace::Immediate)
                } else {
                    let mut queue = self.queue.lock();
                    queue.frames += chunk.frame_count();
                    queue.chunks.push_front(chunk);
                    Ok(Pace::Millis(1))
                }
            }
        }
    }
}

fn realtime_feed(shared: &Arc<PushShared>) {
    if let Err(error) =
        audio_thread_priority::promote_current_thread_to_real_time(0, shared.rate())
    {
        tracing::debug!(?error, "realtime promotion unavailable");
    }

    while !shared.exit.load(Ordering::Acquire) {
        let pace = {
            let mut io = shared.io.lock();
            let pace = if shared.error.load(Ordering::Acquire) {
                Pace::Park
            } else {
                match shared.realtime_pass(&mut **io) {
                    Ok(pace) => pace,
                    Err(error) => {
                        tracing::error!(%error, "realtime feed failed");
                        shared.error.store(true, Ordering::Release);
                        Pace::Park
                    }
                }
            };
            shared.woken.set();
            pace
        };

        match pace {
            Pace::Immediate => {}
            Pace::Millis(ms) => {
                shared.wake.wait_timeout(Duration::from_millis(ms));
            }
            Pace::Park => shared.wake.wait(),
        }
    }
}

fn silence_feed(shared: &Arc<PushShared>) {
    let interval = Duration::from_millis(u64::from(
        (shared.descriptor.buffer_duration_ms / 4).max(1),
    ));

    while !shared.exit.load(Ordering::Acquire) && !shared.error.load(Ordering::Acquire) {
        let pass = {
            let mut io = shared.io.lock();
            let buffer = RefTime::from(shared.descriptor.buffer_duration_ms) * TICKS_PER_MS;
            shared.position().and_then(|position| {
                let remaining = shared.end() - position;
                if remaining < buffer {
                    let frames =
                        time::ticks_to_frames(buffer - remaining, shared.rate()) as u32;
                    let done = shared.push_silence(&mut **io, frames)?;
                    shared
                        .silence_frames
                        .fetch_add(u64::from(done), Ordering::AcqRel);
                }
                Ok(())
            })
        };
        if let Err(error) = pass {
            tracing::error!(%error, "silence feed failed");
            shared.error.store(true, Ordering::Release);
        }

        shared.wake.wait_timeout(interval);
    }
}

/// The polling feeder. See the module docs for the feed strategies.
pub struct PushFeeder {
    shared: Arc<PushShared>,
    thread: Option<JoinHandle<()>>,
}

impl PushFeeder {
    /// Take ownership of an open backend.
    ///
    /// # Panics
    ///
    /// Panics if the backend was negotiated for event-driven feeding.
    pub fn new(backend: DeviceBackend) -> PushFeeder {
        assert!(!backend.descriptor.event_driven);

        let shared = Arc::new(PushShared {
            descriptor: backend.descriptor,
            io: Mutex::new(backend.client),
            clock: backend.clock,
            wake: Event::auto_reset(),
            woken: Event::manual_reset(),
            exit: AtomicBool::new(false),
            error: AtomicBool::new(false),
            eos: AtomicI64::new(0),
            pushed_frames: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            queue: Mutex::new(RtQueue::default()),
        });

        let thread = shared.descriptor.realtime.then(|| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || realtime_feed(&shared))
        });

        PushFeeder { shared, thread }
    }

    /// Negotiated device properties.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    /// The device position clock.
    pub fn clock(&self) -> Arc<dyn EndpointClock> {
        Arc::clone(&self.shared.clock)
    }

    /// Whether a worker hit a sticky error.
    pub fn failed(&self) -> bool {
        self.shared.error.load(Ordering::Acquire)
    }

    /// Write as much of `chunk` as fits (realtime: queue it); the written
    /// frames are dropped from the chunk's head. Signals `filled` when the
    /// device buffer is full afterwards.
    pub fn push(&self, chunk: &mut Chunk, filled: Option<&Event>) -> Result<()> {
        debug_assert_eq!(self.shared.eos.load(Ordering::Acquire), 0);

        if self.shared.descriptor.realtime {
            self.shared.queue_chunk(chunk)?;
            self.shared.wake.set();
            if let Some(filled) = filled {
                if !chunk.is_empty() {
                    filled.set();
                }
            }
            Ok(())
        } else {
            let mut io = self.shared.io.lock();
            self.shared.push_to_device(&mut **io, chunk, filled)
        }
    }

    /// Mark end-of-stream and return the remaining playback time. Starts
    /// the silence feed so the device stays fed until [`stop`](Self::stop).
    pub fn finish(&mut self, filled: Option<&Event>) -> Result<RefTime> {
        if self.failed() {
            return Err(Error::Endpoint("feeder worker failed".to_string()));
        }

        if self.shared.eos.load(Ordering::Acquire) == 0 {
            self.shared.eos.store(self.shared.end(), Ordering::Release);

            if self.thread.is_none() {
                debug_assert!(!self.shared.exit.load(Ordering::Acquire));
                let shared = Arc::clone(&self.shared);
                self.thread = Some(std::thread::spawn(move || silence_feed(&shared)));
            }
        }

        if let Some(filled) = filled {
            filled.set();
        }

        Ok(self.shared.eos.load(Ordering::Acquire) - self.shared.position()?)
    }

    /// Device playback position in ticks.
    pub fn position(&self) -> Result<RefTime> {
        self.shared.position()
    }

    /// End of all pushed audio in ticks. Keeps growing while the silence
    /// feed tops the device up.
    pub fn end(&self) -> RefTime {
        self.shared.end()
    }

    /// The end position captured at end-of-stream; 0 while streaming.
    pub fn end_of_stream_position(&self) -> RefTime {
        self.shared.eos.load(Ordering::Acquire)
    }

    /// Total injected silence in ticks.
    pub fn silence(&self) -> RefTime {
        self.shared.silence()
    }

    /// Start the device.
    pub fn start(&self) -> Result<()> {
        self.shared.io.lock().start()
    }

    /// Stop the device.
    pub fn stop(&self) -> Result<()> {
        self.shared.io.lock().stop()
    }

    /// Stop the silence feed, reset the device, and zero all counters.
    pub fn reset(&mut self) -> Result<()> {
        if !self.shared.descriptor.realtime {
            if let Some(thread) = self.thread.take() {
                self.shared.exit.store(true, Ordering::Release);
                self.shared.wake.set();
                let _ = thread.join();
                self.shared.exit.store(false, Ordering::Release);
            }
        }

        {
            let mut io = self.shared.io.lock();
            io.reset()?;
            self.shared.pushed_frames.store(0, Ordering::Release);
            self.shared.silence_frames.store(0, Ordering::Release);
            self.shared.eos.store(0, Ordering::Release);

            if self.shared.descriptor.realtime {
                self.shared.woken.reset();
                let mut queue = self.shared.queue.lock();
                queue.frames = 0;
                queue.chunks.clear();
            }
        }

        if self.shared.descriptor.realtime {
            // Wait for the realtime thread to run one clean pass.
            self.shared.wake.set();
            self.shared.woken.wait();
        }
        Ok(())
    }
}

impl Drop for PushFeeder {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.wake.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{create_backend, CreateParams};
    use crate::virt::{VirtualDevice, VirtualProvider};
    use salida_core::{ChannelMask, SampleFormat, WaveFormat};

    fn make_feeder(realtime: bool) -> (PushFeeder, Arc<VirtualDevice>) {
        let device = VirtualDevice::stereo_float(48_000);
        let provider = VirtualProvider::single(Arc::clone(&device));
        let params = CreateParams {
            endpoint_id: None,
            exclusive: false,
            buffer_ms: 100,
            realtime,
            force_poll: true,
        };
        let format = WaveFormat::new(SampleFormat::Float32, 48_000, 2, ChannelMask::STEREO);
        let backend = create_backend(&provider, &params, &format).unwrap();
        (PushFeeder::new(backend), device)
    }

    fn float_chunk(frames: usize) -> Chunk {
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, frames, 48_000);
        chunk.samples_f32_mut().fill(0.25);
        chunk
    }

    #[test]
    fn test_push_writes_what_fits() {
        let (feeder, device) = make_feeder(false);
        // Device buffer is 4800 frames; a 6000-frame chunk fills it and
        // keeps the rest.
        let mut chunk = float_chunk(6000);
        let filled = Event::manual_reset();
        feeder.push(&mut chunk, Some(&filled)).unwrap();

        assert_eq!(chunk.frame_count(), 1200);
        assert_eq!(device.padding(), 4800);
        assert!(filled.is_set());
        assert_eq!(feeder.end(), time::frames_to_ticks(4800, 48_000));

        // Device consumes; the rest goes in.
        device.advance(2400);
        feeder.push(&mut chunk, Some(&filled)).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(device.data_frames(), 6000);
    }

    #[test]
    fn test_finish_spawns_silence_feed() {
        let (mut feeder, device) = make_feeder(false);
        let mut chunk = float_chunk(480);
        feeder.push(&mut chunk, None).unwrap();

        let remaining = feeder.finish(None).unwrap();
        assert!(remaining >= 0);

        // The silence feed keeps the device buffer from draining.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.silence_frames() == 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "silence feed never ran"
            );
            device.advance(480);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let (mut feeder, device) = make_feeder(false);
        let mut chunk = float_chunk(480);
        feeder.push(&mut chunk, None).unwrap();
        assert!(feeder.end() > 0);

        feeder.reset().unwrap();
        assert_eq!(feeder.end(), 0);
        assert_eq!(feeder.silence(), 0);
        assert_eq!(device.padding(), 0);
    }

    #[test]
    fn test_realtime_push_queues_and_drains() {
        let (feeder, device) = make_feeder(true);
        let mut chunk = float_chunk(480);
        feeder.push(&mut chunk, None).unwrap();
        assert!(chunk.is_empty(), "realtime push queues the whole chunk");

        // The realtime thread moves it into the device.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.data_frames() < 480 {
            assert!(
                std::time::Instant::now() < deadline,
                "realtime feed never drained the queue"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_realtime_underrun_guard_injects_silence() {
        let (feeder, device) = make_feeder(true);
        let _ = feeder;

        // No data queued; position == end == 0, so remaining < latency and
        // the worker injects silence.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.silence_frames() == 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "underrun guard never fired"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
