//! The event-driven feeder.
//!
//! Used when the endpoint signals buffer readiness through an event. A
//! time-critical worker waits on the wake event and on each wake copies as
//! much of the internal chunk queue as the device reports free (the whole
//! buffer in exclusive mode, the unpadded remainder in shared mode). When
//! the queue cannot fill the free space and the stream has not ended, the
//! buffer is released as silence - with the SILENT flag when no data was
//! written at all this wake - so the device never underruns.
//!
//! `start` is deferred until the first wake that wrote real audio, so a
//! stream never starts into an empty buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use salida_core::{time, Chunk, RefTime, TICKS_PER_SEC};

use crate::backend::{DeviceBackend, DeviceDescriptor};
use crate::endpoint::{EndpointClient, EndpointClock};
use crate::sync::Event;
use crate::{Error, Result};

#[derive(Default)]
struct EvQueue {
    frames: u64,
    chunks: VecDeque<Chunk>,
}

struct EventShared {
    descriptor: DeviceDescriptor,
    io: Mutex<Box<dyn EndpointClient>>,
    clock: Arc<dyn EndpointClock>,
    wake: Arc<Event>,
    exit: AtomicBool,
    error: AtomicBool,
    end_of_stream: AtomicBool,
    end_of_stream_pos: AtomicI64,
    queued_start: AtomicBool,
    received_frames: AtomicU64,
    sent_frames: AtomicU64,
    silence_frames: AtomicU64,
    queue: Mutex<EvQueue>,
}

impl EventShared {
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
        time::frames_to_ticks(self.received_frames.load(Ordering::Acquire), self.rate())
    }

    fn silence(&self) -> RefTime {
        time::frames_to_ticks(self.silence_frames.load(Ordering::Acquire), self.rate())
    }

    /// Queue cap in frames: one device buffer duration's worth.
    fn queue_cap(&self) -> u64 {
        u64::from(self.descriptor.buffer_duration_ms) * u64::from(self.rate()) / 1000
    }

    fn fill_device(&self, client: &mut dyn EndpointClient) -> Result<()> {
        let mut device_frames = client.buffer_size()?;
        if !self.descriptor.exclusive {
            device_frames -= client.current_padding()?;
        }
        if device_frames == 0 {
            return Ok(());
        }

        let frame_size = self.descriptor.wave_format.frame_size();
        let mut queue = self.queue.lock();

        // Not enough queued to fill the buffer: unless draining or live,
        // wait for more instead of stuttering.
        if u64::from(device_frames) > queue.frames
            && !self.end_of_stream.load(Ordering::Acquire)
            && !self.descriptor.realtime
        {
            return Ok(());
        }

        let mut staged = vec![0_u8; device_frames as usize * frame_size];
        let mut done_frames: u32 = 0;
        while done_frames < device_frames {
            let queue = &mut *queue;
            let Some(front) = queue.chunks.front_mut() else {
                break;
            };
            let do_frames = (device_frames - done_frames).min(front.frame_count() as u32);
            debug_assert_eq!(front.frame_size(), frame_size);

            let offset = done_frames as usize * frame_size;
            let bytes = do_frames as usize * frame_size;
            staged[offset..offset + bytes].copy_from_slice(&front.bytes()[..bytes]);

            done_frames += do_frames;
            queue.frames -= u64::from(do_frames);
            front.shrink_head(front.frame_count() - do_frames as usize);
            if front.is_empty() {
                queue.chunks.pop_front();
            }
        }
        drop(queue);

        let silent_frames = device_frames - done_frames;
        if done_frames == 0 {
            // Nothing written this wake: release the whole buffer silent.
            client.render_buffer(device_frames)?;
            client.release_buffer(device_frames, true)?;
        } else {
            let buffer = client.render_buffer(device_frames)?;
            buffer.copy_from_slice(&staged);
            client.release_buffer(device_frames, false)?;
        }

        if silent_frames > 0 {
            debug_assert!(
                self.end_of_stream.load(Ordering::Acquire) || self.descriptor.realtime
            );
            tracing::debug!(
                ms = silent_frames as f64 * 1000.0 / f64::from(self.rate()),
                "event feed silence"
            );
            self.silence_frames
                .fetch_add(u64::from(silent_frames), Ordering::AcqRel);
        }
        self.sent_frames
            .fetch_add(u64::from(done_frames), Ordering::AcqRel);
        Ok(())
    }
}

fn event_feed(shared: &Arc<EventShared>) {
    if let Err(error) =
        audio_thread_priority::promote_current_thread_to_real_time(0, shared.rate())
    {
        tracing::debug!(?error, "realtime promotion unavailable");
    }

    while !shared.exit.load(Ordering::Acquire) {
        {
            let mut io = shared.io.lock();
            if !shared.error.load(Ordering::Acquire) {
                let result = shared.fill_device(&mut **io).and_then(|()| {
                    // A delegated start waits for the first wake that wrote
                    // real audio.
                    if shared.queued_start.load(Ordering::Acquire)
                        && shared.sent_frames.load(Ordering::Acquire) > 0
                    {
                        tracing::debug!("delegated start");
                        io.start()?;
                        shared.queued_start.store(false, Ordering::Release);
                    }
                    Ok(())
                });
                if let Err(error) = result {
                    tracing::error!(%error, "event feed failed");
                    shared.error.store(true, Ordering::Release);
                }
            }
        }

        shared.wake.wait();
    }
}

/// The event-driven feeder. See the module docs for the feed strategy.
pub struct EventFeeder {
    shared: Arc<EventShared>,
    thread: Option<JoinHandle<()>>,
}

impl EventFeeder {
    /// Take ownership of an open backend and register the wake event.
    ///
    /// # Panics
    ///
    /// Panics if the backend was negotiated for polling.
    pub fn new(mut backend: DeviceBackend) -> Result<EventFeeder> {
        assert!(backend.descriptor.event_driven);

        let wake = Arc::new(Event::auto_reset());
        backend.client.set_event(Arc::clone(&wake))?;

        let shared = Arc::new(EventShared {
            descriptor: backend.descriptor,
            io: Mutex::new(backend.client),
            clock: backend.clock,
            wake,
            exit: AtomicBool::new(false),
            error: AtomicBool::new(false),
            end_of_stream: AtomicBool::new(false),
            end_of_stream_pos: AtomicI64::new(0),
            queued_start: AtomicBool::new(false),
            received_frames: AtomicU64::new(0),
            sent_frames: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            queue: Mutex::new(EvQueue::default()),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || event_feed(&shared))
        };

        Ok(EventFeeder {
            shared,
            thread: Some(thread),
        })
    }

    /// Negotiated device properties.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    /// The device position clock.
    pub fn clock(&self) -> Arc<dyn EndpointClock> {
        Arc::clone(&self.shared.clock)
    }

    /// Whether the worker hit a sticky error.
    pub fn failed(&self) -> bool {
        self.shared.error.load(Ordering::Acquire)
    }

    /// Queue a chunk for the worker. A push that would exceed the queue cap
    /// (one buffer duration) is dropped to preserve latency; `filled` is
    /// signalled in that case.
    pub fn push(&self, chunk: &mut Chunk, filled: Option<&Event>) -> Result<()> {
        debug_assert!(!self.shared.end_of_stream.load(Ordering::Acquire));
        if self.failed() {
            return Err(Error::Endpoint("feeder worker failed".to_string()));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        // Let the producer recycle its buffer while the chunk waits.
        chunk.materialize();

        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.frames > self.shared.queue_cap() {
                true
            } else {
                let frames = chunk.frame_count() as u64;
                queue.frames += frames;
                queue.chunks.push_back(chunk.take());
                self.shared
                    .received_frames
                    .fetch_add(frames, Ordering::AcqRel);
                false
            }
        };

        if dropped {
            tracing::debug!("event feeder queue full; dropping chunk");
            chunk.take();
            if let Some(filled) = filled {
                filled.set();
            }
        }
        Ok(())
    }

    /// Mark end-of-stream and return the remaining playback time.
    pub fn finish(&mut self, filled: Option<&Event>) -> Result<RefTime> {
        if self.failed() {
            return Err(Error::Endpoint("feeder worker failed".to_string()));
        }

        if !self.shared.end_of_stream.swap(true, Ordering::AcqRel) {
            tracing::debug!("event feeder end of stream");
            self.shared
                .end_of_stream_pos
                .store(self.shared.end(), Ordering::Release);
        }

        if let Some(filled) = filled {
            filled.set();
        }

        Ok(self.shared.end_of_stream_pos.load(Ordering::Acquire) - self.shared.position()?)
    }

    /// Device playback position in ticks.
    pub fn position(&self) -> Result<RefTime> {
        self.shared.position()
    }

    /// End of all queued audio in ticks.
    pub fn end(&self) -> RefTime {
        self.shared.end()
    }

    /// The end position captured at end-of-stream; 0 while streaming.
    pub fn end_of_stream_position(&self) -> RefTime {
        self.shared.end_of_stream_pos.load(Ordering::Acquire)
    }

    /// Total silence written in ticks.
    pub fn silence(&self) -> RefTime {
        self.shared.silence()
    }

    /// Start the device, deferring until the first wake that wrote data if
    /// nothing has been sent yet.
    pub fn start(&self) -> Result<()> {
        let delegate = {
            let _io = self.shared.io.lock();
            if self.shared.sent_frames.load(Ordering::Acquire) == 0 {
                self.shared.queued_start.store(true, Ordering::Release);
                true
            } else {
                false
            }
        };

        if delegate {
            tracing::debug!("queueing delegated start");
            self.shared.wake.set();
            Ok(())
        } else {
            self.shared.io.lock().start()
        }
    }

    /// Stop the device.
    pub fn stop(&self) -> Result<()> {
        self.shared.queued_start.store(false, Ordering::Release);
        self.shared.io.lock().stop()
    }

    /// Reset the device and clear all queued state.
    pub fn reset(&mut self) -> Result<()> {
        let mut io = self.shared.io.lock();
        io.reset()?;

        self.shared.end_of_stream.store(false, Ordering::Release);
        self.shared.end_of_stream_pos.store(0, Ordering::Release);
        self.shared.received_frames.store(0, Ordering::Release);
        self.shared.sent_frames.store(0, Ordering::Release);
        self.shared.silence_frames.store(0, Ordering::Release);

        let mut queue = self.shared.queue.lock();
        queue.frames = 0;
        queue.chunks.clear();
        Ok(())
    }
}

impl Drop for EventFeeder {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.wake.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
