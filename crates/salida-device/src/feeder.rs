//! The feeder variant.
//!
//! A [`Feeder`] owns exactly one open [`DeviceBackend`] and the worker that
//! talks to it. The variant is chosen once, at construction, from the
//! backend's negotiated feed mode; every call after that dispatches
//! without re-deciding.

use std::sync::Arc;

use salida_core::{Chunk, RefTime};

use crate::backend::{DeviceBackend, DeviceDescriptor};
use crate::endpoint::EndpointClock;
use crate::event::EventFeeder;
use crate::push::PushFeeder;
use crate::sync::Event;
use crate::Result;

/// Either feeder, behind one call surface.
pub enum Feeder {
    /// Polling feeder.
    Push(PushFeeder),
    /// Event-driven feeder.
    Event(EventFeeder),
}

impl Feeder {
    /// Wrap an open backend in the feeder its negotiation selected.
    pub fn new(backend: DeviceBackend) -> Result<Feeder> {
        if backend.descriptor.event_driven {
            Ok(Feeder::Event(EventFeeder::new(backend)?))
        } else {
            Ok(Feeder::Push(PushFeeder::new(backend)))
        }
    }

    /// Negotiated device properties.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            Feeder::Push(feeder) => feeder.descriptor(),
            Feeder::Event(feeder) => feeder.descriptor(),
        }
    }

    /// The device position clock.
    pub fn clock(&self) -> Arc<dyn EndpointClock> {
        match self {
            Feeder::Push(feeder) => feeder.clock(),
            Feeder::Event(feeder) => feeder.clock(),
        }
    }

    /// Whether a worker hit a sticky error.
    pub fn failed(&self) -> bool {
        match self {
            Feeder::Push(feeder) => feeder.failed(),
            Feeder::Event(feeder) => feeder.failed(),
        }
    }

    /// Hand a chunk to the device; consumed frames leave the chunk.
    pub fn push(&self, chunk: &mut Chunk, filled: Option<&Event>) -> Result<()> {
        match self {
            Feeder::Push(feeder) => feeder.push(chunk, filled),
            Feeder::Event(feeder) => feeder.push(chunk, filled),
        }
    }

    /// Mark end-of-stream; returns the remaining playback time.
    pub fn finish(&mut self, filled: Option<&Event>) -> Result<RefTime> {
        match self {
            Feeder::Push(feeder) => feeder.finish(filled),
            Feeder::Event(feeder) => feeder.finish(filled),
        }
    }

    /// Device playback position in ticks.
    pub fn position(&self) -> Result<RefTime> {
        match self {
            Feeder::Push(feeder) => feeder.position(),
            Feeder::Event(feeder) => feeder.position(),
        }
    }

    /// End of all accepted audio in ticks.
    pub fn end(&self) -> RefTime {
        match self {
            Feeder::Push(feeder) => feeder.end(),
            Feeder::Event(feeder) => feeder.end(),
        }
    }

    /// The end position captured at end-of-stream; 0 while streaming.
    pub fn end_of_stream_position(&self) -> RefTime {
        match self {
            Feeder::Push(feeder) => feeder.end_of_stream_position(),
            Feeder::Event(feeder) => feeder.end_of_stream_position(),
        }
    }

    /// Total injected silence in ticks.
    pub fn silence(&self) -> RefTime {
        match self {
            Feeder::Push(feeder) => feeder.silence(),
            Feeder::Event(feeder) => feeder.silence(),
        }
    }

    /// Start the device.
    pub fn start(&self) -> Result<()> {
        match self {
            Feeder::Push(feeder) => feeder.start(),
            Feeder::Event(feeder) => feeder.start(),
        }
    }

    /// Stop the device.
    pub fn stop(&self) -> Result<()> {
        match self {
            Feeder::Push(feeder) => feeder.stop(),
            Feeder::Event(feeder) => feeder.stop(),
        }
    }

    /// Reset the device and clear buffered state.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            Feeder::Push(feeder) => feeder.reset(),
            Feeder::Event(feeder) => feeder.reset(),
        }
    }
}
