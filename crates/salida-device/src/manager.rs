//! The device-manager actor.
//!
//! Platform endpoint layers are touchy about which thread talks to them,
//! so every provider call is serialized onto one worker thread. Requests
//! are typed messages with a single-shot reply channel; the public methods
//! block until the worker responds. The manager also carries the
//! default-device-change serial the provider bumps from its notification
//! callback, letting the renderer notice that the endpoint it opened is no
//! longer the default.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use salida_core::WaveFormat;

use crate::backend::{create_backend, CreateParams, DeviceBackend};
use crate::endpoint::{EndpointClient, EndpointInfo, EndpointProvider, ShareMode};
use crate::{Error, Result};

enum Request {
    Create {
        params: CreateParams,
        format: WaveFormat,
        reply: Sender<Result<DeviceBackend>>,
    },
    CheckBitstream {
        endpoint_id: Option<String>,
        format: WaveFormat,
        reply: Sender<Result<bool>>,
    },
    Endpoints {
        reply: Sender<Result<Vec<EndpointInfo>>>,
    },
    DefaultId {
        reply: Sender<Result<String>>,
    },
}

fn activate(
    provider: &dyn EndpointProvider,
    endpoint_id: Option<&str>,
) -> Result<Box<dyn EndpointClient>> {
    let id = match endpoint_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => provider.default_endpoint_id()?,
    };
    provider.activate(&id)
}

fn serve(provider: &dyn EndpointProvider, request: Request) {
    match request {
        Request::Create {
            params,
            format,
            reply,
        } => {
            let _ = reply.send(create_backend(provider, &params, &format));
        }
        Request::CheckBitstream {
            endpoint_id,
            format,
            reply,
        } => {
            let result = activate(provider, endpoint_id.as_deref()).and_then(|client| {
                client.is_format_supported(ShareMode::Exclusive, &format)
            });
            let _ = reply.send(result);
        }
        Request::Endpoints { reply } => {
            let _ = reply.send(provider.endpoints());
        }
        Request::DefaultId { reply } => {
            let _ = reply.send(provider.default_endpoint_id());
        }
    }
}

/// Serializes all endpoint-provider access onto a worker thread.
pub struct DeviceManager {
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
    default_serial: Arc<AtomicU32>,
}

impl DeviceManager {
    /// Start the worker, moving the provider onto it.
    pub fn new(provider: Box<dyn EndpointProvider>) -> DeviceManager {
        let default_serial = Arc::new(AtomicU32::new(0));
        provider.watch_default_changes(Arc::clone(&default_serial));

        let (requests, receiver) = unbounded::<Request>();
        let thread = std::thread::spawn(move || {
            for request in receiver {
                serve(provider.as_ref(), request);
            }
        });

        DeviceManager {
            requests,
            thread: Some(thread),
            default_serial,
        }
    }

    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply, response) = bounded(1);
        self.requests
            .send(build(reply))
            .map_err(|_| Error::ManagerGone)?;
        response.recv().map_err(|_| Error::ManagerGone)?
    }

    /// Open a backend for `format` per `params` (see
    /// [`create_backend`](crate::backend::create_backend)).
    pub fn create_device(&self, params: CreateParams, format: WaveFormat) -> Result<DeviceBackend> {
        self.call(|reply| Request::Create {
            params,
            format,
            reply,
        })
    }

    /// Whether the (or the default) endpoint accepts `format` as an
    /// exclusive bitstream.
    pub fn bitstream_supported(&self, endpoint_id: Option<String>, format: WaveFormat) -> bool {
        self.call(|reply| Request::CheckBitstream {
            endpoint_id,
            format,
            reply,
        })
        .unwrap_or(false)
    }

    /// Enumerate render endpoints.
    pub fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        self.call(|reply| Request::Endpoints { reply })
    }

    /// Identifier of the current default render endpoint.
    pub fn default_endpoint_id(&self) -> Result<String> {
        self.call(|reply| Request::DefaultId { reply })
    }

    /// Monotonic counter of default-device changes; compare snapshots to
    /// detect a change.
    pub fn default_device_serial(&self) -> u32 {
        self.default_serial.load(Ordering::Acquire)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        // Closing the channel ends the worker's receive loop.
        let (orphan, _) = unbounded();
        drop(std::mem::replace(&mut self.requests, orphan));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
