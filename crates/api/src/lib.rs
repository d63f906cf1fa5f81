//! Kubus API: typed request dispatch, watch streams and pod subresources over a `Transport`.
//!
//! `ResourceClient` is the entry point; build one per resource type from a
//! shared transport and a `ResourceDescriptor`.

#![forbid(unsafe_code)]

mod client;
mod pod;
mod watch;

pub use client::{DeleteOptions, ListOptions, PropagationPolicy, ResourceClient};
pub use watch::{EventDecoder, WatchOptions, WatchState, WatchStream};

pub use kubus_core::{ClientError, ClientResult, ResourceDescriptor, ResourceInstance, WatchEvent};
pub use kubus_kubehub::{ClientConfig, KubeTransport, Transport};
pub use kubus_ops::{CancelHandle, ExecOptions, ExecReport, ExecSession, LogChunk, LogOptions, SessionOutcome, StreamHandle};
