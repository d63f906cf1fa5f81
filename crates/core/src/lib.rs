//! Kubus core types: resource envelope, addressing, exec framing and errors.

#![forbid(unsafe_code)]

mod address;
mod error;
mod frame;
mod resource;

pub use address::Query;
pub use error::{ClientError, ClientResult};
pub use frame::{Channel, ExecFrame, ExecStatus};
pub use resource::{
    EventType, ListMeta, ObjectMeta, OwnerReference, ResourceDescriptor, ResourceInstance, ResourceList, WatchEvent,
};

pub mod prelude {
    pub use super::{ClientError, ClientResult, EventType, ResourceDescriptor, ResourceInstance, WatchEvent};
}
