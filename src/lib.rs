pub mod config;
#[cfg(feature = "ipc")]
mod duplex;
mod errors;
pub mod host;
#[cfg(feature = "ipc")]
pub mod ipc;
pub mod pipeline;
mod provider;
pub mod quantity;
pub mod rpc;
mod sdk;
pub mod stages;
pub mod transport;
mod types;
pub mod widget;

pub use crate::types::*;
pub use config::{ConfigHandle, Network, NetworkSpec, Options, Scope, SdkConfig};
pub use errors::ProviderError;
pub use host::{Host, Size};
pub use pipeline::{Pipeline, Session};
pub use provider::Provider;
pub use sdk::Portis;
pub use widget::WidgetChannel;

#[cfg(feature = "ipc")]
use std::mem::size_of;

#[cfg(feature = "ipc")]
const CAPACITY: usize = 1 << 19; // 512k buffer
#[cfg(feature = "ipc")]
const SIZE: usize = size_of::<usize>();
