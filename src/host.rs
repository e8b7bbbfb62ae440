//! The page hosting the widget: readiness, the container and frame the widget
//! lives in, and the viewport the widget sizes itself against.

use crate::{errors::ProviderError, transport::Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

/// Whatever metrics the host can report. A zero dimension counts as unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    pub window: Option<Size>,
    pub document_element: Option<Size>,
    pub body: Option<Size>,
}

impl Viewport {
    /// Window metrics first, then the document element, then the body;
    /// each dimension falls back on its own.
    pub fn resolve(&self) -> Size {
        let sources = [self.window, self.document_element, self.body];
        let pick = |dimension: fn(&Size) -> u32| {
            sources
                .iter()
                .flatten()
                .map(dimension)
                .find(|v| *v > 0)
                .unwrap_or(0)
        };
        Size {
            width: pick(|s| s.width),
            height: pick(|s| s.height),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHandle {
    pub id: u64,
    pub container: ContainerHandle,
    pub src: String,
}

#[async_trait]
pub trait Host: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Resolves once the document is interactive or later.
    async fn document_ready(&self);

    fn create_container(&self) -> Result<ContainerHandle, ProviderError>;

    fn create_frame(&self, container: ContainerHandle, src: &str) -> Result<FrameHandle, ProviderError>;

    /// Makes the container part of the visible document.
    fn attach(&self, container: ContainerHandle) -> Result<(), ProviderError>;

    /// Detaches the container and drops its frame. Unknown handles are ignored.
    fn remove_container(&self, container: ContainerHandle);

    fn set_container_height(&self, container: ContainerHandle, height: u32);

    fn viewport(&self) -> Viewport;

    /// Opens the message channel into the frame's content.
    async fn open_channel(&self, frame: &FrameHandle) -> Result<Box<dyn Transport>, ProviderError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub attached: bool,
    pub height: u32,
    pub frames: Vec<String>,
}

/// Container and frame bookkeeping shared by hosts that have no real DOM.
#[derive(Debug, Default)]
pub struct Layout {
    next_id: AtomicU64,
    containers: DashMap<u64, ContainerState>,
}

impl Layout {
    pub fn create_container(&self) -> ContainerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.containers.insert(id, ContainerState::default());
        ContainerHandle(id)
    }

    pub fn create_frame(&self, container: ContainerHandle, src: &str) -> Option<FrameHandle> {
        let mut state = self.containers.get_mut(&container.0)?;
        state.frames.push(src.to_owned());
        Some(FrameHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            container,
            src: src.to_owned(),
        })
    }

    pub fn attach(&self, container: ContainerHandle) -> bool {
        match self.containers.get_mut(&container.0) {
            Some(mut state) => {
                state.attached = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, container: ContainerHandle) -> bool {
        self.containers.remove(&container.0).is_some()
    }

    pub fn set_height(&self, container: ContainerHandle, height: u32) {
        if let Some(mut state) = self.containers.get_mut(&container.0) {
            state.height = height;
        }
    }

    pub fn container(&self, container: ContainerHandle) -> Option<ContainerState> {
        self.containers.get(&container.0).map(|state| state.value().clone())
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(feature = "ipc")]
pub use self::ipc_host::IpcHost;

#[cfg(feature = "ipc")]
mod ipc_host {
    use super::*;
    use crate::{config::WIDGET_URL, errors::ProviderError::*, ipc::IpcTransport};
    use log::debug;
    use parking_lot::RwLock;
    use std::path::PathBuf;

    /// A headless host whose widget surface runs in another process,
    /// reachable through an [`IpcListener`](crate::ipc::IpcListener) socket.
    pub struct IpcHost {
        socket_path: PathBuf,
        viewport: RwLock<Viewport>,
        layout: Layout,
    }

    impl IpcHost {
        pub fn new(socket_path: impl Into<PathBuf>, viewport: Size) -> Self {
            IpcHost {
                socket_path: socket_path.into(),
                viewport: RwLock::new(Viewport {
                    window: Some(viewport),
                    ..Viewport::default()
                }),
                layout: Layout::default(),
            }
        }

        pub fn resize(&self, size: Size) {
            self.viewport.write().window = Some(size);
        }

        pub fn layout(&self) -> &Layout {
            &self.layout
        }
    }

    #[async_trait]
    impl Host for IpcHost {
        fn ready_state(&self) -> ReadyState {
            ReadyState::Complete
        }

        async fn document_ready(&self) {}

        fn create_container(&self) -> Result<ContainerHandle, ProviderError> {
            Ok(self.layout.create_container())
        }

        fn create_frame(&self, container: ContainerHandle, src: &str) -> Result<FrameHandle, ProviderError> {
            if src != WIDGET_URL {
                return Err(Handshake(format!("refusing to load untrusted origin {}", src)));
            }
            self.layout
                .create_frame(container, src)
                .ok_or_else(|| Handshake(format!("no container {}", container.0)))
        }

        fn attach(&self, container: ContainerHandle) -> Result<(), ProviderError> {
            match self.layout.attach(container) {
                true => Ok(()),
                false => Err(Handshake(format!("no container {}", container.0))),
            }
        }

        fn remove_container(&self, container: ContainerHandle) {
            if self.layout.remove(container) {
                debug!("Widget container {} removed", container.0);
            }
        }

        fn set_container_height(&self, container: ContainerHandle, height: u32) {
            debug!("Widget container {} resized to {}px", container.0, height);
            self.layout.set_height(container, height);
        }

        fn viewport(&self) -> Viewport {
            *self.viewport.read()
        }

        async fn open_channel(&self, frame: &FrameHandle) -> Result<Box<dyn Transport>, ProviderError> {
            debug!("Opening frame {} at {}", frame.id, self.socket_path.display());
            let transport = IpcTransport::connect(&self.socket_path).await?;
            Ok(Box::new(transport))
        }
    }
}
