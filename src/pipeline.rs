//! The ordered chain every request runs through.
//!
//! Each [`Stage`] either produces an outcome, ending the request, or hands it
//! to the rest of the chain through [`Next::run`]. `Next` is consumed by the
//! call, so a stage forwards at most once; a stage that returns without
//! forwarding ends the request there and no later stage observes it. The
//! [`Terminal`] sits behind every stage and always produces an outcome, so a
//! request can never fall off the end of the chain.

use crate::{
    config::ConfigHandle,
    stages::{Cache, Filters, Fixture, HookedWallet, Nonce, Relay, Subscriptions},
    types::{RpcError, RpcRequest, RpcResponse},
    widget::WidgetChannel,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, trace};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

pub type Outcome = Result<Value, RpcError>;

/// Per-session state threaded through every request.
///
/// `selected_address` is written by whichever account round trip finishes
/// last; concurrent lookups resolving out of order overwrite each other.
pub struct Session {
    selected_address: RwLock<Option<String>>,
    config: ConfigHandle,
}

impl Session {
    pub fn new(config: ConfigHandle) -> Arc<Self> {
        Arc::new(Session {
            selected_address: RwLock::new(None),
            config,
        })
    }

    pub fn selected_address(&self) -> Option<String> {
        self.selected_address.read().clone()
    }

    pub fn set_selected_address(&self, address: impl Into<String>) {
        *self.selected_address.write() = Some(address.into());
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once when the pipeline is assembled.
    fn attach(&mut self, _pipeline: PipelineHandle) {}

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome;

    /// Drops any network-dependent state.
    fn reset(&self) {}
}

#[async_trait]
pub trait Terminal: Send + Sync {
    fn name(&self) -> &'static str;

    fn attach(&mut self, _pipeline: PipelineHandle) {}

    async fn end(&self, request: RpcRequest, session: &Arc<Session>) -> Outcome;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    session: &'a Arc<Session>,
}

impl<'a> Next<'a> {
    pub fn run(self, request: RpcRequest) -> BoxFuture<'a, Outcome> {
        self.pipeline.dispatch(self.index, self.session, request)
    }
}

/// Weak back-reference for stages that issue their own requests.
#[derive(Clone, Default)]
pub struct PipelineHandle(Weak<Pipeline>);

impl PipelineHandle {
    pub fn upgrade(&self) -> Option<Arc<Pipeline>> {
        self.0.upgrade()
    }

    /// Runs a nested request from the top of the pipeline.
    pub async fn request(&self, session: &Arc<Session>, method: &str, params: Vec<Value>) -> Outcome {
        let pipeline = self
            .upgrade()
            .ok_or_else(|| RpcError::internal("pipeline is gone"))?;
        trace!("Nested request {}", method);
        pipeline
            .handle(session, RpcRequest::new(method, params))
            .await
            .into_result()
    }
}

struct Slot {
    stage: Box<dyn Stage>,
    hits: AtomicU64,
}

pub struct Pipeline {
    slots: Vec<Slot>,
    terminal: Box<dyn Terminal>,
    terminal_hits: AtomicU64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder { stages: Vec::new() }
    }

    /// Fixture, cache, subscriptions, filters, nonce and wallet, then the relay.
    pub fn standard(widget: Arc<WidgetChannel>, subscriptions: Subscriptions) -> Arc<Pipeline> {
        Pipeline::builder()
            .stage(Fixture)
            .stage(Cache::default())
            .stage(subscriptions)
            .stage(Filters::default())
            .stage(Nonce::default())
            .stage(HookedWallet::new(widget.clone()))
            .terminal(Relay::new(widget))
    }

    /// Processes one request; the response always carries the request's id.
    pub fn handle<'a>(&'a self, session: &'a Arc<Session>, request: RpcRequest) -> BoxFuture<'a, RpcResponse> {
        Box::pin(async move {
            let id = request.id;
            let jsonrpc = request.jsonrpc.clone();
            let method = request.method.clone();

            let outcome = self.dispatch(0, session, request).await;
            if let Err(e) = &outcome {
                debug!("Request {} ({}) failed: {}", id, method, e);
            }
            RpcResponse::new(id, jsonrpc, outcome)
        })
    }

    fn dispatch<'a>(&'a self, index: usize, session: &'a Arc<Session>, request: RpcRequest) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            match self.slots.get(index) {
                Some(slot) => {
                    slot.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("{} <- {}", slot.stage.name(), request.method);
                    let next = Next {
                        pipeline: self,
                        index: index + 1,
                        session,
                    };
                    slot.stage.handle(request, session, next).await
                }
                None => {
                    self.terminal_hits.fetch_add(1, Ordering::Relaxed);
                    trace!("{} <- {}", self.terminal.name(), request.method);
                    self.terminal.end(request, session).await
                }
            }
        })
    }

    /// How many times the named stage (or terminal) has been entered.
    pub fn hits(&self, name: &str) -> u64 {
        if self.terminal.name() == name {
            return self.terminal_hits.load(Ordering::Relaxed);
        }
        self.slots
            .iter()
            .find(|slot| slot.stage.name() == name)
            .map(|slot| slot.hits.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stage names in invocation order, terminal last.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .map(|slot| slot.stage.name())
            .chain(Some(self.terminal.name()))
            .collect()
    }

    pub fn reset(&self) {
        for slot in &self.slots {
            slot.stage.reset();
        }
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    /// Appends a stage; stages run in the order they are added.
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn terminal<T: Terminal + 'static>(self, terminal: T) -> Arc<Pipeline> {
        let mut stages = self.stages;
        let mut terminal: Box<dyn Terminal> = Box::new(terminal);

        Arc::new_cyclic(|weak| {
            let handle = PipelineHandle(weak.clone());
            for stage in &mut stages {
                stage.attach(handle.clone());
            }
            terminal.attach(handle);

            Pipeline {
                slots: stages
                    .into_iter()
                    .map(|stage| Slot {
                        stage,
                        hits: AtomicU64::new(0),
                    })
                    .collect(),
                terminal,
                terminal_hits: AtomicU64::new(0),
            }
        })
    }
}
