//! Remote-call protocol spoken over a [`Transport`].
//!
//! Both sides expose a [`MethodTable`]. The host opens with `syn` carrying its
//! method names, the surface answers `ack` with its own, and from then on
//! either side may `call` any name the peer announced and receive a `reply`
//! tagged with the call id. Incoming calls run as independent tasks, so replies
//! can come back in any order.

use crate::{
    errors::ProviderError::{self, *},
    transport::Transport,
};
use dashmap::DashMap;
use fehler::{throw, throws};
use futures::future::{ready, BoxFuture};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    select,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        oneshot,
    },
};

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum Message {
    Syn {
        methods: Vec<String>,
    },
    Ack {
        methods: Vec<String>,
    },
    Call {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

pub type MethodFuture = BoxFuture<'static, Result<Value, String>>;
type Method = Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Named operations one side makes callable by its peer.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.methods
            .insert(name.to_owned(), Box::new(move |args| -> MethodFuture { Box::pin(f(args)) }));
        self
    }

    pub fn sync<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.method(name, move |args| ready(f(args)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    fn invoke(&self, name: &str, args: Vec<Value>) -> MethodFuture {
        match self.methods.get(name) {
            Some(method) => method(args),
            None => Box::pin(ready(Err(format!("Method {} is not exposed", name)))),
        }
    }
}

type Pending = DashMap<u64, oneshot::Sender<Result<Value, ProviderError>>>;

struct Inner {
    outbox: UnboundedSender<Vec<u8>>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    remote_methods: Vec<String>,
}

/// A connected side of the channel. Cheap to clone. Dropping the last clone
/// stops the driver and closes the transport.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Initiates the handshake and resolves once the peer acknowledges.
    #[throws(ProviderError)]
    pub async fn connect(mut transport: Box<dyn Transport>, local: MethodTable) -> Self {
        let syn = Message::Syn {
            methods: local.names(),
        };
        transport.send(&serde_json::to_vec(&syn)?).await?;

        let remote_methods = loop {
            match decode(&transport.recv().await?)? {
                Message::Ack { methods } => break methods,
                other => debug!("Dropping {:?} received before the handshake ack", other),
            }
        };
        debug!("Widget channel connected, remote exposes {:?}", remote_methods);

        Self::spawn(transport, local, remote_methods)
    }

    /// Waits for the peer's handshake and acknowledges it.
    #[throws(ProviderError)]
    pub async fn accept(mut transport: Box<dyn Transport>, local: MethodTable) -> Self {
        let remote_methods = loop {
            match decode(&transport.recv().await?)? {
                Message::Syn { methods } => break methods,
                other => debug!("Dropping {:?} received before the handshake syn", other),
            }
        };
        let ack = Message::Ack {
            methods: local.names(),
        };
        transport.send(&serde_json::to_vec(&ack)?).await?;

        Self::spawn(transport, local, remote_methods)
    }

    fn spawn(transport: Box<dyn Transport>, local: MethodTable, remote_methods: Vec<String>) -> Self {
        let (outbox, outbox_rx) = unbounded_channel();
        let pending = Arc::new(Pending::new());

        tokio::spawn(drive(
            transport,
            outbox_rx,
            outbox.downgrade(),
            pending.clone(),
            Arc::new(local),
        ));

        Endpoint {
            inner: Arc::new(Inner {
                outbox,
                pending,
                next_id: AtomicU64::new(1),
                remote_methods,
            }),
        }
    }

    pub fn remote_methods(&self) -> &[String] {
        &self.inner.remote_methods
    }

    pub fn exposes(&self, method: &str) -> bool {
        self.inner.remote_methods.iter().any(|m| m == method)
    }

    /// Calls a peer method. There is no timeout: a peer that never replies
    /// leaves the call pending until the transport closes.
    #[throws(ProviderError)]
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Value {
        if !self.exposes(method) {
            throw!(MissingRemoteMethod(method.to_owned()))
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_vec(&Message::Call {
            id,
            method: method.to_owned(),
            args,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        if self.inner.outbox.send(frame).is_err() {
            self.inner.pending.remove(&id);
            throw!(ChannelClosed)
        }
        trace!("Call {} -> {}", id, method);

        rx.await.map_err(|_| ChannelClosed)??
    }
}

#[throws(ProviderError)]
fn decode(frame: &[u8]) -> Message {
    serde_json::from_slice(frame)?
}

async fn drive(
    transport: Box<dyn Transport>,
    outbox_rx: UnboundedReceiver<Vec<u8>>,
    replies: WeakUnboundedSender<Vec<u8>>,
    pending: Arc<Pending>,
    local: Arc<MethodTable>,
) {
    match pump(transport, outbox_rx, replies, &pending, local).await {
        Ok(()) => debug!("Last endpoint dropped, closing the widget channel"),
        Err(e) => warn!("Widget channel closed: {}", e),
    }

    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(ChannelClosed));
        }
    }
}

#[throws(ProviderError)]
async fn pump(
    mut transport: Box<dyn Transport>,
    mut outbox_rx: UnboundedReceiver<Vec<u8>>,
    replies: WeakUnboundedSender<Vec<u8>>,
    pending: &Pending,
    local: Arc<MethodTable>,
) {
    loop {
        select! {
            frame = outbox_rx.recv() => match frame {
                Some(frame) => transport.send(&frame).await?,
                None => break,
            },
            frame = transport.recv() => match decode(&frame?) {
                Ok(Message::Call { id, method, args }) => {
                    trace!("Incoming call {} -> {}", id, method);
                    let call = local.invoke(&method, args);
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        let reply = match call.await {
                            Ok(result) => Message::Reply { id, result, error: None },
                            Err(error) => Message::Reply { id, result: Value::Null, error: Some(error) },
                        };
                        match (serde_json::to_vec(&reply), replies.upgrade()) {
                            (Ok(frame), Some(outbox)) => {
                                let _ = outbox.send(frame);
                            }
                            (Ok(_), None) => debug!("Dropping reply to {}, the channel is closing", method),
                            (Err(e), _) => warn!("Cannot encode reply to {}: {}", method, e),
                        }
                    });
                }
                Ok(Message::Reply { id, result, error }) => match pending.remove(&id) {
                    Some((_, tx)) => {
                        let outcome = match error {
                            Some(error) => Err(Remote(Value::String(error))),
                            None => Ok(result),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => warn!("Reply for unknown call {}", id),
                },
                Ok(other) => debug!("Ignoring {:?} after the handshake", other),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            },
        }
    }
}
