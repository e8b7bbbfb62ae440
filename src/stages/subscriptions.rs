use crate::{
    pipeline::{Next, Outcome, PipelineHandle, Session, Stage},
    quantity,
    types::{RpcError, RpcRequest, JSONRPC_VERSION},
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};
use tokio::sync::{broadcast, Mutex};

const NOTIFICATION_BACKLOG: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    NewHeads,
    Logs,
    NewPendingTransactions,
}

impl SubscriptionKind {
    fn filter_method(self) -> &'static str {
        match self {
            SubscriptionKind::NewHeads => "eth_newBlockFilter",
            SubscriptionKind::Logs => "eth_newFilter",
            SubscriptionKind::NewPendingTransactions => "eth_newPendingTransactionFilter",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    pub subscription: String,
    pub result: Value,
}

impl Notification {
    /// The `eth_subscription` message a websocket node would push.
    pub fn to_message(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": "eth_subscription",
            "params": {
                "subscription": self.subscription,
                "result": self.result,
            },
        })
    }
}

#[derive(Clone, Debug)]
struct Subscription {
    kind: SubscriptionKind,
    filter_id: Value,
    /// Changes already taken from the filter but not yet published.
    backlog: Arc<Mutex<VecDeque<Value>>>,
}

struct Inner {
    pipeline: OnceLock<PipelineHandle>,
    next_id: AtomicU64,
    active: DashMap<String, Subscription>,
    notifications: broadcast::Sender<Notification>,
}

/// Push-style subscriptions backed by polled filters.
///
/// Clones share state, so the provider keeps one to poll and to hand out
/// notification receivers while the pipeline owns another.
#[derive(Clone)]
pub struct Subscriptions {
    inner: Arc<Inner>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriptions {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BACKLOG);
        Subscriptions {
            inner: Arc::new(Inner {
                pipeline: OnceLock::new(),
                next_id: AtomicU64::new(1),
                active: DashMap::new(),
                notifications,
            }),
        }
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn active(&self) -> usize {
        self.inner.active.len()
    }

    async fn nested(&self, session: &Arc<Session>, method: &str, params: Vec<Value>) -> Outcome {
        match self.inner.pipeline.get() {
            Some(pipeline) => pipeline.request(session, method, params).await,
            None => Err(RpcError::internal("subscriptions are not attached to a pipeline")),
        }
    }

    async fn subscribe(&self, request: &RpcRequest, session: &Arc<Session>) -> Outcome {
        let kind: SubscriptionKind = request
            .param(0)
            .cloned()
            .and_then(|kind| serde_json::from_value(kind).ok())
            .ok_or_else(|| RpcError::invalid_params("unsupported subscription type"))?;

        let params = match kind {
            SubscriptionKind::Logs => vec![request.param(1).cloned().unwrap_or_else(|| json!({}))],
            _ => vec![],
        };
        let filter_id = self.nested(session, kind.filter_method(), params).await?;

        let id = quantity::to_hex(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Subscription {} ({:?}) on filter {}", id, kind, filter_id);
        self.inner.active.insert(
            id.clone(),
            Subscription {
                kind,
                filter_id,
                backlog: Arc::default(),
            },
        );
        Ok(json!(id))
    }

    async fn unsubscribe(&self, request: &RpcRequest, session: &Arc<Session>) -> Outcome {
        let removed = request
            .param(0)
            .and_then(Value::as_str)
            .and_then(|id| self.inner.active.remove(id));
        match removed {
            Some((_, subscription)) => {
                self.nested(session, "eth_uninstallFilter", vec![subscription.filter_id])
                    .await?;
                Ok(json!(true))
            }
            None => Ok(json!(false)),
        }
    }

    /// Polls every active subscription once and broadcasts what changed.
    /// Returns the number of notifications published.
    ///
    /// A failing subscription does not stop the others. Changes it could not
    /// resolve stay queued, in order, ahead of the next poll's changes, and
    /// the first such error is returned once every subscription was polled.
    pub async fn poll(&self, session: &Arc<Session>) -> Result<usize, RpcError> {
        let active: Vec<(String, Subscription)> = self
            .inner
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut published = 0;
        let mut first_error = None;
        for (id, subscription) in active {
            match self.poll_one(session, &id, &subscription).await {
                Ok(n) => published += n,
                Err((n, e)) => {
                    warn!("Polling subscription {} failed: {}", id, e);
                    published += n;
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }

    async fn poll_one(
        &self,
        session: &Arc<Session>,
        id: &str,
        subscription: &Subscription,
    ) -> Result<usize, (usize, RpcError)> {
        // held across the round so concurrent polls cannot publish twice
        let mut backlog = subscription.backlog.lock().await;

        let fresh = self
            .nested(session, "eth_getFilterChanges", vec![subscription.filter_id.clone()])
            .await;
        match fresh {
            Ok(Value::Array(changes)) => backlog.extend(changes),
            Ok(_) => {}
            Err(e) if backlog.is_empty() => return Err((0, e)),
            Err(e) => warn!("No new changes for {}: {}", id, e),
        }

        let mut published = 0;
        while let Some(change) = backlog.front().cloned() {
            let result = match subscription.kind {
                SubscriptionKind::NewHeads => {
                    match self.nested(session, "eth_getBlockByHash", vec![change, json!(false)]).await {
                        Ok(block) => block,
                        Err(e) => return Err((published, e)),
                    }
                }
                _ => change,
            };
            backlog.pop_front();

            let notification = Notification {
                subscription: id.to_owned(),
                result,
            };
            if self.inner.notifications.send(notification).is_err() {
                warn!("Dropping notification for {}, nobody is listening", id);
            }
            published += 1;
        }
        Ok(published)
    }
}

#[async_trait]
impl Stage for Subscriptions {
    fn name(&self) -> &'static str {
        "subscriptions"
    }

    fn attach(&mut self, pipeline: PipelineHandle) {
        if self.inner.pipeline.set(pipeline).is_err() {
            warn!("Subscriptions attached to more than one pipeline");
        }
    }

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        match request.method.as_str() {
            "eth_subscribe" => self.subscribe(&request, session).await,
            "eth_unsubscribe" => self.unsubscribe(&request, session).await,
            _ => next.run(request).await,
        }
    }

    fn reset(&self) {
        self.inner.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_renders_as_subscription_message() {
        let notification = Notification {
            subscription: "0x1".to_owned(),
            result: json!({"number": "0x10"}),
        };
        assert_eq!(
            notification.to_message(),
            json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {"subscription": "0x1", "result": {"number": "0x10"}},
            })
        );
    }

    #[test]
    fn subscription_kinds_parse_from_wire_names() {
        let kind: SubscriptionKind = serde_json::from_value(json!("newPendingTransactions")).unwrap();
        assert_eq!(kind.filter_method(), "eth_newPendingTransactionFilter");
        assert!(serde_json::from_value::<SubscriptionKind>(json!("syncing")).is_err());
    }
}
