use crate::{
    pipeline::{Next, Outcome, Session, Stage},
    quantity,
    types::RpcRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Mutex;

/// Serializes submissions per sender and tracks the next pending nonce.
///
/// Tracked nonces are forgotten whenever a newer block number passes through,
/// so transactions submitted elsewhere are picked up from the node.
#[derive(Debug, Default)]
pub struct Nonce {
    locks: DashMap<String, Arc<Mutex<()>>>,
    nonces: DashMap<String, u64>,
    head: AtomicU64,
}

impl Nonce {
    pub fn tracked(&self, address: &str) -> Option<u64> {
        self.nonces.get(&address.to_lowercase()).map(|n| *n)
    }

    fn lock_for(&self, address: &str) -> Arc<Mutex<()>> {
        self.locks.entry(address.to_owned()).or_default().value().clone()
    }

    async fn block_number(&self, request: RpcRequest, next: Next<'_>) -> Outcome {
        let number = next.run(request).await?;
        if let Some(head) = quantity::parse(&number) {
            if head > self.head.fetch_max(head, Ordering::Relaxed) {
                self.forget_idle();
            }
        }
        Ok(number)
    }

    /// Drops tracked nonces of senders with no submission in flight.
    fn forget_idle(&self) {
        self.nonces.retain(|sender, _| match self.locks.get(sender) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        });
        trace!("New block, {} nonces still tracked", self.nonces.len());
    }

    async fn pending_count(&self, request: RpcRequest, next: Next<'_>) -> Outcome {
        let address = match request.param(0).and_then(Value::as_str) {
            Some(address) => address.to_lowercase(),
            None => return next.run(request).await,
        };
        if let Some(nonce) = self.tracked(&address) {
            trace!("Pending nonce for {} is {}", address, nonce);
            return Ok(json!(quantity::to_hex(nonce)));
        }

        let count = next.run(request).await?;
        if let Some(nonce) = quantity::parse(&count) {
            self.nonces.entry(address).or_insert(nonce);
        }
        Ok(count)
    }

    async fn send_transaction(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        let tx = request.param(0);
        let sender = tx
            .and_then(|tx| tx.get("from"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| session.selected_address());
        let sender = match sender {
            Some(sender) => sender.to_lowercase(),
            None => return next.run(request).await,
        };
        let explicit = tx.and_then(|tx| tx.get("nonce")).and_then(quantity::parse);

        let lock = self.lock_for(&sender);
        let _guard = lock.lock().await;

        let outcome = next.run(request).await;
        match &outcome {
            Ok(_) => {
                let mut tracked = self.nonces.entry(sender.clone()).or_insert(0);
                *tracked = match explicit {
                    Some(used) => (used + 1).max(*tracked),
                    None => *tracked + 1,
                };
                debug!("Next nonce for {} is {}", sender, *tracked);
            }
            Err(_) => {
                // the node is the source of truth again after a failure
                self.nonces.remove(&sender);
            }
        }
        outcome
    }
}

#[async_trait]
impl Stage for Nonce {
    fn name(&self) -> &'static str {
        "nonce"
    }

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        match request.method.as_str() {
            "eth_getTransactionCount" if request.param(1) == Some(&json!("pending")) => {
                self.pending_count(request, next).await
            }
            "eth_sendTransaction" => self.send_transaction(request, session, next).await,
            "eth_blockNumber" => self.block_number(request, next).await,
            _ => next.run(request).await,
        }
    }

    fn reset(&self) {
        self.nonces.clear();
    }
}
