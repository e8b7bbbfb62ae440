use crate::{
    pipeline::{Next, Outcome, Session, Stage},
    quantity,
    types::RpcRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// The answer can never change.
    Perma,
    /// Cacheable when the parameter at this index names a specific block.
    Block(usize),
}

fn strategy(method: &str) -> Option<Strategy> {
    use Strategy::*;

    let strategy = match method {
        "web3_sha3"
        | "eth_chainId"
        | "net_version"
        | "eth_getBlockByHash"
        | "eth_getBlockTransactionCountByHash"
        | "eth_getUncleCountByBlockHash"
        | "eth_getUncleByBlockHashAndIndex"
        | "eth_getTransactionByBlockHashAndIndex"
        | "eth_getTransactionByHash"
        | "eth_getTransactionReceipt" => Perma,
        "eth_getBlockByNumber"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber"
        | "eth_getUncleByBlockNumberAndIndex"
        | "eth_getTransactionByBlockNumberAndIndex" => Block(0),
        "eth_getBalance" | "eth_getCode" | "eth_getTransactionCount" | "eth_call" => Block(1),
        "eth_getStorageAt" => Block(2),
        _ => return None,
    };
    Some(strategy)
}

/// Whether a successful result may be stored. Null never is, and a
/// transaction only once it has been mined.
fn storable(method: &str, result: &Value) -> bool {
    match method {
        _ if result.is_null() => false,
        "eth_getTransactionByHash" => result.get("blockHash").map_or(false, |h| !h.is_null()),
        _ => true,
    }
}

/// Remembers results of idempotent reads, keyed per network endpoint.
#[derive(Debug, Default)]
pub struct Cache {
    entries: DashMap<String, Value>,
}

impl Cache {
    fn key(network: &str, request: &RpcRequest) -> Option<String> {
        match strategy(&request.method)? {
            Strategy::Perma => {}
            Strategy::Block(index) => {
                // an omitted block parameter means "latest"
                if !request.param(index).map_or(false, quantity::is_block_number) {
                    return None;
                }
            }
        }
        let params = serde_json::to_string(&request.params).ok()?;
        Some(format!("{}|{}:{}", network, request.method, params))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Stage for Cache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        let network = session.config().network().endpoint_url;
        let key = match Self::key(&network, &request) {
            Some(key) => key,
            None => return next.run(request).await,
        };
        if let Some(hit) = self.entries.get(&key) {
            trace!("Cache hit {}", key);
            return Ok(hit.value().clone());
        }

        let method = request.method.clone();
        let result = next.run(request).await?;
        if storable(&method, &result) {
            self.entries.insert(key, result.clone());
        }
        Ok(result)
    }

    fn reset(&self) {
        self.entries.clear();
    }
}
