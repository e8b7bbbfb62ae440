//! Logical filters emulated on top of plain block and log queries.
//!
//! Each filter remembers the last block it reported; `eth_getFilterChanges`
//! asks the node for the current head and returns whatever appeared since.

use crate::{
    pipeline::{Next, Outcome, PipelineHandle, Session, Stage},
    quantity,
    types::{RpcError, RpcRequest},
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use serde_json::{json, Value};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

#[derive(Debug)]
enum Filter {
    Block { last_block: u64 },
    Log { criteria: Value, next_block: u64 },
    Pending { seen: HashSet<String> },
}

#[derive(Default)]
pub struct Filters {
    pipeline: PipelineHandle,
    next_id: AtomicU64,
    filters: DashMap<String, Arc<Mutex<Filter>>>,
}

impl Filters {
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn install(&self, filter: Filter) -> Value {
        let id = quantity::to_hex(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!("Installed filter {} {:?}", id, filter);
        self.filters.insert(id.clone(), Arc::new(Mutex::new(filter)));
        json!(id)
    }

    fn lookup(&self, request: &RpcRequest) -> Result<Arc<Mutex<Filter>>, RpcError> {
        let id = request
            .param(0)
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("expected a filter id"))?;
        self.filters
            .get(id)
            .map(|filter| filter.value().clone())
            .ok_or_else(|| RpcError::invalid_params(format!("filter {} not found", id)))
    }

    async fn block_number(&self, session: &Arc<Session>) -> Result<u64, RpcError> {
        let head = self.pipeline.request(session, "eth_blockNumber", vec![]).await?;
        quantity::parse(&head).ok_or_else(|| RpcError::internal(format!("bad block number {}", head)))
    }

    async fn new_log_filter(&self, request: &RpcRequest, session: &Arc<Session>) -> Outcome {
        let criteria = request.param(0).cloned().unwrap_or_else(|| json!({}));
        let next_block = match criteria.get("fromBlock").filter(|b| quantity::is_block_number(b)) {
            Some(from) => quantity::parse(from).unwrap_or_default(),
            None => self.block_number(session).await? + 1,
        };
        Ok(self.install(Filter::Log { criteria, next_block }))
    }

    async fn changes(&self, filter: &mut Filter, session: &Arc<Session>) -> Outcome {
        match filter {
            Filter::Block { last_block } => {
                let head = self.block_number(session).await?;
                let mut hashes = Vec::new();
                for number in *last_block + 1..=head {
                    let block = self
                        .pipeline
                        .request(session, "eth_getBlockByNumber", vec![json!(quantity::to_hex(number)), json!(false)])
                        .await?;
                    if let Some(hash) = block.get("hash") {
                        hashes.push(hash.clone());
                    }
                }
                *last_block = head.max(*last_block);
                Ok(Value::Array(hashes))
            }
            Filter::Log { criteria, next_block } => {
                let head = self.block_number(session).await?;
                if *next_block > head {
                    return Ok(json!([]));
                }
                let mut query = criteria.clone();
                if let Some(fields) = query.as_object_mut() {
                    fields.insert("fromBlock".to_owned(), json!(quantity::to_hex(*next_block)));
                    fields.insert("toBlock".to_owned(), json!(quantity::to_hex(head)));
                }
                let logs = self.pipeline.request(session, "eth_getLogs", vec![query]).await?;
                *next_block = head + 1;
                Ok(logs)
            }
            Filter::Pending { seen } => {
                let block = self
                    .pipeline
                    .request(session, "eth_getBlockByNumber", vec![json!("pending"), json!(false)])
                    .await?;
                let current: HashSet<String> = block
                    .get("transactions")
                    .and_then(Value::as_array)
                    .map(|txs| txs.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                    .unwrap_or_default();
                let mut fresh: Vec<&String> = current.difference(seen).collect();
                fresh.sort();
                let fresh = json!(fresh);
                *seen = current;
                Ok(fresh)
            }
        }
    }
}

#[async_trait]
impl Stage for Filters {
    fn name(&self) -> &'static str {
        "filters"
    }

    fn attach(&mut self, pipeline: PipelineHandle) {
        self.pipeline = pipeline;
    }

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        match request.method.as_str() {
            "eth_newBlockFilter" => {
                let last_block = self.block_number(session).await?;
                Ok(self.install(Filter::Block { last_block }))
            }
            "eth_newPendingTransactionFilter" => Ok(self.install(Filter::Pending {
                seen: HashSet::new(),
            })),
            "eth_newFilter" => self.new_log_filter(&request, session).await,
            "eth_getFilterChanges" => {
                let filter = self.lookup(&request)?;
                let mut filter = filter.lock().await;
                self.changes(&mut filter, session).await
            }
            "eth_getFilterLogs" => {
                let filter = self.lookup(&request)?;
                let criteria = match &*filter.lock().await {
                    Filter::Log { criteria, .. } => criteria.clone(),
                    _ => return Err(RpcError::invalid_params("not a log filter")),
                };
                self.pipeline.request(session, "eth_getLogs", vec![criteria]).await
            }
            "eth_uninstallFilter" => {
                let removed = request
                    .param(0)
                    .and_then(Value::as_str)
                    .map_or(false, |id| self.filters.remove(id).is_some());
                Ok(json!(removed))
            }
            _ => next.run(request).await,
        }
    }

    fn reset(&self) {
        self.filters.clear();
    }
}
