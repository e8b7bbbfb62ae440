//! Account and signing methods, answered by the widget.
//!
//! Transactions get their missing `gas`, `gasPrice` and `nonce` filled before
//! they are signed. Gas comes from a single nested `eth_estimateGas` padded by
//! half again, capped at [`GAS_CAP`] unless the node's own estimate is higher.
//! The gas price is left as an empty placeholder for the widget to settle.
//! Signed transactions are published through a nested
//! `eth_sendRawTransaction`, so they pass through the rest of the pipeline.

use crate::{
    pipeline::{Next, Outcome, PipelineHandle, Session, Stage},
    quantity,
    types::{RpcError, RpcRequest},
    widget::{MessageStandard, WidgetChannel},
};
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const GAS_CAP: u64 = 8_000_000;

/// Pads a node estimate without going past the cap, or below the estimate.
pub fn padded_gas(estimate: u64) -> u64 {
    let padded = estimate.saturating_add(estimate / 2);
    padded.min(GAS_CAP.max(estimate))
}

pub struct HookedWallet {
    widget: Arc<WidgetChannel>,
    pipeline: PipelineHandle,
}

impl HookedWallet {
    pub fn new(widget: Arc<WidgetChannel>) -> Self {
        HookedWallet {
            widget,
            pipeline: PipelineHandle::default(),
        }
    }

    async fn accounts(&self, session: &Arc<Session>) -> Result<Vec<String>, RpcError> {
        let accounts = self.widget.get_accounts().await?;
        if let Some(first) = accounts.first() {
            session.set_selected_address(first.as_str());
        }
        Ok(accounts)
    }

    /// Exactly one nested `eth_estimateGas`.
    pub async fn estimate_gas(&self, session: &Arc<Session>, tx: &Map<String, Value>) -> Result<String, RpcError> {
        let mut query = tx.clone();
        query.remove("gas");
        let estimate = self
            .pipeline
            .request(session, "eth_estimateGas", vec![Value::Object(query)])
            .await?;
        let estimate = quantity::parse(&estimate)
            .ok_or_else(|| RpcError::internal(format!("bad gas estimate {}", estimate)))?;
        Ok(quantity::to_hex(padded_gas(estimate)))
    }

    async fn fill_transaction(&self, session: &Arc<Session>, tx: &mut Map<String, Value>) -> Result<(), RpcError> {
        if !tx.contains_key("gas") {
            let gas = self.estimate_gas(session, tx).await?;
            tx.insert("gas".to_owned(), json!(gas));
        }
        if !tx.contains_key("gasPrice") {
            tx.insert("gasPrice".to_owned(), json!(""));
        }
        if !tx.contains_key("nonce") {
            let from = tx.get("from").cloned().unwrap_or(Value::Null);
            let nonce = self
                .pipeline
                .request(session, "eth_getTransactionCount", vec![from, json!("pending")])
                .await?;
            tx.insert("nonce".to_owned(), nonce);
        }
        Ok(())
    }

    fn transaction(request: &RpcRequest) -> Result<Map<String, Value>, RpcError> {
        match request.param(0) {
            Some(Value::Object(tx)) => Ok(tx.clone()),
            _ => Err(RpcError::invalid_params(format!("{} expects a transaction object", request.method))),
        }
    }

    async fn sign_transaction(&self, request: &RpcRequest, session: &Arc<Session>) -> Outcome {
        let mut tx = Self::transaction(request)?;
        self.fill_transaction(session, &mut tx).await?;
        Ok(self.widget.sign_transaction(Value::Object(tx)).await?)
    }

    async fn send_transaction(&self, request: &RpcRequest, session: &Arc<Session>) -> Outcome {
        let mut tx = Self::transaction(request)?;
        if !tx.contains_key("from") {
            let from = session
                .selected_address()
                .ok_or_else(|| RpcError::invalid_params("no sender and no selected address"))?;
            tx.insert("from".to_owned(), json!(from));
        }
        self.fill_transaction(session, &mut tx).await?;

        let signed = self.widget.sign_transaction(Value::Object(tx)).await?;
        let raw = match &signed {
            Value::String(_) => signed.clone(),
            Value::Object(fields) => fields.get("raw").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if raw.is_null() {
            return Err(RpcError::internal(format!("widget returned no raw transaction: {}", signed)));
        }
        debug!("Publishing signed transaction");
        self.pipeline
            .request(session, "eth_sendRawTransaction", vec![raw])
            .await
    }

    async fn sign_message(&self, request: &RpcRequest, standard: MessageStandard) -> Outcome {
        let param = |i: usize| request.param(i).cloned().unwrap_or(Value::Null);
        let mut msg = match request.method.as_str() {
            "eth_sign" => json!({"from": param(0), "data": param(1)}),
            "personal_sign" => json!({"from": param(1), "data": param(0)}),
            "eth_signTypedData" => json!({"from": param(1), "data": param(0), "version": "V1"}),
            "eth_signTypedData_v3" => json!({"from": param(0), "data": param(1), "version": "V3"}),
            _ => json!({"from": param(0), "data": param(1), "version": "V4"}),
        };
        if let Some(fields) = msg.as_object_mut() {
            if let Some(extra) = request.param(2).and_then(Value::as_object) {
                for (k, v) in extra {
                    fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        Ok(self.widget.sign_message(msg, standard).await?)
    }
}

#[async_trait]
impl Stage for HookedWallet {
    fn name(&self) -> &'static str {
        "wallet"
    }

    fn attach(&mut self, pipeline: PipelineHandle) {
        self.pipeline = pipeline;
    }

    async fn handle(&self, request: RpcRequest, session: &Arc<Session>, next: Next<'_>) -> Outcome {
        match request.method.as_str() {
            "eth_accounts" | "eth_requestAccounts" => Ok(json!(self.accounts(session).await?)),
            "eth_coinbase" => Ok(self.accounts(session).await?.first().map_or(Value::Null, |a| json!(a))),
            "eth_sendTransaction" => self.send_transaction(&request, session).await,
            "eth_signTransaction" => self.sign_transaction(&request, session).await,
            "eth_sign" => self.sign_message(&request, MessageStandard::SignMessage).await,
            "personal_sign" => self.sign_message(&request, MessageStandard::SignPersonalMessage).await,
            "eth_signTypedData" | "eth_signTypedData_v3" | "eth_signTypedData_v4" => {
                self.sign_message(&request, MessageStandard::SignTypedMessage).await
            }
            _ => next.run(request).await,
        }
    }
}
