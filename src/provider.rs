//! The caller-facing entry points.
//!
//! Async callers use [`Provider::request`] and friends. [`Provider::send_sync`]
//! only serves the few methods it can answer from local state, since there is
//! no way to hand back a later result without a callback.

use crate::{
    errors::ProviderError::{self, *},
    pipeline::{Pipeline, Session},
    stages::{Notification, Subscriptions},
    types::{RpcError, RpcRequest, RpcResponse},
};
use fehler::{throw, throws};
use futures::future::join_all;
use log::{debug, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::broadcast};

pub struct Provider {
    pipeline: Arc<Pipeline>,
    session: Arc<Session>,
    subscriptions: Subscriptions,
    runtime: Option<Handle>,
}

impl Provider {
    /// Captures the current Tokio runtime, if any, for [`Provider::send_async`].
    pub fn new(pipeline: Arc<Pipeline>, session: Arc<Session>, subscriptions: Subscriptions) -> Self {
        Provider {
            pipeline,
            session,
            subscriptions,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn selected_address(&self) -> Option<String> {
        self.session.selected_address()
    }

    pub async fn request(&self, request: RpcRequest) -> RpcResponse {
        self.pipeline.handle(&self.session, request).await
    }

    /// Runs the requests concurrently; responses come back in request order.
    pub async fn request_batch(&self, requests: Vec<RpcRequest>) -> Vec<RpcResponse> {
        join_all(requests.into_iter().map(|request| self.request(request))).await
    }

    #[throws(ProviderError)]
    fn runtime(&self) -> Handle {
        match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|e| NoRuntime(e.to_string()))?,
        }
    }

    /// Runs the request in the background and hands the response to `callback`.
    #[throws(ProviderError)]
    pub fn send_async<F>(&self, request: RpcRequest, callback: F)
    where
        F: FnOnce(RpcResponse) + Send + 'static,
    {
        let pipeline = self.pipeline.clone();
        let session = self.session.clone();
        self.runtime()?.spawn(async move {
            let response = pipeline.handle(&session, request).await;
            callback(response);
        });
    }

    /// Answers the allow-listed methods immediately. Anything else fails
    /// without touching the pipeline.
    #[throws(ProviderError)]
    pub fn send_sync(&self, request: RpcRequest) -> RpcResponse {
        let result = match request.method.as_str() {
            "eth_accounts" => json!(self.selected_address().into_iter().collect::<Vec<_>>()),
            "eth_coinbase" => self.selected_address().map_or(Value::Null, Value::String),
            "net_version" => self.session.config().chain_id().map_or(Value::Null, Value::String),
            "eth_uninstallFilter" => {
                self.send_async(request.clone(), |response| {
                    if let Some(e) = response.error() {
                        warn!("Background filter uninstall failed: {}", e);
                    }
                })?;
                json!(true)
            }
            other => throw!(UnsupportedSyncMethod(other.to_owned())),
        };
        debug!("Answered {} synchronously", request.method);
        RpcResponse::new(request.id, request.jsonrpc, Ok(result))
    }

    /// Asks for the user's accounts. Resolves to the raw result, or fails
    /// with the raw error object of the response.
    pub async fn enable(&self) -> Result<Value, RpcError> {
        self.request(RpcRequest::new("eth_accounts", vec![]))
            .await
            .into_result()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.subscriptions.notifications()
    }

    /// Polls every active subscription once.
    pub async fn poll_subscriptions(&self) -> Result<usize, RpcError> {
        self.subscriptions.poll(&self.session).await
    }
}
