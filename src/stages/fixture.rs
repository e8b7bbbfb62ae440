use crate::{
    config::SDK_VERSION,
    pipeline::{Next, Outcome, Session, Stage},
    types::RpcRequest,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Fixed answers to node introspection calls that make no sense to relay.
#[derive(Debug, Default)]
pub struct Fixture;

impl Fixture {
    fn answer(method: &str) -> Option<Value> {
        let answer = match method {
            "web3_clientVersion" => json!(format!("PortisProvider/v{}/rust", SDK_VERSION)),
            "net_listening" => json!(true),
            "eth_hashrate" => json!("0x00"),
            "eth_mining" => json!(false),
            "eth_syncing" => json!(true),
            _ => return None,
        };
        Some(answer)
    }
}

#[async_trait]
impl Stage for Fixture {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn handle(&self, request: RpcRequest, _: &Arc<Session>, next: Next<'_>) -> Outcome {
        match Self::answer(&request.method) {
            Some(answer) => Ok(answer),
            None => next.run(request).await,
        }
    }
}
