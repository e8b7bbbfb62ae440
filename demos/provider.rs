use anyhow::Error;
use fehler::throws;
use portis_provider::{host::IpcHost, Options, Portis, RpcRequest, Size};
use std::sync::Arc;

#[throws(Error)]
#[tokio::main]
async fn main() {
    env_logger::init();
    let host = Arc::new(IpcHost::new("/tmp/portis-widget.sock", Size::new(1280, 720)));
    let portis = Portis::new("demo-dapp", "mainnet", Options::default().with_scope(["email"]), host)?;
    portis.on_login(|address, email| println!("Logged in as {} ({:?})", address, email));

    let provider = portis.provider();
    let accounts = provider.enable().await?;
    println!("Accounts: {}", accounts);

    let block = provider.request(RpcRequest::new("eth_blockNumber", vec![])).await;
    println!("Block: {}", serde_json::to_string(&block)?);

    let version = provider.request(RpcRequest::new("web3_clientVersion", vec![])).await;
    println!("Client: {}", serde_json::to_string(&version)?);
}
