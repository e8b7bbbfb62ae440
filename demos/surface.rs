use anyhow::Error;
use fehler::throws;
use portis_provider::{
    ipc::IpcListener,
    rpc::{Endpoint, MethodTable},
};
use serde_json::{json, Value};

const ACCOUNT: &str = "0x90f8bf6a479f320ead074411a4b0e7944ea8c9c1";

fn widget_methods() -> MethodTable {
    MethodTable::new()
        .sync("getAccounts", |_| Ok(json!({ "result": [ACCOUNT] })))
        .sync("signTransaction", |args| {
            let tx = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!({"result": {"raw": "0xf86c0a8502540be400", "tx": tx}}))
        })
        .sync("signMessage", |_| Ok(json!({"result": "0x5c4a6c"})))
        .sync("relay", |args| {
            let method = args.first().and_then(|p| p["method"].as_str()).unwrap_or_default();
            let result = match method {
                "eth_blockNumber" => json!("0x10d4f"),
                "eth_chainId" => json!("0x1"),
                _ => Value::Null,
            };
            println!("relay {} -> {}", method, result);
            Ok(json!({ "result": result }))
        })
        .sync("showPortis", |_| Ok(json!({"result": null})))
        .sync("login", |_| Ok(json!({"result": null})))
}

#[allow(unreachable_code)]
#[throws(Error)]
#[tokio::main]
async fn main() {
    env_logger::init();
    let listener = IpcListener::bind("/tmp/portis-widget.sock")?;
    let mut sessions = vec![];

    loop {
        let transport = listener.accept().await?;
        let endpoint = Endpoint::accept(Box::new(transport), widget_methods()).await?;
        println!("Host connected, exposing {:?}", endpoint.remote_methods());
        sessions.push(endpoint);
    }
}
