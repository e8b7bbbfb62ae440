mod common;

use common::{init_logger, portis, MemoryHost};
use portis_provider::{stages::Notification, RpcError, RpcRequest};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

const STAGES: [&str; 7] = ["fixture", "cache", "subscriptions", "filters", "nonce", "wallet", "relay"];

#[tokio::test]
async fn responses_carry_request_ids() {
    init_logger();
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let methods = ["eth_mining", "eth_chainId", "eth_fail", "eth_sendTransaction"];
    for (i, method) in methods.iter().enumerate() {
        let id = 900 + i as u64;
        let params = match *method {
            "eth_sendTransaction" => vec![json!({"to": "0xdef"})],
            _ => vec![],
        };
        let resp = provider.request(RpcRequest::with_id(id, *method, params)).await;
        assert_eq!(resp.id, id, "{}", method);
        assert_eq!(resp.jsonrpc, "2.0");
    }
}

#[tokio::test]
async fn fixture_answers_end_the_request() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let resp = provider.request(RpcRequest::new("eth_mining", vec![])).await;
    assert_eq!(resp.result(), Some(&json!(false)));

    let pipeline = provider.pipeline();
    assert_eq!(pipeline.stage_names(), STAGES.to_vec());
    assert_eq!(pipeline.hits("fixture"), 1);
    for later in &STAGES[1..] {
        assert_eq!(pipeline.hits(later), 0, "{} saw the request", later);
    }
    assert_eq!(host.opened(), 0);
}

#[tokio::test]
async fn unknown_methods_reach_the_relay_exactly_once() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let resp = provider.request(RpcRequest::new("eth_protocolVersion", vec![])).await;
    assert_eq!(resp.result(), Some(&Value::Null));
    for stage in STAGES {
        assert_eq!(provider.pipeline().hits(stage), 1, "{}", stage);
    }
    assert_eq!(host.surface.relayed_methods(), vec!["eth_protocolVersion"]);
}

#[tokio::test]
async fn remote_errors_keep_their_code() {
    let host = MemoryHost::new();
    let portis = portis(&host);

    let resp = portis.provider().request(RpcRequest::new("eth_fail", vec![])).await;
    let error = resp.error().unwrap();
    assert_eq!(error.code, -32010);
    assert_eq!(error.message, "scripted failure");
}

#[tokio::test]
async fn cache_only_serves_pinned_reads() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    for _ in 0..2 {
        provider.request(RpcRequest::new("eth_chainId", vec![])).await;
        provider
            .request(RpcRequest::new("eth_getBalance", vec![json!("0xabc"), json!("latest")]))
            .await;
        provider
            .request(RpcRequest::new("eth_getBalance", vec![json!("0xabc"), json!("0x10")]))
            .await;
    }
    assert_eq!(
        host.surface.relayed_methods(),
        vec!["eth_chainId", "eth_getBalance", "eth_getBalance", "eth_getBalance"]
    );
    assert_eq!(provider.pipeline().hits("cache"), 6);
}

#[tokio::test]
async fn gas_estimate_is_a_single_nested_request() {
    let host = MemoryHost::new();
    let portis = portis(&host);

    let tx = json!({"from": "0xabc", "to": "0xdef", "nonce": "0x1", "gasPrice": "0x1"});
    let resp = portis
        .provider()
        .request(RpcRequest::new("eth_signTransaction", vec![tx]))
        .await;

    let signed = resp.result().unwrap();
    assert_eq!(signed["tx"]["gas"], json!("0x7b0c"));
    assert_eq!(signed["tx"]["gasPrice"], json!("0x1"));
    assert_eq!(host.surface.relayed_methods(), vec!["eth_estimateGas"]);
}

#[tokio::test]
async fn send_transaction_fills_signs_and_publishes() {
    let host = MemoryHost::new();
    *host.surface.default_accounts.lock() = vec!["0xabc".to_owned()];
    let portis = portis(&host);
    let provider = portis.provider();

    provider.request(RpcRequest::new("eth_accounts", vec![])).await;
    let resp = provider
        .request(RpcRequest::new("eth_sendTransaction", vec![json!({"to": "0xdef"})]))
        .await;
    assert_eq!(resp.result(), Some(&json!("0xhash-0xsigned0x5")));

    let signed = &host.surface.calls_to("signTransaction")[0][0];
    assert_eq!(signed["from"], json!("0xabc"));
    assert_eq!(signed["gasPrice"], json!(""));
    assert_eq!(signed["nonce"], json!("0x5"));
    assert_eq!(
        host.surface.relayed_methods(),
        vec!["eth_estimateGas", "eth_getTransactionCount", "eth_sendRawTransaction"]
    );
}

#[tokio::test]
async fn concurrent_sends_from_one_sender_get_distinct_nonces() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let tx = json!({"from": "0xabc", "to": "0xdef"});
    let (a, b) = tokio::join!(
        provider.request(RpcRequest::new("eth_sendTransaction", vec![tx.clone()])),
        provider.request(RpcRequest::new("eth_sendTransaction", vec![tx])),
    );
    assert!(a.result().is_some() && b.result().is_some());

    let mut nonces: Vec<Value> = host
        .surface
        .calls_to("signTransaction")
        .into_iter()
        .map(|args| args[0]["nonce"].clone())
        .collect();
    nonces.sort_by_key(|n| n.to_string());
    assert_eq!(nonces, vec![json!("0x5"), json!("0x6")]);

    let counts = host
        .surface
        .relayed_methods()
        .into_iter()
        .filter(|m| m == "eth_getTransactionCount")
        .count();
    assert_eq!(counts, 1);
}

#[tokio::test]
async fn block_filters_report_new_hashes() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let id = provider
        .request(RpcRequest::new("eth_newBlockFilter", vec![]))
        .await
        .into_result()
        .unwrap();
    host.surface.block_number.store(18, Ordering::SeqCst);

    let changes = provider
        .request(RpcRequest::new("eth_getFilterChanges", vec![id.clone()]))
        .await;
    assert_eq!(changes.result(), Some(&json!(["0xblock17", "0xblock18"])));
    let again = provider
        .request(RpcRequest::new("eth_getFilterChanges", vec![id.clone()]))
        .await;
    assert_eq!(again.result(), Some(&json!([])));

    let removed = provider.request(RpcRequest::new("eth_uninstallFilter", vec![id.clone()])).await;
    assert_eq!(removed.result(), Some(&json!(true)));
    let missing = provider.request(RpcRequest::new("eth_getFilterChanges", vec![id])).await;
    assert_eq!(missing.error().map(|e| e.code), Some(RpcError::INVALID_PARAMS));
}

#[tokio::test]
async fn log_filters_query_the_unseen_range() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let id = provider
        .request(RpcRequest::new("eth_newFilter", vec![json!({"address": "0x1"})]))
        .await
        .into_result()
        .unwrap();
    host.surface.block_number.store(20, Ordering::SeqCst);

    let changes = provider.request(RpcRequest::new("eth_getFilterChanges", vec![id])).await;
    assert_eq!(
        changes.result(),
        Some(&json!([{"fromBlock": "0x11", "toBlock": "0x14"}]))
    );
}

#[tokio::test]
async fn pending_filters_report_each_transaction_once() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();

    let id = provider
        .request(RpcRequest::new("eth_newPendingTransactionFilter", vec![]))
        .await
        .into_result()
        .unwrap();
    *host.surface.pending_transactions.lock() = vec!["0xaa".to_owned(), "0xbb".to_owned()];
    let first = provider
        .request(RpcRequest::new("eth_getFilterChanges", vec![id.clone()]))
        .await;
    assert_eq!(first.result(), Some(&json!(["0xaa", "0xbb"])));

    host.surface.pending_transactions.lock().push("0xcc".to_owned());
    let second = provider.request(RpcRequest::new("eth_getFilterChanges", vec![id])).await;
    assert_eq!(second.result(), Some(&json!(["0xcc"])));
}

#[tokio::test]
async fn subscriptions_publish_new_heads() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();
    let mut notifications = provider.notifications();

    let id = provider
        .request(RpcRequest::new("eth_subscribe", vec![json!("newHeads")]))
        .await
        .into_result()
        .unwrap();
    host.surface.block_number.store(17, Ordering::SeqCst);

    assert_eq!(provider.poll_subscriptions().await.unwrap(), 1);
    let notification = notifications.recv().await.unwrap();
    assert_eq!(
        notification,
        Notification {
            subscription: id.as_str().unwrap().to_owned(),
            result: json!({"hash": "0xblock17"}),
        }
    );

    let bad = provider
        .request(RpcRequest::new("eth_subscribe", vec![json!("syncing")]))
        .await;
    assert_eq!(bad.error().map(|e| e.code), Some(RpcError::INVALID_PARAMS));

    let gone = provider.request(RpcRequest::new("eth_unsubscribe", vec![id.clone()])).await;
    assert_eq!(gone.result(), Some(&json!(true)));
    let again = provider.request(RpcRequest::new("eth_unsubscribe", vec![id])).await;
    assert_eq!(again.result(), Some(&json!(false)));
    assert_eq!(provider.poll_subscriptions().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_head_lookups_are_retried_on_the_next_poll() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();
    let mut notifications = provider.notifications();

    let heads = provider
        .request(RpcRequest::new("eth_subscribe", vec![json!("newHeads")]))
        .await
        .into_result()
        .unwrap();
    let pending = provider
        .request(RpcRequest::new("eth_subscribe", vec![json!("newPendingTransactions")]))
        .await
        .into_result()
        .unwrap();
    host.surface.block_number.store(19, Ordering::SeqCst);
    host.surface.failing_hashes.lock().push("0xblock18".to_owned());
    *host.surface.pending_transactions.lock() = vec!["0xaa".to_owned()];

    let first = provider.poll_subscriptions().await;
    assert_eq!(first.unwrap_err().code, -32000);
    assert_eq!(provider.poll_subscriptions().await.unwrap(), 2);

    let mut seen = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        seen.push((notification.subscription, notification.result));
    }
    let heads = heads.as_str().unwrap().to_owned();
    let pending = pending.as_str().unwrap().to_owned();
    let head_hashes: Vec<Value> = seen
        .iter()
        .filter(|(id, _)| *id == heads)
        .map(|(_, block)| block["hash"].clone())
        .collect();
    assert_eq!(head_hashes, vec![json!("0xblock17"), json!("0xblock18"), json!("0xblock19")]);
    // the other subscription was still polled in the failing round
    assert_eq!(seen.iter().filter(|(id, _)| *id == pending).count(), 1);
}

#[tokio::test]
async fn tracked_nonces_refresh_when_the_head_advances() {
    let host = MemoryHost::new();
    let portis = portis(&host);
    let provider = portis.provider();
    let pending_count = || RpcRequest::new("eth_getTransactionCount", vec![json!("0xABC"), json!("pending")]);

    provider.request(RpcRequest::new("eth_blockNumber", vec![])).await;
    let first = provider.request(pending_count()).await;
    assert_eq!(first.result(), Some(&json!("0x5")));

    // submitted outside this provider
    host.surface.transaction_count.store(9, Ordering::SeqCst);
    provider.request(RpcRequest::new("eth_blockNumber", vec![])).await;
    let stale = provider.request(pending_count()).await;
    assert_eq!(stale.result(), Some(&json!("0x5")));

    host.surface.block_number.store(17, Ordering::SeqCst);
    provider.request(RpcRequest::new("eth_blockNumber", vec![])).await;
    let fresh = provider.request(pending_count()).await;
    assert_eq!(fresh.result(), Some(&json!("0x9")));
}
