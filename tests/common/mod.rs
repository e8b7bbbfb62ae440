#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use portis_provider::{
    host::{ContainerHandle, FrameHandle, Host, Layout, ReadyState, Size, Viewport},
    quantity,
    rpc::{Endpoint, MethodTable},
    transport::{pair, Transport},
    Options, Portis, ProviderError,
};
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time::sleep};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A scripted widget: a tiny fake chain behind `relay` and recorded calls for
/// everything else.
pub struct Surface {
    pub calls: Mutex<Vec<(String, Vec<Value>)>>,
    pub relayed: Mutex<Vec<Value>>,
    pub accounts: Mutex<VecDeque<(Duration, Vec<String>)>>,
    pub default_accounts: Mutex<Vec<String>>,
    pub accounts_error: Mutex<Option<Value>>,
    pub block_number: AtomicU64,
    pub transaction_count: AtomicU64,
    pub pending_transactions: Mutex<Vec<String>>,
    /// Block hashes whose next lookup fails once.
    pub failing_hashes: Mutex<Vec<String>>,
    pub omit: Mutex<Option<&'static str>>,
    pub endpoint: Mutex<Option<Endpoint>>,
}

impl Surface {
    pub fn new() -> Arc<Self> {
        Arc::new(Surface {
            calls: Mutex::new(Vec::new()),
            relayed: Mutex::new(Vec::new()),
            accounts: Mutex::new(VecDeque::new()),
            default_accounts: Mutex::new(Vec::new()),
            accounts_error: Mutex::new(None),
            block_number: AtomicU64::new(16),
            transaction_count: AtomicU64::new(5),
            pending_transactions: Mutex::new(Vec::new()),
            failing_hashes: Mutex::new(Vec::new()),
            omit: Mutex::new(None),
            endpoint: Mutex::new(None),
        })
    }

    /// Methods relayed to the fake chain, in arrival order.
    pub fn relayed_methods(&self) -> Vec<String> {
        self.relayed
            .lock()
            .iter()
            .filter_map(|payload| payload.get("method").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    fn record(&self, method: &str, args: &[Value]) {
        self.calls.lock().push((method.to_owned(), args.to_vec()));
    }

    fn chain(&self, payload: &Value) -> Value {
        let method = payload.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = payload.get("params").cloned().unwrap_or_else(|| json!([]));
        let block = self.block_number.load(Ordering::SeqCst);

        if method == "eth_getBlockByHash" {
            let mut failing = self.failing_hashes.lock();
            if let Some(at) = failing.iter().position(|hash| params[0] == json!(hash)) {
                failing.remove(at);
                return json!({"error": {"code": -32000, "message": "header not found"}});
            }
        }

        let result = match method {
            "eth_blockNumber" => json!(quantity::to_hex(block)),
            "eth_chainId" => json!("0x1"),
            "eth_gasPrice" => json!("0x3b9aca00"),
            "eth_estimateGas" => json!("0x5208"),
            "eth_getBalance" => json!("0x64"),
            "eth_getTransactionCount" => json!(quantity::to_hex(self.transaction_count.load(Ordering::SeqCst))),
            "eth_getBlockByNumber" if params[0] == json!("pending") => {
                json!({"transactions": *self.pending_transactions.lock()})
            }
            "eth_getBlockByNumber" => {
                let number = quantity::parse(&params[0]).unwrap_or_default();
                json!({"number": quantity::to_hex(number), "hash": format!("0xblock{}", number)})
            }
            "eth_getBlockByHash" => json!({"hash": params[0]}),
            "eth_getLogs" => json!([{"fromBlock": params[0]["fromBlock"], "toBlock": params[0]["toBlock"]}]),
            "eth_sendRawTransaction" => json!(format!("0xhash-{}", params[0].as_str().unwrap_or_default())),
            "eth_fail" => return json!({"error": {"code": -32010, "message": "scripted failure"}}),
            _ => Value::Null,
        };
        json!({"result": result})
    }

    /// Calls one of the host's exported methods from the widget side.
    pub async fn call_host(&self, method: &str, args: Vec<Value>) -> Result<Value, ProviderError> {
        let endpoint = self.endpoint.lock().clone().ok_or(ProviderError::ChannelClosed)?;
        endpoint.call(method, args).await
    }
}

fn surface_methods(surface: &Arc<Surface>) -> MethodTable {
    let omit = *surface.omit.lock();
    let owner = surface;
    let mut table = MethodTable::new();

    let surface = owner.clone();
    table = table.method("getAccounts", move |args| {
        // scripted replies are taken in call order, before any delay
        surface.record("getAccounts", &args);
        let error = surface.accounts_error.lock().clone();
        let scripted = surface.accounts.lock().pop_front();
        let (delay, accounts) =
            scripted.unwrap_or_else(|| (Duration::ZERO, surface.default_accounts.lock().clone()));
        async move {
            if let Some(error) = error {
                return Ok(json!({"error": error}));
            }
            sleep(delay).await;
            Ok::<_, String>(json!({"result": accounts}))
        }
    });

    let surface = owner.clone();
    table = table.sync("signTransaction", move |args| {
        surface.record("signTransaction", &args);
        let tx = args.first().cloned().unwrap_or(Value::Null);
        let raw = format!("0xsigned{}", tx["nonce"].as_str().unwrap_or_default());
        Ok(json!({"result": {"raw": raw, "tx": tx}}))
    });

    let surface = owner.clone();
    table = table.sync("signMessage", move |args| {
        surface.record("signMessage", &args);
        Ok(json!({"result": "0xsignature"}))
    });

    let surface = owner.clone();
    table = table.sync("relay", move |args| {
        surface.record("relay", &args);
        let payload = args.first().cloned().unwrap_or(Value::Null);
        surface.relayed.lock().push(payload.clone());
        Ok(surface.chain(&payload))
    });

    let surface = owner.clone();
    table = table.sync("showPortis", move |args| {
        surface.record("showPortis", &args);
        Ok(json!({"result": null}))
    });

    let surface = owner.clone();
    table = table.method("login", move |args| {
        let surface = surface.clone();
        async move {
            surface.record("login", &args);
            let endpoint = surface.endpoint.lock().clone();
            if let Some(endpoint) = endpoint {
                endpoint
                    .call("onLogin", vec![json!("0xABC"), json!("user@example.com")])
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Ok::<_, String>(json!({"result": null}))
        }
    });

    match omit {
        Some(name) => {
            let mut trimmed = MethodTable::new();
            for kept in table.names().into_iter().filter(|n| n != name) {
                let surface = owner.clone();
                let kept_name = kept.clone();
                trimmed = trimmed.sync(&kept, move |args| {
                    surface.record(&kept_name, &args);
                    Ok(json!({"result": null}))
                });
            }
            trimmed
        }
        None => table,
    }
}

/// A headless document whose widget frame is backed by a [`Surface`].
pub struct MemoryHost {
    pub layout: Layout,
    pub surface: Arc<Surface>,
    pub viewport: Mutex<Viewport>,
    pub ready: watch::Sender<ReadyState>,
    pub opened: AtomicUsize,
    pub failing_opens: AtomicUsize,
    pub open_delay: Mutex<Duration>,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Self::with_surface(Surface::new())
    }

    pub fn with_surface(surface: Arc<Surface>) -> Arc<Self> {
        let (ready, _) = watch::channel(ReadyState::Complete);
        Arc::new(MemoryHost {
            layout: Layout::default(),
            surface,
            viewport: Mutex::new(Viewport {
                window: Some(Size::new(1280, 720)),
                ..Viewport::default()
            }),
            ready,
            opened: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn ready_state(&self) -> ReadyState {
        *self.ready.borrow()
    }

    async fn document_ready(&self) {
        let mut state = self.ready.subscribe();
        while *state.borrow_and_update() < ReadyState::Interactive {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    fn create_container(&self) -> Result<ContainerHandle, ProviderError> {
        Ok(self.layout.create_container())
    }

    fn create_frame(&self, container: ContainerHandle, src: &str) -> Result<FrameHandle, ProviderError> {
        self.layout
            .create_frame(container, src)
            .ok_or_else(|| ProviderError::Handshake("no container".to_owned()))
    }

    fn attach(&self, container: ContainerHandle) -> Result<(), ProviderError> {
        match self.layout.attach(container) {
            true => Ok(()),
            false => Err(ProviderError::Handshake("no container".to_owned())),
        }
    }

    fn remove_container(&self, container: ContainerHandle) {
        self.layout.remove(container);
    }

    fn set_container_height(&self, container: ContainerHandle, height: u32) {
        self.layout.set_height(container, height);
    }

    fn viewport(&self) -> Viewport {
        *self.viewport.lock()
    }

    async fn open_channel(&self, _frame: &FrameHandle) -> Result<Box<dyn Transport>, ProviderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        sleep(delay).await;

        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(ProviderError::Handshake("scripted open failure".to_owned()));
        }

        let (host_end, surface_end) = pair();
        let surface = self.surface.clone();
        let methods = surface_methods(&surface);
        tokio::spawn(async move {
            if let Ok(endpoint) = Endpoint::accept(Box::new(surface_end), methods).await {
                *surface.endpoint.lock() = Some(endpoint);
            }
        });
        Ok(Box::new(host_end))
    }
}

pub fn portis(host: &Arc<MemoryHost>) -> Portis {
    Portis::new("test-dapp", "mainnet", Options::default(), host.clone()).unwrap()
}
