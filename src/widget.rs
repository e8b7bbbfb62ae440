use crate::{
    config::{ConfigHandle, WIDGET_URL},
    errors::ProviderError::{self, *},
    host::{ContainerHandle, FrameHandle, Host, ReadyState},
    rpc::{Endpoint, MethodTable},
    types::RpcRequest,
};
use fehler::{throw, throws};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{mem, sync::Arc};
use tokio::sync::oneshot;

/// Everything the widget has to expose for the provider to work.
pub const REMOTE_METHODS: [&str; 6] = [
    "getAccounts",
    "signTransaction",
    "signMessage",
    "relay",
    "showPortis",
    "login",
];

pub type LoginCallback = Box<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Selects the signing algorithm behind the widget's single `signMessage` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStandard {
    SignMessage,
    SignPersonalMessage,
    SignTypedMessage,
}

pub struct WidgetSession {
    endpoint: Endpoint,
    frame: FrameHandle,
    container: ContainerHandle,
}

impl WidgetSession {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn frame(&self) -> &FrameHandle {
        &self.frame
    }

    pub fn container(&self) -> ContainerHandle {
        self.container
    }
}

type Waiter = oneshot::Sender<Result<Arc<WidgetSession>, String>>;

enum InitState {
    Uninitialized,
    Initializing(Vec<Waiter>),
    Ready(Arc<WidgetSession>),
}

/// `{error, result}` as every widget method replies.
#[derive(Debug, Default, Deserialize)]
struct RemoteReply {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Value,
}

pub struct WidgetChannel {
    host: Arc<dyn Host>,
    config: ConfigHandle,
    state: Mutex<InitState>,
    login_callback: Arc<Mutex<Option<LoginCallback>>>,
}

impl WidgetChannel {
    pub fn new(host: Arc<dyn Host>, config: ConfigHandle) -> Self {
        WidgetChannel {
            host,
            config,
            state: Mutex::new(InitState::Uninitialized),
            login_callback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), InitState::Ready(_))
    }

    /// Registers the callback the widget triggers through `onLogin`.
    pub fn on_login<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        *self.login_callback.lock() = Some(Box::new(callback));
    }

    /// The one widget session, created by whichever caller gets here first.
    /// Callers arriving while the handshake runs wait for its outcome.
    pub async fn session(&self) -> Result<Arc<WidgetSession>, ProviderError> {
        let waiting = {
            let mut state = self.state.lock();
            match &mut *state {
                InitState::Ready(session) => return Ok(session.clone()),
                InitState::Initializing(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                InitState::Uninitialized => {
                    *state = InitState::Initializing(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiting {
            return match rx.await {
                Ok(outcome) => outcome.map_err(Handshake),
                Err(_) => Err(Handshake("handshake abandoned".to_owned())),
            };
        }

        let guard = InitGuard { channel: self };
        let outcome = self.handshake().await.map(Arc::new);
        guard.finish(&outcome);
        outcome
    }

    #[throws(ProviderError)]
    async fn handshake(&self) -> WidgetSession {
        if self.host.ready_state() < ReadyState::Interactive {
            debug!("Waiting for the host document before creating the widget");
            self.host.document_ready().await;
        }

        let container = self.host.create_container()?;
        let placement = Placement {
            host: &*self.host,
            container,
        };
        let frame = self.host.create_frame(container, WIDGET_URL)?;
        self.host.attach(container)?;

        let transport = self.host.open_channel(&frame).await?;
        let endpoint = Endpoint::connect(transport, self.local_methods(container)).await?;
        if let Some(missing) = REMOTE_METHODS.iter().find(|m| !endpoint.exposes(m)) {
            throw!(MissingRemoteMethod((*missing).to_owned()))
        }
        info!("Widget session established in frame {}", frame.id);
        placement.keep();

        WidgetSession {
            endpoint,
            frame,
            container,
        }
    }

    fn local_methods(&self, container: ContainerHandle) -> MethodTable {
        let resize = self.host.clone();
        let viewport = self.host.clone();
        let login = self.login_callback.clone();

        MethodTable::new()
            .sync("setHeight", move |args| {
                let height = args
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or("setHeight expects a pixel height")?;
                resize.set_container_height(container, height.max(0.0).round() as u32);
                Ok(Value::Null)
            })
            .sync("getWindowSize", move |_| {
                serde_json::to_value(viewport.viewport().resolve()).map_err(|e| e.to_string())
            })
            .sync("onLogin", move |args| {
                let address = args.first().and_then(Value::as_str).unwrap_or_default();
                let email = args.get(1).and_then(Value::as_str);
                if let Some(callback) = login.lock().as_ref() {
                    callback(address, email);
                }
                Ok(Value::Null)
            })
    }

    /// Calls a widget method with the current config appended and unpacks
    /// the `{error, result}` reply.
    #[throws(ProviderError)]
    async fn invoke(&self, method: &str, mut args: Vec<Value>) -> Value {
        let session = self.session().await?;
        args.push(serde_json::to_value(self.config.snapshot())?);

        let reply = session.endpoint.call(method, args).await?;
        let reply: RemoteReply = match reply {
            Value::Null => RemoteReply::default(),
            reply => serde_json::from_value(reply)?,
        };
        match reply.error {
            Some(error) if !error.is_null() => throw!(Remote(error)),
            _ => reply.result,
        }
    }

    #[throws(ProviderError)]
    pub async fn get_accounts(&self) -> Vec<String> {
        match self.invoke("getAccounts", vec![]).await? {
            Value::Null => Vec::new(),
            accounts => serde_json::from_value(accounts)?,
        }
    }

    #[throws(ProviderError)]
    pub async fn sign_transaction(&self, tx: Value) -> Value {
        self.invoke("signTransaction", vec![tx]).await?
    }

    #[throws(ProviderError)]
    pub async fn sign_message(&self, msg: Value, standard: MessageStandard) -> Value {
        let mut fields = match msg {
            Value::Object(fields) => fields,
            other => {
                warn!("Wrapping non-object message params for {:?}", standard);
                let mut fields = Map::new();
                fields.insert("data".to_owned(), other);
                fields
            }
        };
        fields.insert("messageStandard".to_owned(), serde_json::to_value(standard)?);
        self.invoke("signMessage", vec![Value::Object(fields)]).await?
    }

    #[throws(ProviderError)]
    pub async fn relay(&self, payload: &RpcRequest) -> Value {
        self.invoke("relay", vec![serde_json::to_value(payload)?]).await?
    }

    #[throws(ProviderError)]
    pub async fn show_portis(&self) {
        self.invoke("showPortis", vec![]).await?;
    }

    #[throws(ProviderError)]
    pub async fn login(&self) {
        self.invoke("login", vec![]).await?;
    }
}

/// Removes a half-built widget container unless the handshake completes.
struct Placement<'a> {
    host: &'a dyn Host,
    container: ContainerHandle,
}

impl Placement<'_> {
    fn keep(self) {
        mem::forget(self);
    }
}

impl Drop for Placement<'_> {
    fn drop(&mut self) {
        debug!("Removing widget container {}", self.container.0);
        self.host.remove_container(self.container);
    }
}

/// Settles the init state machine even if the driving future is dropped.
struct InitGuard<'a> {
    channel: &'a WidgetChannel,
}

impl InitGuard<'_> {
    fn finish(self, outcome: &Result<Arc<WidgetSession>, ProviderError>) {
        let next = match outcome {
            Ok(session) => InitState::Ready(session.clone()),
            Err(e) => {
                warn!("Widget handshake failed: {}", e);
                InitState::Uninitialized
            }
        };
        let waiters = self.take_waiters(next);
        for waiter in waiters {
            let shared = match outcome {
                Ok(session) => Ok(session.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = waiter.send(shared);
        }
        mem::forget(self);
    }

    fn take_waiters(&self, next: InitState) -> Vec<Waiter> {
        let mut state = self.channel.state.lock();
        match mem::replace(&mut *state, next) {
            InitState::Initializing(waiters) => waiters,
            _ => Vec::new(),
        }
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        // dropping the waiters wakes them with an abandoned handshake
        drop(self.take_waiters(InitState::Uninitialized));
    }
}
