use crate::errors::ProviderError::{self, *};
use fehler::{throw, throws};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

/// The only origin the widget frame is ever pointed at.
pub const WIDGET_URL: &str = "https://widget.portis.io";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// name, chain id
const NAMED_NETWORKS: [(&str, &str); 9] = [
    ("mainnet", "1"),
    ("ropsten", "3"),
    ("rinkeby", "4"),
    ("goerli", "5"),
    ("kovan", "42"),
    ("sokol", "77"),
    ("xdai", "100"),
    ("matic", "137"),
    ("maticMumbai", "80001"),
];

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(rename = "nodeUrl")]
    pub endpoint_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, rename = "nodeProtocol", skip_serializing_if = "Option::is_none")]
    pub endpoint_protocol: Option<String>,
}

impl Network {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Network {
            endpoint_url: endpoint_url.into(),
            chain_id: None,
            endpoint_protocol: None,
        }
    }

    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.endpoint_protocol = Some(protocol.into());
        self
    }
}

/// What the caller hands in: a well-known network name or a custom endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkSpec {
    Named(String),
    Custom(Network),
}

impl From<&str> for NetworkSpec {
    fn from(name: &str) -> Self {
        NetworkSpec::Named(name.to_owned())
    }
}

impl From<String> for NetworkSpec {
    fn from(name: String) -> Self {
        NetworkSpec::Named(name)
    }
}

impl From<Network> for NetworkSpec {
    fn from(network: Network) -> Self {
        NetworkSpec::Custom(network)
    }
}

impl NetworkSpec {
    #[throws(ProviderError)]
    pub fn resolve(self) -> Network {
        match self {
            NetworkSpec::Named(name) if name.trim().is_empty() => throw!(MissingNetwork),
            NetworkSpec::Named(name) => {
                let (name, chain_id) = NAMED_NETWORKS
                    .iter()
                    .find(|(known, _)| *known == name)
                    .ok_or_else(|| UnknownNetwork(name.clone()))?;
                Network::new(format!("https://{}.infura.io", name))
                    .with_chain_id(*chain_id)
                    .with_protocol("rpc")
            }
            NetworkSpec::Custom(network) => {
                let url = network.endpoint_url.trim();
                if url.is_empty() {
                    throw!(MissingNetwork)
                }
                let supported = ["http://", "https://", "ws://", "wss://"];
                if !supported.iter().any(|scheme| url.starts_with(scheme)) {
                    throw!(InvalidNetwork(format!("unsupported endpoint {}", url)))
                }
                if let Some(chain_id) = &network.chain_id {
                    if chain_id.parse::<u64>().is_err() {
                        throw!(InvalidNetwork(format!("chain id {} is not a number", chain_id)))
                    }
                }
                network
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Email,
}

impl FromStr for Scope {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Scope::Email),
            other => Err(InvalidScope(other.to_owned())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Email => f.write_str("email"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub scope: Option<Vec<String>>,
    pub default_email: Option<String>,
}

impl Options {
    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(scope.into_iter().map(Into::into).collect());
        self
    }
}

/// Sent in full with every widget call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkConfig {
    #[serde(rename = "dappId")]
    pub identity: String,
    pub network: Network,
    pub version: String,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub scope: BTreeSet<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_email: Option<String>,
}

impl SdkConfig {
    #[throws(ProviderError)]
    pub fn new(identity: &str, network: NetworkSpec, options: Options) -> Self {
        if identity.trim().is_empty() {
            throw!(MissingIdentity)
        }
        let network = network.resolve()?;
        let scope = options
            .scope
            .unwrap_or_default()
            .iter()
            .map(|s| s.parse())
            .collect::<Result<BTreeSet<Scope>, _>>()?;

        SdkConfig {
            identity: identity.to_owned(),
            network,
            version: SDK_VERSION.to_owned(),
            scope,
            default_email: options.default_email,
        }
    }
}

/// Shared view of the session config. Readers always see the latest value.
#[derive(Clone, Debug)]
pub struct ConfigHandle(Arc<RwLock<SdkConfig>>);

impl ConfigHandle {
    pub fn new(config: SdkConfig) -> Self {
        ConfigHandle(Arc::new(RwLock::new(config)))
    }

    pub fn snapshot(&self) -> SdkConfig {
        self.0.read().clone()
    }

    pub fn network(&self) -> Network {
        self.0.read().network.clone()
    }

    pub fn chain_id(&self) -> Option<String> {
        self.0.read().network.chain_id.clone()
    }

    pub fn set_network(&self, network: Network) {
        self.0.write().network = network;
    }

    pub fn set_default_email(&self, email: Option<String>) {
        self.0.write().default_email = email;
    }
}
