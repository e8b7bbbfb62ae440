use crate::{
    config::{ConfigHandle, NetworkSpec, Options, SdkConfig},
    errors::ProviderError,
    host::Host,
    pipeline::{Pipeline, Session},
    provider::Provider,
    stages::Subscriptions,
    widget::WidgetChannel,
};
use fehler::throws;
use log::info;
use std::sync::Arc;

/// One dapp session: config, the widget channel and the provider on top.
pub struct Portis {
    config: ConfigHandle,
    widget: Arc<WidgetChannel>,
    provider: Provider,
}

impl Portis {
    /// Validates everything before touching the host. The widget itself is
    /// only created when the first request needs it.
    #[throws(ProviderError)]
    pub fn new<N>(identity: &str, network: N, options: Options, host: Arc<dyn Host>) -> Self
    where
        N: Into<NetworkSpec>,
    {
        let config = ConfigHandle::new(SdkConfig::new(identity, network.into(), options)?);
        let widget = Arc::new(WidgetChannel::new(host, config.clone()));
        let subscriptions = Subscriptions::new();
        let pipeline = Pipeline::standard(widget.clone(), subscriptions.clone());
        let provider = Provider::new(pipeline, Session::new(config.clone()), subscriptions);
        info!("Portis session for {} on {}", identity, config.network().endpoint_url);

        Portis {
            config,
            widget,
            provider,
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn widget(&self) -> &Arc<WidgetChannel> {
        &self.widget
    }

    /// Switches networks. Cached answers, filters, subscriptions and nonces
    /// from the old network are dropped.
    #[throws(ProviderError)]
    pub fn change_network<N>(&self, network: N)
    where
        N: Into<NetworkSpec>,
    {
        let network = network.into().resolve()?;
        info!("Switching to {}", network.endpoint_url);
        self.config.set_network(network);
        self.provider.pipeline().reset();
    }

    pub fn set_default_email(&self, email: impl Into<String>) {
        self.config.set_default_email(Some(email.into()));
    }

    #[throws(ProviderError)]
    pub async fn show_portis(&self) {
        self.widget.show_portis().await?
    }

    #[throws(ProviderError)]
    pub async fn login(&self) {
        self.widget.login().await?
    }

    /// `callback(address, email)` runs whenever the user logs in through the widget.
    pub fn on_login<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.widget.on_login(callback)
    }
}
