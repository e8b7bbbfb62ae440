use crate::{
    pipeline::{Outcome, Session, Terminal},
    types::RpcRequest,
    widget::WidgetChannel,
};
use async_trait::async_trait;
use log::trace;
use std::sync::Arc;

/// Forwards whatever the stages left unanswered to the widget, which talks to
/// the node. Always ends the request.
pub struct Relay {
    widget: Arc<WidgetChannel>,
}

impl Relay {
    pub fn new(widget: Arc<WidgetChannel>) -> Self {
        Relay { widget }
    }
}

#[async_trait]
impl Terminal for Relay {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn end(&self, request: RpcRequest, _: &Arc<Session>) -> Outcome {
        trace!("Relaying {} ({})", request.method, request.id);
        Ok(self.widget.relay(&request).await?)
    }
}
