//! Inbound loop: every channel delivery goes through commands or the dispatcher.
//!
//! Deliveries are taken off the channel queue one at a time, so dispatch order matches
//! arrival order. Only admission and queueing happen here. The work itself runs on the
//! dispatcher's chains, and replies sent from here go out on their own tasks so a slow
//! `sendMessage` never holds up intake for other chats.

use crate::commands;
use anyhow::Result;
use relay_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use relay_dispatch::{DispatchOutcome, Dispatcher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Notices {
    pub rejected: String,
    pub congestion: String,
}

pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn ChannelAdapter>,
    notices: Notices,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        channel: Arc<dyn ChannelAdapter>,
        notices: Notices,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            dispatcher,
            channel,
            notices,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway stopping");
                    return Ok(());
                }
                msg = rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %inbound.chat_id, message_id = %inbound.message_id)
    )]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        if inbound.content.trim().is_empty() {
            return Ok(());
        }

        if let Some(reply) =
            commands::handle_command(self.dispatcher.resolver(), &inbound.chat_id, &inbound.content)
                .await
        {
            self.spawn_reply(&inbound, reply);
            return Ok(());
        }

        match self.dispatcher.dispatch(&inbound).await {
            Ok(DispatchOutcome::Rejected { depth }) => {
                tracing::info!(depth, "message rejected; thread queue full");
                self.spawn_reply(&inbound, self.notices.rejected.clone());
            }
            Ok(DispatchOutcome::Enqueued { congested, unit }) => {
                tracing::debug!(unit_id = %unit.unit_id(), queue_key = %unit.queue_key(), "message queued");
                if congested {
                    self.spawn_reply(&inbound, self.notices.congestion.clone());
                }
            }
            Err(e) => {
                // Dropped; the user only notices the missing reply.
                tracing::error!(%e, "message dropped");
            }
        }
        Ok(())
    }

    fn spawn_reply(&self, inbound: &InboundMessage, content: String) {
        let channel = self.channel.clone();
        let chat_id = inbound.chat_id.clone();
        let message = OutboundMessage::reply(content, inbound.message_id.clone());
        tokio::spawn(async move {
            if let Err(e) = channel.send(chat_id.as_str(), message).await {
                tracing::warn!(chat_id = %chat_id, %e, "reply send failed");
            }
        });
    }
}
