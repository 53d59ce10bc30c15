use std::sync::Arc;

use teloxide::{
    dispatching::Dispatcher,
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    update_listeners::webhooks,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loanbot_core::{
    config::{Config, DeliveryMode},
    conversation::Conversation,
    messaging::port::MessagingPort,
};

use crate::handlers;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub conversation: Arc<Conversation>,
    pub messenger: Arc<dyn MessagingPort>,
}

/// Run the dispatcher until `cancel` fires, using the configured delivery mode.
pub async fn run(bot: Bot, state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "loanbot started"),
        Err(e) => warn!(error = %e, "could not fetch bot identity"),
    }

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    let delivery = state.cfg.delivery.clone();
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!(update_id = upd.id, "ignoring unsupported update");
        })
        .build();

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        match shutdown.shutdown() {
            Ok(done) => {
                done.await;
                info!("dispatcher stopped");
            }
            Err(e) => debug!(error = %e, "dispatcher was not running"),
        }
    });

    match delivery {
        DeliveryMode::LongPolling => {
            info!("receiving updates by long polling");
            dispatcher.dispatch().await;
        }
        DeliveryMode::Webhook { url, listen_addr } => {
            let url = reqwest::Url::parse(&url)?;
            info!(%url, %listen_addr, "receiving updates by webhook");
            let listener = webhooks::axum(bot, webhooks::Options::new(listen_addr, url)).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("webhook listener error"),
                )
                .await;
        }
    }

    Ok(())
}
