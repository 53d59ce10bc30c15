use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use loanbot_backend::HttpLoanApi;
use loanbot_core::{
    api::client::LoanApi,
    config::Config,
    conversation::Conversation,
    messaging::port::MessagingPort,
    session::{spawn_idle_eviction, SessionStore},
};
use loanbot_telegram::{router::AppState, Bot, TelegramMessenger};

#[tokio::main]
async fn main() -> Result<(), loanbot_core::Error> {
    loanbot_core::logging::init("loanbot")?;

    let cfg = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };
    info!(api = %cfg.api_base_url, "loan backend configured");

    let api: Arc<dyn LoanApi> = Arc::new(HttpLoanApi::from_config(&cfg)?);
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let sessions = Arc::new(SessionStore::new());
    let conversation = Arc::new(Conversation::new(
        cfg.clone(),
        api,
        messenger.clone(),
        sessions.clone(),
    ));

    let cancel = CancellationToken::new();
    let evictor = cfg.session_idle_timeout.map(|max_idle| {
        spawn_idle_eviction(sessions, max_idle, cfg.session_sweep_interval, cancel.clone())
    });

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
            cancel.cancel();
        });
    }

    let state = Arc::new(AppState {
        cfg,
        conversation,
        messenger,
    });
    let res = loanbot_telegram::router::run(bot, state, cancel.clone()).await;

    cancel.cancel();
    if let Some(handle) = evictor {
        let _ = handle.await;
    }

    res.map_err(|e| loanbot_core::Error::External(format!("telegram bot failed: {e}")))
}
