//! Conversation state machine.
//!
//! One inbound update is handled at a time per chat: `handle` holds the chat's
//! session lock from the first read to the last outbound send. Backend errors
//! never escape; they become user-facing messages. Only send failures are
//! returned to the adapter.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    api::{
        client::LoanApi,
        types::{recent_transactions, Eligibility, Loan, LoanApplication, Transaction, TransactionKind},
    },
    callback::{CallbackAction, MAX_CALLBACK_DATA_LEN},
    config::Config,
    domain::ChatId,
    errors::Error,
    formatting::{escape_html, format_date, format_money, truncate_text},
    messaging::{
        port::MessagingPort,
        types::{CallbackQuery, Command, IncomingUpdate, InlineButton, InlineKeyboard},
    },
    session::{ConversationState, SessionGuard, SessionStore},
    utils::{normalize_phone, parse_amount},
    Result,
};

const WELCOME: &str = "Welcome to LoanBot! 🏦\n\n\
To get started, please send me your 9-digit phone number registered with the bank.";
const HELP: &str = "<b>LoanBot</b>\n\n\
/start - sign in with your phone number\n\
/check &lt;phone&gt; - sign in directly, e.g. <code>/check 912345678</code>\n\
/help - show this message";
const START_HINT: &str = "Please send /start to begin.";
const SESSION_EXPIRED: &str = "Your session has expired. Please send /start to begin again.";
const BACKEND_UNAVAILABLE: &str =
    "Sorry, the loan service is unavailable right now. Please try again later.";
const MENU_PROMPT: &str = "What would you like to do?";

const BUTTON_LABEL_MAX: usize = 30;

pub struct Conversation {
    cfg: Arc<Config>,
    api: Arc<dyn LoanApi>,
    messenger: Arc<dyn MessagingPort>,
    sessions: Arc<SessionStore>,
}

impl Conversation {
    pub fn new(
        cfg: Arc<Config>,
        api: Arc<dyn LoanApi>,
        messenger: Arc<dyn MessagingPort>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            cfg,
            api,
            messenger,
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Process one inbound update to completion.
    pub async fn handle(&self, update: IncomingUpdate) -> Result<()> {
        let chat_id = update.chat_id();
        let kind = update.kind();
        let mut session = self.sessions.lock(chat_id).await;
        let from = session.state();

        let res = match update {
            IncomingUpdate::Command(cmd) => self.on_command(&mut session, cmd).await,
            IncomingUpdate::Text(msg) => self.on_text(&mut session, &msg.text).await,
            IncomingUpdate::Callback(q) => self.on_callback(&mut session, q).await,
        };

        info!(
            chat_id = chat_id.0,
            event = kind,
            from = from.as_str(),
            to = session.state().as_str(),
            ok = res.is_ok(),
            "update handled"
        );
        res
    }

    async fn on_command(&self, session: &mut SessionGuard, cmd: Command) -> Result<()> {
        let chat = session.chat_id();
        match cmd.name.as_str() {
            "start" => {
                session.restart();
                self.reply(chat, WELCOME, None).await
            }
            "check" => {
                session.restart();
                if cmd.args.trim().is_empty() {
                    return self
                        .reply(
                            chat,
                            "Please provide your phone number. Example: <code>/check 912345678</code>",
                            None,
                        )
                        .await;
                }
                self.sign_in(session, &cmd.args).await
            }
            "help" => self.reply(chat, HELP, None).await,
            other => {
                debug!(chat_id = chat.0, command = other, "unknown command");
                self.reply(chat, &format!("Unknown command. {START_HINT}"), None)
                    .await
            }
        }
    }

    async fn on_text(&self, session: &mut SessionGuard, text: &str) -> Result<()> {
        let chat = session.chat_id();
        match session.state() {
            ConversationState::AwaitingPhoneNumber => self.sign_in(session, text).await,
            ConversationState::AwaitingLoanAmount => self.submit_application(session, text).await,
            ConversationState::AwaitingRepaymentAmount => {
                self.submit_repayment(session, text).await
            }
            ConversationState::Authenticated => match session.borrower_id() {
                Some(borrower_id) => {
                    let kb = main_menu_keyboard(borrower_id);
                    self.reply(chat, MENU_PROMPT, Some(kb)).await
                }
                None => self.reply(chat, SESSION_EXPIRED, None).await,
            },
            ConversationState::Unauthenticated => self.reply(chat, START_HINT, None).await,
        }
    }

    async fn on_callback(&self, session: &mut SessionGuard, q: CallbackQuery) -> Result<()> {
        let chat = session.chat_id();

        // Always acknowledge so the client stops its spinner.
        if let Err(e) = self
            .messenger
            .answer_callback_query(&q.callback_id, None)
            .await
        {
            warn!(chat_id = chat.0, error = %e, "failed to answer callback query");
        }

        let action = match CallbackAction::parse(&q.data) {
            Ok(a) => a,
            Err(e) => {
                warn!(chat_id = chat.0, payload = %q.data, error = %e, "ignoring callback");
                return Ok(());
            }
        };

        let Some(borrower_id) = session.borrower_id().map(str::to_string) else {
            return self.reply(chat, SESSION_EXPIRED, None).await;
        };
        if let Some(owner) = action.borrower_id() {
            if owner != borrower_id {
                warn!(chat_id = chat.0, action = action.name(), "button from a previous sign-in");
                return self.reply(chat, SESSION_EXPIRED, None).await;
            }
        }

        match action {
            CallbackAction::MainMenu => {
                session.back_to_menu()?;
                self.reply(chat, MENU_PROMPT, Some(main_menu_keyboard(&borrower_id)))
                    .await
            }
            CallbackAction::Eligibility { .. } => {
                session.back_to_menu()?;
                self.show_providers(chat, &borrower_id).await
            }
            CallbackAction::Provider { provider_id, .. } => {
                session.back_to_menu()?;
                self.show_eligibility(chat, &borrower_id, &provider_id).await
            }
            CallbackAction::ActiveLoans { .. } => {
                session.back_to_menu()?;
                self.show_active_loans(chat, &borrower_id).await
            }
            CallbackAction::History { .. } => {
                session.back_to_menu()?;
                self.show_history(chat, &borrower_id).await
            }
            CallbackAction::Apply { product_id, .. } => {
                session.await_loan_amount(product_id)?;
                let text = format!(
                    "Please enter the amount you would like to borrow ({}):",
                    escape_html(&self.cfg.currency)
                );
                self.reply(chat, &text, None).await
            }
            CallbackAction::Repay { loan_id, .. } => {
                session.await_repayment_amount(loan_id)?;
                let text = format!(
                    "Please enter the amount you would like to repay ({}):",
                    escape_html(&self.cfg.currency)
                );
                self.reply(chat, &text, None).await
            }
        }
    }

    async fn sign_in(&self, session: &mut SessionGuard, raw: &str) -> Result<()> {
        let chat = session.chat_id();
        let phone = match normalize_phone(raw) {
            Ok(p) => p,
            Err(e) => return self.reply(chat, &escape_html(&e.to_string()), None).await,
        };

        match self.api.find_borrower_by_phone(&phone).await {
            Ok(borrower) => {
                session.authenticate(borrower.id.clone());
                let text = format!(
                    "Hello, <b>{}</b>! What would you like to do today?",
                    escape_html(&borrower.name)
                );
                self.reply(chat, &text, Some(main_menu_keyboard(&borrower.id)))
                    .await
            }
            Err(Error::NotFound(_)) => {
                let text = format!(
                    "Sorry, the phone number <b>{}</b> is not registered. Please check the number and try again.",
                    escape_html(&phone)
                );
                self.reply(chat, &text, None).await
            }
            Err(e) => {
                warn!(chat_id = chat.0, error = %e, "borrower lookup failed");
                self.reply(chat, BACKEND_UNAVAILABLE, None).await
            }
        }
    }

    async fn show_providers(&self, chat: ChatId, borrower_id: &str) -> Result<()> {
        let providers = match self.api.list_providers().await {
            Ok(p) => p,
            Err(e) => {
                warn!(chat_id = chat.0, error = %e, "listing providers failed");
                return self
                    .reply(
                        chat,
                        "Sorry, there was an error fetching providers. Please try again later.",
                        Some(back_keyboard()),
                    )
                    .await;
            }
        };

        if providers.is_empty() {
            return self
                .reply(
                    chat,
                    "No loan providers are available right now.",
                    Some(back_keyboard()),
                )
                .await;
        }

        let mut kb = InlineKeyboard::one_per_row(providers.iter().map(|p| {
            button(
                &p.name,
                CallbackAction::Provider {
                    borrower_id: borrower_id.to_string(),
                    provider_id: p.id.clone(),
                },
            )
        }));
        kb.push_row(back_button());
        self.reply(
            chat,
            "Please select a loan provider to check your eligibility:",
            Some(kb),
        )
        .await
    }

    async fn show_eligibility(&self, chat: ChatId, borrower_id: &str, provider_id: &str) -> Result<()> {
        let eligibility = match self.api.get_eligibility(borrower_id, provider_id).await {
            Ok(e) => e,
            Err(e) => {
                warn!(chat_id = chat.0, provider_id, error = %e, "eligibility check failed");
                return self
                    .reply(
                        chat,
                        "Sorry, could not fetch your eligibility at this moment.",
                        Some(back_keyboard()),
                    )
                    .await;
            }
        };

        let text = render_eligibility(&eligibility, &self.cfg.currency);
        let mut kb = InlineKeyboard::one_per_row(eligibility.applicable().map(|p| {
            button(
                &format!("Apply: {}", p.name),
                CallbackAction::Apply {
                    borrower_id: borrower_id.to_string(),
                    product_id: p.id.clone(),
                },
            )
        }));
        kb.push_row(back_button());
        self.reply(chat, &text, Some(kb)).await
    }

    async fn show_active_loans(&self, chat: ChatId, borrower_id: &str) -> Result<()> {
        let loans = match self.api.list_loans(borrower_id).await {
            Ok(l) => l,
            Err(e) => {
                warn!(chat_id = chat.0, error = %e, "listing loans failed");
                return self
                    .reply(
                        chat,
                        "Sorry, there was an error fetching your active loans.",
                        Some(back_keyboard()),
                    )
                    .await;
            }
        };

        let unpaid: Vec<&Loan> = loans.iter().filter(|l| l.is_unpaid()).collect();
        if unpaid.is_empty() {
            return self
                .reply(
                    chat,
                    "You have no active loans at the moment. 🎉",
                    Some(back_keyboard()),
                )
                .await;
        }

        for loan in unpaid {
            let kb = InlineKeyboard::one_per_row([button(
                "💳 Repay",
                CallbackAction::Repay {
                    borrower_id: borrower_id.to_string(),
                    loan_id: loan.id.clone(),
                },
            )]);
            self.reply(chat, &render_loan(loan, &self.cfg.currency), Some(kb))
                .await?;
        }
        self.reply(
            chat,
            "Pick a loan to repay, or go back to the menu.",
            Some(back_keyboard()),
        )
        .await
    }

    async fn show_history(&self, chat: ChatId, borrower_id: &str) -> Result<()> {
        let txns = match self.api.list_transactions(borrower_id).await {
            Ok(t) => t,
            Err(e) => {
                warn!(chat_id = chat.0, error = %e, "listing transactions failed");
                return self
                    .reply(
                        chat,
                        "Sorry, there was an error fetching your transaction history.",
                        Some(back_keyboard()),
                    )
                    .await;
            }
        };

        if txns.is_empty() {
            return self
                .reply(chat, "You have no transaction history.", Some(back_keyboard()))
                .await;
        }

        let recent = recent_transactions(txns, self.cfg.history_limit);
        self.reply(
            chat,
            &render_history(&recent, &self.cfg.currency),
            Some(back_keyboard()),
        )
        .await
    }

    async fn submit_application(&self, session: &mut SessionGuard, text: &str) -> Result<()> {
        let chat = session.chat_id();
        let amount = match parse_amount(text) {
            Ok(a) => a,
            Err(e) => return self.reply(chat, &escape_html(&e.to_string()), None).await,
        };
        let (Some(borrower_id), Some(product_id)) = (
            session.borrower_id().map(str::to_string),
            session.pending_product_id().map(str::to_string),
        ) else {
            return self.reply(chat, SESSION_EXPIRED, None).await;
        };

        // The pending product is consumed whatever the outcome.
        session.back_to_menu()?;

        let application = LoanApplication {
            borrower_id,
            product_id,
            amount,
        };
        let money = format_money(amount, &self.cfg.currency);
        let text = match self.api.apply_for_loan(&application).await {
            Ok(receipt) => {
                info!(chat_id = chat.0, loan_id = %receipt.loan_id, "loan application submitted");
                format!(
                    "✅ Your loan application for <b>{money}</b> has been submitted.\nLoan reference: <code>{}</code>",
                    escape_html(&receipt.loan_id)
                )
            }
            Err(e @ Error::BackendUnavailable(_)) => {
                warn!(chat_id = chat.0, error = %e, "loan application failed");
                "❌ We could not submit your loan application right now. \
Please check your active loans before trying again."
                    .to_string()
            }
            Err(e) => {
                warn!(chat_id = chat.0, error = %e, "loan application rejected");
                format!(
                    "❌ Your loan application could not be processed: {}",
                    escape_html(&e.to_string())
                )
            }
        };
        self.reply(chat, &text, Some(back_keyboard())).await
    }

    async fn submit_repayment(&self, session: &mut SessionGuard, text: &str) -> Result<()> {
        let chat = session.chat_id();
        let amount = match parse_amount(text) {
            Ok(a) => a,
            Err(e) => return self.reply(chat, &escape_html(&e.to_string()), None).await,
        };
        let Some(loan_id) = session.pending_loan_id().map(str::to_string) else {
            return self.reply(chat, SESSION_EXPIRED, None).await;
        };

        session.back_to_menu()?;

        let money = format_money(amount, &self.cfg.currency);
        let text = match self.api.repay_loan(&loan_id, amount).await {
            Ok(loan) if loan.is_unpaid() => format!(
                "✅ Repayment of <b>{money}</b> received.\nRemaining balance: <b>{}</b>",
                format_money(loan.outstanding(), &self.cfg.currency)
            ),
            Ok(_) => format!("✅ Repayment of <b>{money}</b> received. This loan is now fully repaid. 🎉"),
            Err(e @ Error::BackendUnavailable(_)) => {
                warn!(chat_id = chat.0, loan_id = %loan_id, error = %e, "repayment failed");
                "❌ We could not confirm your repayment right now. \
Please check your active loans before trying again."
                    .to_string()
            }
            Err(e) => {
                warn!(chat_id = chat.0, loan_id = %loan_id, error = %e, "repayment rejected");
                format!(
                    "❌ Your repayment could not be processed: {}",
                    escape_html(&e.to_string())
                )
            }
        };
        self.reply(chat, &text, Some(back_keyboard())).await
    }

    async fn reply(&self, chat: ChatId, html: &str, keyboard: Option<InlineKeyboard>) -> Result<()> {
        match keyboard {
            Some(kb) => self.messenger.send_inline_keyboard(chat, html, kb).await?,
            None => self.messenger.send_html(chat, html).await?,
        };
        Ok(())
    }
}

fn button(label: &str, action: CallbackAction) -> InlineButton {
    let data = action.encode();
    if data.len() > MAX_CALLBACK_DATA_LEN {
        warn!(action = action.name(), len = data.len(), "callback payload exceeds Telegram limit");
    }
    InlineButton::new(truncate_text(label, BUTTON_LABEL_MAX), data)
}

fn back_button() -> InlineButton {
    button("⬅️ Back to Main Menu", CallbackAction::MainMenu)
}

fn back_keyboard() -> InlineKeyboard {
    InlineKeyboard::one_per_row([back_button()])
}

pub fn main_menu_keyboard(borrower_id: &str) -> InlineKeyboard {
    let b = || borrower_id.to_string();
    InlineKeyboard::one_per_row([
        button(
            "Check Loan Eligibility",
            CallbackAction::Eligibility { borrower_id: b() },
        ),
        button(
            "View My Active Loans",
            CallbackAction::ActiveLoans { borrower_id: b() },
        ),
        button("My Loan History", CallbackAction::History { borrower_id: b() }),
    ])
}

fn render_eligibility(e: &Eligibility, currency: &str) -> String {
    let mut out = format!(
        "<b>Your Eligibility Results</b>\nCredit score: <b>{}</b>\n\n",
        e.credit_score
    );

    if e.applicable().next().is_none() {
        out.push_str("You are not eligible for any products at this time.");
        if let Some(reason) = &e.reason {
            out.push_str(&format!("\nReason: {}", escape_html(reason)));
        }
        return out;
    }

    for p in e.applicable() {
        out.push_str(&format!(
            "<b>{}</b>\nLimit: <b>{}</b>\nDaily fee: {}%\nService fee: {}\n\n",
            escape_html(&p.name),
            format_money(p.limit, currency),
            p.interest_rate,
            format_money(p.service_fee, currency)
        ));
    }
    out.trim_end().to_string()
}

fn render_loan(loan: &Loan, currency: &str) -> String {
    format!(
        "<b>{}</b>\nTotal due: <b>{}</b>\nAmount repaid: {}\nOutstanding: {}\nDue date: {}",
        escape_html(&loan.product_name),
        format_money(loan.total_repayable_amount, currency),
        format_money(loan.amount_repaid, currency),
        format_money(loan.outstanding(), currency),
        format_date(loan.due_date.as_ref()),
    )
}

fn render_history(txns: &[Transaction], currency: &str) -> String {
    let mut out = String::from("<b>Your Transaction History</b>\n");
    for t in txns {
        let kind = match t.kind {
            TransactionKind::Debit => "Debit",
            TransactionKind::Credit => "Credit",
        };
        out.push_str(&format!(
            "\n{} - {} - <b>{}</b> ({kind})",
            format_date(t.date.as_ref()),
            escape_html(&t.description),
            format_money(t.amount, currency),
        ));
    }
    out
}
