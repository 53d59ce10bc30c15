//! Per-chat conversation sessions and their in-memory store.

use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{domain::ChatId, errors::Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConversationState {
    #[default]
    Unauthenticated,
    AwaitingPhoneNumber,
    Authenticated,
    AwaitingLoanAmount,
    AwaitingRepaymentAmount,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AwaitingPhoneNumber => "awaiting_phone_number",
            Self::Authenticated => "authenticated",
            Self::AwaitingLoanAmount => "awaiting_loan_amount",
            Self::AwaitingRepaymentAmount => "awaiting_repayment_amount",
        }
    }
}

/// Conversation state for one chat.
///
/// Fields are only reachable through the transition methods, which keep the
/// pending ids consistent with the state:
/// - both amount-entry states carry a borrower id
/// - `AwaitingLoanAmount` carries a product id, `AwaitingRepaymentAmount` a loan id
/// - no other state carries a pending id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    state: ConversationState,
    borrower_id: Option<String>,
    pending_product_id: Option<String>,
    pending_loan_id: Option<String>,
}

impl Session {
    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn borrower_id(&self) -> Option<&str> {
        self.borrower_id.as_deref()
    }

    pub fn pending_product_id(&self) -> Option<&str> {
        self.pending_product_id.as_deref()
    }

    pub fn pending_loan_id(&self) -> Option<&str> {
        self.pending_loan_id.as_deref()
    }

    /// `/start`: forget the borrower and ask for a phone number.
    pub fn restart(&mut self) {
        *self = Self {
            state: ConversationState::AwaitingPhoneNumber,
            ..Self::default()
        };
    }

    pub fn authenticate(&mut self, borrower_id: impl Into<String>) {
        *self = Self {
            state: ConversationState::Authenticated,
            borrower_id: Some(borrower_id.into()),
            ..Self::default()
        };
    }

    /// Back to the main menu, dropping any pending data entry.
    pub fn back_to_menu(&mut self) -> Result<()> {
        let borrower_id = self.borrower_id.take().ok_or(Error::SessionExpired)?;
        self.authenticate(borrower_id);
        Ok(())
    }

    pub fn await_loan_amount(&mut self, product_id: impl Into<String>) -> Result<()> {
        self.back_to_menu()?;
        self.state = ConversationState::AwaitingLoanAmount;
        self.pending_product_id = Some(product_id.into());
        Ok(())
    }

    pub fn await_repayment_amount(&mut self, loan_id: impl Into<String>) -> Result<()> {
        self.back_to_menu()?;
        self.state = ConversationState::AwaitingRepaymentAmount;
        self.pending_loan_id = Some(loan_id.into());
        Ok(())
    }

    /// Whether the state/field combination is one the transitions can produce.
    pub fn is_consistent(&self) -> bool {
        use ConversationState::*;
        match self.state {
            Unauthenticated | AwaitingPhoneNumber => {
                self.borrower_id.is_none()
                    && self.pending_product_id.is_none()
                    && self.pending_loan_id.is_none()
            }
            Authenticated => {
                self.borrower_id.is_some()
                    && self.pending_product_id.is_none()
                    && self.pending_loan_id.is_none()
            }
            AwaitingLoanAmount => {
                self.borrower_id.is_some()
                    && self.pending_product_id.is_some()
                    && self.pending_loan_id.is_none()
            }
            AwaitingRepaymentAmount => {
                self.borrower_id.is_some()
                    && self.pending_loan_id.is_some()
                    && self.pending_product_id.is_none()
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    session: Session,
    last_seen: Instant,
}

/// Exclusive access to one chat's session.
///
/// Holding the guard serializes event handling for that chat; other chats are
/// unaffected. Do not call `get`/`set`/`delete` for the same chat while holding it.
pub struct SessionGuard {
    chat_id: ChatId,
    slot: OwnedMutexGuard<Slot>,
}

impl SessionGuard {
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.slot.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.slot.session
    }
}

/// Process-lifetime map from chat id to session.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<ChatId, Arc<Mutex<Slot>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a chat's session, creating an `Unauthenticated` one if absent.
    pub async fn lock(&self, chat_id: ChatId) -> SessionGuard {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        session: Session::default(),
                        last_seen: Instant::now(),
                    }))
                })
                .clone()
        };
        let mut slot = slot.lock_owned().await;
        slot.last_seen = Instant::now();
        SessionGuard { chat_id, slot }
    }

    /// Snapshot of a chat's session, `None` if the chat was never seen.
    pub async fn get(&self, chat_id: ChatId) -> Option<Session> {
        let slot = self.inner.lock().await.get(&chat_id).cloned()?;
        let guard = slot.lock().await;
        Some(guard.session.clone())
    }

    pub async fn set(&self, chat_id: ChatId, session: Session) {
        let mut guard = self.lock(chat_id).await;
        *guard = session;
    }

    pub async fn delete(&self, chat_id: ChatId) -> bool {
        self.inner.lock().await.remove(&chat_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now()).await
    }

    /// Drop sessions untouched for `max_idle`. Sessions in use are kept.
    pub async fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, slot| {
            // A handler cloned the slot out of the map and may be waiting on it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(s) => now.saturating_duration_since(s.last_seen) < max_idle,
                Err(_) => true,
            }
        });
        before - map.len()
    }
}

/// Periodically evict idle sessions until `cancel` fires.
pub fn spawn_idle_eviction(
    store: Arc<SessionStore>,
    max_idle: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let evicted = store.evict_idle(max_idle).await;
                    if evicted > 0 {
                        info!(evicted, "evicted idle sessions");
                    } else {
                        debug!("no idle sessions to evict");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_keep_fields_consistent() {
        let mut s = Session::default();
        assert_eq!(s.state(), ConversationState::Unauthenticated);
        assert!(s.is_consistent());

        s.restart();
        assert_eq!(s.state(), ConversationState::AwaitingPhoneNumber);
        assert!(matches!(s.await_loan_amount("p1"), Err(Error::SessionExpired)));
        assert_eq!(s.state(), ConversationState::AwaitingPhoneNumber);

        s.authenticate("b1");
        s.await_loan_amount("p1").unwrap();
        assert_eq!(s.pending_product_id(), Some("p1"));
        assert!(s.is_consistent());

        // Switching flows drops the other pending id.
        s.await_repayment_amount("l1").unwrap();
        assert_eq!(s.pending_product_id(), None);
        assert_eq!(s.pending_loan_id(), Some("l1"));
        assert!(s.is_consistent());

        s.back_to_menu().unwrap();
        assert_eq!(s.state(), ConversationState::Authenticated);
        assert_eq!(s.borrower_id(), Some("b1"));
        assert_eq!(s.pending_loan_id(), None);

        s.restart();
        assert_eq!(s.borrower_id(), None);
        assert!(matches!(s.back_to_menu(), Err(Error::SessionExpired)));
        assert!(s.is_consistent());
    }

    #[tokio::test]
    async fn store_get_set_delete() {
        let store = SessionStore::new();
        let chat = ChatId(7);
        assert!(store.get(chat).await.is_none());

        let mut s = Session::default();
        s.authenticate("b1");
        store.set(chat, s.clone()).await;
        assert_eq!(store.get(chat).await, Some(s));
        assert_eq!(store.len().await, 1);

        assert!(store.delete(chat).await);
        assert!(!store.delete(chat).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn lock_serializes_same_chat() {
        let store = Arc::new(SessionStore::new());
        let chat = ChatId(1);

        let mut guard = store.lock(chat).await;
        let store2 = store.clone();
        let waiter = tokio::spawn(async move {
            let g = store2.lock(chat).await;
            g.state()
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        guard.restart();
        drop(guard);

        assert_eq!(waiter.await.unwrap(), ConversationState::AwaitingPhoneNumber);
    }

    #[tokio::test]
    async fn other_chats_are_not_blocked() {
        let store = SessionStore::new();
        let _a = store.lock(ChatId(1)).await;
        let b = tokio::time::timeout(Duration::from_secs(1), store.lock(ChatId(2))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn evicts_only_idle_unlocked_sessions() {
        let store = SessionStore::new();
        drop(store.lock(ChatId(1)).await);
        let held = store.lock(ChatId(2)).await;

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(store.evict_idle_at(Duration::from_secs(60), Instant::now()).await, 0);
        assert_eq!(store.evict_idle_at(Duration::from_secs(60), later).await, 1);
        assert!(store.get(ChatId(1)).await.is_none());

        drop(held);
        assert_eq!(store.len().await, 1);
    }
}
