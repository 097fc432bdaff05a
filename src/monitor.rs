//! Userbot monitors watching the source groups, and the fleet reconciler
//! that keeps one monitor alive per authorized account.
//!
//! Several accounts often sit in the same groups, so every message is
//! deduplicated fleet-wide by `(chat_id, message_id)` before extraction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use grammers_client::{Update, UpdatesConfiguration};
use grammers_client::types::{Message, Peer};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::parser::{IncomingMessage, OrderExtractor, ParsedOrder, canonical_group_id};
use crate::store::{AccountSession, Store};
use crate::telegram;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
const FLEET_DEDUP_CAPACITY: usize = 10_000;
const UPDATE_QUEUE_LIMIT: usize = 2048;

/// Where extracted orders go. The dispatcher seam between monitoring and
/// notification.
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn handle_order(&self, order: ParsedOrder);
}

// ---------------------------------------------------------------------------
// Fleet-wide message dedup
// ---------------------------------------------------------------------------

/// Bounded set of recently seen keys. When capacity is exceeded the oldest
/// half is evicted in one sweep, which keeps eviction off the hot path.
pub struct RecentSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl RecentSet {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// `true` on first sighting, `false` for a repeat.
    pub fn insert_check(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        if self.order.len() > self.cap {
            for _ in 0..self.cap / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

type SharedRecent = Arc<tokio::sync::Mutex<RecentSet>>;

// ---------------------------------------------------------------------------
// Per-account monitor
// ---------------------------------------------------------------------------

pub struct AccountMonitor {
    phone: String,
    session_file: String,
    api_id: i32,
    store: Arc<Store>,
    extractor: Arc<OrderExtractor>,
    sink: Arc<dyn OrderSink>,
    recent: SharedRecent,
    /// Canonical chat id -> chat handle, built from the dialog list.
    chats: RwLock<HashMap<i64, Peer>>,
    /// Canonical ids of groups this account currently monitors.
    watched: RwLock<HashSet<i64>>,
}

impl AccountMonitor {
    pub fn new(
        session: AccountSession,
        api_id: i32,
        store: Arc<Store>,
        extractor: Arc<OrderExtractor>,
        sink: Arc<dyn OrderSink>,
        recent: SharedRecent,
    ) -> Arc<Self> {
        Arc::new(Self {
            phone: session.phone,
            session_file: session.session_file,
            api_id,
            store,
            extractor,
            sink,
            recent,
            chats: RwLock::new(HashMap::new()),
            watched: RwLock::new(HashSet::new()),
        })
    }

    /// Recompute the monitored set from the persisted subscriptions,
    /// intersected with the groups this account can actually see. No
    /// reconnect.
    pub fn refresh(&self) -> Result<()> {
        let chats = self.chats.read().unwrap();
        if chats.is_empty() {
            // Dialog index not built yet; run() refreshes once it is.
            return Ok(());
        }
        let subscriptions: HashSet<i64> = self
            .store
            .active_group_subscriptions()?
            .into_iter()
            .map(canonical_group_id)
            .collect();
        let mut watched = HashSet::new();
        for id in &subscriptions {
            if chats.contains_key(id) {
                watched.insert(*id);
            } else {
                warn!("Account {}: not a member of group {id}, skipping", self.phone);
            }
        }
        info!(
            "Account {}: monitoring {} of {} subscribed groups",
            self.phone,
            watched.len(),
            subscriptions.len()
        );
        *self.watched.write().unwrap() = watched;
        Ok(())
    }

    /// Connect, index dialogs and consume the update stream until it ends.
    pub async fn run(&self) -> Result<()> {
        let (client, pool) = telegram::connect(&self.session_file, self.api_id)?;
        let runner = pool.runner;
        // Guarded so the connection dies with this task even when the fleet
        // aborts it mid-await.
        let _runner = telegram::RunnerGuard::new(tokio::spawn(async move {
            runner.run().await;
        }));
        let updates_rx = pool.updates;

        if !client.is_authorized().await? {
            self.store
                .mark_session_unauthorized(&self.phone, "not authorized")?;
            bail!("Account {} is not authorized", self.phone);
        }

        self.build_chat_index(&client).await?;
        self.refresh()?;

        let mut stream = client.stream_updates(
            updates_rx,
            UpdatesConfiguration {
                catch_up: false,
                update_queue_limit: Some(UPDATE_QUEUE_LIMIT),
            },
        );

        info!("Account {}: monitoring started", self.phone);
        loop {
            let Ok(update) = stream.next().await else {
                warn!("Account {}: update stream ended", self.phone);
                break;
            };
            if let Update::NewMessage(msg) = update {
                self.on_message(&msg).await;
            }
        }
        Ok(())
    }

    async fn build_chat_index(&self, client: &grammers_client::Client) -> Result<()> {
        let mut chats = HashMap::new();
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.context("listing dialogs")? {
            let chat = dialog.peer().clone();
            chats.insert(canonical_group_id(chat.id().bare_id()), chat);
        }
        info!("Account {}: indexed {} dialogs", self.phone, chats.len());
        *self.chats.write().unwrap() = chats;
        Ok(())
    }

    async fn on_message(&self, msg: &Message) {
        let Ok(peer) = msg.peer() else {
            return;
        };
        let chat_id = canonical_group_id(peer.id().bare_id());
        if !self.watched.read().unwrap().contains(&chat_id) {
            return;
        }
        let text = msg.text().trim();
        if text.is_empty() {
            return;
        }

        let key = format!("{chat_id}:{}", msg.id());
        if !self.recent.lock().await.insert_check(&key) {
            debug!("Message {key} already handled by the fleet");
            return;
        }

        // Channel posts have no sender; a post signature is the best we get.
        let (author_id, author_username, author_first_name) = match msg.sender() {
            Some(Peer::User(user)) => (
                Some(user.bare_id()),
                user.username().map(str::to_string),
                user.first_name().map(str::to_string),
            ),
            _ => (None, None, msg.post_author().map(str::to_string)),
        };

        let incoming = IncomingMessage {
            chat_id,
            chat_title: peer.name().map(str::to_string),
            chat_username: peer.username().map(str::to_string),
            message_id: i64::from(msg.id()),
            text: text.to_string(),
            author_id,
            author_username,
            author_first_name,
        };

        if let Some(order) = self.extractor.extract(&incoming).await {
            info!(
                "Order in group {chat_id}: {} -> {}",
                order.point_a, order.point_b
            );
            self.sink.handle_order(order).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Fleet reconciler
// ---------------------------------------------------------------------------

pub struct FleetMonitor {
    api_id: i32,
    store: Arc<Store>,
    extractor: Arc<OrderExtractor>,
    sink: Arc<dyn OrderSink>,
    recent: SharedRecent,
    running: HashMap<String, (Arc<AccountMonitor>, JoinHandle<()>)>,
}

impl FleetMonitor {
    pub fn new(
        api_id: i32,
        store: Arc<Store>,
        extractor: Arc<OrderExtractor>,
        sink: Arc<dyn OrderSink>,
    ) -> Self {
        Self {
            api_id,
            store,
            extractor,
            sink,
            recent: Arc::new(tokio::sync::Mutex::new(RecentSet::new(FLEET_DEDUP_CAPACITY))),
            running: HashMap::new(),
        }
    }

    /// Reconcile the account roster every five minutes, forever.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.reconcile() {
                warn!("Fleet reconcile failed: {e:#}");
            }
            tokio::time::sleep(RECONCILE_INTERVAL).await;
        }
    }

    fn reconcile(&mut self) -> Result<()> {
        self.running.retain(|phone, (_, handle)| {
            if handle.is_finished() {
                warn!("Monitor for {phone} stopped");
                false
            } else {
                true
            }
        });

        let sessions = self.store.authorized_sessions()?;

        for session in &sessions {
            if let Some((monitor, _)) = self.running.get(&session.phone) {
                if let Err(e) = monitor.refresh() {
                    warn!("Refresh failed for {}: {e:#}", session.phone);
                }
                continue;
            }
            info!("Starting monitor for {}", session.phone);
            let monitor = AccountMonitor::new(
                session.clone(),
                self.api_id,
                Arc::clone(&self.store),
                Arc::clone(&self.extractor),
                Arc::clone(&self.sink),
                Arc::clone(&self.recent),
            );
            let task = Arc::clone(&monitor);
            let handle = tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    warn!("Monitor failed: {e:#}");
                }
            });
            self.running.insert(session.phone.clone(), (monitor, handle));
        }

        // Sessions deauthorized since the last pass take their monitor down.
        let authorized: HashSet<&str> = sessions.iter().map(|s| s.phone.as_str()).collect();
        let stale: Vec<String> = self
            .running
            .keys()
            .filter(|p| !authorized.contains(p.as_str()))
            .cloned()
            .collect();
        for phone in stale {
            if let Some((_, handle)) = self.running.remove(&phone) {
                info!("Stopping monitor for {phone}");
                handle.abort();
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        for (phone, (_, handle)) in self.running.drain() {
            info!("Stopping monitor for {phone}");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_set_flags_repeats() {
        let mut set = RecentSet::new(100);
        assert!(set.insert_check("1:10"));
        assert!(!set.insert_check("1:10"));
        assert!(set.insert_check("1:11"));
    }

    #[test]
    fn recent_set_evicts_oldest_half_when_full() {
        let mut set = RecentSet::new(4);
        for i in 0..5 {
            assert!(set.insert_check(&format!("k{i}")));
        }
        // Capacity overflowed at k4: k0 and k1 were swept out.
        assert_eq!(set.len(), 3);
        assert!(set.insert_check("k0"));
        assert!(set.insert_check("k1"));
        assert!(!set.insert_check("k4"));
    }
}
