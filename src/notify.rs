//! Notification pipeline: dedup, suppression and delivery bookkeeping.
//!
//! One driver gets at most one live message per route within the freshness
//! window; later sightings of the same route edit that message in place and
//! extend its group list. Delivery itself lives behind [`DriverChannel`] so
//! the whole pipeline is testable without Telegram.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use tracing::{debug, info, warn};

use crate::geo;
use crate::matcher::{self, MatchedDriver};
use crate::monitor::OrderSink;
use crate::parser::ParsedOrder;
use crate::store::{GroupLink, Store};

/// Edits stop and a fresh message starts after two hours.
pub const FRESHNESS_WINDOW_SECS: i64 = 2 * 60 * 60;

/// Reply posted into the source group when a driver takes an order.
const TAKE_REPLY_TEXT: &str = "+";

/// Directional route identity; "Уфа → Казань" and the return trip are
/// different routes.
pub fn route_key(point_a: &str, point_b: &str) -> String {
    format!(
        "{}:{}",
        point_a.trim().to_lowercase(),
        point_b.trim().to_lowercase()
    )
}

/// Context a channel needs to attach action buttons to a notification.
pub struct NotificationActions {
    pub source_link: String,
    pub group_id: i64,
    pub message_id: i64,
}

/// Private-message delivery to one driver. `send` returns an opaque handle
/// that later `edit` calls address.
#[async_trait]
pub trait DriverChannel: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, actions: &NotificationActions) -> Result<i64>;
    async fn edit(
        &self,
        chat_id: i64,
        message_handle: i64,
        text: &str,
        actions: &NotificationActions,
    ) -> Result<()>;
}

/// Posting a reply into a source group can fail because the driver never
/// connected an account, or because the account is not allowed to write
/// there; both cases get handled instead of reported as plain errors.
#[derive(Debug)]
pub enum ReplyError {
    /// The driver has no authorized account session on file.
    NoSession,
    Permission,
    Other(anyhow::Error),
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyError::NoSession => write!(f, "driver has no connected account"),
            ReplyError::Permission => write!(f, "no write permission"),
            ReplyError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl From<anyhow::Error> for ReplyError {
    fn from(e: anyhow::Error) -> Self {
        ReplyError::Other(e)
    }
}

#[async_trait]
pub trait GroupReplier: Send + Sync {
    /// Reply to a message in a source group through the given driver's own
    /// account session; returns the sent message id.
    async fn reply(
        &self,
        driver_id: i64,
        group_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<i64, ReplyError>;
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct NotificationCoordinator<C: DriverChannel> {
    store: Arc<Store>,
    channel: C,
    quiet_tz_offset_minutes: i32,
    filter_by_source_group: bool,
}

impl<C: DriverChannel> NotificationCoordinator<C> {
    pub fn new(
        store: Arc<Store>,
        channel: C,
        quiet_tz_offset_minutes: i32,
        filter_by_source_group: bool,
    ) -> Self {
        Self {
            store,
            channel,
            quiet_tz_offset_minutes,
            filter_by_source_group,
        }
    }

    /// Store, match and fan out one extracted order. Per-driver failures are
    /// logged and never block the remaining drivers.
    pub async fn process_order(&self, order: &ParsedOrder) -> Result<()> {
        let rk = route_key(&order.point_a, &order.point_b);
        if !self.store.save_order(order, &rk)? {
            debug!("Duplicate message ignored: {}", order.source_link);
            return Ok(());
        }

        let matched =
            matcher::find_matching_drivers(&self.store, order, self.filter_by_source_group)?;
        info!(
            "Order {} -> {}: {} matching drivers",
            order.point_a,
            order.point_b,
            matched.len()
        );

        for m in &matched {
            if let Err(e) = self.notify_driver(m, order, &rk).await {
                warn!("Notify failed for driver {}: {e:#}", m.driver.telegram_id);
            }
        }
        Ok(())
    }

    async fn notify_driver(
        &self,
        m: &MatchedDriver,
        order: &ParsedOrder,
        rk: &str,
    ) -> Result<()> {
        let driver_id = m.driver.telegram_id;

        if let Some(author) = order.author_id {
            if self.store.is_blacklisted_author(driver_id, author)? {
                debug!("Driver {driver_id} blacklisted author {author}");
                return Ok(());
            }
        }
        if self.store.is_blacklisted_group(driver_id, order.source_group_id)? {
            debug!("Driver {driver_id} blacklisted group {}", order.source_group_id);
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let settings = self.store.driver_settings(driver_id)?;
        if let Some(until) = settings.busy_until {
            if now < until {
                debug!("Driver {driver_id} busy until {until}");
                return Ok(());
            }
            self.store.set_busy_until(driver_id, None)?;
            info!("Busy window of driver {driver_id} expired, cleared");
        }
        if let (Some(start), Some(end)) = (&settings.quiet_start, &settings.quiet_end) {
            if quiet_hours_active(start, end, &local_hhmm(self.quiet_tz_offset_minutes)) {
                debug!("Driver {driver_id} in quiet hours {start}-{end}");
                return Ok(());
            }
        }

        self.store.add_group_link(
            rk,
            driver_id,
            &GroupLink {
                group_id: order.source_group_id,
                group_title: order.source_group_title.clone(),
                source_link: order.source_link.clone(),
                author_id: order.author_id,
                author_username: order.author_username.clone(),
                author_first_name: order.author_first_name.clone(),
            },
            now,
        )?;

        let links = self.store.group_links(rk, driver_id)?;
        let text = self.render_notification(m, order, rk, &links)?;
        let actions = NotificationActions {
            source_link: order.source_link.clone(),
            group_id: order.source_group_id,
            message_id: order.message_id,
        };

        if let Some(existing) = self
            .store
            .existing_notification(driver_id, rk, now - FRESHNESS_WINDOW_SECS)?
        {
            match self
                .channel
                .edit(driver_id, existing.message_handle, &text, &actions)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Link rows already landed; fall through to a fresh send.
                    warn!("Edit failed for driver {driver_id}, sending anew: {e:#}");
                }
            }
        }
        let handle = self.channel.send(driver_id, &text, &actions).await?;
        self.store.record_notification(driver_id, rk, handle, now)?;
        Ok(())
    }

    fn render_notification(
        &self,
        m: &MatchedDriver,
        order: &ParsedOrder,
        rk: &str,
        links: &[GroupLink],
    ) -> Result<String> {
        let mut out = String::new();
        if m.admin_extra {
            out.push_str("[ADMIN] ");
        }
        if self.store.is_favorite_route(m.driver.telegram_id, rk)? {
            out.push_str("⭐ ");
        }
        out.push_str(&format!(
            "🔊 <b>{} - {}</b>\n",
            esc(&order.point_a),
            esc(&order.point_b)
        ));
        if let Some(price) = order.price {
            out.push_str(&format!("💰 {price} ₽\n"));
        }
        out.push('\n');
        out.push_str(&esc(&order.original_text));
        out.push('\n');

        out.push_str(&format!(
            "\n🗺 <a href=\"https://yandex.ru/maps/?text={}\">{} на карте</a>\n",
            geo::url_encode(&order.point_a),
            esc(&order.point_a)
        ));

        out.push_str("\n📢 Группы:\n");
        for link in links {
            let badge = if self.store.is_service_group(link.group_id)? {
                " ✅"
            } else {
                ""
            };
            let title = link
                .group_title
                .clone()
                .unwrap_or_else(|| format!("группа {}", link.group_id));
            out.push_str(&format!(
                "• <a href=\"{}\">{}</a>{}\n",
                link.source_link,
                esc(&title),
                badge
            ));
        }

        // Author contact from the freshest sighting that has one.
        let author = links
            .iter()
            .rev()
            .find(|l| l.author_id.is_some() || l.author_username.is_some());
        let (a_id, a_user, a_name) = match author {
            Some(l) => (
                l.author_id,
                l.author_username.as_deref(),
                l.author_first_name.as_deref(),
            ),
            None => (
                order.author_id,
                order.author_username.as_deref(),
                order.author_first_name.as_deref(),
            ),
        };
        let display = esc(a_name.unwrap_or("автор"));
        if let Some(u) = a_user {
            out.push_str(&format!("\n👤 <a href=\"https://t.me/{u}\">{display}</a>\n"));
        } else if let Some(id) = a_id {
            out.push_str(&format!("\n👤 <a href=\"tg://user?id={id}\">{display}</a>\n"));
        }

        Ok(out)
    }

    /// "Take order" callback: post a reply into the source group through
    /// the driver's own account session, falling back to any other group
    /// where the same route was sighted when the first one is
    /// write-restricted. A driver without a connected session fails fast so
    /// the caller can tell them to connect one.
    pub async fn quick_reply(
        &self,
        replier: &dyn GroupReplier,
        driver_id: i64,
        group_id: i64,
        message_id: i64,
    ) -> Result<(), ReplyError> {
        let Some((rk, source_link)) = self.store.order_for_message(group_id, message_id)? else {
            return Err(ReplyError::Other(anyhow!(
                "No stored order for group {group_id} message {message_id}"
            )));
        };
        let now = Utc::now().timestamp();

        match replier
            .reply(driver_id, group_id, message_id, TAKE_REPLY_TEXT)
            .await
        {
            Ok(sent) => {
                self.store
                    .record_response(driver_id, &source_link, group_id, sent, now)?;
                info!("Driver {driver_id} took order in group {group_id}");
                return Ok(());
            }
            Err(ReplyError::NoSession) => return Err(ReplyError::NoSession),
            Err(ReplyError::Other(e)) => {
                return Err(ReplyError::Other(e.context("Posting take-order reply")));
            }
            Err(ReplyError::Permission) => {
                warn!("No write access to group {group_id}, trying alternates");
            }
        }

        for link in self.store.group_links(&rk, driver_id)? {
            if link.group_id == group_id {
                continue;
            }
            let Some(alt_message) = message_id_from_link(&link.source_link) else {
                continue;
            };
            match replier
                .reply(driver_id, link.group_id, alt_message, TAKE_REPLY_TEXT)
                .await
            {
                Ok(sent) => {
                    self.store
                        .record_response(driver_id, &link.source_link, link.group_id, sent, now)?;
                    info!(
                        "Driver {driver_id} took order via alternate group {}",
                        link.group_id
                    );
                    return Ok(());
                }
                Err(ReplyError::NoSession) => return Err(ReplyError::NoSession),
                Err(ReplyError::Permission) => continue,
                Err(ReplyError::Other(e)) => {
                    return Err(ReplyError::Other(
                        e.context("Posting take-order reply in alternate group"),
                    ));
                }
            }
        }
        Err(ReplyError::Other(anyhow!(
            "No writable group found for route {rk}"
        )))
    }
}

#[async_trait]
impl<C: DriverChannel> OrderSink for NotificationCoordinator<C> {
    async fn handle_order(&self, order: ParsedOrder) {
        if let Err(e) = self.process_order(&order).await {
            warn!("Order processing failed: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Zero-padded "HH:MM" comparison; an end before the start wraps past
/// midnight. Both bounds are inclusive.
pub fn quiet_hours_active(start: &str, end: &str, now_hhmm: &str) -> bool {
    if start == end {
        return false;
    }
    if start <= end {
        start <= now_hhmm && now_hhmm <= end
    } else {
        now_hhmm >= start || now_hhmm <= end
    }
}

fn local_hhmm(offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    Utc::now().with_timezone(&offset).format("%H:%M").to_string()
}

fn message_id_from_link(link: &str) -> Option<i64> {
    link.rsplit('/').next()?.parse().ok()
}

fn esc(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coords;
    use crate::store::Driver;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    const ORIGIN: Coords = Coords { lat: 54.7431, lon: 55.9678 };

    #[derive(Debug, PartialEq)]
    enum Call {
        Send { chat_id: i64, handle: i64, starred: bool, admin: bool },
        Edit { chat_id: i64, handle: i64, groups: usize },
    }

    #[derive(Default)]
    struct MockChannel {
        calls: Mutex<Vec<Call>>,
        next_handle: AtomicI64,
    }

    #[async_trait]
    impl DriverChannel for &MockChannel {
        async fn send(
            &self,
            chat_id: i64,
            text: &str,
            _actions: &NotificationActions,
        ) -> Result<i64> {
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 100;
            self.calls.lock().unwrap().push(Call::Send {
                chat_id,
                handle,
                starred: text.contains('⭐'),
                admin: text.contains("[ADMIN]"),
            });
            Ok(handle)
        }

        async fn edit(
            &self,
            chat_id: i64,
            message_handle: i64,
            text: &str,
            _actions: &NotificationActions,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Edit {
                chat_id,
                handle: message_handle,
                groups: text.matches("• ").count(),
            });
            Ok(())
        }
    }

    fn order(message_id: i64) -> ParsedOrder {
        ParsedOrder {
            point_a: "Уфа".into(),
            point_b: "Казань".into(),
            price: Some(15_000),
            original_text: "А: Уфа Б: Казань 15к".into(),
            source_group_id: 234567890,
            source_group_title: Some("Межгород".into()),
            source_link: format!("https://t.me/c/234567890/{message_id}"),
            region: Some("povolzhye"),
            point_a_coords: Some(ORIGIN),
            point_b_coords: None,
            message_id,
            author_id: Some(777),
            author_username: Some("dispatcher".into()),
            author_first_name: Some("Ринат".into()),
            received_at: Utc::now(),
        }
    }

    fn local_driver(id: i64) -> Driver {
        Driver {
            telegram_id: id,
            username: None,
            first_name: None,
            city: Some("Уфа".into()),
            lat: Some(ORIGIN.lat),
            lon: Some(ORIGIN.lon),
            radius_km: 50.0,
            min_price: 0,
            is_admin: false,
        }
    }

    fn coordinator(
        store: &Arc<Store>,
        channel: &'static MockChannel,
    ) -> NotificationCoordinator<&'static MockChannel> {
        NotificationCoordinator::new(Arc::clone(store), channel, 180, false)
    }

    fn fixture() -> (Arc<Store>, &'static MockChannel) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_driver(&local_driver(1)).unwrap();
        let channel: &'static MockChannel = Box::leak(Box::default());
        (store, channel)
    }

    #[test]
    fn route_key_is_directional() {
        assert_eq!(route_key("Уфа", "Казань"), "уфа:казань");
        assert_ne!(route_key("Уфа", "Казань"), route_key("Казань", "Уфа"));
    }

    #[test]
    fn quiet_hours_plain_interval() {
        assert!(quiet_hours_active("13:00", "15:00", "14:00"));
        assert!(!quiet_hours_active("13:00", "15:00", "12:59"));
        assert!(!quiet_hours_active("13:00", "15:00", "15:01"));
    }

    #[test]
    fn quiet_hours_bounds_are_inclusive() {
        assert!(quiet_hours_active("13:00", "15:00", "13:00"));
        assert!(quiet_hours_active("13:00", "15:00", "15:00"));
    }

    #[test]
    fn quiet_hours_wrap_past_midnight() {
        assert!(quiet_hours_active("22:00", "07:00", "23:30"));
        assert!(quiet_hours_active("22:00", "07:00", "03:00"));
        assert!(quiet_hours_active("22:00", "07:00", "07:00"));
        assert!(!quiet_hours_active("22:00", "07:00", "12:00"));
        assert!(!quiet_hours_active("22:00", "07:00", "07:01"));
    }

    #[test]
    fn equal_quiet_bounds_never_suppress() {
        assert!(!quiet_hours_active("08:00", "08:00", "08:00"));
    }

    #[tokio::test]
    async fn fresh_order_sends_once_per_driver() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();

        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Send { chat_id: 1, .. }));
    }

    #[tokio::test]
    async fn duplicate_message_is_a_no_op() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();
        c.process_order(&order(42)).await.unwrap();
        assert_eq!(channel.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeat_sighting_edits_the_live_notification() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();
        // Same route from another message a moment later.
        c.process_order(&order(43)).await.unwrap();

        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let Call::Send { handle: sent, .. } = calls[0] else {
            panic!("expected send first");
        };
        assert_eq!(calls[1], Call::Edit { chat_id: 1, handle: sent, groups: 2 });
    }

    #[tokio::test]
    async fn stale_notification_gets_a_new_message() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);

        let three_hours_ago = Utc::now().timestamp() - 3 * 60 * 60;
        store
            .record_notification(1, "уфа:казань", 555, three_hours_ago)
            .unwrap();

        c.process_order(&order(42)).await.unwrap();
        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Send { .. }));
    }

    #[tokio::test]
    async fn notification_within_window_is_edited() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);

        let one_hour_ago = Utc::now().timestamp() - 60 * 60;
        store
            .record_notification(1, "уфа:казань", 555, one_hour_ago)
            .unwrap();

        c.process_order(&order(42)).await.unwrap();
        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Edit { handle: 555, .. }));
    }

    #[tokio::test]
    async fn blacklisted_author_is_suppressed() {
        let (store, channel) = fixture();
        store.add_to_blacklist(1, 777, "author").unwrap();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();
        assert!(channel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_busy_window_clears_and_delivers() {
        let (store, channel) = fixture();
        store
            .set_busy_until(1, Some(Utc::now().timestamp() - 10))
            .unwrap();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();

        assert_eq!(channel.calls.lock().unwrap().len(), 1);
        assert!(store.driver_settings(1).unwrap().busy_until.is_none());
    }

    #[tokio::test]
    async fn active_busy_window_suppresses() {
        let (store, channel) = fixture();
        store
            .set_busy_until(1, Some(Utc::now().timestamp() + 600))
            .unwrap();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();
        assert!(channel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn favorite_route_is_starred() {
        let (store, channel) = fixture();
        store.add_favorite_route(1, "уфа:казань").unwrap();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();

        let calls = channel.calls.lock().unwrap();
        assert!(matches!(calls[0], Call::Send { starred: true, .. }));
    }

    #[tokio::test]
    async fn admin_sweep_notification_is_labelled() {
        let (store, channel) = fixture();
        let mut admin = local_driver(9);
        admin.is_admin = true;
        store.upsert_driver(&admin).unwrap();
        store.subscribe(1, 234567890, None).unwrap();

        // Group filter on: the admin is not subscribed and arrives via the
        // sweep.
        let c = NotificationCoordinator::new(Arc::clone(&store), channel, 180, true);
        c.process_order(&order(42)).await.unwrap();

        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], Call::Send { chat_id: 1, admin: false, .. }));
        assert!(matches!(calls[1], Call::Send { chat_id: 9, admin: true, .. }));
    }

    struct MockReplier {
        forbidden: i64,
        linked: bool,
        calls: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl GroupReplier for MockReplier {
        async fn reply(
            &self,
            _driver_id: i64,
            group_id: i64,
            message_id: i64,
            _text: &str,
        ) -> Result<i64, ReplyError> {
            if !self.linked {
                return Err(ReplyError::NoSession);
            }
            self.calls.lock().unwrap().push((group_id, message_id));
            if group_id == self.forbidden {
                Err(ReplyError::Permission)
            } else {
                Ok(9000)
            }
        }
    }

    #[tokio::test]
    async fn quick_reply_falls_back_to_alternate_group() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();

        // Same route also seen in a second group.
        store
            .add_group_link(
                "уфа:казань",
                1,
                &GroupLink {
                    group_id: 111,
                    group_title: None,
                    source_link: "https://t.me/c/111/7".into(),
                    author_id: None,
                    author_username: None,
                    author_first_name: None,
                },
                Utc::now().timestamp(),
            )
            .unwrap();

        let replier = MockReplier {
            forbidden: 234567890,
            linked: true,
            calls: Mutex::new(Vec::new()),
        };
        c.quick_reply(&replier, 1, 234567890, 42).await.unwrap();

        let calls = replier.calls.lock().unwrap();
        assert_eq!(*calls, vec![(234567890, 42), (111, 7)]);
    }

    #[tokio::test]
    async fn quick_reply_without_stored_order_fails() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        let replier = MockReplier {
            forbidden: 0,
            linked: true,
            calls: Mutex::new(Vec::new()),
        };
        assert!(c.quick_reply(&replier, 1, 5, 6).await.is_err());
    }

    #[tokio::test]
    async fn quick_reply_requires_the_drivers_own_session() {
        let (store, channel) = fixture();
        let c = coordinator(&store, channel);
        c.process_order(&order(42)).await.unwrap();

        let replier = MockReplier {
            forbidden: 0,
            linked: false,
            calls: Mutex::new(Vec::new()),
        };
        let outcome = c.quick_reply(&replier, 1, 234567890, 42).await;
        assert!(matches!(outcome, Err(ReplyError::NoSession)));
        // No alternate-group retries for a driver who never connected.
        assert!(replier.calls.lock().unwrap().is_empty());
    }
}
