//! SQLite persistence: driver roster, account sessions, orders and
//! notification bookkeeping.
//!
//! A single connection behind a mutex is plenty at this write rate; every
//! time column is unix seconds so freshness windows are plain integer
//! comparisons.

use anyhow::Result;
use sqlite::{State, Value};
use std::sync::Mutex;
use tracing::info;

use crate::geo::Coords;
use crate::parser::ParsedOrder;

pub struct Store {
    db: Mutex<sqlite::Connection>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Driver {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: f64,
    pub min_price: i64,
    pub is_admin: bool,
}

impl Driver {
    /// Home coordinates, if the driver has set a city.
    pub fn coords(&self) -> Option<Coords> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coords { lat, lon }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountSession {
    pub phone: String,
    pub session_file: String,
    /// Driver who owns this account; quick replies go out through it.
    pub driver_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub message_handle: i64,
    pub created_at: i64,
}

/// One source-group sighting of a route, attached to a driver's
/// notification.
#[derive(Debug, Clone)]
pub struct GroupLink {
    pub group_id: i64,
    pub group_title: Option<String>,
    pub source_link: String,
    pub author_id: Option<i64>,
    pub author_username: Option<String>,
    pub author_first_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DriverSettings {
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub busy_until: Option<i64>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS drivers (
    telegram_id INTEGER PRIMARY KEY,
    username    TEXT,
    first_name  TEXT,
    city        TEXT,
    lat         REAL,
    lon         REAL,
    radius_km   REAL    NOT NULL DEFAULT 50,
    min_price   INTEGER NOT NULL DEFAULT 0,
    is_active   INTEGER NOT NULL DEFAULT 1,
    is_admin    INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE TABLE IF NOT EXISTS driver_groups (
    driver_id   INTEGER NOT NULL,
    group_id    INTEGER NOT NULL,
    group_title TEXT,
    UNIQUE (driver_id, group_id)
);
CREATE TABLE IF NOT EXISTS sessions (
    phone         TEXT PRIMARY KEY,
    session_file  TEXT NOT NULL,
    driver_id     INTEGER,
    is_authorized INTEGER NOT NULL DEFAULT 1,
    last_error    TEXT
);
CREATE TABLE IF NOT EXISTS orders (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    route_key          TEXT    NOT NULL,
    point_a            TEXT    NOT NULL,
    point_b            TEXT    NOT NULL,
    price              INTEGER,
    original_text      TEXT    NOT NULL,
    source_group_id    INTEGER NOT NULL,
    source_group_title TEXT,
    source_link        TEXT    NOT NULL UNIQUE,
    message_id         INTEGER NOT NULL,
    region             TEXT,
    author_id          INTEGER,
    author_username    TEXT,
    author_first_name  TEXT,
    created_at         INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS notifications (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id      INTEGER NOT NULL,
    route_key      TEXT    NOT NULL,
    message_handle INTEGER NOT NULL,
    created_at     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS order_group_links (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    route_key         TEXT    NOT NULL,
    driver_id         INTEGER NOT NULL,
    source_link       TEXT    NOT NULL,
    group_id          INTEGER NOT NULL,
    group_title       TEXT,
    author_id         INTEGER,
    author_username   TEXT,
    author_first_name TEXT,
    created_at        INTEGER NOT NULL,
    UNIQUE (route_key, driver_id, source_link)
);
CREATE TABLE IF NOT EXISTS driver_settings (
    driver_id   INTEGER PRIMARY KEY,
    quiet_start TEXT,
    quiet_end   TEXT,
    busy_until  INTEGER
);
CREATE TABLE IF NOT EXISTS favorite_routes (
    driver_id INTEGER NOT NULL,
    route_key TEXT    NOT NULL,
    UNIQUE (driver_id, route_key)
);
CREATE TABLE IF NOT EXISTS blacklist (
    driver_id  INTEGER NOT NULL,
    blocked_id INTEGER NOT NULL,
    kind       TEXT    NOT NULL,
    UNIQUE (driver_id, blocked_id, kind)
);
CREATE TABLE IF NOT EXISTS service_groups (
    group_id INTEGER PRIMARY KEY,
    title    TEXT
);
CREATE TABLE IF NOT EXISTS order_responses (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id   INTEGER NOT NULL,
    source_link TEXT    NOT NULL,
    group_id    INTEGER NOT NULL,
    message_id  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    UNIQUE (driver_id, source_link)
);
";

fn opt_text(v: Option<&str>) -> Value {
    match v {
        Some(s) => Value::String(s.into()),
        None => Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(n) => Value::Integer(n),
        None => Value::Null,
    }
}

impl Store {
    /// Open (or create) the database and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = sqlite::open(path)?;
        conn.execute(SCHEMA)?;
        info!("Database opened at {path}");
        Ok(Self { db: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = sqlite::open(":memory:")?;
        conn.execute(SCHEMA)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    // ── drivers ─────────────────────────────────────────────────────────

    pub fn upsert_driver(&self, d: &Driver) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT INTO drivers
               (telegram_id, username, first_name, city, lat, lon, radius_km, min_price, is_admin)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (telegram_id) DO UPDATE SET
               username = excluded.username, first_name = excluded.first_name,
               city = excluded.city, lat = excluded.lat, lon = excluded.lon,
               radius_km = excluded.radius_km, min_price = excluded.min_price,
               is_admin = excluded.is_admin",
        )?;
        stmt.bind((1, d.telegram_id))?;
        stmt.bind((2, opt_text(d.username.as_deref())))?;
        stmt.bind((3, opt_text(d.first_name.as_deref())))?;
        stmt.bind((4, opt_text(d.city.as_deref())))?;
        stmt.bind((5, d.lat.map(Value::Float).unwrap_or(Value::Null)))?;
        stmt.bind((6, d.lon.map(Value::Float).unwrap_or(Value::Null)))?;
        stmt.bind((7, d.radius_km))?;
        stmt.bind((8, d.min_price))?;
        stmt.bind((9, i64::from(d.is_admin)))?;
        stmt.next()?;
        Ok(())
    }

    fn read_driver(stmt: &sqlite::Statement<'_>) -> Result<Driver> {
        Ok(Driver {
            telegram_id: stmt.read::<i64, _>(0)?,
            username: stmt.read::<Option<String>, _>(1)?,
            first_name: stmt.read::<Option<String>, _>(2)?,
            city: stmt.read::<Option<String>, _>(3)?,
            lat: stmt.read::<Option<f64>, _>(4)?,
            lon: stmt.read::<Option<f64>, _>(5)?,
            radius_km: stmt.read::<f64, _>(6)?,
            min_price: stmt.read::<i64, _>(7)?,
            is_admin: stmt.read::<i64, _>(8)? != 0,
        })
    }

    const DRIVER_COLS: &'static str =
        "telegram_id, username, first_name, city, lat, lon, radius_km, min_price, is_admin";

    pub fn active_drivers(&self) -> Result<Vec<Driver>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(format!(
            "SELECT {} FROM drivers WHERE is_active = 1",
            Self::DRIVER_COLS
        ))?;
        let mut out = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            out.push(Self::read_driver(&stmt)?);
        }
        Ok(out)
    }

    pub fn admins(&self) -> Result<Vec<Driver>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(format!(
            "SELECT {} FROM drivers WHERE is_active = 1 AND is_admin = 1",
            Self::DRIVER_COLS
        ))?;
        let mut out = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            out.push(Self::read_driver(&stmt)?);
        }
        Ok(out)
    }

    // ── group subscriptions ─────────────────────────────────────────────

    pub fn subscribe(&self, driver_id: i64, group_id: i64, title: Option<&str>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO driver_groups (driver_id, group_id, group_title)
             VALUES (?, ?, ?)",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, group_id))?;
        stmt.bind((3, opt_text(title)))?;
        stmt.next()?;
        Ok(())
    }

    pub fn drivers_subscribed_to_group(&self, group_id: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT driver_id FROM driver_groups WHERE group_id = ?")?;
        stmt.bind((1, group_id))?;
        let mut ids = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            ids.push(stmt.read::<i64, _>(0)?);
        }
        Ok(ids)
    }

    pub fn is_subscribed(&self, driver_id: i64, group_id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT 1 FROM driver_groups WHERE driver_id = ? AND group_id = ? LIMIT 1",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, group_id))?;
        Ok(matches!(stmt.next()?, State::Row))
    }

    /// Distinct group ids any active driver watches; the monitors only join
    /// these.
    pub fn active_group_subscriptions(&self) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT DISTINCT g.group_id FROM driver_groups g
             JOIN drivers d ON d.telegram_id = g.driver_id
             WHERE d.is_active = 1",
        )?;
        let mut ids = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            ids.push(stmt.read::<i64, _>(0)?);
        }
        Ok(ids)
    }

    // ── account sessions ────────────────────────────────────────────────

    pub fn add_session(
        &self,
        phone: &str,
        session_file: &str,
        driver_id: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR REPLACE INTO sessions (phone, session_file, driver_id, is_authorized)
             VALUES (?, ?, ?, 1)",
        )?;
        stmt.bind((1, phone))?;
        stmt.bind((2, session_file))?;
        stmt.bind((3, opt_int(driver_id)))?;
        stmt.next()?;
        Ok(())
    }

    pub fn authorized_sessions(&self) -> Result<Vec<AccountSession>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT phone, session_file, driver_id FROM sessions WHERE is_authorized = 1",
        )?;
        let mut out = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            out.push(AccountSession {
                phone: stmt.read::<String, _>(0)?,
                session_file: stmt.read::<String, _>(1)?,
                driver_id: stmt.read::<Option<i64>, _>(2)?,
            });
        }
        Ok(out)
    }

    /// The authorized session belonging to one driver, if the driver has
    /// connected an account.
    pub fn session_for_driver(&self, driver_id: i64) -> Result<Option<AccountSession>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT phone, session_file, driver_id FROM sessions
             WHERE driver_id = ? AND is_authorized = 1",
        )?;
        stmt.bind((1, driver_id))?;
        if let Ok(State::Row) = stmt.next() {
            return Ok(Some(AccountSession {
                phone: stmt.read::<String, _>(0)?,
                session_file: stmt.read::<String, _>(1)?,
                driver_id: stmt.read::<Option<i64>, _>(2)?,
            }));
        }
        Ok(None)
    }

    /// Stops the reconciler from endlessly retrying a dead session; a human
    /// re-login flips it back via [`Store::add_session`].
    pub fn mark_session_unauthorized(&self, phone: &str, error: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "UPDATE sessions SET is_authorized = 0, last_error = ? WHERE phone = ?",
        )?;
        stmt.bind((1, error))?;
        stmt.bind((2, phone))?;
        stmt.next()?;
        Ok(())
    }

    // ── orders ──────────────────────────────────────────────────────────

    /// Insert an order keyed by its source link. Returns `false` when the
    /// exact message was already stored.
    pub fn save_order(&self, order: &ParsedOrder, route_key: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO orders
               (route_key, point_a, point_b, price, original_text,
                source_group_id, source_group_title, source_link, message_id,
                region, author_id, author_username, author_first_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, route_key))?;
        stmt.bind((2, order.point_a.as_str()))?;
        stmt.bind((3, order.point_b.as_str()))?;
        stmt.bind((4, opt_int(order.price)))?;
        stmt.bind((5, order.original_text.as_str()))?;
        stmt.bind((6, order.source_group_id))?;
        stmt.bind((7, opt_text(order.source_group_title.as_deref())))?;
        stmt.bind((8, order.source_link.as_str()))?;
        stmt.bind((9, order.message_id))?;
        stmt.bind((10, opt_text(order.region)))?;
        stmt.bind((11, opt_int(order.author_id)))?;
        stmt.bind((12, opt_text(order.author_username.as_deref())))?;
        stmt.bind((13, opt_text(order.author_first_name.as_deref())))?;
        stmt.bind((14, order.received_at.timestamp()))?;
        stmt.next()?;
        Ok(db.change_count() > 0)
    }

    /// Route key and source link of the order behind a "take" callback.
    pub fn order_for_message(
        &self,
        group_id: i64,
        message_id: i64,
    ) -> Result<Option<(String, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT route_key, source_link FROM orders
             WHERE source_group_id = ? AND message_id = ?
             ORDER BY created_at DESC LIMIT 1",
        )?;
        stmt.bind((1, group_id))?;
        stmt.bind((2, message_id))?;
        if let State::Row = stmt.next()? {
            Ok(Some((stmt.read::<String, _>(0)?, stmt.read::<String, _>(1)?)))
        } else {
            Ok(None)
        }
    }

    // ── notifications ───────────────────────────────────────────────────

    /// Freshest notification for this driver and route at or after
    /// `cutoff_ts`; anything older is stale and gets a new message instead
    /// of an edit.
    pub fn existing_notification(
        &self,
        driver_id: i64,
        route_key: &str,
        cutoff_ts: i64,
    ) -> Result<Option<NotificationRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_handle, created_at FROM notifications
             WHERE driver_id = ? AND route_key = ? AND created_at >= ?
             ORDER BY created_at DESC LIMIT 1",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, route_key))?;
        stmt.bind((3, cutoff_ts))?;
        if let State::Row = stmt.next()? {
            Ok(Some(NotificationRecord {
                message_handle: stmt.read::<i64, _>(0)?,
                created_at: stmt.read::<i64, _>(1)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn record_notification(
        &self,
        driver_id: i64,
        route_key: &str,
        message_handle: i64,
        ts: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT INTO notifications (driver_id, route_key, message_handle, created_at)
             VALUES (?, ?, ?, ?)",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, route_key))?;
        stmt.bind((3, message_handle))?;
        stmt.bind((4, ts))?;
        stmt.next()?;
        Ok(())
    }

    // ── order group links ───────────────────────────────────────────────

    /// Idempotent: re-adding the same sighting of a route for the same
    /// driver is a no-op. Returns `true` when a new row landed.
    pub fn add_group_link(
        &self,
        route_key: &str,
        driver_id: i64,
        link: &GroupLink,
        ts: i64,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO order_group_links
               (route_key, driver_id, source_link, group_id, group_title,
                author_id, author_username, author_first_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, route_key))?;
        stmt.bind((2, driver_id))?;
        stmt.bind((3, link.source_link.as_str()))?;
        stmt.bind((4, link.group_id))?;
        stmt.bind((5, opt_text(link.group_title.as_deref())))?;
        stmt.bind((6, opt_int(link.author_id)))?;
        stmt.bind((7, opt_text(link.author_username.as_deref())))?;
        stmt.bind((8, opt_text(link.author_first_name.as_deref())))?;
        stmt.bind((9, ts))?;
        stmt.next()?;
        Ok(db.change_count() > 0)
    }

    /// All sightings for a driver's notification, oldest first.
    pub fn group_links(&self, route_key: &str, driver_id: i64) -> Result<Vec<GroupLink>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT group_id, group_title, source_link,
                    author_id, author_username, author_first_name
             FROM order_group_links
             WHERE route_key = ? AND driver_id = ?
             ORDER BY created_at ASC, id ASC",
        )?;
        stmt.bind((1, route_key))?;
        stmt.bind((2, driver_id))?;
        let mut out = Vec::new();
        while let Ok(State::Row) = stmt.next() {
            out.push(GroupLink {
                group_id: stmt.read::<i64, _>(0)?,
                group_title: stmt.read::<Option<String>, _>(1)?,
                source_link: stmt.read::<String, _>(2)?,
                author_id: stmt.read::<Option<i64>, _>(3)?,
                author_username: stmt.read::<Option<String>, _>(4)?,
                author_first_name: stmt.read::<Option<String>, _>(5)?,
            });
        }
        Ok(out)
    }

    // ── per-driver settings ─────────────────────────────────────────────

    pub fn driver_settings(&self, driver_id: i64) -> Result<DriverSettings> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT quiet_start, quiet_end, busy_until FROM driver_settings
             WHERE driver_id = ?",
        )?;
        stmt.bind((1, driver_id))?;
        if let State::Row = stmt.next()? {
            Ok(DriverSettings {
                quiet_start: stmt.read::<Option<String>, _>(0)?,
                quiet_end: stmt.read::<Option<String>, _>(1)?,
                busy_until: stmt.read::<Option<i64>, _>(2)?,
            })
        } else {
            Ok(DriverSettings::default())
        }
    }

    pub fn set_quiet_hours(
        &self,
        driver_id: i64,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT INTO driver_settings (driver_id, quiet_start, quiet_end)
             VALUES (?, ?, ?)
             ON CONFLICT (driver_id) DO UPDATE SET
               quiet_start = excluded.quiet_start, quiet_end = excluded.quiet_end",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, opt_text(start)))?;
        stmt.bind((3, opt_text(end)))?;
        stmt.next()?;
        Ok(())
    }

    pub fn set_busy_until(&self, driver_id: i64, until_ts: Option<i64>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT INTO driver_settings (driver_id, busy_until)
             VALUES (?, ?)
             ON CONFLICT (driver_id) DO UPDATE SET busy_until = excluded.busy_until",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, opt_int(until_ts)))?;
        stmt.next()?;
        Ok(())
    }

    // ── favorites / blacklist / service groups ──────────────────────────

    pub fn add_favorite_route(&self, driver_id: i64, route_key: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO favorite_routes (driver_id, route_key) VALUES (?, ?)",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, route_key))?;
        stmt.next()?;
        Ok(())
    }

    pub fn is_favorite_route(&self, driver_id: i64, route_key: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT 1 FROM favorite_routes WHERE driver_id = ? AND route_key = ? LIMIT 1",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, route_key))?;
        Ok(matches!(stmt.next()?, State::Row))
    }

    pub fn add_to_blacklist(&self, driver_id: i64, blocked_id: i64, kind: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO blacklist (driver_id, blocked_id, kind) VALUES (?, ?, ?)",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, blocked_id))?;
        stmt.bind((3, kind))?;
        stmt.next()?;
        Ok(())
    }

    fn is_blacklisted(&self, driver_id: i64, blocked_id: i64, kind: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT 1 FROM blacklist WHERE driver_id = ? AND blocked_id = ? AND kind = ? LIMIT 1",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, blocked_id))?;
        stmt.bind((3, kind))?;
        Ok(matches!(stmt.next()?, State::Row))
    }

    pub fn is_blacklisted_author(&self, driver_id: i64, author_id: i64) -> Result<bool> {
        self.is_blacklisted(driver_id, author_id, "author")
    }

    pub fn is_blacklisted_group(&self, driver_id: i64, group_id: i64) -> Result<bool> {
        self.is_blacklisted(driver_id, group_id, "group")
    }

    pub fn add_service_group(&self, group_id: i64, title: Option<&str>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR REPLACE INTO service_groups (group_id, title) VALUES (?, ?)",
        )?;
        stmt.bind((1, group_id))?;
        stmt.bind((2, opt_text(title)))?;
        stmt.next()?;
        Ok(())
    }

    pub fn is_service_group(&self, group_id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT 1 FROM service_groups WHERE group_id = ? LIMIT 1")?;
        stmt.bind((1, group_id))?;
        Ok(matches!(stmt.next()?, State::Row))
    }

    // ── order responses ─────────────────────────────────────────────────

    pub fn record_response(
        &self,
        driver_id: i64,
        source_link: &str,
        group_id: i64,
        message_id: i64,
        ts: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO order_responses
               (driver_id, source_link, group_id, message_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, driver_id))?;
        stmt.bind((2, source_link))?;
        stmt.bind((3, group_id))?;
        stmt.bind((4, message_id))?;
        stmt.bind((5, ts))?;
        stmt.next()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(link: &str) -> ParsedOrder {
        ParsedOrder {
            point_a: "Уфа".into(),
            point_b: "Казань".into(),
            price: Some(15_000),
            original_text: "А: Уфа Б: Казань 15к".into(),
            source_group_id: 234567890,
            source_group_title: Some("Межгород".into()),
            source_link: link.into(),
            region: Some("povolzhye"),
            point_a_coords: None,
            point_b_coords: None,
            message_id: 42,
            author_id: Some(777),
            author_username: None,
            author_first_name: Some("Ринат".into()),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_order_insert_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let o = order("https://t.me/c/234567890/42");
        assert!(store.save_order(&o, "уфа:казань").unwrap());
        assert!(!store.save_order(&o, "уфа:казань").unwrap());
    }

    #[test]
    fn group_link_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let link = GroupLink {
            group_id: 234567890,
            group_title: Some("Межгород".into()),
            source_link: "https://t.me/c/234567890/42".into(),
            author_id: Some(777),
            author_username: None,
            author_first_name: None,
        };
        assert!(store.add_group_link("уфа:казань", 1, &link, 100).unwrap());
        assert!(!store.add_group_link("уфа:казань", 1, &link, 200).unwrap());
        assert_eq!(store.group_links("уфа:казань", 1).unwrap().len(), 1);
    }

    #[test]
    fn stale_notifications_fall_outside_cutoff() {
        let store = Store::open_in_memory().unwrap();
        store.record_notification(1, "уфа:казань", 500, 1_000).unwrap();
        assert!(store.existing_notification(1, "уфа:казань", 900).unwrap().is_some());
        assert!(store.existing_notification(1, "уфа:казань", 1_001).unwrap().is_none());
    }

    #[test]
    fn settings_default_when_missing() {
        let store = Store::open_in_memory().unwrap();
        let s = store.driver_settings(99).unwrap();
        assert!(s.quiet_start.is_none());
        assert!(s.busy_until.is_none());

        store.set_quiet_hours(99, Some("22:00"), Some("07:00")).unwrap();
        store.set_busy_until(99, Some(5_000)).unwrap();
        let s = store.driver_settings(99).unwrap();
        assert_eq!(s.quiet_start.as_deref(), Some("22:00"));
        assert_eq!(s.busy_until, Some(5_000));
    }

    #[test]
    fn empty_subscriber_list_for_unknown_group() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.drivers_subscribed_to_group(1).unwrap().is_empty());
    }

    #[test]
    fn sessions_are_looked_up_by_owning_driver() {
        let store = Store::open_in_memory().unwrap();
        store.add_session("+79010000001", "./s/1.sqlite", Some(7)).unwrap();
        store.add_session("+79010000002", "./s/2.sqlite", None).unwrap();

        let owned = store.session_for_driver(7).unwrap().unwrap();
        assert_eq!(owned.phone, "+79010000001");
        assert_eq!(owned.driver_id, Some(7));
        assert!(store.session_for_driver(8).unwrap().is_none());

        // Deauthorized sessions no longer answer for their driver.
        store.mark_session_unauthorized("+79010000001", "revoked").unwrap();
        assert!(store.session_for_driver(7).unwrap().is_none());
        assert_eq!(store.authorized_sessions().unwrap().len(), 1);
    }
}
