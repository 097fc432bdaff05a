//! Startup configuration loaded from the environment.
//!
//! Required keys are validated together so a misconfigured deployment fails
//! with one diagnostic listing every missing value instead of dying on the
//! first lookup.

use anyhow::{Result, anyhow};

#[derive(Clone)]
pub struct Cfg {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub db_path: String,
    /// Directory holding one grammers session file per monitoring account.
    pub sessions_dir: String,
    pub geocoder_user_agent: String,
    /// Offset applied when evaluating driver quiet hours (minutes east of UTC).
    pub quiet_tz_offset_minutes: i32,
    /// When `true`, only drivers subscribed to the source group are matched
    /// (admins are swept separately either way).
    pub filter_by_source_group: bool,
}

impl Cfg {
    pub fn from_env() -> Result<Self> {
        let mut missing: Vec<&str> = Vec::new();
        let mut require = |key: &'static str| -> String {
            match std::env::var(key) {
                Ok(v) if !v.trim().is_empty() => v,
                _ => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let api_id_raw = require("TG_API_ID");
        let api_hash = require("TG_API_HASH");
        let bot_token = require("BOT_TOKEN");

        if !missing.is_empty() {
            return Err(anyhow!("Missing env vars: {}", missing.join(", ")));
        }

        let api_id: i32 = api_id_raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("TG_API_ID must be i32"))?;

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            db_path: std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./ride_scout.sqlite".into()),
            sessions_dir: std::env::var("SESSIONS_DIR").unwrap_or_else(|_| "./sessions".into()),
            geocoder_user_agent: std::env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| "ride-scout/0.1".into()),
            quiet_tz_offset_minutes: std::env::var("QUIET_TZ_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(180),
            filter_by_source_group: parse_bool_env("FILTER_BY_SOURCE_GROUP", true),
        })
    }
}

pub fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}
