//! Outbound delivery: Bot API channel to drivers and session-based replies
//! into source groups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use grammers_client::{Client, InputMessage};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::notify::{
    DriverChannel, GroupReplier, NotificationActions, NotificationCoordinator, ReplyError,
};
use crate::parser::canonical_group_id;
use crate::store::Store;
use crate::telegram;

// ---------------------------------------------------------------------------
// Bot API channel
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BotApi {
    http: HttpClient,
    base: String,
}

#[derive(Serialize)]
struct InlineKeyboardMarkup {
    inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Serialize)]
struct InlineKeyboardButton {
    text: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_data: Option<String>,
}

#[derive(Serialize)]
struct SendMessagePayload<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    reply_markup: InlineKeyboardMarkup,
}

#[derive(Serialize)]
struct EditMessagePayload<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    reply_markup: InlineKeyboardMarkup,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Callback payload on the "take order" button.
pub fn take_callback_data(group_id: i64, message_id: i64) -> String {
    format!("take_order:{group_id}:{message_id}")
}

pub fn parse_take_callback(data: &str) -> Option<(i64, i64)> {
    let rest = data.strip_prefix("take_order:")?;
    let (group, message) = rest.split_once(':')?;
    Some((group.parse().ok()?, message.parse().ok()?))
}

fn keyboard(actions: &NotificationActions) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![
            InlineKeyboardButton {
                text: "Открыть заказ",
                url: Some(actions.source_link.clone()),
                callback_data: None,
            },
            InlineKeyboardButton {
                text: "Взять заказ",
                url: None,
                callback_data: Some(take_callback_data(actions.group_id, actions.message_id)),
            },
        ]],
    }
}

impl BotApi {
    pub fn new(http: HttpClient, token: &str) -> Self {
        Self {
            http,
            base: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &impl Serialize,
    ) -> Result<T> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Bot API {method} request"))?;
        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .with_context(|| format!("Bot API {method} response"))?;
        if !envelope.ok {
            bail!(
                "Bot API {method} failed: {}",
                envelope.description.unwrap_or_default()
            );
        }
        envelope
            .result
            .ok_or_else(|| anyhow!("Bot API {method}: empty result"))
    }
}

#[async_trait]
impl DriverChannel for BotApi {
    async fn send(&self, chat_id: i64, text: &str, actions: &NotificationActions) -> Result<i64> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                &SendMessagePayload {
                    chat_id,
                    text,
                    parse_mode: "HTML",
                    disable_web_page_preview: true,
                    reply_markup: keyboard(actions),
                },
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn edit(
        &self,
        chat_id: i64,
        message_handle: i64,
        text: &str,
        actions: &NotificationActions,
    ) -> Result<()> {
        self.call::<serde_json::Value>(
            "editMessageText",
            &EditMessagePayload {
                chat_id,
                message_id: message_handle,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
                reply_markup: keyboard(actions),
            },
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Callback long-poll loop
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GetUpdatesPayload {
    offset: i64,
    timeout: u32,
    allowed_updates: &'static [&'static str],
}

#[derive(Deserialize)]
struct TgUpdate {
    update_id: i64,
    callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    id: String,
    from: TgUser,
    data: Option<String>,
}

#[derive(Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Serialize)]
struct AnswerCallbackPayload<'a> {
    callback_query_id: &'a str,
    text: &'a str,
}

/// Long-poll loop over Bot API callback queries; never returns. Errors are
/// logged and polling resumes after a short pause.
pub async fn run_callback_polling(
    bot: BotApi,
    coordinator: Arc<NotificationCoordinator<BotApi>>,
    replier: Arc<SessionReplier>,
) {
    let mut offset: i64 = 0;
    info!("Callback polling started");
    loop {
        let updates: Vec<TgUpdate> = match bot
            .call(
                "getUpdates",
                &GetUpdatesPayload {
                    offset,
                    timeout: 30,
                    allowed_updates: &["callback_query"],
                },
            )
            .await
        {
            Ok(u) => u,
            Err(e) => {
                warn!("getUpdates failed: {e:#}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(query) = update.callback_query else {
                continue;
            };
            let Some((group_id, message_id)) =
                query.data.as_deref().and_then(parse_take_callback)
            else {
                continue;
            };

            let answer = match coordinator
                .quick_reply(replier.as_ref(), query.from.id, group_id, message_id)
                .await
            {
                Ok(()) => "Отклик отправлен в группу",
                Err(ReplyError::NoSession) => {
                    "Подключите свой аккаунт, чтобы откликаться на заказы"
                }
                Err(e) => {
                    warn!("Quick reply failed for driver {}: {e}", query.from.id);
                    "Не удалось отправить отклик"
                }
            };

            if let Err(e) = bot
                .call::<serde_json::Value>(
                    "answerCallbackQuery",
                    &AnswerCallbackPayload {
                        callback_query_id: &query.id,
                        text: answer,
                    },
                )
                .await
            {
                warn!("answerCallbackQuery failed: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session-based group replies
// ---------------------------------------------------------------------------

/// Posts take-order replies into source groups through an account session.
pub struct SessionReplier {
    api_id: i32,
    store: Arc<Store>,
}

impl SessionReplier {
    pub fn new(api_id: i32, store: Arc<Store>) -> Self {
        Self { api_id, store }
    }

    async fn reply_with(
        &self,
        client: &Client,
        group_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<i64, ReplyError> {
        let authorized = client
            .is_authorized()
            .await
            .map_err(|e| ReplyError::Other(e.into()))?;
        if !authorized {
            return Err(ReplyError::Permission);
        }

        let mut target = None;
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| ReplyError::Other(e.into()))?
        {
            let chat = dialog.peer();
            if canonical_group_id(chat.id().bare_id()) == group_id {
                target = Some(chat.clone());
                break;
            }
        }
        let Some(chat) = target else {
            // Not a member of the group at all.
            return Err(ReplyError::Permission);
        };

        let reply = InputMessage::new().text(text).reply_to(Some(message_id as i32));
        match client.send_message(&chat, reply).await {
            Ok(sent) => Ok(i64::from(sent.id())),
            Err(e) => {
                let raw = e.to_string();
                if raw.contains("FORBIDDEN") || raw.contains("CHAT_WRITE") || raw.contains("ADMIN")
                {
                    Err(ReplyError::Permission)
                } else {
                    Err(ReplyError::Other(e.into()))
                }
            }
        }
    }
}

#[async_trait]
impl GroupReplier for SessionReplier {
    async fn reply(
        &self,
        driver_id: i64,
        group_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<i64, ReplyError> {
        // The reply goes out under the driver's own account; a driver who
        // never connected one gets told to, not silently impersonated.
        let Some(session) = self
            .store
            .session_for_driver(driver_id)
            .map_err(ReplyError::Other)?
        else {
            return Err(ReplyError::NoSession);
        };

        let (client, pool) =
            telegram::connect(&session.session_file, self.api_id).map_err(ReplyError::Other)?;
        let runner = pool.runner;
        let _runner = telegram::RunnerGuard::new(tokio::spawn(async move {
            runner.run().await;
        }));

        self.reply_with(&client, group_id, message_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_callback_roundtrip() {
        let data = take_callback_data(234567890, 42);
        assert_eq!(data, "take_order:234567890:42");
        assert_eq!(parse_take_callback(&data), Some((234567890, 42)));
    }

    #[test]
    fn foreign_callback_data_is_ignored() {
        assert_eq!(parse_take_callback("settings:1"), None);
        assert_eq!(parse_take_callback("take_order:abc:1"), None);
        assert_eq!(parse_take_callback("take_order:1"), None);
    }

    #[tokio::test]
    async fn reply_for_unlinked_driver_reports_no_session() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // An authorized fleet session exists, but it belongs to nobody.
        store.add_session("+79010000001", "./s/1.sqlite", None).unwrap();

        let replier = SessionReplier::new(12345, store);
        let outcome = replier.reply(42, 234567890, 7, "+").await;
        assert!(matches!(outcome, Err(ReplyError::NoSession)));
    }

    #[test]
    fn keyboard_carries_link_and_callback() {
        let markup = keyboard(&NotificationActions {
            source_link: "https://t.me/c/234567890/42".into(),
            group_id: 234567890,
            message_id: 42,
        });
        let json = serde_json::to_string(&markup).unwrap();
        assert!(json.contains("https://t.me/c/234567890/42"));
        assert!(json.contains("take_order:234567890:42"));
        assert!(!json.contains("null"));
    }
}
