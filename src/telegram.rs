//! Account session plumbing for the monitor fleet.

use anyhow::{Context, Result, anyhow};
use grammers_client::{Client, SignInError};
use grammers_mtsender::SenderPool;
use grammers_session::storages::SqliteSession;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

/// Open a session file and build a client over its own sender pool.
pub fn connect(session_path: &str, api_id: i32) -> Result<(Client, SenderPool)> {
    let session = Arc::new(SqliteSession::open(session_path)?);
    let pool = SenderPool::new(Arc::clone(&session), api_id);
    let client = Client::new(&pool);
    Ok((client, pool))
}

/// Owns the spawned pool-runner task and aborts it on drop. The owning
/// task may itself be aborted mid-await, so the disconnect must not rely
/// on reaching an explicit cleanup line.
pub struct RunnerGuard(tokio::task::JoinHandle<()>);

impl RunnerGuard {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Interactive first-time login for an account session. Only reached from
/// the bootstrap path when the roster holds no authorized session yet; the
/// fleet itself never prompts.
pub async fn ensure_user_login(client: &Client, phone: &str, api_hash: &str) -> Result<()> {
    if client.is_authorized().await? {
        return Ok(());
    }

    info!("Session for {phone} not authorized. Requesting login code...");
    let token = client
        .request_login_code(phone, api_hash)
        .await
        .context("request_login_code failed")?;

    let code = read_line("Enter the login code you received: ")?;

    match client.sign_in(&token, &code).await {
        Ok(user) => {
            info!(
                "Signed in as {:?}",
                user.first_name().unwrap_or("<unknown>")
            );
            Ok(())
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let pw = match std::env::var("TG_2FA_PASSWORD") {
                Ok(pw) if !pw.is_empty() => pw,
                _ => {
                    let hint = password_token.hint().unwrap_or("");
                    read_line(&format!(
                        "2FA password required (hint: {hint}). Enter password: "
                    ))?
                }
            };

            client
                .check_password(password_token, pw.as_bytes())
                .await
                .context("check_password failed")?;

            info!("Signed in with 2FA.");
            Ok(())
        }
        Err(e) => Err(anyhow!("sign_in failed: {e}")),
    }
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn runner_guard_aborts_its_task_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guard = RunnerGuard::new(tokio::spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await
        }));
        drop(guard);
        // The aborted task drops the sender; a leaked task would keep it
        // alive and the receiver would time out.
        let outcome = tokio::time::timeout(Duration::from_secs(1), rx).await;
        assert!(matches!(outcome, Ok(Err(_))));
    }
}
