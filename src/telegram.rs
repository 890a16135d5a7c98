// =============================================================================
// Telegram transport — operator chat in, event narration out
// =============================================================================
//
// The bot token lives in the environment and is never logged. Outbound
// messages go through `sendMessage`; operator commands arrive via
// `getUpdates` long-polling consumed by the command loop.
// =============================================================================

use async_trait::async_trait;
use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::events::Event;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Outbound chat contract; implemented by [`TelegramClient`] and by mocks.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, chat_id: i64, text: String) -> Result<()>;
}

/// One inbound operator message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatUpdate {
    pub update_id: i64,
    pub chat_id: i64,
    pub text: String,
}

/// Thin Bot API client.
#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(40))
            .build()
            .expect("failed to build reqwest client");

        Self {
            token: token.into(),
            base_url: TELEGRAM_API.to_string(),
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    /// Long-poll for operator messages after `offset`, waiting up to
    /// `timeout_secs` server-side.
    #[instrument(skip(self), name = "telegram::get_updates")]
    pub async fn get_updates(&self, offset: i64, timeout_secs: u32) -> Result<Vec<ChatUpdate>> {
        let url = self.method_url("getUpdates");
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("getUpdates request failed")?;
        let payload: serde_json::Value =
            resp.json().await.context("getUpdates response unreadable")?;

        let updates = parse_updates(&payload)?;
        debug!(count = updates.len(), "updates received");
        Ok(updates)
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    #[instrument(skip(self, text), name = "telegram::send")]
    async fn send(&self, chat_id: i64, text: String) -> Result<()> {
        let url = self.method_url("sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .context("sendMessage response unreadable")?;

        if !status.is_success() || payload["ok"].as_bool() != Some(true) {
            anyhow::bail!(
                "sendMessage to {chat_id} failed: {status}: {}",
                payload["description"].as_str().unwrap_or("unknown")
            );
        }

        debug!(chat_id, "message sent");
        Ok(())
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Extract chat updates from a `getUpdates` payload, skipping non-text
/// updates.
fn parse_updates(payload: &serde_json::Value) -> Result<Vec<ChatUpdate>> {
    if payload["ok"].as_bool() != Some(true) {
        anyhow::bail!(
            "getUpdates failed: {}",
            payload["description"].as_str().unwrap_or("unknown")
        );
    }

    let mut updates = Vec::new();
    for entry in payload["result"].as_array().into_iter().flatten() {
        let Some(update_id) = entry["update_id"].as_i64() else {
            continue;
        };
        let message = &entry["message"];
        let (Some(chat_id), Some(text)) =
            (message["chat"]["id"].as_i64(), message["text"].as_str())
        else {
            continue;
        };
        updates.push(ChatUpdate {
            update_id,
            chat_id,
            text: text.to_string(),
        });
    }
    Ok(updates)
}

// ---------------------------------------------------------------------------
// Event formatting
// ---------------------------------------------------------------------------

/// Render an event as one chat message.
pub fn format_event(event: &Event) -> String {
    match event {
        Event::AnalysisStarted { timeframe, trigger } => {
            format!("[{timeframe}] analysis started ({trigger})")
        }
        Event::AnalysisCompleted {
            timeframe,
            analysis,
        } => {
            let signal = &analysis.trading_signals;
            format!(
                "[{timeframe}] analysis complete: {} / confidence {:.0}, trend {:.0}\n\
                 suggestion: {}{}",
                phase_label(analysis),
                analysis.confidence,
                analysis.trend_strength,
                signal.position_suggestion,
                match (signal.entry_price, signal.stop_loss, signal.take_profit1) {
                    (Some(entry), Some(sl), Some(tp)) =>
                        format!(" @ {entry} (SL {sl}, TP1 {tp}, {}x)", signal.leverage),
                    _ => String::new(),
                }
            )
        }
        Event::AnalysisFailed { timeframe, reason } => {
            format!("[{timeframe}] analysis failed: {reason}")
        }
        Event::SignalRejected { reason } => format!("signal rejected: {reason}"),
        Event::PlanProduced { suggestion, plan } => {
            if plan.is_empty() {
                format!("plan ({suggestion}): no action required")
            } else {
                let steps: Vec<String> = plan.iter().map(|a| a.to_string()).collect();
                format!("plan ({suggestion}): {}", steps.join(" -> "))
            }
        }
        Event::OrderSubmitted { action } => format!("submitting {action}"),
        Event::OrderFilled { action, order_id } => match order_id {
            Some(id) => format!("done: {action} (order {id})"),
            None => format!("done: {action}"),
        },
        Event::OrderFailed { action, reason } => {
            format!("FAILED: {action}: {reason}")
        }
        Event::NotifierOverflow { channel, dropped } => {
            format!("notifier overflow on '{channel}': {dropped} event(s) dropped")
        }
        Event::CommandAck { text } => text.clone(),
    }
}

fn phase_label(analysis: &crate::types::Analysis) -> String {
    format!(
        "phase {:?}, sentiment {:?}, risk {:?}",
        analysis.market_phase, analysis.overall_sentiment, analysis.risk_level
    )
    .to_lowercase()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, PlanAction};

    #[test]
    fn debug_redacts_token() {
        let client = TelegramClient::new("12345:secret-token");
        assert!(!format!("{client:?}").contains("secret-token"));
    }

    #[test]
    fn parse_updates_extracts_text_messages() {
        let payload = serde_json::json!({
            "ok": true,
            "result": [
                {
                    "update_id": 7,
                    "message": { "chat": { "id": 42 }, "text": "/status" }
                },
                { "update_id": 8, "message": { "chat": { "id": 42 } } },
                { "update_id": 9, "edited_channel_post": {} }
            ]
        });
        let updates = parse_updates(&payload).unwrap();
        assert_eq!(
            updates,
            vec![ChatUpdate {
                update_id: 7,
                chat_id: 42,
                text: "/status".into()
            }]
        );
    }

    #[test]
    fn parse_updates_rejects_api_errors() {
        let payload = serde_json::json!({ "ok": false, "description": "bad token" });
        assert!(parse_updates(&payload).is_err());
    }

    #[test]
    fn plan_formatting_joins_actions() {
        let event = Event::PlanProduced {
            suggestion: crate::types::Suggestion::Sell,
            plan: vec![
                PlanAction::ClosePosition,
                PlanAction::SetLeverage { leverage: 5 },
                PlanAction::OpenPosition {
                    side: OrderSide::Sell,
                    qty_base: 0.017,
                    entry_limit: 58_000.0,
                    stop_loss: 58_600.0,
                    take_profit: 56_800.0,
                },
            ],
        };
        let text = format_event(&event);
        assert!(text.contains("ClosePosition -> SetLeverage(5) -> OpenPosition"));
    }

    #[test]
    fn empty_plan_reads_as_no_action() {
        let event = Event::PlanProduced {
            suggestion: crate::types::Suggestion::Hold,
            plan: vec![],
        };
        assert!(format_event(&event).contains("no action"));
    }

    #[test]
    fn ack_formats_verbatim() {
        let event = Event::CommandAck {
            text: "balance: 1000 USDT".into(),
        };
        assert_eq!(format_event(&event), "balance: 1000 USDT");
    }
}
