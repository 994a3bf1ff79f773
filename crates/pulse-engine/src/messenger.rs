//! Outbound messaging boundary.
//!
//! The engine only knows this trait; the concrete adapter (Telegram or
//! otherwise) is a collaborator wired in by the daemon. Send failures
//! are logged inside implementations and never propagate into the core.

use async_trait::async_trait;
use tracing::info;

/// Inline control surface attached to a message (feedback buttons etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyboard {
    pub buttons: Vec<Vec<KeyboardButton>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardButton {
    pub label: String,
    pub action: String,
}

impl KeyboardButton {
    fn new(label: &str, action: &str) -> Self {
        Self {
            label: label.to_string(),
            action: action.to_string(),
        }
    }
}

/// Agree/disagree surface sent with every signal.
pub fn signal_feedback_keyboard() -> Keyboard {
    Keyboard {
        buttons: vec![vec![
            KeyboardButton::new("👍 맞아", "feedback:agree"),
            KeyboardButton::new("👎 아니야", "feedback:disagree"),
        ]],
    }
}

/// Confirm/deny surface sent with an inferred trade reasoning.
pub fn confirm_reasoning_keyboard() -> Keyboard {
    Keyboard {
        buttons: vec![vec![
            KeyboardButton::new("맞아", "reason:yes"),
            KeyboardButton::new("아니야", "reason:no"),
        ]],
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, recipient: &str, text: &str, keyboard: Option<&Keyboard>);

    async fn send_photo(&self, recipient: &str, bytes: &[u8], caption: Option<&str>);

    async fn edit_text(&self, handle: &str, text: &str);
}

/// Default stub: logs outbound traffic instead of delivering it. Used
/// until a channel adapter is wired in.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_text(&self, recipient: &str, text: &str, keyboard: Option<&Keyboard>) {
        info!(
            recipient,
            with_keyboard = keyboard.is_some(),
            "send_text: {}",
            text.lines().next().unwrap_or("")
        );
    }

    async fn send_photo(&self, recipient: &str, bytes: &[u8], caption: Option<&str>) {
        info!(recipient, size = bytes.len(), ?caption, "send_photo");
    }

    async fn edit_text(&self, handle: &str, text: &str) {
        info!(handle, "edit_text: {}", text.lines().next().unwrap_or(""));
    }
}
