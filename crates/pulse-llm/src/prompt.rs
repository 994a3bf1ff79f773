use serde_json::Value;

/// Two-block system prompt for prompt caching.
///
/// The first block holds static context (persona, user profile, learned
/// patterns) and carries a cache breakpoint; the second holds volatile
/// per-call data and is never cached, placed last so it cannot break the
/// cached prefix. Providers without caching just concatenate.
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    pub cached: String,
    pub volatile: String,
}

impl SystemPrompt {
    pub fn new(cached: impl Into<String>, volatile: impl Into<String>) -> Self {
        Self {
            cached: cached.into(),
            volatile: volatile.into(),
        }
    }

    /// Single uncacheable block — for short one-off instructions.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            cached: String::new(),
            volatile: text.into(),
        }
    }

    pub fn to_plain_text(&self) -> String {
        match (self.cached.is_empty(), self.volatile.is_empty()) {
            (false, false) => format!("{}\n\n{}", self.cached, self.volatile),
            (false, true) => self.cached.clone(),
            _ => self.volatile.clone(),
        }
    }

    /// Content blocks with a cache_control marker on the static block.
    pub fn to_blocks(&self) -> Vec<Value> {
        let mut blocks = Vec::with_capacity(2);
        if !self.cached.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.cached,
                "cache_control": { "type": "ephemeral" }
            }));
        }
        if !self.volatile.is_empty() || blocks.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.volatile,
            }));
        }
        blocks
    }
}
