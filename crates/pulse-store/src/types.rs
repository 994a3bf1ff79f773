use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pulse_core::types::{
    Direction, EpisodeKind, MessageRole, PatrolKind, PrincipleSource, SignalKind, TradeSide,
    TradeStatus, Temperature, TriggerKind, TriggerSource,
};

/// An enrolled user. `onboarding_stage >= 4` gates all monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Stable identity on the messenger side (chat id etc.).
    pub external_id: String,
    pub display_name: Option<String>,
    pub language: String,
    pub tier: String,
    pub onboarding_stage: i64,
    pub last_active_at: Option<DateTime<Utc>>,
    pub daily_signal_count: i64,
    pub daily_signal_reset_at: Option<DateTime<Utc>>,
    /// KST hour at which the daily briefing is wanted, if any.
    pub briefing_hour: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExchangeConnection {
    pub id: i64,
    pub user_id: i64,
    pub exchange: String,
    pub api_key_enc: Vec<u8>,
    pub api_secret_enc: Vec<u8>,
    pub is_active: bool,
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principle {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub source: PrincipleSource,
    pub is_active: bool,
}

/// A per-user subscription to a named market quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseStream {
    pub id: i64,
    pub user_id: i64,
    pub stream_type: String,
    pub symbol: Option<String>,
    pub config: Value,
    pub temperature: Temperature,
    pub last_mentioned_at: DateTime<Utc>,
    pub last_value: Option<Value>,
}

impl BaseStream {
    /// Snapshot key for this stream: `"{stream_type}/{symbol|all}"`.
    pub fn data_key(&self) -> String {
        format!(
            "{}/{}",
            self.stream_type,
            self.symbol.as_deref().unwrap_or("all")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrigger {
    pub id: i64,
    pub user_id: i64,
    pub kind: TriggerKind,
    pub condition: Option<Value>,
    pub composite_logic: Option<String>,
    pub base_streams_needed: Option<Value>,
    pub eval_prompt: Option<String>,
    pub data_needed: Option<Value>,
    pub description: String,
    pub source: TriggerSource,
    pub is_active: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a trigger.
#[derive(Debug, Clone, Default)]
pub struct NewTrigger {
    pub kind: Option<TriggerKind>,
    pub condition: Option<Value>,
    pub composite_logic: Option<String>,
    pub base_streams_needed: Option<Value>,
    pub eval_prompt: Option<String>,
    pub data_needed: Option<Value>,
    pub description: String,
    pub source: Option<TriggerSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user_id: i64,
    pub exchange: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub size: f64,
    pub leverage: f64,
    pub pnl_percent: Option<f64>,
    pub pnl_amount: Option<f64>,
    pub status: TradeStatus,
    pub inferred_reasoning: Option<String>,
    pub user_confirmed_reasoning: Option<bool>,
    pub user_actual_reasoning: Option<String>,
    pub episode_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    /// Base asset of the traded pair ("SOL/USDT" → "SOL").
    pub fn base_symbol(&self) -> &str {
        self.symbol.split('/').next().unwrap_or(&self.symbol)
    }
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub exchange: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub user_id: i64,
    pub kind: SignalKind,
    pub content: String,
    pub reasoning: String,
    pub counter_argument: Option<String>,
    pub confidence: f64,
    pub confidence_style: Option<f64>,
    pub confidence_history: Option<f64>,
    pub confidence_market: Option<f64>,
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub stop_loss: Option<String>,
    pub user_feedback: Option<String>,
    pub user_agreed: Option<bool>,
    pub trade_followed: Option<bool>,
    pub trade_result_pnl: Option<f64>,
    pub episode_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn base_symbol(&self) -> Option<&str> {
        self.symbol
            .as_deref()
            .map(|s| s.split('/').next().unwrap_or(s))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSignal {
    pub kind: Option<SignalKind>,
    pub content: String,
    pub reasoning: String,
    pub counter_argument: Option<String>,
    pub confidence: f64,
    pub confidence_style: Option<f64>,
    pub confidence_history: Option<f64>,
    pub confidence_market: Option<f64>,
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub stop_loss: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub user_id: i64,
    pub kind: EpisodeKind,
    pub market_context: Option<Value>,
    pub user_action: String,
    pub trade_data: Option<Value>,
    pub reasoning: Option<String>,
    pub trade_result: Option<Value>,
    pub feedback: Option<String>,
    pub expression_calibration: Option<Value>,
    pub style_tags: Option<Value>,
    pub embedding_text: String,
    pub vector_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an episode; all optional context starts empty.
#[derive(Debug, Clone)]
pub struct EpisodeDraft {
    pub kind: EpisodeKind,
    pub user_action: String,
    pub embedding_text: String,
    pub market_context: Option<Value>,
    pub trade_data: Option<Value>,
    pub reasoning: Option<String>,
    pub trade_result: Option<Value>,
    pub feedback: Option<String>,
    pub expression_calibration: Option<Value>,
    pub style_tags: Option<Value>,
}

impl EpisodeDraft {
    pub fn new(kind: EpisodeKind, user_action: impl Into<String>, embedding_text: impl Into<String>) -> Self {
        Self {
            kind,
            user_action: user_action.into(),
            embedding_text: embedding_text.into(),
            market_context: None,
            trade_data: None,
            reasoning: None,
            trade_result: None,
            feedback: None,
            expression_calibration: None,
            style_tags: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolLog {
    pub id: i64,
    pub user_id: i64,
    pub kind: PatrolKind,
    pub findings: Value,
    pub actions_taken: Value,
    pub temperature_changes: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub user_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub message_type: String,
    pub intent: Option<String>,
    pub metadata: Option<Value>,
    pub external_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an assistant/user chat log row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub intent: Option<String>,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn assistant(content: impl Into<String>, intent: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            intent: Some(intent.to_string()),
            metadata: None,
        }
    }
}
