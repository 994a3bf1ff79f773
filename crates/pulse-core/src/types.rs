use serde::{Deserialize, Serialize};

/// Recency class of a base stream. Governs poll cadence and caching:
/// Hot polls every few seconds and is cached, Warm polls slowly,
/// Cold is only touched by the hourly patrol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

impl std::str::FromStr for Temperature {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            other => Err(format!("unknown temperature: {other}")),
        }
    }
}

/// The three trigger tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Simple threshold alert. Fires once from hot data, no LLM.
    Alert,
    /// Composite condition that starts the full signal pipeline.
    Signal,
    /// Condition with no numeric definition. Only patrol evaluates it.
    LlmEvaluated,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alert => write!(f, "alert"),
            Self::Signal => write!(f, "signal"),
            Self::LlmEvaluated => write!(f, "llm_evaluated"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Self::Alert),
            "signal" => Ok(Self::Signal),
            "llm_evaluated" => Ok(Self::LlmEvaluated),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Who created a trigger. System-created triggers are auto-retired after
/// 72 hours without firing; user-requested ones never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    UserRequest,
    LlmAuto,
    Patrol,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequest => write!(f, "user_request"),
            Self::LlmAuto => write!(f, "llm_auto"),
            Self::Patrol => write!(f, "patrol"),
        }
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_request" => Ok(Self::UserRequest),
            "llm_auto" => Ok(Self::LlmAuto),
            "patrol" => Ok(Self::Patrol),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

/// Trade side as reported by the venue. Spot venues report buy/sell,
/// derivatives venues long/short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
    Buy,
    Sell,
}

impl TradeSide {
    /// buy and long count as the same direction, as do sell and short.
    pub fn is_long_like(self) -> bool {
        matches!(self, Self::Long | Self::Buy)
    }

    pub fn is_short_like(self) -> bool {
        matches!(self, Self::Short | Self::Sell)
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown trade side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TradeSignal,
    Briefing,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TradeSignal => write!(f, "trade_signal"),
            Self::Briefing => write!(f, "briefing"),
        }
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade_signal" => Ok(Self::TradeSignal),
            "briefing" => Ok(Self::Briefing),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// Directional intent of an advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Exit,
    Watch,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Exit => write!(f, "exit"),
            Self::Watch => write!(f, "watch"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "exit" => Ok(Self::Exit),
            "watch" => Ok(Self::Watch),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeKind {
    Trade,
    Chat,
    Feedback,
    Signal,
    Patrol,
}

impl std::fmt::Display for EpisodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trade => write!(f, "trade"),
            Self::Chat => write!(f, "chat"),
            Self::Feedback => write!(f, "feedback"),
            Self::Signal => write!(f, "signal"),
            Self::Patrol => write!(f, "patrol"),
        }
    }
}

impl std::str::FromStr for EpisodeKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(Self::Trade),
            "chat" => Ok(Self::Chat),
            "feedback" => Ok(Self::Feedback),
            "signal" => Ok(Self::Signal),
            "patrol" => Ok(Self::Patrol),
            other => Err(format!("unknown episode kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatrolKind {
    Scheduled,
    DeferredRequest,
}

impl std::fmt::Display for PatrolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::DeferredRequest => write!(f, "deferred_request"),
        }
    }
}

impl std::str::FromStr for PatrolKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "deferred_request" => Ok(Self::DeferredRequest),
            other => Err(format!("unknown patrol kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipleSource {
    UserInput,
    Extracted,
}

impl std::fmt::Display for PrincipleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserInput => write!(f, "user_input"),
            Self::Extracted => write!(f, "extracted"),
        }
    }
}

impl std::str::FromStr for PrincipleSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_input" => Ok(Self::UserInput),
            "extracted" => Ok(Self::Extracted),
            other => Err(format!("unknown principle source: {other}")),
        }
    }
}

/// Onboarding stage at which a user becomes visible to the monitoring loops.
pub const MONITORED_STAGE: i64 = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn temperature_round_trips() {
        for t in [Temperature::Hot, Temperature::Warm, Temperature::Cold] {
            assert_eq!(Temperature::from_str(&t.to_string()).unwrap(), t);
        }
        assert!(Temperature::from_str("lukewarm").is_err());
    }

    #[test]
    fn trigger_kind_round_trips() {
        for k in [
            TriggerKind::Alert,
            TriggerKind::Signal,
            TriggerKind::LlmEvaluated,
        ] {
            assert_eq!(TriggerKind::from_str(&k.to_string()).unwrap(), k);
        }
    }

    #[test]
    fn side_direction_classes() {
        assert!(TradeSide::Buy.is_long_like());
        assert!(TradeSide::Long.is_long_like());
        assert!(TradeSide::Sell.is_short_like());
        assert!(TradeSide::Short.is_short_like());
        assert!(!TradeSide::Buy.is_short_like());
    }

    #[test]
    fn snake_case_serde_tags() {
        let k: TriggerKind = serde_json::from_str("\"llm_evaluated\"").unwrap();
        assert_eq!(k, TriggerKind::LlmEvaluated);
        let s: SignalKind = serde_json::from_str("\"trade_signal\"").unwrap();
        assert_eq!(s, SignalKind::TradeSignal);
    }
}
