//! Tolerant extraction from model output.
//!
//! Everything regex-shaped lives here: meta-block splitting, loose JSON
//! repair, direction keywords, confidence numbers, counter-argument and
//! stop-loss lines, and the principle stop-loss parser. Normalisation is
//! explicit (lowercase, trimmed) and every path has a safe fallback —
//! the tolerance is the point.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use pulse_core::types::{Direction, SignalKind};

/// Shown instead of an empty reply when the model emitted only metadata.
pub const FALLBACK_REPLY: &str = "응답을 생성하는데 문제가 있었어. 다시 말해줘!";

fn meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<!--\s*FORKER_META\s*(.*?)\s*FORKER_META\s*-->").expect("meta regex")
    })
}

fn html_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"))
}

/// Split a raw model response into visible text and the embedded meta
/// object, if any.
///
/// With a meta block, the visible text is everything before it. Without
/// one, the whole response minus HTML comments. An empty visible text is
/// replaced by [`FALLBACK_REPLY`].
pub fn split_meta(raw: &str) -> (String, Option<Value>) {
    let mut meta = None;
    let mut visible = match meta_re().find(raw) {
        Some(found) => {
            let captured = meta_re()
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            meta = parse_json_loose(&captured);
            raw[..found.start()].trim().to_string()
        }
        None => html_comment_re().replace_all(raw, "").trim().to_string(),
    };

    if visible.is_empty() {
        visible = FALLBACK_REPLY.to_string();
    }
    (visible, meta)
}

/// Parse a JSON object that may carry `//` line comments and trailing
/// commas. String-aware: neither repair touches quoted content.
pub fn parse_json_loose(raw: &str) -> Option<Value> {
    let cleaned = strip_comments_and_trailing_commas(raw);
    serde_json::from_str(cleaned.trim()).ok()
}

fn strip_comments_and_trailing_commas(raw: &str) -> String {
    let bytes: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '/' => {
                while i < bytes.len() && bytes[i] != '\n' {
                    i += 1;
                }
            }
            ',' => {
                // Drop the comma when the next non-whitespace closes a scope.
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == '}' || bytes[j] == ']') {
                    i += 1;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// First matching direction keyword, checked long → short → exit.
pub fn parse_direction(raw: &str) -> Direction {
    let lower = raw.to_lowercase();
    const LONG: [&str; 5] = ["long", "롱", "buy", "매수", "진입"];
    const SHORT: [&str; 4] = ["short", "숏", "sell", "매도"];
    const EXIT: [&str; 2] = ["exit", "청산"];

    if LONG.iter().any(|kw| lower.contains(kw)) {
        Direction::Long
    } else if SHORT.iter().any(|kw| lower.contains(kw)) {
        Direction::Short
    } else if EXIT.iter().any(|kw| lower.contains(kw)) {
        Direction::Exit
    } else {
        Direction::Watch
    }
}

/// Scale into [0,1]: percent-style inputs above 1 are divided down.
pub fn normalize_confidence(value: f64) -> f64 {
    let scaled = if value > 1.0 { value / 100.0 } else { value };
    scaled.clamp(0.0, 1.0)
}

/// Overall confidence from the three axes.
pub fn weighted_confidence(style: f64, history: f64, market: f64) -> f64 {
    style * 0.3 + history * 0.3 + market * 0.4
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"확신도[:\s]*(\d+(?:\.\d+)?)").expect("confidence regex"))
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percent regex"))
}

/// First `확신도 N` marker or bare percent in the text, else 0.5.
pub fn parse_confidence(raw: &str) -> f64 {
    let captured = confidence_re()
        .captures(raw)
        .or_else(|| percent_re().captures(raw))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    match captured {
        Some(n) => normalize_confidence(n / 100.0),
        None => 0.5,
    }
}

fn counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)(?:반대|⚠️).*?[:：]\s*(.+?)(?:\n\n|$)").expect("counter regex")
    })
}

pub fn parse_counter_argument(raw: &str) -> Option<String> {
    counter_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().chars().take(500).collect())
}

fn stop_loss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"손절[:\s]*(.+?)(?:\n|$)").expect("stop loss regex"))
}

pub fn parse_stop_loss(raw: &str) -> Option<String> {
    stop_loss_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn principle_stop_ko_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"손절.*?(-?\d+(?:\.\d+)?)\s*%").expect("principle regex"))
}

fn principle_stop_en_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)stop.?loss.*?(-?\d+(?:\.\d+)?)\s*%").expect("principle regex")
    })
}

/// Stop-loss percentage from a free-text principle like "손절 -5% 칼같이"
/// or "stop loss 5%". Always returned negative.
pub fn parse_principle_stop_loss(content: &str) -> Option<f64> {
    let value = principle_stop_ko_re()
        .captures(content)
        .or_else(|| principle_stop_en_re().captures(content))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())?;
    Some(if value < 0.0 { value } else { -value })
}

/// Structured advisory parsed out of the judge's reply.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub kind: SignalKind,
    pub direction: Direction,
    pub reasoning: String,
    pub counter_argument: Option<String>,
    pub confidence: f64,
    pub confidence_style: Option<f64>,
    pub confidence_history: Option<f64>,
    pub confidence_market: Option<f64>,
    pub stop_loss: Option<String>,
    pub content: String,
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("json block regex"))
}

/// Parse the judge's reply: structured JSON when present, otherwise the
/// heuristic keyword/regex fallback. Never fails.
pub fn parse_judge_response(raw: &str) -> JudgeVerdict {
    if let Some(parsed) = extract_judge_json(raw) {
        return parsed;
    }

    // Natural-language fallback.
    let direction = parse_direction(raw);
    let confidence = parse_confidence(raw);
    let counter = parse_counter_argument(raw);
    let stop_loss = parse_stop_loss(raw);

    let lower = raw.to_lowercase();
    let kind = if ["브리핑", "briefing", "참고"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        SignalKind::Briefing
    } else {
        SignalKind::TradeSignal
    };

    JudgeVerdict {
        kind,
        direction,
        reasoning: truncate(raw, 1000),
        counter_argument: counter,
        confidence,
        confidence_style: None,
        confidence_history: None,
        confidence_market: None,
        stop_loss,
        content: truncate(raw, 2000),
    }
}

fn extract_judge_json(raw: &str) -> Option<JudgeVerdict> {
    let candidate = json_block_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            // Bare object response without a fence.
            let trimmed = raw.trim();
            trimmed.starts_with('{').then(|| trimmed.to_string())
        })?;
    let data = parse_json_loose(&candidate)?;

    let kind = data["kind"]
        .as_str()
        .or_else(|| data["signal_type"].as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(SignalKind::TradeSignal);
    let direction = data["direction"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Direction::Watch);
    let reasoning = data["reasoning"]
        .as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| truncate(raw, 500));
    let counter_argument = data["counter_argument"].as_str().map(|s| s.to_string());
    let stop_loss = match &data["stop_loss"] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    let (confidence, style, history, market) = match &data["confidence"] {
        Value::Object(axes) => {
            let style = axes
                .get("style_match")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            let history = axes
                .get("historical_similar")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            let market = axes
                .get("market_context")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            (
                weighted_confidence(style, history, market),
                Some(style),
                Some(history),
                Some(market),
            )
        }
        Value::Number(n) => (
            normalize_confidence(n.as_f64().unwrap_or(0.5)),
            None,
            None,
            None,
        ),
        _ => (0.5, None, None, None),
    };

    let content = {
        let mut parts = vec![reasoning.clone()];
        if let Some(counter) = &counter_argument {
            parts.push(format!("반대 근거: {counter}"));
        }
        parts.join("\n\n")
    };

    Some(JudgeVerdict {
        kind,
        direction,
        reasoning,
        counter_argument,
        confidence,
        confidence_style: style,
        confidence_history: history,
        confidence_market: market,
        stop_loss,
        content,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_block_splits_visible_text() {
        let raw = "시장이 과열이야.\n<!-- FORKER_META {\"intent\": \"alert\"} FORKER_META -->";
        let (visible, meta) = split_meta(raw);
        assert_eq!(visible, "시장이 과열이야.");
        assert_eq!(meta.unwrap()["intent"], "alert");
    }

    #[test]
    fn meta_only_response_falls_back() {
        let raw = "<!-- FORKER_META {\"intent\": \"general\"} FORKER_META -->";
        let (visible, meta) = split_meta(raw);
        assert_eq!(visible, FALLBACK_REPLY);
        assert!(meta.is_some());
    }

    #[test]
    fn no_meta_strips_html_comments_when_needed() {
        let (visible, meta) = split_meta("그냥 답변");
        assert_eq!(visible, "그냥 답변");
        assert!(meta.is_none());

        let (visible, _) = split_meta("<!-- note -->");
        assert_eq!(visible, FALLBACK_REPLY);
    }

    #[test]
    fn loose_json_tolerates_comments_and_commas() {
        let raw = r#"{
            "direction": "long", // 추세 추종
            "url": "https://example.com/a",
            "values": [1, 2, 3,],
        }"#;
        let parsed = parse_json_loose(raw).unwrap();
        assert_eq!(parsed["direction"], "long");
        // URLs survive the comment stripper.
        assert_eq!(parsed["url"], "https://example.com/a");
        assert_eq!(parsed["values"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn direction_keywords() {
        assert_eq!(parse_direction("지금은 롱 관점이야"), Direction::Long);
        assert_eq!(parse_direction("I would SHORT here"), Direction::Short);
        assert_eq!(parse_direction("청산 추천"), Direction::Exit);
        assert_eq!(parse_direction("계속 지켜보자"), Direction::Watch);
        // long keywords win when both appear (checked first)
        assert_eq!(parse_direction("숏보다 매수 우위"), Direction::Long);
    }

    #[test]
    fn confidence_extraction_and_normalisation() {
        assert_eq!(parse_confidence("확신도 70 정도"), 0.7);
        assert_eq!(parse_confidence("about 65% sure"), 0.65);
        assert_eq!(parse_confidence("확신이 없다"), 0.5);
        assert_eq!(normalize_confidence(75.0), 0.75);
        assert_eq!(normalize_confidence(0.4), 0.4);
        assert_eq!(normalize_confidence(-3.0), 0.0);
    }

    #[test]
    fn weighted_confidence_stays_in_unit_interval() {
        assert!((weighted_confidence(0.7, 0.6, 0.8) - 0.71).abs() < 1e-9);
        for s in [0.0, 0.5, 1.0] {
            for h in [0.0, 0.5, 1.0] {
                for m in [0.0, 0.5, 1.0] {
                    let overall = weighted_confidence(s, h, m);
                    assert!((0.0..=1.0).contains(&overall));
                }
            }
        }
    }

    #[test]
    fn counter_and_stop_loss_lines() {
        let raw = "롱 관점.\n반대 근거: 거시 불확실성 잔존.\n\n손절: 148 이탈 시\n";
        assert_eq!(
            parse_counter_argument(raw).as_deref(),
            Some("거시 불확실성 잔존.")
        );
        assert_eq!(parse_stop_loss(raw).as_deref(), Some("148 이탈 시"));
        assert!(parse_counter_argument("긍정적 전망만").is_none());
    }

    #[test]
    fn principle_stop_loss_parsing() {
        assert_eq!(parse_principle_stop_loss("손절 -5% 칼같이"), Some(-5.0));
        assert_eq!(parse_principle_stop_loss("손절라인 7%"), Some(-7.0));
        assert_eq!(parse_principle_stop_loss("stop loss 3.5% max"), Some(-3.5));
        assert_eq!(parse_principle_stop_loss("분할 매수 원칙"), None);
    }

    #[test]
    fn judge_json_with_axes() {
        let raw = r#"분석 결과:
```json
{
  "kind": "trade_signal",
  "direction": "long",
  "reasoning": "거래대금 우위 지속",
  "counter_argument": "단기 과열",
  "confidence": {"style_match": 0.7, "historical_similar": 0.6, "market_context": 0.8},
  "stop_loss": "145"
}
```"#;
        let verdict = parse_judge_response(raw);
        assert_eq!(verdict.kind, SignalKind::TradeSignal);
        assert_eq!(verdict.direction, Direction::Long);
        assert!((verdict.confidence - 0.71).abs() < 1e-9);
        assert_eq!(verdict.confidence_style, Some(0.7));
        assert_eq!(verdict.stop_loss.as_deref(), Some("145"));
        assert!(verdict.content.contains("반대 근거"));
    }

    #[test]
    fn judge_scalar_confidence() {
        let raw = "```json\n{\"direction\": \"short\", \"reasoning\": \"x\", \"confidence\": 65}\n```";
        let verdict = parse_judge_response(raw);
        assert_eq!(verdict.direction, Direction::Short);
        assert_eq!(verdict.confidence, 0.65);
        assert!(verdict.confidence_style.is_none());
    }

    #[test]
    fn judge_natural_language_fallback() {
        let raw = "지금은 매수 타이밍으로 보여. 확신도 60.\n반대 근거: 김프 과열.\n\n손절: -5%";
        let verdict = parse_judge_response(raw);
        assert_eq!(verdict.direction, Direction::Long);
        assert_eq!(verdict.confidence, 0.6);
        assert_eq!(verdict.counter_argument.as_deref(), Some("김프 과열."));
        assert_eq!(verdict.stop_loss.as_deref(), Some("-5%"));
        assert_eq!(verdict.kind, SignalKind::TradeSignal);
    }

    #[test]
    fn judge_briefing_detection() {
        let verdict = parse_judge_response("오늘 시장 브리핑이야. 관망 추천.");
        assert_eq!(verdict.kind, SignalKind::Briefing);
        assert_eq!(verdict.direction, Direction::Watch);
    }
}
