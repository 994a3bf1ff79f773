//! Daily briefing: a personalised market summary delivered at the
//! user's chosen KST hour. The 5-minute job calls `due_users` and only
//! proceeds inside the first five minutes of the hour, so a missed tick
//! retried within grace stays idempotent.

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use pulse_core::types::TriggerKind;
use pulse_llm::{Message, SystemPrompt};
use pulse_store::types::{NewMessage, User};

use crate::context;
use crate::error::Result;
use crate::patterns;
use crate::services::Services;
use crate::trigger::Condition;

/// KST is a fixed offset; no tz database needed.
const KST_OFFSET_SECS: i32 = 9 * 3600;
/// The delivery window inside the hour, minutes [0, 4].
const WINDOW_MINUTES: u32 = 5;

const FALLBACK_COMMENTARY: &str = "오늘도 시장 잘 지켜보자!";

pub struct BriefingService {
    services: Services,
}

impl BriefingService {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Users whose briefing hour matches the current KST hour, when the
    /// current KST minute is inside the delivery window. Empty otherwise.
    pub fn due_users(&self) -> Result<Vec<User>> {
        let now = self.services.clock.now_utc();
        let (kst_hour, kst_minute) = kst_hour_minute(now);
        if kst_minute >= WINDOW_MINUTES {
            return Ok(Vec::new());
        }
        Ok(self.services.store.users_with_briefing_hour(kst_hour as i64)?)
    }

    pub async fn send_briefing(&self, user: &User) -> Result<()> {
        let market = self.gather_market_overview().await;
        let positions = self.services.store.open_trades(user.id)?;
        let pattern_stats = patterns::analyze(&self.services.store, user.id)?;
        let triggers = self
            .services
            .store
            .active_triggers(user.id, &[TriggerKind::Alert, TriggerKind::Signal])?;
        let hot_data = self
            .services
            .store
            .user_streams(user.id, &[pulse_core::types::Temperature::Hot])?
            .into_iter()
            .filter_map(|s| s.last_value.clone().map(|v| (s.data_key(), v)))
            .collect::<std::collections::HashMap<_, _>>();

        let commentary = self.generate_commentary(user, &market, &positions, &pattern_stats).await;

        let mut lines = vec!["📰 데일리 브리핑\n".to_string()];

        lines.push("📈 시장 개요".to_string());
        if let Some(btc) = market.btc.as_ref() {
            lines.push(format!(
                "  BTC ${:.0} ({:+.1}%) Vol ${:.1}B",
                btc["last"].as_f64().unwrap_or(0.0),
                btc["change_24h_pct"].as_f64().unwrap_or(0.0),
                btc["volume_24h"].as_f64().unwrap_or(0.0) / 1e9,
            ));
        }
        if let Some(eth) = market.eth.as_ref() {
            lines.push(format!(
                "  ETH ${:.0} ({:+.1}%)",
                eth["last"].as_f64().unwrap_or(0.0),
                eth["change_24h_pct"].as_f64().unwrap_or(0.0),
            ));
        }
        if let Some(fg) = market.fear_greed.as_ref() {
            lines.push(format!(
                "  Fear&Greed: {} ({})",
                fg["value"],
                fg["classification"].as_str().unwrap_or("?")
            ));
        }
        if let Some(funding) = market.btc_funding.as_ref() {
            lines.push(format!(
                "  BTC 펀딩비: {:.3}%",
                funding["rate_pct"].as_f64().unwrap_or(0.0)
            ));
        }
        if let Some(kimchi) = market.kimchi.as_ref() {
            lines.push(format!(
                "  김프: {:+.2}%",
                kimchi["premium_pct"].as_f64().unwrap_or(0.0)
            ));
        }

        if !positions.is_empty() {
            lines.push("\n💼 보유 포지션".to_string());
            for t in &positions {
                lines.push(format!("  {} {} @ {} (x{})", t.symbol, t.side, t.entry_price, t.leverage));
            }
            if pattern_stats.avg_win != 0.0 || pattern_stats.avg_loss != 0.0 {
                lines.push(format!(
                    "  (평균 익절 +{:.1}% / 손절 {:.1}%)",
                    pattern_stats.avg_win, pattern_stats.avg_loss
                ));
            }
        }

        if let Some(news) = market.news.as_ref() {
            if let Some(headlines) = news["headlines"].as_array() {
                if !headlines.is_empty() {
                    lines.push("\n📰 주요 뉴스".to_string());
                    for headline in headlines.iter().take(5).filter_map(Value::as_str) {
                        let clipped: String = headline.chars().take(80).collect();
                        lines.push(format!("  · {clipped}"));
                    }
                }
            }
        }

        if !triggers.is_empty() {
            lines.push("\n🔔 활성 알림".to_string());
            for trigger in triggers.iter().take(5) {
                let hint = proximity_hint(trigger.condition.as_ref(), &hot_data);
                lines.push(format!("  · {}{hint}", trigger.description));
            }
        }

        lines.push(format!("\n💬 오늘의 코멘트:\n{commentary}"));
        lines.push("\n⚠️ 매매를 대행하지 않습니다. 최종 판단은 본인의 몫입니다.".to_string());
        let text = lines.join("\n");

        let now = self.services.clock.now_utc();
        self.services.store.insert_message(
            user.id,
            &NewMessage {
                role: pulse_core::types::MessageRole::Assistant,
                content: text.clone(),
                intent: Some("general".to_string()),
                metadata: Some(serde_json::json!({"type": "daily_briefing"})),
            },
            now,
        )?;

        // Charts first, then the text, matching the reading order: BTC
        // always, plus the user's most-traded base when it differs.
        let mut chart_symbols = vec!["BTC".to_string()];
        if let Some(primary) = pattern_stats.primary_bases().first() {
            if primary != "BTC" {
                chart_symbols.push(primary.clone());
            }
        }
        for symbol in &chart_symbols {
            if let Some(chart) = self.services.chart.capture(symbol).await {
                self.services
                    .messenger
                    .send_photo(&user.external_id, &chart, Some(&format!("📸 {symbol} 4h 차트")))
                    .await;
            }
        }
        self.services
            .messenger
            .send_text(&user.external_id, &text, None)
            .await;

        info!(user_id = user.id, "daily briefing sent");
        Ok(())
    }

    async fn gather_market_overview(&self) -> MarketOverview {
        MarketOverview {
            btc: self.services.market.fetch("price", Some("BTC"), None).await,
            eth: self.services.market.fetch("price", Some("ETH"), None).await,
            btc_funding: self.services.market.fetch("funding", Some("BTC"), None).await,
            fear_greed: self
                .services
                .market
                .fetch("indicator", Some("fear_greed"), None)
                .await,
            kimchi: self.services.market.fetch("spread", Some("kimchi"), None).await,
            news: self.services.market.fetch("news", None, None).await,
        }
    }

    async fn generate_commentary(
        &self,
        user: &User,
        market: &MarketOverview,
        positions: &[pulse_store::types::Trade],
        pattern_stats: &patterns::TradePatterns,
    ) -> String {
        let intel = match context::build_intelligence_context(&self.services, user, "").await {
            Ok(intel) => intel,
            Err(e) => {
                warn!(user_id = user.id, error = %e, "intelligence context failed");
                return FALLBACK_COMMENTARY.to_string();
            }
        };

        let mut data_parts = Vec::new();
        if let (Some(btc), Some(eth)) = (&market.btc, &market.eth) {
            data_parts.push(format!(
                "BTC: ${:.0} ({:+.1}%)\nETH: ${:.0} ({:+.1}%)",
                btc["last"].as_f64().unwrap_or(0.0),
                btc["change_24h_pct"].as_f64().unwrap_or(0.0),
                eth["last"].as_f64().unwrap_or(0.0),
                eth["change_24h_pct"].as_f64().unwrap_or(0.0),
            ));
        }
        if !positions.is_empty() {
            let lines: Vec<String> = positions
                .iter()
                .map(|t| format!("- {} {} @ {}", t.symbol, t.side, t.entry_price))
                .collect();
            data_parts.push(format!("포지션:\n{}", lines.join("\n")));
        }
        if pattern_stats.total_trades > 0 {
            data_parts.push(format!(
                "패턴: 승률 {:.0}%, avg익절 +{:.1}%, avg손절 {:.1}%",
                pattern_stats.win_rate * 100.0,
                pattern_stats.avg_win,
                pattern_stats.avg_loss
            ));
        }

        let system = SystemPrompt::new(
            format!(
                "너는 유저의 투자 분신이야. 데일리 브리핑 코멘터리를 3~5문장으로 작성해.\n\
                 유저의 스타일/원칙/패턴을 반영해 '너처럼 봤을 때' 관점으로.\n\n\
                 ## Intelligence\n{}\n\n## 원칙\n{}",
                intel.stable, intel.principles
            ),
            String::new(),
        );
        match self
            .services
            .llm
            .fast(
                system,
                vec![Message::user(format!(
                    "오늘 시장 데이터:\n{}",
                    data_parts.join("\n\n")
                ))],
                500,
            )
            .await
        {
            Ok(response) => response.text.trim().to_string(),
            Err(e) => {
                error!(user_id = user.id, error = %e, "briefing commentary failed");
                FALLBACK_COMMENTARY.to_string()
            }
        }
    }
}

struct MarketOverview {
    btc: Option<Value>,
    eth: Option<Value>,
    btc_funding: Option<Value>,
    fear_greed: Option<Value>,
    kimchi: Option<Value>,
    news: Option<Value>,
}

pub fn kst_hour_minute(now: DateTime<Utc>) -> (u32, u32) {
    let kst = now.with_timezone(&FixedOffset::east_opt(KST_OFFSET_SECS).expect("fixed offset"));
    (kst.hour(), kst.minute())
}

/// Price-trigger proximity note for the active alerts section.
fn proximity_hint(
    condition: Option<&Value>,
    hot_data: &std::collections::HashMap<String, Value>,
) -> String {
    let Some(condition) = condition.and_then(|raw| Condition::parse(raw).ok()) else {
        return String::new();
    };
    if !matches!(
        condition.leaf,
        crate::trigger::Leaf::PriceAbove { .. } | crate::trigger::Leaf::PriceBelow { .. }
    ) {
        return String::new();
    }
    let (Some(symbol), Some(target)) = (condition.symbol(), condition.value()) else {
        return String::new();
    };
    let Some(current) = hot_data
        .get(&format!("price/{symbol}"))
        .and_then(|v| v["last"].as_f64())
    else {
        return String::new();
    };
    if target <= 0.0 {
        return String::new();
    }
    let diff_pct = (current / target - 1.0) * 100.0;
    format!(" (현재 ${current:.0}, {diff_pct:+.1}%)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, monitored_user};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn kst_conversion() {
        // 23:02 UTC = 08:02 KST next day.
        let utc = Utc.with_ymd_and_hms(2026, 7, 31, 23, 2, 0).unwrap();
        assert_eq!(kst_hour_minute(utc), (8, 2));
    }

    #[test]
    fn due_users_respects_window_and_hour() {
        let h = harness();
        let user = monitored_user(&h.services, "u-1");
        // Briefing at 08:00 KST.
        h.services.store.set_briefing_hour(user.id, Some(8)).unwrap();
        let briefing = BriefingService::new(h.services.clone());

        // 08:02 KST — inside the window.
        h.clock.set(Utc.with_ymd_and_hms(2026, 7, 31, 23, 2, 0).unwrap());
        assert_eq!(briefing.due_users().unwrap().len(), 1);

        // 08:07 KST — window passed.
        h.clock.set(Utc.with_ymd_and_hms(2026, 7, 31, 23, 7, 0).unwrap());
        assert!(briefing.due_users().unwrap().is_empty());

        // 09:02 KST — wrong hour.
        h.clock.set(Utc.with_ymd_and_hms(2026, 8, 1, 0, 2, 0).unwrap());
        assert!(briefing.due_users().unwrap().is_empty());
    }

    #[test]
    fn proximity_hint_for_price_triggers() {
        let condition = json!({"type": "price_above", "symbol": "BTC", "value": 100000.0});
        let hot = std::collections::HashMap::from([(
            "price/BTC".to_string(),
            json!({"last": 98000.0}),
        )]);
        let hint = proximity_hint(Some(&condition), &hot);
        assert!(hint.contains("$98000"));
        assert!(hint.contains("-2.0%"));

        let keyword = json!({"type": "news_keyword", "keyword": "etf"});
        assert_eq!(proximity_hint(Some(&keyword), &hot), "");
    }

    #[tokio::test]
    async fn briefing_persists_and_sends() {
        let h = harness();
        let user = monitored_user(&h.services, "u-1");
        h.market.put(
            "price",
            Some("BTC"),
            json!({"last": 100000.0, "change_24h_pct": 1.2, "volume_24h": 32.1e9}),
        );
        h.llm.push("오늘은 BTC 중심으로 관망이 맞아 보여.");

        let briefing = BriefingService::new(h.services.clone());
        briefing.send_briefing(&user).await.unwrap();

        let texts = h.messenger.sent_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("📰 데일리 브리핑"));
        assert!(texts[0].contains("BTC $100000"));
        assert!(texts[0].contains("관망이 맞아 보여"));

        let messages = h.services.store.recent_messages(user.id, 5).unwrap();
        assert!(messages.iter().any(|m| m.content.contains("데일리 브리핑")));
    }
}
