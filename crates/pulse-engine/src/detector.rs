//! Trade detection over connected exchanges: new opens with inferred
//! reasoning, dust/transfer filtering, close detection with P&L, risk
//! pattern checks, and the reasoning confirm/deny follow-ups.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use pulse_core::config::TRADE_POLL_LOOKBACK_SECS;
use pulse_core::types::{EpisodeKind, TradeSide};
use pulse_llm::{Message, SystemPrompt};
use pulse_sources::exchange::{ExchangeSource, OrderRecord};
use pulse_store::types::{EpisodeDraft, NewMessage, NewTrade, Trade, User};

use crate::context;
use crate::error::Result;
use crate::feedback::FeedbackLearner;
use crate::messenger::confirm_reasoning_keyboard;
use crate::services::Services;

/// Two detections of the same fill within this window are one trade.
const DEDUP_TOLERANCE_SECS: i64 = 10;
/// Remaining balance below this fraction of the size counts as closed.
const CLOSE_REMAINDER_FRACTION: f64 = 0.1;
/// Loss streak length that draws a warning.
const LOSS_STREAK_THRESHOLD: usize = 3;
/// Opens within one hour that draw an overtrading warning.
const OPENS_PER_HOUR_THRESHOLD: i64 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct TradeStats {
    pub avg_win: f64,
    pub avg_loss: f64,
    pub win_rate: f64,
    pub total: usize,
}

pub struct TradeDetector {
    services: Services,
}

impl TradeDetector {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// One detection sweep for one user. Connections are polled
    /// sequentially to keep the user's message log ordered.
    pub async fn poll_user(&self, user: &User) -> Result<usize> {
        let connections = self.services.store.active_connections(user.id)?;
        if connections.is_empty() {
            return Ok(0);
        }

        let mut detected = 0;
        for connection in connections {
            let now = self.services.clock.now_utc();
            let floor = now - Duration::seconds(TRADE_POLL_LOOKBACK_SECS);
            let since = connection.last_polled_at.map_or(floor, |t| t.max(floor));
            let since_ms = since.timestamp_millis();

            let source = match self.services.connector.connect(
                &connection.exchange,
                &connection.api_key_enc,
                &connection.api_secret_enc,
            ) {
                Ok(source) => source,
                Err(e) => {
                    warn!(
                        user_id = user.id,
                        exchange = %connection.exchange,
                        error = %e,
                        "exchange connection failed"
                    );
                    continue;
                }
            };

            let total_balance_value = match source.fetch_balances().await {
                Ok(balances) => balances.values().sum::<f64>(),
                Err(e) => {
                    debug!(exchange = %connection.exchange, error = %e, "balance fetch failed");
                    0.0
                }
            };

            let orders = match source.list_orders_since(since_ms).await {
                Ok(orders) => orders,
                Err(e) => {
                    error!(
                        user_id = user.id,
                        exchange = %connection.exchange,
                        error = %e,
                        "order listing failed"
                    );
                    continue;
                }
            };

            for order in orders {
                if order.timestamp_ms <= since_ms {
                    continue;
                }
                if order.is_transfer() {
                    debug!(symbol = %order.symbol, "transfer skipped");
                    continue;
                }
                if is_dust(&order, total_balance_value, self.services.monitor.dust_threshold_percent) {
                    debug!(symbol = %order.symbol, cost = order.cost, "dust skipped");
                    continue;
                }
                if self
                    .handle_new_trade(user, &order, &connection.exchange)
                    .await?
                {
                    detected += 1;
                }
            }

            self.services
                .store
                .set_connection_polled(connection.id, self.services.clock.now_utc())?;
        }
        Ok(detected)
    }

    /// Record a genuine new open and ask the user to confirm the inferred
    /// reasoning. Returns false when the dedup window swallowed it.
    async fn handle_new_trade(
        &self,
        user: &User,
        order: &OrderRecord,
        exchange: &str,
    ) -> Result<bool> {
        if order.amount <= 0.0 {
            return Ok(false);
        }
        let opened_at = timestamp_from_ms(order.timestamp_ms)
            .unwrap_or_else(|| self.services.clock.now_utc());

        if self.services.store.duplicate_trade_exists(
            user.id,
            exchange,
            &order.symbol,
            opened_at,
            DEDUP_TOLERANCE_SECS,
        )? {
            return Ok(false);
        }

        let side: TradeSide = order.side.parse().unwrap_or(TradeSide::Buy);
        let now = self.services.clock.now_utc();
        let trade = self.services.store.insert_trade(
            user.id,
            &NewTrade {
                exchange: exchange.to_string(),
                symbol: order.symbol.clone(),
                side,
                entry_price: order.cost / order.amount,
                size: order.amount,
                leverage: 1.0,
                opened_at,
            },
            now,
        )?;

        let reasoning = self.infer_trade_reasoning(user, &trade).await;
        self.services
            .store
            .set_inferred_reasoning(trade.id, &reasoning)?;

        let direction = if side.is_long_like() { "롱" } else { "숏" };
        let text = format!(
            "🔄 {} {direction} 감지!\n\n금액: {:.0} | 수량: {}\n\n{reasoning}\n\n맞지?",
            order.symbol, order.cost, order.amount
        );
        self.services.store.insert_message(
            user.id,
            &NewMessage {
                role: pulse_core::types::MessageRole::Assistant,
                content: text.clone(),
                intent: Some("trade_reasoning".to_string()),
                metadata: Some(json!({"trade_id": trade.id})),
            },
            now,
        )?;
        self.services
            .messenger
            .send_text(&user.external_id, &text, Some(&confirm_reasoning_keyboard()))
            .await;

        info!(
            user_id = user.id,
            exchange,
            symbol = %order.symbol,
            side = %side,
            entry_price = trade.entry_price,
            "trade detected"
        );
        Ok(true)
    }

    /// Hypothesise why the user entered, from their style, principles,
    /// and recent episodes. Model failure degrades to a fixed ask.
    async fn infer_trade_reasoning(&self, user: &User, trade: &Trade) -> String {
        let episodes = match self.services.store.recent_episodes(user.id, 5) {
            Ok(eps) => eps,
            Err(_) => Vec::new(),
        };
        let episode_lines = if episodes.is_empty() {
            "없음".to_string()
        } else {
            episodes
                .iter()
                .map(|ep| format!("- [{}] {}", ep.kind, ep.user_action))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let principles = self
            .services
            .store
            .active_principles(user.id)
            .map(|list| {
                if list.is_empty() {
                    "없음".to_string()
                } else {
                    list.iter()
                        .enumerate()
                        .map(|(i, p)| format!("{}. {}", i + 1, p.content))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            })
            .unwrap_or_else(|_| "없음".to_string());

        let system = SystemPrompt::new(
            format!(
                "너는 유저의 투자 분신이야. 유저가 왜 이 매매를 했을지 2~3문장으로 추론해.\n\n\
                 ## 원칙\n{principles}\n\n## 최근 에피소드\n{episode_lines}"
            ),
            format!(
                "매매: {} {} @ {} × {} ({})",
                trade.symbol, trade.side, trade.entry_price, trade.size, trade.exchange
            ),
        );
        let prompt = format!(
            "{} {} 진입 — 이 유저가 왜 이 시점에 이 매매를 했을지 추론해.",
            trade.symbol, trade.side
        );

        match self
            .services
            .llm
            .deep(system, vec![Message::user(prompt)], 500)
            .await
        {
            Ok(response) => response.text.trim().to_string(),
            Err(e) => {
                error!(trade_id = trade.id, error = %e, "reasoning inference failed");
                "근거 추론에 실패했어. 직접 알려줄래?".to_string()
            }
        }
    }

    /// Close detection: an open trade whose base asset has drained from
    /// the venue balance is treated as closed at the current ticker.
    pub async fn detect_closes(&self, user: &User) -> Result<usize> {
        let open_trades = self.services.store.open_trades(user.id)?;
        if open_trades.is_empty() {
            return Ok(0);
        }

        let connections = self.services.store.active_connections(user.id)?;
        let mut sources: HashMap<String, Box<dyn ExchangeSource>> = HashMap::new();
        for connection in &connections {
            match self.services.connector.connect(
                &connection.exchange,
                &connection.api_key_enc,
                &connection.api_secret_enc,
            ) {
                Ok(source) => {
                    sources.insert(connection.exchange.clone(), source);
                }
                Err(e) => {
                    warn!(exchange = %connection.exchange, error = %e, "exchange connection failed");
                }
            }
        }

        let mut closed = 0;
        for trade in open_trades {
            let Some(source) = sources.get(&trade.exchange) else {
                continue;
            };
            let balances = match source.fetch_balances().await {
                Ok(balances) => balances,
                Err(e) => {
                    debug!(trade_id = trade.id, error = %e, "balance fetch failed");
                    continue;
                }
            };
            let remaining = balances.get(trade.base_symbol()).copied().unwrap_or(0.0);
            if remaining >= trade.size * CLOSE_REMAINDER_FRACTION {
                continue;
            }

            let exit_price = match source.fetch_ticker(&trade.symbol).await {
                Ok(ticker) => ticker.last,
                Err(e) => {
                    debug!(trade_id = trade.id, error = %e, "exit ticker fetch failed");
                    0.0
                }
            };
            let pnl_percent = if exit_price > 0.0 && trade.entry_price > 0.0 {
                pnl_percent(trade.side, trade.entry_price, exit_price)
            } else {
                0.0
            };

            self.handle_close(user, &trade, exit_price, pnl_percent).await?;
            closed += 1;
        }
        Ok(closed)
    }

    /// Close bookkeeping, in contract order: feedback linkage, episode,
    /// risk checks, commentary message.
    pub async fn handle_close(
        &self,
        user: &User,
        trade: &Trade,
        exit_price: f64,
        pnl_pct: f64,
    ) -> Result<()> {
        let now = self.services.clock.now_utc();
        let pnl_amount = (exit_price - trade.entry_price) * trade.size;
        self.services
            .store
            .close_trade(trade.id, exit_price, pnl_pct, pnl_amount, now)?;
        let closed = self.services.store.trade(trade.id)?;

        let learner = FeedbackLearner::new(self.services.clone());
        if let Err(e) = learner.on_trade_close(user, &closed).await {
            warn!(trade_id = trade.id, error = %e, "trade close feedback failed");
        }

        let episode_id = context::create_episode(
            &self.services,
            user,
            {
                let mut draft = EpisodeDraft::new(
                    EpisodeKind::Trade,
                    format!("{} {} 청산: {pnl_pct:+.1}%", closed.symbol, closed.side),
                    format!(
                        "{} {} 진입가 {} 청산가 {exit_price} 결과 {pnl_pct:+.1}% 근거: {}",
                        closed.symbol,
                        closed.side,
                        closed.entry_price,
                        closed.inferred_reasoning.as_deref().unwrap_or("미확인")
                    ),
                );
                draft.trade_data = Some(json!({
                    "symbol": closed.symbol,
                    "side": closed.side.to_string(),
                    "entry_price": closed.entry_price,
                    "exit_price": exit_price,
                    "pnl_percent": pnl_pct,
                }));
                draft.trade_result = Some(json!({
                    "pnl_percent": pnl_pct,
                    "exit_price": exit_price,
                }));
                draft.reasoning = closed.inferred_reasoning.clone();
                draft
            },
            true,
        )
        .await?;
        self.services.store.set_trade_episode(trade.id, episode_id)?;

        let risk_warning = self.check_risk_patterns(user)?;
        let stats = self.trade_stats(user.id)?;
        let mut text = close_message(&closed, pnl_pct, &stats);
        if let Some(warning) = risk_warning {
            text.push_str(&format!("\n\n⚠️ {warning}"));
        }

        self.services
            .store
            .insert_message(user.id, &NewMessage::assistant(&text, "trade_close"), now)?;
        self.services
            .messenger
            .send_text(&user.external_id, &text, None)
            .await;

        info!(
            user_id = user.id,
            trade_id = trade.id,
            symbol = %closed.symbol,
            pnl_percent = pnl_pct,
            "trade closed"
        );
        Ok(())
    }

    /// Consecutive-loss streak over the last five closes, and opens per
    /// hour. One short warning line at most.
    pub fn check_risk_patterns(&self, user: &User) -> Result<Option<String>> {
        let recent = self.services.store.closed_trades_desc(user.id, 5)?;
        let mut consecutive_losses = 0;
        for trade in &recent {
            match trade.pnl_percent {
                Some(pnl) if pnl < 0.0 => consecutive_losses += 1,
                _ => break,
            }
        }
        if consecutive_losses >= LOSS_STREAK_THRESHOLD {
            return Ok(Some(format!(
                "연속 {consecutive_losses}회 손실이야. 쉬어가는 것도 전략이야."
            )));
        }

        let hour_ago = self.services.clock.now_utc() - Duration::hours(1);
        let opens = self.services.store.count_opens_since(user.id, hour_ago)?;
        if opens >= OPENS_PER_HOUR_THRESHOLD {
            return Ok(Some(
                "1시간 안에 3건 이상 매매했어. 과매매 아닌지 한번 생각해봐.".to_string(),
            ));
        }
        Ok(None)
    }

    pub fn trade_stats(&self, user_id: i64) -> Result<TradeStats> {
        let closed = self.services.store.closed_trades_desc(user_id, 1000)?;
        if closed.is_empty() {
            return Ok(TradeStats::default());
        }
        let wins: Vec<f64> = closed
            .iter()
            .filter_map(|t| t.pnl_percent)
            .filter(|p| *p > 0.0)
            .collect();
        let losses: Vec<f64> = closed
            .iter()
            .filter_map(|t| t.pnl_percent)
            .filter(|p| *p < 0.0)
            .collect();
        Ok(TradeStats {
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            win_rate: wins.len() as f64 / closed.len() as f64 * 100.0,
            total: closed.len(),
        })
    }

    /// The user answered the reasoning confirm/deny surface.
    pub async fn confirm_trade_reasoning(&self, user: &User, confirmed: bool) -> Result<()> {
        let Some(trade) = self.services.store.latest_unconfirmed_trade(user.id)? else {
            return Ok(());
        };
        self.services
            .store
            .set_confirmed_reasoning(trade.id, confirmed)?;

        if confirmed {
            context::create_episode(
                &self.services,
                user,
                {
                    let mut draft = EpisodeDraft::new(
                        EpisodeKind::Trade,
                        format!("{} {} 진입", trade.symbol, trade.side),
                        format!(
                            "{} {} @ {} 근거: {}",
                            trade.symbol,
                            trade.side,
                            trade.entry_price,
                            trade.inferred_reasoning.as_deref().unwrap_or("")
                        ),
                    );
                    draft.trade_data = Some(json!({
                        "symbol": trade.symbol,
                        "side": trade.side.to_string(),
                        "entry_price": trade.entry_price,
                        "exchange": trade.exchange,
                    }));
                    draft.reasoning = trade.inferred_reasoning.clone();
                    draft
                },
                false,
            )
            .await?;
        }
        Ok(())
    }

    /// The user typed their own reasoning after denying the inference.
    pub async fn save_user_reasoning(&self, user: &User, reason_text: &str) -> Result<()> {
        let Some(trade) = self.services.store.latest_denied_without_reason(user.id)? else {
            return Ok(());
        };
        self.services
            .store
            .set_actual_reasoning(trade.id, reason_text)?;

        context::create_episode(
            &self.services,
            user,
            {
                let mut draft = EpisodeDraft::new(
                    EpisodeKind::Trade,
                    format!("{} {} 진입 (유저 근거)", trade.symbol, trade.side),
                    format!(
                        "{} {} @ {} 유저 근거: {reason_text}",
                        trade.symbol, trade.side, trade.entry_price
                    ),
                );
                draft.trade_data = Some(json!({
                    "symbol": trade.symbol,
                    "side": trade.side.to_string(),
                    "entry_price": trade.entry_price,
                    "exchange": trade.exchange,
                }));
                draft.reasoning = Some(reason_text.to_string());
                draft
            },
            false,
        )
        .await?;
        info!(user_id = user.id, trade_id = trade.id, "user reasoning saved");
        Ok(())
    }
}

/// Signed close percentage: long gains on exit > entry, short inverts.
pub fn pnl_percent(side: TradeSide, entry: f64, exit: f64) -> f64 {
    if side.is_long_like() {
        (exit - entry) / entry * 100.0
    } else {
        (entry - exit) / entry * 100.0
    }
}

/// Orders below the threshold share of total balance value are noise.
pub fn is_dust(order: &OrderRecord, total_balance_value: f64, threshold_percent: f64) -> bool {
    if total_balance_value <= 0.0 || order.cost <= 0.0 {
        return true;
    }
    order.cost / total_balance_value * 100.0 < threshold_percent
}

fn timestamp_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    (ms > 0).then(|| Utc.timestamp_millis_opt(ms).single()).flatten()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn close_message(trade: &Trade, pnl_pct: f64, stats: &TradeStats) -> String {
    if pnl_pct >= 0.0 {
        let commentary = if stats.avg_win > 0.0 {
            format!("네 평균 익절 {:+.1}%", stats.avg_win)
        } else {
            "첫 익절 기록이야.".to_string()
        };
        format!("📈 {} {pnl_pct:+.1}% · {commentary}", trade.symbol)
    } else {
        let commentary = if stats.avg_loss < 0.0 {
            format!("네 평균 손절 {:.1}%", stats.avg_loss)
        } else {
            String::new()
        };
        format!(
            "📉 {} {pnl_pct:+.1}% · {commentary}\n\n같이 복기해볼까?\n① 진입 근거: {}\n② 결과: {pnl_pct:+.1}%",
            trade.symbol,
            trade.inferred_reasoning.as_deref().unwrap_or("미확인"),
        )
    }
}
