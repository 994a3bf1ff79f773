//! Open-position commentary: one line when live P&L crosses the user's
//! average win, stated stop, or average loss — debounced per trade so a
//! crossing speaks once.

use dashmap::DashMap;
use tracing::{debug, warn};

use pulse_llm::extract::parse_principle_stop_loss;
use pulse_store::types::{NewMessage, Trade, User};

use crate::detector::{pnl_percent, TradeDetector};
use crate::error::Result;
use crate::services::Services;

/// Which threshold a position last spoke about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentaryLevel {
    AvgWinReached,
    StopReached,
    AvgLossReached,
}

pub struct PositionMonitor {
    services: Services,
    last_commentary: DashMap<i64, CommentaryLevel>,
}

impl PositionMonitor {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            last_commentary: DashMap::new(),
        }
    }

    pub async fn monitor_user(&self, user: &User) -> Result<usize> {
        let open_trades = self.services.store.open_trades(user.id)?;
        if open_trades.is_empty() {
            return Ok(0);
        }

        let detector = TradeDetector::new(self.services.clone());
        let stats = detector.trade_stats(user.id)?;
        let principle_stop = self.principle_stop_loss(user.id)?;

        let connections = self.services.store.active_connections(user.id)?;
        let mut emitted = 0;

        for trade in open_trades {
            let Some(connection) = connections.iter().find(|c| c.exchange == trade.exchange)
            else {
                continue;
            };
            if trade.entry_price <= 0.0 {
                continue;
            }
            let source = match self.services.connector.connect(
                &connection.exchange,
                &connection.api_key_enc,
                &connection.api_secret_enc,
            ) {
                Ok(source) => source,
                Err(e) => {
                    warn!(exchange = %connection.exchange, error = %e, "exchange connection failed");
                    continue;
                }
            };
            let current_price = match source.fetch_ticker(&trade.symbol).await {
                Ok(ticker) => ticker.last,
                Err(e) => {
                    debug!(trade_id = trade.id, error = %e, "ticker fetch failed");
                    continue;
                }
            };
            if current_price <= 0.0 {
                continue;
            }

            let pnl = pnl_percent(trade.side, trade.entry_price, current_price);
            let Some((level, text)) =
                commentary(&trade, pnl, current_price, stats.avg_win, stats.avg_loss, principle_stop)
            else {
                // Back inside all thresholds: re-arm the debounce.
                self.last_commentary.remove(&trade.id);
                continue;
            };

            // Each crossing speaks once until the level changes.
            if self
                .last_commentary
                .get(&trade.id)
                .is_some_and(|last| *last == level)
            {
                continue;
            }
            self.last_commentary.insert(trade.id, level);

            let now = self.services.clock.now_utc();
            self.services.store.insert_message(
                user.id,
                &NewMessage::assistant(&text, "position_commentary"),
                now,
            )?;
            self.services
                .messenger
                .send_text(&user.external_id, &text, None)
                .await;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// A stop-loss percentage stated in the user's principles, if any.
    fn principle_stop_loss(&self, user_id: i64) -> Result<Option<f64>> {
        for principle in self.services.store.active_principles(user_id)? {
            if let Some(stop) = parse_principle_stop_loss(&principle.content) {
                return Ok(Some(stop));
            }
        }
        Ok(None)
    }
}

/// Threshold commentary. None below every threshold.
fn commentary(
    trade: &Trade,
    pnl: f64,
    current_price: f64,
    avg_win: f64,
    avg_loss: f64,
    principle_stop: Option<f64>,
) -> Option<(CommentaryLevel, String)> {
    if avg_win > 0.0 && pnl > 0.0 && pnl >= avg_win {
        return Some((
            CommentaryLevel::AvgWinReached,
            format!(
                "📊 {} {pnl:+.1}% (현재가 {current_price:.0})\n너 평균 익절 +{avg_win:.1}%인데 넘었어.",
                trade.symbol
            ),
        ));
    }
    if let Some(stop) = principle_stop {
        if pnl < 0.0 && pnl.abs() >= stop.abs() {
            return Some((
                CommentaryLevel::StopReached,
                format!(
                    "⚠️ {} {pnl:.1}% (현재가 {current_price:.0})\n너 원칙에서 손절 {stop:.0}%라고 했잖아.",
                    trade.symbol
                ),
            ));
        }
    }
    if avg_loss < 0.0 && pnl < 0.0 && pnl <= avg_loss {
        return Some((
            CommentaryLevel::AvgLossReached,
            format!(
                "📊 {} {pnl:.1}% (현재가 {current_price:.0})\n너 평균 손절 {avg_loss:.1}%야. 한번 봐봐.",
                trade.symbol
            ),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::types::{TradeSide, TradeStatus};

    fn open_sol() -> Trade {
        Trade {
            id: 7,
            user_id: 1,
            exchange: "binance".to_string(),
            symbol: "SOL/USDT".to_string(),
            side: TradeSide::Buy,
            entry_price: 150.0,
            exit_price: None,
            size: 10.0,
            leverage: 1.0,
            pnl_percent: None,
            pnl_amount: None,
            status: TradeStatus::Open,
            inferred_reasoning: None,
            user_confirmed_reasoning: None,
            user_actual_reasoning: None,
            episode_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn avg_win_crossing_speaks() {
        let (level, text) = commentary(&open_sol(), 9.0, 163.5, 8.3, -4.0, None).unwrap();
        assert_eq!(level, CommentaryLevel::AvgWinReached);
        assert!(text.contains("평균 익절 +8.3%"));
    }

    #[test]
    fn principle_stop_beats_avg_loss() {
        let (level, text) = commentary(&open_sol(), -5.5, 141.8, 8.3, -4.0, Some(-5.0)).unwrap();
        assert_eq!(level, CommentaryLevel::StopReached);
        assert!(text.contains("원칙에서 손절 -5%"));
    }

    #[test]
    fn avg_loss_without_principle() {
        let (level, _) = commentary(&open_sol(), -4.5, 143.3, 8.3, -4.0, None).unwrap();
        assert_eq!(level, CommentaryLevel::AvgLossReached);
    }

    #[test]
    fn quiet_inside_thresholds() {
        assert!(commentary(&open_sol(), 2.0, 153.0, 8.3, -4.0, Some(-5.0)).is_none());
        assert!(commentary(&open_sol(), -1.0, 148.5, 8.3, -4.0, Some(-5.0)).is_none());
    }
}
