//! Trading pattern statistics derived on demand from trade history.
//! Read model only — nothing here mutates state.

use std::collections::HashMap;

use pulse_core::types::{TradeSide, TradeStatus};
use pulse_store::types::Trade;
use pulse_store::Store;

use crate::error::Result;

pub const TIME_BUCKETS: [&str; 4] = ["00-06", "06-12", "12-18", "18-24"];

#[derive(Debug, Clone, Default)]
pub struct TradePatterns {
    /// Most traded symbols with counts, descending, top 5.
    pub top_symbols: Vec<(String, usize)>,
    pub futures_ratio: f64,
    pub avg_hold_hours: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub max_win: f64,
    pub max_loss: f64,
    pub total_trades: usize,
    /// Trade counts per 6-hour UTC bucket, indexed like [`TIME_BUCKETS`].
    pub time_distribution: [usize; 4],
    /// Losses deeper than 2× the average loss.
    pub late_stop_ratio: f64,
    /// Wins below half the average win.
    pub early_tp_ratio: f64,
}

impl TradePatterns {
    /// Base assets of the user's top symbols ("BTC/USDT" → "BTC").
    pub fn primary_bases(&self) -> Vec<String> {
        self.top_symbols
            .iter()
            .map(|(symbol, _)| {
                symbol
                    .split('/')
                    .next()
                    .unwrap_or(symbol.as_str())
                    .to_string()
            })
            .collect()
    }
}

pub fn analyze(store: &Store, user_id: i64) -> Result<TradePatterns> {
    let trades = store.all_trades(user_id)?;
    if trades.is_empty() {
        return Ok(TradePatterns::default());
    }

    let mut symbol_counts: HashMap<&str, usize> = HashMap::new();
    for trade in &trades {
        *symbol_counts.entry(trade.symbol.as_str()).or_default() += 1;
    }
    let mut top_symbols: Vec<(String, usize)> = symbol_counts
        .into_iter()
        .map(|(symbol, count)| (symbol.to_string(), count))
        .collect();
    top_symbols.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_symbols.truncate(5);

    let total = trades.len();
    let futures_count = trades
        .iter()
        .filter(|t| matches!(t.side, TradeSide::Long | TradeSide::Short) || t.leverage > 1.0)
        .count();

    let closed: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.status == TradeStatus::Closed && t.pnl_percent.is_some())
        .collect();
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

    let avg_win = mean(&wins);
    let avg_loss = mean(&losses);

    let hold_hours: Vec<f64> = closed
        .iter()
        .filter_map(|t| {
            t.closed_at
                .map(|closed_at| (closed_at - t.opened_at).num_seconds() as f64 / 3600.0)
        })
        .collect();

    let mut time_distribution = [0usize; 4];
    for trade in &trades {
        let hour = chrono::Timelike::hour(&trade.opened_at) as usize;
        time_distribution[hour / 6] += 1;
    }

    // Habit ratios: late stops run past double the average loss, early
    // take-profits cash out under half the average win.
    let late_stops = if avg_loss < 0.0 {
        losses.iter().filter(|v| **v < avg_loss * 2.0).count()
    } else {
        0
    };
    let early_tps = if avg_win > 0.0 {
        wins.iter().filter(|v| **v < avg_win * 0.5).count()
    } else {
        0
    };

    Ok(TradePatterns {
        top_symbols,
        futures_ratio: round2(futures_count as f64 / total as f64),
        avg_hold_hours: round1(mean(&hold_hours)),
        win_rate: if closed.is_empty() {
            0.0
        } else {
            round2(wins.len() as f64 / closed.len() as f64)
        },
        avg_win: round1(avg_win),
        avg_loss: round1(avg_loss),
        max_win: round1(wins.iter().copied().fold(0.0, f64::max)),
        max_loss: round1(losses.iter().copied().fold(0.0, f64::min)),
        total_trades: total,
        time_distribution,
        late_stop_ratio: round2(ratio(late_stops, losses.len())),
        early_tp_ratio: round2(ratio(early_tps, wins.len())),
    })
}

/// Render the pattern stats into prompt-context text.
pub fn format_context(patterns: &TradePatterns) -> String {
    if patterns.total_trades == 0 {
        return "매매 이력 없음".to_string();
    }

    let mut lines = Vec::new();

    if !patterns.top_symbols.is_empty() {
        let top = patterns
            .top_symbols
            .iter()
            .map(|(symbol, count)| format!("{symbol}({count}건)"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("주 종목: {top}"));
    }

    lines.push(format!("선물 비율: {:.0}%", patterns.futures_ratio * 100.0));

    let hold = patterns.avg_hold_hours;
    if hold < 1.0 {
        lines.push(format!("평균 보유: {:.0}분 (스캘핑)", hold * 60.0));
    } else if hold < 24.0 {
        lines.push(format!("평균 보유: {hold:.1}시간 (데이트레이딩)"));
    } else {
        lines.push(format!("평균 보유: {:.1}일 (스윙)", hold / 24.0));
    }

    lines.push(format!(
        "승률: {:.0}%, 평균 익절: +{:.1}%, 평균 손절: {:.1}%",
        patterns.win_rate * 100.0,
        patterns.avg_win,
        patterns.avg_loss
    ));
    lines.push(format!(
        "최대: +{:.1}% / {:.1}%",
        patterns.max_win, patterns.max_loss
    ));

    if let Some(peak) = patterns
        .time_distribution
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
    {
        lines.push(format!(
            "주 매매 시간대: {} ({}건)",
            TIME_BUCKETS[peak.0], peak.1
        ));
    }

    let mut habits = Vec::new();
    if patterns.late_stop_ratio > 0.3 {
        habits.push(format!("늦은 손절 경향 ({:.0}%)", patterns.late_stop_ratio * 100.0));
    }
    if patterns.early_tp_ratio > 0.3 {
        habits.push(format!("빠른 익절 경향 ({:.0}%)", patterns.early_tp_ratio * 100.0));
    }
    if !habits.is_empty() {
        lines.push(format!("습관: {}", habits.join(", ")));
    }

    lines.join("\n")
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pulse_store::types::NewTrade;

    fn seeded_store() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("u", None, "ko", Utc::now()).unwrap();
        (store, user.id)
    }

    fn open_trade(
        store: &Store,
        user_id: i64,
        symbol: &str,
        side: TradeSide,
        opened_at: chrono::DateTime<Utc>,
    ) -> Trade {
        store
            .insert_trade(
                user_id,
                &NewTrade {
                    exchange: "binance".to_string(),
                    symbol: symbol.to_string(),
                    side,
                    entry_price: 100.0,
                    size: 1.0,
                    leverage: 1.0,
                    opened_at,
                },
                opened_at,
            )
            .unwrap()
    }

    #[test]
    fn empty_history_is_all_zero() {
        let (store, uid) = seeded_store();
        let patterns = analyze(&store, uid).unwrap();
        assert_eq!(patterns.total_trades, 0);
        assert_eq!(format_context(&patterns), "매매 이력 없음");
    }

    #[test]
    fn win_loss_statistics() {
        let (store, uid) = seeded_store();
        let base = Utc::now() - Duration::days(1);
        for (i, pnl) in [8.0, 12.0, -4.0, -6.0].iter().enumerate() {
            let t = open_trade(&store, uid, "BTC/USDT", TradeSide::Buy, base + Duration::hours(i as i64));
            store
                .close_trade(t.id, 100.0 * (1.0 + pnl / 100.0), *pnl, *pnl, base + Duration::hours(i as i64 + 2))
                .unwrap();
        }

        let p = analyze(&store, uid).unwrap();
        assert_eq!(p.total_trades, 4);
        assert_eq!(p.win_rate, 0.5);
        assert_eq!(p.avg_win, 10.0);
        assert_eq!(p.avg_loss, -5.0);
        assert_eq!(p.max_win, 12.0);
        assert_eq!(p.max_loss, -6.0);
        assert_eq!(p.avg_hold_hours, 2.0);
    }

    #[test]
    fn top_symbols_and_futures_ratio() {
        let (store, uid) = seeded_store();
        let now = Utc::now();
        for i in 0..3 {
            open_trade(&store, uid, "BTC/USDT", TradeSide::Buy, now - Duration::hours(i * 5));
        }
        open_trade(&store, uid, "SOL/USDT", TradeSide::Long, now - Duration::hours(40));

        let p = analyze(&store, uid).unwrap();
        assert_eq!(p.top_symbols[0].0, "BTC/USDT");
        assert_eq!(p.top_symbols[0].1, 3);
        assert_eq!(p.futures_ratio, 0.25);
        assert_eq!(p.primary_bases()[0], "BTC");
    }

    #[test]
    fn habit_ratios() {
        let (store, uid) = seeded_store();
        let base = Utc::now() - Duration::days(2);
        // Losses: -2, -2, -14 → avg -6; only -14 < -12 counts as late.
        // Wins: 10, 2 → avg 6; only 2 < 3 counts as early.
        for (i, pnl) in [-2.0, -2.0, -14.0, 10.0, 2.0].iter().enumerate() {
            let t = open_trade(&store, uid, "ETH/USDT", TradeSide::Buy, base + Duration::hours(i as i64));
            store
                .close_trade(t.id, 100.0, *pnl, *pnl, base + Duration::hours(i as i64 + 1))
                .unwrap();
        }
        let p = analyze(&store, uid).unwrap();
        assert!((p.late_stop_ratio - 1.0 / 3.0).abs() < 0.01);
        assert_eq!(p.early_tp_ratio, 0.5);
    }
}
