//! End-to-end monitoring scenarios over scripted sources: alert firing,
//! the composite signal pipeline, trade detection and close linkage,
//! deferred trigger verdicts, and the risk fence.

use chrono::Duration;
use serde_json::json;

use pulse_core::types::{Direction, TradeSide, TradeStatus, TriggerKind, TriggerSource};
use pulse_engine::detector::TradeDetector;
use pulse_engine::judge::SignalPipeline;
use pulse_engine::patrol::PatrolService;
use pulse_engine::streams::StreamManager;
use pulse_engine::testutil::{harness, monitored_user, TestHarness};
use pulse_engine::trigger::TriggerEngine;
use pulse_sources::exchange::OrderRecord;
use pulse_store::types::{NewSignal, NewTrade, NewTrigger, User};

fn hot_stream_with_value(
    h: &TestHarness,
    user_id: i64,
    stream_type: &str,
    symbol: Option<&str>,
    value: serde_json::Value,
) {
    let now = h.services.clock.now_utc();
    let stream = h
        .services
        .store
        .upsert_stream(user_id, stream_type, symbol, None, now)
        .unwrap();
    h.services.store.set_stream_value(stream.id, &value).unwrap();
}

async fn evaluate_once(h: &TestHarness, user: &User) -> usize {
    let streams = StreamManager::new(h.services.clone());
    let snapshot = streams.hot_snapshot(user.id).await.unwrap();
    TriggerEngine::new(h.services.clone())
        .evaluate_all(user, &snapshot)
        .await
        .unwrap()
}

// --- S1: price alert ---------------------------------------------------

#[tokio::test]
async fn price_alert_fires_once_and_retires() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    hot_stream_with_value(&h, user.id, "price", Some("BTC"), json!({"last": 100000.0}));
    let trigger = h
        .services
        .store
        .create_trigger(
            user.id,
            &NewTrigger {
                kind: Some(TriggerKind::Alert),
                condition: Some(json!({
                    "type": "price_above", "symbol": "BTC", "value": 100000.0
                })),
                description: "BTC 10만 달러 돌파 알림".to_string(),
                ..Default::default()
            },
            now,
        )
        .unwrap();

    assert_eq!(evaluate_once(&h, &user).await, 1);

    let fired = h.services.store.trigger(trigger.id).unwrap();
    assert!(!fired.is_active);
    assert!(fired.triggered_at.is_some());

    let texts = h.messenger.sent_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("🔔 BTC 가격 도달 (100000)"));

    let messages = h.services.store.recent_messages(user.id, 5).unwrap();
    assert!(messages
        .iter()
        .any(|m| m.content.starts_with("🔔 BTC 가격 도달 (100000)")));

    // Re-running the same tick with an unchanged snapshot fires nothing.
    assert_eq!(evaluate_once(&h, &user).await, 0);
    assert_eq!(h.messenger.sent_texts().len(), 1);
}

// --- S2: composite signal through the pipeline -------------------------

#[tokio::test]
async fn composite_signal_runs_pipeline_with_axis_confidence() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    hot_stream_with_value(
        &h,
        user.id,
        "volume_ranking",
        Some("upbit"),
        json!({"top3_volume": 5.0e12, "btc_volume": 3.0e12}),
    );
    hot_stream_with_value(&h, user.id, "price", Some("BTC"), json!({"last": 100000.0}));

    h.services
        .store
        .create_trigger(
            user.id,
            &NewTrigger {
                kind: Some(TriggerKind::Signal),
                composite_logic: Some(
                    "volume_ranking_top3_volume > volume_ranking_btc_volume".to_string(),
                ),
                base_streams_needed: Some(json!([
                    {"stream_type": "volume_ranking", "source": "upbit"}
                ])),
                description: "거래대금 역전 시그널".to_string(),
                ..Default::default()
            },
            now,
        )
        .unwrap();

    h.llm.push(
        r#"```json
{
  "kind": "trade_signal",
  "direction": "long",
  "reasoning": "거래대금 상위권이 BTC를 앞섰어. 알트 순환 가능성.",
  "counter_argument": "단기 과열 시 되돌림 주의.",
  "confidence": {"style_match": 0.7, "historical_similar": 0.6, "market_context": 0.8},
  "stop_loss": "역전 해소 시"
}
```"#,
    );

    assert_eq!(evaluate_once(&h, &user).await, 1);

    let signals = h.services.store.recent_signals(user.id, 5).unwrap();
    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert_eq!(signal.direction, Some(Direction::Long));
    assert!((signal.confidence - 0.71).abs() < 1e-9);
    assert_eq!(signal.confidence_style, Some(0.7));
    assert_eq!(signal.confidence_history, Some(0.6));
    assert_eq!(signal.confidence_market, Some(0.8));

    // Interim note plus the final advisory, which carries the feedback
    // keyboard and the confidence bars.
    let sent = h.texts();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].1.contains("분석 중"));
    assert!(sent[1].1.contains("확신도: 71%"));
    assert!(sent[1].2, "final signal message must carry a keyboard");

    // The pipeline consumed the trigger and produced a signal episode.
    let active = h
        .services
        .store
        .active_triggers(user.id, &[TriggerKind::Signal])
        .unwrap();
    assert!(active.is_empty());
    assert_eq!(h.vector.upserts.lock().unwrap().len(), 1);

    // The user's daily budget was charged.
    assert_eq!(h.services.store.user(user.id).unwrap().daily_signal_count, 1);
}

// --- daily quota (invariant: at most the limit per UTC day) ------------

#[tokio::test]
async fn quota_blocks_without_consuming_trigger_and_resets_next_day() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();
    let limit = h.services.monitor.daily_signal_limit;
    h.services
        .store
        .set_daily_signal(user.id, limit, Some(now))
        .unwrap();

    let trigger = h
        .services
        .store
        .create_trigger(
            user.id,
            &NewTrigger {
                kind: Some(TriggerKind::Signal),
                condition: Some(json!({
                    "type": "price_above", "symbol": "SOL", "value": 1.0
                })),
                description: "SOL 시그널".to_string(),
                ..Default::default()
            },
            now,
        )
        .unwrap();

    let pipeline = SignalPipeline::new(h.services.clone());
    let trigger_row = h.services.store.trigger(trigger.id).unwrap();
    let result = pipeline.run(&user, &trigger_row).await.unwrap();
    assert!(result.is_none());
    assert!(h.texts().iter().any(|(_, text, _)| text.contains("다 썼어")));

    // The trigger was not consumed and no signal row exists.
    assert!(h.services.store.trigger(trigger.id).unwrap().is_active);
    assert!(h.services.store.recent_signals(user.id, 5).unwrap().is_empty());

    // Next UTC day the counter resets and the pipeline runs again.
    h.clock.advance(Duration::days(1));
    h.llm.push("```json\n{\"direction\": \"watch\", \"reasoning\": \"관망\", \"confidence\": 0.5}\n```");
    let result = pipeline.run(&user, &trigger_row).await.unwrap();
    assert!(result.is_some());
    assert_eq!(h.services.store.user(user.id).unwrap().daily_signal_count, 1);
}

// --- S3: new trade, reasoning, close, signal linkage -------------------

#[tokio::test]
async fn trade_lifecycle_links_signal_and_records_outcome() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    // A long SOL signal went out four hours ago.
    let signal = h
        .services
        .store
        .insert_signal(
            user.id,
            &NewSignal {
                content: "SOL 롱 상황".to_string(),
                reasoning: "펀딩비 음전 구간".to_string(),
                confidence: 0.7,
                symbol: Some("SOL".to_string()),
                direction: Some(Direction::Long),
                ..Default::default()
            },
            now - Duration::hours(4),
        )
        .unwrap();

    h.services
        .store
        .add_connection(user.id, "binance", b"enc-k", b"enc-s", now)
        .unwrap();
    let exchange = h.connector.install("binance");

    // 10:00 — a fresh buy order lands: 10 SOL for 1500 USDT.
    exchange.orders.lock().unwrap().push(OrderRecord {
        symbol: "SOL/USDT".to_string(),
        side: "buy".to_string(),
        amount: 10.0,
        cost: 1500.0,
        timestamp_ms: now.timestamp_millis(),
        status: "closed".to_string(),
        raw: json!({"type": "limit"}),
    });
    exchange.balances.lock().unwrap().extend([
        ("USDT".to_string(), 28_500.0),
        ("SOL".to_string(), 10.0),
    ]);

    h.llm
        .push("너 평소 펀딩비 음전 구간에서 SOL 진입하는 패턴이야. 이번에도 그랬던 것 같아.");

    let detector = TradeDetector::new(h.services.clone());
    assert_eq!(detector.poll_user(&user).await.unwrap(), 1);

    let open = h.services.store.open_trades(user.id).unwrap();
    assert_eq!(open.len(), 1);
    let trade = &open[0];
    assert_eq!(trade.entry_price, 150.0);
    assert_eq!(trade.size, 10.0);
    assert!(trade
        .inferred_reasoning
        .as_deref()
        .unwrap()
        .contains("SOL 진입"));
    assert!(h
        .texts()
        .iter()
        .any(|(_, text, kb)| text.contains("SOL/USDT 롱 감지") && *kb));

    // Detection is idempotent inside the dedup window.
    assert_eq!(detector.poll_user(&user).await.unwrap(), 0);

    // The user confirms the inferred reasoning.
    detector.confirm_trade_reasoning(&user, true).await.unwrap();
    assert_eq!(
        h.services
            .store
            .trade(trade.id)
            .unwrap()
            .user_confirmed_reasoning,
        Some(true)
    );

    // 14:00 — SOL drained from the balance, ticker at 165.
    h.clock.advance(Duration::hours(4));
    exchange.balances.lock().unwrap().insert("SOL".to_string(), 0.5);
    exchange
        .tickers
        .lock()
        .unwrap()
        .insert("SOL/USDT".to_string(), 165.0);

    assert_eq!(detector.detect_closes(&user).await.unwrap(), 1);

    let closed = h.services.store.trade(trade.id).unwrap();
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.exit_price, Some(165.0));
    assert!((closed.pnl_percent.unwrap() - 10.0).abs() < 1e-9);
    assert!((closed.pnl_amount.unwrap() - 150.0).abs() < 1e-9);
    assert!(closed.episode_id.is_some());

    // Commentary references the realised result and the averages.
    assert!(h
        .texts()
        .iter()
        .any(|(_, text, _)| text.contains("+10.0%") && text.contains("평균 익절")));

    // The feedback learner linked the earlier signal as a hit.
    let linked = h.services.store.signal(signal.id).unwrap();
    assert_eq!(linked.trade_followed, Some(true));
    assert!((linked.trade_result_pnl.unwrap() - 10.0).abs() < 1e-9);
    let episodes = h.services.store.recent_episodes(user.id, 10).unwrap();
    assert!(episodes
        .iter()
        .any(|ep| ep.feedback.as_deref() == Some("적중")));
}

#[tokio::test]
async fn dust_and_transfers_are_filtered() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();
    h.services
        .store
        .add_connection(user.id, "binance", b"k", b"s", now)
        .unwrap();
    let exchange = h.connector.install("binance");

    exchange.balances.lock().unwrap().insert("USDT".to_string(), 30_000.0);
    let ts = now.timestamp_millis();
    let mut orders = exchange.orders.lock().unwrap();
    // Dust: 0.5% of balance.
    orders.push(OrderRecord {
        symbol: "PEPE/USDT".to_string(),
        side: "buy".to_string(),
        amount: 1000.0,
        cost: 150.0,
        timestamp_ms: ts,
        status: "closed".to_string(),
        raw: json!({}),
    });
    // Transfer-typed row.
    orders.push(OrderRecord {
        symbol: "BTC/USDT".to_string(),
        side: "buy".to_string(),
        amount: 1.0,
        cost: 5000.0,
        timestamp_ms: ts,
        status: "closed".to_string(),
        raw: json!({"type": "deposit"}),
    });
    drop(orders);

    let detector = TradeDetector::new(h.services.clone());
    assert_eq!(detector.poll_user(&user).await.unwrap(), 0);
    assert!(h.services.store.open_trades(user.id).unwrap().is_empty());
}

// --- S4: unfollowed signal reconciliation ------------------------------

#[tokio::test]
async fn patrol_marks_stale_signal_unfollowed() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    let signal = h
        .services
        .store
        .insert_signal(
            user.id,
            &NewSignal {
                content: "ETH 숏 상황".to_string(),
                reasoning: "과열".to_string(),
                confidence: 0.6,
                symbol: Some("ETH".to_string()),
                direction: Some(Direction::Short),
                ..Default::default()
            },
            now - Duration::hours(25),
        )
        .unwrap();

    PatrolService::new(h.services.clone())
        .run_patrol(&user)
        .await
        .unwrap();

    let updated = h.services.store.signal(signal.id).unwrap();
    assert_eq!(updated.trade_followed, Some(false));

    let episodes = h.services.store.recent_episodes(user.id, 10).unwrap();
    let unfollowed: Vec<_> = episodes
        .iter()
        .filter(|ep| ep.feedback.as_deref() == Some("unfollowed"))
        .collect();
    assert_eq!(unfollowed.len(), 1);
}

// --- S5: deferred llm_evaluated trigger --------------------------------

#[tokio::test]
async fn deferred_trigger_retires_on_yes_verdict() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    let trigger = h
        .services
        .store
        .create_trigger(
            user.id,
            &NewTrigger {
                kind: Some(TriggerKind::LlmEvaluated),
                eval_prompt: Some(
                    "시장 전체 센티먼트가 공포 국면으로 전환됐는지 판단".to_string(),
                ),
                data_needed: Some(json!(["sentiment", "news"])),
                description: "시장 분위기 공포 전환 알림".to_string(),
                source: Some(TriggerSource::UserRequest),
                ..Default::default()
            },
            now,
        )
        .unwrap();

    h.llm.push("YES\n공포지수 25 진입 + 뉴스 공포 우세.");

    PatrolService::new(h.services.clone())
        .run_patrol(&user)
        .await
        .unwrap();

    let evaluated = h.services.store.trigger(trigger.id).unwrap();
    assert!(!evaluated.is_active);
    assert!(evaluated.triggered_at.is_some());
    assert!(h
        .texts()
        .iter()
        .any(|(_, text, _)| text.contains("🧠 순찰 결과") && text.contains("조건이 충족")));
}

#[tokio::test]
async fn deferred_trigger_stays_active_on_no_verdict() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();

    let trigger = h
        .services
        .store
        .create_trigger(
            user.id,
            &NewTrigger {
                kind: Some(TriggerKind::LlmEvaluated),
                eval_prompt: Some("공포 전환 판단".to_string()),
                data_needed: Some(json!(["sentiment"])),
                description: "공포 전환 알림".to_string(),
                source: Some(TriggerSource::UserRequest),
                ..Default::default()
            },
            now,
        )
        .unwrap();

    h.llm.push("NO\n아직 중립 구간이야.");

    PatrolService::new(h.services.clone())
        .run_patrol(&user)
        .await
        .unwrap();

    let evaluated = h.services.store.trigger(trigger.id).unwrap();
    assert!(evaluated.is_active, "NO keeps the watch running");
    assert!(evaluated.triggered_at.is_some());
    assert!(h
        .texts()
        .iter()
        .any(|(_, text, _)| text.contains("아직 조건 미충족")));
}

// --- S6: risk fence ----------------------------------------------------

async fn seed_closed_losses(h: &TestHarness, user: &User, pnls: &[f64]) {
    let now = h.services.clock.now_utc();
    for (i, pnl) in pnls.iter().enumerate() {
        let opened = now - Duration::hours(20 - i as i64);
        let trade = h
            .services
            .store
            .insert_trade(
                user.id,
                &NewTrade {
                    exchange: "binance".to_string(),
                    symbol: "BTC/USDT".to_string(),
                    side: TradeSide::Buy,
                    entry_price: 100.0,
                    size: 1.0,
                    leverage: 1.0,
                    opened_at: opened,
                },
                opened,
            )
            .unwrap();
        h.services
            .store
            .close_trade(
                trade.id,
                100.0 * (1.0 + pnl / 100.0),
                *pnl,
                *pnl,
                now - Duration::hours(10 - i as i64),
            )
            .unwrap();
    }
}

#[tokio::test]
async fn profit_close_breaks_the_loss_streak() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    // Newest-first closes will read −6, −4, −5.
    seed_closed_losses(&h, &user, &[-5.0, -4.0, -6.0]).await;

    let now = h.services.clock.now_utc();
    let winner = h
        .services
        .store
        .insert_trade(
            user.id,
            &NewTrade {
                exchange: "binance".to_string(),
                symbol: "SOL/USDT".to_string(),
                side: TradeSide::Buy,
                entry_price: 100.0,
                size: 1.0,
                leverage: 1.0,
                opened_at: now - Duration::hours(3),
            },
            now,
        )
        .unwrap();
    let winner = h.services.store.trade(winner.id).unwrap();

    TradeDetector::new(h.services.clone())
        .handle_close(&user, &winner, 102.0, 2.0)
        .await
        .unwrap();

    // Streak broken at the newest close: no warning line.
    assert!(!h.texts().iter().any(|(_, text, _)| text.contains("연속")));
}

#[tokio::test]
async fn fourth_consecutive_loss_draws_the_warning() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    seed_closed_losses(&h, &user, &[-5.0, -4.0, -6.0]).await;

    let now = h.services.clock.now_utc();
    let loser = h
        .services
        .store
        .insert_trade(
            user.id,
            &NewTrade {
                exchange: "binance".to_string(),
                symbol: "SOL/USDT".to_string(),
                side: TradeSide::Buy,
                entry_price: 100.0,
                size: 1.0,
                leverage: 1.0,
                opened_at: now - Duration::hours(3),
            },
            now,
        )
        .unwrap();
    let loser = h.services.store.trade(loser.id).unwrap();

    TradeDetector::new(h.services.clone())
        .handle_close(&user, &loser, 97.0, -3.0)
        .await
        .unwrap();

    assert!(h
        .texts()
        .iter()
        .any(|(_, text, _)| text.contains("연속 4회 손실이야. 쉬어가는 것도 전략이야.")));
}

// --- hot snapshot precedence (cache over stored value) -----------------

#[tokio::test]
async fn hot_snapshot_prefers_fresh_cache_over_last_value() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();
    let stream = h
        .services
        .store
        .upsert_stream(user.id, "price", Some("BTC"), None, now)
        .unwrap();

    let streams = StreamManager::new(h.services.clone());

    // Neither cache nor value: the key is absent.
    assert!(streams.hot_snapshot(user.id).await.unwrap().is_empty());

    // Stored value only.
    h.services
        .store
        .set_stream_value(stream.id, &json!({"last": 99000.0}))
        .unwrap();
    let snapshot = streams.hot_snapshot(user.id).await.unwrap();
    assert_eq!(snapshot["price/BTC"]["last"], 99000.0);

    // Fresh cache wins over the stored value.
    h.services
        .cache
        .set(
            &pulse_cache::stream_key(user.id, "price", Some("BTC")),
            &json!({"last": 100500.0}),
            60,
        )
        .await;
    let snapshot = streams.hot_snapshot(user.id).await.unwrap();
    assert_eq!(snapshot["price/BTC"]["last"], 100500.0);
}

// --- temperature lifecycle ----------------------------------------------

#[tokio::test]
async fn long_idle_hot_stream_falls_to_cold_in_one_pass() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let now = h.services.clock.now_utc();
    let stream = h
        .services
        .store
        .upsert_stream(user.id, "price", Some("XRP"), None, now)
        .unwrap();

    h.clock.advance(Duration::days(40));
    let streams = StreamManager::new(h.services.clone());
    let changes = streams.auto_transition(user.id).unwrap();
    assert_eq!(changes.hot_to_warm, 1);
    assert_eq!(changes.warm_to_cold, 1);
    assert_eq!(
        h.services.store.stream(stream.id).unwrap().temperature,
        pulse_core::types::Temperature::Cold
    );

    // A re-mention restores the stream to hot with a fresh timestamp.
    streams.touch(user.id, "XRP").unwrap();
    let restored = h.services.store.stream(stream.id).unwrap();
    assert_eq!(restored.temperature, pulse_core::types::Temperature::Hot);
    assert_eq!(restored.last_mentioned_at, h.services.clock.now_utc());
}

// --- preset idempotence -------------------------------------------------

#[tokio::test]
async fn default_preset_is_idempotent() {
    let h = harness();
    let user = monitored_user(&h.services, "812345");
    let streams = StreamManager::new(h.services.clone());

    assert_eq!(streams.create_default_preset(&user).unwrap(), 9);
    assert_eq!(streams.create_default_preset(&user).unwrap(), 0);

    let all = h
        .services
        .store
        .user_streams(
            user.id,
            &[
                pulse_core::types::Temperature::Hot,
                pulse_core::types::Temperature::Warm,
                pulse_core::types::Temperature::Cold,
            ],
        )
        .unwrap();
    assert_eq!(all.len(), 9);
}

// --- helper on the harness ----------------------------------------------

trait HarnessExt {
    fn texts(&self) -> Vec<(String, String, bool)>;
}

impl HarnessExt for TestHarness {
    fn texts(&self) -> Vec<(String, String, bool)> {
        self.messenger.texts.lock().unwrap().clone()
    }
}
