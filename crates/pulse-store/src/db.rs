use rusqlite::{Connection, Result};

/// Initialise all tables and indices. Safe to call on every startup —
/// CREATE IF NOT EXISTS makes it idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_users_table(conn)?;
    create_exchange_connections_table(conn)?;
    create_principles_table(conn)?;
    create_base_streams_table(conn)?;
    create_user_triggers_table(conn)?;
    create_trades_table(conn)?;
    create_signals_table(conn)?;
    create_episodes_table(conn)?;
    create_patrol_logs_table(conn)?;
    create_chat_messages_table(conn)?;
    Ok(())
}

fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id           TEXT NOT NULL UNIQUE,
            display_name          TEXT,
            language              TEXT NOT NULL DEFAULT 'ko',
            tier                  TEXT NOT NULL DEFAULT 'pro',
            onboarding_stage      INTEGER NOT NULL DEFAULT 0,
            last_active_at        TEXT,
            daily_signal_count    INTEGER NOT NULL DEFAULT 0,
            daily_signal_reset_at TEXT,
            briefing_hour         INTEGER,
            is_active             INTEGER NOT NULL DEFAULT 1,
            created_at            TEXT NOT NULL
        );",
    )
}

fn create_exchange_connections_table(conn: &Connection) -> Result<()> {
    // Credentials are AES-256-GCM ciphertext only. Plaintext never lands here.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS exchange_connections (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL REFERENCES users(id),
            exchange        TEXT NOT NULL,
            api_key_enc     BLOB NOT NULL,
            api_secret_enc  BLOB NOT NULL,
            is_active       INTEGER NOT NULL DEFAULT 1,
            last_polled_at  TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE(user_id, exchange)
        );",
    )
}

fn create_principles_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS principles (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            content     TEXT NOT NULL,
            source      TEXT NOT NULL DEFAULT 'user_input',
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );",
    )
}

fn create_base_streams_table(conn: &Connection) -> Result<()> {
    // Streams are never hard-deleted; re-mention restores them to hot.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS base_streams (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id           INTEGER NOT NULL REFERENCES users(id),
            stream_type       TEXT NOT NULL,
            symbol            TEXT,
            config            TEXT NOT NULL DEFAULT '{}',
            temperature       TEXT NOT NULL DEFAULT 'hot',
            last_mentioned_at TEXT NOT NULL,
            last_value        TEXT,
            created_at        TEXT NOT NULL,
            UNIQUE(user_id, stream_type, symbol)
        );
        CREATE INDEX IF NOT EXISTS idx_streams_user_temp
            ON base_streams(user_id, temperature);",
    )
}

fn create_user_triggers_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_triggers (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL REFERENCES users(id),
            kind                TEXT NOT NULL,
            condition           TEXT,
            composite_logic     TEXT,
            base_streams_needed TEXT,
            eval_prompt         TEXT,
            data_needed         TEXT,
            description         TEXT NOT NULL,
            source              TEXT NOT NULL DEFAULT 'user_request',
            is_active           INTEGER NOT NULL DEFAULT 1,
            triggered_at        TEXT,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_triggers_user_active
            ON user_triggers(user_id, is_active);",
    )
}

fn create_trades_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trades (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                  INTEGER NOT NULL REFERENCES users(id),
            exchange                 TEXT NOT NULL,
            symbol                   TEXT NOT NULL,
            side                     TEXT NOT NULL,
            entry_price              REAL NOT NULL,
            exit_price               REAL,
            size                     REAL NOT NULL,
            leverage                 REAL NOT NULL DEFAULT 1.0,
            pnl_percent              REAL,
            pnl_amount               REAL,
            status                   TEXT NOT NULL DEFAULT 'open',
            inferred_reasoning       TEXT,
            user_confirmed_reasoning INTEGER,
            user_actual_reasoning    TEXT,
            episode_id               INTEGER,
            opened_at                TEXT NOT NULL,
            closed_at                TEXT,
            created_at               TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_user_status
            ON trades(user_id, status);",
    )
}

fn create_signals_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS signals (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id            INTEGER NOT NULL REFERENCES users(id),
            kind               TEXT NOT NULL DEFAULT 'trade_signal',
            content            TEXT NOT NULL,
            reasoning          TEXT NOT NULL,
            counter_argument   TEXT,
            confidence         REAL NOT NULL,
            confidence_style   REAL,
            confidence_history REAL,
            confidence_market  REAL,
            symbol             TEXT,
            direction          TEXT,
            stop_loss          TEXT,
            user_feedback      TEXT,
            user_agreed        INTEGER,
            trade_followed     INTEGER,
            trade_result_pnl   REAL,
            episode_id         INTEGER,
            created_at         TEXT NOT NULL
        );",
    )
}

fn create_episodes_table(conn: &Connection) -> Result<()> {
    // vector_id is filled by a separate UPDATE after the best-effort upsert.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                INTEGER NOT NULL REFERENCES users(id),
            kind                   TEXT NOT NULL,
            market_context         TEXT,
            user_action            TEXT NOT NULL,
            trade_data             TEXT,
            reasoning              TEXT,
            trade_result           TEXT,
            feedback               TEXT,
            expression_calibration TEXT,
            style_tags             TEXT,
            embedding_text         TEXT NOT NULL,
            vector_id              TEXT,
            created_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_user_kind
            ON episodes(user_id, kind);",
    )
}

fn create_patrol_logs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS patrol_logs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL REFERENCES users(id),
            kind                TEXT NOT NULL DEFAULT 'scheduled',
            findings            TEXT NOT NULL DEFAULT '[]',
            actions_taken       TEXT NOT NULL DEFAULT '[]',
            temperature_changes TEXT,
            created_at          TEXT NOT NULL
        );",
    )
}

fn create_chat_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL REFERENCES users(id),
            role                TEXT NOT NULL,
            content             TEXT NOT NULL,
            message_type        TEXT NOT NULL DEFAULT 'text',
            intent              TEXT,
            metadata            TEXT,
            external_message_id TEXT,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_user_created
            ON chat_messages(user_id, created_at);",
    )
}
