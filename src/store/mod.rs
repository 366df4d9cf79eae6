// =============================================================================
// Store — durable persistence for accounts, positions, orders, trades,
// the trade register, sessions, and the time-series side tables
// =============================================================================
//
// SQLite in WAL mode. All engine mutation paths run inside a single
// transaction obtained via `with_tx`; busy/locked errors are retried with
// exponential backoff up to 3 attempts before surfacing as transient.
//
// The row helpers below take `&Connection` so they compose inside a
// transaction (rusqlite's `Transaction` derefs to `Connection`).
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::market_data::{Candle, FundingRate, Ticker, Timeframe};
use crate::models::{Account, Order, Position, Trade};
use crate::register::{RegisterExit, RegisterRow};
use crate::time_parser::format_trade_duration;
use crate::types::{
    EndReason, ExitReason, OrderStatus, OrderType, PositionStatus, Side, TradeMode,
};

/// Transaction attempts before a busy error surfaces as transient failure.
const BUSY_ATTEMPTS: u32 = 3;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS paper_accounts (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL UNIQUE,
    description       TEXT,
    initial_balance   REAL NOT NULL,
    current_balance   REAL NOT NULL,
    peak_balance      REAL NOT NULL,
    leverage          REAL NOT NULL DEFAULT 1.0,
    maker_fee         REAL NOT NULL DEFAULT 0.0002,
    taker_fee         REAL NOT NULL DEFAULT 0.0005,
    total_trades      INTEGER NOT NULL DEFAULT 0,
    winning_trades    INTEGER NOT NULL DEFAULT 0,
    losing_trades     INTEGER NOT NULL DEFAULT 0,
    total_pnl         REAL NOT NULL DEFAULT 0.0,
    max_drawdown      REAL NOT NULL DEFAULT 0.0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS paper_positions (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id             INTEGER NOT NULL REFERENCES paper_accounts(id),
    symbol                 TEXT NOT NULL,
    side                   TEXT NOT NULL,
    size                   REAL NOT NULL,
    entry_price            REAL NOT NULL,
    current_price          REAL NOT NULL,
    leverage               REAL NOT NULL,
    margin_used            REAL NOT NULL,
    stop_loss              REAL,
    take_profit            REAL,
    unrealized_pnl         REAL NOT NULL DEFAULT 0.0,
    unrealized_pnl_percent REAL NOT NULL DEFAULT 0.0,
    status                 TEXT NOT NULL DEFAULT 'open',
    opened_at              TEXT NOT NULL,
    closed_at              TEXT,
    strategy               TEXT,
    notes                  TEXT
);

CREATE INDEX IF NOT EXISTS idx_positions_open
    ON paper_positions(account_id, status);

CREATE TABLE IF NOT EXISTS paper_orders (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      INTEGER NOT NULL REFERENCES paper_accounts(id),
    client_order_id TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    side            TEXT NOT NULL,
    order_type      TEXT NOT NULL,
    size            REAL NOT NULL,
    price           REAL,
    leverage        REAL NOT NULL DEFAULT 1.0,
    status          TEXT NOT NULL DEFAULT 'pending',
    filled_size     REAL NOT NULL DEFAULT 0.0,
    filled_price    REAL,
    created_at      TEXT NOT NULL,
    filled_at       TEXT,
    cancelled_at    TEXT,
    strategy        TEXT,
    notes           TEXT
);

CREATE TABLE IF NOT EXISTS paper_trades (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id   INTEGER NOT NULL REFERENCES paper_accounts(id),
    symbol       TEXT NOT NULL,
    side         TEXT NOT NULL,
    entry_price  REAL NOT NULL,
    entry_time   TEXT NOT NULL,
    size         REAL NOT NULL,
    leverage     REAL NOT NULL,
    exit_price   REAL NOT NULL,
    exit_time    TEXT NOT NULL,
    entry_fee    REAL NOT NULL DEFAULT 0.0,
    exit_fee     REAL NOT NULL DEFAULT 0.0,
    total_fees   REAL NOT NULL DEFAULT 0.0,
    pnl          REAL NOT NULL,
    pnl_percent  REAL NOT NULL,
    net_pnl      REAL NOT NULL,
    strategy     TEXT,
    exit_reason  TEXT NOT NULL,
    notes        TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_by_exit
    ON paper_trades(account_id, exit_time DESC);

CREATE TABLE IF NOT EXISTS strategies (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL UNIQUE,
    display_name   TEXT NOT NULL,
    version        TEXT NOT NULL DEFAULT '1.0.0',
    description    TEXT,
    default_config TEXT,
    min_confidence REAL NOT NULL DEFAULT 5.0,
    is_active      INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_registers (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id              INTEGER NOT NULL REFERENCES paper_accounts(id),
    strategy_id             INTEGER REFERENCES strategies(id),
    paper_trade_id          INTEGER REFERENCES paper_trades(id),
    symbol                  TEXT NOT NULL,
    side                    TEXT NOT NULL,
    mode                    TEXT NOT NULL,
    entry_timestamp         TEXT NOT NULL,
    entry_price             REAL NOT NULL,
    entry_size              REAL NOT NULL,
    entry_value_usd         REAL NOT NULL,
    leverage                REAL NOT NULL,
    margin_required         REAL NOT NULL,
    margin_available_before REAL NOT NULL,
    fee_entry               REAL NOT NULL DEFAULT 0.0,
    expected_entry_price    REAL,
    actual_entry_price      REAL,
    entry_slippage_percent  REAL,
    exit_timestamp          TEXT,
    exit_price              REAL,
    exit_reason             TEXT,
    fee_exit                REAL NOT NULL DEFAULT 0.0,
    fee_total               REAL NOT NULL DEFAULT 0.0,
    pnl_gross               REAL,
    pnl_net                 REAL,
    pnl_percent             REAL,
    duration_seconds        INTEGER,
    duration_human          TEXT,
    expected_exit_price     REAL,
    actual_exit_price       REAL,
    exit_slippage_percent   REAL,
    stop_loss_price         REAL,
    take_profit_price       REAL,
    stop_loss_triggered     INTEGER NOT NULL DEFAULT 0,
    take_profit_triggered   INTEGER NOT NULL DEFAULT 0,
    market_price_at_entry   REAL,
    market_volume_24h       REAL,
    market_volatility       REAL,
    rsi_at_entry            REAL,
    macd_at_entry           REAL,
    bb_position_at_entry    REAL,
    signal_confidence       REAL,
    signal_reason           TEXT,
    strategy_parameters     TEXT,
    session_id              TEXT,
    bot_version             TEXT,
    max_loss_limit          REAL,
    time_limit_seconds      INTEGER,
    notes                   TEXT,
    tags                    TEXT,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_registers_by_entry
    ON trade_registers(account_id, entry_timestamp);

CREATE INDEX IF NOT EXISTS idx_registers_open
    ON trade_registers(account_id, symbol) WHERE exit_timestamp IS NULL;

CREATE TABLE IF NOT EXISTS trading_sessions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id         TEXT NOT NULL UNIQUE,
    account_id         INTEGER NOT NULL REFERENCES paper_accounts(id),
    strategy_id        INTEGER REFERENCES strategies(id),
    mode               TEXT NOT NULL,
    symbols            TEXT NOT NULL,
    started_at         TEXT NOT NULL,
    ended_at           TEXT,
    duration_seconds   INTEGER,
    time_limit_seconds INTEGER,
    max_loss_limit     REAL,
    max_positions      INTEGER,
    total_trades       INTEGER NOT NULL DEFAULT 0,
    winning_trades     INTEGER NOT NULL DEFAULT 0,
    losing_trades      INTEGER NOT NULL DEFAULT 0,
    total_pnl          REAL NOT NULL DEFAULT 0.0,
    starting_balance   REAL NOT NULL,
    ending_balance     REAL,
    peak_balance       REAL,
    max_drawdown       REAL NOT NULL DEFAULT 0.0,
    end_reason         TEXT,
    notes              TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_active
    ON trading_sessions(account_id) WHERE ended_at IS NULL;

-- Time-series side tables. Timestamp indexes stand in for partitioning.

CREATE TABLE IF NOT EXISTS ohlcv (
    symbol    TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    open      REAL NOT NULL,
    high      REAL NOT NULL,
    low       REAL NOT NULL,
    close     REAL NOT NULL,
    volume    REAL NOT NULL,
    UNIQUE(symbol, timeframe, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_ohlcv_time ON ohlcv(timestamp);

CREATE TABLE IF NOT EXISTS tickers (
    symbol        TEXT NOT NULL,
    timestamp     TEXT NOT NULL,
    mark_price    REAL NOT NULL,
    bid           REAL NOT NULL,
    ask           REAL NOT NULL,
    volume_24h    REAL NOT NULL,
    funding_rate  REAL,
    open_interest REAL
);

CREATE INDEX IF NOT EXISTS idx_tickers_time ON tickers(symbol, timestamp);

CREATE TABLE IF NOT EXISTS funding_rates (
    symbol    TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    rate      REAL NOT NULL,
    UNIQUE(symbol, timestamp)
);

CREATE TABLE IF NOT EXISTS sentiment_scores (
    symbol    TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    score     REAL NOT NULL,
    source    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sentiment_time ON sentiment_scores(symbol, timestamp);
"#;

// ---------------------------------------------------------------------------
// Session row
// ---------------------------------------------------------------------------

/// One run of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub session_id: String,
    pub account_id: i64,
    pub strategy_id: Option<i64>,
    pub mode: TradeMode,
    pub symbols: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub time_limit_seconds: Option<i64>,
    pub max_loss_limit: Option<f64>,
    pub max_positions: Option<i64>,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: f64,
    pub starting_balance: f64,
    pub ending_balance: Option<f64>,
    pub peak_balance: Option<f64>,
    pub max_drawdown: f64,
    pub end_reason: Option<EndReason>,
    pub notes: Option<String>,
}

impl SessionRow {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Final rollup written when a session closes.
#[derive(Debug, Clone)]
pub struct SessionClose {
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub ending_balance: f64,
    pub peak_balance: f64,
    pub max_drawdown: f64,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: f64,
    pub end_reason: EndReason,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::DatabaseFatal(format!("cannot open {path}: {e}")))?;
        Self::init(conn)
    }

    /// Fresh in-memory database. Used by tests and `reset` tooling.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::DatabaseFatal(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| EngineError::DatabaseFatal(format!("schema init failed: {e}")))?;
        debug!("store schema applied");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an IMMEDIATE transaction. Commits on Ok, rolls back on
    /// Err. Busy/locked errors retry the whole closure with backoff.
    pub fn with_tx<T>(
        &self,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        retry(|| {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run a read-only closure against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    /// Load the account named `name`, creating it on first use.
    pub fn get_or_create_account(
        &self,
        name: &str,
        initial_balance: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<Account> {
        self.with_tx(|tx| {
            if let Some(account) = find_account_by_name(tx, name)? {
                return Ok(account);
            }

            tx.execute(
                "INSERT INTO paper_accounts
                 (name, initial_balance, current_balance, peak_balance, leverage,
                  maker_fee, taker_fee, created_at, updated_at)
                 VALUES (?1, ?2, ?2, ?2, ?3, 0.0002, 0.0005, ?4, ?4)",
                params![name, initial_balance, leverage, ts(now)],
            )?;
            let id = tx.last_insert_rowid();
            info!(account = name, id, initial_balance, "paper account created");

            load_account(tx, id)
        })
    }

    pub fn account(&self, id: i64) -> EngineResult<Account> {
        self.read(|conn| load_account(conn, id))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn open_positions(
        &self,
        account_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<Vec<Position>> {
        self.read(|conn| query_open_positions(conn, account_id, symbol))
    }

    pub fn position(&self, id: i64) -> EngineResult<Option<Position>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT * FROM paper_positions WHERE id = ?1",
                params![id],
                position_from_row,
            )
            .optional()
            .map_err(EngineError::from)
        })
    }

    /// Mark-to-market update outside the close path.
    pub fn update_position_mark(
        &self,
        id: i64,
        price: f64,
        pnl: f64,
        pnl_percent: f64,
    ) -> EngineResult<()> {
        retry(|| {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE paper_positions
                 SET current_price = ?2, unrealized_pnl = ?3, unrealized_pnl_percent = ?4
                 WHERE id = ?1 AND status = 'open'",
                params![id, price, pnl, pnl_percent],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn order(&self, id: i64) -> EngineResult<Option<Order>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT * FROM paper_orders WHERE id = ?1",
                params![id],
                order_from_row,
            )
            .optional()
            .map_err(EngineError::from)
        })
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Trade history ordered newest-exit first.
    pub fn trades(
        &self,
        account_id: i64,
        limit: usize,
        symbol: Option<&str>,
    ) -> EngineResult<Vec<Trade>> {
        self.read(|conn| {
            let mut out = Vec::new();
            match symbol {
                Some(sym) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM paper_trades
                         WHERE account_id = ?1 AND symbol = ?2
                         ORDER BY exit_time DESC, id DESC LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![account_id, sym, limit as i64], trade_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM paper_trades
                         WHERE account_id = ?1
                         ORDER BY exit_time DESC, id DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![account_id, limit as i64], trade_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    // -------------------------------------------------------------------------
    // Trade register
    // -------------------------------------------------------------------------

    /// Open register rows for startup integrity checks.
    pub fn open_registers(&self, account_id: i64) -> EngineResult<Vec<RegisterRow>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trade_registers
                 WHERE account_id = ?1 AND exit_timestamp IS NULL
                 ORDER BY entry_timestamp",
            )?;
            let rows = stmt.query_map(params![account_id], register_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn register(&self, id: i64) -> EngineResult<Option<RegisterRow>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT * FROM trade_registers WHERE id = ?1",
                params![id],
                register_from_row,
            )
            .optional()
            .map_err(EngineError::from)
        })
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    /// Register (or refresh) a strategy row and return its id.
    pub fn upsert_strategy(
        &self,
        name: &str,
        display_name: &str,
        version: &str,
        default_config: Option<&serde_json::Value>,
        min_confidence: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO strategies (name, display_name, version, default_config,
                                         min_confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                     display_name = excluded.display_name,
                     version = excluded.version,
                     default_config = excluded.default_config,
                     min_confidence = excluded.min_confidence",
                params![
                    name,
                    display_name,
                    version,
                    default_config.map(|v| v.to_string()),
                    min_confidence,
                    ts(now)
                ],
            )?;
            let id = tx.query_row(
                "SELECT id FROM strategies WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    pub fn insert_session(&self, session: &SessionRow) -> EngineResult<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO trading_sessions
                 (session_id, account_id, strategy_id, mode, symbols, started_at,
                  time_limit_seconds, max_loss_limit, max_positions,
                  starting_balance, peak_balance, max_drawdown)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    session.session_id,
                    session.account_id,
                    session.strategy_id,
                    session.mode.as_str(),
                    serde_json::to_string(&session.symbols).unwrap_or_default(),
                    ts(session.started_at),
                    session.time_limit_seconds,
                    session.max_loss_limit,
                    session.max_positions,
                    session.starting_balance,
                    session.peak_balance,
                    session.max_drawdown,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn active_session(&self, account_id: i64) -> EngineResult<Option<SessionRow>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT * FROM trading_sessions
                 WHERE account_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1",
                params![account_id],
                session_from_row,
            )
            .optional()
            .map_err(EngineError::from)
        })
    }

    pub fn close_session(&self, id: i64, close: &SessionClose) -> EngineResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE trading_sessions SET
                     ended_at = ?2, duration_seconds = ?3, ending_balance = ?4,
                     peak_balance = ?5, max_drawdown = ?6, total_trades = ?7,
                     winning_trades = ?8, losing_trades = ?9, total_pnl = ?10,
                     end_reason = ?11
                 WHERE id = ?1 AND ended_at IS NULL",
                params![
                    id,
                    ts(close.ended_at),
                    close.duration_seconds,
                    close.ending_balance,
                    close.peak_balance,
                    close.max_drawdown,
                    close.total_trades,
                    close.winning_trades,
                    close.losing_trades,
                    close.total_pnl,
                    close.end_reason.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Close any session left active by a crashed run. Returns how many were
    /// closed; each is a data-integrity event worth a warning.
    pub fn close_stale_sessions(&self, account_id: i64, now: DateTime<Utc>) -> EngineResult<usize> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE trading_sessions
                 SET ended_at = ?2, end_reason = 'error',
                     notes = COALESCE(notes || ' | ', '') || 'closed at startup: previous run did not shut down'
                 WHERE account_id = ?1 AND ended_at IS NULL",
                params![account_id, ts(now)],
            )?;
            if n > 0 {
                warn!(account_id, count = n, "stale active sessions closed with end_reason=error");
            }
            Ok(n)
        })
    }

    // -------------------------------------------------------------------------
    // Time-series side tables
    // -------------------------------------------------------------------------

    /// Upsert fetched candles. Best-effort path: failures log, never abort a
    /// tick.
    pub fn record_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> EngineResult<()> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO ohlcv (symbol, timeframe, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(symbol, timeframe, timestamp) DO UPDATE SET
                     open = excluded.open, high = excluded.high, low = excluded.low,
                     close = excluded.close, volume = excluded.volume",
            )?;
            for c in candles {
                stmt.execute(params![
                    symbol,
                    timeframe.as_str(),
                    ts(c.timestamp),
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume
                ])?;
            }
            Ok(())
        })
    }

    pub fn record_ticker(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        ticker: &Ticker,
    ) -> EngineResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tickers
                 (symbol, timestamp, mark_price, bid, ask, volume_24h, funding_rate, open_interest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    symbol,
                    ts(now),
                    ticker.mark_price,
                    ticker.bid,
                    ticker.ask,
                    ticker.volume_24h,
                    ticker.funding_rate,
                    ticker.open_interest
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_funding(&self, symbol: &str, rates: &[FundingRate]) -> EngineResult<()> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO funding_rates (symbol, timestamp, rate)
                 VALUES (?1, ?2, ?3)",
            )?;
            for r in rates {
                stmt.execute(params![symbol, ts(r.timestamp), r.rate])?;
            }
            Ok(())
        })
    }

    /// Most recent sentiment score for a symbol, if the sentiment pipeline has
    /// produced one. The ingestion side is an external collaborator.
    pub fn latest_sentiment(&self, symbol: &str) -> EngineResult<Option<f64>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT score FROM sentiment_scores
                 WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::from)
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Busy retry
// ---------------------------------------------------------------------------

fn retry<T>(mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
    let mut delay = std::time::Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < BUSY_ATTEMPTS => {
                warn!(attempt, error = %e, "transient database error, retrying");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers (composable inside transactions)
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    s.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn bad_enum(field: &'static str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {field}: {value}").into(),
    )
}

pub fn load_account(conn: &Connection, id: i64) -> EngineResult<Account> {
    conn.query_row(
        "SELECT * FROM paper_accounts WHERE id = ?1",
        params![id],
        account_from_row,
    )
    .map_err(EngineError::from)
}

pub fn find_account_by_name(conn: &Connection, name: &str) -> EngineResult<Option<Account>> {
    conn.query_row(
        "SELECT * FROM paper_accounts WHERE name = ?1",
        params![name],
        account_from_row,
    )
    .optional()
    .map_err(EngineError::from)
}

/// Persist the mutable account fields. The caller holds the row implicitly
/// through the connection lock; with WAL + IMMEDIATE transactions this is the
/// single-writer discipline the engine relies on.
pub fn update_account(conn: &Connection, account: &Account, now: DateTime<Utc>) -> EngineResult<()> {
    conn.execute(
        "UPDATE paper_accounts SET
             current_balance = ?2, peak_balance = ?3, total_trades = ?4,
             winning_trades = ?5, losing_trades = ?6, total_pnl = ?7,
             max_drawdown = ?8, initial_balance = ?9, updated_at = ?10
         WHERE id = ?1",
        params![
            account.id,
            account.current_balance,
            account.peak_balance,
            account.total_trades,
            account.winning_trades,
            account.losing_trades,
            account.total_pnl,
            account.max_drawdown,
            account.initial_balance,
            ts(now),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub fn insert_position(conn: &Connection, pos: &Position) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO paper_positions
         (account_id, symbol, side, size, entry_price, current_price, leverage,
          margin_used, stop_loss, take_profit, unrealized_pnl,
          unrealized_pnl_percent, status, opened_at, strategy, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            pos.account_id,
            pos.symbol,
            pos.side.as_str(),
            pos.size,
            pos.entry_price,
            pos.current_price,
            pos.leverage,
            pos.margin_used,
            pos.stop_loss,
            pos.take_profit,
            pos.unrealized_pnl,
            pos.unrealized_pnl_percent,
            pos.status.as_str(),
            ts(pos.opened_at),
            pos.strategy,
            pos.notes,
        ],
    )
    .map_err(EngineError::from)?;
    Ok(conn.last_insert_rowid())
}

/// Transition a position out of `open`. The WHERE clause enforces the state
/// machine: closing an already-closed row touches nothing.
pub fn finalize_position(
    conn: &Connection,
    id: i64,
    status: PositionStatus,
    closed_at: DateTime<Utc>,
    exit_mark: f64,
    pnl: f64,
    pnl_percent: f64,
) -> EngineResult<bool> {
    let n = conn
        .execute(
            "UPDATE paper_positions SET
                 status = ?2, closed_at = ?3, current_price = ?4,
                 unrealized_pnl = ?5, unrealized_pnl_percent = ?6
             WHERE id = ?1 AND status = 'open'",
            params![id, status.as_str(), ts(closed_at), exit_mark, pnl, pnl_percent],
        )
        .map_err(EngineError::from)?;
    Ok(n == 1)
}

pub fn query_open_positions(
    conn: &Connection,
    account_id: i64,
    symbol: Option<&str>,
) -> EngineResult<Vec<Position>> {
    let mut out = Vec::new();
    match symbol {
        Some(sym) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM paper_positions
                 WHERE account_id = ?1 AND status = 'open' AND symbol = ?2
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![account_id, sym], position_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM paper_positions
                 WHERE account_id = ?1 AND status = 'open'
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![account_id], position_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

pub fn load_position(conn: &Connection, id: i64) -> EngineResult<Option<Position>> {
    conn.query_row(
        "SELECT * FROM paper_positions WHERE id = ?1",
        params![id],
        position_from_row,
    )
    .optional()
    .map_err(EngineError::from)
}

pub fn insert_order(conn: &Connection, order: &Order) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO paper_orders
         (account_id, client_order_id, symbol, side, order_type, size, price,
          leverage, status, filled_size, filled_price, created_at, filled_at,
          cancelled_at, strategy, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            order.account_id,
            order.client_order_id,
            order.symbol,
            order.side.as_str(),
            order.order_type.as_str(),
            order.size,
            order.price,
            order.leverage,
            order.status.as_str(),
            order.filled_size,
            order.filled_price,
            ts(order.created_at),
            order.filled_at.map(ts),
            order.cancelled_at.map(ts),
            order.strategy,
            order.notes,
        ],
    )
    .map_err(EngineError::from)?;
    Ok(conn.last_insert_rowid())
}

/// Status transition, refusing to mutate terminal rows.
pub fn update_order_status(
    conn: &Connection,
    id: i64,
    status: OrderStatus,
    filled_size: f64,
    filled_price: Option<f64>,
    at: DateTime<Utc>,
) -> EngineResult<()> {
    let current: String = conn
        .query_row(
            "SELECT status FROM paper_orders WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(EngineError::from)?;
    let current = OrderStatus::parse(&current)
        .ok_or_else(|| EngineError::DatabaseFatal(format!("unknown order status {current}")))?;
    if current.is_terminal() {
        return Err(EngineError::DatabaseFatal(format!(
            "order {id} is terminal ({current}) and cannot change"
        )));
    }

    let (filled_at, cancelled_at) = match status {
        OrderStatus::Filled | OrderStatus::PartiallyFilled => (Some(ts(at)), None),
        OrderStatus::Cancelled | OrderStatus::Rejected => (None, Some(ts(at))),
        OrderStatus::Pending => (None, None),
    };

    conn.execute(
        "UPDATE paper_orders SET
             status = ?2, filled_size = ?3, filled_price = ?4,
             filled_at = COALESCE(?5, filled_at),
             cancelled_at = COALESCE(?6, cancelled_at)
         WHERE id = ?1",
        params![id, status.as_str(), filled_size, filled_price, filled_at, cancelled_at],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

pub fn insert_trade(conn: &Connection, trade: &Trade, now: DateTime<Utc>) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO paper_trades
         (account_id, symbol, side, entry_price, entry_time, size, leverage,
          exit_price, exit_time, entry_fee, exit_fee, total_fees, pnl,
          pnl_percent, net_pnl, strategy, exit_reason, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, ?18, ?19)",
        params![
            trade.account_id,
            trade.symbol,
            trade.side.as_str(),
            trade.entry_price,
            ts(trade.entry_time),
            trade.size,
            trade.leverage,
            trade.exit_price,
            ts(trade.exit_time),
            trade.entry_fee,
            trade.exit_fee,
            trade.total_fees,
            trade.pnl,
            trade.pnl_percent,
            trade.net_pnl,
            trade.strategy,
            trade.exit_reason.as_str(),
            trade.notes,
            ts(now),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_register(conn: &Connection, row: &RegisterRow, now: DateTime<Utc>) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO trade_registers
         (account_id, strategy_id, paper_trade_id, symbol, side, mode,
          entry_timestamp, entry_price, entry_size, entry_value_usd, leverage,
          margin_required, margin_available_before, fee_entry,
          expected_entry_price, actual_entry_price, entry_slippage_percent,
          fee_exit, fee_total, stop_loss_price, take_profit_price,
          market_price_at_entry, market_volume_24h, market_volatility,
          rsi_at_entry, macd_at_entry, bb_position_at_entry,
          signal_confidence, signal_reason, strategy_parameters,
          session_id, bot_version, max_loss_limit, time_limit_seconds,
          notes, tags, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                 ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?37)",
        params![
            row.account_id,
            row.strategy_id,
            row.paper_trade_id,
            row.symbol,
            row.side.as_str(),
            row.mode.as_str(),
            ts(row.entry_timestamp),
            row.entry_price,
            row.entry_size,
            row.entry_value_usd,
            row.leverage,
            row.margin_required,
            row.margin_available_before,
            row.fee_entry,
            row.expected_entry_price,
            row.actual_entry_price,
            row.entry_slippage_percent,
            row.fee_exit,
            row.fee_total,
            row.stop_loss_price,
            row.take_profit_price,
            row.market_price_at_entry,
            row.market_volume_24h,
            row.market_volatility,
            row.rsi_at_entry,
            row.macd_at_entry,
            row.bb_position_at_entry,
            row.signal_confidence,
            row.signal_reason,
            row.strategy_parameters.as_ref().map(|v| v.to_string()),
            row.session_id,
            row.bot_version,
            row.max_loss_limit,
            row.time_limit_seconds,
            row.notes,
            serde_json::to_string(&row.tags).unwrap_or_default(),
            ts(now),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(conn.last_insert_rowid())
}

/// Matching invariant guard: is there any open register row for the symbol?
pub fn open_register_exists(
    conn: &Connection,
    account_id: i64,
    symbol: &str,
) -> EngineResult<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM trade_registers
             WHERE account_id = ?1 AND symbol = ?2 AND exit_timestamp IS NULL",
            params![account_id, symbol],
            |row| row.get(0),
        )
        .map_err(EngineError::from)?;
    Ok(count > 0)
}

/// The pairing lookup: the open row for (account, symbol, entry_timestamp).
pub fn find_open_register(
    conn: &Connection,
    account_id: i64,
    symbol: &str,
    entry_timestamp: DateTime<Utc>,
) -> EngineResult<Option<RegisterRow>> {
    conn.query_row(
        "SELECT * FROM trade_registers
         WHERE account_id = ?1 AND symbol = ?2 AND entry_timestamp = ?3
               AND exit_timestamp IS NULL
         ORDER BY created_at DESC LIMIT 1",
        params![account_id, symbol, ts(entry_timestamp)],
        register_from_row,
    )
    .optional()
    .map_err(EngineError::from)
}

/// In-place exit patch. Idempotent on `paper_trade_id`: a row already linked
/// to a trade is left untouched.
pub fn patch_register_exit(
    conn: &Connection,
    id: i64,
    exit: &RegisterExit,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let reason = ExitReason::parse(&exit.exit_reason);
    let sl_triggered = matches!(reason, Some(ExitReason::StopLoss));
    let tp_triggered = matches!(reason, Some(ExitReason::TakeProfit));

    conn.execute(
        "UPDATE trade_registers SET
             paper_trade_id = ?2, exit_timestamp = ?3, exit_price = ?4,
             exit_reason = ?5, fee_exit = ?6, fee_total = fee_entry + ?6,
             pnl_gross = ?7, pnl_net = ?8, pnl_percent = ?9,
             duration_seconds = ?10, duration_human = ?11,
             expected_exit_price = ?12, actual_exit_price = ?13,
             exit_slippage_percent = ?14,
             stop_loss_triggered = ?15, take_profit_triggered = ?16,
             notes = CASE WHEN ?17 IS NULL THEN notes
                          ELSE COALESCE(notes || ' | ', '') || ?17 END,
             updated_at = ?18
         WHERE id = ?1 AND paper_trade_id IS NULL",
        params![
            id,
            exit.paper_trade_id,
            ts(exit.exit_timestamp),
            exit.exit_price,
            exit.exit_reason,
            exit.fee_exit,
            exit.pnl_gross,
            exit.pnl_net,
            exit.pnl_percent,
            exit.duration_seconds,
            format_trade_duration(exit.duration_seconds),
            exit.expected_exit_price,
            exit.actual_exit_price,
            exit.exit_slippage_percent,
            sl_triggered,
            tp_triggered,
            exit.notes,
            ts(now),
        ],
    )
    .map_err(EngineError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn account_from_row(row: &rusqlite::Row<'_>) -> Result<Account, rusqlite::Error> {
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(Account {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        initial_balance: row.get("initial_balance")?,
        current_balance: row.get("current_balance")?,
        peak_balance: row.get("peak_balance")?,
        leverage: row.get("leverage")?,
        maker_fee: row.get("maker_fee")?,
        taker_fee: row.get("taker_fee")?,
        total_trades: row.get("total_trades")?,
        winning_trades: row.get("winning_trades")?,
        losing_trades: row.get("losing_trades")?,
        total_pnl: row.get("total_pnl")?,
        max_drawdown: row.get("max_drawdown")?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

fn position_from_row(row: &rusqlite::Row<'_>) -> Result<Position, rusqlite::Error> {
    let side: String = row.get("side")?;
    let status: String = row.get("status")?;
    let opened: String = row.get("opened_at")?;
    Ok(Position {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).ok_or_else(|| bad_enum("side", &side))?,
        size: row.get("size")?,
        entry_price: row.get("entry_price")?,
        current_price: row.get("current_price")?,
        leverage: row.get("leverage")?,
        margin_used: row.get("margin_used")?,
        stop_loss: row.get("stop_loss")?,
        take_profit: row.get("take_profit")?,
        unrealized_pnl: row.get("unrealized_pnl")?,
        unrealized_pnl_percent: row.get("unrealized_pnl_percent")?,
        status: PositionStatus::parse(&status).ok_or_else(|| bad_enum("status", &status))?,
        opened_at: parse_ts(&opened)?,
        closed_at: parse_opt_ts(row.get("closed_at")?)?,
        strategy: row.get("strategy")?,
        notes: row.get("notes")?,
    })
}

fn order_from_row(row: &rusqlite::Row<'_>) -> Result<Order, rusqlite::Error> {
    let side: String = row.get("side")?;
    let order_type: String = row.get("order_type")?;
    let status: String = row.get("status")?;
    let created: String = row.get("created_at")?;

    let order_type = match order_type.as_str() {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        "stop_loss" => OrderType::StopLoss,
        "take_profit" => OrderType::TakeProfit,
        other => return Err(bad_enum("order_type", other)),
    };

    Ok(Order {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        client_order_id: row.get("client_order_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).ok_or_else(|| bad_enum("side", &side))?,
        order_type,
        size: row.get("size")?,
        price: row.get("price")?,
        leverage: row.get("leverage")?,
        status: OrderStatus::parse(&status).ok_or_else(|| bad_enum("status", &status))?,
        filled_size: row.get("filled_size")?,
        filled_price: row.get("filled_price")?,
        created_at: parse_ts(&created)?,
        filled_at: parse_opt_ts(row.get("filled_at")?)?,
        cancelled_at: parse_opt_ts(row.get("cancelled_at")?)?,
        strategy: row.get("strategy")?,
        notes: row.get("notes")?,
    })
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> Result<Trade, rusqlite::Error> {
    let side: String = row.get("side")?;
    let reason: String = row.get("exit_reason")?;
    let entry: String = row.get("entry_time")?;
    let exit: String = row.get("exit_time")?;
    Ok(Trade {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).ok_or_else(|| bad_enum("side", &side))?,
        entry_price: row.get("entry_price")?,
        entry_time: parse_ts(&entry)?,
        size: row.get("size")?,
        leverage: row.get("leverage")?,
        exit_price: row.get("exit_price")?,
        exit_time: parse_ts(&exit)?,
        entry_fee: row.get("entry_fee")?,
        exit_fee: row.get("exit_fee")?,
        total_fees: row.get("total_fees")?,
        pnl: row.get("pnl")?,
        pnl_percent: row.get("pnl_percent")?,
        net_pnl: row.get("net_pnl")?,
        strategy: row.get("strategy")?,
        exit_reason: ExitReason::parse(&reason).ok_or_else(|| bad_enum("exit_reason", &reason))?,
        notes: row.get("notes")?,
    })
}

fn register_from_row(row: &rusqlite::Row<'_>) -> Result<RegisterRow, rusqlite::Error> {
    let side: String = row.get("side")?;
    let mode: String = row.get("mode")?;
    let entry: String = row.get("entry_timestamp")?;
    let params_json: Option<String> = row.get("strategy_parameters")?;
    let tags_json: Option<String> = row.get("tags")?;

    let mode = match mode.as_str() {
        "paper" => TradeMode::Paper,
        "real" => TradeMode::Real,
        other => return Err(bad_enum("mode", other)),
    };

    Ok(RegisterRow {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        strategy_id: row.get("strategy_id")?,
        paper_trade_id: row.get("paper_trade_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).ok_or_else(|| bad_enum("side", &side))?,
        mode,
        entry_timestamp: parse_ts(&entry)?,
        entry_price: row.get("entry_price")?,
        entry_size: row.get("entry_size")?,
        entry_value_usd: row.get("entry_value_usd")?,
        leverage: row.get("leverage")?,
        margin_required: row.get("margin_required")?,
        margin_available_before: row.get("margin_available_before")?,
        fee_entry: row.get("fee_entry")?,
        expected_entry_price: row.get("expected_entry_price")?,
        actual_entry_price: row.get("actual_entry_price")?,
        entry_slippage_percent: row.get("entry_slippage_percent")?,
        exit_timestamp: parse_opt_ts(row.get("exit_timestamp")?)?,
        exit_price: row.get("exit_price")?,
        exit_reason: row.get("exit_reason")?,
        fee_exit: row.get("fee_exit")?,
        fee_total: row.get("fee_total")?,
        pnl_gross: row.get("pnl_gross")?,
        pnl_net: row.get("pnl_net")?,
        pnl_percent: row.get("pnl_percent")?,
        duration_seconds: row.get("duration_seconds")?,
        duration_human: row.get("duration_human")?,
        expected_exit_price: row.get("expected_exit_price")?,
        actual_exit_price: row.get("actual_exit_price")?,
        exit_slippage_percent: row.get("exit_slippage_percent")?,
        stop_loss_price: row.get("stop_loss_price")?,
        take_profit_price: row.get("take_profit_price")?,
        stop_loss_triggered: row.get("stop_loss_triggered")?,
        take_profit_triggered: row.get("take_profit_triggered")?,
        market_price_at_entry: row.get("market_price_at_entry")?,
        market_volume_24h: row.get("market_volume_24h")?,
        market_volatility: row.get("market_volatility")?,
        rsi_at_entry: row.get("rsi_at_entry")?,
        macd_at_entry: row.get("macd_at_entry")?,
        bb_position_at_entry: row.get("bb_position_at_entry")?,
        signal_confidence: row.get("signal_confidence")?,
        signal_reason: row.get("signal_reason")?,
        strategy_parameters: params_json.and_then(|s| serde_json::from_str(&s).ok()),
        session_id: row.get("session_id")?,
        bot_version: row.get("bot_version")?,
        max_loss_limit: row.get("max_loss_limit")?,
        time_limit_seconds: row.get("time_limit_seconds")?,
        notes: row.get("notes")?,
        tags: tags_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> Result<SessionRow, rusqlite::Error> {
    let mode: String = row.get("mode")?;
    let symbols_json: String = row.get("symbols")?;
    let started: String = row.get("started_at")?;
    let end_reason: Option<String> = row.get("end_reason")?;

    let mode = match mode.as_str() {
        "paper" => TradeMode::Paper,
        "real" => TradeMode::Real,
        other => return Err(bad_enum("mode", other)),
    };
    let end_reason = match end_reason.as_deref() {
        None => None,
        Some("manual") => Some(EndReason::Manual),
        Some("time_limit") => Some(EndReason::TimeLimit),
        Some("max_loss") => Some(EndReason::MaxLoss),
        Some("error") => Some(EndReason::Error),
        Some(other) => return Err(bad_enum("end_reason", other)),
    };

    Ok(SessionRow {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        account_id: row.get("account_id")?,
        strategy_id: row.get("strategy_id")?,
        mode,
        symbols: serde_json::from_str(&symbols_json).unwrap_or_default(),
        started_at: parse_ts(&started)?,
        ended_at: parse_opt_ts(row.get("ended_at")?)?,
        duration_seconds: row.get("duration_seconds")?,
        time_limit_seconds: row.get("time_limit_seconds")?,
        max_loss_limit: row.get("max_loss_limit")?,
        max_positions: row.get("max_positions")?,
        total_trades: row.get("total_trades")?,
        winning_trades: row.get("winning_trades")?,
        losing_trades: row.get("losing_trades")?,
        total_pnl: row.get("total_pnl")?,
        starting_balance: row.get("starting_balance")?,
        ending_balance: row.get("ending_balance")?,
        peak_balance: row.get("peak_balance")?,
        max_drawdown: row.get("max_drawdown")?,
        end_reason,
        notes: row.get("notes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn now() -> DateTime<Utc> {
        "2025-03-01T12:00:00Z".parse().unwrap()
    }

    fn store_with_account() -> (Store, Account) {
        let store = Store::open_in_memory().unwrap();
        let account = store
            .get_or_create_account("test", 10_000.0, 2.0, now())
            .unwrap();
        (store, account)
    }

    fn sample_position(account_id: i64) -> Position {
        Position {
            id: 0,
            account_id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            size: 0.1,
            entry_price: 50_000.0,
            current_price: 50_000.0,
            leverage: 2.0,
            margin_used: 2_500.0,
            stop_loss: Some(49_000.0),
            take_profit: None,
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
            status: PositionStatus::Open,
            opened_at: now(),
            closed_at: None,
            strategy: Some("breakout".into()),
            notes: None,
        }
    }

    #[test]
    fn account_create_is_idempotent() {
        let (store, account) = store_with_account();
        let again = store
            .get_or_create_account("test", 99_999.0, 5.0, now())
            .unwrap();
        assert_eq!(account.id, again.id);
        // Existing accounts keep their balance; the new parameters are ignored.
        assert_eq!(again.current_balance, 10_000.0);
    }

    #[test]
    fn position_roundtrip_and_open_filter() {
        let (store, account) = store_with_account();
        let id = store
            .with_tx(|tx| insert_position(tx, &sample_position(account.id)))
            .unwrap();

        let open = store.open_positions(account.id, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(open[0].side, Side::Long);
        assert_eq!(open[0].stop_loss, Some(49_000.0));

        let by_symbol = store.open_positions(account.id, Some("ETH-USD")).unwrap();
        assert!(by_symbol.is_empty());
    }

    #[test]
    fn finalize_position_enforces_state_machine() {
        let (store, account) = store_with_account();
        let id = store
            .with_tx(|tx| insert_position(tx, &sample_position(account.id)))
            .unwrap();

        let first = store
            .with_tx(|tx| finalize_position(tx, id, PositionStatus::Closed, now(), 51_000.0, 200.0, 4.0))
            .unwrap();
        assert!(first);

        // A second close is a no-op at the row level.
        let second = store
            .with_tx(|tx| finalize_position(tx, id, PositionStatus::Closed, now(), 52_000.0, 400.0, 8.0))
            .unwrap();
        assert!(!second);

        assert!(store.open_positions(account.id, None).unwrap().is_empty());
    }

    #[test]
    fn terminal_orders_are_immutable() {
        let (store, account) = store_with_account();
        let order = Order {
            id: 0,
            account_id: account.id,
            client_order_id: "abc".into(),
            symbol: "BTC-USD".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            size: 0.1,
            price: None,
            leverage: 2.0,
            status: OrderStatus::Filled,
            filled_size: 0.1,
            filled_price: Some(50_000.0),
            created_at: now(),
            filled_at: Some(now()),
            cancelled_at: None,
            strategy: None,
            notes: None,
        };
        let id = store.with_tx(|tx| insert_order(tx, &order)).unwrap();

        let err = store
            .with_tx(|tx| update_order_status(tx, id, OrderStatus::Cancelled, 0.0, None, now()))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn register_pairing_and_idempotent_patch() {
        let (store, account) = store_with_account();
        let entry_ts = now();

        let row = RegisterRow {
            id: 0,
            account_id: account.id,
            strategy_id: None,
            paper_trade_id: None,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            mode: TradeMode::Paper,
            entry_timestamp: entry_ts,
            entry_price: 50_000.0,
            entry_size: 0.1,
            entry_value_usd: 5_000.0,
            leverage: 2.0,
            margin_required: 2_500.0,
            margin_available_before: 10_000.0,
            fee_entry: 2.5,
            expected_entry_price: Some(50_000.0),
            actual_entry_price: Some(50_000.0),
            entry_slippage_percent: Some(0.0),
            exit_timestamp: None,
            exit_price: None,
            exit_reason: None,
            fee_exit: 0.0,
            fee_total: 2.5,
            pnl_gross: None,
            pnl_net: None,
            pnl_percent: None,
            duration_seconds: None,
            duration_human: None,
            expected_exit_price: None,
            actual_exit_price: None,
            exit_slippage_percent: None,
            stop_loss_price: None,
            take_profit_price: None,
            stop_loss_triggered: false,
            take_profit_triggered: false,
            market_price_at_entry: Some(50_000.0),
            market_volume_24h: None,
            market_volatility: None,
            rsi_at_entry: Some(60.0),
            macd_at_entry: None,
            bb_position_at_entry: None,
            signal_confidence: Some(7.0),
            signal_reason: None,
            strategy_parameters: Some(serde_json::json!({"breakout_threshold": 0.8})),
            session_id: Some("test_20250301_120000".into()),
            bot_version: Some("1.0.0".into()),
            max_loss_limit: None,
            time_limit_seconds: None,
            notes: None,
            tags: vec!["unit".into()],
        };

        let id = store.with_tx(|tx| insert_register(tx, &row, now())).unwrap();

        let found = store
            .read(|conn| find_open_register(conn, account.id, "BTC-USD", entry_ts))
            .unwrap()
            .expect("open register row must exist");
        assert_eq!(found.id, id);
        assert!(found.is_open());
        assert_eq!(
            found.strategy_parameters.as_ref().unwrap()["breakout_threshold"],
            0.8
        );

        store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO paper_trades
                     (id, account_id, symbol, side, entry_price, entry_time, size, leverage,
                      exit_price, exit_time, entry_fee, exit_fee, total_fees, pnl,
                      pnl_percent, net_pnl, strategy, exit_reason, notes, created_at)
                     VALUES (42, ?1, 'BTC-USD', 'long', 50000.0, ?2, 0.1, 2.0,
                             54587.5, ?2, 2.5, 2.75, 5.25, 458.75,
                             9.175, 412.25, NULL, 'stop_loss', NULL, ?2)",
                    rusqlite::params![account.id, now().to_rfc3339()],
                )
                .map(|_| ())
                .map_err(EngineError::from)
            })
            .unwrap();

        let exit = RegisterExit {
            paper_trade_id: 42,
            exit_timestamp: entry_ts + chrono::Duration::seconds(8_130),
            exit_price: 54_587.5,
            exit_reason: "stop_loss".into(),
            fee_exit: 2.75,
            pnl_gross: 458.75,
            pnl_net: 412.25,
            pnl_percent: 9.175,
            duration_seconds: 8_130,
            expected_exit_price: Some(55_000.0),
            actual_exit_price: 54_587.5,
            exit_slippage_percent: 0.75,
            notes: Some("sweep".into()),
        };
        store
            .with_tx(|tx| patch_register_exit(tx, id, &exit, now()))
            .unwrap();

        let patched = store.register(id).unwrap().unwrap();
        assert_eq!(patched.paper_trade_id, Some(42));
        assert!(!patched.is_open());
        assert!(patched.stop_loss_triggered);
        assert!(!patched.take_profit_triggered);
        assert_eq!(patched.duration_human.as_deref(), Some("2h 15m 30s"));
        assert!((patched.fee_total - 5.25).abs() < 1e-9);

        // No open row remains for the pairing key.
        assert!(store
            .read(|conn| find_open_register(conn, account.id, "BTC-USD", entry_ts))
            .unwrap()
            .is_none());

        // The patch is idempotent: a second application changes nothing.
        let mut second = exit.clone();
        second.paper_trade_id = 99;
        second.pnl_net = -1.0;
        store
            .with_tx(|tx| patch_register_exit(tx, id, &second, now()))
            .unwrap();
        let unchanged = store.register(id).unwrap().unwrap();
        assert_eq!(unchanged.paper_trade_id, Some(42));
        assert_eq!(unchanged.pnl_net, Some(412.25));
    }

    #[test]
    fn session_lifecycle_and_stale_cleanup() {
        let (store, account) = store_with_account();
        let session = SessionRow {
            id: 0,
            session_id: "test_20250301_120000".into(),
            account_id: account.id,
            strategy_id: None,
            mode: TradeMode::Paper,
            symbols: vec!["BTC-USD".into(), "ETH-USD".into()],
            started_at: now(),
            ended_at: None,
            duration_seconds: None,
            time_limit_seconds: Some(3_600),
            max_loss_limit: Some(500.0),
            max_positions: Some(3),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            starting_balance: 10_000.0,
            ending_balance: None,
            peak_balance: Some(10_000.0),
            max_drawdown: 0.0,
            end_reason: None,
            notes: None,
        };
        store.insert_session(&session).unwrap();

        let active = store.active_session(account.id).unwrap().unwrap();
        assert!(active.is_active());
        assert_eq!(active.symbols, vec!["BTC-USD", "ETH-USD"]);

        // A crashed run leaves the row active; startup closes it with `error`.
        let closed = store.close_stale_sessions(account.id, now()).unwrap();
        assert_eq!(closed, 1);
        assert!(store.active_session(account.id).unwrap().is_none());
    }

    #[test]
    fn ohlcv_upsert_deduplicates() {
        let (store, _) = store_with_account();
        let candle = Candle {
            timestamp: now(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        store
            .record_candles("BTC-USD", Timeframe::Min5, &[candle.clone()])
            .unwrap();
        let mut updated = candle;
        updated.close = 1.8;
        store
            .record_candles("BTC-USD", Timeframe::Min5, &[updated])
            .unwrap();

        let (count, close): (i64, f64) = store
            .read(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), MAX(close) FROM ohlcv WHERE symbol = 'BTC-USD'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(EngineError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(close, 1.8);
    }

    #[test]
    fn latest_sentiment_reads_newest() {
        let (store, _) = store_with_account();
        store
            .read(|conn| {
                conn.execute(
                    "INSERT INTO sentiment_scores (symbol, timestamp, score, source)
                     VALUES ('BTC-USD', '2025-03-01T10:00:00+00:00', 0.2, 'llm'),
                            ('BTC-USD', '2025-03-01T11:00:00+00:00', 0.7, 'llm')",
                    [],
                )
                .map_err(EngineError::from)
            })
            .unwrap();
        assert_eq!(store.latest_sentiment("BTC-USD").unwrap(), Some(0.7));
        assert_eq!(store.latest_sentiment("ETH-USD").unwrap(), None);
    }
}
