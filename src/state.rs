use crate::calc::fields::{self, DerivedFields};
use crate::config::AppConfig;
use crate::db::DbPool;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use portable_atomic::{AtomicU64, Ordering};

// ── Core enums ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Coarse trading-hours bucket derived from the entry hour (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    NewYork,
    London,
    Asia,
}

impl Session {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewYork => "NY",
            Self::London => "LN",
            Self::Asia => "AS",
        }
    }
}

impl std::str::FromStr for Session {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NY" => Ok(Self::NewYork),
            "LN" => Ok(Self::London),
            "AS" => Ok(Self::Asia),
            other => Err(format!("unknown session: {other}")),
        }
    }
}

/// Win/loss classification from the realized R multiple.
/// Older records stored lowercase variants; parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Win,
    Loss,
    BreakEven,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::BreakEven => "BE",
        }
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WIN" => Ok(Self::Win),
            "LOSS" => Ok(Self::Loss),
            "BE" => Ok(Self::BreakEven),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Live,
    PropEvaluation,
    PropVerification,
    PropFunded,
    Demo,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::PropEvaluation => "Prop Evaluation",
            Self::PropVerification => "Prop Verification",
            Self::PropFunded => "Prop Funded",
            Self::Demo => "Demo",
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', " ").as_str() {
            "live" => Ok(Self::Live),
            "prop evaluation" => Ok(Self::PropEvaluation),
            "prop verification" => Ok(Self::PropVerification),
            "prop funded" => Ok(Self::PropFunded),
            "demo" => Ok(Self::Demo),
            other => Err(format!("unknown account type: {other}")),
        }
    }
}

macro_rules! string_serde {
    ($($ty:ty),+) => {$(
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    )+};
}

string_serde!(Direction, Session, TradeStatus, AccountType);

// ── Lenient input fields ──

/// Timestamp as it arrives from clients: an epoch-seconds wrapper object,
/// a strict RFC 3339 instant, or a free-form string handed to the fallback
/// parser. Unparsable input normalizes to None, never an error.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum TimestampField {
    Seconds { seconds: f64 },
    Instant(DateTime<Utc>),
    Text(String),
}

/// Numeric raw field: a JSON number or a string to be parsed as one.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum NumberField {
    Num(f64),
    Text(String),
}

// ── Trade records ──

/// Raw trade input as collected from a form, CSV row, or merge result.
/// Every field is optional; the calculator degrades per field.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawTrade {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub volume: Option<NumberField>,
    pub entry_price: Option<NumberField>,
    pub exit_price: Option<NumberField>,
    pub sl: Option<NumberField>,
    pub commission: Option<NumberField>,
    pub swap: Option<NumberField>,
    #[serde(alias = "netPL")]
    pub net_pnl: Option<NumberField>,
    pub entry_timestamp: Option<TimestampField>,
    pub exit_timestamp: Option<TimestampField>,
    /// Cached symbol metadata, attached when the catalog knows the symbol.
    pub pip_size: Option<NumberField>,
    pub pip_value_per_lot: Option<NumberField>,
    pub setup_id: Option<String>,
    pub selected_rules: Vec<String>,
    pub image_url: Option<String>,
    pub notes: Option<serde_json::Value>,
}

/// Persisted trade: normalized raw fields plus the seven derived fields.
/// Derived fields are never hand-edited; they are recomputed from the raw
/// fields before every persistence.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub account_id: String,
    pub user_id: String,
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub volume: Option<f64>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub sl: Option<f64>,
    pub commission: Option<f64>,
    pub swap: Option<f64>,
    #[serde(alias = "netPL")]
    pub net_pnl: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pip_size: Option<f64>,
    pub pip_value_per_lot: Option<f64>,
    pub setup_id: Option<String>,
    pub selected_rules: Vec<String>,
    pub image_url: Option<String>,
    pub notes: Option<serde_json::Value>,
    // Derived
    pub risk_amount: Option<f64>,
    pub duration_min: Option<i64>,
    pub session: Option<Session>,
    pub risk_to_reward: Option<f64>,
    pub percent_risk: Option<f64>,
    pub percent_pnl: Option<f64>,
    pub status: Option<TradeStatus>,
    // Lifecycle
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    /// Build a persisted trade from raw input. Normalization and derivation
    /// both go through calc::fields so every entry point agrees.
    pub fn from_raw(
        id: String,
        account_id: String,
        user_id: String,
        raw: &RawTrade,
        initial_balance: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let derived = fields::derive_trade_fields(raw, initial_balance);
        let mut trade = Self {
            id,
            account_id,
            user_id,
            symbol: raw.symbol.clone(),
            direction: raw.direction,
            volume: fields::numeric(raw.volume.as_ref()),
            entry_price: fields::numeric(raw.entry_price.as_ref()),
            exit_price: fields::numeric(raw.exit_price.as_ref()),
            sl: fields::numeric(raw.sl.as_ref()),
            commission: fields::numeric(raw.commission.as_ref()),
            swap: fields::numeric(raw.swap.as_ref()),
            net_pnl: fields::numeric(raw.net_pnl.as_ref()),
            entry_time: fields::normalize_timestamp(raw.entry_timestamp.as_ref()),
            exit_time: fields::normalize_timestamp(raw.exit_timestamp.as_ref()),
            pip_size: fields::numeric(raw.pip_size.as_ref()),
            pip_value_per_lot: fields::numeric(raw.pip_value_per_lot.as_ref()),
            setup_id: raw.setup_id.clone(),
            selected_rules: raw.selected_rules.clone(),
            image_url: raw.image_url.clone(),
            notes: raw.notes.clone(),
            risk_amount: None,
            duration_min: None,
            session: None,
            risk_to_reward: None,
            percent_risk: None,
            percent_pnl: None,
            status: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
        };
        trade.apply_derived(&derived);
        trade
    }

    /// Project the stored raw fields back into calculator input, so an edit
    /// or a balance change re-derives through the same single module.
    pub fn to_raw(&self) -> RawTrade {
        RawTrade {
            symbol: self.symbol.clone(),
            direction: self.direction,
            volume: self.volume.map(NumberField::Num),
            entry_price: self.entry_price.map(NumberField::Num),
            exit_price: self.exit_price.map(NumberField::Num),
            sl: self.sl.map(NumberField::Num),
            commission: self.commission.map(NumberField::Num),
            swap: self.swap.map(NumberField::Num),
            net_pnl: self.net_pnl.map(NumberField::Num),
            entry_timestamp: self.entry_time.map(TimestampField::Instant),
            exit_timestamp: self.exit_time.map(TimestampField::Instant),
            pip_size: self.pip_size.map(NumberField::Num),
            pip_value_per_lot: self.pip_value_per_lot.map(NumberField::Num),
            setup_id: self.setup_id.clone(),
            selected_rules: self.selected_rules.clone(),
            image_url: self.image_url.clone(),
            notes: self.notes.clone(),
        }
    }

    /// Overwrite the derived fields; stale values are never trusted.
    pub fn apply_derived(&mut self, d: &DerivedFields) {
        self.risk_amount = d.risk_amount;
        self.duration_min = d.duration_min;
        self.session = d.session;
        self.risk_to_reward = d.risk_to_reward;
        self.percent_risk = d.percent_risk;
        self.percent_pnl = d.percent_pnl;
        self.status = d.status;
    }

    /// Recompute all derived fields in place from the current raw fields.
    pub fn recompute(&mut self, initial_balance: f64) {
        let derived = fields::derive_trade_fields(&self.to_raw(), initial_balance);
        self.apply_derived(&derived);
    }
}

// ── Accounts, symbols, setups, tags, notes ──

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Baseline capital for percent risk / percent P&L.
    pub initial_balance: f64,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub id: String,
    pub pip_size: f64,
    pub pip_value_per_lot: f64,
    pub contract_size: f64,
}

/// A strategy playbook. Rule groups are stored as an opaque ordered
/// document; the engine only threads them through.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub rule_groups: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub user_id: String,
    pub trade_id: Option<String>,
    /// Rich-text document, opaque to the engine.
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── DB Commands (sent to writer task via bounded channel) ──

#[derive(Debug)]
pub enum DbCommand {
    InsertTrade(Box<Trade>),
    UpdateTrade(Box<Trade>),
    SoftDeleteTrade {
        account_id: String,
        trade_id: String,
        deleted_at: DateTime<Utc>,
    },
    RestoreTrade {
        account_id: String,
        trade_id: String,
    },
    PurgeTrade {
        account_id: String,
        trade_id: String,
    },
    PurgeExpiredTrades {
        account_id: String,
        cutoff: DateTime<Utc>,
    },
    InsertAccount(Account),
    UpdateAccount(Account),
    DeleteAccount {
        account_id: String,
    },
    InsertSetup(Setup),
    DeleteSetup {
        setup_id: String,
    },
    InsertTag(Tag),
    /// Removes the tag and every trade/note reference to it.
    DeleteTag {
        tag_id: String,
    },
    AttachTag {
        trade_id: String,
        tag_id: String,
    },
    InsertNote(Note),
    DeleteNote {
        note_id: String,
    },
}

// ── Journal events (broadcast to WS subscribers) ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "trade_created")]
    TradeCreated { trade: Box<Trade> },

    #[serde(rename = "trade_updated")]
    TradeUpdated { trade: Box<Trade> },

    #[serde(rename = "trade_deleted")]
    TradeDeleted {
        account_id: String,
        trade_id: String,
        deleted_at: String,
    },

    #[serde(rename = "trade_restored")]
    TradeRestored {
        account_id: String,
        trade_id: String,
    },

    #[serde(rename = "trades_merged")]
    TradesMerged {
        account_id: String,
        merged: Box<Trade>,
        source_ids: Vec<String>,
    },

    #[serde(rename = "import_completed")]
    ImportCompleted {
        account_id: String,
        imported: usize,
        discarded: usize,
    },

    #[serde(rename = "account_updated")]
    AccountUpdated { account: Account },
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub trades_created: AtomicU64,
    pub trades_updated: AtomicU64,
    pub trades_deleted: AtomicU64,
    pub trades_restored: AtomicU64,
    pub recomputes_run: AtomicU64,
    pub rows_imported: AtomicU64,
    pub rows_discarded: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            trades_created: AtomicU64::new(0),
            trades_updated: AtomicU64::new(0),
            trades_deleted: AtomicU64::new(0),
            trades_restored: AtomicU64::new(0),
            recomputes_run: AtomicU64::new(0),
            rows_imported: AtomicU64::new(0),
            rows_discarded: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
        }
    }
}

// ── Application shared state (channels, not locks) ──

pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,

    // Handlers -> DB Writer: bounded command channel
    pub db_tx: mpsc::Sender<DbCommand>,

    // Handlers -> WS subscribers: journal event stream
    pub ws_tx: broadcast::Sender<WsMessage>,

    // Lock-free performance counters
    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool, db_tx: mpsc::Sender<DbCommand>) -> Arc<Self> {
        let (ws_tx, _) = broadcast::channel(2048);

        Arc::new(Self {
            config,
            db,
            db_tx,
            ws_tx,
            counters: PerfCounters::new(),
        })
    }

    #[inline]
    pub fn broadcast(&self, msg: WsMessage) {
        self.counters.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.ws_tx.send(msg);
    }
}
