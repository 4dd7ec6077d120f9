//! Sqlite persistence for swaps, wallet credentials and autoswap history.
//!
//! Every mutation is one transaction; a mutex over the connection serializes
//! writers. Terminal transaction ids (`lockup`, `claim`, `refund`) are
//! guarded set-once at this layer.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::security::{self, EncryptedData, KeyMaterial};
use crate::swap::tree::SwapTree;
use crate::swap::{Currency, Pair, ReverseSwap, Status, Swap, SwapState};
use crate::utill;
use crate::wallet::{Credentials, WalletCredentials};

/// Errors from the persistence layer.
#[derive(Debug)]
pub enum DatabaseError {
    /// Sqlite failure.
    Sqlite(rusqlite::Error),
    /// A stored row no longer parses.
    Corrupt(String),
    /// The referenced row does not exist.
    NotFound(String),
    /// A set-once column was already set to a different value.
    AlreadySet {
        /// Which column refused the write.
        field: &'static str,
    },
    /// Stored credentials are encrypted and no passphrase was supplied.
    MissingPassphrase,
    /// Credential decryption failed.
    Decrypt(security::DecryptError),
    /// Credential encryption failed.
    Encrypt(security::EncryptError),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(value: rusqlite::Error) -> Self {
        DatabaseError::Sqlite(value)
    }
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            DatabaseError::Corrupt(e) => write!(f, "corrupt row: {e}"),
            DatabaseError::NotFound(e) => write!(f, "not found: {e}"),
            DatabaseError::AlreadySet { field } => {
                write!(f, "column {field} is already set")
            }
            DatabaseError::MissingPassphrase => f.write_str("credentials require a passphrase"),
            DatabaseError::Decrypt(e) => write!(f, "credential decryption failed: {e:?}"),
            DatabaseError::Encrypt(e) => write!(f, "credential encryption failed: {e:?}"),
        }
    }
}

/// One executed autoswap, for budget accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSwapEntry {
    /// Swap id the entry belongs to.
    pub swap_id: String,
    /// `"normal"` or `"reverse"`.
    pub swap_type: String,
    /// Channel the recommendation targeted, if per-channel.
    pub channel_id: Option<u64>,
    /// Swap amount in sat.
    pub amount: u64,
    /// Estimated total fee in sat, charged against the budget.
    pub fee_estimate: u64,
    /// Execution time.
    pub created_at: DateTime<Utc>,
}

/// Handle to the sqlite database.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    DatabaseError::Corrupt(format!("could not create {}: {e}", dir.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Where this database lives, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(conn: &Connection) -> Result<(), DatabaseError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        migrate(conn)?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database connection poisoned")
    }

    // ---- submarine swaps ----

    /// Insert a freshly created submarine swap.
    pub fn insert_swap(&self, swap: &Swap) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO swaps (
                id, pair_from, pair_to, state, error, status, private_key,
                preimage, preimage_hash, invoice, address, expected_amount,
                timeout_block_height, blinding_key, lockup_txid, refund_txid,
                refund_address, is_auto, service_fee_percent, service_fee,
                onchain_fee, wallet, swap_tree, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                swap.id,
                swap.pair.from.as_str(),
                swap.pair.to.as_str(),
                swap.state.as_str(),
                swap.error,
                swap.status.as_str(),
                utill::to_hex(&swap.private_key.secret_bytes()),
                swap.preimage.map(|p| utill::to_hex(&p)),
                utill::to_hex(&swap.preimage_hash),
                swap.invoice,
                swap.address,
                swap.expected_amount,
                swap.timeout_block_height,
                swap.blinding_key.map(|k| utill::to_hex(&k.secret_bytes())),
                swap.lockup_transaction_id,
                swap.refund_transaction_id,
                swap.refund_address,
                swap.is_auto,
                swap.service_fee_percent,
                swap.service_fee,
                swap.onchain_fee,
                swap.wallet,
                swap.tree.to_json(),
                swap.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Point query by id.
    pub fn query_swap(&self, id: &str) -> Result<Option<Swap>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(SWAP_SELECT)?;
        let swap = stmt
            .query_row(params![id], row_to_swap)
            .optional()?;
        Ok(swap)
    }

    /// All submarine swaps still in flight.
    pub fn query_pending_swaps(&self) -> Result<Vec<Swap>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{SWAP_SELECT_ALL} WHERE state = 'pending'"))?;
        let rows = stmt.query_map([], row_to_swap)?;
        collect_rows(rows)
    }

    /// Submarine swaps whose refund path is due at `height`: pending, lockup
    /// seen, refund not yet broadcast, timeout reached.
    pub fn query_refundable_swaps(&self, height: u32) -> Result<Vec<Swap>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SWAP_SELECT_ALL} WHERE state = 'pending'
               AND lockup_txid IS NOT NULL
               AND refund_txid IS NULL
               AND timeout_block_height <= ?1"
        ))?;
        let rows = stmt.query_map(params![height], row_to_swap)?;
        collect_rows(rows)
    }

    /// Update the exchange status string.
    pub fn update_swap_status(&self, id: &str, status: &Status) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE swaps SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        ensure_found(changed, id)
    }

    /// Transition the client-side state, optionally recording an error.
    pub fn set_swap_state(
        &self,
        id: &str,
        state: SwapState,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE swaps SET state = ?2, error = COALESCE(?3, error) WHERE id = ?1",
            params![id, state.as_str(), error],
        )?;
        ensure_found(changed, id)
    }

    /// Record the lockup transaction. Set-once.
    pub fn set_swap_lockup_transaction_id(
        &self,
        id: &str,
        txid: &str,
    ) -> Result<(), DatabaseError> {
        self.set_once("swaps", "lockup_txid", id, txid)
    }

    /// Record the refund transaction. Set-once.
    pub fn set_swap_refund_transaction_id(
        &self,
        id: &str,
        txid: &str,
    ) -> Result<(), DatabaseError> {
        self.set_once("swaps", "refund_txid", id, txid)
    }

    /// Record the refund destination once it is resolved.
    pub fn set_swap_refund_address(&self, id: &str, address: &str) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE swaps SET refund_address = ?2 WHERE id = ?1",
            params![id, address],
        )?;
        ensure_found(changed, id)
    }

    /// Record settlement fee accounting.
    pub fn set_swap_fees(
        &self,
        id: &str,
        service_fee: u64,
        onchain_fee: u64,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE swaps SET service_fee = ?2, onchain_fee = ?3 WHERE id = ?1",
            params![id, service_fee, onchain_fee],
        )?;
        ensure_found(changed, id)
    }

    // ---- reverse swaps ----

    /// Insert a freshly created reverse swap.
    pub fn insert_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO reverse_swaps (
                id, pair_from, pair_to, state, error, status, private_key,
                preimage, preimage_hash, invoice, lockup_address,
                onchain_amount, timeout_block_height, accept_zero_conf,
                claim_address, claim_txid, routing_fee_msat, external_pay,
                chan_ids, blinding_key, is_auto, service_fee_percent,
                service_fee, onchain_fee, swap_tree, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                      ?25, ?26)",
            params![
                swap.id,
                swap.pair.from.as_str(),
                swap.pair.to.as_str(),
                swap.state.as_str(),
                swap.error,
                swap.status.as_str(),
                utill::to_hex(&swap.private_key.secret_bytes()),
                utill::to_hex(&swap.preimage),
                utill::to_hex(&swap.preimage_hash),
                swap.invoice,
                swap.lockup_address,
                swap.onchain_amount,
                swap.timeout_block_height,
                swap.accept_zero_conf,
                swap.claim_address,
                swap.claim_transaction_id,
                swap.routing_fee_msat,
                swap.external_pay,
                serde_json::to_string(&swap.chan_ids)
                    .expect("channel id list serializes"),
                swap.blinding_key.map(|k| utill::to_hex(&k.secret_bytes())),
                swap.is_auto,
                swap.service_fee_percent,
                swap.service_fee,
                swap.onchain_fee,
                swap.tree.to_json(),
                swap.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Point query by id.
    pub fn query_reverse_swap(&self, id: &str) -> Result<Option<ReverseSwap>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(REVERSE_SELECT)?;
        let swap = stmt
            .query_row(params![id], row_to_reverse_swap)
            .optional()?;
        Ok(swap)
    }

    /// All reverse swaps still in flight.
    pub fn query_pending_reverse_swaps(&self) -> Result<Vec<ReverseSwap>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{REVERSE_SELECT_ALL} WHERE state = 'pending'"))?;
        let rows = stmt.query_map([], row_to_reverse_swap)?;
        collect_rows(rows)
    }

    /// Update the exchange status string.
    pub fn update_reverse_swap_status(
        &self,
        id: &str,
        status: &Status,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE reverse_swaps SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        ensure_found(changed, id)
    }

    /// Transition the client-side state, optionally recording an error.
    pub fn set_reverse_swap_state(
        &self,
        id: &str,
        state: SwapState,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE reverse_swaps SET state = ?2, error = COALESCE(?3, error) WHERE id = ?1",
            params![id, state.as_str(), error],
        )?;
        ensure_found(changed, id)
    }

    /// Record the claim transaction. Set-once.
    pub fn set_reverse_swap_claim_transaction_id(
        &self,
        id: &str,
        txid: &str,
    ) -> Result<(), DatabaseError> {
        self.set_once("reverse_swaps", "claim_txid", id, txid)
    }

    /// Record the routing fee reported by the payment module.
    pub fn set_reverse_swap_routing_fee(
        &self,
        id: &str,
        routing_fee_msat: u64,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE reverse_swaps SET routing_fee_msat = ?2 WHERE id = ?1",
            params![id, routing_fee_msat],
        )?;
        ensure_found(changed, id)
    }

    /// Record the measured claim miner fee.
    pub fn set_reverse_swap_onchain_fee(
        &self,
        id: &str,
        onchain_fee: u64,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE reverse_swaps SET onchain_fee = ?2 WHERE id = ?1",
            params![id, onchain_fee],
        )?;
        ensure_found(changed, id)
    }

    /// Record settlement fee accounting.
    pub fn set_reverse_swap_fees(
        &self,
        id: &str,
        service_fee: u64,
        onchain_fee: u64,
    ) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE reverse_swaps SET service_fee = ?2, onchain_fee = ?3 WHERE id = ?1",
            params![id, service_fee, onchain_fee],
        )?;
        ensure_found(changed, id)
    }

    fn set_once(
        &self,
        table: &str,
        field: &'static str,
        id: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            &format!(
                "UPDATE {table} SET {field} = ?2
                 WHERE id = ?1 AND ({field} IS NULL OR {field} = ?2)"
            ),
            params![id, value],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let exists: bool = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get::<_, i64>(0).map(|count| count > 0),
            )
            .unwrap_or(false);
        if exists {
            Err(DatabaseError::AlreadySet { field })
        } else {
            Err(DatabaseError::NotFound(id.to_string()))
        }
    }

    // ---- wallet credentials ----

    /// Store wallet credentials, encrypting the payload when key material is
    /// supplied.
    pub fn save_wallet_credentials(
        &self,
        credentials: &WalletCredentials,
        enc_material: Option<&KeyMaterial>,
    ) -> Result<(), DatabaseError> {
        let (payload, encrypted) = match enc_material {
            Some(material) => {
                let envelope = security::encrypt_struct(&credentials.credentials, material)
                    .map_err(DatabaseError::Encrypt)?;
                (
                    serde_cbor::to_vec(&envelope)
                        .map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
                    true,
                )
            }
            None => (
                serde_cbor::to_vec(&credentials.credentials)
                    .map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
                false,
            ),
        };

        self.conn().execute(
            "INSERT OR REPLACE INTO wallet_credentials
                (name, currency, payload, encrypted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                credentials.name,
                credentials.currency.as_str(),
                payload,
                encrypted,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Load wallet credentials by name, decrypting with `password` when the
    /// stored payload is encrypted.
    pub fn load_wallet_credentials(
        &self,
        name: &str,
        password: Option<&str>,
    ) -> Result<Option<WalletCredentials>, DatabaseError> {
        let row: Option<(String, Vec<u8>, bool)> = self
            .conn()
            .query_row(
                "SELECT currency, payload, encrypted FROM wallet_credentials WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((currency, payload, encrypted)) = row else {
            return Ok(None);
        };
        let currency = Currency::from_str_opt(&currency)
            .ok_or_else(|| DatabaseError::Corrupt(format!("unknown currency {currency}")))?;

        let credentials: Credentials = if encrypted {
            let password = password.ok_or(DatabaseError::MissingPassphrase)?;
            let envelope: EncryptedData = utill::deserialize_from_cbor(payload)
                .map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
            let material =
                KeyMaterial::existing(password, envelope.nonce(), envelope.pbkdf2_salt());
            security::decrypt_struct(&envelope, &material).map_err(DatabaseError::Decrypt)?
        } else {
            utill::deserialize_from_cbor(payload)
                .map_err(|e| DatabaseError::Corrupt(e.to_string()))?
        };

        Ok(Some(WalletCredentials {
            name: name.to_string(),
            currency,
            credentials,
        }))
    }

    // ---- autoswap history ----

    /// Record an executed autoswap.
    pub fn insert_auto_swap(&self, entry: &AutoSwapEntry) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO auto_swap_history
                (swap_id, swap_type, channel_id, amount, fee_estimate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.swap_id,
                entry.swap_type,
                entry.channel_id,
                entry.amount,
                entry.fee_estimate,
                entry.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Autoswaps executed at or after `since`, newest last.
    pub fn query_auto_swaps_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AutoSwapEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT swap_id, swap_type, channel_id, amount, fee_estimate, created_at
             FROM auto_swap_history WHERE created_at >= ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![since.timestamp()], row_to_auto_swap_entry)?;
        collect_rows(rows)
    }

    /// Autoswaps whose underlying swap row is still pending, regardless of
    /// how long ago they were executed.
    pub fn query_pending_auto_swaps(&self) -> Result<Vec<AutoSwapEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT h.swap_id, h.swap_type, h.channel_id, h.amount, h.fee_estimate,
                    h.created_at
             FROM auto_swap_history h
             WHERE (h.swap_type = 'normal' AND EXISTS (
                        SELECT 1 FROM swaps s
                        WHERE s.id = h.swap_id AND s.state = 'pending'))
                OR (h.swap_type = 'reverse' AND EXISTS (
                        SELECT 1 FROM reverse_swaps r
                        WHERE r.id = h.swap_id AND r.state = 'pending'))
             ORDER BY h.created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_auto_swap_entry)?;
        collect_rows(rows)
    }

    /// Timestamp of the earliest recorded autoswap at or after `since`.
    pub fn first_auto_swap_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let ts: Option<i64> = self.conn().query_row(
            "SELECT MIN(created_at) FROM auto_swap_history WHERE created_at >= ?1",
            params![since.timestamp()],
            |row| row.get(0),
        )?;
        Ok(ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }
}

const SWAP_SELECT: &str = "SELECT id, pair_from, pair_to, state, error, status, private_key,
    preimage, preimage_hash, invoice, address, expected_amount,
    timeout_block_height, blinding_key, lockup_txid, refund_txid,
    refund_address, is_auto, service_fee_percent, service_fee, onchain_fee,
    wallet, swap_tree, created_at FROM swaps WHERE id = ?1";

const SWAP_SELECT_ALL: &str = "SELECT id, pair_from, pair_to, state, error, status, private_key,
    preimage, preimage_hash, invoice, address, expected_amount,
    timeout_block_height, blinding_key, lockup_txid, refund_txid,
    refund_address, is_auto, service_fee_percent, service_fee, onchain_fee,
    wallet, swap_tree, created_at FROM swaps";

const REVERSE_SELECT: &str = "SELECT id, pair_from, pair_to, state, error, status, private_key,
    preimage, preimage_hash, invoice, lockup_address, onchain_amount,
    timeout_block_height, accept_zero_conf, claim_address, claim_txid,
    routing_fee_msat, external_pay, chan_ids, blinding_key, is_auto,
    service_fee_percent, service_fee, onchain_fee, swap_tree, created_at
    FROM reverse_swaps WHERE id = ?1";

const REVERSE_SELECT_ALL: &str = "SELECT id, pair_from, pair_to, state, error, status, private_key,
    preimage, preimage_hash, invoice, lockup_address, onchain_amount,
    timeout_block_height, accept_zero_conf, claim_address, claim_txid,
    routing_fee_msat, external_pay, chan_ids, blinding_key, is_auto,
    service_fee_percent, service_fee, onchain_fee, swap_tree, created_at
    FROM reverse_swaps";

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS swaps (
            id TEXT PRIMARY KEY,
            pair_from TEXT NOT NULL,
            pair_to TEXT NOT NULL,
            state TEXT NOT NULL,
            error TEXT,
            status TEXT NOT NULL,
            private_key TEXT NOT NULL,
            preimage TEXT,
            preimage_hash TEXT NOT NULL,
            invoice TEXT,
            address TEXT NOT NULL,
            expected_amount INTEGER NOT NULL,
            timeout_block_height INTEGER NOT NULL,
            blinding_key TEXT,
            lockup_txid TEXT,
            refund_txid TEXT,
            refund_address TEXT,
            is_auto INTEGER NOT NULL DEFAULT 0,
            service_fee_percent REAL NOT NULL DEFAULT 0,
            service_fee INTEGER,
            onchain_fee INTEGER,
            wallet TEXT,
            swap_tree TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(state);
        CREATE INDEX IF NOT EXISTS swaps_timeout_idx ON swaps(timeout_block_height);

        CREATE TABLE IF NOT EXISTS reverse_swaps (
            id TEXT PRIMARY KEY,
            pair_from TEXT NOT NULL,
            pair_to TEXT NOT NULL,
            state TEXT NOT NULL,
            error TEXT,
            status TEXT NOT NULL,
            private_key TEXT NOT NULL,
            preimage TEXT NOT NULL,
            preimage_hash TEXT NOT NULL,
            invoice TEXT NOT NULL,
            lockup_address TEXT NOT NULL,
            onchain_amount INTEGER NOT NULL,
            timeout_block_height INTEGER NOT NULL,
            accept_zero_conf INTEGER NOT NULL DEFAULT 0,
            claim_address TEXT NOT NULL,
            claim_txid TEXT,
            routing_fee_msat INTEGER,
            external_pay INTEGER NOT NULL DEFAULT 0,
            chan_ids TEXT NOT NULL DEFAULT '[]',
            blinding_key TEXT,
            is_auto INTEGER NOT NULL DEFAULT 0,
            service_fee_percent REAL NOT NULL DEFAULT 0,
            service_fee INTEGER,
            onchain_fee INTEGER,
            swap_tree TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS reverse_swaps_state_idx ON reverse_swaps(state);

        CREATE TABLE IF NOT EXISTS wallet_credentials (
            name TEXT PRIMARY KEY,
            currency TEXT NOT NULL,
            payload BLOB NOT NULL,
            encrypted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auto_swap_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            swap_id TEXT NOT NULL,
            swap_type TEXT NOT NULL,
            channel_id INTEGER,
            amount INTEGER NOT NULL,
            fee_estimate INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS auto_swap_history_time_idx
            ON auto_swap_history(created_at);",
    )?;
    Ok(())
}

fn ensure_found(changed: usize, id: &str) -> Result<(), DatabaseError> {
    if changed == 1 {
        Ok(())
    } else {
        Err(DatabaseError::NotFound(id.to_string()))
    }
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn invalid(col: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_currency(value: String, col: usize) -> rusqlite::Result<Currency> {
    Currency::from_str_opt(&value).ok_or_else(|| invalid(col, format!("unknown currency {value}")))
}

fn parse_state(value: String, col: usize) -> rusqlite::Result<SwapState> {
    SwapState::from_str_opt(&value).ok_or_else(|| invalid(col, format!("unknown state {value}")))
}

fn parse_secret_key(value: String, col: usize) -> rusqlite::Result<SecretKey> {
    let bytes = utill::from_hex(&value).map_err(|e| invalid(col, format!("bad key hex: {e}")))?;
    SecretKey::from_slice(&bytes).map_err(|e| invalid(col, format!("bad key: {e}")))
}

fn parse_hash32(value: String, col: usize) -> rusqlite::Result<[u8; 32]> {
    let bytes = utill::from_hex(&value).map_err(|e| invalid(col, format!("bad hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| invalid(col, "expected 32 bytes".to_string()))
}

fn parse_tree(value: String, col: usize) -> rusqlite::Result<SwapTree> {
    SwapTree::from_json(&value).map_err(|e| invalid(col, format!("bad tree: {e:?}")))
}

fn timestamp_to_datetime(ts: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| invalid(col, format!("bad timestamp {ts}")))
}

fn row_to_auto_swap_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutoSwapEntry> {
    Ok(AutoSwapEntry {
        swap_id: row.get(0)?,
        swap_type: row.get(1)?,
        channel_id: row.get(2)?,
        amount: row.get(3)?,
        fee_estimate: row.get(4)?,
        created_at: timestamp_to_datetime(row.get(5)?, 5)?,
    })
}

fn row_to_swap(row: &rusqlite::Row<'_>) -> rusqlite::Result<Swap> {
    let preimage: Option<String> = row.get(7)?;
    let blinding_key: Option<String> = row.get(13)?;
    Ok(Swap {
        id: row.get(0)?,
        pair: Pair {
            from: parse_currency(row.get(1)?, 1)?,
            to: parse_currency(row.get(2)?, 2)?,
        },
        state: parse_state(row.get(3)?, 3)?,
        error: row.get(4)?,
        status: Status::parse(&row.get::<_, String>(5)?),
        private_key: parse_secret_key(row.get(6)?, 6)?,
        preimage: preimage.map(|p| parse_hash32(p, 7)).transpose()?,
        preimage_hash: parse_hash32(row.get(8)?, 8)?,
        invoice: row.get(9)?,
        address: row.get(10)?,
        expected_amount: row.get(11)?,
        timeout_block_height: row.get(12)?,
        blinding_key: blinding_key.map(|k| parse_secret_key(k, 13)).transpose()?,
        lockup_transaction_id: row.get(14)?,
        refund_transaction_id: row.get(15)?,
        refund_address: row.get(16)?,
        is_auto: row.get(17)?,
        service_fee_percent: row.get(18)?,
        service_fee: row.get(19)?,
        onchain_fee: row.get(20)?,
        wallet: row.get(21)?,
        tree: parse_tree(row.get(22)?, 22)?,
        created_at: timestamp_to_datetime(row.get(23)?, 23)?,
    })
}

fn row_to_reverse_swap(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReverseSwap> {
    let chan_ids: String = row.get(18)?;
    let blinding_key: Option<String> = row.get(19)?;
    Ok(ReverseSwap {
        id: row.get(0)?,
        pair: Pair {
            from: parse_currency(row.get(1)?, 1)?,
            to: parse_currency(row.get(2)?, 2)?,
        },
        state: parse_state(row.get(3)?, 3)?,
        error: row.get(4)?,
        status: Status::parse(&row.get::<_, String>(5)?),
        private_key: parse_secret_key(row.get(6)?, 6)?,
        preimage: parse_hash32(row.get(7)?, 7)?,
        preimage_hash: parse_hash32(row.get(8)?, 8)?,
        invoice: row.get(9)?,
        lockup_address: row.get(10)?,
        onchain_amount: row.get(11)?,
        timeout_block_height: row.get(12)?,
        accept_zero_conf: row.get(13)?,
        claim_address: row.get(14)?,
        claim_transaction_id: row.get(15)?,
        routing_fee_msat: row.get(16)?,
        external_pay: row.get(17)?,
        chan_ids: serde_json::from_str(&chan_ids)
            .map_err(|e| invalid(18, format!("bad channel ids: {e}")))?,
        blinding_key: blinding_key.map(|k| parse_secret_key(k, 19)).transpose()?,
        is_auto: row.get(20)?,
        service_fee_percent: row.get(21)?,
        service_fee: row.get(22)?,
        onchain_fee: row.get(23)?,
        tree: parse_tree(row.get(24)?, 24)?,
        created_at: timestamp_to_datetime(row.get(25)?, 25)?,
    })
}

/// Swap fixtures shared by unit tests across modules.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::swap::tree::{SwapTree, TreeKind};
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{PublicKey, Secp256k1};

    /// A pending BTC/BTC submarine swap with deterministic keys.
    pub(crate) fn minimal_swap(id: &str) -> Swap {
        let secp = Secp256k1::new();
        let private_key = SecretKey::from_slice(&[0x61; 32]).unwrap();
        let exchange_key =
            PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x62; 32]).unwrap());
        let preimage_hash = sha256::Hash::hash(&[7u8; 32]).to_byte_array();
        let tree = SwapTree::new(
            TreeKind::Submarine,
            &preimage_hash,
            exchange_key,
            PublicKey::from_secret_key(&secp, &private_key),
            802_000,
        );
        Swap {
            id: id.to_string(),
            pair: Pair {
                from: Currency::Btc,
                to: Currency::Btc,
            },
            state: SwapState::Pending,
            error: None,
            status: Status::SwapCreated,
            private_key,
            preimage: None,
            preimage_hash,
            invoice: None,
            address: "bcrt1ptest".to_string(),
            expected_amount: 100_000,
            timeout_block_height: 802_000,
            blinding_key: None,
            lockup_transaction_id: None,
            refund_transaction_id: None,
            refund_address: None,
            is_auto: false,
            service_fee_percent: 0.1,
            service_fee: None,
            onchain_fee: None,
            wallet: None,
            tree,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::tree::{SwapTree, TreeKind};
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{PublicKey, Secp256k1};
    use chrono::Duration as ChronoDuration;

    fn test_swap(id: &str) -> Swap {
        let secp = Secp256k1::new();
        let private_key = SecretKey::from_slice(&[0x41; 32]).unwrap();
        let exchange_key =
            PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());
        let preimage_hash = sha256::Hash::hash(&[1u8; 32]).to_byte_array();
        let tree = SwapTree::new(
            TreeKind::Submarine,
            &preimage_hash,
            exchange_key,
            PublicKey::from_secret_key(&secp, &private_key),
            800_000,
        );
        Swap {
            id: id.to_string(),
            pair: Pair {
                from: Currency::Btc,
                to: Currency::Btc,
            },
            state: SwapState::Pending,
            error: None,
            status: Status::SwapCreated,
            private_key,
            preimage: None,
            preimage_hash,
            invoice: Some("lnbc1test".to_string()),
            address: "bcrt1ptest".to_string(),
            expected_amount: 100_200,
            timeout_block_height: 800_000,
            blinding_key: None,
            lockup_transaction_id: None,
            refund_transaction_id: None,
            refund_address: None,
            is_auto: false,
            service_fee_percent: 0.1,
            service_fee: None,
            onchain_fee: Some(200),
            wallet: Some("main".to_string()),
            tree,
            created_at: Utc::now(),
        }
    }

    fn test_reverse_swap(id: &str) -> ReverseSwap {
        let secp = Secp256k1::new();
        let private_key = SecretKey::from_slice(&[0x51; 32]).unwrap();
        let exchange_key =
            PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x52; 32]).unwrap());
        let preimage = [9u8; 32];
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let tree = SwapTree::new(
            TreeKind::Reverse,
            &preimage_hash,
            PublicKey::from_secret_key(&secp, &private_key),
            exchange_key,
            801_000,
        );
        ReverseSwap {
            id: id.to_string(),
            pair: Pair {
                from: Currency::Btc,
                to: Currency::Lbtc,
            },
            state: SwapState::Pending,
            error: None,
            status: Status::SwapCreated,
            private_key,
            preimage,
            preimage_hash,
            invoice: "lnbc1reverse".to_string(),
            lockup_address: "el1pqtest".to_string(),
            onchain_amount: 99_500,
            timeout_block_height: 801_000,
            accept_zero_conf: true,
            claim_address: "el1qqdest".to_string(),
            claim_transaction_id: None,
            routing_fee_msat: None,
            external_pay: false,
            chan_ids: vec![123_456_789],
            blinding_key: Some(SecretKey::from_slice(&[0x53; 32]).unwrap()),
            is_auto: true,
            service_fee_percent: 0.25,
            service_fee: None,
            onchain_fee: None,
            tree,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_swap_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let swap = test_swap("sub1");
        db.insert_swap(&swap).unwrap();

        let loaded = db.query_swap("sub1").unwrap().unwrap();
        assert_eq!(loaded.id, swap.id);
        assert_eq!(loaded.tree, swap.tree);
        assert_eq!(loaded.preimage_hash, swap.preimage_hash);
        assert_eq!(loaded.expected_amount, 100_200);
        assert_eq!(loaded.state, SwapState::Pending);
        assert!(db.query_swap("missing").unwrap().is_none());
    }

    #[test]
    fn test_reverse_swap_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let swap = test_reverse_swap("rev1");
        db.insert_reverse_swap(&swap).unwrap();

        let loaded = db.query_reverse_swap("rev1").unwrap().unwrap();
        assert_eq!(loaded.preimage, swap.preimage);
        assert_eq!(loaded.chan_ids, vec![123_456_789]);
        assert_eq!(loaded.blinding_key, swap.blinding_key);
        assert!(loaded.accept_zero_conf);
        assert!(loaded.is_auto);
    }

    #[test]
    fn test_refundable_query_gates_on_height_and_lockup() {
        let db = Database::open_in_memory().unwrap();
        let swap = test_swap("sub1");
        db.insert_swap(&swap).unwrap();

        // No lockup yet: not refundable even past timeout.
        assert!(db.query_refundable_swaps(900_000).unwrap().is_empty());

        db.set_swap_lockup_transaction_id("sub1", "aa".repeat(32).as_str())
            .unwrap();
        // Exactly at the timeout height the refund is due.
        assert_eq!(db.query_refundable_swaps(800_000).unwrap().len(), 1);
        assert!(db.query_refundable_swaps(799_999).unwrap().is_empty());

        db.set_swap_refund_transaction_id("sub1", "bb".repeat(32).as_str())
            .unwrap();
        assert!(db.query_refundable_swaps(900_000).unwrap().is_empty());
    }

    #[test]
    fn test_set_once_guards() {
        let db = Database::open_in_memory().unwrap();
        db.insert_swap(&test_swap("sub1")).unwrap();

        db.set_swap_lockup_transaction_id("sub1", "aa").unwrap();
        // Idempotent for the same value.
        db.set_swap_lockup_transaction_id("sub1", "aa").unwrap();
        assert!(matches!(
            db.set_swap_lockup_transaction_id("sub1", "bb"),
            Err(DatabaseError::AlreadySet {
                field: "lockup_txid"
            })
        ));
        assert!(matches!(
            db.set_swap_lockup_transaction_id("nope", "aa"),
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_state_and_fee_updates() {
        let db = Database::open_in_memory().unwrap();
        db.insert_swap(&test_swap("sub1")).unwrap();

        db.update_swap_status("sub1", &Status::TransactionClaimed)
            .unwrap();
        db.set_swap_fees("sub1", 100, 200).unwrap();
        db.set_swap_state("sub1", SwapState::Successful, None)
            .unwrap();

        let loaded = db.query_swap("sub1").unwrap().unwrap();
        assert_eq!(loaded.status, Status::TransactionClaimed);
        assert_eq!(loaded.state, SwapState::Successful);
        assert_eq!(loaded.service_fee, Some(100));
        assert_eq!(loaded.onchain_fee, Some(200));
        assert!(db.query_pending_swaps().unwrap().is_empty());
    }

    #[test]
    fn test_wallet_credentials_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let creds = WalletCredentials {
            name: "main".to_string(),
            currency: Currency::Lbtc,
            credentials: Credentials::Mnemonic {
                mnemonic: "abandon ability able".to_string(),
                subaccount: Some(1),
            },
        };
        db.save_wallet_credentials(&creds, None).unwrap();
        let loaded = db.load_wallet_credentials("main", None).unwrap().unwrap();
        assert_eq!(loaded, creds);
    }

    #[test]
    fn test_wallet_credentials_encrypted() {
        let db = Database::open_in_memory().unwrap();
        let creds = WalletCredentials {
            name: "vault".to_string(),
            currency: Currency::Btc,
            credentials: Credentials::Mnemonic {
                mnemonic: "zoo zoo zoo".to_string(),
                subaccount: None,
            },
        };
        let material = KeyMaterial::new_from_password("pass");
        db.save_wallet_credentials(&creds, Some(&material)).unwrap();

        assert!(matches!(
            db.load_wallet_credentials("vault", None),
            Err(DatabaseError::MissingPassphrase)
        ));
        assert!(matches!(
            db.load_wallet_credentials("vault", Some("wrong")),
            Err(DatabaseError::Decrypt(_))
        ));
        let loaded = db
            .load_wallet_credentials("vault", Some("pass"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, creds);
    }

    #[test]
    fn test_pending_auto_swap_query_ignores_age() {
        let db = Database::open_in_memory().unwrap();
        db.insert_swap(&test_swap("subA")).unwrap();
        db.insert_reverse_swap(&test_reverse_swap("revA")).unwrap();

        let now = Utc::now();
        for (id, swap_type, channel, age_days) in [
            // Well outside any budget window, but still in flight.
            ("subA", "normal", 1u64, 40),
            ("revA", "reverse", 2, 0),
            // No swap row behind it at all.
            ("ghost", "reverse", 3, 0),
        ] {
            db.insert_auto_swap(&AutoSwapEntry {
                swap_id: id.to_string(),
                swap_type: swap_type.to_string(),
                channel_id: Some(channel),
                amount: 100_000,
                fee_estimate: 500,
                created_at: now - ChronoDuration::days(age_days),
            })
            .unwrap();
        }

        let open = db.query_pending_auto_swaps().unwrap();
        let channels: Vec<_> = open.iter().filter_map(|e| e.channel_id).collect();
        assert_eq!(channels, vec![1, 2]);

        db.set_swap_state("subA", SwapState::Successful, None).unwrap();
        let open = db.query_pending_auto_swaps().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].swap_id, "revA");
    }

    #[test]
    fn test_auto_swap_history_window() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for (id, age_hours, fee) in [("a", 30, 500u64), ("b", 5, 600), ("c", 1, 700)] {
            db.insert_auto_swap(&AutoSwapEntry {
                swap_id: id.to_string(),
                swap_type: "reverse".to_string(),
                channel_id: Some(42),
                amount: 100_000,
                fee_estimate: fee,
                created_at: now - ChronoDuration::hours(age_hours),
            })
            .unwrap();
        }

        let window = db
            .query_auto_swaps_since(now - ChronoDuration::hours(24))
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(
            window.iter().map(|e| e.fee_estimate).sum::<u64>(),
            1_300
        );
        let first = db
            .first_auto_swap_since(now - ChronoDuration::hours(24))
            .unwrap()
            .unwrap();
        assert_eq!(first.timestamp(), (now - ChronoDuration::hours(5)).timestamp());
    }
}
