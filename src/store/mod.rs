pub mod models;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{ShopError, ShopResult};
use models::{
    Invoice, InvoiceStatus, Lease, LedgerEntry, LedgerReason, PayChannel, Protocol, Role,
    ServerRecord, User,
};

/// Single owned handle to the persistent state. All reads and writes go
/// through one connection behind a mutex; that lock is the serialization
/// point for balance mutations, settlement transitions and sweeper passes.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> ShopResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                role TEXT NOT NULL DEFAULT 'standard',
                registered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                correlation_id TEXT,
                balance_after INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            -- Invoice id uniqueness is what makes settlement idempotent.
            CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                channel TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending','paid','expired')),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                protocol TEXT NOT NULL,
                username TEXT NOT NULL UNIQUE,
                price INTEGER NOT NULL,
                trial INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                reminder_sent INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS trial_claims (
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                protocol TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                PRIMARY KEY (user_id, server_id, protocol)
            );

            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                api_token TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS server_prices (
                server_id TEXT NOT NULL,
                protocol TEXT NOT NULL,
                role TEXT NOT NULL,
                price_per_30d INTEGER NOT NULL,
                PRIMARY KEY (server_id, protocol, role),
                FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> ShopResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ShopError::Internal(format!("store lock poisoned: {e}")))
    }

    // ---- users ----

    /// Create the user on first contact. Returns true if a row was inserted.
    pub fn ensure_user(&self, id: &str, username: &str, role: Role) -> ShopResult<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, username, balance, role, registered_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![id, username, role.as_str(), Utc::now().to_rfc3339()],
        )?;
        if inserted > 0 {
            debug!("registered new user {} (@{})", id, username);
        }
        Ok(inserted > 0)
    }

    pub fn get_user(&self, id: &str) -> ShopResult<Option<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, balance, role, registered_at FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        match rows.next() {
            Some(row) => {
                let (id, username, balance, role, registered_at) = row?;
                Ok(Some(User {
                    id,
                    username,
                    balance,
                    role: parse_enum(&role)?,
                    registered_at: parse_ts(&registered_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn set_role(&self, id: &str, role: Role) -> ShopResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role.as_str(), id],
        )?;
        if changed == 0 {
            return Err(ShopError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    pub fn all_user_ids(&self) -> ShopResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY registered_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ---- invoices ----

    pub fn insert_invoice(
        &self,
        id: &str,
        user_id: &str,
        amount: i64,
        channel: PayChannel,
    ) -> ShopResult<Invoice> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO invoices (id, user_id, amount, channel, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, user_id, amount, channel.as_str(), created_at.to_rfc3339()],
        )?;
        Ok(Invoice {
            id: id.to_string(),
            user_id: user_id.to_string(),
            amount,
            channel,
            status: InvoiceStatus::Pending,
            created_at,
        })
    }

    pub fn get_invoice(&self, id: &str) -> ShopResult<Option<Invoice>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, channel, status, created_at FROM invoices WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        match rows.next() {
            Some(row) => {
                let (id, user_id, amount, channel, status, created_at) = row?;
                Ok(Some(Invoice {
                    id,
                    user_id,
                    amount,
                    channel: parse_enum(&channel)?,
                    status: parse_enum(&status)?,
                    created_at: parse_ts(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Atomic pending → terminal transition. Returns true iff this call won
    /// the race; a second caller (or any call on an already-terminal invoice)
    /// sees false. This guarded update is the settlement exclusion.
    pub fn try_transition_invoice(&self, id: &str, to: InvoiceStatus) -> ShopResult<bool> {
        debug_assert!(to.is_terminal());
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE invoices SET status = ?1 WHERE id = ?2 AND status = 'pending'",
            params![to.as_str(), id],
        )?;
        Ok(changed == 1)
    }

    /// Most recent settled invoices, newest first.
    pub fn recent_paid_invoices(&self, limit: usize) -> ShopResult<Vec<Invoice>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, channel, status, created_at FROM invoices
             WHERE status = 'paid' ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut invoices = Vec::new();
        for row in rows {
            let (id, user_id, amount, channel, status, created_at) = row?;
            invoices.push(Invoice {
                id,
                user_id,
                amount,
                channel: parse_enum(&channel)?,
                status: parse_enum(&status)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(invoices)
    }

    // ---- leases ----

    #[allow(clippy::too_many_arguments)]
    pub fn insert_lease(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
        username: &str,
        price: i64,
        trial: bool,
        expires_at: DateTime<Utc>,
    ) -> ShopResult<Lease> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO leases (user_id, server_id, protocol, username, price, trial, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                server_id,
                protocol.as_str(),
                username,
                price,
                trial as i64,
                created_at.to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Lease {
            id,
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            protocol,
            username: username.to_string(),
            price,
            trial,
            created_at,
            expires_at,
            reminder_sent: false,
        })
    }

    pub fn get_lease(&self, id: i64) -> ShopResult<Option<Lease>> {
        let leases = self.query_leases("WHERE id = ?1", params![id])?;
        Ok(leases.into_iter().next())
    }

    /// Active paid leases for a user, soonest expiry first.
    pub fn leases_for_user(&self, user_id: &str) -> ShopResult<Vec<Lease>> {
        self.query_leases(
            "WHERE user_id = ?1 AND trial = 0 ORDER BY expires_at ASC",
            params![user_id],
        )
    }

    pub fn extend_lease(&self, id: i64, new_expiry: DateTime<Utc>) -> ShopResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?1, reminder_sent = 0 WHERE id = ?2",
            params![new_expiry.to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShopError::NotFound(format!("lease {id}")));
        }
        Ok(())
    }

    /// Delete a lease only if it is still expired at `now`. The guard makes
    /// the sweeper safe against a renewal landing mid-pass: the extended row
    /// no longer matches and survives. Returns true iff a row was removed.
    pub fn delete_lease_if_expired(&self, id: i64, now: DateTime<Utc>) -> ShopResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM leases WHERE id = ?1 AND expires_at <= ?2",
            params![id, now.to_rfc3339()],
        )?;
        Ok(deleted == 1)
    }

    pub fn mark_reminder_sent(&self, id: i64) -> ShopResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE leases SET reminder_sent = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Paid leases expiring inside the look-ahead window that were not yet
    /// reminded.
    pub fn paid_leases_needing_reminder(
        &self,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> ShopResult<Vec<Lease>> {
        self.query_leases(
            "WHERE trial = 0 AND reminder_sent = 0 AND expires_at > ?1 AND expires_at <= ?2",
            params![now.to_rfc3339(), window_end.to_rfc3339()],
        )
    }

    pub fn expired_paid_leases(&self, now: DateTime<Utc>) -> ShopResult<Vec<Lease>> {
        self.query_leases(
            "WHERE trial = 0 AND expires_at <= ?1 ORDER BY expires_at ASC",
            params![now.to_rfc3339()],
        )
    }

    pub fn expired_trial_leases(&self, now: DateTime<Utc>) -> ShopResult<Vec<Lease>> {
        self.query_leases(
            "WHERE trial = 1 AND expires_at <= ?1 ORDER BY expires_at ASC",
            params![now.to_rfc3339()],
        )
    }

    fn query_leases(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> ShopResult<Vec<Lease>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, user_id, server_id, protocol, username, price, trial, created_at, expires_at, reminder_sent
             FROM leases {where_clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut leases = Vec::new();
        for row in rows {
            let (id, user_id, server_id, protocol, username, price, trial, created_at, expires_at, reminder_sent) = row?;
            leases.push(Lease {
                id,
                user_id,
                server_id,
                protocol: parse_enum(&protocol)?,
                username,
                price,
                trial: trial != 0,
                created_at: parse_ts(&created_at)?,
                expires_at: parse_ts(&expires_at)?,
                reminder_sent: reminder_sent != 0,
            });
        }
        Ok(leases)
    }

    // ---- trial claims ----

    pub fn last_trial_claim(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
    ) -> ShopResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let claimed_at: Option<String> = conn
            .query_row(
                "SELECT claimed_at FROM trial_claims
                 WHERE user_id = ?1 AND server_id = ?2 AND protocol = ?3",
                params![user_id, server_id, protocol.as_str()],
                |row| row.get(0),
            )
            .ok();
        match claimed_at {
            Some(ts) => Ok(Some(parse_ts(&ts)?)),
            None => Ok(None),
        }
    }

    /// Recorded unconditionally, even when the claimant's cooldown is
    /// disabled, so re-enabling the cooldown later behaves correctly.
    pub fn record_trial_claim(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
        claimed_at: DateTime<Utc>,
    ) -> ShopResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO trial_claims (user_id, server_id, protocol, claimed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                server_id,
                protocol.as_str(),
                claimed_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ---- servers & prices ----

    pub fn insert_server(&self, record: &ServerRecord) -> ShopResult<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO servers (id, name, endpoint, api_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.name,
                record.endpoint,
                record.api_token,
                record.created_at.to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Err(ShopError::Validation(format!(
                "server id '{}' already exists",
                record.id
            )));
        }
        Ok(())
    }

    pub fn get_server(&self, id: &str) -> ShopResult<Option<ServerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, endpoint, api_token, created_at FROM servers WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (id, name, endpoint, api_token, created_at) = row?;
                Ok(Some(ServerRecord {
                    id,
                    name,
                    endpoint,
                    api_token,
                    created_at: parse_ts(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn list_servers(&self) -> ShopResult<Vec<ServerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, endpoint, api_token, created_at FROM servers ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut servers = Vec::new();
        for row in rows {
            let (id, name, endpoint, api_token, created_at) = row?;
            servers.push(ServerRecord {
                id,
                name,
                endpoint,
                api_token,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(servers)
    }

    pub fn delete_server(&self, id: &str) -> ShopResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM server_prices WHERE server_id = ?1", params![id])?;
        let deleted = conn.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(ShopError::NotFound(format!("server {id}")));
        }
        Ok(())
    }

    pub fn set_price(
        &self,
        server_id: &str,
        protocol: Protocol,
        role: Role,
        price_per_30d: i64,
    ) -> ShopResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO server_prices (server_id, protocol, role, price_per_30d)
             VALUES (?1, ?2, ?3, ?4)",
            params![server_id, protocol.as_str(), role.as_str(), price_per_30d],
        )?;
        Ok(())
    }

    /// 30-day price for (server, protocol, role), falling back to the
    /// standard-role price when no role-specific row exists.
    pub fn price_for(
        &self,
        server_id: &str,
        protocol: Protocol,
        role: Role,
    ) -> ShopResult<Option<i64>> {
        let conn = self.lock()?;
        let lookup = |r: Role| -> Option<i64> {
            conn.query_row(
                "SELECT price_per_30d FROM server_prices
                 WHERE server_id = ?1 AND protocol = ?2 AND role = ?3",
                params![server_id, protocol.as_str(), r.as_str()],
                |row| row.get(0),
            )
            .ok()
        };
        Ok(lookup(role).or_else(|| lookup(Role::Standard)))
    }

    /// Protocols offered on a server (standard-role price present and > 0).
    pub fn protocols_for_server(&self, server_id: &str) -> ShopResult<Vec<(Protocol, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT protocol, price_per_30d FROM server_prices
             WHERE server_id = ?1 AND role = 'standard' AND price_per_30d > 0
             ORDER BY protocol",
        )?;
        let rows = stmt.query_map(params![server_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut protocols = Vec::new();
        for row in rows {
            let (protocol, price) = row?;
            protocols.push((parse_enum::<Protocol>(&protocol)?, price));
        }
        Ok(protocols)
    }

    // ---- ledger internals (used by Ledger under the same lock) ----

    /// Apply a signed balance delta and append the matching ledger entry in a
    /// single transaction. Returns (previous, new) balance. The caller's
    /// sufficiency rule is enforced here, inside the lock: a delta that would
    /// drive the balance negative fails without side effect.
    pub fn apply_ledger_delta(
        &self,
        user_id: &str,
        amount: i64,
        reason: LedgerReason,
        correlation_id: Option<&str>,
    ) -> ShopResult<(i64, i64)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let balances = delta_in_tx(&tx, user_id, amount, reason, correlation_id)?;
        tx.commit()?;
        Ok(balances)
    }

    /// Overwrite the balance with an explicit target, recorded as one delta
    /// entry of (target − current). The current balance is read inside the
    /// same transaction that applies the delta, so a concurrent credit or
    /// debit cannot slip between the read and the write.
    pub fn set_balance(&self, user_id: &str, target: i64) -> ShopResult<(i64, i64)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let previous = balance_in_tx(&tx, user_id)?;
        let balances = delta_in_tx(
            &tx,
            user_id,
            target - previous,
            LedgerReason::AdminSet,
            None,
        )?;
        tx.commit()?;
        Ok(balances)
    }

    /// Debit the price and insert the lease row in one transaction. If the
    /// username collides with an existing lease the whole transaction rolls
    /// back, so a failed insert can never leave the debit behind.
    #[allow(clippy::too_many_arguments)]
    pub fn record_paid_lease(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
        username: &str,
        price: i64,
        expires_at: DateTime<Utc>,
    ) -> ShopResult<Lease> {
        let created_at = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        delta_in_tx(&tx, user_id, -price, LedgerReason::Purchase, Some(username))?;
        tx.execute(
            "INSERT INTO leases (user_id, server_id, protocol, username, price, trial, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                user_id,
                server_id,
                protocol.as_str(),
                username,
                price,
                created_at.to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ShopError::Validation(format!("username '{username}' is already taken"))
            }
            other => ShopError::Storage(other),
        })?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Lease {
            id,
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            protocol,
            username: username.to_string(),
            price,
            trial: false,
            created_at,
            expires_at,
            reminder_sent: false,
        })
    }

    /// Debit the renewal price and push the expiry forward in one
    /// transaction. If the lease vanished (swept between the caller's read
    /// and this call) the transaction rolls back and no money moves.
    pub fn record_renewal(
        &self,
        lease_id: i64,
        user_id: &str,
        username: &str,
        price: i64,
        new_expiry: DateTime<Utc>,
    ) -> ShopResult<(i64, i64)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let balances = delta_in_tx(&tx, user_id, -price, LedgerReason::Renewal, Some(username))?;
        let changed = tx.execute(
            "UPDATE leases SET expires_at = ?1, reminder_sent = 0 WHERE id = ?2",
            params![new_expiry.to_rfc3339(), lease_id],
        )?;
        if changed == 0 {
            return Err(ShopError::NotFound(format!("lease {lease_id}")));
        }
        tx.commit()?;
        Ok(balances)
    }

    pub fn lease_username_taken(&self, username: &str) -> ShopResult<bool> {
        let conn = self.lock()?;
        let taken: i64 = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM leases WHERE username = ?1)",
            params![username],
            |row| row.get(0),
        )?;
        Ok(taken != 0)
    }

    pub fn ledger_entries(&self, user_id: &str) -> ShopResult<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, reason, correlation_id, balance_after, created_at
             FROM ledger_entries WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, user_id, amount, reason, correlation_id, balance_after, created_at) = row?;
            entries.push(LedgerEntry {
                id,
                user_id,
                amount,
                reason: parse_enum(&reason)?,
                correlation_id,
                balance_after,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(entries)
    }
}

fn balance_in_tx(tx: &rusqlite::Transaction<'_>, user_id: &str) -> ShopResult<i64> {
    tx.query_row(
        "SELECT balance FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ShopError::NotFound(format!("user {user_id}")),
        other => ShopError::Storage(other),
    })
}

fn delta_in_tx(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    amount: i64,
    reason: LedgerReason,
    correlation_id: Option<&str>,
) -> ShopResult<(i64, i64)> {
    let previous = balance_in_tx(tx, user_id)?;

    let new_balance = previous + amount;
    if new_balance < 0 {
        return Err(ShopError::InsufficientBalance {
            required: -amount,
            available: previous,
        });
    }

    tx.execute(
        "UPDATE users SET balance = ?1 WHERE id = ?2",
        params![new_balance, user_id],
    )?;
    tx.execute(
        "INSERT INTO ledger_entries (user_id, amount, reason, correlation_id, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            amount,
            reason.as_str(),
            correlation_id,
            new_balance,
            Utc::now().to_rfc3339()
        ],
    )?;

    Ok((previous, new_balance))
}

fn parse_ts(s: &str) -> ShopResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ShopError::Internal(format!("bad timestamp '{s}': {e}")))
}

fn parse_enum<T>(s: &str) -> ShopResult<T>
where
    T: FromStr<Err = String>,
{
    s.parse().map_err(ShopError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let (_dir, store) = store();
        assert!(store.ensure_user("1", "alice", Role::Standard).unwrap());
        assert!(!store.ensure_user("1", "alice", Role::Standard).unwrap());
        let user = store.get_user("1").unwrap().unwrap();
        assert_eq!(user.balance, 0);
        assert_eq!(user.role, Role::Standard);
    }

    #[test]
    fn invoice_transition_fires_once() {
        let (_dir, store) = store();
        store.ensure_user("1", "alice", Role::Standard).unwrap();
        store
            .insert_invoice("inv-1", "1", 20_000, PayChannel::Gateway)
            .unwrap();

        assert!(store
            .try_transition_invoice("inv-1", InvoiceStatus::Paid)
            .unwrap());
        assert!(!store
            .try_transition_invoice("inv-1", InvoiceStatus::Paid)
            .unwrap());
        assert!(!store
            .try_transition_invoice("inv-1", InvoiceStatus::Expired)
            .unwrap());

        let invoice = store.get_invoice("inv-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[test]
    fn ledger_delta_rejects_overdraft() {
        let (_dir, store) = store();
        store.ensure_user("1", "alice", Role::Standard).unwrap();
        store
            .apply_ledger_delta("1", 5_000, LedgerReason::AdminAdd, None)
            .unwrap();

        let err = store
            .apply_ledger_delta("1", -6_000, LedgerReason::Purchase, None)
            .unwrap_err();
        assert!(matches!(err, ShopError::InsufficientBalance { .. }));

        // balance and history untouched by the failed debit
        let user = store.get_user("1").unwrap().unwrap();
        assert_eq!(user.balance, 5_000);
        assert_eq!(store.ledger_entries("1").unwrap().len(), 1);
    }

    #[test]
    fn price_lookup_falls_back_to_standard() {
        let (_dir, store) = store();
        let record = ServerRecord {
            id: "sg-1".into(),
            name: "SG 1".into(),
            endpoint: "https://sg1.example.com".into(),
            api_token: "tok".into(),
            created_at: Utc::now(),
        };
        store.insert_server(&record).unwrap();
        store
            .set_price("sg-1", Protocol::Vmess, Role::Standard, 15_000)
            .unwrap();
        store
            .set_price("sg-1", Protocol::Vmess, Role::Reseller, 12_000)
            .unwrap();

        assert_eq!(
            store.price_for("sg-1", Protocol::Vmess, Role::Reseller).unwrap(),
            Some(12_000)
        );
        // admin has no dedicated row, falls back to standard
        assert_eq!(
            store.price_for("sg-1", Protocol::Vmess, Role::Admin).unwrap(),
            Some(15_000)
        );
        assert_eq!(store.price_for("sg-1", Protocol::Ssh, Role::Standard).unwrap(), None);
    }

    #[test]
    fn expiry_guarded_delete_spares_extended_lease() {
        let (_dir, store) = store();
        store.ensure_user("1", "alice", Role::Standard).unwrap();
        let now = Utc::now();
        let lease = store
            .insert_lease(
                "1",
                "sg-1",
                Protocol::Vmess,
                "alice01",
                15_000,
                false,
                now - chrono::Duration::hours(1),
            )
            .unwrap();

        // extension lands after the lease was read as expired
        store
            .extend_lease(lease.id, now + chrono::Duration::days(30))
            .unwrap();

        assert!(!store.delete_lease_if_expired(lease.id, now).unwrap());
        assert!(store.get_lease(lease.id).unwrap().is_some());

        // once genuinely past expiry again, the delete goes through
        assert!(store
            .delete_lease_if_expired(lease.id, now + chrono::Duration::days(31))
            .unwrap());
        assert!(store.get_lease(lease.id).unwrap().is_none());
    }

    #[test]
    fn duplicate_lease_username_rolls_back_the_debit() {
        let (_dir, store) = store();
        store.ensure_user("1", "alice", Role::Standard).unwrap();
        store
            .apply_ledger_delta("1", 50_000, LedgerReason::AdminAdd, None)
            .unwrap();
        let expiry = Utc::now() + chrono::Duration::days(30);

        store
            .record_paid_lease("1", "sg-1", Protocol::Vmess, "alice01", 15_000, expiry)
            .unwrap();
        let err = store
            .record_paid_lease("1", "sg-1", Protocol::Vmess, "alice01", 15_000, expiry)
            .unwrap_err();
        assert!(err.is_validation());

        // only the first purchase charged anything
        let user = store.get_user("1").unwrap().unwrap();
        assert_eq!(user.balance, 35_000);
        assert_eq!(store.ledger_entries("1").unwrap().len(), 2);
    }

    #[test]
    fn renewal_of_missing_lease_moves_no_money() {
        let (_dir, store) = store();
        store.ensure_user("1", "alice", Role::Standard).unwrap();
        store
            .apply_ledger_delta("1", 50_000, LedgerReason::AdminAdd, None)
            .unwrap();

        let err = store
            .record_renewal(99, "1", "ghost", 15_000, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ShopError::NotFound(_)));
        assert_eq!(store.get_user("1").unwrap().unwrap().balance, 50_000);
    }

    #[test]
    fn duplicate_server_id_is_rejected() {
        let (_dir, store) = store();
        let record = ServerRecord {
            id: "sg-1".into(),
            name: "SG 1".into(),
            endpoint: "https://sg1.example.com".into(),
            api_token: "tok".into(),
            created_at: Utc::now(),
        };
        store.insert_server(&record).unwrap();
        let err = store.insert_server(&record).unwrap_err();
        assert!(err.is_validation());
    }
}
