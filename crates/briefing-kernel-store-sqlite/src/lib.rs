use std::path::Path;

use anyhow::{anyhow, Context, Result};
use briefing_kernel_core::{
    ActiveContactSnapshot, Contact, ContactId, ContactUpdate, ContextRecord, ErrorClass, ErrorId,
    ErrorRecord, Handoff, HandoffId, HandoffStatus, Interaction, InteractionDirection,
    InteractionId, NewContact, NewErrorRecord, ResolveScope, Urgency, UsageEntry,
};
use rusqlite::{params, Connection, Row, Transaction};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  contact_id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  company TEXT,
  role TEXT,
  status TEXT NOT NULL,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interactions (
  interaction_id TEXT PRIMARY KEY,
  contact_id TEXT NOT NULL,
  channel TEXT NOT NULL,
  direction TEXT NOT NULL CHECK (direction IN ('inbound','outbound','internal')),
  raw_content TEXT,
  summary TEXT,
  key_points_json TEXT NOT NULL,
  sentiment TEXT,
  intent TEXT,
  occurred_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (contact_id) REFERENCES contacts(contact_id)
);

CREATE TABLE IF NOT EXISTS context_records (
  contact_id TEXT PRIMARY KEY,
  summary TEXT NOT NULL,
  key_facts_json TEXT NOT NULL,
  current_status TEXT NOT NULL,
  recommended_tone TEXT NOT NULL,
  risk_score REAL NOT NULL,
  opportunity_score REAL NOT NULL,
  risk_factors_json TEXT NOT NULL,
  opportunity_factors_json TEXT NOT NULL,
  interaction_count INTEGER NOT NULL CHECK (interaction_count >= 0),
  generated_at TEXT NOT NULL,
  expires_at TEXT,
  token_count INTEGER NOT NULL CHECK (token_count >= 0),
  FOREIGN KEY (contact_id) REFERENCES contacts(contact_id)
);

CREATE TABLE IF NOT EXISTS error_log (
  error_id TEXT PRIMARY KEY,
  error_type TEXT NOT NULL CHECK (error_type IN ('operational','external_dependency','budget_exceeded','quality_issue','integration_gap')),
  service TEXT NOT NULL,
  operation TEXT NOT NULL,
  message TEXT NOT NULL,
  context_json TEXT,
  pattern_id TEXT,
  resolution TEXT,
  resolved_at TEXT,
  auto_fixed INTEGER NOT NULL DEFAULT 0 CHECK (auto_fixed IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS handoffs (
  handoff_id TEXT PRIMARY KEY,
  contact_id TEXT NOT NULL,
  from_agent TEXT NOT NULL,
  to_agent TEXT NOT NULL,
  reason TEXT NOT NULL,
  urgency TEXT NOT NULL CHECK (urgency IN ('low','normal','high','critical')),
  status TEXT NOT NULL CHECK (status IN ('pending','accepted','completed','cancelled')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (contact_id) REFERENCES contacts(contact_id)
);

CREATE TABLE IF NOT EXISTS usage_ledger (
  entry_id TEXT PRIMARY KEY,
  agent TEXT NOT NULL,
  model TEXT NOT NULL,
  operation TEXT NOT NULL,
  input_tokens INTEGER NOT NULL CHECK (input_tokens >= 0),
  output_tokens INTEGER NOT NULL CHECK (output_tokens >= 0),
  cost_usd REAL NOT NULL,
  contact_id TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_contact_occurred ON interactions(contact_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_interactions_occurred ON interactions(occurred_at);
CREATE INDEX IF NOT EXISTS idx_context_records_generated ON context_records(generated_at);
CREATE INDEX IF NOT EXISTS idx_error_log_created ON error_log(created_at);
CREATE INDEX IF NOT EXISTS idx_error_log_triple ON error_log(error_type, service, operation);
CREATE INDEX IF NOT EXISTS idx_handoffs_status_created ON handoffs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_usage_ledger_agent_created ON usage_ledger(agent, created_at);
";

const CONTACT_COLUMNS: &str =
    "contact_id, email, name, company, role, status, notes, created_at, updated_at";

const INTERACTION_COLUMNS: &str = "interaction_id, contact_id, channel, direction, raw_content, \
     summary, key_points_json, sentiment, intent, occurred_at, created_at";

const CONTEXT_COLUMNS: &str = "contact_id, summary, key_facts_json, current_status, \
     recommended_tone, risk_score, opportunity_score, risk_factors_json, opportunity_factors_json, \
     interaction_count, generated_at, expires_at, token_count";

const ERROR_COLUMNS: &str = "error_id, error_type, service, operation, message, context_json, \
     pattern_id, resolution, resolved_at, auto_fixed, created_at";

const HANDOFF_COLUMNS: &str =
    "handoff_id, contact_id, from_agent, to_agent, reason, urgency, status, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed briefing store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Insert a contact, or refresh the non-identity fields of the contact
    /// that already owns `contact.email`.
    ///
    /// # Errors
    /// Returns an error when validation fails or the write fails.
    pub fn upsert_contact_by_email(
        &mut self,
        contact: &NewContact,
        now: OffsetDateTime,
    ) -> Result<Contact> {
        contact.validate()?;
        let email = contact.email.trim().to_ascii_lowercase();
        let now_raw = timestamp(now)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO contacts(contact_id, email, name, company, role, status, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 'active'), ?7, ?8, ?8)
             ON CONFLICT(email) DO UPDATE SET
               name = excluded.name,
               company = COALESCE(?4, contacts.company),
               role = COALESCE(?5, contacts.role),
               status = COALESCE(?6, contacts.status),
               notes = COALESCE(?7, contacts.notes),
               updated_at = excluded.updated_at",
            params![
                ContactId::new().to_string(),
                email,
                contact.name.trim(),
                contact.company,
                contact.role,
                contact.status,
                contact.notes,
                now_raw,
            ],
        )
        .context("failed to upsert contact")?;

        let stored = {
            let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1");
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params![email])?;
            let row = rows.next()?.ok_or_else(|| anyhow!("upserted contact {email} vanished"))?;
            contact_from_row(row)?
        };
        tx.commit().context("failed to commit contact upsert")?;
        Ok(stored)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_contact(&self, contact_id: ContactId) -> Result<Option<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE contact_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![contact_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(contact_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Apply a partial update; `None` fields keep their stored value.
    /// Returns `None` when the contact does not exist.
    ///
    /// # Errors
    /// Returns an error when the write or the reload fails.
    pub fn update_contact(
        &mut self,
        contact_id: ContactId,
        update: &ContactUpdate,
        now: OffsetDateTime,
    ) -> Result<Option<Contact>> {
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET
                   name = COALESCE(?2, name),
                   company = COALESCE(?3, company),
                   role = COALESCE(?4, role),
                   status = COALESCE(?5, status),
                   notes = COALESCE(?6, notes),
                   updated_at = ?7
                 WHERE contact_id = ?1",
                params![
                    contact_id.to_string(),
                    update.name,
                    update.company,
                    update.role,
                    update.status,
                    update.notes,
                    timestamp(now)?,
                ],
            )
            .context("failed to update contact")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_contact(contact_id)
    }

    /// Append one interaction and, when a summarizer call produced it, the
    /// matching ledger entry in the same transaction.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails.
    pub fn save_interaction(
        &mut self,
        interaction: &Interaction,
        usage: Option<&UsageEntry>,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO interactions(
                interaction_id, contact_id, channel, direction, raw_content,
                summary, key_points_json, sentiment, intent, occurred_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                interaction.interaction_id.to_string(),
                interaction.contact_id.to_string(),
                interaction.channel,
                interaction.direction.as_str(),
                interaction.raw_content,
                interaction.summary,
                serde_json::to_string(&interaction.key_points)
                    .context("failed to serialize key points")?,
                interaction.sentiment,
                interaction.intent,
                timestamp(interaction.occurred_at)?,
                timestamp(interaction.created_at)?,
            ],
        )
        .context("failed to insert interaction")?;
        if let Some(entry) = usage {
            insert_usage(&tx, entry)?;
        }
        tx.commit().context("failed to commit interaction transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn interaction_count(&self, contact_id: ContactId) -> Result<u32> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM interactions WHERE contact_id = ?1",
                params![contact_id.to_string()],
                |row| row.get::<_, u32>(0),
            )
            .context("failed to count interactions")?;
        Ok(count)
    }

    /// Most recent interactions, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recent_interactions(
        &self,
        contact_id: ContactId,
        limit: usize,
    ) -> Result<Vec<Interaction>> {
        let sql = format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions
             WHERE contact_id = ?1
             ORDER BY occurred_at DESC, rowid DESC
             LIMIT ?2"
        );
        let limit = i64::try_from(limit).context("interaction limit out of range")?;
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![contact_id.to_string(), limit])?;
        let mut interactions = Vec::new();
        while let Some(row) = rows.next()? {
            interactions.push(interaction_from_row(row)?);
        }
        Ok(interactions)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn last_touch_at(&self, contact_id: ContactId) -> Result<Option<OffsetDateTime>> {
        let raw = self
            .conn
            .query_row(
                "SELECT MAX(occurred_at) FROM interactions WHERE contact_id = ?1",
                params![contact_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .context("failed to read last touch")?;
        raw.as_deref().map(parse_timestamp).transpose()
    }

    /// Every contact with an interaction at or after `since`, with its last
    /// touch and the generation time of its cached briefing, if any.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn active_contact_snapshots(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<ActiveContactSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.contact_id, MAX(i.occurred_at), MAX(c.generated_at)
             FROM interactions i
             LEFT JOIN context_records c ON c.contact_id = i.contact_id
             GROUP BY i.contact_id
             HAVING MAX(i.occurred_at) >= ?1
             ORDER BY i.contact_id ASC",
        )?;
        let mut rows = stmt.query(params![timestamp(since)?])?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            let generated_raw: Option<String> = row.get(2)?;
            snapshots.push(ActiveContactSnapshot {
                contact_id: ContactId::parse(&row.get::<_, String>(0)?)?,
                last_touch_at: parse_timestamp(&row.get::<_, String>(1)?)?,
                context_generated_at: generated_raw.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(snapshots)
    }

    /// Replace the cached briefing for one contact and record the ledger
    /// entry for the call that produced it. Both land or neither does.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails.
    pub fn save_regeneration(&mut self, record: &ContextRecord, usage: &UsageEntry) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO context_records(
                contact_id, summary, key_facts_json, current_status, recommended_tone,
                risk_score, opportunity_score, risk_factors_json, opportunity_factors_json,
                interaction_count, generated_at, expires_at, token_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(contact_id) DO UPDATE SET
                summary = excluded.summary,
                key_facts_json = excluded.key_facts_json,
                current_status = excluded.current_status,
                recommended_tone = excluded.recommended_tone,
                risk_score = excluded.risk_score,
                opportunity_score = excluded.opportunity_score,
                risk_factors_json = excluded.risk_factors_json,
                opportunity_factors_json = excluded.opportunity_factors_json,
                interaction_count = excluded.interaction_count,
                generated_at = excluded.generated_at,
                expires_at = excluded.expires_at,
                token_count = excluded.token_count",
            params![
                record.contact_id.to_string(),
                record.summary,
                serde_json::to_string(&record.key_facts).context("failed to serialize key facts")?,
                record.current_status,
                record.recommended_tone,
                f64::from(record.risk_score),
                f64::from(record.opportunity_score),
                serde_json::to_string(&record.risk_factors)
                    .context("failed to serialize risk factors")?,
                serde_json::to_string(&record.opportunity_factors)
                    .context("failed to serialize opportunity factors")?,
                record.interaction_count,
                timestamp(record.generated_at)?,
                record.expires_at.map(timestamp).transpose()?,
                record.token_count,
            ],
        )
        .context("failed to upsert context record")?;
        insert_usage(&tx, usage)?;
        tx.commit().context("failed to commit regeneration transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_context_record(&self, contact_id: ContactId) -> Result<Option<ContextRecord>> {
        let sql = format!("SELECT {CONTEXT_COLUMNS} FROM context_records WHERE contact_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![contact_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(context_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_context_records(&self, contact_id: ContactId) -> Result<usize> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM context_records WHERE contact_id = ?1",
                params![contact_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count context records")?;
        usize::try_from(count).context("context record count out of range")
    }

    /// Summaries of the most recently generated briefings, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn recent_context_summaries(&self, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).context("sample limit out of range")?;
        let mut stmt = self.conn.prepare(
            "SELECT summary FROM context_records ORDER BY generated_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Append one Error Record.
    ///
    /// # Errors
    /// Returns an error when validation, serialization or the insert fails.
    pub fn insert_error(&mut self, entry: &NewErrorRecord, now: OffsetDateTime) -> Result<ErrorId> {
        entry.validate()?;
        let error_id = ErrorId::new();
        let context_json = entry
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize error context")?;
        self.conn
            .execute(
                "INSERT INTO error_log(
                    error_id, error_type, service, operation, message, context_json,
                    pattern_id, resolution, resolved_at, auto_fixed, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, 0, ?8)",
                params![
                    error_id.to_string(),
                    entry.error_type.as_str(),
                    entry.service,
                    entry.operation,
                    entry.message,
                    context_json,
                    entry.pattern_id,
                    timestamp(now)?,
                ],
            )
            .context("failed to insert error record")?;
        Ok(error_id)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_error(&self, error_id: ErrorId) -> Result<Option<ErrorRecord>> {
        let sql = format!("SELECT {ERROR_COLUMNS} FROM error_log WHERE error_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![error_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(error_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Every Error Record created at or after `since`, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_errors_since(&self, since: OffsetDateTime) -> Result<Vec<ErrorRecord>> {
        self.query_errors(false, since)
    }

    /// Unresolved Error Records created at or after `since`, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_unresolved_errors_since(&self, since: OffsetDateTime) -> Result<Vec<ErrorRecord>> {
        self.query_errors(true, since)
    }

    fn query_errors(&self, unresolved_only: bool, since: OffsetDateTime) -> Result<Vec<ErrorRecord>> {
        let filter = if unresolved_only { "AND resolved_at IS NULL" } else { "" };
        let sql = format!(
            "SELECT {ERROR_COLUMNS} FROM error_log
             WHERE created_at >= ?1 {filter}
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![timestamp(since)?])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(error_from_row(row)?);
        }
        Ok(records)
    }

    /// Set the resolution fields on every still-unresolved row in `scope`.
    /// Rows that already carry a resolution are never touched, so a repeated
    /// call returns zero.
    ///
    /// # Errors
    /// Returns an error when the resolution text is blank or a write fails.
    pub fn resolve_errors(
        &mut self,
        scope: &ResolveScope,
        resolution: &str,
        auto_fixed: bool,
        now: OffsetDateTime,
    ) -> Result<usize> {
        if resolution.trim().is_empty() {
            return Err(anyhow!("resolution MUST be provided when resolving errors"));
        }
        let resolved_at = timestamp(now)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let resolved = match scope {
            ResolveScope::Pattern { key, since } => tx
                .execute(
                    "UPDATE error_log SET resolution = ?1, resolved_at = ?2, auto_fixed = ?3
                     WHERE resolved_at IS NULL
                       AND error_type = ?4 AND service = ?5 AND operation = ?6
                       AND (?7 IS NULL OR created_at >= ?7)",
                    params![
                        resolution,
                        resolved_at,
                        auto_fixed,
                        key.error_type.as_str(),
                        key.service,
                        key.operation,
                        since.map(timestamp).transpose()?,
                    ],
                )
                .context("failed to resolve errors by pattern")?,
            ResolveScope::PatternTag(tag) => tx
                .execute(
                    "UPDATE error_log SET resolution = ?1, resolved_at = ?2, auto_fixed = ?3
                     WHERE resolved_at IS NULL AND pattern_id = ?4",
                    params![resolution, resolved_at, auto_fixed, tag],
                )
                .context("failed to resolve errors by pattern tag")?,
            ResolveScope::Ids(ids) => {
                let mut total = 0;
                for error_id in ids {
                    total += tx
                        .execute(
                            "UPDATE error_log SET resolution = ?1, resolved_at = ?2, auto_fixed = ?3
                             WHERE resolved_at IS NULL AND error_id = ?4",
                            params![resolution, resolved_at, auto_fixed, error_id.to_string()],
                        )
                        .context("failed to resolve error by id")?;
                }
                total
            }
        };
        tx.commit().context("failed to commit resolution transaction")?;
        Ok(resolved)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_handoff(&mut self, handoff: &Handoff) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO handoffs(
                    handoff_id, contact_id, from_agent, to_agent, reason, urgency, status,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    handoff.handoff_id.to_string(),
                    handoff.contact_id.to_string(),
                    handoff.from_agent,
                    handoff.to_agent,
                    handoff.reason,
                    handoff.urgency.as_str(),
                    handoff.status.as_str(),
                    timestamp(handoff.created_at)?,
                    timestamp(handoff.updated_at)?,
                ],
            )
            .context("failed to insert handoff")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_handoff(&self, handoff_id: HandoffId) -> Result<Option<Handoff>> {
        let sql = format!("SELECT {HANDOFF_COLUMNS} FROM handoffs WHERE handoff_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![handoff_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(handoff_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn latest_handoff(&self, contact_id: ContactId) -> Result<Option<Handoff>> {
        let sql = format!(
            "SELECT {HANDOFF_COLUMNS} FROM handoffs
             WHERE contact_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![contact_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(handoff_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Pending handoffs, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_pending_handoffs(&self) -> Result<Vec<Handoff>> {
        let sql = format!(
            "SELECT {HANDOFF_COLUMNS} FROM handoffs
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut handoffs = Vec::new();
        while let Some(row) = rows.next()? {
            handoffs.push(handoff_from_row(row)?);
        }
        Ok(handoffs)
    }

    /// Returns `None` when the handoff does not exist.
    ///
    /// # Errors
    /// Returns an error when the write or the reload fails.
    pub fn update_handoff_status(
        &mut self,
        handoff_id: HandoffId,
        status: HandoffStatus,
        now: OffsetDateTime,
    ) -> Result<Option<Handoff>> {
        let changed = self
            .conn
            .execute(
                "UPDATE handoffs SET status = ?2, updated_at = ?3 WHERE handoff_id = ?1",
                params![handoff_id.to_string(), status.as_str(), timestamp(now)?],
            )
            .context("failed to update handoff status")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_handoff(handoff_id)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_usage(&mut self, entry: &UsageEntry) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_usage(&tx, entry)?;
        tx.commit().context("failed to commit usage transaction")?;
        Ok(())
    }

    /// Input plus output tokens an agent has spent since `since`.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn tokens_used_since(&self, agent: &str, since: OffsetDateTime) -> Result<u64> {
        let total = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM usage_ledger
                 WHERE agent = ?1 AND created_at >= ?2",
                params![agent, timestamp(since)?],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to sum token usage")?;
        u64::try_from(total).context("token usage out of range")
    }
}

fn insert_usage(tx: &Transaction<'_>, entry: &UsageEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO usage_ledger(
            entry_id, agent, model, operation, input_tokens, output_tokens, cost_usd, contact_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.entry_id.to_string(),
            entry.agent,
            entry.model,
            entry.operation,
            entry.input_tokens,
            entry.output_tokens,
            entry.cost_usd,
            entry.contact_id.map(|id| id.to_string()),
            timestamp(entry.created_at)?,
        ],
    )
    .context("failed to insert usage ledger entry")?;
    Ok(())
}

fn contact_from_row(row: &Row<'_>) -> Result<Contact> {
    Ok(Contact {
        contact_id: ContactId::parse(&row.get::<_, String>(0)?)?,
        email: row.get(1)?,
        name: row.get(2)?,
        company: row.get(3)?,
        role: row.get(4)?,
        status: row.get(5)?,
        notes: row.get(6)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(8)?)?,
    })
}

fn interaction_from_row(row: &Row<'_>) -> Result<Interaction> {
    let direction_raw: String = row.get(3)?;
    let key_points_json: String = row.get(6)?;
    Ok(Interaction {
        interaction_id: InteractionId::parse(&row.get::<_, String>(0)?)?,
        contact_id: ContactId::parse(&row.get::<_, String>(1)?)?,
        channel: row.get(2)?,
        direction: InteractionDirection::parse(&direction_raw)
            .ok_or_else(|| anyhow!("unknown interaction direction: {direction_raw}"))?,
        raw_content: row.get(4)?,
        summary: row.get(5)?,
        key_points: serde_json::from_str(&key_points_json)
            .context("failed to deserialize key points")?,
        sentiment: row.get(7)?,
        intent: row.get(8)?,
        occurred_at: parse_timestamp(&row.get::<_, String>(9)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn context_from_row(row: &Row<'_>) -> Result<ContextRecord> {
    let expires_raw: Option<String> = row.get(11)?;
    Ok(ContextRecord {
        contact_id: ContactId::parse(&row.get::<_, String>(0)?)?,
        summary: row.get(1)?,
        key_facts: decode_list(&row.get::<_, String>(2)?, "key facts")?,
        current_status: row.get(3)?,
        recommended_tone: row.get(4)?,
        risk_score: row.get::<_, f64>(5)? as f32,
        opportunity_score: row.get::<_, f64>(6)? as f32,
        risk_factors: decode_list(&row.get::<_, String>(7)?, "risk factors")?,
        opportunity_factors: decode_list(&row.get::<_, String>(8)?, "opportunity factors")?,
        interaction_count: row.get(9)?,
        generated_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        expires_at: expires_raw.as_deref().map(parse_timestamp).transpose()?,
        token_count: row.get(12)?,
    })
}

fn error_from_row(row: &Row<'_>) -> Result<ErrorRecord> {
    let error_type_raw: String = row.get(1)?;
    let context_json: Option<String> = row.get(5)?;
    let resolved_raw: Option<String> = row.get(8)?;
    Ok(ErrorRecord {
        error_id: ErrorId::parse(&row.get::<_, String>(0)?)?,
        error_type: ErrorClass::parse(&error_type_raw)
            .ok_or_else(|| anyhow!("unknown error_type: {error_type_raw}"))?,
        service: row.get(2)?,
        operation: row.get(3)?,
        message: row.get(4)?,
        context: context_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("failed to deserialize error context")?,
        pattern_id: row.get(6)?,
        resolution: row.get(7)?,
        resolved_at: resolved_raw.as_deref().map(parse_timestamp).transpose()?,
        auto_fixed: row.get(9)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
    })
}

fn handoff_from_row(row: &Row<'_>) -> Result<Handoff> {
    let urgency_raw: String = row.get(5)?;
    let status_raw: String = row.get(6)?;
    Ok(Handoff {
        handoff_id: HandoffId::parse(&row.get::<_, String>(0)?)?,
        contact_id: ContactId::parse(&row.get::<_, String>(1)?)?,
        from_agent: row.get(2)?,
        to_agent: row.get(3)?,
        reason: row.get(4)?,
        urgency: Urgency::parse(&urgency_raw)
            .ok_or_else(|| anyhow!("unknown urgency: {urgency_raw}"))?,
        status: HandoffStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown handoff status: {status_raw}"))?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(8)?)?,
    })
}

fn decode_list(raw: &str, label: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize {label}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Fixed-width UTC form so that text comparison in SQL orders chronologically.
fn timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored timestamp: {value}"))
}
