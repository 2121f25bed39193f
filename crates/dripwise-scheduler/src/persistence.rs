//! SQLite-backed persistence for automations, schedule state, the
//! missed-appointment fired set, pass leases, and nurture campaigns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with millisecond
//! precision, so SQL string comparison matches time order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dripwise_core::error::{DripError, Result};
use dripwise_core::types::Contact;
use rusqlite::{Connection, OptionalExtension, params};

use crate::automation::{Automation, AutomationRecord, RawNode, ScheduleState};
use crate::campaign::{
    CampaignStatus, EnrollmentStatus, NurtureCampaign, NurtureEnrollment, NurtureStep, PauseReason,
    StepKind,
};

/// Scheduler database: one file shared by every tenant, partitioned by owner id.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

/// Canonical storage form of a timestamp.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(parse_ts)
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> DripError {
    move |e| DripError::storage(format!("{context}: {e}"))
}

const CAMPAIGN_SELECT: &str = "SELECT id, owner_id, name, status, paused_reason, stripe_subscription_id, sms_footer, email_footer FROM nurture_campaigns";

const ENROLLMENT_SELECT: &str = "SELECT id, owner_id, campaign_id, contact_id, step_index, next_send_at, status, last_sent_at, last_error FROM nurture_enrollments";

fn row_to_campaign(row: &rusqlite::Row) -> rusqlite::Result<NurtureCampaign> {
    let status: String = row.get(3)?;
    let paused_reason: Option<String> = row.get(4)?;
    Ok(NurtureCampaign {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        status: CampaignStatus::parse(&status),
        paused_reason: paused_reason.as_deref().and_then(PauseReason::parse),
        stripe_subscription_id: row.get(5)?,
        sms_footer: row.get(6)?,
        email_footer: row.get(7)?,
    })
}

fn row_to_enrollment(row: &rusqlite::Row) -> rusqlite::Result<NurtureEnrollment> {
    let status: String = row.get(6)?;
    Ok(NurtureEnrollment {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        campaign_id: row.get(2)?,
        contact_id: row.get(3)?,
        step_index: row.get(4)?,
        next_send_at: parse_opt_ts(row.get(5)?),
        status: EnrollmentStatus::parse(&status),
        last_sent_at: parse_opt_ts(row.get(7)?),
        last_error: row.get(8)?,
    })
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Fresh private database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DripError::storage(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS owners (
                id TEXT PRIMARY KEY,
                business_name TEXT NOT NULL DEFAULT '',
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                email TEXT,
                phone TEXT
            );

            -- Automation graphs; nodes kept as the JSON document the editor saved
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                nodes_json TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_automations_owner ON automations(owner_id);

            -- One row per scheduled trigger node: state_key = '<automationId>:<nodeId>'
            CREATE TABLE IF NOT EXISTS trigger_schedule_state (
                owner_id TEXT NOT NULL,
                state_key TEXT NOT NULL,
                last_fired_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, state_key)
            );

            -- Booking ids already dispatched as missed_appointment (insertion order = recency)
            CREATE TABLE IF NOT EXISTS missed_appointment_fired (
                owner_id TEXT NOT NULL,
                booking_id TEXT NOT NULL,
                fired_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, booking_id)
            );

            -- Per-tenant exclusive lease for the duration of a batch pass
            CREATE TABLE IF NOT EXISTS pass_leases (
                scope TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (scope, owner_id)
            );

            CREATE TABLE IF NOT EXISTS nurture_campaigns (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                paused_reason TEXT,
                stripe_subscription_id TEXT,
                sms_footer TEXT NOT NULL DEFAULT '',
                email_footer TEXT NOT NULL DEFAULT '',
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS nurture_steps (
                campaign_id TEXT NOT NULL,
                ord INTEGER NOT NULL,
                kind TEXT NOT NULL,
                delay_minutes INTEGER NOT NULL DEFAULT 0,
                subject TEXT,
                body TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (campaign_id, ord)
            );

            CREATE TABLE IF NOT EXISTS nurture_enrollments (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                step_index INTEGER NOT NULL DEFAULT 0,
                next_send_at TEXT,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                last_sent_at TEXT,
                last_error TEXT,
                updated_at TEXT DEFAULT (datetime('now')),
                UNIQUE (campaign_id, contact_id)
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due
                ON nurture_enrollments(status, next_send_at, id);
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Owners & Contacts ──────────────────────────────────

    pub fn upsert_owner(&self, id: &str, business_name: &str) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO owners (id, business_name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET business_name = excluded.business_name",
                params![id, business_name],
            )
            .map_err(db_err("Save owner"))?;
        Ok(())
    }

    pub fn owner_business_name(&self, id: &str) -> Result<Option<String>> {
        self.lock()?
            .query_row(
                "SELECT business_name FROM owners WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Get owner"))
    }

    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO contacts (id, owner_id, name, email, phone)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![contact.id, contact.owner_id, contact.name, contact.email, contact.phone],
            )
            .map_err(db_err("Save contact"))?;
        Ok(())
    }

    pub fn get_contact(&self, owner_id: &str, id: &str) -> Result<Option<Contact>> {
        self.lock()?
            .query_row(
                "SELECT id, owner_id, name, email, phone FROM contacts WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, id],
                |row| {
                    Ok(Contact {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        name: row.get(2)?,
                        email: row.get(3)?,
                        phone: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(db_err("Get contact"))
    }

    // ─── Automations ──────────────────────────────────────

    /// Save (replace) an automation document.
    pub fn save_automation(&self, record: &AutomationRecord) -> Result<()> {
        let nodes_json = serde_json::to_string(&record.nodes)?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO automations (id, owner_id, name, enabled, nodes_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
                params![record.id, record.owner_id, record.name, record.enabled as i32, nodes_json],
            )
            .map_err(db_err("Save automation"))?;
        Ok(())
    }

    /// Load a tenant's automations, normalized. Documents that fail to parse
    /// are skipped with a warning so one bad graph cannot hide the others.
    pub fn load_automations(&self, owner_id: &str) -> Result<Vec<Automation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, owner_id, name, enabled, nodes_json FROM automations
                 WHERE owner_id = ?1 ORDER BY id",
            )
            .map_err(db_err("Load automations"))?;
        let rows = stmt
            .query_map([owner_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)? != 0,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err("Load automations"))?;

        let mut automations = Vec::new();
        for row in rows {
            let (id, owner_id, name, enabled, nodes_json) = row.map_err(db_err("Load automations"))?;
            let nodes: Vec<RawNode> = match serde_json::from_str(&nodes_json) {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::warn!("⚠️ Automation {id} has unreadable nodes: {e}");
                    continue;
                }
            };
            automations.push(Automation::from_record(&AutomationRecord {
                id,
                owner_id,
                name,
                enabled,
                nodes,
            }));
        }
        Ok(automations)
    }

    /// Owners that have at least one automation, in stable id order.
    pub fn list_automation_owners(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT owner_id FROM automations ORDER BY owner_id LIMIT ?1")
            .map_err(db_err("List owners"))?;
        let rows = stmt
            .query_map([limit as i64], |row| row.get(0))
            .map_err(db_err("List owners"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err("List owners"))
    }

    /// Delete an automation and its schedule state.
    pub fn delete_automation(&self, owner_id: &str, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Delete automation"))?;
        tx.execute(
            "DELETE FROM automations WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, id],
        )
        .map_err(db_err("Delete automation"))?;
        tx.execute(
            "DELETE FROM trigger_schedule_state WHERE owner_id = ?1 AND substr(state_key, 1, ?3) = ?2",
            params![owner_id, format!("{id}:"), id.chars().count() as i64 + 1],
        )
        .map_err(db_err("Delete automation"))?;
        tx.commit().map_err(db_err("Delete automation"))?;
        Ok(())
    }

    // ─── Schedule State ──────────────────────────────────────

    pub fn load_schedule_state(&self, owner_id: &str) -> Result<ScheduleState> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state_key, last_fired_at FROM trigger_schedule_state WHERE owner_id = ?1")
            .map_err(db_err("Load schedule state"))?;
        let rows = stmt
            .query_map([owner_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err("Load schedule state"))?;

        let mut entries = HashMap::new();
        for row in rows {
            let (key, fired) = row.map_err(db_err("Load schedule state"))?;
            match parse_ts(&fired) {
                Some(at) => {
                    entries.insert(key, at);
                }
                None => tracing::warn!("⚠️ Bad last_fired_at '{fired}' for {owner_id}/{key}"),
            }
        }
        Ok(ScheduleState::from_entries(entries))
    }

    /// Persist every entry stamped on the working copy, in one transaction.
    /// Returns the number of entries written.
    pub fn save_schedule_state(&self, owner_id: &str, state: &ScheduleState) -> Result<usize> {
        let changes = state.changes();
        if changes.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Save schedule state"))?;
        for (key, at) in &changes {
            tx.execute(
                "INSERT INTO trigger_schedule_state (owner_id, state_key, last_fired_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(owner_id, state_key) DO UPDATE SET last_fired_at = excluded.last_fired_at",
                params![owner_id, key, ts(*at)],
            )
            .map_err(db_err("Save schedule state"))?;
        }
        tx.commit().map_err(db_err("Save schedule state"))?;
        Ok(changes.len())
    }

    // ─── Pass Leases ──────────────────────────────────────

    /// Take the `(scope, owner)` lease unless another live holder has it.
    pub fn try_acquire_lease(
        &self,
        scope: &str,
        owner_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "INSERT INTO pass_leases (scope, owner_id, holder, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(scope, owner_id) DO UPDATE
                    SET holder = excluded.holder, expires_at = excluded.expires_at
                    WHERE pass_leases.expires_at <= ?5 OR pass_leases.holder = excluded.holder",
                params![scope, owner_id, holder, ts(now + ttl), ts(now)],
            )
            .map_err(db_err("Acquire lease"))?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, scope: &str, owner_id: &str, holder: &str) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM pass_leases WHERE scope = ?1 AND owner_id = ?2 AND holder = ?3",
                params![scope, owner_id, holder],
            )
            .map_err(db_err("Release lease"))?;
        Ok(())
    }

    // ─── Missed-Appointment Fired Set ──────────────────────────

    pub fn is_booking_fired(&self, owner_id: &str, booking_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT 1 FROM missed_appointment_fired WHERE owner_id = ?1 AND booking_id = ?2",
                params![owner_id, booking_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Check fired set"))?;
        Ok(found.is_some())
    }

    /// Append a booking id and trim the tenant's set to the `capacity` most recent.
    pub fn record_fired_booking(
        &self,
        owner_id: &str,
        booking_id: &str,
        now: DateTime<Utc>,
        capacity: usize,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Record fired booking"))?;
        tx.execute(
            "INSERT OR IGNORE INTO missed_appointment_fired (owner_id, booking_id, fired_at)
             VALUES (?1, ?2, ?3)",
            params![owner_id, booking_id, ts(now)],
        )
        .map_err(db_err("Record fired booking"))?;
        tx.execute(
            "DELETE FROM missed_appointment_fired WHERE owner_id = ?1 AND rowid NOT IN (
                SELECT rowid FROM missed_appointment_fired WHERE owner_id = ?1
                ORDER BY rowid DESC LIMIT ?2)",
            params![owner_id, capacity as i64],
        )
        .map_err(db_err("Trim fired set"))?;
        tx.commit().map_err(db_err("Record fired booking"))?;
        Ok(())
    }

    pub fn fired_booking_count(&self, owner_id: &str) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM missed_appointment_fired WHERE owner_id = ?1",
                [owner_id],
                |row| row.get(0),
            )
            .map_err(db_err("Count fired set"))?;
        Ok(count as usize)
    }

    // ─── Nurture Campaigns ──────────────────────────────────────

    pub fn save_campaign(&self, campaign: &NurtureCampaign) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO nurture_campaigns
                 (id, owner_id, name, status, paused_reason, stripe_subscription_id, sms_footer, email_footer, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
                params![
                    campaign.id,
                    campaign.owner_id,
                    campaign.name,
                    campaign.status.as_str(),
                    campaign.paused_reason.map(|r| r.as_str()),
                    campaign.stripe_subscription_id,
                    campaign.sms_footer,
                    campaign.email_footer,
                ],
            )
            .map_err(db_err("Save campaign"))?;
        Ok(())
    }

    pub fn get_campaign(&self, id: &str) -> Result<Option<NurtureCampaign>> {
        self.lock()?
            .query_row(&format!("{CAMPAIGN_SELECT} WHERE id = ?1"), [id], row_to_campaign)
            .optional()
            .map_err(db_err("Get campaign"))
    }

    pub fn set_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        paused_reason: Option<PauseReason>,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE nurture_campaigns SET status = ?1, paused_reason = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![status.as_str(), paused_reason.map(|r| r.as_str()), id],
            )
            .map_err(db_err("Update campaign status"))?;
        Ok(())
    }

    /// Replace a campaign's steps. Ordinals are reassigned from slice order,
    /// keeping them contiguous from 0.
    pub fn replace_steps(&self, campaign_id: &str, steps: &[NurtureStep]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Replace steps"))?;
        tx.execute("DELETE FROM nurture_steps WHERE campaign_id = ?1", [campaign_id])
            .map_err(db_err("Replace steps"))?;
        for (ord, step) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO nurture_steps (campaign_id, ord, kind, delay_minutes, subject, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    campaign_id,
                    ord as i64,
                    step.kind.as_str(),
                    step.delay_minutes,
                    step.subject,
                    step.body,
                ],
            )
            .map_err(db_err("Replace steps"))?;
        }
        tx.commit().map_err(db_err("Replace steps"))?;
        Ok(())
    }

    /// Steps sorted by ordinal.
    pub fn load_steps(&self, campaign_id: &str) -> Result<Vec<NurtureStep>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT campaign_id, ord, kind, delay_minutes, subject, body FROM nurture_steps
                 WHERE campaign_id = ?1 ORDER BY ord",
            )
            .map_err(db_err("Load steps"))?;
        let rows = stmt
            .query_map([campaign_id], |row| {
                let kind: String = row.get(2)?;
                Ok(NurtureStep {
                    campaign_id: row.get(0)?,
                    ord: row.get(1)?,
                    kind: StepKind::parse(&kind),
                    delay_minutes: row.get(3)?,
                    subject: row.get(4)?,
                    body: row.get(5)?,
                })
            })
            .map_err(db_err("Load steps"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load steps"))
    }

    // ─── Nurture Enrollments ──────────────────────────────────────

    /// Enroll a contact at step 0, first send after that step's delay.
    pub fn enroll_contact(
        &self,
        owner_id: &str,
        campaign_id: &str,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NurtureEnrollment> {
        let first_delay = self
            .load_steps(campaign_id)?
            .first()
            .map(|s| s.delay_minutes.max(0))
            .unwrap_or(0);
        let enrollment = NurtureEnrollment {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            campaign_id: campaign_id.to_string(),
            contact_id: contact_id.to_string(),
            step_index: 0,
            next_send_at: Some(now + Duration::minutes(first_delay)),
            status: EnrollmentStatus::Active,
            last_sent_at: None,
            last_error: None,
        };
        self.lock()?
            .execute(
                "INSERT INTO nurture_enrollments
                 (id, owner_id, campaign_id, contact_id, step_index, next_send_at, status)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, 'ACTIVE')",
                params![
                    enrollment.id,
                    owner_id,
                    campaign_id,
                    contact_id,
                    enrollment.next_send_at.map(ts),
                ],
            )
            .map_err(db_err("Enroll contact"))?;
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, id: &str) -> Result<Option<NurtureEnrollment>> {
        self.lock()?
            .query_row(&format!("{ENROLLMENT_SELECT} WHERE id = ?1"), [id], row_to_enrollment)
            .optional()
            .map_err(db_err("Get enrollment"))
    }

    /// Active enrollments due at `now`, oldest-due first, ties by id.
    pub fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<NurtureEnrollment>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{ENROLLMENT_SELECT} WHERE status = 'ACTIVE' AND next_send_at IS NOT NULL
                 AND julianday(next_send_at) <= julianday(?1)
                 ORDER BY julianday(next_send_at) ASC, id ASC LIMIT ?2"
            ))
            .map_err(db_err("Due enrollments"))?;
        let rows = stmt
            .query_map(params![ts(now), limit as i64], row_to_enrollment)
            .map_err(db_err("Due enrollments"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Due enrollments"))
    }

    /// Compare-and-set claim: move `next_send_at` from the instant this pass
    /// observed to `claim_until`. Returns false if another pass got there first.
    ///
    /// Compared as instants, so rows written by other tools in any RFC 3339
    /// shape (no millis, offsets) still claim.
    pub fn claim_enrollment(
        &self,
        id: &str,
        observed_next_send_at: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE nurture_enrollments SET next_send_at = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'ACTIVE' AND julianday(next_send_at) = julianday(?3)",
                params![ts(claim_until), id, ts(observed_next_send_at)],
            )
            .map_err(db_err("Claim enrollment"))?;
        Ok(changed == 1)
    }

    /// Write an enrollment's mutable fields. Idempotent when repeated.
    pub fn update_enrollment(&self, enrollment: &NurtureEnrollment) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE nurture_enrollments
                 SET step_index = ?1, next_send_at = ?2, status = ?3, last_sent_at = ?4,
                     last_error = ?5, updated_at = datetime('now')
                 WHERE id = ?6",
                params![
                    enrollment.step_index,
                    enrollment.next_send_at.map(ts),
                    enrollment.status.as_str(),
                    enrollment.last_sent_at.map(ts),
                    enrollment.last_error,
                    enrollment.id,
                ],
            )
            .map_err(db_err("Update enrollment"))?;
        Ok(())
    }

    /// Stop an enrollment from outside the sequencer (opt-out, manual removal).
    pub fn stop_enrollment(&self, id: &str, reason: &str) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE nurture_enrollments
                 SET status = 'STOPPED', next_send_at = NULL, last_error = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'ACTIVE'",
                params![reason, id],
            )
            .map_err(db_err("Stop enrollment"))?;
        if changed == 0 {
            return Err(DripError::NotFound(format!("active enrollment {id}")));
        }
        Ok(())
    }
}
