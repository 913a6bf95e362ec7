//! In-memory store and owner directory for tests
//!
//! Mirrors the conditional-write semantics of the PostgreSQL queries: every
//! checkpoint is all-or-nothing and only applies when status and cursor match.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::active_jobs::ActiveJobs;
use super::store::{CommitBatch, ImportStore, JobChange, OwnerDirectory, ParseCheckpoint, RowAction};
use crate::types::{
    AuditEvent, Contact, DuplicateKind, ImportJob, ImportJobStatus, ImportRow, JobCounters, JobCursor,
    NewImportJob, Owner, Page, RowFilter, RowStatus, WizardState,
};

#[derive(Clone, Default)]
struct State {
    jobs: HashMap<Uuid, ImportJob>,
    rows: BTreeMap<(Uuid, i64), ImportRow>,
    contacts: BTreeMap<Uuid, Contact>,
    owners: Vec<(Uuid, Owner)>,
    audit: Vec<AuditEvent>,
    row_writes: HashMap<(Uuid, i64), usize>,
    fail_parse_at: Option<i64>,
    fail_commit_at: Option<i64>,
    cancel_at: Option<CancelAt>,
}

#[derive(Clone)]
struct CancelAt {
    checkpoint: i64,
    signal: Option<ActiveJobs>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn add_owner(&self, tenant_id: Uuid, display_name: &str) -> Uuid {
        let owner = Owner {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            role: "sales".to_string(),
        };
        let id = owner.id;
        self.state.lock().owners.push((tenant_id, owner));
        id
    }

    pub fn seed_contact(&self, user_id: Uuid, email: Option<&str>, phone: Option<&str>) -> Uuid {
        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4(),
            user_id,
            assigned_to: None,
            first_name: None,
            last_name: None,
            email: email.map(String::from),
            phone: phone.map(String::from),
            phone_raw: None,
            company: None,
            job_title: None,
            street: None,
            city: None,
            postal_code: None,
            country: None,
            notes: None,
            source_import_job_id: None,
            created_at: now,
            updated_at: now,
        };
        let id = contact.id;
        self.state.lock().contacts.insert(id, contact);
        id
    }

    pub fn contact(&self, id: Uuid) -> Option<Contact> {
        self.state.lock().contacts.get(&id).cloned()
    }

    pub fn contacts_of(&self, user_id: Uuid) -> Vec<Contact> {
        self.state
            .lock()
            .contacts
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn rows(&self, job_id: Uuid) -> Vec<ImportRow> {
        self.state
            .lock()
            .rows
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.state.lock().audit.clone()
    }

    /// How many times each row of a job was written by a parse checkpoint
    pub fn row_writes(&self, job_id: Uuid) -> HashMap<i64, usize> {
        self.state
            .lock()
            .row_writes
            .iter()
            .filter(|((j, _), _)| *j == job_id)
            .map(|((_, n), c)| (*n, *c))
            .collect()
    }

    /// Make the parse checkpoint of `chunk` fail once, as a crash would
    pub fn fail_parse_checkpoint(&self, chunk: i64) {
        self.state.lock().fail_parse_at = Some(chunk);
    }

    /// Make the commit checkpoint of `batch` fail once
    pub fn fail_commit_checkpoint(&self, batch: i64) {
        self.state.lock().fail_commit_at = Some(batch);
    }

    /// Cancel the job right after checkpoint `checkpoint` of the running phase lands,
    /// as a concurrent cancel request would. With `signal` the worker's token is
    /// cancelled too (cancel served by this process); without it only the stored
    /// status changes (cancel served elsewhere).
    pub fn cancel_after_checkpoint(&self, checkpoint: i64, signal: Option<ActiveJobs>) {
        self.state.lock().cancel_at = Some(CancelAt { checkpoint, signal });
    }
}

fn cancel_if_due(state: &mut State, job_id: Uuid, checkpoint: i64) {
    let Some(cancel) = state.cancel_at.take() else {
        return;
    };
    if cancel.checkpoint != checkpoint {
        state.cancel_at = Some(cancel);
        return;
    }

    if let Some(job) = state.jobs.get_mut(&job_id) {
        job.status = ImportJobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
    }
    if let Some(active_jobs) = cancel.signal {
        active_jobs.cancel(&job_id);
    }
}

fn apply_change(job: &mut ImportJob, change: JobChange) {
    let now = Utc::now();
    if let Some(status) = change.status {
        job.status = status;
    }
    if let Some(phase) = change.last_phase {
        job.last_phase = Some(phase);
    }
    if let Some(mapping) = change.mapping {
        job.mapping = mapping;
    }
    if let Some(assignment) = change.assignment {
        job.assignment = assignment;
    }
    if let Some(duplicates) = change.duplicates {
        job.duplicates = duplicates;
    }
    if let Some(counters) = change.counters {
        job.counters = counters;
    }
    if let Some(cursor) = change.cursor {
        job.cursor = cursor;
    }
    if let Some(error) = change.error {
        job.error = error;
    }
    if let Some(ui_state) = change.ui_state {
        job.ui_state = ui_state;
    }
    if job.started_at.is_none() {
        job.started_at = change.started_at;
    }
    if let Some(completed_at) = change.completed_at {
        job.completed_at = Some(completed_at);
    }
    job.updated_at = now;
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn insert_job(&self, new: &NewImportJob) -> Result<Option<ImportJob>> {
        let mut state = self.state.lock();
        let conflict = state
            .jobs
            .values()
            .any(|j| j.owner_id == new.owner_id && j.file.content_hash == new.file.content_hash);
        if conflict {
            return Ok(None);
        }

        let now = Utc::now();
        let job = ImportJob {
            id: new.id,
            owner_id: new.owner_id,
            created_by: new.created_by,
            file: new.file.clone(),
            status: ImportJobStatus::Pending,
            last_phase: None,
            headers: new.headers.clone(),
            mapping: new.mapping.clone(),
            assignment: Default::default(),
            duplicates: Default::default(),
            counters: JobCounters::default(),
            cursor: JobCursor::default(),
            error: None,
            ui_state: WizardState::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn find_job_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<ImportJob>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|j| j.owner_id == owner_id && j.file.content_hash == content_hash)
            .cloned())
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<ImportJob>> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !expected.contains(&job.status) {
            return Ok(None);
        }
        apply_change(job, change);
        Ok(Some(job.clone()))
    }

    async fn delete_job(&self, job_id: Uuid, expected: &[ImportJobStatus]) -> Result<bool> {
        let mut state = self.state.lock();
        match state.jobs.get(&job_id) {
            Some(job) if expected.contains(&job.status) => {}
            _ => return Ok(false),
        }
        state.jobs.remove(&job_id);
        state.rows.retain(|(j, _), _| *j != job_id);
        Ok(true)
    }

    async fn restart_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<(ImportJob, u64)>> {
        let mut state = self.state.lock();
        let job = match state.jobs.get_mut(&job_id) {
            Some(job) if expected.contains(&job.status) => job,
            _ => return Ok(None),
        };
        apply_change(job, change);
        let job = job.clone();

        let before = state.rows.len();
        state.rows.retain(|(j, _), _| *j != job_id);
        state.row_writes.retain(|(j, _), _| *j != job_id);
        Ok(Some((job, (before - state.rows.len()) as u64)))
    }

    async fn checkpoint_parse(&self, job_id: Uuid, checkpoint: &ParseCheckpoint) -> Result<Option<ImportJob>> {
        let mut state = self.state.lock();
        if state.fail_parse_at == Some(checkpoint.chunk_number) {
            state.fail_parse_at = None;
            bail!("connection reset while writing chunk {}", checkpoint.chunk_number);
        }

        let now = Utc::now();
        let job = match state.jobs.get_mut(&job_id) {
            Some(job)
                if job.status == ImportJobStatus::Parsing
                    && job.cursor.position == checkpoint.chunk_number - 1 =>
            {
                job
            }
            _ => return Ok(None),
        };

        job.counters.total = checkpoint.counters.total;
        job.counters.valid = checkpoint.counters.valid;
        job.counters.invalid = checkpoint.counters.invalid;
        job.counters.file_duplicates = checkpoint.counters.file_duplicates;
        job.cursor.position = checkpoint.chunk_number;
        job.cursor.total_estimate = checkpoint.cursor.total_estimate;
        job.cursor.last_row_number = checkpoint.cursor.last_row_number;
        job.updated_at = now;
        let updated = job.clone();

        for row in &checkpoint.rows {
            state.rows.insert(
                (job_id, row.row_number),
                ImportRow {
                    job_id,
                    row_number: row.row_number,
                    chunk_number: row.chunk_number,
                    status: row.status,
                    raw: row.raw.clone(),
                    normalized: row.normalized.clone(),
                    errors: row.errors.clone(),
                    duplicate: row.duplicate,
                    dedupe_key: row.dedupe_key.clone(),
                    matched_contact_id: None,
                    contact_id: None,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            *state.row_writes.entry((job_id, row.row_number)).or_insert(0) += 1;
        }
        cancel_if_due(&mut state, job_id, checkpoint.chunk_number);

        Ok(Some(updated))
    }

    async fn row_dedupe_keys(&self, job_id: Uuid) -> Result<HashSet<String>> {
        Ok(self
            .state
            .lock()
            .rows
            .values()
            .filter(|r| {
                r.job_id == job_id
                    && matches!(r.status, RowStatus::Valid | RowStatus::Imported | RowStatus::Skipped)
            })
            .filter_map(|r| r.dedupe_key.clone())
            .collect())
    }

    async fn mark_db_duplicates(&self, job_id: Uuid, matches: &HashMap<String, Uuid>) -> Result<i64> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut count = 0;
        for row in state.rows.values_mut().filter(|r| r.job_id == job_id) {
            if row.status == RowStatus::Valid && row.duplicate == DuplicateKind::DbDuplicate {
                row.duplicate = DuplicateKind::None;
                row.matched_contact_id = None;
                row.updated_at = now;
            }
            if row.status == RowStatus::Valid && row.duplicate == DuplicateKind::None {
                if let Some(contact_id) = row.dedupe_key.as_ref().and_then(|k| matches.get(k)) {
                    row.duplicate = DuplicateKind::DbDuplicate;
                    row.matched_contact_id = Some(*contact_id);
                    row.updated_at = now;
                }
            }
            if row.duplicate == DuplicateKind::DbDuplicate {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn valid_rows_after(&self, job_id: Uuid, after_row_number: i64, limit: i64) -> Result<Vec<ImportRow>> {
        Ok(self
            .state
            .lock()
            .rows
            .range((job_id, after_row_number + 1)..=(job_id, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.status == RowStatus::Valid)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn checkpoint_commit(&self, job: &ImportJob, batch: &CommitBatch) -> Result<Option<ImportJob>> {
        let mut state = self.state.lock();
        if state.fail_commit_at == Some(batch.batch_number) {
            state.fail_commit_at = None;
            bail!("connection reset while writing batch {}", batch.batch_number);
        }

        let mut next = state.clone();
        let now = Utc::now();

        let stored = match next.jobs.get_mut(&job.id) {
            Some(stored)
                if stored.status == ImportJobStatus::Importing
                    && stored.cursor.position == batch.batch_number - 1 =>
            {
                stored
            }
            _ => return Ok(None),
        };
        stored.counters.imported = batch.counters.imported;
        stored.counters.updated = batch.counters.updated;
        stored.counters.skipped = batch.counters.skipped;
        stored.counters.db_duplicates = batch.counters.db_duplicates;
        stored.cursor.position = batch.batch_number;
        stored.cursor.total_estimate = batch.cursor.total_estimate;
        stored.cursor.last_row_number = batch.cursor.last_row_number;
        stored.updated_at = now;
        let updated = stored.clone();

        for outcome in &batch.outcomes {
            let key = (job.id, outcome.row_number);
            match next.rows.get(&key) {
                Some(row) if row.contact_id.is_none() && row.status.can_transition(outcome.action.row_status()) => {}
                _ => continue,
            }
            if let Some(event) = &outcome.event {
                let exists = next.audit.iter().any(|e| {
                    e.entity_id == event.entity_id && e.job_id == event.job_id && e.event_type == event.event_type
                });
                if !exists {
                    next.audit.push(event.clone());
                }
            }

            let (status, contact_id, message) = match &outcome.action {
                RowAction::Create { contact_id, draft } => {
                    let contact = Contact {
                        id: *contact_id,
                        user_id: job.owner_id,
                        assigned_to: draft.assigned_to,
                        first_name: draft.first_name.clone(),
                        last_name: draft.last_name.clone(),
                        email: draft.email.clone(),
                        phone: draft.phone.clone(),
                        phone_raw: draft.phone_raw.clone(),
                        company: draft.company.clone(),
                        job_title: draft.job_title.clone(),
                        street: draft.street.clone(),
                        city: draft.city.clone(),
                        postal_code: draft.postal_code.clone(),
                        country: draft.country.clone(),
                        notes: draft.notes.clone(),
                        source_import_job_id: Some(job.id),
                        created_at: now,
                        updated_at: now,
                    };
                    next.contacts.insert(*contact_id, contact);
                    (RowStatus::Imported, Some(*contact_id), None)
                }
                RowAction::Update { contact_id, draft } => {
                    let contact = next
                        .contacts
                        .get_mut(contact_id)
                        .filter(|c| c.user_id == job.owner_id)
                        .ok_or_else(|| {
                            anyhow!(
                                "Contact {} matched by row {} no longer exists",
                                contact_id,
                                outcome.row_number
                            )
                        })?;
                    draft.merge_into(contact);
                    contact.updated_at = now;
                    (RowStatus::Imported, Some(*contact_id), None)
                }
                RowAction::Skip { reason } => (RowStatus::Skipped, None, Some(reason.clone())),
            };

            if let Some(row) = next.rows.get_mut(&key) {
                row.status = status;
                row.contact_id = contact_id;
                row.error_message = message;
                row.updated_at = now;
            }
        }

        *state = next;
        cancel_if_due(&mut state, job.id, batch.batch_number);
        Ok(Some(updated))
    }

    async fn list_rows(&self, job_id: Uuid, filter: Option<RowFilter>, page: Page) -> Result<(Vec<ImportRow>, i64)> {
        let page = page.clamped();
        let state = self.state.lock();
        let matching: Vec<&ImportRow> = state
            .rows
            .values()
            .filter(|r| r.job_id == job_id && filter.map_or(true, |f| f.matches(r)))
            .collect();
        let total = matching.len() as i64;
        let rows = matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((rows, total))
    }

    async fn contacts_page(
        &self,
        owner_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
        exclude_job: Uuid,
    ) -> Result<Vec<Contact>> {
        Ok(self
            .state
            .lock()
            .contacts
            .values()
            .filter(|c| c.user_id == owner_id)
            .filter(|c| after.map_or(true, |a| c.id > a))
            .filter(|c| c.source_import_job_id != Some(exclude_job))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OwnerDirectory for MemoryStore {
    async fn list_owners(&self, tenant_id: Uuid) -> Result<Vec<Owner>> {
        Ok(self
            .state
            .lock()
            .owners
            .iter()
            .filter(|(tenant, owner)| *tenant == tenant_id || owner.id == tenant_id)
            .map(|(_, owner)| owner.clone())
            .collect())
    }
}
