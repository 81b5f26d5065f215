//! Persistence of jobs, windows and their indexes
//!
//! Column families:
//! - `settlement_jobs`: job_id → job
//! - `settlement_job_members`: business || member || job_id → ()
//! - `settlement_job_status`: status code || job_id → ()
//! - `settlement_windows`: window_id → window

use crate::{
    types::{DisbursementJob, JobStatus, SettlementWindow},
    Error, Result,
};
use chrono::Utc;
use ledger_core::{storage::keys, BusinessId, Storage, WriteTxn};
use std::sync::Arc;
use uuid::Uuid;

/// Jobs, keyed by job id
pub const CF_JOBS: &str = "settlement_jobs";
/// Per-member job index
pub const CF_JOB_MEMBERS: &str = "settlement_job_members";
/// Per-status job index
pub const CF_JOB_STATUS: &str = "settlement_job_status";
/// Settlement windows, keyed by window id
pub const CF_WINDOWS: &str = "settlement_windows";

fn member_prefix(business_id: &BusinessId, member_id: &Uuid) -> Vec<u8> {
    keys::scoped(business_id, member_id.as_bytes())
}

fn member_key(job: &DisbursementJob) -> Vec<u8> {
    let mut key = member_prefix(&job.business_id, &job.member_id);
    key.extend_from_slice(job.job_id.as_bytes());
    key
}

fn status_key(status: JobStatus, job_id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status.code());
    key.extend_from_slice(job_id.as_bytes());
    key
}

fn trailing_uuid(key: &[u8]) -> Option<Uuid> {
    let start = key.len().checked_sub(16)?;
    Uuid::from_slice(&key[start..]).ok()
}

/// Job and window records
#[derive(Debug, Clone)]
pub struct JobStore {
    storage: Arc<Storage>,
}

impl JobStore {
    /// Store over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Load a job
    pub fn get(&self, job_id: Uuid) -> Result<DisbursementJob> {
        self.storage
            .get(CF_JOBS, job_id.as_bytes())?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Stage a new job and its index rows
    pub fn stage_new(&self, txn: &mut WriteTxn<'_>, job: &mut DisbursementJob) -> Result<()> {
        job.version = 1;
        txn.put(CF_JOBS, job.job_id.as_bytes(), job)?;
        txn.put_raw(CF_JOB_MEMBERS, &member_key(job), &[])?;
        txn.put_raw(CF_JOB_STATUS, &status_key(job.status, &job.job_id), &[])?;
        Ok(())
    }

    /// Stage a change to a job read at `job.version`.
    ///
    /// Rejects changes to immutable fields and writes that lost a race,
    /// then bumps the version and moves the status index row.
    pub fn stage_update(&self, txn: &mut WriteTxn<'_>, job: &mut DisbursementJob) -> Result<()> {
        let stored = self.get(job.job_id)?;
        if stored.version != job.version {
            return Err(Error::ConcurrentModification {
                job_id: job.job_id,
                expected: job.version,
                found: stored.version,
            });
        }
        stored.check_immutable(job)?;

        job.version += 1;
        job.updated_at = Utc::now();
        txn.put(CF_JOBS, job.job_id.as_bytes(), job)?;
        if stored.status != job.status {
            txn.delete(CF_JOB_STATUS, &status_key(stored.status, &job.job_id))?;
            txn.put_raw(CF_JOB_STATUS, &status_key(job.status, &job.job_id), &[])?;
        }
        Ok(())
    }

    /// Jobs in a status, oldest first
    pub fn by_status(&self, status: JobStatus) -> Result<Vec<DisbursementJob>> {
        self.storage
            .scan_prefix_keys(CF_JOB_STATUS, &[status.code()])?
            .iter()
            .filter_map(|key| trailing_uuid(key))
            .map(|job_id| self.get(job_id))
            .collect()
    }

    /// Every job of one member of a business
    pub fn for_member(
        &self,
        business_id: BusinessId,
        member_id: Uuid,
    ) -> Result<Vec<DisbursementJob>> {
        self.storage
            .scan_prefix_keys(CF_JOB_MEMBERS, &member_prefix(&business_id, &member_id))?
            .iter()
            .filter_map(|key| trailing_uuid(key))
            .map(|job_id| self.get(job_id))
            .collect()
    }

    /// Every job of a business
    pub fn for_business(&self, business_id: BusinessId) -> Result<Vec<DisbursementJob>> {
        self.storage
            .scan_prefix_keys(CF_JOB_MEMBERS, business_id.as_bytes())?
            .iter()
            .filter_map(|key| trailing_uuid(key))
            .map(|job_id| self.get(job_id))
            .collect()
    }

    /// Load a window
    pub fn get_window(&self, window_id: Uuid) -> Result<SettlementWindow> {
        self.storage
            .get(CF_WINDOWS, window_id.as_bytes())?
            .ok_or(Error::WindowNotFound(window_id))
    }

    /// Stage a window write
    pub fn stage_window(&self, txn: &mut WriteTxn<'_>, window: &SettlementWindow) -> Result<()> {
        txn.put(CF_WINDOWS, window.window_id.as_bytes(), window)?;
        Ok(())
    }

    /// Every window, oldest first
    pub fn windows(&self) -> Result<Vec<SettlementWindow>> {
        let mut windows: Vec<SettlementWindow> = self
            .storage
            .scan_all::<SettlementWindow>(CF_WINDOWS)?
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        windows.sort_by_key(|w| (w.window_start, w.created_at));
        Ok(windows)
    }
}
