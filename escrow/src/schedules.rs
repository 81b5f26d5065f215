//! Recurring disbursement schedules
//!
//! Creating or editing a schedule, and attaching a member to one, re-runs
//! the admission check against the schedule's projected cost under the
//! business → schedule locks, so two concurrent attachments cannot jointly
//! exceed available funds.

use crate::{
    accounts::AccountStore, admission::AdmissionController, locks::LockManager, Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::{AuditAction, AuditEvent, AuditTrail, BusinessId, Storage, WriteTxn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Schedules, keyed by schedule id
pub const CF_SCHEDULES: &str = "escrow_schedules";

/// What a schedule pays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Same amount to every recipient
    Payment {
        /// Amount per recipient
        amount_per_recipient: Decimal,
    },
    /// Each employee's gross salary
    Payroll,
}

/// Recipient or employee of a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMember {
    /// Recipient / employee id
    pub member_id: Uuid,
    /// Gross salary (payroll); ignored for payment schedules
    pub gross_amount: Decimal,
}

impl ScheduleMember {
    /// New member
    pub fn new(member_id: Uuid, gross_amount: Decimal) -> Self {
        Self {
            member_id,
            gross_amount,
        }
    }
}

/// Recurring schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Schedule ID
    pub schedule_id: Uuid,
    /// Owning business
    pub business_id: BusinessId,
    /// Display name
    pub name: String,
    /// Payment or payroll
    pub kind: ScheduleKind,
    /// Recipients / employees
    pub members: Vec<ScheduleMember>,
    /// Bumped on every write
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Amount one member receives per run
    pub fn member_amount(&self, member: &ScheduleMember) -> Decimal {
        match &self.kind {
            ScheduleKind::Payment {
                amount_per_recipient,
            } => *amount_per_recipient,
            ScheduleKind::Payroll => member.gross_amount,
        }
    }

    /// Cost of one run: amount × recipients, or Σ gross salaries
    pub fn projected_cost(&self) -> Decimal {
        self.members.iter().map(|m| self.member_amount(m)).sum()
    }

    /// Member by id
    pub fn member(&self, member_id: Uuid) -> Option<&ScheduleMember> {
        self.members.iter().find(|m| m.member_id == member_id)
    }

    fn validate(&self) -> Result<()> {
        if let ScheduleKind::Payment {
            amount_per_recipient,
        } = &self.kind
        {
            if *amount_per_recipient <= Decimal::ZERO {
                return Err(Error::InvalidSchedule(
                    "amount_per_recipient must be positive".to_string(),
                ));
            }
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.member_id) {
                return Err(Error::InvalidSchedule(format!(
                    "member {} listed twice",
                    member.member_id
                )));
            }
            if self.kind == ScheduleKind::Payroll && member.gross_amount <= Decimal::ZERO {
                return Err(Error::InvalidSchedule(format!(
                    "member {} has non-positive gross amount",
                    member.member_id
                )));
            }
        }
        Ok(())
    }
}

/// Schedule lifecycle with projected-cost admission
#[derive(Debug, Clone)]
pub struct ScheduleService {
    storage: Arc<Storage>,
    accounts: AccountStore,
    admission: AdmissionController,
    locks: Arc<LockManager>,
    trail: AuditTrail,
}

impl ScheduleService {
    /// Service over shared storage, admission and locks
    pub fn new(
        storage: Arc<Storage>,
        admission: AdmissionController,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            accounts: AccountStore::new(storage.clone()),
            trail: AuditTrail::new(storage.clone()),
            storage,
            admission,
            locks,
        }
    }

    /// Load a schedule
    pub fn get(&self, schedule_id: Uuid) -> Result<Schedule> {
        self.storage
            .get(CF_SCHEDULES, schedule_id.as_bytes())?
            .ok_or(Error::ScheduleNotFound(schedule_id))
    }

    /// Create a schedule if the business can fund one run of it
    pub async fn create(
        &self,
        business_id: BusinessId,
        name: &str,
        kind: ScheduleKind,
        members: Vec<ScheduleMember>,
    ) -> Result<Schedule> {
        let now = Utc::now();
        let mut schedule = Schedule {
            schedule_id: Uuid::now_v7(),
            business_id,
            name: name.to_string(),
            kind,
            members,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        schedule.validate()?;

        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_schedule(schedule.schedule_id).await?;

        let account = self.accounts.require(business_id)?;
        self.admission
            .check_projected_cost(&account, schedule.projected_cost())?;

        let mut txn = self.storage.begin();
        self.stage(&mut txn, &mut schedule, "created")?;
        txn.commit()?;

        tracing::info!(
            business_id = %business_id,
            schedule_id = %schedule.schedule_id,
            members = schedule.members.len(),
            projected_cost = %schedule.projected_cost(),
            "Schedule created"
        );
        Ok(schedule)
    }

    /// Change a schedule's name and kind, re-checking its projected cost
    pub async fn update(
        &self,
        schedule_id: Uuid,
        name: &str,
        kind: ScheduleKind,
    ) -> Result<Schedule> {
        let business_id = self.get(schedule_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_schedule(schedule_id).await?;

        let mut schedule = self.get(schedule_id)?;
        schedule.name = name.to_string();
        schedule.kind = kind;
        schedule.validate()?;

        let account = self.accounts.require(business_id)?;
        self.admission
            .check_projected_cost(&account, schedule.projected_cost())?;

        let mut txn = self.storage.begin();
        self.stage(&mut txn, &mut schedule, "updated")?;
        txn.commit()?;

        tracing::info!(
            schedule_id = %schedule_id,
            projected_cost = %schedule.projected_cost(),
            "Schedule updated"
        );
        Ok(schedule)
    }

    /// Attach a member; the projected cost including the new member must fit
    pub async fn attach_member(&self, schedule_id: Uuid, member: ScheduleMember) -> Result<Schedule> {
        let business_id = self.get(schedule_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_schedule(schedule_id).await?;

        let mut schedule = self.get(schedule_id)?;
        if schedule.member(member.member_id).is_some() {
            return Err(Error::InvalidSchedule(format!(
                "member {} already attached",
                member.member_id
            )));
        }
        let member_id = member.member_id;
        schedule.members.push(member);
        schedule.validate()?;

        let account = self.accounts.require(business_id)?;
        self.admission
            .check_projected_cost(&account, schedule.projected_cost())?;

        let mut txn = self.storage.begin();
        self.stage_membership(&mut txn, &mut schedule, member_id, "attached")?;
        txn.commit()?;

        tracing::info!(
            schedule_id = %schedule_id,
            member_id = %member_id,
            projected_cost = %schedule.projected_cost(),
            "Member attached"
        );
        Ok(schedule)
    }

    /// Detach a member
    pub async fn detach_member(&self, schedule_id: Uuid, member_id: Uuid) -> Result<Schedule> {
        let business_id = self.get(schedule_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_schedule(schedule_id).await?;

        let mut schedule = self.get(schedule_id)?;
        let before = schedule.members.len();
        schedule.members.retain(|m| m.member_id != member_id);
        if schedule.members.len() == before {
            return Err(Error::InvalidSchedule(format!(
                "member {} is not attached",
                member_id
            )));
        }

        let mut txn = self.storage.begin();
        self.stage_membership(&mut txn, &mut schedule, member_id, "detached")?;
        txn.commit()?;

        tracing::info!(schedule_id = %schedule_id, member_id = %member_id, "Member detached");
        Ok(schedule)
    }

    fn stage(&self, txn: &mut WriteTxn<'_>, schedule: &mut Schedule, change: &str) -> Result<()> {
        schedule.version += 1;
        schedule.updated_at = Utc::now();
        txn.put(CF_SCHEDULES, schedule.schedule_id.as_bytes(), schedule)?;

        let event = AuditEvent::new(
            AuditAction::ScheduleChanged,
            "escrow.schedules",
            format!("schedule:{}", schedule.schedule_id),
        )
        .business(schedule.business_id)
        .detail("change", change)
        .detail("projected_cost", schedule.projected_cost());
        self.trail.record_in(txn, &event)?;
        Ok(())
    }

    fn stage_membership(
        &self,
        txn: &mut WriteTxn<'_>,
        schedule: &mut Schedule,
        member_id: Uuid,
        change: &str,
    ) -> Result<()> {
        schedule.version += 1;
        schedule.updated_at = Utc::now();
        txn.put(CF_SCHEDULES, schedule.schedule_id.as_bytes(), schedule)?;

        let event = AuditEvent::new(
            AuditAction::ScheduleMembershipChanged,
            "escrow.schedules",
            format!("schedule:{}", schedule.schedule_id),
        )
        .business(schedule.business_id)
        .detail("change", change)
        .detail("member_id", member_id);
        self.trail.record_in(txn, &event)?;
        Ok(())
    }
}
