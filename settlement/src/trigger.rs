//! Schedule runs: one job per schedule member and pay period

use crate::{
    jobs::JobManager,
    types::{CalculationSnapshot, DisbursementJob, NewJob, PayPeriod},
    Error, Result,
};
use escrow::{ScheduleKind, ScheduleService};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Result of triggering a schedule
#[derive(Debug, Clone, Default)]
pub struct TriggerOutcome {
    /// Jobs created, or found again on a replayed trigger
    pub jobs: Vec<DisbursementJob>,
    /// Members whose job was refused, with the reason
    pub refused: Vec<(Uuid, String)>,
}

/// Fans a schedule out into jobs through idempotent job creation
#[derive(Debug, Clone)]
pub struct ScheduleTrigger {
    schedules: ScheduleService,
    jobs: JobManager,
}

impl ScheduleTrigger {
    /// Trigger over the schedule service and job manager
    pub fn new(schedules: ScheduleService, jobs: JobManager) -> Self {
        Self { schedules, jobs }
    }

    /// Create one job per member for `period`.
    ///
    /// Payroll members use their entry in `calculations`, or pay their gross
    /// amount when none is given. Each job is keyed on schedule, member and
    /// period, so triggering twice creates nothing new. Refusals (funds,
    /// duplicates, overlaps, invalid calculations) are collected per member;
    /// any other error aborts the run.
    pub async fn trigger(
        &self,
        schedule_id: Uuid,
        period: PayPeriod,
        calculations: &BTreeMap<Uuid, CalculationSnapshot>,
    ) -> Result<TriggerOutcome> {
        let schedule = self.schedules.get(schedule_id)?;
        let mut outcome = TriggerOutcome::default();

        for member in &schedule.members {
            let request = match &schedule.kind {
                ScheduleKind::Payment { .. } => NewJob::payment(
                    schedule.business_id,
                    member.member_id,
                    schedule.member_amount(member),
                    period,
                ),
                ScheduleKind::Payroll => {
                    let calculation = calculations
                        .get(&member.member_id)
                        .cloned()
                        .unwrap_or_else(|| CalculationSnapshot::gross_only(member.gross_amount));
                    NewJob::payroll(schedule.business_id, member.member_id, period, calculation)
                }
            }
            .schedule(schedule_id)
            .idempotency_key(format!(
                "schedule:{}:{}:{}:{}",
                schedule_id, member.member_id, period.start, period.end
            ));

            match self.jobs.create_job(request).await {
                Ok(job) => outcome.jobs.push(job),
                Err(e) if is_member_refusal(&e) => {
                    tracing::warn!(
                        schedule_id = %schedule_id,
                        member_id = %member.member_id,
                        error = %e,
                        "Schedule member refused"
                    );
                    outcome.refused.push((member.member_id, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            schedule_id = %schedule_id,
            business_id = %schedule.business_id,
            period = %period,
            jobs = outcome.jobs.len(),
            refused = outcome.refused.len(),
            "Schedule triggered"
        );
        Ok(outcome)
    }
}

fn is_member_refusal(error: &Error) -> bool {
    matches!(
        error,
        Error::Escrow(escrow::Error::InsufficientFunds { .. })
            | Error::Escrow(escrow::Error::AccountFrozen(_))
            | Error::DuplicateActiveJob { .. }
            | Error::PeriodOverlap { .. }
            | Error::InvalidJob(_)
            | Error::IdempotencyConflict(_)
    )
}
