//! Periodic detection of overdue steps.
//!
//! A sweep finds active instances whose current step has been open longer than
//! its time limit, tells the outstanding approvers and, per the configured
//! [`EscalationPolicy`], the higher-level recipients. Overdue detection never
//! changes instance state. Each (instance, step) pair is flagged at most once:
//! the flag is written in a transaction that also reads the instance, so
//! overlapping sweeps cannot both notify. Flags are dropped when the instance
//! finishes.
//!
//! The sweep also completes `all` steps whose remaining approvers have all
//! approved, which happens when the others leave the company.
use crate::collaborators::CompanyDirectory;
use crate::error::ApprovalError;
use crate::instance::ApprovalInstance;
use crate::notify::{NotificationEvent, NotificationRequest};
use crate::service::{ApprovalService, Outbox, load_instance};
use crate::types::{TimeStamp, UserId};
use crate::utils::{self, OrAbort, TxResult};
use serde::Serialize;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Who hears about overdue steps besides the approvers themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub escalate_to: Vec<UserId>,
    pub notify_company_admins: bool,
}

impl EscalationPolicy {
    pub fn recipients(&self, instance: &ApprovalInstance, directory: &dyn CompanyDirectory) -> Vec<UserId> {
        let mut recipients: BTreeSet<UserId> = self.escalate_to.iter().copied().collect();
        if self.notify_company_admins {
            if let Some(company) = instance.company_id {
                recipients.extend(directory.list_company_admins(company));
            }
        }
        recipients.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub overdue: usize,
    /// Overdue steps flagged for the first time in this sweep.
    pub flagged: usize,
    pub notified: usize,
    pub escalated: usize,
    /// Steps completed because everyone left on them had approved.
    pub settled: usize,
}

/// Drops the overdue flags of every step of a finished instance.
pub(crate) fn clear_overdue_marks(marks: &TransactionalTree, instance: &ApprovalInstance) -> TxResult<()> {
    for step_order in 0..instance.steps.len() as u64 {
        marks.remove(utils::pair_key(instance.id, step_order))?;
    }
    Ok(())
}

pub struct EscalationWatcher {
    service: Arc<ApprovalService>,
    policy: EscalationPolicy,
}

impl EscalationWatcher {
    pub fn new(service: Arc<ApprovalService>, policy: EscalationPolicy) -> Result<Self, ApprovalError> {
        Ok(Self { service, policy })
    }

    /// Steps currently flagged as overdue.
    pub fn flagged_steps(&self) -> usize {
        self.service.overdue_marks_tree().len()
    }

    pub fn sweep(&self) -> Result<SweepReport, ApprovalError> {
        self.sweep_at(TimeStamp::now())
    }

    pub fn sweep_at(&self, now: TimeStamp) -> Result<SweepReport, ApprovalError> {
        let mut report = SweepReport::default();
        for instance in self.service.scan_instances()? {
            report.scanned += 1;
            if instance.status.is_active() && self.service.settle(instance.id)?.is_some() {
                report.settled += 1;
                continue;
            }
            if !instance.is_overdue(now) {
                continue;
            }
            report.overdue += 1;
            if let Some((notified, escalated)) = self.flag(instance.id, now)? {
                report.flagged += 1;
                report.notified += notified;
                report.escalated += escalated;
            }
        }
        debug!(
            scanned = report.scanned,
            overdue = report.overdue,
            flagged = report.flagged,
            settled = report.settled,
            "Escalation sweep finished"
        );
        Ok(report)
    }

    /// Flags one overdue step and notifies. Returns `None` when the step was
    /// already flagged or is no longer overdue.
    fn flag(&self, instance_id: u64, now: TimeStamp) -> Result<Option<(usize, usize)>, ApprovalError> {
        let service = &self.service;
        let flagged = (
            service.instances_tree(),
            service.overdue_marks_tree(),
            service.notifications_tree(),
        )
            .transaction(
                |(instances, marks, notifications)| -> TxResult<Option<(ApprovalInstance, usize, usize, Vec<NotificationRequest>)>> {
                    let instance = load_instance(instances, instance_id)?;
                    if !instance.is_overdue(now) {
                        return Ok(None);
                    }
                    let mark = utils::pair_key(instance_id, instance.current_step as u64);
                    if marks.get(&mark)?.is_some() {
                        return Ok(None);
                    }
                    marks.insert(mark, utils::encode(&now).or_abort()?)?;

                    let mut outbox = Outbox::new(notifications, now);
                    let outstanding = instance.outstanding(&service.effective(&instance));
                    for approver in &outstanding {
                        outbox.push(&instance, *approver, NotificationEvent::Overdue)?;
                    }
                    let escalate_to: Vec<UserId> = self
                        .policy
                        .recipients(&instance, service.resolver().directory())
                        .into_iter()
                        .filter(|user| !outstanding.contains(user))
                        .collect();
                    for recipient in &escalate_to {
                        outbox.push(&instance, *recipient, NotificationEvent::Escalated)?;
                    }
                    Ok(Some((instance, outstanding.len(), escalate_to.len(), outbox.into_requests())))
                },
            )?;

        let Some((instance, notified, escalated, requests)) = flagged else {
            return Ok(None);
        };
        info!(
            instance_id,
            step_order = instance.current_step,
            step_entered_at = %instance.step_entered_at,
            notified,
            escalated,
            "Approval step overdue"
        );
        service.dispatch(requests);
        Ok(Some((notified, escalated)))
    }

    /// Sweeps every `interval` until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);
        info!(interval_secs = interval.as_secs(), "Escalation watcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let watcher = self.clone();
                    match tokio::task::spawn_blocking(move || watcher.sweep()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "Escalation sweep failed"),
                        Err(e) => error!(error = %e, "Escalation sweep panicked"),
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        info!("Escalation watcher stopped");
    }
}
