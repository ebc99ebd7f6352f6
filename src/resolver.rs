//! Turns a step's approver rule into the concrete set of users who may act on it.
use crate::collaborators::CompanyDirectory;
use crate::definition::{ApproverRule, StepDefinition};
use crate::error::ApprovalError;
use crate::types::{CompanyId, UserId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of evaluating who may act on the current step right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveApprovers {
    pub approvers: Vec<UserId>,
    /// The step-entry snapshot had no active member left and was replaced by a live resolution.
    pub refreshed: bool,
}

impl EffectiveApprovers {
    pub fn is_blocked(&self) -> bool {
        self.approvers.is_empty()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.approvers.contains(&user_id)
    }
}

#[derive(Clone)]
pub struct StepResolver {
    directory: Arc<dyn CompanyDirectory>,
}

impl StepResolver {
    pub fn new(directory: Arc<dyn CompanyDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &dyn CompanyDirectory {
        self.directory.as_ref()
    }

    /// Live resolution of a rule, sorted and without duplicates.
    ///
    /// Without a company (personal workspace) user lists are taken literally
    /// and role rules resolve to nobody.
    pub fn resolve(&self, rule: &ApproverRule, company_id: Option<CompanyId>) -> Vec<UserId> {
        let set: BTreeSet<UserId> = match (rule, company_id) {
            (ApproverRule::Users(ids), None) => ids.iter().copied().collect(),
            (ApproverRule::Users(ids), Some(company)) => ids
                .iter()
                .copied()
                .filter(|user| self.directory.is_active_employee(company, *user))
                .collect(),
            (ApproverRule::Role(_), None) => BTreeSet::new(),
            (ApproverRule::Role(roles), Some(company)) => roles
                .iter()
                .flat_map(|role| self.directory.list_active_employees_with_role(company, *role))
                .collect(),
        };
        set.into_iter().collect()
    }

    pub fn resolve_step(&self, step: &StepDefinition, company_id: Option<CompanyId>) -> Vec<UserId> {
        self.resolve(&step.approvers, company_id)
    }

    pub fn is_active(&self, company_id: Option<CompanyId>, user_id: UserId) -> bool {
        match company_id {
            Some(company) => self.directory.is_active_employee(company, user_id),
            None => true,
        }
    }

    /// The snapshot taken at step entry, minus anyone no longer active.
    ///
    /// When nobody from the snapshot is left, the rule is evaluated live so a
    /// newly appointed role holder can unblock the step. Users in `excluded`
    /// (those who delegated their obligation away) are never brought back.
    pub fn effective(
        &self,
        rule: &ApproverRule,
        snapshot: &[UserId],
        excluded: &[UserId],
        company_id: Option<CompanyId>,
    ) -> EffectiveApprovers {
        let approvers: Vec<UserId> = snapshot
            .iter()
            .copied()
            .filter(|user| self.is_active(company_id, *user))
            .collect();
        if !approvers.is_empty() {
            return EffectiveApprovers {
                approvers,
                refreshed: false,
            };
        }

        let live: Vec<UserId> = self
            .resolve(rule, company_id)
            .into_iter()
            .filter(|user| !excluded.contains(user))
            .collect();
        let refreshed = !live.is_empty();
        EffectiveApprovers {
            approvers: live,
            refreshed,
        }
    }

    /// Checks that a company-scoped rule only names approvers the directory knows.
    pub fn validate_rule(
        &self,
        rule: &ApproverRule,
        company_id: Option<CompanyId>,
    ) -> Result<(), ApprovalError> {
        let Some(company) = company_id else {
            return Ok(());
        };
        match rule {
            ApproverRule::Users(ids) => {
                if let Some(unknown) = ids
                    .iter()
                    .find(|user| !self.directory.is_active_employee(company, **user))
                {
                    return Err(ApprovalError::InvalidApprover(format!(
                        "user {} is not an active employee of company {}",
                        unknown, company
                    )));
                }
            }
            ApproverRule::Role(ids) => {
                if let Some(unknown) = ids.iter().find(|role| !self.directory.role_exists(company, **role)) {
                    return Err(ApprovalError::InvalidApprover(format!(
                        "role {} does not exist in company {}",
                        unknown, company
                    )));
                }
            }
        }
        Ok(())
    }
}
