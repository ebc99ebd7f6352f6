//! Workspace scoping passed explicitly into every engine call
use crate::error::ValidationError;
use crate::types::{CompanyId, FactoryId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    Personal,
    Enterprise,
}

/// Who is calling and under which tenant scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceContext {
    pub user_id: UserId,
    pub workspace_type: WorkspaceType,
    pub company_id: Option<CompanyId>,
    pub factory_id: Option<FactoryId>,
}

impl WorkspaceContext {
    pub fn personal(user_id: UserId) -> Self {
        Self {
            user_id,
            workspace_type: WorkspaceType::Personal,
            company_id: None,
            factory_id: None,
        }
    }

    pub fn enterprise(user_id: UserId, company_id: CompanyId, factory_id: Option<FactoryId>) -> Self {
        Self {
            user_id,
            workspace_type: WorkspaceType::Enterprise,
            company_id: Some(company_id),
            factory_id,
        }
    }

    /// Enterprise contexts must name a company; personal contexts never carry one.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.workspace_type, self.company_id) {
            (WorkspaceType::Enterprise, None) => Err(ValidationError::MissingCompany),
            _ => Ok(()),
        }
    }

    /// The company an instance created under this context belongs to.
    pub fn scope_company(&self) -> Option<CompanyId> {
        match self.workspace_type {
            WorkspaceType::Enterprise => self.company_id,
            WorkspaceType::Personal => None,
        }
    }

    pub fn scope_factory(&self) -> Option<FactoryId> {
        match self.workspace_type {
            WorkspaceType::Enterprise => self.factory_id,
            WorkspaceType::Personal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enterprise_without_company_is_rejected() {
        let ctx = WorkspaceContext {
            user_id: 1,
            workspace_type: WorkspaceType::Enterprise,
            company_id: None,
            factory_id: None,
        };
        assert_eq!(ctx.validate(), Err(ValidationError::MissingCompany));
    }

    #[test]
    fn personal_scope_ignores_stray_company() {
        let ctx = WorkspaceContext {
            company_id: Some(9),
            factory_id: Some(3),
            ..WorkspaceContext::personal(1)
        };
        assert!(ctx.validate().is_ok());
        assert_eq!(ctx.scope_company(), None);
        assert_eq!(ctx.scope_factory(), None);
    }
}
