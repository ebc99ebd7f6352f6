//! Persistence and lookup of workflow definitions.
//!
//! Definitions live in the `definitions` tree keyed by id. The
//! `definition_codes` tree reserves `(scope, document_type, code)` triples and
//! holds one marker per document type for the active system-wide default, so
//! both uniqueness rules are enforced inside the creating transaction.
use crate::definition::{NewWorkflowDefinition, StepDefinition, WorkflowDefinition, validate_steps};
use crate::error::{ApprovalError, ValidationError};
use crate::resolver::StepResolver;
use crate::types::{CompanyId, DocumentType, TimeStamp};
use crate::utils::{self, OrAbort, TxResult, abort};
use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::info;

const CODE_PREFIX: u8 = b'c';
const DEFAULT_PREFIX: u8 = b'd';

fn code_key(company_id: Option<CompanyId>, document_type: DocumentType, code: &str) -> Vec<u8> {
    let mut key = vec![CODE_PREFIX];
    match company_id {
        Some(company) => {
            key.push(1);
            key.extend_from_slice(&company.to_be_bytes());
        }
        None => key.push(0),
    }
    key.push(document_type.tag());
    key.extend_from_slice(code.as_bytes());
    key
}

fn default_key(document_type: DocumentType) -> Vec<u8> {
    vec![DEFAULT_PREFIX, document_type.tag()]
}

#[derive(Clone)]
pub struct WorkflowDefinitionStore {
    db: sled::Db,
    definitions: sled::Tree,
    codes: sled::Tree,
    resolver: StepResolver,
}

impl WorkflowDefinitionStore {
    pub fn open(db: &sled::Db, resolver: StepResolver) -> Result<Self, ApprovalError> {
        Ok(Self {
            db: db.clone(),
            definitions: db.open_tree("definitions")?,
            codes: db.open_tree("definition_codes")?,
            resolver,
        })
    }

    fn validate_rules(&self, steps: &[StepDefinition], company_id: Option<CompanyId>) -> Result<(), ApprovalError> {
        steps
            .iter()
            .try_for_each(|step| self.resolver.validate_rule(&step.approvers, company_id))
    }

    pub fn create(&self, draft: NewWorkflowDefinition) -> Result<WorkflowDefinition, ApprovalError> {
        let steps = draft.validate_and_finalise()?;
        self.validate_rules(&steps, draft.company_id)?;

        let now = TimeStamp::now();
        let definition = WorkflowDefinition {
            id: self.db.generate_id()?,
            name: draft.name.trim().to_string(),
            code: draft.code.trim().to_string(),
            document_type: draft.document_type,
            company_id: draft.company_id,
            is_active: true,
            is_default: draft.is_default,
            steps,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let bytes = utils::encode(&definition)?;

        (&self.definitions, &self.codes).transaction(|(definitions, codes)| -> TxResult<()> {
            let code = code_key(definition.company_id, definition.document_type, &definition.code);
            if codes.get(&code)?.is_some() {
                return abort(ValidationError::DuplicateCode {
                    code: definition.code.clone(),
                    document_type: definition.document_type,
                });
            }
            if definition.is_system_wide() && definition.is_default {
                let marker = default_key(definition.document_type);
                if codes.get(&marker)?.is_some() {
                    return abort(ValidationError::DuplicateSystemDefault(definition.document_type));
                }
                codes.insert(marker, utils::id_key(definition.id))?;
            }
            codes.insert(code, utils::id_key(definition.id))?;
            definitions.insert(utils::id_key(definition.id), bytes.clone())?;
            Ok(())
        })?;

        info!(
            workflow_id = definition.id,
            code = %definition.code,
            document_type = %definition.document_type,
            company_id = ?definition.company_id,
            steps = definition.steps.len(),
            "Workflow definition created"
        );
        Ok(definition)
    }

    pub fn get(&self, id: u64) -> Result<WorkflowDefinition, ApprovalError> {
        match self.definitions.get(utils::id_key(id))? {
            Some(bytes) => utils::decode(&bytes),
            None => Err(ApprovalError::WorkflowNotFound(id)),
        }
    }

    /// System-wide definitions plus, when given, those owned by `company_id`.
    pub fn list(&self, company_id: Option<CompanyId>) -> Result<Vec<WorkflowDefinition>, ApprovalError> {
        let mut all = Vec::new();
        for entry in self.definitions.iter() {
            let (_, bytes) = entry?;
            let definition: WorkflowDefinition = utils::decode(&bytes)?;
            if definition.company_id.is_none() || definition.company_id == company_id {
                all.push(definition);
            }
        }
        Ok(all)
    }

    /// Replaces the steps of a definition and bumps its version. Instances
    /// already created keep the steps they snapshotted.
    pub fn update_steps(&self, id: u64, steps: Vec<StepDefinition>) -> Result<WorkflowDefinition, ApprovalError> {
        let steps = validate_steps(&steps)?;
        let current = self.get(id)?;
        self.validate_rules(&steps, current.company_id)?;

        let updated = self.modify(id, |definition| {
            definition.steps = steps.clone();
            definition.version += 1;
            Ok(())
        })?;
        info!(workflow_id = id, version = updated.version, "Workflow steps updated");
        Ok(updated)
    }

    pub fn deactivate(&self, id: u64) -> Result<WorkflowDefinition, ApprovalError> {
        let updated = self.modify(id, |definition| {
            definition.is_active = false;
            Ok(())
        })?;
        info!(workflow_id = id, "Workflow definition deactivated");
        Ok(updated)
    }

    fn modify(
        &self,
        id: u64,
        change: impl Fn(&mut WorkflowDefinition) -> Result<(), ApprovalError>,
    ) -> Result<WorkflowDefinition, ApprovalError> {
        let updated = (&self.definitions, &self.codes).transaction(|(definitions, codes)| -> TxResult<WorkflowDefinition> {
            let mut definition = load(definitions, id)?;
            change(&mut definition).or_abort()?;
            definition.updated_at = TimeStamp::now();
            if !definition.is_active && definition.is_system_wide() && definition.is_default {
                release_default_marker(codes, &definition)?;
            }
            definitions.insert(utils::id_key(id), utils::encode(&definition).or_abort()?)?;
            Ok(definition)
        })?;
        Ok(updated)
    }

    /// Picks the definition a new submission runs through.
    ///
    /// A company's own active definitions win over system-wide ones; among
    /// several, the one marked default wins, then the lowest id.
    pub fn resolve_applicable(
        &self,
        document_type: DocumentType,
        company_id: Option<CompanyId>,
    ) -> Result<WorkflowDefinition, ApprovalError> {
        let candidates: Vec<WorkflowDefinition> = self
            .list(company_id)?
            .into_iter()
            .filter(|d| d.is_active && d.document_type == document_type)
            .collect();

        let company_owned = candidates
            .iter()
            .filter(|d| company_id.is_some() && d.company_id == company_id)
            .min_by_key(|d| (!d.is_default, d.id));
        if let Some(definition) = company_owned {
            return Ok(definition.clone());
        }

        candidates
            .into_iter()
            .filter(|d| d.is_system_wide() && d.is_default)
            .min_by_key(|d| d.id)
            .ok_or(ApprovalError::NoWorkflowConfigured {
                document_type,
                company_id,
            })
    }
}

fn load(tree: &TransactionalTree, id: u64) -> TxResult<WorkflowDefinition> {
    match tree.get(utils::id_key(id))? {
        Some(bytes) => utils::decode(&bytes).or_abort(),
        None => abort(ApprovalError::WorkflowNotFound(id)),
    }
}

fn release_default_marker(codes: &TransactionalTree, definition: &WorkflowDefinition) -> TxResult<()> {
    let marker = default_key(definition.document_type);
    let owned_by_this = codes
        .get(&marker)?
        .and_then(|bytes| utils::trailing_id(&bytes))
        .is_some_and(|owner| owner == definition.id);
    if owned_by_this {
        codes.remove(marker)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryDirectory;
    use crate::definition::ApproverRule;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open() -> anyhow::Result<(tempfile::TempDir, Arc<InMemoryDirectory>, WorkflowDefinitionStore)> {
        let dir = tempdir()?;
        let db = sled::open(dir.path())?;
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_employee(1, 10, &[5]);
        let store = WorkflowDefinitionStore::open(&db, StepResolver::new(directory.clone()))?;
        Ok((dir, directory, store))
    }

    fn draft(code: &str) -> NewWorkflowDefinition {
        NewWorkflowDefinition::new("Review", code, DocumentType::Wps)
            .step(StepDefinition::new("Check", ApproverRule::Users(vec![10])))
    }

    #[test]
    fn code_is_unique_per_scope() -> anyhow::Result<()> {
        let (_tmp, _dir, store) = open()?;
        store.create(draft("std"))?;
        let err = store.create(draft("std")).unwrap_err();
        assert_eq!(err.kind(), "validation");

        // same code under a company scope is fine
        store.create(draft("std").for_company(1))?;
        Ok(())
    }

    #[test]
    fn only_one_active_system_default() -> anyhow::Result<()> {
        let (_tmp, _dir, store) = open()?;
        let first = store.create(draft("a").set_default(true))?;
        assert!(matches!(
            store.create(draft("b").set_default(true)),
            Err(ApprovalError::Validation(ValidationError::DuplicateSystemDefault(DocumentType::Wps)))
        ));

        store.deactivate(first.id)?;
        store.create(draft("b").set_default(true))?;
        Ok(())
    }

    #[test]
    fn company_definition_wins_over_system_default() -> anyhow::Result<()> {
        let (_tmp, _dir, store) = open()?;
        let system = store.create(draft("sys").set_default(true))?;
        assert_eq!(store.resolve_applicable(DocumentType::Wps, Some(1))?.id, system.id);

        let own = store.create(draft("own").for_company(1))?;
        assert_eq!(store.resolve_applicable(DocumentType::Wps, Some(1))?.id, own.id);
        assert_eq!(store.resolve_applicable(DocumentType::Wps, Some(2))?.id, system.id);
        assert_eq!(store.resolve_applicable(DocumentType::Wps, None)?.id, system.id);

        assert!(matches!(
            store.resolve_applicable(DocumentType::Pqr, Some(1)),
            Err(ApprovalError::NoWorkflowConfigured { .. })
        ));
        Ok(())
    }

    #[test]
    fn company_rules_must_name_known_approvers() -> anyhow::Result<()> {
        let (_tmp, _dir, store) = open()?;
        let bad = NewWorkflowDefinition::new("Review", "x", DocumentType::Pqr)
            .for_company(1)
            .step(StepDefinition::new("Check", ApproverRule::Role(vec![99])));
        assert!(matches!(store.create(bad), Err(ApprovalError::InvalidApprover(_))));
        Ok(())
    }

    #[test]
    fn updating_steps_bumps_version() -> anyhow::Result<()> {
        let (_tmp, _dir, store) = open()?;
        let def = store.create(draft("std"))?;
        let updated = store.update_steps(
            def.id,
            vec![
                StepDefinition::new("One", ApproverRule::Users(vec![1])).set_order(0),
                StepDefinition::new("Two", ApproverRule::Users(vec![2])).set_order(1),
            ],
        )?;
        assert_eq!(updated.version, 2);
        assert_eq!(store.get(def.id)?.steps.len(), 2);
        assert!(matches!(store.get(404), Err(ApprovalError::WorkflowNotFound(404))));
        Ok(())
    }
}
