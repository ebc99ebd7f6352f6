//! Interfaces of the systems the engine consumes facts from or reports to.
//!
//! The company/role service and the document service are owned elsewhere. The
//! engine only reads membership facts through [`CompanyDirectory`] and reports
//! terminal outcomes through [`DocumentStatusCallback`].
use crate::types::{CompanyId, DocumentType, RoleId, UserId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Read-only membership facts from the company/role service.
pub trait CompanyDirectory: Send + Sync {
    fn list_active_employees_with_role(&self, company_id: CompanyId, role_id: RoleId) -> Vec<UserId>;
    fn is_active_employee(&self, company_id: CompanyId, user_id: UserId) -> bool;
    fn is_company_admin(&self, company_id: CompanyId, user_id: UserId) -> bool;
    fn list_company_admins(&self, company_id: CompanyId) -> Vec<UserId>;
    fn is_system_admin(&self, user_id: UserId) -> bool;
    fn role_exists(&self, company_id: CompanyId, role_id: RoleId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Cancelled,
}

/// Invoked once an instance reaches a terminal state, after the decision is committed.
pub trait DocumentStatusCallback: Send + Sync {
    fn on_approval_resolved(&self, document_type: DocumentType, document_id: u64, outcome: ApprovalOutcome);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub user_id: UserId,
    #[serde(default = "active_default")]
    pub active: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

fn active_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_id: CompanyId,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub employees: Vec<EmployeeRecord>,
}

/// Serializable directory contents, also the format of the JSON directory file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub system_admins: Vec<UserId>,
    #[serde(default)]
    pub companies: Vec<CompanyRecord>,
}

/// Directory held in memory. Used by the binary (loaded from JSON) and by tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    inner: RwLock<DirectorySnapshot>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let snapshot: DirectorySnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn read<T>(&self, f: impl FnOnce(&DirectorySnapshot) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut DirectorySnapshot) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn employee<'a>(
        snapshot: &'a DirectorySnapshot,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Option<&'a EmployeeRecord> {
        snapshot
            .companies
            .iter()
            .find(|c| c.company_id == company_id)
            .and_then(|c| c.employees.iter().find(|e| e.user_id == user_id))
    }

    /// Adds (or reactivates) an employee with the given roles. Unknown roles are registered.
    pub fn add_employee(&self, company_id: CompanyId, user_id: UserId, roles: &[RoleId]) {
        self.write(|snapshot| {
            let company = match snapshot.companies.iter().position(|c| c.company_id == company_id) {
                Some(idx) => &mut snapshot.companies[idx],
                None => {
                    snapshot.companies.push(CompanyRecord {
                        company_id,
                        ..Default::default()
                    });
                    let last = snapshot.companies.len() - 1;
                    &mut snapshot.companies[last]
                }
            };
            for role in roles {
                if !company.roles.contains(role) {
                    company.roles.push(*role);
                }
            }
            match company.employees.iter_mut().find(|e| e.user_id == user_id) {
                Some(existing) => {
                    existing.active = true;
                    for role in roles {
                        if !existing.roles.contains(role) {
                            existing.roles.push(*role);
                        }
                    }
                }
                None => company.employees.push(EmployeeRecord {
                    user_id,
                    active: true,
                    is_admin: false,
                    roles: roles.to_vec(),
                }),
            }
        });
    }

    pub fn set_active(&self, company_id: CompanyId, user_id: UserId, active: bool) {
        self.write(|snapshot| {
            if let Some(emp) = snapshot
                .companies
                .iter_mut()
                .filter(|c| c.company_id == company_id)
                .flat_map(|c| c.employees.iter_mut())
                .find(|e| e.user_id == user_id)
            {
                emp.active = active;
            }
        });
    }

    pub fn set_admin(&self, company_id: CompanyId, user_id: UserId, is_admin: bool) {
        self.add_employee(company_id, user_id, &[]);
        self.write(|snapshot| {
            if let Some(emp) = snapshot
                .companies
                .iter_mut()
                .filter(|c| c.company_id == company_id)
                .flat_map(|c| c.employees.iter_mut())
                .find(|e| e.user_id == user_id)
            {
                emp.is_admin = is_admin;
            }
        });
    }

    pub fn add_system_admin(&self, user_id: UserId) {
        self.write(|snapshot| {
            if !snapshot.system_admins.contains(&user_id) {
                snapshot.system_admins.push(user_id);
            }
        });
    }
}

impl CompanyDirectory for InMemoryDirectory {
    fn list_active_employees_with_role(&self, company_id: CompanyId, role_id: RoleId) -> Vec<UserId> {
        self.read(|snapshot| {
            snapshot
                .companies
                .iter()
                .filter(|c| c.company_id == company_id)
                .flat_map(|c| c.employees.iter())
                .filter(|e| e.active && e.roles.contains(&role_id))
                .map(|e| e.user_id)
                .collect()
        })
    }

    fn is_active_employee(&self, company_id: CompanyId, user_id: UserId) -> bool {
        self.read(|snapshot| Self::employee(snapshot, company_id, user_id).is_some_and(|e| e.active))
    }

    fn is_company_admin(&self, company_id: CompanyId, user_id: UserId) -> bool {
        self.read(|snapshot| {
            Self::employee(snapshot, company_id, user_id).is_some_and(|e| e.active && e.is_admin)
        })
    }

    fn list_company_admins(&self, company_id: CompanyId) -> Vec<UserId> {
        self.read(|snapshot| {
            snapshot
                .companies
                .iter()
                .filter(|c| c.company_id == company_id)
                .flat_map(|c| c.employees.iter())
                .filter(|e| e.active && e.is_admin)
                .map(|e| e.user_id)
                .collect()
        })
    }

    fn is_system_admin(&self, user_id: UserId) -> bool {
        self.read(|snapshot| snapshot.system_admins.contains(&user_id))
    }

    fn role_exists(&self, company_id: CompanyId, role_id: RoleId) -> bool {
        self.read(|snapshot| {
            snapshot
                .companies
                .iter()
                .any(|c| c.company_id == company_id && c.roles.contains(&role_id))
        })
    }
}

/// Reports outcomes to the log only; the document service is not part of this binary.
#[derive(Debug, Default)]
pub struct LoggingCallback;

impl DocumentStatusCallback for LoggingCallback {
    fn on_approval_resolved(&self, document_type: DocumentType, document_id: u64, outcome: ApprovalOutcome) {
        tracing::info!(
            document_type = %document_type,
            document_id,
            outcome = ?outcome,
            "Approval resolved"
        );
    }
}

/// Keeps every callback invocation, in order.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    calls: Mutex<Vec<(DocumentType, u64, ApprovalOutcome)>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(DocumentType, u64, ApprovalOutcome)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DocumentStatusCallback for RecordingCallback {
    fn on_approval_resolved(&self, document_type: DocumentType, document_id: u64, outcome: ApprovalOutcome) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((document_type, document_id, outcome));
    }
}
