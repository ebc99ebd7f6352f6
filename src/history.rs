//! Append-only audit log of accepted approval actions.
//!
//! Rows are keyed `instance_id ++ row_id` so a prefix scan returns an
//! instance's history in insertion order. Rows are only ever written inside the
//! same transaction that mutates the instance.
use crate::error::ApprovalError;
use crate::types::{StepOrder, TimeStamp, UserId};
use crate::utils::{self, OrAbort, TxResult};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionalTree;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "snake_case")]
#[cbor(index_only)]
pub enum HistoryAction {
    #[n(0)]
    Submit,
    #[n(1)]
    Approve,
    #[n(2)]
    Reject,
    #[n(3)]
    Delegate,
    #[n(4)]
    Comment,
    #[n(5)]
    Cancel,
    #[n(6)]
    Reassign,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalHistory {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub instance_id: u64,
    #[n(2)]
    pub step_order: StepOrder,
    #[n(3)]
    pub step_name: String,
    #[n(4)]
    pub action: HistoryAction,
    #[n(5)]
    pub actor_id: UserId,
    #[n(6)]
    pub comment: Option<String>,
    #[n(7)]
    pub delegate_to: Option<UserId>,
    #[n(8)]
    pub acted_at: TimeStamp,
}

impl ApprovalHistory {
    fn key(&self) -> Vec<u8> {
        utils::pair_key(self.instance_id, self.id)
    }

    pub(crate) fn append(&self, tree: &TransactionalTree) -> TxResult<()> {
        let bytes = utils::encode(self).or_abort()?;
        tree.insert(self.key(), bytes)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct HistoryLog {
    tree: sled::Tree,
}

impl HistoryLog {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    pub fn list(&self, instance_id: u64) -> Result<Vec<ApprovalHistory>, ApprovalError> {
        self.tree
            .scan_prefix(utils::id_key(instance_id))
            .map(|entry| {
                let (_, bytes) = entry?;
                utils::decode(&bytes)
            })
            .collect()
    }

    pub fn count(&self, instance_id: u64) -> usize {
        self.tree.scan_prefix(utils::id_key(instance_id)).count()
    }
}
