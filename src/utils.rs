//! Storage helpers: big-endian keys, the CBOR record codec and transaction aborts
use crate::error::ApprovalError;
use crate::types::DocumentType;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, ApprovalError>;

/// Keys sort numerically because integers are stored big-endian.
pub fn id_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn pair_key(first: u64, second: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&first.to_be_bytes());
    key.extend_from_slice(&second.to_be_bytes());
    key
}

/// Key of the active-instance index for one document.
pub fn document_key(document_type: DocumentType, document_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(document_type.tag());
    key.extend_from_slice(&document_id.to_be_bytes());
    key
}

/// Reads the trailing big-endian id of a key.
pub fn trailing_id(key: &[u8]) -> Option<u64> {
    let start = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[start..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, ApprovalError> {
    minicbor::to_vec(value).map_err(|e| ApprovalError::Codec(e.to_string()))
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, ApprovalError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| ApprovalError::Codec(e.to_string()))
}

/// Turns an engine error into a transaction abort so `?` works inside
/// transaction closures.
pub(crate) trait OrAbort<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T, E: Into<ApprovalError>> OrAbort<T> for Result<T, E> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(|e| ConflictableTransactionError::Abort(e.into()))
    }
}

pub(crate) fn abort<T>(error: impl Into<ApprovalError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(error.into()))
}

/// Fresh id from the database counter. `Db::generate_id` must not be called
/// while a transaction is running on the same thread.
pub(crate) fn fresh_id(tree: &TransactionalTree) -> TxResult<u64> {
    Ok(tree.generate_id()?)
}
