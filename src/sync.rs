//! Reconnect resync: state-vector diff encoding.
//!
//! A reconnecting client reports the state vector of its local replica;
//! the hub answers with exactly the updates the client is missing. The
//! diff is idempotent and commutes with any concurrent client-side edits
//! the client has not yet reported, so it is always safe to apply.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

/// Encode the full document state as a single update.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Encode the updates a replica at `client_state_vector` is missing.
///
/// An absent or malformed vector falls back to the full state, which is
/// safe for the same reason the diff is: applying already-known updates is
/// a no-op.
pub fn encode_diff(doc: &Doc, client_state_vector: Option<&[u8]>) -> Vec<u8> {
    let txn = doc.transact();
    match client_state_vector.and_then(|sv| StateVector::decode_v1(sv).ok()) {
        Some(sv) => txn.encode_diff_v1(&sv),
        None => txn.encode_state_as_update_v1(&StateVector::default()),
    }
}

/// Encode the current state vector of a document.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}
