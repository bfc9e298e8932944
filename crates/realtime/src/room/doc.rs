// Scene document: the yrs CRDT a room merges client edits into.
//
// yrs keeps every insertion as an immutable block addressed by
// `(client_id, clock)`, so merging is a pure union over two block stores plus
// state-vector bookkeeping. Same-position conflicts resolve by client id,
// identically on every replica.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Map, MapRef, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// v1 encoding of an update that carries no blocks and no deletions.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

#[derive(Debug, Error)]
pub enum DocError {
    #[error("invalid update encoding: {0}")]
    Decode(String),
    #[error("update could not be applied: {0}")]
    Apply(String),
    #[error("invalid state vector: {0}")]
    StateVector(String),
}

/// Server-side replica of one room's scene graph.
pub struct SceneDoc {
    doc: Doc,
}

impl SceneDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Deterministic client id, for tests that need reproducible tie-breaks.
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Seed from a persisted full-state snapshot.
    pub fn from_state(state: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new();
        doc.apply_update(state)?;
        Ok(doc)
    }

    /// Applies a v1 update and returns the part of it that actually changed
    /// this replica, or `None` when it was a duplicate. Updates whose
    /// dependencies are missing are held by yrs and show up in the delta of
    /// whichever later update completes them.
    pub fn apply_update(&self, update: &[u8]) -> Result<Option<Vec<u8>>, DocError> {
        let decoded = Update::decode_v1(update).map_err(|error| DocError::Decode(error.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded).map_err(|error| DocError::Apply(error.to_string()))?;
        let delta = txn.encode_update_v1();
        drop(txn);

        if is_empty_update(&delta) {
            Ok(None)
        } else {
            Ok(Some(delta))
        }
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|error| DocError::StateVector(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn get_or_insert_text(&self, name: &str) -> TextRef {
        self.doc.get_or_insert_text(name)
    }

    pub fn get_or_insert_map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    pub fn text_string(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }

    /// Local edit helper; returns the update it produced.
    pub fn insert_text(&self, name: &str, index: u32, content: &str) -> Vec<u8> {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
        txn.encode_update_v1()
    }

    /// Local edit helper; returns the update it produced.
    pub fn set_map_entry(&self, map: &str, key: &str, value: &str) -> Vec<u8> {
        let map = self.doc.get_or_insert_map(map);
        let mut txn = self.doc.transact_mut();
        map.insert(&mut txn, key.to_string(), value.to_string());
        txn.encode_update_v1()
    }

    pub fn map_entry(&self, map: &str, key: &str) -> Option<String> {
        let map = self.doc.get_or_insert_map(map);
        let txn = self.doc.transact();
        map.get(&txn, key).map(|value| value.to_string(&txn))
    }

    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for SceneDoc {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE_V1
}

/// Merges two encoded full states into one. Order of arguments does not
/// affect the resulting document.
pub fn merge_states(left: &[u8], right: &[u8]) -> Result<Vec<u8>, DocError> {
    let scratch = SceneDoc::new();
    scratch.apply_update(left)?;
    scratch.apply_update(right)?;
    Ok(scratch.encode_state())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_state_restores_content() {
        let doc = SceneDoc::new();
        doc.insert_text("scene", 0, "root node");
        let restored = SceneDoc::from_state(&doc.encode_state()).expect("state should load");
        assert_eq!(restored.text_string("scene"), "root node");
    }

    #[test]
    fn duplicate_update_has_no_effective_delta() {
        let author = SceneDoc::with_client_id(1);
        let update = author.insert_text("scene", 0, "hello");

        let server = SceneDoc::with_client_id(99);
        let first = server.apply_update(&update).expect("first apply");
        assert!(first.is_some());
        let second = server.apply_update(&update).expect("second apply");
        assert!(second.is_none());
        assert_eq!(server.text_string("scene"), "hello");
    }

    #[test]
    fn out_of_order_update_is_held_until_dependency_arrives() {
        let author = SceneDoc::with_client_id(1);
        let first = author.insert_text("scene", 0, "ab");
        let second = author.insert_text("scene", 2, "cd");

        let server = SceneDoc::with_client_id(99);
        assert!(server.apply_update(&second).expect("pending apply").is_none());
        assert_eq!(server.text_string("scene"), "");

        let delta = server.apply_update(&first).expect("apply").expect("delta");
        assert_eq!(server.text_string("scene"), "abcd");

        let peer = SceneDoc::with_client_id(2);
        peer.apply_update(&delta).expect("peer apply");
        assert_eq!(peer.text_string("scene"), "abcd");
    }

    #[test]
    fn diff_against_state_vector_catches_peer_up() {
        let server = SceneDoc::with_client_id(1);
        server.insert_text("scene", 0, "first");
        let client = SceneDoc::from_state(&server.encode_state()).expect("load");
        server.insert_text("scene", 5, " second");

        let diff = server.encode_diff(&client.encode_state_vector()).expect("diff");
        client.apply_update(&diff).expect("apply diff");
        assert_eq!(client.text_string("scene"), "first second");
    }

    #[test]
    fn merge_states_keeps_disjoint_edits_from_both_sides() {
        let left = SceneDoc::with_client_id(1);
        left.set_map_entry("nodes", "header", "Header");
        let right = SceneDoc::with_client_id(2);
        right.set_map_entry("nodes", "footer", "Footer");

        let merged = SceneDoc::from_state(
            &merge_states(&left.encode_state(), &right.encode_state()).expect("merge"),
        )
        .expect("load merged");
        assert_eq!(merged.map_entry("nodes", "header").as_deref(), Some("Header"));
        assert_eq!(merged.map_entry("nodes", "footer").as_deref(), Some("Footer"));
    }

    #[test]
    fn merge_states_is_commutative_and_idempotent() {
        let left = SceneDoc::with_client_id(1);
        left.insert_text("scene", 0, "left");
        let right = SceneDoc::with_client_id(2);
        right.insert_text("scene", 0, "right");
        let (a, b) = (left.encode_state(), right.encode_state());

        let ab = SceneDoc::from_state(&merge_states(&a, &b).expect("merge")).expect("load");
        let ba = SceneDoc::from_state(&merge_states(&b, &a).expect("merge")).expect("load");
        assert_eq!(ab.text_string("scene"), ba.text_string("scene"));

        let aa = SceneDoc::from_state(&merge_states(&a, &a).expect("merge")).expect("load");
        assert_eq!(aa.text_string("scene"), "left");
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let doc = SceneDoc::new();
        assert!(matches!(doc.apply_update(b"not a valid update"), Err(DocError::Decode(_))));
        assert!(SceneDoc::from_state(b"not a valid update").is_err());
        assert!(doc.encode_diff(b"\xff\xff\xff").is_err());
    }

    #[test]
    fn empty_document_state_is_an_empty_update() {
        assert!(is_empty_update(&SceneDoc::new().encode_state()));
    }
}
