//! One-line JSON dumps of frontend state, for the CLI's periodic status
//! output and for eyeballing a running node.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{StoreMap, Value};

/// A point-in-time view of one frontend. Keys are rendered lossily as UTF-8;
/// entries are sorted so successive dumps diff cleanly.
#[derive(Debug, Serialize)]
pub struct StoreDump {
    pub topic: String,
    pub sequence: u64,
    /// Present only for replicas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronized: Option<bool>,
    pub entries: BTreeMap<String, Value>,
}

impl StoreDump {
    pub fn new(topic: &str, store: &StoreMap, sequence: u64, synchronized: Option<bool>) -> Self {
        let entries = store
            .iter()
            .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), *v))
            .collect();
        StoreDump { topic: topic.to_string(), sequence, synchronized, entries }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_renders_sorted_entries() {
        let mut store = StoreMap::default();
        store.insert(b"b".to_vec(), 2);
        store.insert(b"a".to_vec(), 1);

        let dump = StoreDump::new("t", &store, 5, None);
        assert_eq!(dump.to_json(), r#"{"topic":"t","sequence":5,"entries":{"a":1,"b":2}}"#);
    }

    #[test]
    fn dump_includes_replica_sync_flag() {
        let dump = StoreDump::new("t", &StoreMap::default(), 0, Some(false));
        assert_eq!(
            dump.to_json(),
            r#"{"topic":"t","sequence":0,"synchronized":false,"entries":{}}"#
        );
    }
}
