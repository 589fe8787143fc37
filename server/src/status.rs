//! Status broadcast helpers.
//!
//! Every UI-bound state message is wrapped as `{"status": {section: body}}`.
//! Sections that change often (modems) are sent as per-entry, per-field
//! deltas against what was last broadcast.

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Map, Value};

pub fn envelope(section: &str, body: Value) -> Value {
    json!({ "status": { section: body } })
}

/// Remembers the last broadcast object per entry id and produces deltas.
#[derive(Debug, Default)]
pub struct FieldDiff {
    last: BTreeMap<String, Map<String, Value>>,
    forced: HashSet<(String, String)>,
}

impl FieldDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include `field` of `id` in the next delta even if unchanged.
    pub fn force(&mut self, id: &str, field: &str) {
        self.forced.insert((id.to_string(), field.to_string()));
    }

    /// Delta between the last broadcast and `current` (id → object).
    ///
    /// Entries that disappeared are reported as `{"removed": true}`. Returns
    /// `None` when there is nothing to send.
    pub fn diff(&mut self, current: &BTreeMap<String, Map<String, Value>>) -> Option<Value> {
        let mut out = Map::new();

        for (id, fields) in current {
            let previous = self.last.get(id);
            let changed: Map<String, Value> = fields
                .iter()
                .filter(|(key, value)| {
                    previous.and_then(|p| p.get(*key)) != Some(*value)
                        || self.forced.contains(&(id.clone(), (*key).clone()))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !changed.is_empty() {
                out.insert(id.clone(), Value::Object(changed));
            }
        }
        for id in self.last.keys().filter(|id| !current.contains_key(*id)) {
            out.insert(id.clone(), json!({ "removed": true }));
        }

        self.last.clone_from(current);
        self.forced.clear();
        (!out.is_empty()).then_some(Value::Object(out))
    }
}
