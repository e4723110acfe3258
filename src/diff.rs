use serde_json::Value;

use crate::types::ParamMap;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamChange {
    pub key: String,
    /// `None` when the key is new.
    pub old: Option<Value>,
    /// `None` when the key disappeared.
    pub new: Option<Value>,
}

pub(crate) fn diff_params(previous: &ParamMap, current: &ParamMap) -> Vec<ParamChange> {
    let mut changes: Vec<ParamChange> = current
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| ParamChange {
            key: key.clone(),
            old: previous.get(key).cloned(),
            new: Some(value.clone()),
        })
        .collect();

    changes.extend(
        previous
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(key, value)| ParamChange {
                key: key.clone(),
                old: Some(value.clone()),
                new: None,
            }),
    );
    changes
}
