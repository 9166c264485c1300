use std::collections::BTreeMap;

use serde::Serialize;
use turbopath::RelativeUnixPathBuf;

use crate::{run::global_hash::GlobalHashableInputs, turbo_json::Pipeline};

/// The workspace-root fingerprint as it appears in summaries: the hashed
/// root files, the lockfile hash, the cache key, and the pipeline that
/// produced the graph.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary<'a> {
    pub global_file_hash_map: BTreeMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: &'a str,
    pub global_cache_key: &'a str,
    pub pipeline: &'a Pipeline,
}

impl<'a> GlobalHashSummary<'a> {
    pub fn new(global_hash_inputs: &'a GlobalHashableInputs, pipeline: &'a Pipeline) -> Self {
        Self {
            global_file_hash_map: global_hash_inputs
                .global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.clone(), hash.clone()))
                .collect(),
            root_external_deps_hash: global_hash_inputs
                .root_external_deps_hash
                .as_deref()
                .unwrap_or_default(),
            global_cache_key: &global_hash_inputs.global_cache_key,
            pipeline,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_summary_key_shape() {
        let inputs = GlobalHashableInputs {
            global_cache_key: "key".to_string(),
            root_external_deps_hash: Some("lockfilehash".to_string()),
            ..Default::default()
        };
        let pipeline = Pipeline::default();
        let summary = GlobalHashSummary::new(&inputs, &pipeline);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "globalFileHashMap": {},
                "rootExternalDepsHash": "lockfilehash",
                "globalCacheKey": "key",
                "pipeline": {},
            })
        );
    }
}
