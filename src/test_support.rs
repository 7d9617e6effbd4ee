use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use serde_json::Map;

use crate::{
    classifier::{ChatClient, ChatRequest, LlmError},
    record::{DiffRevision, FirstVersion, RevisionRecord},
};

pub mod prelude {
    pub(crate) use super::proptest as proptest_support;
    pub(crate) use super::{
        diff_record, first_version_record, write_revision_file, ScriptedClient,
    };
    pub(crate) use proptest::prelude::*;
}

type Responder = dyn Fn(&str) -> Result<String, LlmError> + Send + Sync;

/// In-memory [`ChatClient`] that answers from a closure and records every request.
pub struct ScriptedClient {
    respond: Box<Responder>,
    requests: Mutex<Vec<(Option<String>, String)>>,
}

impl ScriptedClient {
    pub fn new(
        respond: impl Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with the prompt itself.
    pub fn echo() -> Self {
        Self::new(|prompt| Ok(prompt.to_string()))
    }

    pub fn failing(err: LlmError) -> Self {
        Self::new(move |_| Err(err.clone()))
    }

    /// Fails the first `failures` requests with `err`, then echoes.
    pub fn flaky(failures: usize, err: LlmError) -> Self {
        let calls = AtomicUsize::new(0);
        Self::new(move |prompt| {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(err.clone())
            } else {
                Ok(prompt.to_string())
            }
        })
    }

    /// `(system, prompt)` of every request so far, in the order they arrived.
    pub fn requests(&self) -> Vec<(Option<String>, String)> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatClient for ScriptedClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push((
            request.system.map(str::to_string),
            request.prompt.to_string(),
        ));
        (self.respond)(request.prompt)
    }
}

pub fn diff_record(diff: &str) -> RevisionRecord {
    RevisionRecord::Diff(DiffRevision {
        timestamp: None,
        user: Some("Dummy".into()),
        comment: None,
        diff: Some(diff.to_string()),
        decomposition: None,
        extra: Map::new(),
    })
}

pub fn first_version_record(content: &str) -> RevisionRecord {
    RevisionRecord::FirstVersion(FirstVersion {
        content: Some(content.to_string()),
        extra: Map::new(),
    })
}

/// Write `records` as a JSON-lines file `dir/name` and return its path.
pub fn write_revision_file(dir: &Path, name: &str, records: &[RevisionRecord]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = Vec::new();
    crate::record::write_jsonl(&mut contents, records).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

pub mod proptest {
    use proptest::prelude::*;

    /// A single line as it may appear inside a unified diff body.
    pub fn diff_line() -> impl Strategy<Value = String> {
        let words = "[a-z]{1,6}( [a-z]{1,6}){0,5}";
        prop_oneof![
            words.prop_map(|text| format!("-{text}")),
            words.prop_map(|text| format!("+{text}")),
            words.prop_map(|text| format!(" {text}")),
            (1..50u32, 1..50u32).prop_map(|(a, b)| format!("@@ -{a},3 +{b},4 @@")),
            Just("---".to_string()),
            Just("+++".to_string()),
        ]
    }

    pub fn unified_diff() -> impl Strategy<Value = String> {
        proptest::collection::vec(diff_line(), 0..30).prop_map(|lines| lines.join("\n"))
    }
}
