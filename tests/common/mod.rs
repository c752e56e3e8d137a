//! Shared test backend for engine and facade tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use confsync::{BackendError, ChangeEvent, KvBackend, NodeState, WatchOutcome};

/// In-memory `KvBackend` with a scripted sequence of watch outcomes
/// per path. Once a path's script runs dry the watch parks forever,
/// like a quiet remote store.
pub struct ScriptedBackend {
    store: Mutex<BTreeMap<String, String>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<WatchOutcome, BackendError>>>>,
    watch_polls: AtomicUsize,
    list_size_supported: bool,
    fail_reads: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(BTreeMap::new()),
            scripts: Mutex::new(HashMap::new()),
            watch_polls: AtomicUsize::new(0),
            list_size_supported: true,
            fail_reads: false,
        }
    }

    pub fn with_entry(self, path: &str, value: &str) -> Self {
        self.store
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        self
    }

    pub fn without_list_support(mut self) -> Self {
        self.list_size_supported = false;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Queue the outcomes one watch on `path` will observe, in order.
    pub fn script_watch(&self, path: &str, outcomes: Vec<Result<WatchOutcome, BackendError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(path.to_string(), outcomes.into());
    }

    /// How many blocking watch calls started so far.
    pub fn watch_polls(&self) -> usize {
        self.watch_polls.load(Ordering::SeqCst)
    }

    pub fn stored(&self, path: &str) -> Option<String> {
        self.store.lock().unwrap().get(path).cloned()
    }
}

#[async_trait::async_trait]
impl KvBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn read(&self, path: &str) -> Result<Option<String>, BackendError> {
        if self.fail_reads {
            return Err(BackendError::Unavailable("scripted outage".to_string()));
        }
        Ok(self.store.lock().unwrap().get(path).cloned())
    }

    async fn write(&self, path: &str, value: &str) -> Result<(), BackendError> {
        self.store
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, BackendError> {
        let prefix = format!("{path}/");
        let store = self.store.lock().unwrap();
        let mut children: Vec<String> = store
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        children.dedup();
        Ok(children)
    }

    async fn blocking_watch(
        &self,
        path: &str,
        _resume_token: u64,
    ) -> Result<WatchOutcome, BackendError> {
        self.watch_polls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        match next {
            Some(outcome) => outcome,
            // Script exhausted: block until the engine is shut down.
            None => std::future::pending().await,
        }
    }

    fn supports_list_size(&self) -> bool {
        self.list_size_supported
    }
}

pub fn present(path: &str, value: &str, token: u64) -> Result<WatchOutcome, BackendError> {
    Ok(WatchOutcome::Changed(ChangeEvent {
        path: path.to_string(),
        state: NodeState::Present(value.to_string()),
        resume_token: token,
    }))
}

pub fn absent(path: &str, token: u64) -> Result<WatchOutcome, BackendError> {
    Ok(WatchOutcome::Changed(ChangeEvent {
        path: path.to_string(),
        state: NodeState::Absent,
        resume_token: token,
    }))
}

pub fn unchanged(token: u64) -> Result<WatchOutcome, BackendError> {
    Ok(WatchOutcome::Unchanged { token })
}

pub fn unavailable() -> Result<WatchOutcome, BackendError> {
    Err(BackendError::Unavailable("scripted outage".to_string()))
}

pub fn protocol_error() -> Result<WatchOutcome, BackendError> {
    Err(BackendError::Protocol("scripted garbage".to_string()))
}

pub fn fatal() -> Result<WatchOutcome, BackendError> {
    Err(BackendError::Fatal("scripted session loss".to_string()))
}
