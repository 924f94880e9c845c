//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mapred::coordinator::{Phase, WorkItem};
use mapred::shard::FileShard;
use mapred::worker::{
    MapTaskRequest, MapTaskResponse, ReduceTaskRequest, ReduceTaskResponse, WorkerError,
    WorkerProxy,
};

/// One call a [`MockWorker`] received
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub phase: Phase,
    pub task_id: usize,
    /// Map attempt directory; `None` for reduce calls
    pub output_dir: Option<PathBuf>,
}

/// Scriptable in-process worker
///
/// Successful map calls create their attempt directory with one marker file
/// once the configured delay has passed, the way a real worker leaves its
/// output behind.
pub struct MockWorker {
    address: String,
    delay: Duration,
    task_delays: HashMap<usize, Duration>,
    dies_on: Option<usize>,
    broken: bool,
    rejects_all: bool,
    transport_fails_on: HashSet<usize>,
    app_failures: Mutex<HashMap<usize, u32>>,
    alive: AtomicBool,
    calls: Mutex<Vec<Call>>,
}

impl MockWorker {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            delay: Duration::from_millis(1000),
            task_delays: HashMap::new(),
            dies_on: None,
            broken: false,
            rejects_all: false,
            transport_fails_on: HashSet::new(),
            app_failures: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn with_task_delay(mut self, task_id: usize, ms: u64) -> Self {
        self.task_delays.insert(task_id, Duration::from_millis(ms));
        self
    }

    /// The machine goes down on receiving `task_id`: the call never returns
    /// and probes fail from then on
    pub fn dies_on(mut self, task_id: usize) -> Self {
        self.dies_on = Some(task_id);
        self
    }

    /// Every call fails at the transport level
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    /// Every call completes but reports task failure
    pub fn rejects_all(mut self) -> Self {
        self.rejects_all = true;
        self
    }

    /// Calls for `task_id` fail at the transport level
    pub fn transport_fails_on(mut self, task_id: usize) -> Self {
        self.transport_fails_on.insert(task_id);
        self
    }

    /// Calls for `task_id` complete but report task failure
    pub fn app_fails_on(self, task_id: usize) -> Self {
        self.app_fails_times(task_id, u32::MAX)
    }

    /// The first `times` calls for `task_id` report task failure
    pub fn app_fails_times(self, task_id: usize, times: u32) -> Self {
        self.app_failures.lock().unwrap().insert(task_id, times);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn task_ids(&self, phase: Phase) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter(|c| c.phase == phase)
            .map(|c| c.task_id)
            .collect()
    }

    /// Common prologue of every call; `Err` means the call failed in transport
    async fn begin(&self, call: Call) -> Result<(), WorkerError> {
        let task_id = call.task_id;
        self.calls.lock().unwrap().push(call);

        if self.dies_on == Some(task_id) {
            self.kill();
        }
        if !self.alive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let delay = self.task_delays.get(&task_id).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        if self.broken || self.transport_fails_on.contains(&task_id) {
            return Err(WorkerError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }

    /// Whether this call should report task failure
    fn rejects(&self, task_id: usize) -> bool {
        if self.rejects_all {
            return true;
        }
        let mut failures = self.app_failures.lock().unwrap();
        match failures.get_mut(&task_id) {
            Some(left) if *left > 0 => {
                *left = left.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl WorkerProxy for MockWorker {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute_map(&self, request: MapTaskRequest) -> Result<MapTaskResponse, WorkerError> {
        self.begin(Call {
            phase: Phase::Map,
            task_id: request.task_id,
            output_dir: Some(request.output_dir.clone()),
        })
        .await?;

        if self.rejects(request.task_id) {
            return Ok(MapTaskResponse::failed("cannot open input"));
        }

        std::fs::create_dir_all(&request.output_dir).unwrap();
        let marker = request
            .output_dir
            .join(format!("mapper_{}_reducer_0.txt", request.task_id));
        std::fs::write(&marker, format!("{}, 1\n", self.address)).unwrap();
        Ok(MapTaskResponse::ok(vec![marker]))
    }

    async fn execute_reduce(
        &self,
        request: ReduceTaskRequest,
    ) -> Result<ReduceTaskResponse, WorkerError> {
        self.begin(Call {
            phase: Phase::Reduce,
            task_id: request.task_id,
            output_dir: None,
        })
        .await?;

        if self.rejects(request.task_id) {
            return Ok(ReduceTaskResponse::failed("bad record"));
        }
        Ok(ReduceTaskResponse::ok())
    }

    async fn probe(&self, _deadline: Duration) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// `n` map items whose attempt directories live under `root/<id>`
pub fn map_items(root: &Path, n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|id| WorkItem::map(id, FileShard::default(), 1, root.join(id.to_string())))
        .collect()
}

/// `n` reduce items writing to `output_dir`
pub fn reduce_items(n: usize, output_dir: &Path) -> Vec<WorkItem> {
    let inputs: Arc<[PathBuf]> = Arc::from(Vec::new());
    (0..n)
        .map(|id| WorkItem::reduce(id, inputs.clone(), output_dir.to_path_buf()))
        .collect()
}

/// Subdirectories of `dir`, sorted
pub fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Word counts the built-in task should produce for `text`
pub fn expected_word_counts(texts: &[&str]) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for text in texts {
        for word in text
            .split(|c: char| c.is_ascii_whitespace() || matches!(c, ',' | '.' | '"' | '\''))
            .filter(|w| !w.is_empty())
        {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Parse every `output_<r>.txt` in `dir` into a single map
pub fn read_word_counts(dir: &Path) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            let (key, value) = line.rsplit_once(' ').unwrap();
            let previous = counts.insert(key.to_string(), value.parse::<u64>().unwrap());
            assert!(previous.is_none(), "key {key} appears in two partitions");
        }
    }
    counts
}
