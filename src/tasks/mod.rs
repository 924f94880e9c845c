//! User-supplied map/reduce logic
//!
//! The coordinator never depends on concrete transformations. Workers look
//! a task up by name in a [`TaskFactory`] and drive its [`Mapper`] and
//! [`Reducer`] through an [`Emitter`].

use std::collections::HashMap;
use std::sync::Arc;

/// Name of the built-in word count task
pub const WORDCOUNT: &str = "wordcount";

/// Collects `(key, value)` pairs produced by user logic
#[derive(Debug, Default)]
pub struct Emitter {
    pairs: Vec<(String, String)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, (String, String)> {
        self.pairs.drain(..)
    }
}

/// Map capability: one input line to zero or more pairs
pub trait Mapper: Send + Sync {
    fn map(&self, line: &str, out: &mut Emitter);
}

/// Reduce capability: one key with all its values, visited in key order
pub trait Reducer: Send + Sync {
    fn reduce(&self, key: &str, values: &[String], out: &mut Emitter);
}

/// A named mapper/reducer pair
#[derive(Clone)]
pub struct UserTask {
    pub mapper: Arc<dyn Mapper>,
    pub reducer: Arc<dyn Reducer>,
}

impl std::fmt::Debug for UserTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTask").finish_non_exhaustive()
    }
}

/// Registry of tasks a worker can execute
#[derive(Debug, Clone, Default)]
pub struct TaskFactory {
    tasks: HashMap<String, UserTask>,
}

impl TaskFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in tasks registered
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register(WORDCOUNT, WordCountMapper, WordCountReducer);
        factory
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        mapper: impl Mapper + 'static,
        reducer: impl Reducer + 'static,
    ) {
        self.tasks.insert(
            name.into(),
            UserTask {
                mapper: Arc::new(mapper),
                reducer: Arc::new(reducer),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&UserTask> {
        self.tasks.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Word Count
// ============================================================================

const WORD_DELIMITERS: &[char] = &[' ', ',', '.', '"', '\''];

/// Emits `(word, "1")` for every token
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountMapper;

impl Mapper for WordCountMapper {
    fn map(&self, line: &str, out: &mut Emitter) {
        line.split(|c: char| WORD_DELIMITERS.contains(&c) || c.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .for_each(|token| out.emit(token, "1"));
    }
}

/// Sums the counts for each word
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountReducer;

impl Reducer for WordCountReducer {
    fn reduce(&self, key: &str, values: &[String], out: &mut Emitter) {
        let total: u64 = values
            .iter()
            .filter_map(|v| v.trim().parse::<u64>().ok())
            .sum();
        out.emit(key, total.to_string());
    }
}
