//! Resumable step sequencer.
//!
//! A build is a queue of step identifiers run one at a time against a
//! shared state object. Each step pushes its successor(s) onto the queue,
//! so variants change the pipeline by overriding entries in the
//! [`StepTable`] instead of altering the driver.
//!
//! Only step names and the state's opted-in fields are checkpointed; live
//! resources (temporary directories, open files) are re-acquired by the
//! caller when a build resumes.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error};

/// Identifier of one pipeline step.
pub trait Step: Copy + Ord + fmt::Debug + 'static {
    fn name(self) -> &'static str;
    fn from_name(name: &str) -> Option<Self>;
}

/// Shared state threaded through the steps.
pub trait Resources {
    /// Release held resources. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

pub type StepFn<K, S> = fn(&mut S, &mut Queue<K>) -> Result<()>;

/// Pending steps, front first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue<K> {
    steps: VecDeque<K>,
}

impl<K: Step> Queue<K> {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
        }
    }

    pub fn push(&mut self, step: K) {
        self.steps.push_back(step);
    }

    pub fn push_front(&mut self, step: K) {
        self.steps.push_front(step);
    }

    pub fn pop(&mut self) -> Option<K> {
        self.steps.pop_front()
    }

    pub fn peek(&self) -> Option<K> {
        self.steps.front().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_string()).collect()
    }
}

impl<K: Step> Default for Queue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Step> FromIterator<K> for Queue<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

/// Dispatch table from step identifier to implementation.
pub struct StepTable<K, S> {
    entries: BTreeMap<K, StepFn<K, S>>,
}

impl<K: Step, S> StepTable<K, S> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add or replace the implementation of a step.
    pub fn with(mut self, step: K, run: StepFn<K, S>) -> Self {
        self.entries.insert(step, run);
        self
    }

    pub fn get(&self, step: K) -> Option<StepFn<K, S>> {
        self.entries.get(&step).copied()
    }
}

impl<K: Step, S> Default for StepTable<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a partial run stops: a step name or a zero-based step index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Name(String),
    Index(usize),
}

impl Target {
    pub fn parse(value: &str) -> Self {
        match value.parse::<usize>() {
            Ok(index) => Target::Index(index),
            Err(_) => Target::Name(value.to_string()),
        }
    }

    fn matches<K: Step>(&self, step: K, index: usize) -> bool {
        match self {
            Target::Name(name) => step.name() == name,
            Target::Index(target) => *target == index,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Name(name) => write!(f, "{}", name),
            Target::Index(index) => write!(f, "{}", index),
        }
    }
}

/// Durable form of a paused machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<T> {
    pub pending: Vec<String>,
    pub debug_step: usize,
    pub saved_at_utc: String,
    pub state: T,
}

impl<T: Serialize + DeserializeOwned> Checkpoint<T> {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing checkpoint")?;
        fs::write(path, json)
            .with_context(|| format!("writing checkpoint '{}'", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("parsing checkpoint '{}'", path.display()))
    }
}

pub struct StateMachine<K: Step, S: Resources> {
    table: StepTable<K, S>,
    queue: Queue<K>,
    state: S,
    debug_step: usize,
    closed: bool,
}

impl<K: Step, S: Resources> StateMachine<K, S> {
    pub fn new(table: StepTable<K, S>, first: K, state: S) -> Self {
        let mut queue = Queue::new();
        queue.push(first);
        Self {
            table,
            queue,
            state,
            debug_step: 0,
            closed: false,
        }
    }

    /// Rebuild a machine from checkpointed step names.
    pub fn restore(
        table: StepTable<K, S>,
        pending: &[String],
        debug_step: usize,
        state: S,
    ) -> Result<Self> {
        let mut queue = Queue::new();
        for name in pending {
            match K::from_name(name) {
                Some(step) => queue.push(step),
                None => bail!("Unknown step '{}' in checkpoint", name),
            }
        }
        Ok(Self {
            table,
            queue,
            state,
            debug_step,
            closed: false,
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn queue(&self) -> &Queue<K> {
        &self.queue
    }

    pub fn debug_step(&self) -> usize {
        self.debug_step
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Snapshot of the pending queue plus the caller's opted-in state.
    pub fn checkpoint<T>(&self, state: T) -> Checkpoint<T> {
        Checkpoint {
            pending: self.queue.names(),
            debug_step: self.debug_step,
            saved_at_utc: now_utc_rfc3339(),
            state,
        }
    }

    /// Run the step at the head of the queue.
    ///
    /// Returns `false` once the queue is exhausted; resources are released
    /// at that point. A failing step releases resources before the error
    /// propagates.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(step) = self.queue.pop() else {
            self.close()?;
            return Ok(false);
        };
        debug!("-> [{:02}] {}", self.debug_step, step.name());
        let result = match self.table.get(step) {
            Some(run) => run(&mut self.state, &mut self.queue),
            None => Err(anyhow::anyhow!("No implementation for step '{}'", step.name())),
        };
        if let Err(err) = result {
            error!("Step [{:02}] {} failed: {:#}", self.debug_step, step.name(), err);
            if let Err(close_err) = self.close() {
                error!("Cleanup after failed step also failed: {:#}", close_err);
            }
            return Err(err.context(format!("step '{}' failed", step.name())));
        }
        self.debug_step += 1;
        Ok(true)
    }

    pub fn run_to_completion(&mut self) -> Result<()> {
        while self.advance()? {}
        Ok(())
    }

    /// Run steps up to and including `target`.
    pub fn run_through(&mut self, target: &Target) -> Result<()> {
        while let Some(step) = self.queue.peek() {
            let hit = target.matches(step, self.debug_step);
            self.advance()?;
            if hit {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Run steps up to but excluding `target`, leaving it at the head.
    pub fn run_until(&mut self, target: &Target) -> Result<()> {
        while let Some(step) = self.queue.peek() {
            if target.matches(step, self.debug_step) {
                return Ok(());
            }
            self.advance()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state.close()
    }
}

/// Current UTC time formatted as RFC 3339.
pub fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Demo {
        One,
        Two,
        Three,
        Boom,
    }

    impl Step for Demo {
        fn name(self) -> &'static str {
            match self {
                Demo::One => "one",
                Demo::Two => "two",
                Demo::Three => "three",
                Demo::Boom => "boom",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "one" => Some(Demo::One),
                "two" => Some(Demo::Two),
                "three" => Some(Demo::Three),
                "boom" => Some(Demo::Boom),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct Trace {
        ran: Vec<&'static str>,
        closes: usize,
    }

    impl Resources for Trace {
        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    fn one(state: &mut Trace, queue: &mut Queue<Demo>) -> Result<()> {
        state.ran.push("one");
        queue.push(Demo::Two);
        Ok(())
    }

    fn two(state: &mut Trace, queue: &mut Queue<Demo>) -> Result<()> {
        state.ran.push("two");
        queue.push(Demo::Three);
        Ok(())
    }

    fn three(state: &mut Trace, _: &mut Queue<Demo>) -> Result<()> {
        state.ran.push("three");
        Ok(())
    }

    fn boom(_: &mut Trace, _: &mut Queue<Demo>) -> Result<()> {
        bail!("exploded")
    }

    fn table() -> StepTable<Demo, Trace> {
        StepTable::new()
            .with(Demo::One, one)
            .with(Demo::Two, two)
            .with(Demo::Three, three)
            .with(Demo::Boom, boom)
    }

    #[test]
    fn test_run_to_completion_closes_once() {
        let mut machine = StateMachine::new(table(), Demo::One, Trace::default());
        machine.run_to_completion().unwrap();
        assert_eq!(machine.state().ran, vec!["one", "two", "three"]);
        assert_eq!(machine.state().closes, 1);
        assert_eq!(machine.debug_step(), 3);
        assert!(!machine.advance().unwrap());
        assert_eq!(machine.state().closes, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut machine = StateMachine::new(table(), Demo::One, Trace::default());
        machine.close().unwrap();
        machine.close().unwrap();
        machine.close().unwrap();
        assert_eq!(machine.state().closes, 1);
        assert!(machine.is_closed());
    }

    #[test]
    fn test_run_until_leaves_target_at_head() {
        let mut machine = StateMachine::new(table(), Demo::One, Trace::default());
        machine.run_until(&Target::parse("three")).unwrap();
        assert_eq!(machine.state().ran, vec!["one", "two"]);
        assert_eq!(machine.queue().peek(), Some(Demo::Three));
        assert_eq!(machine.state().closes, 0);
    }

    #[test]
    fn test_run_through_by_index() {
        let mut machine = StateMachine::new(table(), Demo::One, Trace::default());
        machine.run_through(&Target::parse("1")).unwrap();
        assert_eq!(machine.state().ran, vec!["one", "two"]);
        assert_eq!(machine.queue().peek(), Some(Demo::Three));
        assert_eq!(machine.debug_step(), 2);
    }

    #[test]
    fn test_failure_closes_and_keeps_step_counter() {
        fn two_then_boom(state: &mut Trace, queue: &mut Queue<Demo>) -> Result<()> {
            state.ran.push("two");
            queue.push(Demo::Boom);
            Ok(())
        }
        let table = table().with(Demo::Two, two_then_boom);
        let mut machine = StateMachine::new(table, Demo::One, Trace::default());
        let err = machine.run_to_completion().unwrap_err();
        assert!(format!("{:#}", err).contains("exploded"));
        assert!(err.to_string().contains("boom"));
        assert_eq!(machine.state().closes, 1);
        assert_eq!(machine.debug_step(), 2);
    }

    #[test]
    fn test_checkpoint_resumes_with_same_step() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.json");

        let mut machine = StateMachine::new(table(), Demo::One, Trace::default());
        machine.run_until(&Target::Name("two".to_string())).unwrap();
        let ran: Vec<String> = machine.state().ran.iter().map(|s| s.to_string()).collect();
        machine.checkpoint(ran).save(&path).unwrap();

        let loaded: Checkpoint<Vec<String>> = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.pending, vec!["two"]);
        assert_eq!(loaded.state, vec!["one"]);
        assert!(OffsetDateTime::parse(&loaded.saved_at_utc, &Rfc3339).is_ok());

        let mut resumed =
            StateMachine::restore(table(), &loaded.pending, loaded.debug_step, Trace::default())
                .unwrap();
        assert_eq!(resumed.debug_step(), 1);
        assert!(resumed.advance().unwrap());
        assert_eq!(resumed.state().ran, vec!["two"]);
    }

    #[test]
    fn test_restore_rejects_unknown_step() {
        let pending = vec!["nope".to_string()];
        assert!(StateMachine::restore(table(), &pending, 0, Trace::default()).is_err());
    }
}
