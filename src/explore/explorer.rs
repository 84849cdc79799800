//! The exploration driver.
//!
//! [`Explorer`] repeatedly extracts a schedule prefix from the tree, runs
//! the program under a [`DporScheduler`] seeded with it, folds the trace
//! and its backtracking points back into the tree, and yields the
//! execution. It is an iterator so callers can stop consuming early;
//! [`Explorer::report`] drains it into a summary.

use crate::exec::{run_concurrency_with, MemoryModel, DEFAULT_CAPABILITIES};
use crate::explore::backtrack::find_backtrack_steps;
use crate::explore::bounds::Bounds;
use crate::explore::dpor::DporTree;
use crate::explore::scheduler::DporScheduler;
use crate::program::Program;
use crate::trace::Trace;
use crate::tracing_compat::debug;
use crate::types::{Failure, ThreadId};
use std::any::Any;
use std::rc::Rc;

/// Exploration settings, builder style.
#[derive(Clone)]
pub struct Settings {
    /// The memory model `CRef` operations run under.
    pub memory_model: MemoryModel,
    /// The schedule bounds.
    pub bounds: Bounds,
    /// The initial simulated capability count.
    pub capabilities: u32,
    /// Whether the run loop checks engine invariants each step.
    pub check_invariants: bool,
    /// A hard cap on executions, on top of the bounds.
    pub max_executions: Option<usize>,
    /// Promotes matching schedule prefixes to the front of the queue.
    pub partition: Option<Rc<dyn Fn(&[ThreadId]) -> bool>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            memory_model: MemoryModel::default(),
            bounds: Bounds::default(),
            capabilities: DEFAULT_CAPABILITIES,
            check_invariants: true,
            max_executions: None,
            partition: None,
        }
    }
}

impl Settings {
    /// Settings with the given memory model, defaults otherwise.
    #[must_use]
    pub fn with_model(memory_model: MemoryModel) -> Self {
        Self {
            memory_model,
            ..Self::default()
        }
    }

    /// Sets the schedule bounds.
    #[must_use]
    pub fn bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Sets the simulated capability count.
    #[must_use]
    pub fn capabilities(mut self, caps: u32) -> Self {
        self.capabilities = caps;
        self
    }

    /// Enables or disables per-step invariant checking.
    #[must_use]
    pub fn check_invariants(mut self, check: bool) -> Self {
        self.check_invariants = check;
        self
    }

    /// Caps the number of executions.
    #[must_use]
    pub fn max_executions(mut self, max: usize) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Installs a prefix partition predicate; matching candidates are
    /// explored first.
    #[must_use]
    pub fn partition(mut self, partition: impl Fn(&[ThreadId]) -> bool + 'static) -> Self {
        self.partition = Some(Rc::new(partition));
        self
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("memory_model", &self.memory_model)
            .field("bounds", &self.bounds)
            .field("capabilities", &self.capabilities)
            .field("check_invariants", &self.check_invariants)
            .field("max_executions", &self.max_executions)
            .field("partition", &self.partition.is_some())
            .finish()
    }
}

/// One explored execution: its result and full trace.
#[derive(Debug)]
pub struct Execution<T> {
    /// The program's result under this schedule.
    pub result: Result<T, Failure>,
    /// The execution's trace.
    pub trace: Trace,
}

/// Drives bounded systematic exploration of one program.
pub struct Explorer<T, F> {
    settings: Settings,
    program: F,
    tree: DporTree,
    executions: usize,
    _result: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> Explorer<T, F>
where
    T: Any + Clone,
    F: Fn() -> Program<T>,
{
    /// Creates an explorer over a program constructor. The constructor is
    /// invoked once per execution; it must build the same program each
    /// time.
    #[must_use]
    pub fn new(settings: Settings, program: F) -> Self {
        Self {
            settings,
            program,
            tree: DporTree::new(),
            executions: 0,
            _result: std::marker::PhantomData,
        }
    }

    /// Drains the explorer into a summary report.
    #[must_use]
    pub fn report(self) -> Report<T>
    where
        T: PartialEq,
    {
        let mut report = Report::default();
        for execution in self {
            report.record(execution);
        }
        report
    }
}

impl<T, F> Iterator for Explorer<T, F>
where
    T: Any + Clone,
    F: Fn() -> Program<T>,
{
    type Item = Execution<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self
                .settings
                .max_executions
                .is_some_and(|max| self.executions >= max)
            {
                return None;
            }

            let schedule = self
                .tree
                .find_schedule_prefix(self.settings.partition.as_deref())?;
            let conservative = schedule.conservative;
            debug!(
                prefix_len = schedule.prefix.len(),
                conservative, "exploring schedule prefix"
            );

            let mut sched = DporScheduler::new(schedule, self.settings.bounds);
            let (result, trace) = run_concurrency_with(
                &mut sched,
                self.settings.memory_model,
                self.settings.capabilities,
                self.settings.check_invariants,
                (self.program)(),
            );
            self.executions += 1;

            self.tree.incorporate_trace(conservative, &trace);
            if sched.ignored() {
                // Every in-bound choice was asleep: this interleaving is
                // equivalent to one already explored.
                continue;
            }
            let steps =
                find_backtrack_steps(&self.settings.bounds, sched.bound_killed(), &trace);
            self.tree.incorporate_backtrack_steps(&self.settings.bounds, &steps);

            debug!(steps = trace.len(), result = ?result.as_ref().err(), "execution complete");
            return Some(Execution { result, trace });
        }
    }
}

/// A summary of one exploration: every distinct outcome with its
/// multiplicity, plus abort bookkeeping.
#[derive(Debug)]
pub struct Report<T> {
    /// Executions yielded (aborted ones included, ignored ones not).
    pub executions: usize,
    /// How many executions the bound cut off.
    pub aborts: usize,
    /// Each distinct outcome with the number of executions producing it.
    pub outcomes: Vec<(Result<T, Failure>, usize)>,
}

impl<T> Default for Report<T> {
    fn default() -> Self {
        Self {
            executions: 0,
            aborts: 0,
            outcomes: Vec::new(),
        }
    }
}

impl<T: PartialEq> Report<T> {
    fn record(&mut self, execution: Execution<T>) {
        self.executions += 1;
        if execution.result == Err(Failure::Abort) {
            self.aborts += 1;
        }
        match self
            .outcomes
            .iter_mut()
            .find(|(outcome, _)| *outcome == execution.result)
        {
            Some((_, count)) => *count += 1,
            None => self.outcomes.push((execution.result, 1)),
        }
    }

    /// True if some execution produced this outcome.
    #[must_use]
    pub fn has_outcome(&self, outcome: &Result<T, Failure>) -> bool {
        self.outcomes.iter().any(|(o, _)| o == outcome)
    }

    /// The distinct non-abort program outcomes.
    #[must_use]
    pub fn program_outcomes(&self) -> Vec<&Result<T, Failure>> {
        self.outcomes
            .iter()
            .map(|(o, _)| o)
            .filter(|o| **o != Err(Failure::Abort))
            .collect()
    }
}

/// Explores every in-bound interleaving, collecting the executions.
#[must_use]
pub fn explore<T, F>(settings: Settings, program: F) -> Vec<Execution<T>>
where
    T: Any + Clone,
    F: Fn() -> Program<T>,
{
    Explorer::new(settings, program).collect()
}

/// Bounded systematic concurrency testing with explicit bounds.
#[must_use]
pub fn sct_bounded<T, F>(
    memory_model: MemoryModel,
    bounds: Bounds,
    program: F,
) -> Vec<Execution<T>>
where
    T: Any + Clone,
    F: Fn() -> Program<T>,
{
    explore(Settings::with_model(memory_model).bounds(bounds), program)
}
