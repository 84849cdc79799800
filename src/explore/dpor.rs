//! The exploration tree.
//!
//! Each node is one position in the space of schedule prefixes. `done`
//! children are explored subtrees; `todo` entries are alternatives queued
//! for exploration (the flag marks conservatively-added ones, which skip
//! sleep-set suppression); `taken` records what actually ran at this node
//! and seeds children's `sleep` sets, so an interleaving already covered
//! from a sibling is not re-explored unless something dependent happened
//! in between.

use crate::action::ThreadAction;
use crate::explore::backtrack::BacktrackStep;
use crate::explore::bounds::Bounds;
use crate::explore::dependency::{dependent, DepState};
use crate::trace::{decision_of, TraceEntry};
use crate::types::ThreadId;
use std::collections::{BTreeMap, BTreeSet};

/// A schedule prefix queued for exploration.
#[derive(Debug, Clone)]
pub struct SchedulePrefix {
    /// The thread choices to replay before diverging.
    pub prefix: Vec<ThreadId>,
    /// True when the divergence was conservatively added; conservative
    /// prefixes start with an empty sleep set so they are always
    /// explored.
    pub conservative: bool,
    /// The sleep set at the divergence point.
    pub sleep: BTreeMap<ThreadId, ThreadAction>,
}

#[derive(Debug, Default)]
struct Node {
    runnable: BTreeSet<ThreadId>,
    todo: BTreeMap<ThreadId, bool>,
    done: BTreeMap<ThreadId, Node>,
    sleep: BTreeMap<ThreadId, ThreadAction>,
    taken: BTreeMap<ThreadId, ThreadAction>,
    action: Option<ThreadAction>,
}

/// The exploration tree, mutated in place across executions.
#[derive(Debug)]
pub struct DporTree {
    root: Node,
}

impl Default for DporTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DporTree {
    /// A fresh tree with the initial thread queued.
    #[must_use]
    pub fn new() -> Self {
        let mut root = Node {
            runnable: BTreeSet::from([ThreadId::initial()]),
            ..Node::default()
        };
        root.todo.insert(ThreadId::initial(), false);
        Self { root }
    }

    /// Extracts the next schedule prefix to try, or `None` when the tree
    /// is drained.
    ///
    /// Candidates deeper in `done` subtrees keep their path as the replay
    /// prefix. Ties break towards more context switches (approximating
    /// "more pre-emptions first"), after candidates matched by the
    /// partition predicate, if one is given. The generating `todo` entry
    /// stays in the tree until the resulting trace is incorporated.
    #[must_use]
    pub fn find_schedule_prefix(
        &self,
        partition: Option<&dyn Fn(&[ThreadId]) -> bool>,
    ) -> Option<SchedulePrefix> {
        let mut candidates = Vec::new();
        collect_prefixes(&self.root, &mut Vec::new(), &mut candidates);
        candidates
            .into_iter()
            .max_by_key(|c| {
                let preferred = partition.is_some_and(|p| p(&c.prefix));
                (preferred, switch_count(&c.prefix))
            })
    }

    /// Folds an executed trace into the tree: walks to the divergence
    /// point, retires its `todo` entry, and grafts the trace suffix as a
    /// fresh chain of nodes.
    pub fn incorporate_trace(&mut self, conservative: bool, trace: &[TraceEntry]) {
        grow(
            &mut self.root,
            DepState::new(),
            ThreadId::initial(),
            trace,
            conservative,
        );
    }

    /// Adds the backtracking points of a completed execution as new
    /// `todo` entries along the trace's path, subject to the bound.
    pub fn incorporate_backtrack_steps(&mut self, bounds: &Bounds, steps: &[BacktrackStep]) {
        let mut node = &mut self.root;
        let mut prefix: Vec<TraceEntry> = Vec::with_capacity(steps.len());

        for step in steps {
            for (&tid, &conservative) in &step.backtracks {
                if node.done.contains_key(&tid) {
                    continue;
                }
                let Some((_, lookahead)) = step.runnable.iter().find(|(t, _)| *t == tid) else {
                    continue;
                };
                let prior = prefix
                    .len()
                    .checked_sub(1)
                    .and_then(|i| steps.get(i))
                    .map(|previous| previous.thread);
                let prior_still_runnable =
                    prior.is_some_and(|p| step.runnable.iter().any(|(t, _)| *t == p));
                let decision = decision_of(prior, prior_still_runnable, tid);
                if !bounds.admits(&prefix, decision, tid, *lookahead) {
                    continue;
                }
                match node.todo.get_mut(&tid) {
                    Some(existing) => {
                        if conservative && !*existing {
                            *existing = true;
                        }
                    }
                    None => {
                        node.todo.insert(tid, conservative);
                    }
                }
            }

            prefix.push(TraceEntry {
                decision: step.decision,
                runnable: step.runnable.clone(),
                action: step.action.clone(),
            });
            match node.done.get_mut(&step.thread) {
                Some(child) => node = child,
                None => break,
            }
        }
    }

    /// The number of fully explored children of the root, for reporting.
    #[must_use]
    pub fn explored_children(&self) -> usize {
        self.root.done.len()
    }
}

fn collect_prefixes(node: &Node, path: &mut Vec<ThreadId>, out: &mut Vec<SchedulePrefix>) {
    for (&tid, &conservative) in &node.todo {
        let mut prefix = path.clone();
        prefix.push(tid);
        let sleep = if conservative {
            BTreeMap::new()
        } else {
            let mut sleep = node.sleep.clone();
            sleep.extend(node.taken.clone());
            sleep
        };
        out.push(SchedulePrefix {
            prefix,
            conservative,
            sleep,
        });
    }
    for (&tid, child) in &node.done {
        path.push(tid);
        collect_prefixes(child, path, out);
        path.pop();
    }
}

/// Context switches in a prefix, commit pseudo-threads skipped.
fn switch_count(prefix: &[ThreadId]) -> usize {
    let mut count = 0;
    let mut prior: Option<ThreadId> = None;
    for tid in prefix.iter().filter(|t| !t.is_commit()) {
        if prior.is_some_and(|p| p != *tid) {
            count += 1;
        }
        prior = Some(*tid);
    }
    count
}

fn grow(
    node: &mut Node,
    mut state: DepState,
    prior: ThreadId,
    entries: &[TraceEntry],
    conservative: bool,
) {
    let Some((entry, rest)) = entries.split_first() else {
        return;
    };
    let tid = entry.decision.tid_of(prior);
    state.update(tid, &entry.action);

    if let Some(child) = node.done.get_mut(&tid) {
        grow(child, state, tid, rest, conservative);
        return;
    }

    node.todo.remove(&tid);
    // The child inherits this node's suppressions, but not the step that
    // created it: that step is recorded in `taken` afterwards, to put
    // *siblings* to sleep.
    let mut sleep = node.sleep.clone();
    sleep.extend(node.taken.clone());
    if !conservative {
        node.taken.insert(tid, entry.action.clone());
    }
    let child = subtree(&state, tid, sleep, entry, rest);
    node.done.insert(tid, child);
}

/// Builds the chain of fresh nodes for a trace suffix. Each node's sleep
/// set is the inherited one minus entries dependent with the action that
/// led here.
fn subtree(
    state: &DepState,
    tid: ThreadId,
    sleep: BTreeMap<ThreadId, ThreadAction>,
    entry: &TraceEntry,
    rest: &[TraceEntry],
) -> Node {
    let sleep: BTreeMap<ThreadId, ThreadAction> = sleep
        .into_iter()
        .filter(|(t, a)| !dependent(state, (tid, &entry.action), (*t, a)))
        .collect();

    let mut node = Node {
        runnable: rest
            .first()
            .map(|next| next.runnable.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default(),
        sleep: sleep.clone(),
        action: Some(entry.action.clone()),
        ..Node::default()
    };

    if let Some((next, rest2)) = rest.split_first() {
        let next_tid = next.decision.tid_of(tid);
        let mut next_state = state.clone();
        next_state.update(next_tid, &next.action);
        node.taken.insert(next_tid, next.action.clone());
        node.done
            .insert(next_tid, subtree(&next_state, next_tid, sleep, next, rest2));
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Lookahead;
    use crate::trace::Decision;
    use crate::types::CRefId;

    fn t(n: i64) -> ThreadId {
        ThreadId::new_for_test(n)
    }

    fn entry(decision: Decision, runnable: &[i64], action: ThreadAction) -> TraceEntry {
        TraceEntry {
            decision,
            runnable: runnable
                .iter()
                .map(|n| (t(*n), Lookahead::WillReturn))
                .collect(),
            action: action.clone(),
        }
    }

    #[test]
    fn fresh_tree_offers_the_initial_thread() {
        let tree = DporTree::new();
        let prefix = tree.find_schedule_prefix(None).expect("initial todo");
        assert_eq!(prefix.prefix, vec![ThreadId::initial()]);
        assert!(!prefix.conservative);
        assert!(prefix.sleep.is_empty());
    }

    #[test]
    fn incorporating_a_trace_retires_the_todo() {
        let mut tree = DporTree::new();
        let trace = vec![
            entry(Decision::Start(t(0)), &[0], ThreadAction::Return),
            entry(Decision::Continue, &[0], ThreadAction::Stop),
        ];
        tree.incorporate_trace(false, &trace);
        assert!(tree.find_schedule_prefix(None).is_none(), "tree drained");
        assert_eq!(tree.explored_children(), 1);
    }

    #[test]
    fn backtrack_steps_requeue_alternatives() {
        let mut tree = DporTree::new();
        let r0 = CRefId::new_for_test(0);
        let trace = vec![
            TraceEntry {
                decision: Decision::Start(t(0)),
                runnable: vec![
                    (t(0), Lookahead::WillWriteCRef(r0)),
                    (t(1), Lookahead::WillWriteCRef(r0)),
                ],
                action: ThreadAction::WriteCRef(r0),
            },
            TraceEntry {
                decision: Decision::SwitchTo(t(1)),
                runnable: vec![
                    (t(0), Lookahead::WillStop),
                    (t(1), Lookahead::WillWriteCRef(r0)),
                ],
                action: ThreadAction::WriteCRef(r0),
            },
        ];
        tree.incorporate_trace(false, &trace);
        let steps =
            crate::explore::backtrack::find_backtrack_steps(&Bounds::NONE, false, &trace);
        tree.incorporate_backtrack_steps(&Bounds::NONE, &steps);

        // The conflicting write queued T1 at the root.
        let prefix = tree.find_schedule_prefix(None).expect("requeued todo");
        assert_eq!(prefix.prefix, vec![t(1)]);
        // T0's write at the root is now asleep for that exploration.
        assert!(prefix.sleep.contains_key(&t(0)));
    }

    #[test]
    fn deeper_candidates_keep_their_path() {
        let mut tree = DporTree::new();
        let trace = vec![
            entry(Decision::Start(t(0)), &[0, 1], ThreadAction::Return),
            entry(Decision::SwitchTo(t(1)), &[0, 1], ThreadAction::Return),
            entry(Decision::SwitchTo(t(0)), &[0, 1], ThreadAction::Stop),
        ];
        tree.incorporate_trace(false, &trace);

        // Manually queue an alternative two levels deep.
        let mut steps =
            crate::explore::backtrack::find_backtrack_steps(&Bounds::NONE, false, &trace);
        crate::explore::backtrack::backtrack_at(&mut steps, 1, t(0), false);
        tree.incorporate_backtrack_steps(&Bounds::NONE, &steps);

        let prefix = tree.find_schedule_prefix(None).expect("queued todo");
        assert_eq!(prefix.prefix, vec![t(0), t(0)]);
    }

    #[test]
    fn partition_predicate_takes_priority() {
        let mut tree = DporTree::new();
        // Queue two alternatives at the root.
        tree.root.todo.insert(t(5), false);
        let favouring = |p: &[ThreadId]| p.first() == Some(&t(5));
        let prefix = tree
            .find_schedule_prefix(Some(&favouring))
            .expect("candidates");
        assert_eq!(prefix.prefix, vec![t(5)]);
    }

    #[test]
    fn conservative_candidates_sleep_nothing() {
        let mut tree = DporTree::new();
        let trace = vec![entry(Decision::Start(t(0)), &[0], ThreadAction::Stop)];
        tree.incorporate_trace(false, &trace);
        tree.root.todo.insert(t(1), true);

        let prefix = tree.find_schedule_prefix(None).expect("conservative todo");
        assert!(prefix.conservative);
        assert!(prefix.sleep.is_empty());
    }
}
