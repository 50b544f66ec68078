//! Event-Condition-Action engine
//!
//! The simulation is composed of independent components synchronized by an
//! ECA mechanism: components register rules (an event plus an action), the
//! run loop drains an event queue and dispatches each event to its rules in
//! insertion order. Everything is single-threaded, cooperative and
//! deterministic; every action runs to completion.
//!
//! ## Cancellation
//!
//! Rules may be cancelled at any time, including by the action of the rule
//! being cancelled. The engine never frees an action whose code is still on
//! the stack: effects requested during an action (emits, cancellations) are
//! buffered in a [`Ctl`] and applied when the action returns, which makes
//! the self-cancelling case a deferred purge rather than a special case.

use std::collections::{HashMap, VecDeque};

/// An ECA event type. Plain integers so components can define their own
/// above the reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event(pub u32);

/// Run initialization.
pub const INIT: Event = Event(1);
/// Run teardown; the last event of a run.
pub const DONE: Event = Event(2);
/// Emitted before the first stream record.
pub const START_STREAM: Event = Event(3);
/// Emitted after the last stream record.
pub const END_STREAM: Event = Event(4);
/// Emitted for each record, before it is processed.
pub const START_RECORD: Event = Event(5);
/// Emitted for each record, after it is processed.
pub const END_RECORD: Event = Event(6);
/// Per-record validation hook.
pub const VALIDATE: Event = Event(7);
/// Per-record reporting hook (timeseries sampling attaches here).
pub const REPORT: Event = Event(8);
/// Emitted once after the stream ends, before DONE.
pub const RESULTS: Event = Event(9);

/// Handle to a registered rule; used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcaRule {
    event: Event,
    slot: usize,
    gen: u64,
}

/// Side-effect buffer handed to every running action. Emits and
/// cancellations are applied by the engine after the action returns.
#[derive(Debug, Default)]
pub struct Ctl {
    emitted: Vec<Event>,
    pushed: Vec<Event>,
    cancelled: Vec<EcaRule>,
}

impl Ctl {
    /// Queue an event (FIFO order with respect to other emits).
    pub fn emit(&mut self, evt: Event) {
        self.emitted.push(evt);
    }

    /// Push an event on the nested-sequence stack; stack events dispatch
    /// only once both queues drain.
    pub fn push_event(&mut self, evt: Event) {
        self.pushed.push(evt);
    }

    /// Cancel a rule. Cancelling the currently running rule is allowed; the
    /// action object is purged once its run returns.
    pub fn cancel(&mut self, rule: EcaRule) {
        self.cancelled.push(rule);
    }
}

type ActionFn<C> = Box<dyn FnMut(&mut C, &mut Ctl)>;

struct Slot<C> {
    gen: u64,
    action: Option<ActionFn<C>>,
}

/// The rule engine, generic over the simulation context `C` that actions
/// mutate.
pub struct Engine<C> {
    rules: HashMap<Event, Vec<Slot<C>>>,
    event_queue: VecDeque<Event>,
    event_stack: Vec<Event>,
    action_queue: VecDeque<EcaRule>,
    next_gen: u64,
    steps: u64,
}

impl<C> Default for Engine<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Engine<C> {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            event_queue: VecDeque::new(),
            event_stack: Vec::new(),
            action_queue: VecDeque::new(),
            next_gen: 1,
            steps: 0,
        }
    }

    /// Register a rule; rules for one event fire in registration order.
    pub fn on(&mut self, evt: Event, action: impl FnMut(&mut C, &mut Ctl) + 'static) -> EcaRule {
        let gen = self.next_gen;
        self.next_gen += 1;
        let seq = self.rules.entry(evt).or_default();
        seq.push(Slot { gen, action: Some(Box::new(action)) });
        EcaRule { event: evt, slot: seq.len() - 1, gen }
    }

    /// Cancel a rule from outside the run loop.
    pub fn cancel_rule(&mut self, rule: EcaRule) {
        self.purge(rule);
    }

    /// Queue an event from outside the run loop.
    pub fn emit(&mut self, evt: Event) {
        self.event_queue.push_back(evt);
    }

    /// Push an event on the nested-sequence stack.
    pub fn push_event(&mut self, evt: Event) {
        self.event_stack.push(evt);
    }

    /// Number of actions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Drop all queued work (rules stay registered).
    pub fn initialize(&mut self) {
        self.event_queue.clear();
        self.event_stack.clear();
        self.action_queue.clear();
        self.steps = 0;
    }

    fn purge(&mut self, rule: EcaRule) {
        if let Some(seq) = self.rules.get_mut(&rule.event) {
            if let Some(slot) = seq.get_mut(rule.slot) {
                if slot.gen == rule.gen {
                    slot.action = None;
                }
            }
        }
    }

    fn dispatch_event(&mut self, evt: Event) {
        if let Some(seq) = self.rules.get(&evt) {
            for (i, slot) in seq.iter().enumerate() {
                if slot.action.is_some() {
                    self.action_queue.push_back(EcaRule { event: evt, slot: i, gen: slot.gen });
                }
            }
        }
    }

    fn run_action(&mut self, ctx: &mut C, rule: EcaRule) {
        // Take the action out of its slot so the engine stays borrowable
        // while the action runs; a stale handle (the rule was cancelled
        // after being enqueued) is skipped.
        let mut action = match self.rules.get_mut(&rule.event) {
            Some(seq) => match seq.get_mut(rule.slot) {
                Some(slot) if slot.gen == rule.gen => match slot.action.take() {
                    Some(a) => a,
                    None => return,
                },
                _ => return,
            },
            None => return,
        };

        self.steps += 1;
        let mut ctl = Ctl::default();
        action(ctx, &mut ctl);

        // restore the action unless its own run cancelled it
        let self_cancelled = ctl.cancelled.iter().any(|r| *r == rule);
        if !self_cancelled {
            if let Some(seq) = self.rules.get_mut(&rule.event) {
                if let Some(slot) = seq.get_mut(rule.slot) {
                    if slot.gen == rule.gen {
                        slot.action = Some(action);
                    }
                }
            }
        }

        for r in ctl.cancelled {
            if r != rule {
                self.purge(r);
            }
        }
        for evt in ctl.emitted {
            self.event_queue.push_back(evt);
        }
        for evt in ctl.pushed {
            self.event_stack.push(evt);
        }
    }

    /// Drain the action queue, then the event queue, then the event stack;
    /// stop when all three are empty.
    pub fn run(&mut self, ctx: &mut C) {
        loop {
            if let Some(rule) = self.action_queue.pop_front() {
                self.run_action(ctx, rule);
            } else if let Some(evt) = self.event_queue.pop_front() {
                self.dispatch_event(evt);
            } else if let Some(evt) = self.event_stack.pop() {
                self.dispatch_event(evt);
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Fires on every `n`-th check.
#[derive(Debug, Clone)]
pub struct EveryNTimes {
    n: usize,
    t: usize,
}

impl EveryNTimes {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "period cannot be 0");
        Self { n, t: n }
    }

    pub fn check(&mut self) -> bool {
        self.t -= 1;
        if self.t == 0 {
            self.t = self.n;
            true
        } else {
            false
        }
    }
}

/// Fires `n` times, evenly spread, out of every `cap_n` checks.
#[derive(Debug, Clone)]
pub struct NTimesOutOfN {
    cap_n: usize,
    n: usize,
    t: usize,
    tnext: usize,
    r: usize,
}

impl NTimesOutOfN {
    pub fn new(n: usize, cap_n: usize) -> Self {
        assert!(cap_n > 0, "period cannot be 0");
        let n = n.min(cap_n);
        let tnext = if n == 0 { cap_n } else { 0 };
        Self { cap_n, n, t: 0, tnext, r: n }
    }

    pub fn check(&mut self) -> bool {
        let ret = self.t == self.tnext;
        self.t += 1;
        if self.t == self.cap_n {
            self.r = self.n;
            self.t = 0;
            self.tnext = if self.n == 0 { self.cap_n } else { 0 };
        } else if ret {
            self.r -= 1;
            self.tnext = if self.r > 0 {
                // remaining checks spread over remaining true firings
                self.t - 1 + (self.cap_n - self.t) / self.r
            } else {
                self.cap_n
            };
        }
        ret
    }
}

/// Fires when a scalar functional moves by more than `p·|last| + d` from
/// the value at the previous firing.
#[derive(Debug, Clone)]
pub struct LevelChanged {
    p: f64,
    d: f64,
    f_last: f64,
}

impl LevelChanged {
    pub fn new(p: f64, d: f64, f_init: f64) -> Self {
        Self { p, d, f_last: f_init }
    }

    pub fn check(&mut self, f_cur: f64) -> bool {
        if (f_cur - self.f_last).abs() > self.p * self.f_last.abs() + self.d {
            self.f_last = f_cur;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        seen: Vec<&'static str>,
    }

    #[test]
    fn rules_fire_in_insertion_order() {
        let mut eng: Engine<Log> = Engine::new();
        eng.on(INIT, |log, _| log.seen.push("a"));
        eng.on(INIT, |log, _| log.seen.push("b"));
        eng.on(DONE, |log, _| log.seen.push("z"));
        eng.on(INIT, |log, _| log.seen.push("c"));

        let mut log = Log::default();
        eng.emit(INIT);
        eng.emit(DONE);
        eng.run(&mut log);
        assert_eq!(log.seen, vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn emitted_events_are_fifo_and_stack_is_lifo() {
        let mut eng: Engine<Log> = Engine::new();
        eng.on(INIT, |log, ctl| {
            log.seen.push("init");
            ctl.emit(START_STREAM);
            ctl.emit(END_STREAM);
            ctl.push_event(DONE);
            ctl.push_event(RESULTS);
        });
        eng.on(START_STREAM, |log, _| log.seen.push("start"));
        eng.on(END_STREAM, |log, _| log.seen.push("end"));
        eng.on(RESULTS, |log, _| log.seen.push("results"));
        eng.on(DONE, |log, _| log.seen.push("done"));

        let mut log = Log::default();
        eng.emit(INIT);
        eng.run(&mut log);
        // queue drains before the stack; stack pops in reverse push order
        assert_eq!(log.seen, vec!["init", "start", "end", "results", "done"]);
    }

    #[test]
    fn self_cancellation_runs_once() {
        let mut eng: Engine<Log> = Engine::new();
        // the rule needs its own handle; register a placeholder pattern by
        // wiring the handle through a cell
        let handle: std::rc::Rc<std::cell::Cell<Option<EcaRule>>> =
            std::rc::Rc::new(std::cell::Cell::new(None));
        let h2 = handle.clone();
        let rule = eng.on(START_RECORD, move |log: &mut Log, ctl| {
            log.seen.push("once");
            ctl.cancel(h2.get().expect("handle wired before run"));
        });
        handle.set(Some(rule));

        let mut log = Log::default();
        eng.emit(START_RECORD);
        eng.emit(START_RECORD);
        eng.run(&mut log);
        assert_eq!(log.seen, vec!["once"]);
    }

    #[test]
    fn cancelling_a_peer_mid_dispatch_suppresses_it() {
        let mut eng: Engine<Log> = Engine::new();
        let victim: std::rc::Rc<std::cell::Cell<Option<EcaRule>>> =
            std::rc::Rc::new(std::cell::Cell::new(None));
        let v2 = victim.clone();
        eng.on(INIT, move |log: &mut Log, ctl| {
            log.seen.push("killer");
            ctl.cancel(v2.get().unwrap());
        });
        let rule = eng.on(INIT, |log, _| log.seen.push("victim"));
        victim.set(Some(rule));

        let mut log = Log::default();
        eng.emit(INIT);
        eng.run(&mut log);
        assert_eq!(log.seen, vec!["killer"], "cancelled peer must not run");
    }

    #[test]
    fn every_n_times_period() {
        let mut c = EveryNTimes::new(3);
        let fired: Vec<bool> = (0..9).map(|_| c.check()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false, false, true]);
    }

    #[test]
    fn n_times_out_of_n_counts() {
        for &(n, cap) in &[(1usize, 10usize), (3, 10), (10, 10), (0, 5), (4, 7)] {
            let mut c = NTimesOutOfN::new(n, cap);
            for round in 0..3 {
                let fired = (0..cap).filter(|_| c.check()).count();
                assert_eq!(fired, n.min(cap), "n={n} cap={cap} round={round}");
            }
        }
    }

    #[test]
    fn level_changed_tracks_relative_and_absolute_motion() {
        let mut c = LevelChanged::new(0.1, 0.5, 10.0);
        assert!(!c.check(10.4)); // within both tolerances
        assert!(c.check(12.0)); // moved by 2 > 1 + 0.5
        assert!(!c.check(12.5));
        assert!(c.check(0.0)); // collapse is a level change
    }
}
