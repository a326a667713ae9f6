//! A small conflict-driven SAT solver.
//!
//! Clauses are plain literal vectors watched at two positions; conflicts are
//! analyzed to the first unique implication point and learned. The solver is
//! fully deterministic: decisions always pick the lowest-numbered unassigned
//! variable and assign `false`, so the clause generator controls the search
//! order through variable numbering (candidates are numbered best-first).
//!
//! Solving takes a set of assumption literals which are decided before the
//! free search starts. Cardinality bounds used by the optimizer are encoded
//! with an activation literal and switched on through the assumptions, so
//! probes can be retracted without touching the clause store.

use std::fmt;

/// A propositional variable, numbered from 0.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Var(pub u32);

/// A literal: a variable or its negation.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Lit(u32);

impl Lit {
    /// The positive literal of a variable.
    pub fn pos(var: Var) -> Lit {
        Lit(var.0 << 1)
    }

    /// The negative literal of a variable.
    pub fn neg(var: Var) -> Lit {
        Lit((var.0 << 1) | 1)
    }

    /// The variable of the literal.
    pub fn var(self) -> Var {
        Var(self.0 >> 1)
    }

    /// True if the literal is negated.
    pub fn is_neg(self) -> bool {
        self.0 & 1 == 1
    }

    /// The complementary literal.
    pub fn inverted(self) -> Lit {
        Lit(self.0 ^ 1)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Lit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_neg() {
            write!(f, "¬x{}", self.var().0)
        } else {
            write!(f, "x{}", self.var().0)
        }
    }
}

/// The outcome of a solve call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SatResult {
    /// A model was found; indexed by variable number.
    Satisfiable(Vec<bool>),

    /// No model exists under the given assumptions.
    Unsatisfiable,
}

#[derive(Debug, Clone)]
struct Clause {
    lits: Vec<Lit>,
}

const NO_REASON: u32 = u32::MAX;

/// The solver. Clauses are added up front and between solve calls; each
/// solve call restarts the search from scratch, which keeps the state
/// machine simple and the behavior reproducible.
pub struct SatSolver {
    clauses: Vec<Clause>,
    /// For every literal, the clauses currently watching it.
    watches: Vec<Vec<u32>>,
    /// Unit clauses collected at add time, enqueued at level 0.
    units: Vec<Lit>,
    /// Set when an empty clause was added; everything is unsatisfiable.
    contradiction: bool,

    assignment: Vec<Option<bool>>,
    decision_level: Vec<u32>,
    reason: Vec<u32>,
    trail: Vec<Lit>,
    trail_delims: Vec<usize>,
    propagation_head: usize,
    seen: Vec<bool>,
}

impl SatSolver {
    /// Creates a solver with no variables.
    pub fn new() -> Self {
        SatSolver {
            clauses: Vec::new(),
            watches: Vec::new(),
            units: Vec::new(),
            contradiction: false,
            assignment: Vec::new(),
            decision_level: Vec::new(),
            reason: Vec::new(),
            trail: Vec::new(),
            trail_delims: Vec::new(),
            propagation_head: 0,
            seen: Vec::new(),
        }
    }

    /// Allocates a fresh variable.
    pub fn new_var(&mut self) -> Var {
        let var = Var(self.assignment.len() as u32);
        self.assignment.push(None);
        self.decision_level.push(0);
        self.reason.push(NO_REASON);
        self.seen.push(false);
        self.watches.push(Vec::new());
        self.watches.push(Vec::new());
        var
    }

    /// The number of allocated variables.
    pub fn num_vars(&self) -> usize {
        self.assignment.len()
    }

    /// Adds a clause (a disjunction of literals). Duplicate literals are
    /// tolerated; a clause containing `x ∨ ¬x` is dropped as trivially true.
    pub fn add_clause(&mut self, mut lits: Vec<Lit>) {
        lits.sort_by_key(|lit| lit.0);
        lits.dedup();
        if lits.windows(2).any(|w| w[0].var() == w[1].var()) {
            return;
        }

        match lits.len() {
            0 => self.contradiction = true,
            1 => self.units.push(lits[0]),
            _ => {
                let id = self.clauses.len() as u32;
                self.watches[lits[0].index()].push(id);
                self.watches[lits[1].index()].push(id);
                self.clauses.push(Clause { lits });
            }
        }
    }

    /// Solves under the given assumptions. The assumptions are decided, in
    /// order, before any free decision is made.
    pub fn solve(&mut self, assumptions: &[Lit]) -> SatResult {
        if self.contradiction {
            return SatResult::Unsatisfiable;
        }
        self.reset();

        // Level 0: the accumulated unit clauses.
        for i in 0..self.units.len() {
            let unit = self.units[i];
            match self.value(unit) {
                Some(false) => return SatResult::Unsatisfiable,
                Some(true) => {}
                None => self.enqueue(unit, NO_REASON),
            }
        }
        if self.propagate().is_some() {
            return SatResult::Unsatisfiable;
        }

        loop {
            // Re-assert any assumption that is not yet satisfied; an
            // assumption that propagated to false is a definitive conflict.
            let mut next_decision = None;
            for &assumption in assumptions {
                match self.value(assumption) {
                    Some(true) => {}
                    Some(false) => return SatResult::Unsatisfiable,
                    None => {
                        next_decision = Some(assumption);
                        break;
                    }
                }
            }

            // Otherwise pick the lowest unassigned variable, default false.
            let decision = next_decision.or_else(|| {
                self.assignment
                    .iter()
                    .position(Option::is_none)
                    .map(|var| Lit::neg(Var(var as u32)))
            });

            let Some(decision) = decision else {
                let model = self
                    .assignment
                    .iter()
                    .map(|value| value.expect("all variables are assigned"))
                    .collect();
                return SatResult::Satisfiable(model);
            };

            self.trail_delims.push(self.trail.len());
            self.enqueue(decision, NO_REASON);

            while let Some(conflict) = self.propagate() {
                if self.current_level() == 0 {
                    return SatResult::Unsatisfiable;
                }
                let (learnt, backjump_level) = self.analyze(conflict);
                self.backtrack(backjump_level);

                let asserting = learnt[0];
                match learnt.len() {
                    1 => {
                        self.units.push(asserting);
                        self.enqueue(asserting, NO_REASON);
                    }
                    _ => {
                        let id = self.clauses.len() as u32;
                        self.watches[learnt[0].index()].push(id);
                        self.watches[learnt[1].index()].push(id);
                        self.clauses.push(Clause { lits: learnt });
                        self.enqueue(asserting, id);
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.assignment.iter_mut().for_each(|value| *value = None);
        self.reason.iter_mut().for_each(|reason| *reason = NO_REASON);
        self.trail.clear();
        self.trail_delims.clear();
        self.propagation_head = 0;
    }

    fn current_level(&self) -> u32 {
        self.trail_delims.len() as u32
    }

    fn value(&self, lit: Lit) -> Option<bool> {
        self.assignment[lit.var().0 as usize].map(|value| value != lit.is_neg())
    }

    fn enqueue(&mut self, lit: Lit, reason: u32) {
        debug_assert!(self.value(lit).is_none());
        self.assignment[lit.var().0 as usize] = Some(!lit.is_neg());
        self.decision_level[lit.var().0 as usize] = self.current_level();
        self.reason[lit.var().0 as usize] = reason;
        self.trail.push(lit);
    }

    /// Unit propagation over the watch lists. Returns the index of a
    /// conflicting clause, or `None` when a fixpoint is reached.
    fn propagate(&mut self) -> Option<u32> {
        while self.propagation_head < self.trail.len() {
            let lit = self.trail[self.propagation_head];
            self.propagation_head += 1;

            // Clauses watching ¬lit may have become unit or conflicting.
            let falsified = lit.inverted();
            let mut watchers = std::mem::take(&mut self.watches[falsified.index()]);
            let mut i = 0;
            while i < watchers.len() {
                let clause_id = watchers[i];
                match self.inspect_watched(clause_id, falsified) {
                    WatchOutcome::NewWatch(new_lit) => {
                        self.watches[new_lit.index()].push(clause_id);
                        watchers.swap_remove(i);
                    }
                    WatchOutcome::Unit(unit) => {
                        self.enqueue(unit, clause_id);
                        i += 1;
                    }
                    WatchOutcome::Satisfied => {
                        i += 1;
                    }
                    WatchOutcome::Conflict => {
                        watchers.extend(self.watches[falsified.index()].drain(..));
                        self.watches[falsified.index()] = watchers;
                        self.propagation_head = self.trail.len();
                        return Some(clause_id);
                    }
                }
            }
            watchers.extend(self.watches[falsified.index()].drain(..));
            self.watches[falsified.index()] = watchers;
        }
        None
    }

    /// Examines a clause one of whose watched literals was falsified.
    fn inspect_watched(&mut self, clause_id: u32, falsified: Lit) -> WatchOutcome {
        let clause = &mut self.clauses[clause_id as usize];

        // Keep the falsified literal at position 1.
        if clause.lits[0] == falsified {
            clause.lits.swap(0, 1);
        }
        debug_assert_eq!(clause.lits[1], falsified);

        let first = clause.lits[0];
        let first_value = self.assignment[first.var().0 as usize]
            .map(|value| value != first.is_neg());
        if first_value == Some(true) {
            return WatchOutcome::Satisfied;
        }

        // Look for a non-falsified literal to watch instead.
        for i in 2..clause.lits.len() {
            let candidate = clause.lits[i];
            let value = self.assignment[candidate.var().0 as usize]
                .map(|value| value != candidate.is_neg());
            if value != Some(false) {
                clause.lits.swap(1, i);
                return WatchOutcome::NewWatch(candidate);
            }
        }

        // No replacement: the clause is unit or conflicting on `first`.
        match first_value {
            None => WatchOutcome::Unit(first),
            Some(false) => WatchOutcome::Conflict,
            Some(true) => unreachable!("handled above"),
        }
    }

    /// First-UIP conflict analysis. Returns the learnt clause (asserting
    /// literal first) and the level to backjump to.
    fn analyze(&mut self, conflict: u32) -> (Vec<Lit>, u32) {
        let current_level = self.current_level();
        let mut learnt: Vec<Lit> = Vec::new();
        let mut counter = 0usize;
        let mut reason_lits: Vec<Lit> = self.clauses[conflict as usize].lits.clone();
        let mut trail_index = self.trail.len();
        let mut asserting = None;

        loop {
            for &lit in &reason_lits {
                let var = lit.var();
                if self.seen[var.0 as usize] || self.decision_level[var.0 as usize] == 0 {
                    continue;
                }
                self.seen[var.0 as usize] = true;
                if self.decision_level[var.0 as usize] == current_level {
                    counter += 1;
                } else {
                    learnt.push(lit);
                }
            }

            // Walk the trail backwards to the next marked literal.
            let lit = loop {
                trail_index -= 1;
                let lit = self.trail[trail_index];
                if self.seen[lit.var().0 as usize] {
                    break lit;
                }
            };
            self.seen[lit.var().0 as usize] = false;
            counter -= 1;

            if counter == 0 {
                asserting = Some(lit.inverted());
                break;
            }

            let reason = self.reason[lit.var().0 as usize];
            debug_assert_ne!(reason, NO_REASON, "only decisions lack a reason");
            reason_lits = self.clauses[reason as usize]
                .lits
                .iter()
                .copied()
                .filter(|&l| l != lit)
                .collect();
        }

        for &lit in &learnt {
            self.seen[lit.var().0 as usize] = false;
        }

        let asserting = asserting.expect("analysis always finds a UIP");
        // Backjump to the highest level among the remaining literals and
        // place one of them in the second watch position.
        let backjump_level = learnt
            .iter()
            .map(|lit| self.decision_level[lit.var().0 as usize])
            .max()
            .unwrap_or(0);
        if let Some(second) = learnt
            .iter()
            .position(|lit| self.decision_level[lit.var().0 as usize] == backjump_level)
        {
            learnt.swap(0, second);
        }
        learnt.insert(0, asserting);

        (learnt, backjump_level)
    }

    fn backtrack(&mut self, level: u32) {
        while self.current_level() > level {
            let delim = self.trail_delims.pop().expect("level is positive");
            for lit in self.trail.drain(delim..) {
                self.assignment[lit.var().0 as usize] = None;
                self.reason[lit.var().0 as usize] = NO_REASON;
            }
        }
        self.propagation_head = self.trail.len();
    }

    /// Adds clauses enforcing `sum(weight_i * lit_i) <= bound`, activated by
    /// the returned literal: the bound only applies in solve calls that
    /// assume the activation literal. Encoded as a sequential weighted
    /// counter; auxiliary variable `s[i][j]` means "the first i+1 terms sum
    /// to at least j+1".
    pub fn add_weighted_at_most(&mut self, terms: &[(Lit, u64)], bound: u64) -> Lit {
        let activator = Lit::pos(self.new_var());
        let off = activator.inverted();
        let bound = bound as usize;

        let terms: Vec<(Lit, usize)> = terms
            .iter()
            .filter(|(_, weight)| *weight > 0)
            .map(|&(lit, weight)| (lit, weight as usize))
            .collect();

        // Terms whose weight alone exceeds the bound can never be true.
        if terms.iter().any(|(_, weight)| *weight > bound) {
            for &(lit, weight) in &terms {
                if weight > bound {
                    self.add_clause(vec![off, lit.inverted()]);
                }
            }
        }

        let counted: Vec<(Lit, usize)> = terms
            .into_iter()
            .filter(|(_, weight)| *weight <= bound)
            .collect();
        if counted.is_empty() || bound == 0 {
            // bound == 0 was handled by the exclusion clauses above.
            return activator;
        }

        // s[i][j]: after the first i+1 terms, the sum is >= j+1 (0-based j).
        let mut previous: Vec<Option<Var>> = vec![None; bound];
        for (i, &(lit, weight)) in counted.iter().enumerate() {
            let mut current: Vec<Option<Var>> = vec![None; bound];
            for slot in current.iter_mut() {
                *slot = Some(self.new_var());
            }

            // The term alone reaches sums 1..=weight.
            for j in 0..weight.min(bound) {
                let sum_var = current[j].expect("allocated above");
                self.add_clause(vec![off, lit.inverted(), Lit::pos(sum_var)]);
            }
            if i > 0 {
                for j in 0..bound {
                    // Carrying the previous count forward.
                    if let Some(prev) = previous[j] {
                        let sum_var = current[j].expect("allocated above");
                        self.add_clause(vec![off, Lit::neg(prev), Lit::pos(sum_var)]);
                    }
                    // Adding this term on top of the previous count.
                    if j + weight < bound {
                        if let Some(prev) = previous[j] {
                            let sum_var = current[j + weight].expect("allocated above");
                            self.add_clause(vec![
                                off,
                                Lit::neg(prev),
                                lit.inverted(),
                                Lit::pos(sum_var),
                            ]);
                        }
                    }
                    // Overflowing the bound is forbidden.
                    if j + weight >= bound {
                        if let Some(prev) = previous[j] {
                            self.add_clause(vec![off, Lit::neg(prev), lit.inverted()]);
                        }
                    }
                }
            }
            previous = current;
        }

        activator
    }

    /// Permanently asserts a literal, e.g. to freeze an activation.
    pub fn assert_lit(&mut self, lit: Lit) {
        self.units.push(lit);
    }
}

enum WatchOutcome {
    NewWatch(Lit),
    Unit(Lit),
    Satisfied,
    Conflict,
}

impl Default for SatSolver {
    fn default() -> Self {
        Self::new()
    }
}
