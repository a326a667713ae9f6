//! Lexicographic minimization of pseudo-Boolean objectives.
//!
//! Each objective is a weighted sum over literals. Starting from the
//! incumbent model, the bound is tightened one step below the incumbent's
//! value until the solver reports unsatisfiable; the last satisfiable value
//! is the optimum and is frozen as a permanent constraint before the next
//! objective runs.

use crate::sat::{Lit, SatResult, SatSolver};

/// Evaluates a weighted objective against a model.
pub(crate) fn evaluate(terms: &[(Lit, u64)], model: &[bool]) -> u64 {
    terms
        .iter()
        .filter(|(lit, _)| {
            let value = model[lit.var().0 as usize];
            value != lit.is_neg()
        })
        .map(|(_, weight)| *weight)
        .sum()
}

/// Minimizes the objective under the given assumptions, starting from the
/// incumbent model. On return the model is optimal for the objective and
/// the optimum is frozen into the solver.
pub(crate) fn minimize(
    solver: &mut SatSolver,
    assumptions: &[Lit],
    terms: &[(Lit, u64)],
    model: &mut Vec<bool>,
) -> u64 {
    if terms.is_empty() {
        return 0;
    }

    let mut best = evaluate(terms, model);
    while best > 0 {
        let probe = solver.add_weighted_at_most(terms, best - 1);
        let mut probe_assumptions = assumptions.to_vec();
        probe_assumptions.push(probe);

        let result = solver.solve(&probe_assumptions);
        // Retract the probe either way; the optimum is frozen separately.
        solver.assert_lit(probe.inverted());

        match result {
            SatResult::Satisfiable(improved) => {
                let value = evaluate(terms, &improved);
                debug_assert!(value < best, "the bound must force an improvement");
                *model = improved;
                best = value;
            }
            SatResult::Unsatisfiable => break,
        }
    }

    let frozen = solver.add_weighted_at_most(terms, best);
    solver.assert_lit(frozen);
    best
}

#[cfg(test)]
mod test {
    use super::minimize;
    use crate::sat::{Lit, SatResult, SatSolver};

    #[test]
    fn minimizes_true_literal_count() {
        let mut solver = SatSolver::new();
        let vars: Vec<_> = (0..4).map(|_| solver.new_var()).collect();
        // At least two of the four, pairwise free otherwise.
        solver.add_clause(vec![Lit::pos(vars[0]), Lit::pos(vars[1])]);
        solver.add_clause(vec![Lit::pos(vars[2]), Lit::pos(vars[3])]);

        let mut model = match solver.solve(&[]) {
            SatResult::Satisfiable(model) => model,
            SatResult::Unsatisfiable => unreachable!("the problem is satisfiable"),
        };

        let terms: Vec<(Lit, u64)> = vars.iter().map(|&v| (Lit::pos(v), 1)).collect();
        let optimum = minimize(&mut solver, &[], &terms, &mut model);
        assert_eq!(optimum, 2);

        // The frozen optimum binds later solves.
        let later = solver.solve(&[]);
        let SatResult::Satisfiable(later_model) = later else {
            panic!("still satisfiable after freezing");
        };
        assert_eq!(super::evaluate(&terms, &later_model), 2);
    }

    #[test]
    fn respects_earlier_constraints() {
        let mut solver = SatSolver::new();
        let a = solver.new_var();
        let b = solver.new_var();
        // a is forced; b is free.
        solver.add_clause(vec![Lit::pos(a)]);

        let mut model = match solver.solve(&[]) {
            SatResult::Satisfiable(model) => model,
            SatResult::Unsatisfiable => unreachable!(),
        };
        let terms = vec![(Lit::pos(a), 1), (Lit::pos(b), 1)];
        assert_eq!(minimize(&mut solver, &[], &terms, &mut model), 1);
        assert!(model[a.0 as usize]);
        assert!(!model[b.0 as usize]);
    }
}
