#![deny(missing_docs)]

//! The keelback dependency resolver.
//!
//! Dependency selection is reduced to a propositional satisfiability
//! problem: every candidate package record becomes a Boolean variable,
//! dependency relations become clauses, and a sequence of pseudo-Boolean
//! objectives is minimized lexicographically over the models:
//!
//! 1. user specs are hard clauses (an unsatisfiable set is reported with a
//!    minimal unsatisfiable subset of the specs),
//! 2. as few installed packages as possible are removed,
//! 3. as few tracked features as possible are active,
//! 4. every selected package is as up to date as possible,
//! 5. as few feature builds as possible are selected,
//! 6. as few packages as possible come from lower-priority channels,
//! 7. as few packages as possible are installed overall.
//!
//! The solver is single-threaded and fully deterministic: identical inputs
//! produce identical solutions, byte for byte.

mod optimize;
mod problem;
pub mod sat;
#[cfg(test)]
pub(crate) mod test_index;

use keelback_types::{MatchSpec, ParseMatchSpecError, RepoDataRecord};
use problem::Problem;
use sat::{Lit, SatResult};
use thiserror::Error;
use tracing::debug;

/// The inputs of one solver run.
#[derive(Debug, Clone, Default)]
pub struct SolverTask<'a> {
    /// All candidate records, typically the assembled index. Virtual
    /// packages participate as constraint-only records.
    pub available: &'a [RepoDataRecord],

    /// The records currently linked in the target prefix.
    pub installed: &'a [RepoDataRecord],

    /// Priorities per canonical channel name; lower numbers win. Channels
    /// not listed count as priority 0.
    pub channel_priorities: &'a [(String, u32)],

    /// The user's requested specs.
    pub specs: Vec<MatchSpec>,
}

/// Errors from the resolver.
#[derive(Debug, Error)]
pub enum SolveError {
    /// A `depends` or `constrains` string of a record failed to parse.
    #[error("invalid dependency spec '{spec}': {source}")]
    InvalidDependency {
        /// The offending spec string.
        spec: String,
        /// The parse failure.
        #[source]
        source: ParseMatchSpecError,
    },

    /// The specs cannot all be satisfied. `conflicting_specs` is a minimal
    /// subset of the user specs that is already unsatisfiable on its own.
    #[error("the following specs cannot be satisfied together: {}", format_specs(conflicting_specs))]
    Unsatisfiable {
        /// A minimal unsatisfiable subset of the requested specs.
        conflicting_specs: Vec<MatchSpec>,
    },
}

fn format_specs(specs: &[MatchSpec]) -> String {
    specs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Computes the target state for the task: the set of records that should
/// be linked after the transaction. Virtual packages are used as
/// constraints but never appear in the result. The result is sorted by
/// package name.
pub fn solve(task: &SolverTask<'_>) -> Result<Vec<RepoDataRecord>, SolveError> {
    let mut problem = Problem::build(
        task.available,
        task.installed,
        &task.specs,
        task.channel_priorities,
    )?;
    let assumptions: Vec<Lit> = problem.spec_activators.clone();

    let mut model = match problem.solver.solve(&assumptions) {
        SatResult::Satisfiable(model) => model,
        SatResult::Unsatisfiable => {
            let conflicting_specs = minimal_unsat_subset(&mut problem, &task.specs);
            return Err(SolveError::Unsatisfiable { conflicting_specs });
        }
    };

    // Objective 2: preserve installed packages.
    let removals: Vec<(Lit, u64)> = problem
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.installed)
        .map(|(i, _)| (Lit::neg(problem.var_of(i)), 1))
        .collect();
    let removed = optimize::minimize(&mut problem.solver, &assumptions, &removals, &mut model);
    debug!(removed, "minimized removals");

    // Objective 3: minimize active tracked features.
    let tracked: Vec<(Lit, u64)> = problem
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.record.package_record.track_features.is_empty())
        .map(|(i, c)| {
            (
                Lit::pos(problem.var_of(i)),
                c.record.package_record.track_features.len() as u64,
            )
        })
        .collect();
    optimize::minimize(&mut problem.solver, &assumptions, &tracked, &mut model);

    // Objective 4: staleness. Within each name group the candidates are
    // already ordered best-first; the position is the weight.
    let staleness: Vec<(Lit, u64)> = problem
        .by_name
        .values()
        .flat_map(|indices| {
            indices
                .iter()
                .enumerate()
                .filter(|(position, _)| *position > 0)
                .map(|(position, &candidate)| {
                    (Lit::pos(problem.var_of(candidate)), position as u64)
                })
                .collect::<Vec<_>>()
        })
        .collect();
    optimize::minimize(&mut problem.solver, &assumptions, &staleness, &mut model);

    // Objective 5: minimize feature builds.
    let features: Vec<(Lit, u64)> = problem
        .candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let count = c.record.package_record.feature_set().count() as u64;
            (count > 0).then_some((Lit::pos(problem.var_of(i)), count))
        })
        .collect();
    optimize::minimize(&mut problem.solver, &assumptions, &features, &mut model);

    // Objective 6: prefer the best available channel per name.
    let priority_of = |record: &RepoDataRecord| {
        task.channel_priorities
            .iter()
            .find(|(channel, _)| channel == &record.channel)
            .map_or(0, |(_, priority)| *priority)
    };
    let worse_channel: Vec<(Lit, u64)> = problem
        .by_name
        .values()
        .flat_map(|indices| {
            let best = indices
                .iter()
                .map(|&i| priority_of(problem.candidates[i].record))
                .min()
                .unwrap_or(0);
            indices
                .iter()
                .filter(|&&i| priority_of(problem.candidates[i].record) > best)
                .map(|&i| (Lit::pos(problem.var_of(i)), 1))
                .collect::<Vec<_>>()
        })
        .collect();
    optimize::minimize(&mut problem.solver, &assumptions, &worse_channel, &mut model);

    // Objective 7: no unnecessary packages.
    let installed_count: Vec<(Lit, u64)> = problem
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.record.package_record.name.is_virtual())
        .map(|(i, _)| (Lit::pos(problem.var_of(i)), 1))
        .collect();
    optimize::minimize(&mut problem.solver, &assumptions, &installed_count, &mut model);

    // Extract the selected records, dropping the constraint-only virtual
    // packages. Name order keeps the output stable.
    let mut solution: Vec<RepoDataRecord> = problem
        .candidates
        .iter()
        .enumerate()
        .filter(|(i, candidate)| {
            model[*i] && !candidate.record.package_record.name.is_virtual()
        })
        .map(|(_, candidate)| candidate.record.clone())
        .collect();
    solution.sort_by(|a, b| {
        a.package_record
            .name
            .cmp(&b.package_record.name)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    Ok(solution)
}

/// Deletion-based minimal unsatisfiable subset over the user specs: drop
/// one spec at a time, and keep it out when the rest is still
/// unsatisfiable. What remains cannot be shrunk further.
fn minimal_unsat_subset(problem: &mut Problem<'_>, specs: &[MatchSpec]) -> Vec<MatchSpec> {
    let mut active: Vec<usize> = (0..specs.len()).collect();

    for spec_index in 0..specs.len() {
        let Some(position) = active.iter().position(|&i| i == spec_index) else {
            continue;
        };
        let trial: Vec<Lit> = active
            .iter()
            .filter(|&&i| i != spec_index)
            .map(|&i| problem.spec_activators[i])
            .collect();
        if problem.solver.solve(&trial) == SatResult::Unsatisfiable {
            active.remove(position);
        }
    }

    active.into_iter().map(|i| specs[i].clone()).collect()
}
