//! Reduction of a dependency problem to propositional clauses.
//!
//! Every candidate record that could transitively satisfy a user spec (or
//! that is currently installed) becomes a Boolean variable. Clauses encode:
//! at most one candidate per package name, dependency implications, run
//! constraints as pairwise exclusions, user specs as hard requirements (each
//! behind an activation literal so unsatisfiable subsets can be probed), and
//! the track-feature coupling rule.

use std::{cmp::Ordering, collections::BTreeMap};

use fxhash::{FxHashMap, FxHashSet};
use keelback_types::{MatchSpec, PackageName, ParseStrictness, RepoDataRecord};

use crate::{
    sat::{Lit, SatSolver, Var},
    SolveError,
};

/// One variable of the encoded problem.
pub(crate) struct Candidate<'a> {
    /// The record behind the variable.
    pub record: &'a RepoDataRecord,

    /// True when this exact record is linked in the prefix.
    pub installed: bool,
}

/// The encoded problem: the solver plus the mapping back to records.
pub(crate) struct Problem<'a> {
    pub solver: SatSolver,

    /// Candidate records; the variable of `candidates[i]` is `Var(i)`.
    pub candidates: Vec<Candidate<'a>>,

    /// Candidate indices per package name, best candidate first.
    pub by_name: BTreeMap<&'a PackageName, Vec<usize>>,

    /// One activation literal per user spec; solving is done under the
    /// assumption that all of them hold.
    pub spec_activators: Vec<Lit>,
}

impl<'a> Problem<'a> {
    /// Builds the reduced index and all clauses for the given task inputs.
    /// `channel_priorities` only influences the candidate ordering; the
    /// channel objective itself is applied by the caller.
    pub fn build(
        available: &'a [RepoDataRecord],
        installed: &'a [RepoDataRecord],
        specs: &[MatchSpec],
        channel_priorities: &[(String, u32)],
    ) -> Result<Problem<'a>, SolveError> {
        // Group every known record by name; installed records participate as
        // candidates even when no channel carries them anymore.
        let mut groups: BTreeMap<&'a PackageName, Vec<(&'a RepoDataRecord, bool)>> =
            BTreeMap::new();
        for record in available {
            groups
                .entry(&record.package_record.name)
                .or_default()
                .push((record, false));
        }
        for record in installed {
            let group = groups.entry(&record.package_record.name).or_default();
            match group
                .iter_mut()
                .find(|(known, _)| same_artifact(known, record))
            {
                Some(entry) => entry.1 = true,
                None => group.push((record, true)),
            }
        }

        // Order each group by candidate preference; among otherwise equal
        // candidates the better channel comes first.
        let priority_of = |record: &RepoDataRecord| {
            channel_priorities
                .iter()
                .find(|(channel, _)| channel == &record.channel)
                .map_or(0, |(_, priority)| *priority)
        };
        for group in groups.values_mut() {
            group.sort_by(|(a, _), (b, _)| {
                compare_candidates(a, b)
                    .then_with(|| priority_of(a).cmp(&priority_of(b)))
                    .then_with(|| a.file_name.cmp(&b.file_name))
            });
        }

        // The reduced index: every name reachable from the user specs or the
        // installed set through `depends` edges.
        let mut reduced: FxHashSet<&'a PackageName> = FxHashSet::default();
        let mut queue: Vec<&'a PackageName> = Vec::new();

        let mut enqueue_spec_names = |spec: &MatchSpec,
                                      reduced: &mut FxHashSet<&'a PackageName>,
                                      queue: &mut Vec<&'a PackageName>| {
            for (&name, _) in groups.iter() {
                if spec.name.matches_name(name) && reduced.insert(name) {
                    queue.push(name);
                }
            }
        };

        for spec in specs {
            enqueue_spec_names(spec, &mut reduced, &mut queue);
        }
        for record in installed {
            let name = &record.package_record.name;
            if groups.contains_key(name) && reduced.insert(name) {
                queue.push(name);
            }
        }

        let mut dependency_specs: FxHashMap<&'a str, MatchSpec> = FxHashMap::default();
        while let Some(name) = queue.pop() {
            let group = &groups[name];
            for (record, _) in group {
                for dep in &record.package_record.depends {
                    let spec = parse_dependency(&mut dependency_specs, dep)?;
                    enqueue_spec_names(&spec, &mut reduced, &mut queue);
                }
            }
        }

        // Allocate variables: names in lexicographic order, candidates in
        // preference order, so variable numbering is deterministic.
        let mut solver = SatSolver::new();
        let mut candidates: Vec<Candidate<'a>> = Vec::new();
        let mut by_name: BTreeMap<&'a PackageName, Vec<usize>> = BTreeMap::new();
        for (&name, group) in groups.iter() {
            if !reduced.contains(name) {
                continue;
            }
            let mut indices = Vec::with_capacity(group.len());
            for &(record, installed) in group {
                let var = solver.new_var();
                debug_assert_eq!(var.0 as usize, candidates.len());
                indices.push(candidates.len());
                candidates.push(Candidate { record, installed });
            }
            by_name.insert(name, indices);
        }

        let mut problem = Problem {
            solver,
            candidates,
            by_name,
            spec_activators: Vec::new(),
        };

        problem.add_at_most_one_per_name();
        problem.add_dependency_clauses(&mut dependency_specs)?;
        problem.add_constrains_clauses(&mut dependency_specs)?;
        problem.add_track_feature_clauses();
        problem.add_user_spec_clauses(specs);

        Ok(problem)
    }

    /// The variable of candidate `i`.
    pub fn var_of(&self, index: usize) -> Var {
        Var(index as u32)
    }

    /// Candidate indices whose record matches the spec.
    pub fn matching_candidates(&self, spec: &MatchSpec) -> Vec<usize> {
        match spec.name.as_exact() {
            Some(name) => self
                .by_name
                .get(name)
                .into_iter()
                .flatten()
                .copied()
                .filter(|&i| spec.matches_repodata(self.candidates[i].record))
                .collect(),
            None => self
                .by_name
                .values()
                .flatten()
                .copied()
                .filter(|&i| spec.matches_repodata(self.candidates[i].record))
                .collect(),
        }
    }

    fn add_at_most_one_per_name(&mut self) {
        for indices in self.by_name.values() {
            for (position, &first) in indices.iter().enumerate() {
                for &second in &indices[position + 1..] {
                    self.solver.add_clause(vec![
                        Lit::neg(Var(first as u32)),
                        Lit::neg(Var(second as u32)),
                    ]);
                }
            }
        }
    }

    fn add_dependency_clauses(
        &mut self,
        cache: &mut FxHashMap<&'a str, MatchSpec>,
    ) -> Result<(), SolveError> {
        for index in 0..self.candidates.len() {
            let depends = &self.candidates[index].record.package_record.depends;
            // Clone the dependency strings' parses up front; the clause
            // generation below needs `&mut self`.
            let mut clauses = Vec::new();
            for dep in depends {
                let dep: &'a str = dep.as_str();
                let spec = parse_dependency(cache, dep)?;
                let mut lits = vec![Lit::neg(Var(index as u32))];
                lits.extend(
                    self.matching_candidates(&spec)
                        .into_iter()
                        .map(|i| Lit::pos(Var(i as u32))),
                );
                clauses.push(lits);
            }
            for clause in clauses {
                self.solver.add_clause(clause);
            }
        }
        Ok(())
    }

    fn add_constrains_clauses(
        &mut self,
        cache: &mut FxHashMap<&'a str, MatchSpec>,
    ) -> Result<(), SolveError> {
        for index in 0..self.candidates.len() {
            let constrains = &self.candidates[index].record.package_record.constrains;
            let mut clauses = Vec::new();
            for constraint in constrains {
                let constraint: &'a str = constraint.as_str();
                let spec = parse_dependency(cache, constraint)?;
                let Some(name) = spec.name.as_exact() else {
                    continue;
                };
                // Candidates of the constrained name that violate the
                // constraint cannot be installed next to this candidate.
                for &other in self.by_name.get(name).into_iter().flatten() {
                    if !spec.matches_repodata(self.candidates[other].record) {
                        clauses.push(vec![
                            Lit::neg(Var(index as u32)),
                            Lit::neg(Var(other as u32)),
                        ]);
                    }
                }
            }
            for clause in clauses {
                self.solver.add_clause(clause);
            }
        }
        Ok(())
    }

    /// An active tracked feature forces affected names onto feature builds:
    /// for every tracker of feature `f` and every candidate of a name that
    /// has `f`-builds but which itself lacks `f`, the two exclude each other.
    fn add_track_feature_clauses(&mut self) {
        let mut features: FxHashSet<&str> = FxHashSet::default();
        for candidate in &self.candidates {
            features.extend(
                candidate
                    .record
                    .package_record
                    .track_features
                    .iter()
                    .map(String::as_str),
            );
        }

        let mut clauses = Vec::new();
        for feature in features {
            let trackers: Vec<usize> = (0..self.candidates.len())
                .filter(|&i| {
                    self.candidates[i]
                        .record
                        .package_record
                        .track_features
                        .iter()
                        .any(|f| f == feature)
                })
                .collect();

            for indices in self.by_name.values() {
                let group_has_feature = indices.iter().any(|&i| {
                    self.candidates[i]
                        .record
                        .package_record
                        .feature_set()
                        .any(|f| f == feature)
                });
                if !group_has_feature {
                    continue;
                }
                for &candidate in indices {
                    let lacks_feature = !self.candidates[candidate]
                        .record
                        .package_record
                        .feature_set()
                        .any(|f| f == feature);
                    if !lacks_feature {
                        continue;
                    }
                    for &tracker in &trackers {
                        if tracker != candidate {
                            clauses.push(vec![
                                Lit::neg(Var(tracker as u32)),
                                Lit::neg(Var(candidate as u32)),
                            ]);
                        }
                    }
                }
            }
        }
        for clause in clauses {
            self.solver.add_clause(clause);
        }
    }

    /// Every user spec must be satisfied by some candidate. Each clause is
    /// guarded by an activation literal so the unsat analysis can leave
    /// individual specs out.
    fn add_user_spec_clauses(&mut self, specs: &[MatchSpec]) {
        for spec in specs {
            let activator = Lit::pos(self.solver.new_var());
            let mut lits = vec![activator.inverted()];
            lits.extend(
                self.matching_candidates(spec)
                    .into_iter()
                    .map(|i| Lit::pos(Var(i as u32))),
            );
            self.solver.add_clause(lits);
            self.spec_activators.push(activator);
        }
    }
}

fn same_artifact(a: &RepoDataRecord, b: &RepoDataRecord) -> bool {
    let (a, b) = (&a.package_record, &b.package_record);
    a.name == b.name
        && a.version == b.version
        && a.build == b.build
        && a.subdir == b.subdir
        && a.md5 == b.md5
}

fn parse_dependency<'a>(
    cache: &mut FxHashMap<&'a str, MatchSpec>,
    dep: &'a str,
) -> Result<MatchSpec, SolveError> {
    if let Some(spec) = cache.get(dep) {
        return Ok(spec.clone());
    }
    let spec = MatchSpec::from_str(dep, ParseStrictness::Lenient)
        .map_err(|source| SolveError::InvalidDependency {
            spec: dep.to_owned(),
            source,
        })?;
    cache.insert(dep, spec.clone());
    Ok(spec)
}

/// The conda candidate preference: builds without tracked features first,
/// then higher versions, higher build numbers, newer timestamps. Callers
/// append the channel priority and the archive filename as deterministic
/// tie-breaks.
pub(crate) fn compare_candidates(a: &RepoDataRecord, b: &RepoDataRecord) -> Ordering {
    let (ra, rb) = (&a.package_record, &b.package_record);
    ra.track_features
        .is_empty()
        .cmp(&rb.track_features.is_empty())
        .reverse()
        .then_with(|| ra.version.cmp(&rb.version).reverse())
        .then_with(|| ra.build_number.cmp(&rb.build_number).reverse())
        .then_with(|| ra.timestamp.cmp(&rb.timestamp).reverse())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use keelback_types::{MatchSpec, ParseStrictness};

    use super::{compare_candidates, Problem};
    use crate::test_index::record;

    #[test]
    fn candidate_preference_order() {
        let old = record("python", "3.10.0", "h0_0", &[]);
        let new = record("python", "3.11.0", "h0_0", &[]);
        let rebuild = record("python", "3.11.0", "h0_1", &[]);
        let mut tracked = record("python", "3.12.0", "h0_0", &[]);
        tracked.package_record.track_features = vec!["experimental".to_owned()];

        let mut candidates = vec![&tracked, &old, &rebuild, &new];
        candidates.sort_by(|a, b| compare_candidates(a, b));
        let builds: Vec<&str> = candidates
            .iter()
            .map(|c| c.package_record.build.as_str())
            .collect();
        // Rebuild of 3.11 first (higher build number), the tracked 3.12 last.
        assert_eq!(builds, vec!["h0_1", "h0_0", "h0_0", "h0_0"]);
        assert_eq!(candidates[3].package_record.version.to_string(), "3.12.0");
    }

    #[test]
    fn reduced_index_follows_depends() {
        let available = vec![
            record("python", "3.11.0", "h0_0", &["openssl >=3"]),
            record("openssl", "3.1.0", "h0_0", &[]),
            record("unrelated", "1.0", "h0_0", &[]),
        ];
        let specs = vec![MatchSpec::from_str("python", ParseStrictness::Strict).unwrap()];
        let problem = Problem::build(&available, &[], &specs, &[]).unwrap();

        let names: Vec<&str> = problem.by_name.keys().map(|name| name.as_str()).collect();
        assert_eq!(names, vec!["openssl", "python"]);
    }

    #[test]
    fn installed_records_enter_the_index() {
        let available = vec![record("python", "3.11.0", "h0_0", &[])];
        let installed = vec![record("legacy", "0.9", "h0_0", &[])];
        let specs = vec![MatchSpec::from_str("python", ParseStrictness::Strict).unwrap()];
        let problem = Problem::build(&available, &installed, &specs, &[]).unwrap();
        assert!(problem
            .by_name
            .keys()
            .any(|name| name.as_str() == "legacy"));
    }
}
