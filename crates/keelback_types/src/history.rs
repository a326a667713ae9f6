//! The `conda-meta/history` trail.
//!
//! Every transaction against a prefix appends one revision to the history
//! file. A revision is a header line `==> <timestamp> <==`, comment lines
//! describing what the user asked for, and one `+dist` or `-dist` line per
//! linked or unlinked package. The file is append-only and is the source of
//! truth for reconstructing which specs were requested explicitly.
//!
//! The writer emits exactly the documented grammar. The reader additionally
//! tolerates the historic comma-separated specs format that very old conda
//! versions produced.

use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
};

/// A change set to append to the history file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revision {
    /// The timestamp header, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,

    /// The command line that triggered the change, if known.
    pub cmd: Option<String>,

    /// The action and the specs the user supplied, e.g.
    /// `("update", ["python=3.11"])`.
    pub action_specs: Option<(String, Vec<String>)>,

    /// Distribution strings of packages removed by the transaction.
    pub removed: BTreeSet<String>,

    /// Distribution strings of packages added by the transaction.
    pub added: BTreeSet<String>,
}

/// One revision as parsed back from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRevision {
    /// The timestamp from the header line.
    pub timestamp: String,

    /// Raw comment lines including the leading `#`.
    pub comments: Vec<String>,

    /// Package lines; diff-prefixed (`+`/`-`) except in the initial
    /// revision where they may be bare.
    pub packages: BTreeSet<String>,
}

/// The parsed contents of a history file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHistory {
    /// All revisions, oldest first.
    pub revisions: Vec<HistoryRevision>,
}

/// A user request reconstructed from revision comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRequest {
    /// The revision timestamp.
    pub date: String,

    /// The command that was run, from `# cmd: ...`.
    pub cmd: Option<String>,

    /// The action, e.g. `install`, `update`, `remove`.
    pub action: Option<String>,

    /// Specs for install/update/create actions.
    pub update_specs: Vec<String>,

    /// Specs for remove actions.
    pub remove_specs: Vec<String>,
}

/// Errors from reading or writing history files.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The file could not be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read and append access to the history file of one prefix.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    /// History of the environment at the given prefix.
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        Self {
            path: prefix.as_ref().join("conda-meta").join("history"),
        }
    }

    /// History backed by an explicit file path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses the history file. A missing file is an empty history; content
    /// before the first revision header is ignored.
    pub fn parse(&self) -> Result<ParsedHistory, HistoryError> {
        if !self.path.exists() {
            return Ok(ParsedHistory::default());
        }
        Ok(Self::parse_str(&fs_err::read_to_string(&self.path)?))
    }

    /// Parses history from a string.
    pub fn parse_str(contents: &str) -> ParsedHistory {
        let header = lazy_regex::regex!(r"^==>\s*(.+?)\s*<==$");
        let mut revisions: Vec<HistoryRevision> = Vec::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = header.captures(line) {
                revisions.push(HistoryRevision {
                    timestamp: caps[1].to_owned(),
                    comments: Vec::new(),
                    packages: BTreeSet::new(),
                });
            } else if let Some(revision) = revisions.last_mut() {
                if line.starts_with('#') {
                    revision.comments.push(line.to_owned());
                } else {
                    revision.packages.insert(line.to_owned());
                }
            }
        }

        ParsedHistory { revisions }
    }

    /// Appends one revision in the documented format.
    pub fn append(&self, revision: &Revision) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "==> {} <==", revision.timestamp)?;
        if let Some(cmd) = &revision.cmd {
            writeln!(file, "# cmd: {cmd}")?;
        }
        if let Some((action, specs)) = &revision.action_specs {
            let quoted: Vec<String> = specs.iter().map(|s| format!("'{s}'")).collect();
            writeln!(file, "# {action} specs: [{}]", quoted.join(", "))?;
        }
        for dist in &revision.removed {
            writeln!(file, "-{dist}")?;
        }
        for dist in &revision.added {
            writeln!(file, "+{dist}")?;
        }
        Ok(())
    }

    /// Extracts the user requests recorded in the history, oldest first.
    pub fn user_requests(&self) -> Result<Vec<UserRequest>, HistoryError> {
        Ok(self.parse()?.user_requests())
    }
}

impl ParsedHistory {
    /// Returns true when no revision has been recorded.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// The most recent revision, if any.
    pub fn latest(&self) -> Option<&HistoryRevision> {
        self.revisions.last()
    }

    /// Extracts the structured user requests from all revision comments.
    pub fn user_requests(&self) -> Vec<UserRequest> {
        let cmd_line = lazy_regex::regex!(r"^#\s*cmd:\s*(.+)$");
        let specs_line = lazy_regex::regex!(r"^#\s*(\w+)\s+specs:\s*(.*)$");

        let mut requests = Vec::new();
        for revision in &self.revisions {
            let mut request = UserRequest {
                date: revision.timestamp.clone(),
                ..UserRequest::default()
            };

            for comment in &revision.comments {
                if let Some(caps) = cmd_line.captures(comment) {
                    request.cmd = Some(caps[1].to_owned());
                }
                if let Some(caps) = specs_line.captures(comment) {
                    let action = caps[1].to_owned();
                    let specs = parse_specs_list(caps.get(2).map_or("", |m| m.as_str()));
                    match action.as_str() {
                        "remove" | "uninstall" => request.remove_specs = specs,
                        _ => request.update_specs = specs,
                    }
                    request.action = Some(action);
                }
            }

            if request.action.is_some() || request.cmd.is_some() {
                requests.push(request);
            }
        }
        requests
    }

    /// The set of specs most recently requested for each package name,
    /// used to reconstruct `requested_spec` fields after the fact.
    pub fn requested_specs(&self) -> Vec<String> {
        let mut specs: Vec<String> = Vec::new();
        for request in self.user_requests() {
            for spec in request.update_specs {
                specs.retain(|existing| spec_name(existing) != spec_name(&spec));
                specs.push(spec);
            }
            for removed in request.remove_specs {
                specs.retain(|existing| spec_name(existing) != spec_name(&removed));
            }
        }
        specs
    }
}

fn spec_name(spec: &str) -> &str {
    spec.split([' ', '=', '<', '>', '!', '~'])
        .next()
        .unwrap_or(spec)
}

/// Parses `['a', 'b>=1']` as written by this crate and modern conda, or the
/// ancient bare comma-separated form where a comma followed by an operator
/// continues the previous spec.
fn parse_specs_list(input: &str) -> Vec<String> {
    let input = input.trim();
    if input.is_empty() {
        return Vec::new();
    }

    if let Some(list) = input.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return list
            .split(',')
            .map(|spec| spec.trim().trim_matches(['\'', '"']).to_owned())
            .filter(|spec| !spec.is_empty())
            .collect();
    }

    let mut specs: Vec<String> = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with(['>', '<', '=', '!']) && !specs.is_empty() {
            let last = specs.last_mut().expect("not empty");
            last.push(',');
            last.push_str(part);
        } else {
            specs.push(part.to_owned());
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{History, Revision};

    const SAMPLE: &str = "\
==> 2026-01-15 10:30:00 <==
# cmd: conda create -n test python=3.11
# update specs: ['python=3.11']
+openssl-3.2.0-h7f8727e_0
+python-3.11.4-h2755cc3_0

==> 2026-01-16 14:20:00 <==
# cmd: conda install numpy
# update specs: ['numpy']
+numpy-1.26.3-py311h08b1b3b_0

==> 2026-01-17 09:00:00 <==
# cmd: conda remove numpy
# remove specs: ['numpy']
-numpy-1.26.3-py311h08b1b3b_0
";

    #[test]
    fn parses_revisions() {
        let parsed = History::parse_str(SAMPLE);
        assert_eq!(parsed.revisions.len(), 3);
        assert_eq!(parsed.revisions[0].timestamp, "2026-01-15 10:30:00");
        assert_eq!(parsed.revisions[0].packages.len(), 2);
        assert!(parsed.revisions[2]
            .packages
            .contains("-numpy-1.26.3-py311h08b1b3b_0"));
        assert_eq!(parsed.latest().unwrap().timestamp, "2026-01-17 09:00:00");
    }

    #[test]
    fn extracts_user_requests() {
        let requests = History::parse_str(SAMPLE).user_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].update_specs, vec!["python=3.11"]);
        assert_eq!(requests[0].action.as_deref(), Some("update"));
        assert_eq!(requests[2].remove_specs, vec!["numpy"]);
    }

    #[test]
    fn requested_specs_follow_the_trail() {
        let specs = History::parse_str(SAMPLE).requested_specs();
        assert_eq!(specs, vec!["python=3.11"]);
    }

    #[test]
    fn old_comma_format() {
        let contents = "\
==> 2014-03-02 10:00:00 <==
# cmd: conda install param
# update specs: param >=1.5.1,<2.0,python>=3.5
+param-1.5.1-0
";
        let requests = History::parse_str(contents).user_requests();
        assert_eq!(
            requests[0].update_specs,
            vec!["param >=1.5.1,<2.0", "python>=3.5"]
        );
    }

    #[test]
    fn append_then_parse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path());

        history
            .append(&Revision {
                timestamp: "2026-02-01 08:00:00".to_owned(),
                cmd: Some("conda install zlib".to_owned()),
                action_specs: Some(("update".to_owned(), vec!["zlib".to_owned()])),
                removed: BTreeSet::new(),
                added: BTreeSet::from(["zlib-1.2.13-h166bdaf_4".to_owned()]),
            })
            .unwrap();
        history
            .append(&Revision {
                timestamp: "2026-02-02 08:00:00".to_owned(),
                cmd: None,
                action_specs: Some(("remove".to_owned(), vec!["zlib".to_owned()])),
                removed: BTreeSet::from(["zlib-1.2.13-h166bdaf_4".to_owned()]),
                added: BTreeSet::new(),
            })
            .unwrap();

        let parsed = history.parse().unwrap();
        assert_eq!(parsed.revisions.len(), 2);
        assert!(parsed.revisions[0]
            .packages
            .contains("+zlib-1.2.13-h166bdaf_4"));
        assert!(parsed.revisions[1]
            .packages
            .contains("-zlib-1.2.13-h166bdaf_4"));
        assert!(parsed.requested_specs().is_empty());
    }

    #[test]
    fn missing_file_is_empty_history() {
        let history = History::from_path("/definitely/not/here/history");
        assert!(history.parse().unwrap().is_empty());
    }

    #[test]
    fn junk_before_first_header_is_ignored() {
        let parsed = History::parse_str("garbage\n# stray\n==> 2026-01-01 00:00:00 <==\n+p-1-0\n");
        assert_eq!(parsed.revisions.len(), 1);
        assert!(parsed.revisions[0].comments.is_empty());
    }
}
