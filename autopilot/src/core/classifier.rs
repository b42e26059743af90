//! Deterministic classification of a staged diff.
//!
//! The change gate feeds raw `git diff --cached --name-status` and
//! `--numstat` output through these parsers and lets [`classify`] decide
//! whether the staged set is worth committing.

use serde::{Deserialize, Serialize};

use crate::core::signals::truncate_chars;

const DOC_PREFIXES: &[&str] = &["docs/", "doc/", ".github/"];
const DOC_FILE_NAMES: &[&str] = &[
    "readme.md",
    "changelog.md",
    "contributing.md",
    "code_of_conduct.md",
    "security.md",
    "support.md",
    "license",
    "citation.cff",
];
const DOC_EXTENSIONS: &[&str] = &[
    ".md", ".markdown", ".mdx", ".rst", ".txt", ".adoc", ".org", ".rtf", ".pdf",
];
const KNOWN_STATUSES: &[char] = &['A', 'M', 'D', 'R', 'C', 'T', 'U'];

/// Maximum entries listed in a change summary before `+N files`.
pub const SUMMARY_MAX_ITEMS: usize = 8;
pub const SUMMARY_MAX_CHARS: usize = 180;

/// One `(status, path)` line of the staged name-status diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub status: char,
    pub path: String,
}

/// Added/deleted line counts for one staged path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCount {
    pub path: String,
    pub added: u64,
    pub deleted: u64,
}

/// Staged diff as seen by the change gate. Derived fresh each round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedChangeSet {
    pub entries: Vec<StagedEntry>,
    /// Only collected when a threshold is configured.
    pub line_counts: Option<Vec<LineCount>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePolicy {
    /// An empty staged diff fails the attempt instead of ending the round.
    pub require_code_changes: bool,
    pub require_non_doc_changes: bool,
    pub min_non_doc_files: usize,
    pub min_non_doc_lines: u64,
}

impl ChangePolicy {
    pub fn has_threshold(&self) -> bool {
        self.min_non_doc_files > 0 || self.min_non_doc_lines > 0
    }
}

/// Non-doc file and line totals over a staged diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonDocTally {
    pub files: usize,
    pub lines: u64,
}

impl NonDocTally {
    pub fn from_line_counts(rows: &[LineCount]) -> Self {
        rows.iter()
            .filter(|row| !is_doc_path(&row.path))
            .fold(Self::default(), |tally, row| Self {
                files: tally.files + 1,
                lines: tally.lines + row.added + row.deleted,
            })
    }

    pub fn meets(&self, policy: &ChangePolicy) -> bool {
        self.files >= policy.min_non_doc_files && self.lines >= policy.min_non_doc_lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerdict {
    NoChanges,
    DocsOnly,
    BelowThreshold(NonDocTally),
    Substantive,
}

/// True when `path` is documentation (doc directory, known doc file or doc extension).
pub fn is_doc_path(path: &str) -> bool {
    let lowered = path.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    if DOC_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
        return true;
    }
    let file_name = lowered.rsplit('/').next().unwrap_or(&lowered);
    if DOC_FILE_NAMES.contains(&file_name) {
        return true;
    }
    DOC_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

/// Parse `git diff --name-status` output. Unknown status letters become `M`.
pub fn parse_name_status(output: &str) -> Vec<StagedEntry> {
    output
        .lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.is_empty() {
                return None;
            }
            let (status_raw, path) = line.split_once('\t').unwrap_or((line, ""));
            let path = path.trim();
            if path.is_empty() {
                return None;
            }
            let status = status_raw
                .trim()
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase())
                .filter(|c| KNOWN_STATUSES.contains(c))
                .unwrap_or('M');
            Some(StagedEntry {
                status,
                path: path.to_string(),
            })
        })
        .collect()
}

/// Parse `git diff --numstat` output. Binary entries (`-`) count as one line each way.
pub fn parse_numstat(output: &str) -> Vec<LineCount> {
    output
        .lines()
        .filter_map(|raw| {
            let mut parts = raw.trim().splitn(3, '\t');
            let added = parts.next()?.trim();
            let deleted = parts.next()?.trim();
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(LineCount {
                path: path.to_string(),
                added: added.parse().unwrap_or(1),
                deleted: deleted.parse().unwrap_or(1),
            })
        })
        .collect()
}

/// Human-readable summary: `M src/a.rs, A src/b.rs, +3 files`.
pub fn summarize_changes(entries: &[StagedEntry]) -> String {
    if entries.is_empty() {
        return "no file changes".to_string();
    }
    let mut summary = entries
        .iter()
        .take(SUMMARY_MAX_ITEMS)
        .map(|entry| format!("{} {}", entry.status, entry.path))
        .collect::<Vec<_>>()
        .join(", ");
    if entries.len() > SUMMARY_MAX_ITEMS {
        summary.push_str(&format!(", +{} files", entries.len() - SUMMARY_MAX_ITEMS));
    }
    truncate_chars(&summary, SUMMARY_MAX_CHARS - 3)
}

/// True when line counts are needed to finish classifying `entries`.
pub fn needs_line_counts(entries: &[StagedEntry], policy: &ChangePolicy) -> bool {
    policy.has_threshold() && !entries.is_empty() && !is_docs_only(entries, policy)
}

fn is_docs_only(entries: &[StagedEntry], policy: &ChangePolicy) -> bool {
    policy.require_non_doc_changes && entries.iter().all(|entry| is_doc_path(&entry.path))
}

/// Classify a staged change set. Checks are ordered: empty, docs-only, thresholds.
pub fn classify(changes: &StagedChangeSet, policy: &ChangePolicy) -> ChangeVerdict {
    if changes.entries.is_empty() {
        return ChangeVerdict::NoChanges;
    }
    if is_docs_only(&changes.entries, policy) {
        return ChangeVerdict::DocsOnly;
    }
    if policy.has_threshold() {
        let tally = changes
            .line_counts
            .as_deref()
            .map(NonDocTally::from_line_counts)
            .unwrap_or_default();
        if !tally.meets(policy) {
            return ChangeVerdict::BelowThreshold(tally);
        }
    }
    ChangeVerdict::Substantive
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: char, path: &str) -> StagedEntry {
        StagedEntry {
            status,
            path: path.to_string(),
        }
    }

    #[test]
    fn doc_predicate() {
        assert!(is_doc_path("docs/readme.md"));
        assert!(is_doc_path(".github/workflows/ci.yml"));
        assert!(is_doc_path("pkg/LICENSE"));
        assert!(is_doc_path("notes/design.RST"));
        assert!(!is_doc_path("src/main.rs"));
        assert!(!is_doc_path("src/docs/mod.rs"));
        assert!(!is_doc_path(""));
    }

    #[test]
    fn name_status_parsing() {
        let output = "M\tsrc/lib.rs\nA\tdocs/new.md\nX\tweird.bin\nD\n\n";
        assert_eq!(
            parse_name_status(output),
            vec![entry('M', "src/lib.rs"), entry('A', "docs/new.md"), entry('M', "weird.bin")]
        );
    }

    #[test]
    fn numstat_parsing_counts_binary_as_one() {
        let rows = parse_numstat("10\t2\tsrc/lib.rs\n-\t-\tassets/logo.png\nbad line\n");
        assert_eq!(
            rows,
            vec![
                LineCount {
                    path: "src/lib.rs".to_string(),
                    added: 10,
                    deleted: 2
                },
                LineCount {
                    path: "assets/logo.png".to_string(),
                    added: 1,
                    deleted: 1
                },
            ]
        );
    }

    #[test]
    fn summary_is_bounded() {
        let entries: Vec<_> = (0..10).map(|i| entry('M', &format!("src/f{i}.rs"))).collect();
        let summary = summarize_changes(&entries);
        assert!(summary.starts_with("M src/f0.rs, M src/f1.rs"));
        assert!(summary.ends_with(", +2 files"));

        let long: Vec<_> = (0..8)
            .map(|i| entry('A', &format!("src/a/very/deep/module/path/file_{i}.rs")))
            .collect();
        let summary = summarize_changes(&long);
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS);
        assert!(summary.ends_with("..."));

        assert_eq!(summarize_changes(&[]), "no file changes");
    }

    #[test]
    fn empty_diff_is_no_changes() {
        let policy = ChangePolicy {
            require_code_changes: true,
            require_non_doc_changes: true,
            min_non_doc_files: 1,
            min_non_doc_lines: 10,
        };
        assert_eq!(classify(&StagedChangeSet::default(), &policy), ChangeVerdict::NoChanges);
    }

    #[test]
    fn docs_only_requires_policy() {
        let changes = StagedChangeSet {
            entries: vec![entry('M', "docs/readme.md")],
            line_counts: None,
        };
        let strict = ChangePolicy {
            require_non_doc_changes: true,
            ..ChangePolicy::default()
        };
        assert_eq!(classify(&changes, &strict), ChangeVerdict::DocsOnly);
        assert!(!needs_line_counts(&changes.entries, &strict));
        assert_eq!(classify(&changes, &ChangePolicy::default()), ChangeVerdict::Substantive);
    }

    #[test]
    fn thresholds_ignore_doc_paths() {
        let policy = ChangePolicy {
            min_non_doc_files: 2,
            min_non_doc_lines: 20,
            ..ChangePolicy::default()
        };
        let mut changes = StagedChangeSet {
            entries: vec![entry('M', "src/lib.rs"), entry('M', "README.md")],
            line_counts: Some(vec![
                LineCount {
                    path: "src/lib.rs".to_string(),
                    added: 30,
                    deleted: 0,
                },
                LineCount {
                    path: "README.md".to_string(),
                    added: 200,
                    deleted: 0,
                },
            ]),
        };
        assert!(needs_line_counts(&changes.entries, &policy));
        assert_eq!(
            classify(&changes, &policy),
            ChangeVerdict::BelowThreshold(NonDocTally { files: 1, lines: 30 })
        );

        changes.entries.push(entry('A', "src/new.rs"));
        if let Some(rows) = changes.line_counts.as_mut() {
            rows.push(LineCount {
                path: "src/new.rs".to_string(),
                added: 5,
                deleted: 0,
            });
        }
        assert_eq!(classify(&changes, &policy), ChangeVerdict::Substantive);
    }
}
