//! Changelog parsing and include flattening.

use std::collections::HashSet;

use serde::Serialize;

use super::error::ParseError;
use super::source::ChangelogSource;
use super::{formatted, json, paths, Change, ChangeSet, Changelog, ChangeSetId};

/// One top-level element of a changelog document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entry {
    ChangeSet(ChangeSet),
    Include {
        file: String,
        relative_to_changelog_file: bool,
    },
    IncludeAll {
        path: String,
        relative_to_changelog_file: bool,
    },
}

/// Result of a collecting parse.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseOutcome {
    /// Everything that could be read.
    pub changelog: Changelog,
    /// Every problem found, in discovery order.
    pub problems: Vec<ParseError>,
}

impl ParseOutcome {
    /// Check that no problem was found.
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Reads a root changelog and everything it includes.
pub struct ChangelogParser<'a> {
    source: &'a dyn ChangelogSource,
}

impl<'a> ChangelogParser<'a> {
    /// Create a parser over a source.
    pub fn new(source: &'a dyn ChangelogSource) -> Self {
        Self { source }
    }

    /// Parse and flatten, failing on the first problem.
    pub fn parse(&self, path: &str) -> Result<Changelog, ParseError> {
        let mut walk = Walk::new(self.source, path, true);
        walk.file(&paths::normalize(path), None)?;
        tracing::debug!(
            root = %walk.changelog.root,
            change_sets = walk.changelog.len(),
            "parsed changelog"
        );
        Ok(walk.changelog)
    }

    /// Parse and flatten, collecting every problem instead of stopping.
    pub fn parse_collecting(&self, path: &str) -> ParseOutcome {
        let mut walk = Walk::new(self.source, path, false);
        // Collecting mode never returns early.
        let _ = walk.file(&paths::normalize(path), None);
        ParseOutcome {
            changelog: walk.changelog,
            problems: walk.problems,
        }
    }
}

struct Walk<'a> {
    source: &'a dyn ChangelogSource,
    strict: bool,
    stack: Vec<String>,
    seen: HashSet<ChangeSetId>,
    changelog: Changelog,
    problems: Vec<ParseError>,
}

impl<'a> Walk<'a> {
    fn new(source: &'a dyn ChangelogSource, root: &str, strict: bool) -> Self {
        Self {
            source,
            strict,
            stack: Vec::new(),
            seen: HashSet::new(),
            changelog: Changelog::new(paths::normalize(root)),
            problems: Vec::new(),
        }
    }

    fn problem(&mut self, err: ParseError) -> Result<(), ParseError> {
        if self.strict {
            return Err(err);
        }
        self.problems.push(err);
        Ok(())
    }

    fn file(&mut self, path: &str, included_from: Option<&str>) -> Result<(), ParseError> {
        if let Some(start) = self.stack.iter().position(|p| p == path) {
            let mut chain = self.stack[start..].to_vec();
            chain.push(path.to_string());
            return self.problem(ParseError::CircularInclude { chain });
        }

        let text = match self.source.read(path) {
            Ok(text) => text,
            Err(e) => {
                let err = match included_from {
                    None => ParseError::Unreadable {
                        path: path.to_string(),
                        message: e.to_string(),
                    },
                    Some(from) => ParseError::UnresolvedInclude {
                        path: path.to_string(),
                        included_from: from.to_string(),
                        message: e.to_string(),
                    },
                };
                return self.problem(err);
            }
        };

        let mut document_problems = Vec::new();
        let entries = match paths::extension(path).as_deref() {
            Some("json") => json::parse_document(path, &text, &mut document_problems),
            Some("sql") => formatted::parse_document(path, &text, &mut document_problems),
            _ => {
                return self.problem(ParseError::UnsupportedFormat {
                    path: path.to_string(),
                })
            }
        };
        for err in document_problems {
            self.problem(err)?;
        }

        self.stack.push(path.to_string());
        for entry in entries {
            match entry {
                Entry::ChangeSet(change_set) => self.change_set(path, change_set)?,
                Entry::Include {
                    file,
                    relative_to_changelog_file,
                } => {
                    let target = paths::resolve(path, &file, relative_to_changelog_file);
                    self.file(&target, Some(path))?;
                }
                Entry::IncludeAll {
                    path: dir,
                    relative_to_changelog_file,
                } => self.directory(path, &dir, relative_to_changelog_file)?,
            }
        }
        self.stack.pop();
        Ok(())
    }

    fn directory(&mut self, from: &str, dir: &str, relative: bool) -> Result<(), ParseError> {
        let target = paths::resolve(from, dir, relative);
        let mut files = match self.source.list(&target) {
            Ok(files) => files,
            Err(e) => {
                return self.problem(ParseError::UnresolvedInclude {
                    path: target,
                    included_from: from.to_string(),
                    message: e.to_string(),
                })
            }
        };
        files.retain(|f| matches!(paths::extension(f).as_deref(), Some("json" | "sql")));
        files.sort();

        tracing::debug!(dir = %target, files = files.len(), "including directory");
        for file in files {
            self.file(&paths::normalize(&file), Some(from))?;
        }
        Ok(())
    }

    fn change_set(&mut self, path: &str, mut change_set: ChangeSet) -> Result<(), ParseError> {
        for change in &mut change_set.changes {
            self.load_sql_file(path, change)?;
        }
        if let Some(rollback) = &mut change_set.rollback {
            for change in rollback {
                self.load_sql_file(path, change)?;
            }
        }

        if !self.seen.insert(change_set.id.clone()) {
            return self.problem(ParseError::DuplicateChangeSet {
                id: change_set.id.clone(),
            });
        }
        self.changelog.change_sets.push(change_set);
        Ok(())
    }

    fn load_sql_file(&mut self, changelog_path: &str, change: &mut Change) -> Result<(), ParseError> {
        if let Change::SqlFile {
            path,
            relative_to_changelog_file,
            content,
            ..
        } = change
        {
            let target = paths::resolve(changelog_path, path, *relative_to_changelog_file);
            match self.source.read(&target) {
                Ok(text) => *content = Some(text),
                Err(e) => {
                    return self.problem(ParseError::UnresolvedInclude {
                        path: target,
                        included_from: changelog_path.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}
