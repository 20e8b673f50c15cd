use std::collections::BTreeSet;

use crate::error::{KlerError, KlerResult};

const READ_PREFIXES: &[&str] = &["search_", "list_", "get_"];
const MUTATING_WORDS: &[&str] = &[
    "create", "update", "delete", "push", "merge", "fork", "write", "edit", "remove", "add",
];

/// Fixed set of read-only external operations, decided at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyAllowList {
    names: BTreeSet<String>,
}

impl ReadOnlyAllowList {
    /// Build the list, refusing any name that is not a search/list/get verb
    /// or that mentions a mutating word.
    pub fn new<I, S>(names: I) -> KlerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for name in names {
            let name = name.into();
            if !is_read_only(&name) {
                return Err(KlerError::ToolNotAllowed { name });
            }
            set.insert(name);
        }
        Ok(Self { names: set })
    }

    pub fn empty() -> Self {
        Self {
            names: BTreeSet::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn check(&self, name: &str) -> KlerResult<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(KlerError::ToolNotAllowed {
                name: name.to_string(),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn is_read_only(name: &str) -> bool {
    if !READ_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    !name
        .split('_')
        .any(|word| MUTATING_WORDS.contains(&word))
}
