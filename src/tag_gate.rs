//! Inclusion/exclusion of items and children based on their tags.

use regex::Regex;

/// Passes a tag set when every include pattern matches at least one tag and
/// no exclude pattern matches any tag.
///
/// Patterns match at the start of a tag; anchor with `$` for whole-tag
/// matches. With no include patterns every tag set is accepted, with no
/// exclude patterns none is rejected.
#[derive(Debug, Clone, Default)]
pub struct TagGate {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TagGate {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> crate::Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// A gate built from at most one pattern on each side.
    pub fn single(include: Option<&str>, exclude: Option<&str>) -> crate::Result<Self> {
        Self::new(
            &include.into_iter().collect::<Vec<_>>(),
            &exclude.into_iter().collect::<Vec<_>>(),
        )
    }

    /// A gate that lets everything through.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn check<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        let included = self
            .include
            .iter()
            .all(|p| tags.iter().any(|t| p.is_match(t.as_ref())));
        let excluded = self
            .exclude
            .iter()
            .any(|p| tags.iter().any(|t| p.is_match(t.as_ref())));
        included && !excluded
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> crate::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Ok(Regex::new(&format!("^(?:{})", p.as_ref()))?))
        .collect()
}
