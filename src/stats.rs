// Read-only aggregate counts over the bottle set
use std::collections::BTreeMap;
use std::fmt;

use crate::bottles::{Bottle, BottleKind};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub hidden: usize,
    pub never_retrieved: usize,
    pub by_kind: BTreeMap<BottleKind, usize>,
    /// Every comment ever left, removed ones included
    pub comments: usize,
    pub authored: usize,
    /// Bottles the user has commented on at least once
    pub commented_on: usize,
}

pub fn summarize<'a>(bottles: impl IntoIterator<Item = &'a Bottle>, user_id: &str) -> Summary {
    let mut summary = Summary::default();

    for bottle in bottles {
        summary.total += 1;
        if !bottle.visible {
            summary.hidden += 1;
        }
        if bottle.retrieval_count == 0 {
            summary.never_retrieved += 1;
        }
        *summary.by_kind.entry(bottle.kind()).or_default() += 1;
        summary.comments += bottle.comments.len();
        if bottle.author_id == user_id {
            summary.authored += 1;
        }
        if bottle.comments.iter().any(|c| c.author_id == user_id) {
            summary.commented_on += 1;
        }
    }

    summary
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bottles in the sea: {}", self.total)?;
        writeln!(f, "Hidden: {}", self.hidden)?;
        writeln!(f, "Never retrieved: {}", self.never_retrieved)?;
        for kind in [
            BottleKind::TextOnly,
            BottleKind::ImageOnly,
            BottleKind::ImageText,
            BottleKind::Audio,
        ] {
            writeln!(f, "  {}: {}", kind, self.by_kind.get(&kind).copied().unwrap_or(0))?;
        }
        writeln!(f, "Comments: {}", self.comments)?;
        writeln!(f, "Thrown by you: {}", self.authored)?;
        write!(f, "Commented on by you: {}", self.commented_on)
    }
}
