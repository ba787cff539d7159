//! Walk order of archive paths.
//!
//! Archive paths are relative (`root/dir/file`, the synthetic top-level
//! directory is the empty path). Both walkers emit entries in walk order:
//! siblings sorted bytewise by name, and every directory after all of its
//! descendants. Paths are compared component by component, so repeated
//! separators and inner `.` segments never influence the order.

use std::cmp::Ordering;
use std::path::Path;

/// Compare two archive paths in walk order.
pub fn compare_walk_order(a: &Path, b: &Path) -> Ordering {
    let mut left = a.components();
    let mut right = b.components();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            // `a` is an ancestor of `b`: directories come last
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(x), Some(y)) => match x.as_os_str().cmp(y.as_os_str()) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Directory part of an archive path (`""` for top-level entries and the root).
pub fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

/// Outcome of comparing the pending prior and live entries during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    /// Same path on both sides
    Combine,
    /// The prior entry no longer exists
    DiscardPrior,
    /// The live entry is new
    EmitLive,
}

/// Decide the next merge step from the prior and live paths.
///
/// Directory components are compared first. When one directory contains the
/// other (or they are equal) the full paths decide.
pub fn merge_step(prior: &Path, live: &Path) -> MergeStep {
    let prior_dir = parent_dir(prior);
    let live_dir = parent_dir(live);
    let order = if prior_dir.starts_with(live_dir) || live_dir.starts_with(prior_dir) {
        compare_walk_order(prior, live)
    } else {
        compare_walk_order(prior_dir, live_dir)
    };
    match order {
        Ordering::Equal => MergeStep::Combine,
        Ordering::Less => MergeStep::DiscardPrior,
        Ordering::Greater => MergeStep::EmitLive,
    }
}
