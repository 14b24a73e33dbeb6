use std::iter::FusedIterator;

use crate::fragment::{day_end, Fragment};

/// Cuts `fragment` at every UTC midnight it crosses.
///
/// Pieces are truncated, never padded: each one keeps exactly the samples
/// that fall before the boundary, and the remainder restarts at its first
/// sample at or after midnight. A fragment whose last sample lands exactly
/// on midnight stays whole.
pub fn split_at_midnights(fragment: Fragment) -> DaySplit {
    DaySplit { rest: Some(fragment) }
}

/// Consuming iterator returned by [`split_at_midnights`].
#[derive(Debug)]
pub struct DaySplit {
    rest: Option<Fragment>,
}

impl Iterator for DaySplit {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        let current = self.rest.take()?;
        if current.is_empty() {
            return None;
        }

        let boundary = day_end(current.start);
        if current.end_time() <= boundary {
            return Some(current);
        }

        let keep = current.samples_before(boundary);
        let (head, tail) = current.split_off(keep);
        self.rest = Some(tail);
        Some(head)
    }
}

impl FusedIterator for DaySplit {}
