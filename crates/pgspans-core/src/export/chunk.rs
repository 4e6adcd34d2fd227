//! Byte-bounded grouping of serialized spans.

/// Default per-request payload budget, in bytes.
pub const DEFAULT_BATCH_BYTES: usize = 150_000;

/// Splits `items` into contiguous groups whose byte total stays within `limit`.
///
/// Greedy: an item joins the current group unless that would push the total
/// above `limit`. An item larger than `limit` on its own forms its own group.
/// Empty input yields exactly one empty group.
pub fn chunk<S: AsRef<str>>(items: &[S], limit: usize) -> Chunks<'_, S> {
    Chunks {
        rest: items,
        limit,
        emitted: false,
    }
}

/// Iterator over the groups of [`chunk`]. Cloning restarts from the clone's position.
pub struct Chunks<'a, S> {
    rest: &'a [S],
    limit: usize,
    emitted: bool,
}

impl<S> Clone for Chunks<'_, S> {
    fn clone(&self) -> Self {
        Self {
            rest: self.rest,
            limit: self.limit,
            emitted: self.emitted,
        }
    }
}

impl<'a, S: AsRef<str>> Iterator for Chunks<'a, S> {
    type Item = &'a [S];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            if self.emitted {
                return None;
            }
            self.emitted = true;
            return Some(self.rest);
        }

        let mut total = 0usize;
        let mut end = 0;
        for (i, item) in self.rest.iter().enumerate() {
            let len = item.as_ref().len();
            if i > 0 && total + len > self.limit {
                break;
            }
            total += len;
            end = i + 1;
        }

        let (group, rest) = self.rest.split_at(end);
        self.rest = rest;
        self.emitted = true;
        Some(group)
    }
}
