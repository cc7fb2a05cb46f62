use std::collections::BTreeSet;

/// Hands out small integer ids, reusing released ones lowest first.
#[derive(Debug, Default)]
pub(crate) struct IdPool {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn generate(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Returns `id` to the pool. Ids never handed out are ignored.
    pub(crate) fn release(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_ids_are_reused_lowest_first() {
        let mut pool = IdPool::new();
        let ids: Vec<u32> = (0..4).map(|_| pool.generate()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        pool.release(2);
        pool.release(1);
        assert_eq!(pool.generate(), 1);
        assert_eq!(pool.generate(), 2);
        assert_eq!(pool.generate(), 4);
    }

    #[test]
    fn unknown_release_is_ignored() {
        let mut pool = IdPool::new();
        pool.release(7);
        assert_eq!(pool.generate(), 0);
    }
}
