use stable_vec::ExternStableVec;

/// Position plus generation of a live slot. The generation is bumped every
/// time a slot is vacated, so a key that outlived its entry never matches
/// whatever moved in afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Stable-index store with slot reuse.
pub(crate) struct Slots<T> {
    entries: ExternStableVec<T>,
    generations: Vec<u32>,
    vacant: Vec<usize>,
}

impl<T> Slots<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: ExternStableVec::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            vacant: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> SlotKey {
        let index = match self.vacant.pop() {
            Some(index) => {
                self.entries.insert(index, value);
                index
            }
            None => {
                let index = self.entries.push(value);
                if index >= self.generations.len() {
                    self.generations.resize(index + 1, 0);
                }
                index
            }
        };
        SlotKey {
            index: index as u32,
            generation: self.generations[index],
        }
    }

    #[inline(always)]
    fn live(&self, key: SlotKey) -> bool {
        self.generations.get(key.index as usize) == Some(&key.generation)
    }

    #[inline(always)]
    pub(crate) fn get(&self, key: SlotKey) -> Option<&T> {
        if !self.live(key) {
            return None;
        }
        self.entries.get(key.index as usize)
    }

    #[inline(always)]
    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        if !self.live(key) {
            return None;
        }
        self.entries.get_mut(key.index as usize)
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<T> {
        if !self.live(key) {
            return None;
        }
        let index = key.index as usize;
        let value = self.entries.remove(index)?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.vacant.push(index);
        Some(value)
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.entries.num_elements()
    }

    /// Keys of every live entry, taken up front so the caller may mutate
    /// the store while walking them.
    pub(crate) fn keys_where(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<SlotKey> {
        self.entries
            .iter()
            .filter(|(_, value)| keep(value))
            .map(|(index, _)| SlotKey {
                index: index as u32,
                generation: self.generations[index],
            })
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> + '_ {
        self.entries.iter().map(|(index, value)| {
            (
                SlotKey {
                    index: index as u32,
                    generation: self.generations[index],
                },
                value,
            )
        })
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        let keys = self.keys_where(|_| true);
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}
