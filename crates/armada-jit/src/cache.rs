//! Concurrent translation cache with caller adjacency.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use crate::decoder::KnownTargets;
use crate::subroutine::{Tier, TranslatedSubroutine};

struct CacheSlot {
    subroutine: Arc<TranslatedSubroutine>,
    size_hint: usize,
}

enum Installed {
    Replaced(Option<Arc<TranslatedSubroutine>>),
    Kept(Arc<TranslatedSubroutine>),
}

/// Map from guest entry address to the current subroutine for it.
///
/// Publishing replaces the whole slot in one step; readers see either the old
/// or the new subroutine. Concurrent first translations of one address are
/// not serialized: the last publish wins, except that a Tier0 publish never
/// replaces Tier1 code (see [`TranslationCache::publish_tier0`]).
///
/// The cache also owns the call graph: for every callee address the set of
/// entry addresses whose code calls it directly.
#[derive(Default)]
pub struct TranslationCache {
    entries: DashMap<u64, CacheSlot>,
    callers: DashMap<u64, DashSet<u64>>,
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("entries", &self.entries.len())
            .field("callees", &self.callers.len())
            .finish()
    }
}

impl TranslationCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subroutine currently published for `address`.
    pub fn try_get(&self, address: u64) -> Option<Arc<TranslatedSubroutine>> {
        self.entries
            .get(&address)
            .map(|slot| Arc::clone(&slot.subroutine))
    }

    /// Whether `address` has an entry.
    pub fn has_entry(&self, address: u64) -> bool {
        self.entries.contains_key(&address)
    }

    /// Install `subroutine` for `address`, replacing any previous entry.
    ///
    /// Records `address` as a caller of each of the subroutine's callees and
    /// drops edges only the replaced entry had. Returns the replaced entry.
    pub fn publish(
        &self,
        address: u64,
        subroutine: Arc<TranslatedSubroutine>,
        size_hint: usize,
    ) -> Option<Arc<TranslatedSubroutine>> {
        match self.install(address, subroutine, size_hint, false) {
            Installed::Replaced(old) => old,
            Installed::Kept(_) => None,
        }
    }

    /// Install a Tier0 `subroutine` unless `address` already holds Tier1
    /// code. Returns the subroutine resident after the call, which is the
    /// existing Tier1 entry when the publish was refused.
    pub fn publish_tier0(
        &self,
        address: u64,
        subroutine: Arc<TranslatedSubroutine>,
        size_hint: usize,
    ) -> Arc<TranslatedSubroutine> {
        match self.install(address, Arc::clone(&subroutine), size_hint, true) {
            Installed::Replaced(_) => subroutine,
            Installed::Kept(resident) => {
                tracing::trace!(address, "tier1 entry kept over late tier0 build");
                resident
            }
        }
    }

    /// Swap the slot and update caller edges under the slot's shard lock, so
    /// edge upkeep for one address is ordered the same way as its publishes.
    fn install(
        &self,
        address: u64,
        subroutine: Arc<TranslatedSubroutine>,
        size_hint: usize,
        keep_tier1: bool,
    ) -> Installed {
        let slot = CacheSlot {
            subroutine: Arc::clone(&subroutine),
            size_hint,
        };
        let old = match self.entries.entry(address) {
            Entry::Occupied(mut occupied) => {
                if keep_tier1 && occupied.get().subroutine.tier() == Tier::Tier1 {
                    return Installed::Kept(Arc::clone(&occupied.get().subroutine));
                }
                let old = occupied.insert(slot).subroutine;
                self.relink_callers(address, &subroutine, Some(&old));
                Some(old)
            }
            Entry::Vacant(vacant) => {
                let _slot = vacant.insert(slot);
                self.relink_callers(address, &subroutine, None);
                None
            }
        };
        tracing::trace!(address, size_hint, replaced = old.is_some(), "published subroutine");
        Installed::Replaced(old)
    }

    fn relink_callers(
        &self,
        address: u64,
        current: &TranslatedSubroutine,
        replaced: Option<&Arc<TranslatedSubroutine>>,
    ) {
        let callees = current.callees();
        for &callee in callees {
            self.callers.entry(callee).or_default().insert(address);
        }
        let Some(replaced) = replaced else {
            return;
        };
        for callee in replaced.callees().iter().filter(|c| !callees.contains(c)) {
            if let Some(set) = self.callers.get(callee) {
                set.remove(&address);
            }
            self.callers.remove_if(callee, |_, set| set.is_empty());
        }
    }

    /// Entry addresses whose code calls `address`, ascending.
    pub fn callers_of(&self, address: u64) -> Vec<u64> {
        let mut callers: Vec<u64> = self
            .callers
            .get(&address)
            .map(|set| set.iter().map(|caller| *caller).collect())
            .unwrap_or_default();
        callers.sort_unstable();
        callers
    }

    /// Mark every recorded caller of `address` for re-JIT. Returns how many
    /// caller entries were marked.
    ///
    /// `address` itself and callers whose code already links to it are
    /// skipped: rebuilding them would produce the same code.
    pub fn mark_callers_for_rejit(&self, address: u64) -> usize {
        let mut marked = 0;
        for caller in self.callers_of(address) {
            if caller == address {
                continue;
            }
            if let Some(subroutine) = self.try_get(caller) {
                if subroutine.links_to(address) {
                    continue;
                }
                subroutine.mark_for_rejit();
                marked += 1;
            }
        }
        marked
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size hint recorded with the entry for `address`.
    pub fn size_hint(&self, address: u64) -> Option<usize> {
        self.entries.get(&address).map(|slot| slot.size_hint)
    }

    /// Sum of all entries' size hints.
    pub fn total_size_hint(&self) -> usize {
        self.entries.iter().map(|slot| slot.size_hint).sum()
    }
}

impl KnownTargets for TranslationCache {
    fn is_known(&self, address: u64) -> bool {
        self.has_entry(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CompiledCode;
    use crate::context::JitContext;
    use crate::subroutine::PromotionState;

    struct Exit;

    impl CompiledCode for Exit {
        fn invoke(&self, _ctx: &mut JitContext<'_>, _args: &[u64]) -> u64 {
            0
        }
    }

    fn sub(entry: u64, tier: Tier, callees: Vec<u64>) -> Arc<TranslatedSubroutine> {
        Arc::new(TranslatedSubroutine::new(
            entry,
            format!("Sub{entry:016x}"),
            tier,
            Vec::new(),
            Arc::new(Exit),
            callees,
            0,
            250,
        ))
    }

    #[test]
    fn publish_replaces_and_returns_old() {
        let cache = TranslationCache::new();
        assert!(cache.publish(0x1000, sub(0x1000, Tier::Tier0, vec![]), 1).is_none());
        let old = cache.publish(0x1000, sub(0x1000, Tier::Tier1, vec![]), 5);

        assert_eq!(old.map(|s| s.tier()), Some(Tier::Tier0));
        assert_eq!(cache.try_get(0x1000).map(|s| s.tier()), Some(Tier::Tier1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size_hint(), 5);
        assert!(cache.is_known(0x1000));
    }

    #[test]
    fn caller_edges_follow_the_current_entry() {
        let cache = TranslationCache::new();
        cache.publish(0x100, sub(0x100, Tier::Tier0, vec![0x900]), 1);
        cache.publish(0x200, sub(0x200, Tier::Tier0, vec![0x900, 0x800]), 1);
        assert_eq!(cache.callers_of(0x900), vec![0x100, 0x200]);

        cache.publish(0x200, sub(0x200, Tier::Tier1, vec![0x800]), 1);
        assert_eq!(cache.callers_of(0x900), vec![0x100]);
        assert_eq!(cache.callers_of(0x800), vec![0x200]);
    }

    #[test]
    fn marks_each_caller_entry() {
        let cache = TranslationCache::new();
        cache.publish(0x100, sub(0x100, Tier::Tier1, vec![0x900]), 1);
        cache.publish(0x200, sub(0x200, Tier::Tier0, vec![0x900]), 1);
        cache.publish(0x900, sub(0x900, Tier::Tier1, vec![]), 1);

        assert_eq!(cache.mark_callers_for_rejit(0x900), 2);
        for caller in [0x100, 0x200] {
            let entry = cache.try_get(caller).unwrap();
            assert_eq!(entry.state(), PromotionState::PendingPromotion);
        }
        assert_eq!(
            cache.try_get(0x900).unwrap().state(),
            PromotionState::Tier1
        );
    }

    #[test]
    fn skips_self_calls_and_linked_callers() {
        let cache = TranslationCache::new();
        let linked = Arc::new(
            Arc::try_unwrap(sub(0x100, Tier::Tier1, vec![0x900]))
                .unwrap()
                .with_linked(vec![0x900]),
        );
        cache.publish(0x100, linked, 1);
        cache.publish(0x900, sub(0x900, Tier::Tier1, vec![0x900]), 1);

        assert_eq!(cache.callers_of(0x900), vec![0x100, 0x900]);
        assert_eq!(cache.mark_callers_for_rejit(0x900), 0);
        assert_eq!(cache.try_get(0x100).unwrap().state(), PromotionState::Tier1);
        assert_eq!(cache.try_get(0x900).unwrap().state(), PromotionState::Tier1);
    }

    #[test]
    fn late_tier0_build_keeps_resident_tier1() {
        let cache = TranslationCache::new();
        let first = sub(0x1000, Tier::Tier0, vec![]);
        assert!(Arc::ptr_eq(&cache.publish_tier0(0x1000, Arc::clone(&first), 1), &first));

        let racing = sub(0x1000, Tier::Tier0, vec![]);
        assert!(Arc::ptr_eq(&cache.publish_tier0(0x1000, Arc::clone(&racing), 1), &racing));

        let promoted = sub(0x1000, Tier::Tier1, vec![]);
        cache.publish(0x1000, Arc::clone(&promoted), 4);
        let late = sub(0x1000, Tier::Tier0, vec![0x900]);
        let resident = cache.publish_tier0(0x1000, late, 1);

        assert!(Arc::ptr_eq(&resident, &promoted));
        assert_eq!(cache.try_get(0x1000).unwrap().tier(), Tier::Tier1);
        assert_eq!(cache.size_hint(0x1000), Some(4));
        assert!(cache.callers_of(0x900).is_empty());
    }

    #[test]
    fn dropped_edges_prune_empty_caller_sets() {
        let cache = TranslationCache::new();
        cache.publish(0x100, sub(0x100, Tier::Tier0, vec![0x900, 0x800]), 1);
        cache.publish(0x200, sub(0x200, Tier::Tier0, vec![0x800]), 1);
        assert_eq!(cache.callers.len(), 2);

        cache.publish(0x100, sub(0x100, Tier::Tier1, vec![]), 1);
        assert!(cache.callers_of(0x900).is_empty());
        assert_eq!(cache.callers_of(0x800), vec![0x200]);
        assert!(!cache.callers.contains_key(&0x900));
        assert_eq!(cache.callers.len(), 1);
    }
}
