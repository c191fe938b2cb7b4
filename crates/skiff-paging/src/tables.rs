use skiff_types::PageKey;

use crate::error::{PagingError, Result};
use crate::strict::StrictMap;

/// What `InvertedPageTable::register` found for the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// First mapping for this host page: the caller must allocate a fresh
    /// device page and push the contents.
    FirstResident,
    /// The host page is already on the device under another mapping; the
    /// caller must reuse the existing device page.
    Synonym,
}

/// Host page → every guest mapping currently resident for it.
///
/// A host page appears here iff at least one mapping is on the device; the
/// synonym set is never empty. Removing the last synonym drops the entry,
/// which is the trigger for releasing the shadow entry and the device page.
#[derive(Debug)]
pub struct InvertedPageTable {
    map: StrictMap<u64, Vec<PageKey>>,
}

impl InvertedPageTable {
    pub fn new() -> InvertedPageTable {
        InvertedPageTable {
            map: StrictMap::new("inverted page table"),
        }
    }

    /// Record `key` as resident on the device for host page `hvp`.
    pub fn register(&mut self, hvp: u64, key: PageKey) -> Result<Residency> {
        match self.map.probe(hvp) {
            None => {
                self.map.insert(hvp, vec![key])?;
                Ok(Residency::FirstResident)
            }
            Some(synonyms) => {
                if synonyms.contains(&key) {
                    return Err(PagingError::DuplicateKey {
                        table: "inverted page table",
                        key: format!("{key:?}"),
                        dump: self.map.dump(),
                    });
                }
                self.map.get_mut(hvp)?.push(key);
                Ok(Residency::Synonym)
            }
        }
    }

    /// Remove one mapping; returns whether any synonym is still resident.
    pub fn unregister(&mut self, hvp: u64, key: PageKey) -> Result<bool> {
        let synonyms = self.map.get_mut(hvp)?;
        let Some(pos) = synonyms.iter().position(|k| *k == key) else {
            return Err(PagingError::MissingKey {
                table: "inverted page table",
                key: format!("{key:?}"),
                dump: self.map.dump(),
            });
        };
        synonyms.swap_remove(pos);
        if synonyms.is_empty() {
            self.map.remove(hvp)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Every mapping resident for `hvp`; empty when the page is not on the
    /// device at all.
    pub fn synonyms(&self, hvp: u64) -> &[PageKey] {
        self.map.probe(hvp).map_or(&[], Vec::as_slice)
    }

    #[inline]
    pub fn is_resident(&self, hvp: u64) -> bool {
        self.map.contains(hvp)
    }

    pub fn resident_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.keys()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for InvertedPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Guest mapping → host page: the strict functional reverse of the IPT's
/// member sets.
///
/// Device messages for evictions name only the guest side of a translation;
/// by the time one arrives the emulator's own page tables may already have
/// moved on, so the translation recorded at fault time is kept here.
#[derive(Debug)]
pub struct TemporalPageTable {
    map: StrictMap<PageKey, u64>,
}

impl TemporalPageTable {
    pub fn new() -> TemporalPageTable {
        TemporalPageTable {
            map: StrictMap::new("temporal page table"),
        }
    }

    pub fn register(&mut self, key: PageKey, hvp: u64) -> Result<()> {
        self.map.insert(key, hvp)
    }

    pub fn lookup(&self, key: PageKey) -> Result<u64> {
        self.map.get(key).copied()
    }

    #[inline]
    pub fn contains(&self, key: PageKey) -> bool {
        self.map.contains(key)
    }

    pub fn remove(&mut self, key: PageKey) -> Result<()> {
        self.map.remove(key).map(|_| ())
    }

    /// Snapshot of every resident mapping key. The flush paths collect
    /// matches up front because eviction mutates the table under them.
    pub fn keys(&self) -> Vec<PageKey> {
        self.map.keys().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for TemporalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Host page → device page number, independent of any one guest mapping.
///
/// Present iff the host page currently occupies a device page; synonyms share
/// the single entry.
#[derive(Debug)]
pub struct ShadowPageTable {
    map: StrictMap<u64, u64>,
}

impl ShadowPageTable {
    pub fn new() -> ShadowPageTable {
        ShadowPageTable {
            map: StrictMap::new("shadow page table"),
        }
    }

    pub fn register(&mut self, hvp: u64, ppn: u64) -> Result<()> {
        self.map.insert(hvp, ppn)
    }

    pub fn lookup(&self, hvp: u64) -> Result<u64> {
        self.map.get(hvp).copied()
    }

    #[inline]
    pub fn contains(&self, hvp: u64) -> bool {
        self.map.contains(hvp)
    }

    /// Drop the entry, returning the device page it occupied.
    pub fn remove(&mut self, hvp: u64) -> Result<u64> {
        self.map.remove(hvp)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ShadowPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_types::Access;

    fn key(gva: u64, asid: u16, perm: Access) -> PageKey {
        PageKey::pack(gva, asid, perm)
    }

    #[test]
    fn first_mapping_then_synonym_then_drain() {
        let mut ipt = InvertedPageTable::new();
        let a = key(0x7000_1000, 1, Access::Load);
        let b = key(0xffff_0000_2000_0000, 2, Access::Store);

        assert_eq!(ipt.register(0x1000, a).unwrap(), Residency::FirstResident);
        assert_eq!(ipt.register(0x1000, b).unwrap(), Residency::Synonym);
        assert_eq!(ipt.synonyms(0x1000).len(), 2);

        assert!(ipt.unregister(0x1000, a).unwrap());
        assert_eq!(ipt.synonyms(0x1000), &[b]);

        assert!(!ipt.unregister(0x1000, b).unwrap());
        assert!(!ipt.is_resident(0x1000));
        assert!(ipt.synonyms(0x1000).is_empty());
    }

    #[test]
    fn registering_the_same_mapping_twice_is_a_protocol_error() {
        let mut ipt = InvertedPageTable::new();
        let a = key(0x1000, 1, Access::Load);
        ipt.register(0x1000, a).unwrap();
        assert!(matches!(
            ipt.register(0x1000, a),
            Err(PagingError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn unregistering_an_absent_mapping_is_a_protocol_error() {
        let mut ipt = InvertedPageTable::new();
        let a = key(0x1000, 1, Access::Load);
        let b = key(0x2000, 1, Access::Load);
        ipt.register(0x1000, a).unwrap();
        assert!(matches!(
            ipt.unregister(0x1000, b),
            Err(PagingError::MissingKey { .. })
        ));
        assert!(ipt.unregister(0x4000, a).is_err());
    }

    #[test]
    fn tpt_mirrors_registrations() {
        let mut tpt = TemporalPageTable::new();
        let a = key(0x1000, 1, Access::Load);
        tpt.register(a, 0x9000).unwrap();
        assert_eq!(tpt.lookup(a).unwrap(), 0x9000);
        tpt.remove(a).unwrap();
        assert!(!tpt.contains(a));
        assert!(tpt.lookup(a).is_err());
    }

    #[test]
    fn spt_round_trip() {
        let mut spt = ShadowPageTable::new();
        spt.register(0x9000, 0x44_000).unwrap();
        assert_eq!(spt.lookup(0x9000).unwrap(), 0x44_000);
        assert_eq!(spt.remove(0x9000).unwrap(), 0x44_000);
        assert!(!spt.contains(0x9000));
    }
}
