//! Operation-kind → queue-family priority resolution.
//!
//! Every operation kind gets an ordered list of the families able to serve
//! it. Narrow families come first: a transfer-only family is preferred for
//! transfer work over a graphics+compute+transfer family, which keeps the
//! generalist's bandwidth for work only it can do.
//!
//! Ordering key for family `f` in the list of kind `k`:
//!
//! 1. `breadth(f)`: number of kinds `f` supports, ascending.
//! 2. `rank(f, k)`: number of kinds `f` supports that the caller prefers
//!    over `k`, ascending. Among equally broad families this favours the
//!    one for which `k` is the primary job.
//! 3. Family index, ascending.
//!
//! The map is computed once and is read-only afterwards.

use std::collections::BTreeSet;

use crate::capability::{OpKind, QueueSurvey};
use crate::error::ConfigurationError;

/// Default caller preference: graphics first, then transfer, then compute.
pub const DEFAULT_PREFERENCE: [OpKind; 3] =
    [OpKind::Graphics, OpKind::Transfer, OpKind::Compute];

/// Deduplicate `preference` (first occurrence wins) and append the kinds it
/// omits in [`OpKind::ALL`] order.
pub fn normalize_preference(preference: &[OpKind]) -> [OpKind; 3] {
    let mut out = Vec::with_capacity(OpKind::ALL.len());
    for kind in preference.iter().copied().chain(OpKind::ALL) {
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    [out[0], out[1], out[2]]
}

/// Ordered family lists, one per [`OpKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPriorityMap {
    preference: [OpKind; 3],
    lists: [Vec<u32>; 3],
}

impl OperationPriorityMap {
    pub fn resolve(survey: &QueueSurvey, preference: &[OpKind]) -> Self {
        let preference = normalize_preference(preference);
        let pref_pos = |kind: OpKind| {
            preference
                .iter()
                .position(|k| *k == kind)
                .unwrap_or(preference.len())
        };

        let lists = OpKind::ALL.map(|kind| {
            let mut keyed: Vec<(u32, usize, u32)> = survey
                .families()
                .iter()
                .filter(|f| f.queue_count() > 0)
                .filter(|f| f.capabilities().supports(kind))
                .map(|f| {
                    let caps = f.capabilities();
                    let rank = caps
                        .kinds()
                        .filter(|other| pref_pos(*other) < pref_pos(kind))
                        .count();
                    (caps.breadth(), rank, f.index())
                })
                .collect();
            keyed.sort_unstable();
            keyed.into_iter().map(|(_, _, family)| family).collect()
        });

        let map = Self { preference, lists };
        for kind in preference {
            tracing::info!(
                "Priority for {kind} operations: families {:?}",
                map.families(kind)
            );
        }
        map
    }

    /// The normalized caller preference this map was resolved with.
    pub fn preference(&self) -> [OpKind; 3] {
        self.preference
    }

    /// Families able to serve `kind`, best first. May be empty.
    pub fn families(&self, kind: OpKind) -> &[u32] {
        &self.lists[kind.index()]
    }

    /// Like [`families`](Self::families), but an empty list is an error.
    pub fn lookup(&self, kind: OpKind) -> Result<&[u32], ConfigurationError> {
        let list = self.families(kind);
        if list.is_empty() {
            Err(ConfigurationError::NoFamilyForKind(kind))
        } else {
            Ok(list)
        }
    }

    /// Every family index referenced by at least one list.
    pub fn referenced_families(&self) -> BTreeSet<u32> {
        self.lists.iter().flatten().copied().collect()
    }

    /// Best family for each kind, for recording callbacks that need to
    /// insert queue-family ownership transfers.
    pub fn primary_families(&self) -> OpFamilyTable {
        OpFamilyTable {
            primary: OpKind::ALL.map(|k| self.families(k).first().copied()),
        }
    }
}

/// Primary queue family per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFamilyTable {
    primary: [Option<u32>; 3],
}

impl OpFamilyTable {
    pub fn family(&self, kind: OpKind) -> Option<u32> {
        self.primary[kind.index()]
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::capability::survey_queue_families;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn survey(flags: &[vk::QueueFlags]) -> QueueSurvey {
        let props: Vec<_> = flags
            .iter()
            .map(|f| vk::QueueFamilyProperties {
                queue_flags: *f,
                queue_count: 1,
                ..Default::default()
            })
            .collect();
        survey_queue_families(&props).unwrap()
    }

    #[test]
    fn three_family_scenario() {
        let s = survey(&[G | T | C, T, C | T]);
        let map = OperationPriorityMap::resolve(&s, &DEFAULT_PREFERENCE);

        assert_eq!(map.families(OpKind::Transfer), &[1, 2, 0]);
        assert_eq!(map.families(OpKind::Graphics), &[0]);
        assert_eq!(map.families(OpKind::Compute), &[2, 0]);
        assert_eq!(map.primary_families().family(OpKind::Transfer), Some(1));
    }

    #[test]
    fn specialized_family_wins() {
        let s = survey(&[G | C | T, T]);
        let map = OperationPriorityMap::resolve(&s, &DEFAULT_PREFERENCE);
        assert_eq!(map.families(OpKind::Transfer), &[1, 0]);
    }

    #[test]
    fn equal_breadth_prefers_primary_job() {
        // Both families are two kinds wide. Transfer is family 1's most
        // preferred kind, but only family 0's second choice.
        let s = survey(&[G | T, C | T]);
        let map = OperationPriorityMap::resolve(
            &s,
            &[OpKind::Graphics, OpKind::Transfer, OpKind::Compute],
        );
        assert_eq!(map.families(OpKind::Transfer), &[1, 0]);

        let map = OperationPriorityMap::resolve(
            &s,
            &[OpKind::Compute, OpKind::Graphics, OpKind::Transfer],
        );
        // Transfer is last for both; fall back to family index.
        assert_eq!(map.families(OpKind::Transfer), &[0, 1]);
    }

    #[test]
    fn missing_kind_is_a_configuration_error() {
        let s = survey(&[T]);
        let map = OperationPriorityMap::resolve(&s, &DEFAULT_PREFERENCE);
        assert!(map.families(OpKind::Graphics).is_empty());
        assert!(matches!(
            map.lookup(OpKind::Graphics),
            Err(ConfigurationError::NoFamilyForKind(OpKind::Graphics))
        ));
        assert_eq!(map.lookup(OpKind::Transfer).unwrap(), &[0]);
    }

    #[test]
    fn families_without_queues_are_skipped() {
        let props = [
            vk::QueueFamilyProperties {
                queue_flags: T,
                queue_count: 0,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: G | C | T,
                queue_count: 1,
                ..Default::default()
            },
        ];
        let s = survey_queue_families(&props).unwrap();
        let map = OperationPriorityMap::resolve(&s, &DEFAULT_PREFERENCE);
        assert_eq!(map.families(OpKind::Transfer), &[1]);
        assert_eq!(map.referenced_families().into_iter().collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn preference_is_normalized() {
        assert_eq!(
            normalize_preference(&[OpKind::Transfer, OpKind::Transfer]),
            [OpKind::Transfer, OpKind::Graphics, OpKind::Compute]
        );
        assert_eq!(normalize_preference(&[]), OpKind::ALL);
    }

    /// Every combination of three families drawn from the seven non-empty
    /// flag sets, under every preference order.
    fn all_configurations() -> impl Iterator<Item = (QueueSurvey, [OpKind; 3])>
    {
        let sets = [G, C, T, G | C, G | T, C | T, G | C | T];
        let prefs = [
            [OpKind::Graphics, OpKind::Compute, OpKind::Transfer],
            [OpKind::Graphics, OpKind::Transfer, OpKind::Compute],
            [OpKind::Compute, OpKind::Graphics, OpKind::Transfer],
            [OpKind::Compute, OpKind::Transfer, OpKind::Graphics],
            [OpKind::Transfer, OpKind::Graphics, OpKind::Compute],
            [OpKind::Transfer, OpKind::Compute, OpKind::Graphics],
        ];
        sets.into_iter().flat_map(move |a| {
            sets.into_iter().flat_map(move |b| {
                sets.into_iter().flat_map(move |c| {
                    prefs.into_iter().map(move |p| (survey(&[a, b, c]), p))
                })
            })
        })
    }

    #[test]
    fn resolution_is_deterministic() {
        for (s, pref) in all_configurations() {
            let first = OperationPriorityMap::resolve(&s, &pref);
            let second = OperationPriorityMap::resolve(&s.clone(), &pref);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn every_listed_family_supports_its_kind() {
        for (s, pref) in all_configurations() {
            let map = OperationPriorityMap::resolve(&s, &pref);
            for kind in OpKind::ALL {
                let listed = map.families(kind);
                for family in listed {
                    assert!(
                        s.family(*family).unwrap().capabilities().supports(kind)
                    );
                }
                let supporting = s
                    .families()
                    .iter()
                    .filter(|f| f.capabilities().supports(kind))
                    .count();
                assert_eq!(listed.len(), supporting);
            }
        }
    }

    #[test]
    fn narrower_families_always_come_first() {
        for (s, pref) in all_configurations() {
            let map = OperationPriorityMap::resolve(&s, &pref);
            for kind in OpKind::ALL {
                let breadths: Vec<u32> = map
                    .families(kind)
                    .iter()
                    .map(|f| s.family(*f).unwrap().capabilities().breadth())
                    .collect();
                assert!(breadths.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
