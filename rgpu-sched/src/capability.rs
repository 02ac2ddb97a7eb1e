//! Queue family capability survey.
//!
//! [`survey_queue_families`] turns the raw `VkQueueFamilyProperties` list of
//! a physical device into a [`QueueSurvey`]: one immutable
//! [`QueueFamilyDescriptor`] per family, carrying the set of operation kinds
//! ([`OpKindSet`]) the family can serve.

use std::sync::OnceLock;

use ash::vk;

use crate::error::ConfigurationError;

/// A class of GPU work a queue family may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Graphics,
    Compute,
    Transfer,
}

impl OpKind {
    /// Every kind, in declaration order.
    pub const ALL: [OpKind; 3] =
        [OpKind::Graphics, OpKind::Compute, OpKind::Transfer];

    /// Dense index used by per-kind tables.
    pub fn index(self) -> usize {
        match self {
            OpKind::Graphics => 0,
            OpKind::Compute => 1,
            OpKind::Transfer => 2,
        }
    }

    pub fn as_set(self) -> OpKindSet {
        match self {
            OpKind::Graphics => OpKindSet::GRAPHICS,
            OpKind::Compute => OpKindSet::COMPUTE,
            OpKind::Transfer => OpKindSet::TRANSFER,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Graphics => "graphics",
            OpKind::Compute => "compute",
            OpKind::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Set of [`OpKind`]s supported by a queue family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpKindSet: u8 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

impl OpKindSet {
    /// Derive the capability set from raw queue flags.
    ///
    /// Graphics and compute families implicitly support transfer
    /// operations even when `TRANSFER` is not reported.
    pub fn from_queue_flags(flags: vk::QueueFlags) -> Self {
        let mut set = OpKindSet::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            set |= OpKindSet::GRAPHICS | OpKindSet::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            set |= OpKindSet::COMPUTE | OpKindSet::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            set |= OpKindSet::TRANSFER;
        }
        set
    }

    /// Number of operation kinds in the set.
    pub fn breadth(self) -> u32 {
        self.bits().count_ones()
    }

    pub fn supports(self, kind: OpKind) -> bool {
        self.contains(kind.as_set())
    }

    /// Kinds in the set, in [`OpKind::ALL`] order.
    pub fn kinds(self) -> impl Iterator<Item = OpKind> {
        OpKind::ALL.into_iter().filter(move |k| self.supports(*k))
    }
}

/// Immutable description of one queue family.
///
/// Presentation support depends on a surface, which the survey does not
/// know about; it is evaluated the first time
/// [`supports_present`](Self::supports_present) is called and cached for
/// the lifetime of the descriptor.
#[derive(Debug)]
pub struct QueueFamilyDescriptor {
    index: u32,
    queue_count: u32,
    capabilities: OpKindSet,
    raw_flags: vk::QueueFlags,
    min_image_transfer_granularity: vk::Extent3D,
    timestamp_valid_bits: u32,
    present: OnceLock<bool>,
}

impl Clone for QueueFamilyDescriptor {
    fn clone(&self) -> Self {
        let present = OnceLock::new();
        if let Some(&known) = self.present.get() {
            let _ = present.set(known);
        }
        Self {
            index: self.index,
            queue_count: self.queue_count,
            capabilities: self.capabilities,
            raw_flags: self.raw_flags,
            min_image_transfer_granularity: self
                .min_image_transfer_granularity,
            timestamp_valid_bits: self.timestamp_valid_bits,
            present,
        }
    }
}

impl QueueFamilyDescriptor {
    pub fn from_raw(index: u32, props: &vk::QueueFamilyProperties) -> Self {
        Self {
            index,
            queue_count: props.queue_count,
            capabilities: OpKindSet::from_queue_flags(props.queue_flags),
            raw_flags: props.queue_flags,
            min_image_transfer_granularity: props
                .min_image_transfer_granularity,
            timestamp_valid_bits: props.timestamp_valid_bits,
            present: OnceLock::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    pub fn capabilities(&self) -> OpKindSet {
        self.capabilities
    }

    pub fn raw_flags(&self) -> vk::QueueFlags {
        self.raw_flags
    }

    pub fn min_image_transfer_granularity(&self) -> vk::Extent3D {
        self.min_image_transfer_granularity
    }

    pub fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }

    /// Whether queues of this family can present.
    ///
    /// `probe` receives the family index and is only called once; later
    /// calls return the cached answer.
    pub fn supports_present(&self, probe: impl FnOnce(u32) -> bool) -> bool {
        *self.present.get_or_init(|| probe(self.index))
    }

    /// Cached presentation support, if it has been probed.
    pub fn known_present_support(&self) -> Option<bool> {
        self.present.get().copied()
    }
}

/// All queue families of one physical device, in family-index order.
#[derive(Debug, Clone)]
pub struct QueueSurvey {
    families: Vec<QueueFamilyDescriptor>,
}

impl QueueSurvey {
    pub fn families(&self) -> &[QueueFamilyDescriptor] {
        &self.families
    }

    pub fn family(&self, index: u32) -> Option<&QueueFamilyDescriptor> {
        self.families.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

/// Build a [`QueueSurvey`] from the properties returned by
/// `vkGetPhysicalDeviceQueueFamilyProperties`.
///
/// A device without queue families cannot run anything, so an empty list is
/// rejected.
pub fn survey_queue_families(
    props: &[vk::QueueFamilyProperties],
) -> Result<QueueSurvey, ConfigurationError> {
    if props.is_empty() {
        return Err(ConfigurationError::NoQueueFamilies);
    }
    let families = props
        .iter()
        .enumerate()
        .map(|(idx, p)| QueueFamilyDescriptor::from_raw(idx as u32, p))
        .collect::<Vec<_>>();
    for family in &families {
        tracing::debug!(
            "Queue family {}: {} queue(s), caps {:?}, flags {:?}",
            family.index,
            family.queue_count,
            family.capabilities,
            family.raw_flags,
        );
    }
    Ok(QueueSurvey { families })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn empty_device_is_rejected() {
        assert!(matches!(
            survey_queue_families(&[]),
            Err(ConfigurationError::NoQueueFamilies)
        ));
    }

    #[test]
    fn graphics_and_compute_imply_transfer() {
        let survey = survey_queue_families(&[
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 2),
            family(vk::QueueFlags::SPARSE_BINDING, 1),
        ])
        .unwrap();

        let caps: Vec<_> =
            survey.families().iter().map(|f| f.capabilities()).collect();
        assert_eq!(caps[0], OpKindSet::GRAPHICS | OpKindSet::TRANSFER);
        assert_eq!(caps[1], OpKindSet::COMPUTE | OpKindSet::TRANSFER);
        assert_eq!(caps[2], OpKindSet::empty());
        assert_eq!(survey.family(1).unwrap().queue_count(), 2);
    }

    #[test]
    fn breadth_counts_kinds() {
        let all = OpKindSet::all();
        assert_eq!(all.breadth(), 3);
        assert_eq!(
            all.kinds().collect::<Vec<_>>(),
            vec![OpKind::Graphics, OpKind::Compute, OpKind::Transfer]
        );
        assert_eq!(OpKindSet::TRANSFER.breadth(), 1);
    }

    #[test]
    fn present_support_is_probed_once() {
        let survey =
            survey_queue_families(&[family(vk::QueueFlags::GRAPHICS, 1)])
                .unwrap();
        let desc = &survey.families()[0];
        assert_eq!(desc.known_present_support(), None);

        let mut calls = 0;
        assert!(desc.supports_present(|idx| {
            calls += 1;
            idx == 0
        }));
        assert!(desc.supports_present(|_| unreachable!()));
        assert_eq!(calls, 1);
        assert_eq!(desc.clone().known_present_support(), Some(true));
    }
}
