//! Worker instantiation from the priority map.
//!
//! Only families that appear in some kind's priority list get workers, and
//! each of those gets at most `queues_per_family` of them. The same plan is
//! used to request queues at logical device creation. [`QueuePool::new`]
//! refuses a plan naming a queue the driver does not have.

use std::sync::Arc;

use crate::capability::{OpKind, QueueSurvey};
use crate::config::SchedulerConfig;
use crate::driver::Driver;
use crate::error::{ConfigurationError, SchedulerError};
use crate::gateway::SubmissionGateway;
use crate::priority::OperationPriorityMap;
use crate::worker::WorkerQueue;

/// A hardware queue: family index plus queue index within the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// The queues to instantiate, ordered by family then queue index.
pub fn plan_queue_slots(
    map: &OperationPriorityMap,
    survey: &QueueSurvey,
    queues_per_family: u32,
) -> Result<Vec<QueueSlot>, ConfigurationError> {
    if queues_per_family == 0 {
        return Err(ConfigurationError::ZeroQueuesPerFamily);
    }
    Ok(map
        .referenced_families()
        .into_iter()
        .filter_map(|family| survey.family(family))
        .flat_map(|family| {
            let count = family.queue_count().min(queues_per_family);
            (0..count).map(move |index| QueueSlot {
                family: family.index(),
                index,
            })
        })
        .collect())
}

/// One [`WorkerQueue`] per planned slot, with routes per operation kind.
#[derive(Debug)]
pub struct QueuePool {
    workers: Vec<WorkerQueue>,
    /// Worker indices per kind, in family priority order then queue index.
    routes: [Vec<usize>; 3],
}

impl QueuePool {
    pub fn new(
        driver: &Arc<dyn Driver>,
        gateway: &Arc<SubmissionGateway>,
        survey: &QueueSurvey,
        map: &OperationPriorityMap,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let slots = plan_queue_slots(map, survey, config.queues_per_family)?;
        if let Some(missing) = slots.iter().find(|&&slot| !driver.has_queue(slot)) {
            return Err(ConfigurationError::QueueNotCreated {
                family: missing.family,
                index: missing.index,
            }
            .into());
        }
        let targets = map.primary_families();

        let mut workers = Vec::with_capacity(slots.len());
        for slot in &slots {
            workers.push(WorkerQueue::new(
                *slot,
                driver,
                gateway,
                targets,
                config.max_recycled_command_buffers,
            )?);
        }

        let routes = OpKind::ALL.map(|kind| {
            map.families(kind)
                .iter()
                .flat_map(|&family| {
                    slots
                        .iter()
                        .enumerate()
                        .filter(move |(_, slot)| slot.family == family)
                        .map(|(i, _)| i)
                })
                .collect::<Vec<_>>()
        });

        for kind in OpKind::ALL {
            tracing::debug!(
                "{kind} route: {:?}",
                routes[kind.index()]
                    .iter()
                    .map(|&i| slots[i])
                    .collect::<Vec<_>>()
            );
        }
        Ok(Self { workers, routes })
    }

    pub fn workers(&self) -> &[WorkerQueue] {
        &self.workers
    }

    /// Workers able to serve `kind`, best first.
    pub fn route(&self, kind: OpKind) -> impl Iterator<Item = &WorkerQueue> {
        self.routes[kind.index()].iter().map(|&i| &self.workers[i])
    }

    /// The `rank`-th worker in `kind`'s route.
    pub fn worker_for(&self, kind: OpKind, rank: usize) -> Option<&WorkerQueue> {
        self.routes[kind.index()]
            .get(rank)
            .map(|&i| &self.workers[i])
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Shut every worker down. Also happens on drop.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::capability::survey_queue_families;
    use crate::priority::DEFAULT_PREFERENCE;
    use crate::testing::FakeDriver;

    fn fake(families: &[(vk::QueueFlags, u32)]) -> (Arc<FakeDriver>, QueueSurvey) {
        let fake = Arc::new(FakeDriver::builder().families(families).build());
        let survey = survey_queue_families(fake.queue_family_properties()).unwrap();
        (fake, survey)
    }

    #[test]
    fn plan_skips_unreferenced_families() {
        let (_, survey) = fake(&[
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
            (vk::QueueFlags::VIDEO_DECODE_KHR, 1),
            (vk::QueueFlags::TRANSFER, 2),
        ]);
        let map = OperationPriorityMap::resolve(&survey, &DEFAULT_PREFERENCE);

        let one = plan_queue_slots(&map, &survey, 1).unwrap();
        assert_eq!(
            one,
            [
                QueueSlot { family: 0, index: 0 },
                QueueSlot { family: 2, index: 0 },
            ]
        );

        let three = plan_queue_slots(&map, &survey, 3).unwrap();
        assert_eq!(three.len(), 3 + 2);
        assert!(three.iter().all(|s| s.family != 1));

        assert!(matches!(
            plan_queue_slots(&map, &survey, 0),
            Err(ConfigurationError::ZeroQueuesPerFamily)
        ));
    }

    #[test]
    fn pool_creates_one_worker_per_slot_and_routes_by_priority() {
        let (fake, survey) = fake(&[
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2),
            (vk::QueueFlags::TRANSFER, 1),
            (vk::QueueFlags::COMPUTE, 1),
        ]);
        let driver: Arc<dyn Driver> = fake.clone();
        let gateway = Arc::new(SubmissionGateway::new());
        let map = OperationPriorityMap::resolve(&survey, &DEFAULT_PREFERENCE);
        let config = SchedulerConfig {
            queues_per_family: 2,
            ..SchedulerConfig::default()
        };

        let mut pool = QueuePool::new(&driver, &gateway, &survey, &map, &config).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(fake.stats().pools_created, 4);

        let transfer: Vec<_> = pool.route(OpKind::Transfer).map(|w| w.slot()).collect();
        assert_eq!(
            transfer,
            [
                QueueSlot { family: 1, index: 0 },
                QueueSlot { family: 2, index: 0 },
                QueueSlot { family: 0, index: 0 },
                QueueSlot { family: 0, index: 1 },
            ]
        );
        assert_eq!(
            pool.worker_for(OpKind::Compute, 0).map(WorkerQueue::slot),
            Some(QueueSlot { family: 2, index: 0 })
        );
        assert_eq!(
            pool.worker_for(OpKind::Graphics, 1).map(WorkerQueue::slot),
            Some(QueueSlot { family: 0, index: 1 })
        );
        assert!(pool.worker_for(OpKind::Graphics, 2).is_none());

        pool.shutdown();
        let stats = fake.stats();
        assert_eq!(stats.pools_destroyed, 4);
        assert_eq!(stats.queue_wait_idle_calls, 4);
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);
    }

    #[test]
    fn plan_naming_an_uncreated_queue_is_refused() {
        let fake = Arc::new(
            FakeDriver::builder()
                .families(&[
                    (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
                    (vk::QueueFlags::TRANSFER, 1),
                ])
                .build(),
        );
        // The survey claims a second queue in family 0 that the device
        // never created.
        let mut props = fake.queue_family_properties().to_vec();
        props[0].queue_count = 2;
        let survey = survey_queue_families(&props).unwrap();
        let driver: Arc<dyn Driver> = fake.clone();
        let gateway = Arc::new(SubmissionGateway::new());
        let map = OperationPriorityMap::resolve(&survey, &DEFAULT_PREFERENCE);
        let config = SchedulerConfig {
            queues_per_family: 2,
            ..SchedulerConfig::default()
        };

        let err = QueuePool::new(&driver, &gateway, &survey, &map, &config).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Configuration(ConfigurationError::QueueNotCreated {
                family: 0,
                index: 1
            })
        ));
        let stats = fake.stats();
        assert_eq!(stats.pools_created, 0);
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);

        let one = SchedulerConfig::default();
        let pool = QueuePool::new(&driver, &gateway, &survey, &map, &one).unwrap();
        assert_eq!(pool.len(), 2);
    }
}
