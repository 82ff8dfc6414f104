// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Tag Bookkeeping
//!
//! Delivery tags are scoped to the physical channel that produced them. The
//! types here are shared by the decorators that need to remember tags across
//! the delivery thread and the acknowledging thread.

use crate::{
    amqp::{AmqpChannel, Delivery, DeliveryHandler},
    errors::AmqpError,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A thread-safe ordered set of delivery tags.
#[derive(Debug, Default)]
pub struct DeliveryTagSet {
    tags: Mutex<BTreeSet<u64>>,
}

impl DeliveryTagSet {
    pub fn new() -> Self {
        DeliveryTagSet::default()
    }

    pub fn insert(&self, tag: u64) {
        lock(&self.tags).insert(tag);
    }

    pub fn contains(&self, tag: u64) -> bool {
        lock(&self.tags).contains(&tag)
    }

    /// Removes `tag`, returning whether it was present.
    pub fn remove(&self, tag: u64) -> bool {
        lock(&self.tags).remove(&tag)
    }

    /// Removes every tag less than or equal to `tag`, returning whether `tag`
    /// itself was present. This is what a ranged ("multiple") acknowledgement
    /// covers.
    pub fn remove_through(&self, tag: u64) -> bool {
        let mut tags = lock(&self.tags);
        let present = tags.contains(&tag);
        *tags = match tag.checked_add(1) {
            Some(bound) => tags.split_off(&bound),
            None => BTreeSet::new(),
        };
        present
    }

    pub fn len(&self) -> usize {
        lock(&self.tags).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tags).is_empty()
    }
}

/// One call to make on a physical channel to settle logical tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub target: usize,
    pub physical_tag: u64,
    pub multiple: bool,
}

#[derive(Debug, Default)]
struct MapperState {
    last: u64,
    tags: BTreeMap<u64, (usize, u64)>,
}

/// Translates between one logical tag space and several physical channels.
///
/// Logical tags start at 1 and grow monotonically. Each one remembers the
/// index of the physical channel it came from and its physical tag there.
#[derive(Debug, Default)]
pub struct DeliveryTagMapper {
    state: Mutex<MapperState>,
}

impl DeliveryTagMapper {
    pub fn new() -> Self {
        DeliveryTagMapper::default()
    }

    /// Allocates a logical tag for `physical_tag` on channel `target`.
    pub fn register(&self, target: usize, physical_tag: u64) -> u64 {
        let mut state = lock(&self.state);
        state.last += 1;
        let logical = state.last;
        state.tags.insert(logical, (target, physical_tag));
        logical
    }

    /// Removes and returns the mapping of a single logical tag.
    pub fn resolve(&self, logical_tag: u64) -> Option<(usize, u64)> {
        lock(&self.state).tags.remove(&logical_tag)
    }

    /// Removes every logical tag up to and including `logical_tag` and
    /// returns the calls settling them, ordered by channel index.
    ///
    /// A channel gets one ranged call at its highest covered physical tag,
    /// unless a tag left pending on it is lower. Deliveries registered out
    /// of physical order would then be settled too, so each covered tag gets
    /// its own call instead.
    pub fn resolve_through(&self, logical_tag: u64) -> Vec<Settlement> {
        let mut state = lock(&self.state);
        let remaining = match logical_tag.checked_add(1) {
            Some(bound) => state.tags.split_off(&bound),
            None => BTreeMap::new(),
        };
        let covered = std::mem::replace(&mut state.tags, remaining);

        let mut per_target = BTreeMap::<usize, BTreeSet<u64>>::new();
        for (target, physical) in covered.into_values() {
            per_target.entry(target).or_default().insert(physical);
        }

        let mut settlements = vec![];
        for (target, physicals) in per_target {
            let Some(&highest) = physicals.last() else {
                continue;
            };
            let overlaps = state
                .tags
                .values()
                .any(|&(owner, physical)| owner == target && physical < highest);

            if overlaps {
                settlements.extend(physicals.into_iter().map(|physical_tag| Settlement {
                    target,
                    physical_tag,
                    multiple: false,
                }));
            } else {
                settlements.push(Settlement {
                    target,
                    physical_tag: highest,
                    multiple: true,
                });
            }
        }

        settlements
    }

    /// Drops every tag of channel `target`, e.g. after that channel closed.
    pub fn forget_target(&self, target: usize) {
        lock(&self.state)
            .tags
            .retain(|_, (owner, _)| *owner != target);
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).tags.len()
    }
}

/// Rewrites the tags of one physical channel's deliveries into the logical
/// tag space before handing them on.
pub(crate) struct RemappingHandler {
    pub(crate) target: usize,
    pub(crate) mapper: Arc<DeliveryTagMapper>,
    pub(crate) inner: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for RemappingHandler {
    async fn handle(&self, delivery: Delivery) {
        let logical = self.mapper.register(self.target, delivery.delivery_tag);
        self.inner.handle(delivery.with_tag(logical)).await
    }
}

/// Applies an ack/nack/reject for a logical tag to the physical channel(s)
/// owning it, as laid out by [`DeliveryTagMapper::resolve_through`]. Every
/// call is attempted and the last failure is returned. `operation` gets the
/// channel, the physical tag and whether the call is ranged.
pub(crate) async fn settle<L, F, Fut>(
    mapper: &DeliveryTagMapper,
    delivery_tag: u64,
    multiple: bool,
    lookup: L,
    operation: F,
) -> Result<(), AmqpError>
where
    L: Fn(usize) -> Option<Arc<dyn AmqpChannel>>,
    F: Fn(Arc<dyn AmqpChannel>, u64, bool) -> Fut,
    Fut: Future<Output = Result<(), AmqpError>>,
{
    let settlements = if multiple {
        mapper.resolve_through(delivery_tag)
    } else {
        let (target, physical_tag) = mapper
            .resolve(delivery_tag)
            .ok_or(AmqpError::UnknownDeliveryTag(delivery_tag))?;
        vec![Settlement {
            target,
            physical_tag,
            multiple: false,
        }]
    };

    let mut result = Ok(());
    for settlement in settlements {
        let Some(channel) = lookup(settlement.target) else {
            warn!(
                delivery_tag,
                target = settlement.target,
                "channel of delivery is gone"
            );
            continue;
        };

        if let Err(err) = operation(channel, settlement.physical_tag, settlement.multiple).await {
            result = Err(err);
        }
    }

    result
}
