//! Guest-initiated resource negotiation over the PVINFO page.
//!
//! The mediator publishes an allocation in `avail_rs`; the guest driver compares it with its
//! minimums at probe time and answers through `rs_insufficient` and `min_*`. The mediator only
//! ever reacts to a fresh guest answer:
//!
//! ```text
//! Published --guest signal--> Probed --evaluate--> Accepted
//!                                          \-----> Rejected --react--> Published (grown)
//!                                                           \--------> Failed
//! ```

use vgt_protocol::{AvailableResources, GmadrRange, ResourceRequest, ResourceShortfall};
use vgt_shared::SharedControlPage;

use crate::config::{NegotiatorConfig, ResourceLimits};
use crate::error::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// An allocation is on the page, waiting for the guest's answer.
    Published,
    /// The guest answered; not yet evaluated.
    Probed(ResourceRequest),
    Accepted,
    Rejected(ResourceRequest),
    Failed(NegotiationError),
    /// The instance was detached and its allocation handed back.
    Detached,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Failed(_) | Self::Detached)
    }
}

/// Mediator-side allocator of graphics memory ranges and fence registers.
///
/// Every range a pool hands out is disjoint from every other range it currently has out.
pub trait ResourcePool {
    /// Carves out a fresh allocation with the sizes in `wanted`. Bases in `wanted` are ignored.
    fn allocate(&mut self, wanted: &AvailableResources) -> Option<AvailableResources>;

    /// Whether [`Self::try_grow`] would succeed right now.
    fn can_grow(&self, current: &AvailableResources, request: &ResourceRequest) -> bool;

    /// Tries to grow `current` so that every flagged shortfall in `request` is covered. A range
    /// is extended in place when the space after it is free and moved otherwise.
    ///
    /// Returns the new allocation, or `None` if the pool cannot cover it right now. On `None` the
    /// pool is unchanged.
    fn try_grow(
        &mut self,
        current: &AvailableResources,
        request: &ResourceRequest,
    ) -> Option<AvailableResources>;

    /// Hands an allocation back, e.g. on detach.
    fn release(&mut self, allocation: &AvailableResources);
}

/// The amount of each resource a guest needs given its current allocation and its answer.
/// Minimums without a matching shortfall bit are ignored.
fn required(current: &AvailableResources, request: &ResourceRequest) -> (u32, u32, u32) {
    let pick = |flag, have: u32, min: u32| {
        if request.shortfall.contains(flag) {
            have.max(min)
        } else {
            have
        }
    };
    (
        pick(
            ResourceShortfall::LOW_GMADR,
            current.low_gmadr.size,
            request.min_low_gmadr,
        ),
        pick(
            ResourceShortfall::HIGH_GMADR,
            current.high_gmadr.size,
            request.min_high_gmadr,
        ),
        pick(ResourceShortfall::FENCE, current.fence_num, request.min_fence_num),
    )
}

/// First-fit allocator over one graphics memory span. `used` is sorted by base and holds no
/// empty ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeAllocator {
    span: GmadrRange,
    used: Vec<GmadrRange>,
}

impl RangeAllocator {
    fn new(span: GmadrRange) -> Self {
        Self {
            span,
            used: Vec::new(),
        }
    }

    fn free(&self) -> u64 {
        let used: u64 = self.used.iter().map(|r| u64::from(r.size)).sum();
        u64::from(self.span.size) - used
    }

    fn first_fit(&self, size: u32) -> Option<u32> {
        let mut cursor = u64::from(self.span.base);
        for range in &self.used {
            if u64::from(range.base) - cursor >= u64::from(size) {
                return u32::try_from(cursor).ok();
            }
            cursor = range.end_exclusive();
        }
        if self.span.end_exclusive() - cursor >= u64::from(size) {
            u32::try_from(cursor).ok()
        } else {
            None
        }
    }

    fn insert(&mut self, range: GmadrRange) {
        let idx = self.used.partition_point(|r| r.base < range.base);
        self.used.insert(idx, range);
    }

    fn alloc(&mut self, size: u32) -> Option<GmadrRange> {
        if size == 0 {
            return Some(GmadrRange::new(self.span.base, 0));
        }
        let range = GmadrRange::new(self.first_fit(size)?, size);
        self.insert(range);
        Some(range)
    }

    fn release(&mut self, range: GmadrRange) {
        if range.size == 0 {
            return;
        }
        match self.used.iter().position(|r| *r == range) {
            Some(idx) => {
                self.used.remove(idx);
            }
            None => tracing::warn!(?range, "released range was not allocated from this pool"),
        }
    }

    fn grow(&mut self, current: GmadrRange, size: u32) -> Option<GmadrRange> {
        if size <= current.size {
            return Some(current);
        }
        if current.size == 0 {
            return self.alloc(size);
        }
        let idx = self.used.iter().position(|r| *r == current)?;
        let limit = self
            .used
            .get(idx + 1)
            .map_or(self.span.end_exclusive(), |next| u64::from(next.base));
        if u64::from(current.base) + u64::from(size) <= limit {
            self.used[idx].size = size;
            return Some(self.used[idx]);
        }

        self.used.remove(idx);
        let moved = self.alloc(size);
        if moved.is_none() {
            self.insert(current);
        }
        moved
    }
}

/// Pool over a fixed aperture span, a fixed hidden-memory span and a number of fence registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedResourcePool {
    low: RangeAllocator,
    high: RangeAllocator,
    free_fence_num: u32,
}

impl BoundedResourcePool {
    /// Aperture at `[0, low_size)`, hidden memory directly after it.
    pub fn new(low_size: u32, high_size: u32, fence_num: u32) -> Self {
        let high_size = high_size.min(u32::MAX - low_size);
        Self::with_spans(
            GmadrRange::new(0, low_size),
            GmadrRange::new(low_size, high_size),
            fence_num,
        )
    }

    pub fn with_spans(low: GmadrRange, high: GmadrRange, fence_num: u32) -> Self {
        Self {
            low: RangeAllocator::new(low),
            high: RangeAllocator::new(high),
            free_fence_num: fence_num,
        }
    }

    /// Enough for exactly one guest at the largest size `limits` admits.
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self::new(
            limits.max_low_gmadr,
            limits.max_high_gmadr,
            limits.max_fence_num,
        )
    }

    pub fn free_low_gmadr(&self) -> u64 {
        self.low.free()
    }

    pub fn free_high_gmadr(&self) -> u64 {
        self.high.free()
    }

    pub fn free_fence_num(&self) -> u32 {
        self.free_fence_num
    }
}

impl ResourcePool for BoundedResourcePool {
    fn allocate(&mut self, wanted: &AvailableResources) -> Option<AvailableResources> {
        if wanted.fence_num > self.free_fence_num {
            return None;
        }
        let low = self.low.alloc(wanted.low_gmadr.size)?;
        let Some(high) = self.high.alloc(wanted.high_gmadr.size) else {
            self.low.release(low);
            return None;
        };
        self.free_fence_num -= wanted.fence_num;
        Some(AvailableResources {
            low_gmadr: low,
            high_gmadr: high,
            fence_num: wanted.fence_num,
        })
    }

    fn can_grow(&self, current: &AvailableResources, request: &ResourceRequest) -> bool {
        self.clone().try_grow(current, request).is_some()
    }

    fn try_grow(
        &mut self,
        current: &AvailableResources,
        request: &ResourceRequest,
    ) -> Option<AvailableResources> {
        let (low, high, fence) = required(current, request);
        let d_fence = fence - current.fence_num;
        if d_fence > self.free_fence_num {
            return None;
        }

        let saved = self.clone();
        let grown = self.low.grow(current.low_gmadr, low).and_then(|low_gmadr| {
            let high_gmadr = self.high.grow(current.high_gmadr, high)?;
            Some(AvailableResources {
                low_gmadr,
                high_gmadr,
                fence_num: fence,
            })
        });
        match grown {
            Some(grown) => {
                self.free_fence_num -= d_fence;
                Some(grown)
            }
            None => {
                *self = saved;
                None
            }
        }
    }

    fn release(&mut self, allocation: &AvailableResources) {
        self.low.release(allocation.low_gmadr);
        self.high.release(allocation.high_gmadr);
        self.free_fence_num = self.free_fence_num.saturating_add(allocation.fence_num);
    }
}

#[derive(Debug, Clone)]
pub struct ResourceNegotiator {
    config: NegotiatorConfig,
    current: AvailableResources,
    state: NegotiationState,
    rejections: u32,
}

impl ResourceNegotiator {
    pub fn new(config: NegotiatorConfig, initial: AvailableResources) -> Self {
        Self {
            config,
            current: initial,
            state: NegotiationState::Published,
            rejections: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// The allocation most recently published.
    pub fn current(&self) -> &AvailableResources {
        &self.current
    }

    pub fn rejections(&self) -> u32 {
        self.rejections
    }

    /// Writes the current allocation to the page and waits for the guest.
    pub fn publish(&mut self, page: &SharedControlPage) {
        page.mediator().publish_resources(&self.current);
        self.state = NegotiationState::Published;
    }

    /// The guest wrote a new answer. Snapshots it from the page.
    ///
    /// Ignored once negotiation has failed or the instance is detached.
    pub fn on_guest_signal(&mut self, page: &SharedControlPage) -> NegotiationState {
        if matches!(
            self.state,
            NegotiationState::Failed(_) | NegotiationState::Detached
        ) {
            tracing::debug!(state = ?self.state, "resource signal ignored");
            return self.state;
        }
        self.state = NegotiationState::Probed(page.resource_request());
        self.state
    }

    /// Probed → Accepted | Rejected.
    pub fn evaluate(&mut self) -> NegotiationState {
        if let NegotiationState::Probed(request) = self.state {
            if request.is_accepted() {
                tracing::info!(resources = ?self.current, "guest accepted resource allocation");
                self.state = NegotiationState::Accepted;
            } else {
                self.rejections += 1;
                tracing::debug!(
                    shortfall = ?request.shortfall,
                    rejections = self.rejections,
                    "guest rejected resource allocation"
                );
                self.state = NegotiationState::Rejected(request);
            }
        }
        self.state
    }

    /// Rejected → Published (with a grown allocation) | Failed.
    pub fn react(
        &mut self,
        pool: &mut dyn ResourcePool,
        page: &SharedControlPage,
    ) -> NegotiationState {
        let NegotiationState::Rejected(request) = self.state else {
            return self.state;
        };

        // Capacity, then pool, then retries: a pool that cannot grow is always reported as such.
        let (low, high, fence) = required(&self.current, &request);
        let outcome = if !self.config.limits.admits(low, high, fence) {
            Err(NegotiationError::ExceedsCapacity { request })
        } else if self.rejections > self.config.max_retries {
            if pool.can_grow(&self.current, &request) {
                Err(NegotiationError::RetriesExhausted {
                    attempts: self.rejections,
                })
            } else {
                Err(NegotiationError::PoolExhausted { request })
            }
        } else {
            pool.try_grow(&self.current, &request)
                .ok_or(NegotiationError::PoolExhausted { request })
        };

        match outcome {
            Ok(grown) => {
                tracing::debug!(resources = ?grown, "republishing grown resource allocation");
                self.current = grown;
                self.publish(page);
            }
            Err(err) => {
                tracing::warn!("resource negotiation failed: {err}");
                self.state = NegotiationState::Failed(err);
            }
        }
        self.state
    }

    /// Ends negotiation for good and returns the allocation to hand back to the pool.
    ///
    /// Later guest answers are ignored, so nothing can be grown after the release.
    pub fn retire(&mut self) -> AvailableResources {
        self.state = NegotiationState::Detached;
        std::mem::take(&mut self.current)
    }

    /// Handles one guest answer end to end.
    pub fn handle_guest_signal(
        &mut self,
        pool: &mut dyn ResourcePool,
        page: &SharedControlPage,
    ) -> NegotiationState {
        self.on_guest_signal(page);
        self.evaluate();
        self.react(pool, page)
    }
}
