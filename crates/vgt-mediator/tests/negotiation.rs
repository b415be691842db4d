use proptest::prelude::*;
use vgt_mediator::{
    BoundedResourcePool, NegotiationError, NegotiationState, NegotiatorConfig, ResourceLimits,
    ResourceNegotiator, ResourcePool,
};
use vgt_protocol::{AvailableResources, GmadrRange};
use vgt_shared::SharedControlPage;

const MIB: u32 = 1 << 20;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn initial() -> AvailableResources {
    AvailableResources {
        low_gmadr: GmadrRange::new(0, 16 * MIB),
        high_gmadr: GmadrRange::new(0, 64 * MIB),
        fence_num: 1,
    }
}

/// Negotiator whose initial allocation was carved out of `pool`.
fn setup(
    max_retries: u32,
    pool: &mut BoundedResourcePool,
) -> (SharedControlPage, ResourceNegotiator) {
    init_tracing();
    let page = SharedControlPage::new();
    page.mediator().populate(4);
    let granted = pool.allocate(&initial()).expect("pool covers the initial allocation");
    let mut neg = ResourceNegotiator::new(
        NegotiatorConfig {
            max_retries,
            limits: ResourceLimits::default(),
        },
        granted,
    );
    neg.publish(&page);
    (page, neg)
}

proptest! {
    /// A guest closing its gap in steps is satisfied before the retry bound runs out.
    #[test]
    fn stepwise_guest_converges_within_retry_bound(
        max_retries in 1u32..6,
        steps in 1u32..6,
        low_step in 0u32..=8,
        fence_step in 1u32..=2,
    ) {
        let steps = steps.min(max_retries);
        let mut pool = BoundedResourcePool::from_limits(&ResourceLimits::default());
        let (page, mut neg) = setup(max_retries, &mut pool);

        let target_low = initial().low_gmadr.size + steps * low_step * MIB;
        let target_fence = initial().fence_num + steps * fence_step;

        let mut answers = 0;
        loop {
            let have = page.available_resources();
            let want_low = (have.low_gmadr.size + low_step * MIB).min(target_low);
            let want_fence = (have.fence_num + fence_step).min(target_fence);
            page.guest().respond_to_resources(want_low, 0, want_fence);
            answers += 1;

            match neg.handle_guest_signal(&mut pool, &page) {
                NegotiationState::Accepted => break,
                NegotiationState::Published => {}
                other => prop_assert!(false, "unexpected state {:?}", other),
            }
            prop_assert!(answers <= max_retries + 1);
        }

        prop_assert_eq!(neg.rejections(), steps);
        prop_assert_eq!(page.available_resources().fence_num, target_fence);
        prop_assert_eq!(page.available_resources().low_gmadr.size, target_low);
    }

    /// A guest whose minimum never drops against a pool that cannot grow ends in `Failed`, and
    /// the pool is named as the reason however many retries were left.
    #[test]
    fn stubborn_guest_against_empty_pool_fails(
        max_retries in 0u32..6,
        fence in 2u32..=32,
    ) {
        let mut pool = BoundedResourcePool::new(16 * MIB, 64 * MIB, 1);
        let (page, mut neg) = setup(max_retries, &mut pool);

        let mut answers = 0;
        let state = loop {
            page.guest().respond_to_resources(0, 0, fence);
            answers += 1;
            let state = neg.handle_guest_signal(&mut pool, &page);
            if state.is_terminal() {
                break state;
            }
            prop_assert!(answers <= max_retries + 1);
        };
        prop_assert!(
            matches!(state, NegotiationState::Failed(NegotiationError::PoolExhausted { .. })),
            "{:?}", state
        );
    }

    /// A guest that is never satisfied exhausts the retries even with an unbounded pool.
    #[test]
    fn insatiable_guest_exhausts_retries(max_retries in 0u32..6) {
        let mut pool = BoundedResourcePool::from_limits(&ResourceLimits::default());
        let (page, mut neg) = setup(max_retries, &mut pool);

        let mut answers = 0;
        let state = loop {
            let have = page.available_resources().fence_num;
            page.guest().respond_to_resources(0, 0, have + 1);
            answers += 1;
            let state = neg.handle_guest_signal(&mut pool, &page);
            if state.is_terminal() {
                break state;
            }
        };
        prop_assert_eq!(answers, max_retries + 1);
        prop_assert_eq!(
            state,
            NegotiationState::Failed(NegotiationError::RetriesExhausted {
                attempts: max_retries + 1
            })
        );
    }
}
