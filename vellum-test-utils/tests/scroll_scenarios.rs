//! End-to-end descendant scroll behavior over the in-memory store.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use vellum_core::ScrollDescriptor;
use vellum_storage::{NodeAdapterRegistry, ScrollCoordinator};
use vellum_test_utils::assertions::{assert_exactly_once, assert_scroll_error};
use vellum_test_utils::fixtures::TreeFixture;
use vellum_test_utils::{
    delivered_ids, drain_scroll, generators, init_test_tracing, InMemoryRecordStore, Principal,
    ScrollError, ScrollToken,
};

fn coordinator(fixture: &TreeFixture, descriptor: ScrollDescriptor) -> ScrollCoordinator<InMemoryRecordStore> {
    ScrollCoordinator::new(fixture.store.clone(), &descriptor, NodeAdapterRegistry::standard())
}

#[tokio::test]
async fn scroll_of_250_descendants_in_pages_of_100() {
    init_test_tracing();
    let fixture = TreeFixture::nested(10, 24).unwrap();
    assert_eq!(fixture.descendants.len(), 250);
    let coordinator = coordinator(&fixture, ScrollDescriptor::default());

    let pages = drain_scroll(&coordinator, &Principal::system(), &fixture.container.id, 100, 10)
        .await
        .unwrap();

    let sizes: Vec<usize> = pages.iter().map(|p| p.items.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50, 0]);
    let token = &pages[1].scroll_token;
    assert!(pages[1..].iter().all(|p| &p.scroll_token == token));
    assert_eq!(pages[0].scroll_token, *token);
    assert_exactly_once(&delivered_ids(&pages), &fixture.descendants);
}

#[tokio::test]
async fn oversized_batch_is_rejected_before_any_backend_call() {
    let fixture = TreeFixture::flat(3).unwrap();
    let coordinator = coordinator(&fixture, ScrollDescriptor::default());

    let result = coordinator
        .scroll(
            &Principal::system(),
            &fixture.container.id,
            &ScrollToken::empty(),
            5000,
            Duration::ZERO,
        )
        .await;
    assert_scroll_error(
        &result,
        &ScrollError::BatchSizeExceeded {
            requested: 5000,
            max: 1000,
        },
    );
    assert_eq!(fixture.store.total_calls(), 0);
}

#[tokio::test]
async fn unregistered_token_is_never_an_empty_page() {
    let fixture = TreeFixture::flat(3).unwrap();
    let coordinator = coordinator(&fixture, ScrollDescriptor::default());
    let token = ScrollToken::new("0123456789abcdef0123456789abcdef");

    let result = coordinator
        .scroll(&Principal::system(), &fixture.container.id, &token, 10, Duration::ZERO)
        .await;
    assert_scroll_error(&result, &ScrollError::UnknownScrollToken { token });
}

#[tokio::test]
async fn restart_with_empty_token_begins_a_new_session() {
    let fixture = TreeFixture::flat(6).unwrap();
    let coordinator = coordinator(&fixture, ScrollDescriptor::default());
    let principal = Principal::system();

    let first = coordinator
        .scroll(&principal, &fixture.container.id, &ScrollToken::empty(), 4, Duration::ZERO)
        .await
        .unwrap();
    let restarted = coordinator
        .scroll(&principal, &fixture.container.id, &ScrollToken::empty(), 4, Duration::ZERO)
        .await
        .unwrap();

    assert_ne!(first.scroll_token, restarted.scroll_token);
    assert_eq!(first.items, restarted.items);
    assert_eq!(fixture.store.descendant_queries(), 2);
}

#[tokio::test]
async fn invisible_subtree_is_skipped_not_fatal() {
    let mut fixture = TreeFixture::nested(2, 3).unwrap();
    let secret = fixture.add_restricted("secret", "Folder", "staff").unwrap();
    let coordinator = coordinator(&fixture, ScrollDescriptor::default());

    let pages = drain_scroll(&coordinator, &Principal::new("alice"), &fixture.container.id, 3, 20)
        .await
        .unwrap();
    let delivered = delivered_ids(&pages);
    assert_eq!(delivered.len(), 8);
    assert!(!delivered.contains(&secret.id));
    assert_eq!(pages.iter().map(|p| p.skipped).sum::<usize>(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_permit_orders_concurrent_scrolls() {
    let fixture = TreeFixture::nested(2, 5).unwrap();
    fixture.store.set_latency(Some(Duration::from_millis(20)));
    let descriptor = ScrollDescriptor {
        max_concurrent_scrolls: 1,
        ..ScrollDescriptor::default()
    };
    let coordinator = Arc::new(coordinator(&fixture, descriptor));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            let container = fixture.container.id.clone();
            tokio::spawn(async move {
                coordinator
                    .scroll(&Principal::system(), &container, &ScrollToken::empty(), 4, Duration::ZERO)
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().items.len(), 4);
    }

    assert_eq!(fixture.store.max_in_flight(), 1);
    assert_eq!(coordinator.available_permits(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Every descendant is delivered exactly once in ceil(N/B) pages,
    /// followed by one empty page.
    #[test]
    fn prop_scroll_covers_subtree_exactly_once(
        shape in generators::arb_tree_shape(60),
        batch in generators::arb_batch_size(25),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fixture = TreeFixture::from_parents(&shape).unwrap();
        let coordinator = coordinator(&fixture, ScrollDescriptor::default());

        let pages = runtime
            .block_on(drain_scroll(
                &coordinator,
                &Principal::system(),
                &fixture.container.id,
                batch,
                shape.len() + 2,
            ))
            .unwrap();

        let non_empty = pages.iter().filter(|p| !p.is_end()).count();
        prop_assert_eq!(non_empty, shape.len().div_ceil(batch));
        prop_assert!(pages.last().is_some_and(|p| p.is_end()));
        assert_exactly_once(&delivered_ids(&pages), &fixture.descendants);
    }

    #[test]
    fn prop_batch_above_cap_is_always_rejected(excess in 1usize..10_000) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fixture = TreeFixture::flat(2).unwrap();
        let coordinator = coordinator(&fixture, ScrollDescriptor::default());
        let requested = 1000 + excess;

        let result = runtime.block_on(coordinator.scroll(
            &Principal::system(),
            &fixture.container.id,
            &ScrollToken::empty(),
            requested,
            Duration::ZERO,
        ));
        assert_scroll_error(&result, &ScrollError::BatchSizeExceeded { requested, max: 1000 });
        prop_assert_eq!(fixture.store.total_calls(), 0);
    }
}
