//! Both backends must agree on idempotence, usage and vector clock semantics.

use bytes::Bytes;
use proptest::prelude::*;

use meshlog_core::{Address, NodeId, PicoDollar};
use meshlog_store::{
    GatewayEnvelope, MemoryStore, SqliteStore, Store, StoreExt, UsageIncrement,
};

fn envelope(originator: u32, seq: u64) -> GatewayEnvelope {
    GatewayEnvelope {
        originator_node_id: NodeId(originator),
        originator_sequence_id: seq,
        topic: vec![0, 0xaa],
        payer_id: None,
        gateway_time_ns: seq as i64 * 1_000,
        expiry_unixtime: 0,
        originator_envelope: Bytes::from(format!("{}:{}", originator, seq)),
    }
}

async fn replay_everything_twice<S: Store>(store: &S, deliveries: &[(u32, u64)]) {
    let payer = store.find_or_create_payer(&Address([9; 20])).await.unwrap();

    for _ in 0..2 {
        for &(originator, seq) in deliveries {
            let mut env = envelope(originator, seq);
            env.payer_id = Some(payer);
            store
                .insert_gateway_envelope_and_increment_unsettled_usage(
                    env,
                    UsageIncrement {
                        payer_id: payer,
                        originator_id: NodeId(originator),
                        minutes_since_epoch: 0,
                        spend: PicoDollar(1),
                        sequence_id: seq,
                    },
                )
                .await
                .unwrap();
        }
    }
}

async fn assert_state<S: Store>(store: &S, deliveries: &[(u32, u64)]) {
    let mut unique = deliveries.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let clock = store.vector_clock().await.unwrap();
    for originator in unique.iter().map(|(o, _)| *o) {
        let expected_max = unique
            .iter()
            .filter(|(o, _)| *o == originator)
            .map(|(_, s)| *s)
            .max()
            .unwrap();
        assert_eq!(clock.get(NodeId(originator)), expected_max);

        let rows = store
            .gateway_envelopes_by_originator(NodeId(originator))
            .await
            .unwrap();
        let expected_rows = unique.iter().filter(|(o, _)| *o == originator).count();
        assert_eq!(rows.len(), expected_rows);

        assert_eq!(
            store
                .originator_congestion(NodeId(originator), 0)
                .await
                .unwrap(),
            expected_rows as u64
        );
    }
}

#[tokio::test]
async fn test_backends_agree_on_replayed_deliveries() {
    let deliveries = [(100, 1), (200, 1), (100, 2), (100, 2), (200, 5), (100, 7)];

    let sqlite = SqliteStore::open_memory().unwrap();
    replay_everything_twice(&sqlite, &deliveries).await;
    assert_state(&sqlite, &deliveries).await;

    let memory = MemoryStore::new();
    replay_everything_twice(&memory, &deliveries).await;
    assert_state(&memory, &deliveries).await;
    assert_eq!(memory.envelope_count(), 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_each_identity_persisted_once(
        deliveries in prop::collection::vec((1u32..4, 1u64..20), 1..40)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = SqliteStore::open_memory().unwrap();
            replay_everything_twice(&store, &deliveries).await;
            assert_state(&store, &deliveries).await;
        });
    }
}
