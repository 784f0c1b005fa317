//! Property-based tests for the envelope path.

use bytes::Bytes;
use proptest::prelude::*;

use crate::errors::BridgeError;
use crate::harness::SealingPair;

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // open(seal(A, B, m)) recovers A's DID and m
    #[test]
    fn prop_round_trip(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
        block_on(async {
            let pair = SealingPair::new(16, 4096);
            let env = pair.a.seal(&payload).await.unwrap();
            prop_assert_eq!(&env.sender_did, &pair.a.local().did);
            prop_assert_eq!(pair.b.open(&env.bytes).await.unwrap(), vec![Bytes::from(payload.clone())]);
            Ok(())
        })?;
    }

    // no single-byte change yields plaintext
    #[test]
    fn prop_tamper_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        block_on(async {
            let pair = SealingPair::new(16, 4096);
            let env = pair.a.seal(&payload).await.unwrap();
            let mut bytes = env.bytes.to_vec();
            let i = index.index(bytes.len());
            bytes[i] ^= flip;
            let result = pair.b.open(&bytes).await;
            prop_assert!(
                matches!(result, Err(BridgeError::AuthenticationFailed(_))),
                "byte {} flipped by {:#x} gave {:?}", i, flip, result
            );
            Ok(())
        })?;
    }

    // any arrival order within the window is delivered in sequence order,
    // and every sequence exactly once
    #[test]
    fn prop_reordered_within_window(
        order in Just((1u8..=12).collect::<Vec<_>>()).prop_shuffle()
    ) {
        block_on(async {
            let pair = SealingPair::new(16, 64);
            let mut sealed = Vec::new();
            for i in 1u8..=12 {
                sealed.push(pair.a.seal(&[i]).await.unwrap());
            }

            let mut delivered = Vec::new();
            for i in &order {
                let env = &sealed[(*i - 1) as usize];
                delivered.extend(pair.b.open(&env.bytes).await.unwrap());
            }
            let expected: Vec<Bytes> = (1u8..=12).map(|i| Bytes::from(vec![i])).collect();
            prop_assert_eq!(delivered, expected);
            prop_assert_eq!(pair.b.buffered(), 0);

            // a second copy of anything is a replay
            let again = pair.b.open(&sealed[(order[0] - 1) as usize].bytes).await;
            let is_replay = matches!(again, Err(BridgeError::ReplayedEnvelope { .. }));
            prop_assert!(is_replay);
            Ok(())
        })?;
    }
}
