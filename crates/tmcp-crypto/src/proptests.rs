#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::envelope::{decode_envelope, encode_envelope, open_envelope, seal_envelope};
    use crate::keys::KeyMaterial;
    use crate::replay::ReorderWindow;

    const A: &str = "did:web:did.example.org:endpoint:a";
    const B: &str = "did:web:did.example.org:endpoint:b";

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_open_seal_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let a = KeyMaterial::generate();
            let b = KeyMaterial::generate();
            let env = seal_envelope(&a, A, B, &b.public_keys().kex_pub, &payload, 42).unwrap();
            let opened = open_envelope(&env, &b, &a.public_keys().sign_pub).unwrap();
            prop_assert_eq!(opened, payload);
        }

        // Flipping any byte of the wire form must never yield plaintext.
        #[test]
        fn test_tampered_wire_never_opens(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let a = KeyMaterial::generate();
            let b = KeyMaterial::generate();
            let env = seal_envelope(&a, A, B, &b.public_keys().kex_pub, &payload, 42).unwrap();
            let mut wire = encode_envelope(&env);
            let i = index.index(wire.len());
            wire[i] ^= flip;

            let opened = decode_envelope(&wire)
                .ok()
                .and_then(|env| open_envelope(&env, &b, &a.public_keys().sign_pub).ok());
            prop_assert!(opened.is_none());
        }

        // Any arrival order inside the window is released as 1..=n.
        #[test]
        fn test_window_releases_in_order(order in Just((1..=32u64).collect::<Vec<_>>()).prop_shuffle()) {
            let mut w = ReorderWindow::new(32);
            let mut delivered = Vec::new();
            for seq in order {
                delivered.extend(w.admit(seq, seq).unwrap());
            }
            prop_assert_eq!(delivered, (1..=32u64).collect::<Vec<_>>());
        }

        // Whatever arrives, output is strictly increasing and never repeats.
        #[test]
        fn test_window_output_strictly_increasing(
            arrivals in proptest::collection::vec(1u64..64, 0..128),
            window in 1usize..16,
        ) {
            let mut w = ReorderWindow::new(window);
            let mut last = 0u64;
            for seq in arrivals {
                if let Ok(released) = w.admit(seq, seq) {
                    for s in released {
                        prop_assert!(s > last);
                        last = s;
                    }
                }
            }
        }
    }
}
