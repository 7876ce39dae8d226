//! Property-based tests for CloakDrop
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Cloak Properties
// ============================================================================

mod cloak_properties {
    use super::*;
    use cloakdrop_cloak::{Cloak, CloakParams, LogCloak, Secret};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    proptest! {
        // Key derivation dominates; keep the case count low.
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// Decloaking with the same secret restores the exact bytes
        #[test]
        fn cloak_roundtrip(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            secret in 100_000u32..=999_999,
        ) {
            let dir = TempDir::new().unwrap();
            let input = dir.path().join("payload.bin");
            std::fs::write(&input, &data).unwrap();
            let secret = Secret::new(secret).unwrap();

            let cloak = LogCloak::new(dir.path().join("work"), CloakParams::low_security());
            let artifact = cloak.cloak(&input, &secret).unwrap();
            prop_assert!(artifact.name.ends_with(".log"));
            prop_assert_eq!(artifact.size, std::fs::metadata(&artifact.path).unwrap().len());

            let out = dir.path().join("out");
            std::fs::create_dir_all(&out).unwrap();
            let restored = cloak.decloak(&artifact.path, &secret, &out).unwrap();
            prop_assert_eq!(restored.file_name().unwrap(), "payload.bin");
            prop_assert_eq!(std::fs::read(&restored).unwrap(), data);
        }

        /// A different secret never opens the artifact
        #[test]
        fn cloak_rejects_other_secret(
            secret in 100_000u32..999_999,
            offset in 1u32..1000,
        ) {
            let dir = TempDir::new().unwrap();
            let input = dir.path().join("payload.bin");
            std::fs::write(&input, b"attack at dawn").unwrap();
            let right = Secret::new(secret).unwrap();
            let wrong = Secret::new(100_000 + (secret - 100_000 + offset) % 900_000).unwrap();

            let cloak = LogCloak::new(dir.path().join("work"), CloakParams::low_security());
            let artifact = cloak.cloak(&input, &right).unwrap();
            prop_assert!(cloak.decloak(&artifact.path, &wrong, dir.path()).is_err());
        }
    }

    proptest! {
        /// Generated secrets are always six digits
        #[test]
        fn secret_in_range(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let secret = Secret::generate_with(&mut rng);
            prop_assert!((100_000..=999_999).contains(&secret.value()));

            let digits = secret.to_digits();
            prop_assert!(digits.iter().all(u8::is_ascii_digit));
            let text = std::str::from_utf8(&digits).unwrap();
            prop_assert_eq!(text.parse::<u32>().unwrap(), secret.value());
        }

        /// Out-of-range values are refused
        #[test]
        fn secret_rejects_out_of_range(value in prop_oneof![0u32..100_000, 1_000_000u32..]) {
            prop_assert!(Secret::new(value).is_err());
        }
    }
}

// ============================================================================
// Rendezvous Properties
// ============================================================================

mod rendezvous_properties {
    use super::*;
    use cloakdrop_rendezvous::{DropRequestId, DropStatus};

    fn status() -> impl Strategy<Value = DropStatus> {
        prop_oneof![
            Just(DropStatus::Pending),
            Just(DropStatus::Accepted),
            Just(DropStatus::Complete),
            Just(DropStatus::Declined),
            Just(DropStatus::Error),
        ]
    }

    proptest! {
        /// Terminal statuses have no successors
        #[test]
        fn terminal_status_is_final(from in status(), to in status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            prop_assert!(!from.can_transition_to(from));
        }

        /// Short ids are prefixes of the full id
        #[test]
        fn short_id_is_prefix(raw in "[A-Za-z0-9]{1,40}") {
            let id = DropRequestId::new(raw.clone());
            prop_assert!(raw.starts_with(id.short()));
            prop_assert_eq!(id.as_str(), raw.as_str());
        }
    }

    #[test]
    fn generated_ids_are_alphanumeric() {
        for _ in 0..100 {
            let id = DropRequestId::generate();
            assert_eq!(id.as_str().len(), 20);
            assert!(id.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }
}

// ============================================================================
// Swarm Encoding Properties
// ============================================================================

mod swarm_properties {
    use super::*;
    use cloakdrop_swarm::bencode::{self, Value};
    use cloakdrop_swarm::{InfoHash, MagnetLink};
    use std::net::{Ipv4Addr, SocketAddr};

    fn value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::btree_map(
                    prop::collection::vec(any::<u8>(), 0..12),
                    inner,
                    0..6
                )
                .prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        /// Bencode decode inverts encode
        #[test]
        fn bencode_roundtrip(v in value()) {
            let encoded = bencode::encode(&v);
            prop_assert_eq!(bencode::decode(&encoded).unwrap(), v);
        }

        /// Decoding arbitrary bytes never panics
        #[test]
        fn bencode_decode_garbage(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = bencode::decode(&data);
        }

        /// A magnet link parses back to itself
        #[test]
        fn magnet_display_parse(
            hash in any::<[u8; 20]>(),
            name in prop::option::of("[a-zA-Z0-9 ._-]{1,24}"),
            peers in prop::collection::vec((any::<[u8; 4]>(), 1u16..), 0..4),
        ) {
            let mut link = MagnetLink::new(InfoHash(hash));
            if let Some(name) = name {
                link = link.with_name(name);
            }
            for (ip, port) in peers {
                link = link.with_peer(SocketAddr::from((Ipv4Addr::from(ip), port)));
            }
            let parsed: MagnetLink = link.to_string().parse().unwrap();
            prop_assert_eq!(parsed, link);
        }
    }
}

// ============================================================================
// Sender State Machine Properties
// ============================================================================

mod machine_properties {
    use super::*;
    use cloakdrop_core::direct::DirectEvent;
    use cloakdrop_core::{Effect, Input, SenderMachine, TransferPolicy};
    use cloakdrop_rendezvous::{
        DocumentChange, DropRequest, DropRequestId, DropStatus, SenderAddress,
    };
    use cloakdrop_swarm::{SwarmEventKind, SwarmProgress};

    const TOTAL: u64 = 10_000;

    fn snapshot(status: DropStatus, version: u64) -> Input {
        Input::Rendezvous(Some(DocumentChange::Snapshot(DropRequest {
            id: DropRequestId::new("prop"),
            sender_id: "alice".into(),
            sender_username: "alice".into(),
            receiver_username: "bob".into(),
            original_filename: "a.bin".into(),
            cloaked_filename: "syncd-1-aa.log".into(),
            cloaked_file_size: TOTAL,
            secret: 123_456,
            sender_address: SenderAddress {
                host: None,
                port: 4000,
            },
            swarm_link: None,
            status,
            created_at_ms: 0,
            version,
        })))
    }

    fn input() -> impl Strategy<Value = Input> {
        let status = prop_oneof![
            Just(DropStatus::Pending),
            Just(DropStatus::Accepted),
            Just(DropStatus::Complete),
            Just(DropStatus::Declined),
            Just(DropStatus::Error),
        ];
        let peer = "127.0.0.1:9".parse().unwrap();
        prop_oneof![
            4 => (status, 0u64..12).prop_map(|(s, v)| snapshot(s, v)),
            1 => Just(Input::Rendezvous(Some(DocumentChange::Deleted))),
            1 => Just(Input::Rendezvous(None)),
            4 => (0u64..2 * TOTAL)
                .prop_map(|bytes_sent| Input::Direct(DirectEvent::Progress { bytes_sent })),
            1 => Just(Input::Direct(DirectEvent::Failed {
                peer,
                message: "reset".into(),
            })),
            2 => (0u64..2 * TOTAL).prop_map(|bytes_uploaded| {
                Input::Swarm(SwarmEventKind::Progress(SwarmProgress {
                    bytes_uploaded,
                    ..SwarmProgress::default()
                }))
            }),
            1 => Just(Input::Swarm(SwarmEventKind::Error("engine".into()))),
            1 => Just(Input::AcceptanceTimeout),
            1 => Just(Input::Cancel),
        ]
    }

    fn policy() -> impl Strategy<Value = TransferPolicy> {
        prop_oneof![
            Just(TransferPolicy::Direct),
            Just(TransferPolicy::Swarm),
            Just(TransferPolicy::Both),
        ]
    }

    proptest! {
        /// Teardown happens exactly once per terminal drop, and nothing
        /// after it produces effects
        #[test]
        fn terminal_absorbs_everything(
            policy in policy(),
            inputs in prop::collection::vec(input(), 0..40),
        ) {
            let mut machine = SenderMachine::new(TOTAL, policy);
            machine.step(Input::Published { version: 1 });

            let mut teardowns = 0;
            let mut seen = 0;
            for input in inputs {
                let was_terminal = machine.is_terminal();
                let effects = machine.step(input);
                if was_terminal {
                    prop_assert!(effects.is_empty());
                }
                teardowns += effects.iter().filter(|e| matches!(e, Effect::Teardown)).count();

                prop_assert!(machine.bytes_seen() >= seen);
                prop_assert!(machine.bytes_seen() <= TOTAL);
                seen = machine.bytes_seen();
            }

            prop_assert_eq!(teardowns, usize::from(machine.is_terminal()));
            prop_assert_eq!(machine.outcome().is_some(), machine.is_terminal());
        }

        /// Status writes only ever report an error
        #[test]
        fn sender_only_writes_error(
            policy in policy(),
            inputs in prop::collection::vec(input(), 0..40),
        ) {
            let mut machine = SenderMachine::new(TOTAL, policy);
            machine.step(Input::Published { version: 1 });
            for input in inputs {
                for effect in machine.step(input) {
                    if let Effect::WriteStatus(status) = effect {
                        prop_assert_eq!(status, DropStatus::Error);
                    }
                }
            }
        }
    }
}
