// Property-based tests using proptest
//
// These generate random keys, names and offsets to check the pure parts of
// the client: partition selection, SCRAM name escaping, start offset
// parsing and algorithm selection.

#[cfg(test)]
mod property_tests {
    use kafka_conduit::kafka::auth::scram::{escape_name, unescape_name};
    use kafka_conduit::kafka::partitioner::murmur2_partition;
    use kafka_conduit::kafka::{PartitionStrategy, Partitioner, ScramAlgorithm};
    use kafka_conduit::StartOffset;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_partition_always_in_range(
            key in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)),
            partitions in 1i32..1000,
            murmur in any::<bool>(),
        ) {
            let strategy = if murmur { PartitionStrategy::Murmur2 } else { PartitionStrategy::RoundRobin };
            let partitioner = Partitioner::new(strategy);
            let p = partitioner.partition(key.as_deref(), partitions).unwrap();
            prop_assert!((0..partitions).contains(&p));
        }

        #[test]
        fn test_murmur2_is_stable_per_key(
            key in proptest::collection::vec(any::<u8>(), 1..64),
            partitions in 1i32..256,
        ) {
            // Property: the same key lands on the same partition on every send
            let partitioner = Partitioner::new(PartitionStrategy::Murmur2);
            let first = partitioner.partition(Some(&key), partitions).unwrap();
            for _ in 0..5 {
                prop_assert_eq!(partitioner.partition(Some(&key), partitions).unwrap(), first);
            }
            prop_assert_eq!(murmur2_partition(&key, partitions), first);
        }

        #[test]
        fn test_round_robin_visits_every_partition(partitions in 1i32..64) {
            let partitioner = Partitioner::new(PartitionStrategy::RoundRobin);
            let mut seen = vec![false; partitions as usize];
            for _ in 0..partitions {
                seen[partitioner.partition(Some(b"same-key"), partitions).unwrap() as usize] = true;
            }
            prop_assert!(seen.iter().all(|s| *s));
        }

        #[test]
        fn test_non_positive_partition_count_rejected(partitions in i32::MIN..=0) {
            let partitioner = Partitioner::default();
            prop_assert!(partitioner.partition(None, partitions).is_err());
        }

        #[test]
        fn test_escaped_names_have_no_separators(name in "\\PC*") {
            // Property: ',' and '=' never survive escaping, and unescaping restores the name
            let escaped = escape_name(&name);
            prop_assert!(!escaped.contains(','));
            prop_assert!(!escaped.replace("=2C", "").replace("=3D", "").contains('='));
            prop_assert_eq!(unescape_name(&escaped).unwrap(), name);
        }

        #[test]
        fn test_start_offset_parses_non_negative(offset in 0i64..i64::MAX) {
            let parsed: StartOffset = offset.to_string().parse().unwrap();
            prop_assert_eq!(parsed, StartOffset::At(offset));
            prop_assert_eq!(parsed.as_raw(), offset);
        }

        #[test]
        fn test_start_offset_rejects_other_negatives(offset in i64::MIN..-2) {
            prop_assert!(offset.to_string().parse::<StartOffset>().is_err());
            prop_assert!(StartOffset::from_raw(offset).is_err());
        }

        #[test]
        fn test_unknown_algorithm_selects_sha512(name in "[a-z0-9-]{0,16}") {
            let expected = match name.as_str() {
                "sha256" | "scram-sha-256" => ScramAlgorithm::Sha256,
                _ => ScramAlgorithm::Sha512,
            };
            prop_assert_eq!(ScramAlgorithm::from_config(Some(&name)), expected);
        }
    }
}
