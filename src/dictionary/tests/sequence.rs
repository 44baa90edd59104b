// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end sequence tests: the dictionary facade over the in-memory
//! storage engine, including the failure-injection paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use garnet_dictionary::descriptor::{CatalogId, SchemaId};
use garnet_dictionary::error::DictionaryError;
use garnet_dictionary::sequence::SequenceRangeSizer;
use garnet_dictionary::testing::{sequence_fixture, MemoryEngine, WriteOrigin};
use garnet_dictionary::{DataDictionary, DictionaryConfig};

fn dictionary(engine: &Arc<MemoryEngine>) -> DataDictionary<MemoryEngine> {
    DataDictionary::new(Arc::clone(engine), DictionaryConfig::default())
}

#[test]
fn issues_the_whole_range_then_reports_exhaustion() {
    let engine = MemoryEngine::new();
    let schema = SchemaId::new();
    let mut seq = sequence_fixture(schema, "bounded");
    seq.maximum_value = 10;
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    for expected in 1..=10 {
        assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), expected);
    }
    assert!(matches!(
        dictionary.next_sequence_value(id, &session),
        Err(DictionaryError::SequenceExhausted { .. })
    ));
    // the terminal marker is durable
    assert_eq!(engine.sequence_value(id), Some(None));
}

#[test]
fn cycling_sequence_wraps_around() {
    let engine = MemoryEngine::new();
    let schema = SchemaId::new();
    let mut seq = sequence_fixture(schema, "wheel");
    seq.maximum_value = 3;
    seq.can_cycle = true;
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    let drawn: Vec<i64> = (0..9)
        .map(|_| dictionary.next_sequence_value(id, &session).unwrap())
        .collect();
    assert_eq!(drawn, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
}

#[test]
fn concurrent_sessions_draw_distinct_values() {
    const THREADS: usize = 4;
    const DRAWS: usize = 50;

    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "shared");
    let id = seq.id;
    engine.insert_sequence(seq);
    let dictionary = Arc::new(dictionary(&engine));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let engine = Arc::clone(&engine);
        let dictionary = Arc::clone(&dictionary);
        handles.push(std::thread::spawn(move || {
            let session = engine.session();
            (0..DRAWS)
                .map(|_| dictionary.next_sequence_value(id, &session).unwrap())
                .collect::<Vec<i64>>()
        }));
    }
    let mut drawn: Vec<i64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    drawn.sort_unstable();
    // every value distinct and, with no eviction or rollback, gap-free
    let expected: Vec<i64> = (1..=(THREADS * DRAWS) as i64).collect();
    assert_eq!(drawn, expected);
}

#[test]
fn lost_compare_and_write_is_retried_without_duplicates() {
    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "contended");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    engine.fail_next_cas(1);
    for expected in 1..=6 {
        assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), expected);
    }
    // the default range is five values wide, so two extensions happened
    assert_eq!(engine.sequence_value(id), Some(Some(11)));
}

#[test]
fn locked_row_falls_back_to_the_caller_transaction() {
    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "locked");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    engine.fail_next_nested_cas(1);
    assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), 1);

    let log = engine.write_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].origin, WriteOrigin::Caller);
    assert_eq!(log[0].value, Some(6));

    // the next extension takes the cheap path again
    for expected in 2..=6 {
        assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), expected);
    }
    assert_eq!(engine.write_log().last().unwrap().origin, WriteOrigin::Nested);
}

#[test]
fn persistent_contention_gives_up_within_the_lock_budget() {
    let engine = MemoryEngine::new();
    engine.set_lock_timeout_ms(50);
    let seq = sequence_fixture(SchemaId::new(), "hopeless");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    engine.fail_next_cas(usize::MAX);
    assert!(matches!(
        dictionary.next_sequence_value(id, &session),
        Err(DictionaryError::TooMuchContention { .. })
    ));
}

#[test]
fn eviction_flushes_the_unissued_position() {
    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "flushed");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    for expected in 1..=3 {
        assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), expected);
    }
    // three of five pre-allocated values issued; disk holds the boundary
    assert_eq!(engine.sequence_value(id), Some(Some(6)));

    dictionary.clear_sequence_caches(&session);
    // the flush pulls the boundary back to the next unissued value
    assert_eq!(engine.sequence_value(id), Some(Some(4)));

    // a rebuilt updater resumes exactly there: values 4 and 5 are not reissued
    assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), 4);
}

#[test]
fn rolling_back_a_fallback_write_leaves_the_boundary_behind() {
    let engine = MemoryEngine::new();
    engine.set_lock_timeout_ms(100);
    let seq = sequence_fixture(SchemaId::new(), "anomalous");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    engine.fail_next_nested_cas(1);
    assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), 1);
    assert_eq!(engine.sequence_value(id), Some(Some(6)));

    // The boundary write ran in the caller's transaction, so rolling the
    // caller back drags the boundary back with it while the in-memory
    // generator keeps the range it thinks it owns.
    session.rollback();
    assert_eq!(engine.sequence_value(id), Some(Some(1)));

    // The cached range still serves values, and serves them uniquely.
    for expected in 2..=5 {
        assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), expected);
    }
    // The next extension compares against a boundary disk no longer holds,
    // so it burns its lock budget and gives up.
    assert!(matches!(
        dictionary.next_sequence_value(id, &session),
        Err(DictionaryError::TooMuchContention { .. })
    ));
}

#[test]
fn peek_does_not_consume_values() {
    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "peeked");
    let id = seq.id;
    engine.insert_sequence(seq);

    let dictionary = dictionary(&engine);
    let session = engine.session();
    assert_eq!(dictionary.peek_sequence_value(id, &session).unwrap(), Some(1));
    assert_eq!(dictionary.peek_sequence_value(id, &session).unwrap(), Some(1));
    assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), 1);
    assert_eq!(dictionary.peek_sequence_value(id, &session).unwrap(), Some(2));
}

#[test]
fn unknown_sequence_is_an_error() {
    let engine = MemoryEngine::new();
    let dictionary = dictionary(&engine);
    let session = engine.session();
    assert!(matches!(
        dictionary.next_sequence_value(CatalogId::new(), &session),
        Err(DictionaryError::MissingSequence(_))
    ));
}

#[test]
fn malformed_range_property_surfaces_on_first_use() {
    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "misconfigured");
    let id = seq.id;
    engine.insert_sequence(seq);

    let config = DictionaryConfig {
        preallocator: Some("no.such.Sizer".to_string()),
        ..DictionaryConfig::default()
    };
    let dictionary = DataDictionary::new(Arc::clone(&engine), config);
    let session = engine.session();
    assert!(matches!(
        dictionary.next_sequence_value(id, &session),
        Err(DictionaryError::Misconfiguration { .. })
    ));
}

#[test]
fn registered_range_sizer_drives_the_claim_width() {
    #[derive(Debug)]
    struct Wide;
    impl SequenceRangeSizer for Wide {
        fn range_size(&self, _schema: &str, _sequence: &str) -> u64 {
            100
        }
    }

    let engine = MemoryEngine::new();
    let seq = sequence_fixture(SchemaId::new(), "wide");
    let id = seq.id;
    engine.insert_sequence(seq);

    let mut range_sizers: BTreeMap<String, Arc<dyn SequenceRangeSizer>> = BTreeMap::new();
    range_sizers.insert("wide".to_string(), Arc::new(Wide));
    let config = DictionaryConfig {
        preallocator: Some("wide".to_string()),
        range_sizers,
        ..DictionaryConfig::default()
    };
    let dictionary = DataDictionary::new(Arc::clone(&engine), config);
    let session = engine.session();
    assert_eq!(dictionary.next_sequence_value(id, &session).unwrap(), 1);
    // one disk write claimed a hundred values
    assert_eq!(engine.sequence_value(id), Some(Some(101)));
    assert_eq!(engine.write_log().len(), 1);
}
