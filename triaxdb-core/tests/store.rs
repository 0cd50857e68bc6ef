//! End-to-end store scenarios across all three axes.

use std::sync::Arc;

use triaxdb_core::prelude::*;
use triaxdb_core::{ErrorKind, FsAdapter};

fn store() -> Store {
    Store::open(MemoryAdapter::new(), StoreConfig::new(3)).unwrap()
}

fn normalize(v: [f32; 3]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

#[test]
fn knn_returns_nearest_first() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, normalize([1.0, 0.0, 0.0])).with_id("n1"))
        .unwrap();
    s.add(Noun::new(NounType::CONCEPT, normalize([0.9, 0.1, 0.0])).with_id("n2"))
        .unwrap();
    s.add(Noun::new(NounType::CONCEPT, normalize([0.0, 0.0, 1.0])).with_id("n3"))
        .unwrap();

    let results = s
        .search(&TripleQuery::new().with_vector(normalize([1.0, 0.0, 0.0]), 2))
        .unwrap();

    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].noun_id.as_str(), "n1");
    assert_eq!(results.hits[1].noun_id.as_str(), "n2");
    assert!(results.hits[0].score >= results.hits[1].score);
}

#[test]
fn shortest_path_chains_hops() {
    let s = store();
    for id in ["a", "b", "c"] {
        s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id(id))
            .unwrap();
    }
    s.relate(&"a".into(), &"b".into(), VerbType::RELATED_TO)
        .unwrap();
    s.relate(&"b".into(), &"c".into(), VerbType::RELATED_TO)
        .unwrap();

    let path = s
        .shortest_path(&"a".into(), &"c".into(), &PathOptions::default())
        .unwrap()
        .expect("path exists");
    let ids: Vec<&str> = path.nodes.iter().map(|n| n.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(path.hops(), 2);
}

#[test]
fn balanced_filter_returns_exact_half() {
    let s = store();
    let mut active_ids = Vec::new();
    for i in 0..100 {
        let status = if i % 2 == 0 { "active" } else { "archived" };
        let id = format!("n{i:03}");
        if status == "active" {
            active_ids.push(id.clone());
        }
        s.add(
            Noun::new(NounType::CONCEPT, vec![i as f32, 1.0, 0.0])
                .with_id(id)
                .with_metadata(Metadata::new().with_field("status", status)),
        )
        .unwrap();
    }

    let results = s
        .search(
            &TripleQuery::new()
                .with_filter(Filter::field("status").eq("active"))
                .with_limit(200),
        )
        .unwrap();

    let mut got: Vec<String> = results
        .hits
        .iter()
        .map(|h| h.noun_id.as_str().to_string())
        .collect();
    got.sort();
    active_ids.sort();
    assert_eq!(got, active_ids);
}

#[test]
fn failed_transaction_leaves_no_trace() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, vec![0.0, 0.0, 1.0]).with_id("existing"))
        .unwrap();

    let result: Result<()> = s.transaction(|tx| {
        let n = tx.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("n-new"))?;
        // Fails: the target endpoint does not exist.
        tx.relate(n, "missing-endpoint".into(), VerbType::RELATED_TO)?;
        Ok(())
    });
    assert!(result.is_err());

    assert!(s.get(&"n-new".into()).unwrap().is_none());
    assert_eq!(s.len(), 1);
    assert!(s
        .get_relations(&RelationQuery::from("n-new"))
        .unwrap()
        .is_empty());
    let knn = s
        .search(&TripleQuery::new().with_vector(vec![1.0, 0.0, 0.0], 10))
        .unwrap();
    assert!(knn.hits.iter().all(|h| h.noun_id.as_str() != "n-new"));
}

#[test]
fn concurrent_writers_lose_nothing() {
    // Scaled-down multi-writer soak: all submitted nouns land, every
    // transaction succeeds, and the statistics agree.
    const WRITERS: usize = 10;
    const OPS: usize = 100;

    let s = Arc::new(Store::open(MemoryAdapter::new(), StoreConfig::new(3)).unwrap());
    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let s = Arc::clone(&s);
        handles.push(std::thread::spawn(move || {
            for i in 0..OPS {
                let id = format!("w{w}-n{i}");
                s.add(
                    Noun::new(NounType::CONCEPT, vec![w as f32, i as f32, 1.0]).with_id(id),
                )
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(s.len(), WRITERS * OPS);
    let stats = s.stats();
    assert_eq!(stats.total_transactions, (WRITERS * OPS) as u64);
    assert_eq!(stats.failed, 0);

    // Buffered high-volume writes are readable before and after flush.
    assert!(s.get(&"w0-n0".into()).unwrap().is_some());
    s.flush().unwrap();
    assert!(s.get(&"w9-n99".into()).unwrap().is_some());
}

#[test]
fn graph_only_weights_rank_by_hops() {
    let s = store();
    for id in ["a", "b", "c", "d"] {
        s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id(id))
            .unwrap();
    }
    s.relate(&"a".into(), &"b".into(), VerbType::RELATED_TO)
        .unwrap();
    s.relate(&"b".into(), &"c".into(), VerbType::RELATED_TO)
        .unwrap();
    s.relate(&"c".into(), &"d".into(), VerbType::RELATED_TO)
        .unwrap();

    let results = s
        .search(
            &TripleQuery::new()
                .with_vector(vec![1.0, 0.0, 0.0], 10)
                .with_graph(GraphConstraint::from(vec!["a".into()]).with_depth(3))
                .with_weights(ScoreWeights::new(0.0, 1.0, 0.0)),
        )
        .unwrap();

    // Pure graph weighting: order must equal hop distance order.
    let ids: Vec<&str> = results.hits.iter().map(|h| h.noun_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    for (hit, expected_hops) in results.hits.iter().zip(0usize..) {
        assert_eq!(hit.graph_hops, Some(expected_hops));
        let path = s
            .shortest_path(&"a".into(), &hit.noun_id, &PathOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(path.hops(), expected_hops);
    }
}

#[test]
fn relations_flag_deleted_targets() {
    let s = store();
    for id in ["a", "b"] {
        s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id(id))
            .unwrap();
    }
    s.relate(&"a".into(), &"b".into(), VerbType::RELATED_TO)
        .unwrap();
    s.relate(&"b".into(), &"a".into(), VerbType::SUPPORTS)
        .unwrap();

    s.delete(&"a".into()).unwrap();

    // Outgoing relations of the deleted noun are gone entirely.
    assert!(s
        .get_relations(&RelationQuery::from("a"))
        .unwrap()
        .is_empty());

    // The surviving verb pointing at it carries the deleted flag.
    let from_b = s.get_relations(&RelationQuery::from("b")).unwrap();
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].noun_id.as_str(), "a");
    assert!(from_b[0].deleted);
}

#[test]
fn max_depth_zero_returns_start_only() {
    let s = store();
    for id in ["a", "b"] {
        s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id(id))
            .unwrap();
    }
    s.relate(&"a".into(), &"b".into(), VerbType::RELATED_TO)
        .unwrap();

    let results = s
        .search(
            &TripleQuery::new()
                .with_graph(GraphConstraint::from(vec!["a".into()]).with_depth(0))
                .with_limit(10),
        )
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].noun_id.as_str(), "a");
}

#[test]
fn type_restriction_skips_other_partitions() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("concept"))
        .unwrap();
    s.add(Noun::new(NounType::PERSON, vec![1.0, 0.0, 0.0]).with_id("person"))
        .unwrap();

    let results = s
        .search(
            &TripleQuery::new()
                .with_vector(vec![1.0, 0.0, 0.0], 10)
                .with_types(vec![NounType::PERSON]),
        )
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].noun_id.as_str(), "person");
}

#[test]
fn min_similarity_drops_far_hits() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("near"))
        .unwrap();
    s.add(Noun::new(NounType::CONCEPT, vec![-1.0, 0.0, 0.0]).with_id("far"))
        .unwrap();

    let results = s
        .search(
            &TripleQuery::new()
                .with_vector(vec![1.0, 0.0, 0.0], 10)
                .with_min_similarity(0.9),
        )
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].noun_id.as_str(), "near");
}

#[test]
fn cancelled_search_reports_cancelled() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("n1"))
        .unwrap();

    let token = CancelToken::new();
    token.cancel();
    let err = s
        .search_with_cancel(
            &TripleQuery::new().with_vector(vec![1.0, 0.0, 0.0], 1),
            &token,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn disk_backed_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    {
        let adapter = FsAdapter::open(dir.path()).unwrap();
        let s = Store::open(adapter, StoreConfig::new(3)).unwrap();
        s.add(
            Noun::new(NounType::DOCUMENT, vec![0.6, 0.8, 0.0])
                .with_id("doc")
                .with_metadata(Metadata::new().with_field("lang", "en")),
        )
        .unwrap();
        s.add(Noun::new(NounType::PERSON, vec![0.0, 1.0, 0.0]).with_id("author"))
            .unwrap();
        s.relate(&"doc".into(), &"author".into(), VerbType::CREATED_BY)
            .unwrap();
        s.flush().unwrap();
    }

    let adapter = FsAdapter::open(dir.path()).unwrap();
    let s = Store::open(adapter, StoreConfig::new(3)).unwrap();
    assert_eq!(s.len(), 2);

    let results = s
        .search(
            &TripleQuery::new()
                .with_vector(vec![0.6, 0.8, 0.0], 1)
                .with_filter(Filter::field("lang").eq("en")),
        )
        .unwrap();
    assert_eq!(results.hits[0].noun_id.as_str(), "doc");

    let relations = s.get_relations(&RelationQuery::from("doc")).unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].verb_type, VerbType::CREATED_BY);
}

#[test]
fn update_with_new_vector_moves_the_noun() {
    let s = store();
    s.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("mover"))
        .unwrap();
    s.add(Noun::new(NounType::CONCEPT, vec![0.8, 0.2, 0.0]).with_id("anchor"))
        .unwrap();

    s.update(
        &"mover".into(),
        NounPatch::new().with_vector(vec![0.0, 0.0, 1.0]),
    )
    .unwrap();

    let results = s
        .search(&TripleQuery::new().with_vector(vec![1.0, 0.0, 0.0], 1))
        .unwrap();
    assert_eq!(results.hits[0].noun_id.as_str(), "anchor");

    let results = s
        .search(&TripleQuery::new().with_vector(vec![0.0, 0.0, 1.0], 1))
        .unwrap();
    assert_eq!(results.hits[0].noun_id.as_str(), "mover");
}
