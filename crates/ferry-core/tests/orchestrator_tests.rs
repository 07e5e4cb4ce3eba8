//! Dependency orchestration tests over fake sources

use ferry_core::{
    DependencyEdge, DependencyOrchestrator, MigrateError, MokaRecordStore, OutputSink, Outcome,
    ProgressSink, RecordStore, RunConfig,
};
use ferry_test_utils::{orders_and_users, CountingProgress, FakeImporter, FakeSource, Journal, MemorySink};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Harness {
    output: Arc<MemorySink>,
    progress: Arc<CountingProgress>,
}

impl Harness {
    fn new() -> Self {
        Self {
            output: Arc::new(MemorySink::new()),
            progress: Arc::new(CountingProgress::default()),
        }
    }

    fn orchestrator(&self, config: RunConfig) -> DependencyOrchestrator {
        DependencyOrchestrator::new()
            .with_config(Arc::new(config))
            .with_output(Arc::clone(&self.output) as Arc<dyn OutputSink>)
            .with_progress(Arc::clone(&self.progress) as Arc<dyn ProgressSink>)
    }
}

fn names(entries: &[&str]) -> Vec<String> {
    entries.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn test_required_pre_dependency_runs_first() {
    let journal = Journal::new();
    let source = orders_and_users(&journal);
    let harness = Harness::new();

    let result = harness
        .orchestrator(RunConfig::new(["orders"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["users", "orders"]));
    assert_eq!(journal.completions(), names(&["users", "orders"]));
    assert_eq!(result.entities(), names(&["users", "orders"]));
    assert_eq!(source.query_log_disabled(), 1);
    assert!(harness.output.contains("Migrating users..."));
    assert!(harness.output.contains("Migrated orders: 3 records processed"));
    assert_eq!(harness.progress.steps(), 6);
}

#[tokio::test]
async fn test_shared_dependency_imported_once() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("users", &journal))
        .with_importer(FakeImporter::new("orders", &journal).with_dependency(DependencyEdge::required_pre("users")))
        .with_importer(FakeImporter::new("invoices", &journal).with_dependency(DependencyEdge::required_pre("users")));
    let harness = Harness::new();

    harness
        .orchestrator(RunConfig::new(["orders", "invoices", "users"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["users", "orders", "invoices"]));
}

#[tokio::test]
async fn test_post_dependencies_follow_entity() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(
            FakeImporter::new("posts", &journal)
                .with_dependency(DependencyEdge::required_pre("users"))
                .with_dependency(DependencyEdge::required_post("comments"))
                .with_dependency(DependencyEdge::required_post("tags")),
        )
        .with_importer(FakeImporter::new("users", &journal))
        .with_importer(FakeImporter::new("comments", &journal))
        .with_importer(FakeImporter::new("tags", &journal));
    let harness = Harness::new();

    harness
        .orchestrator(RunConfig::new(["posts"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["users", "posts", "comments", "tags"]));
}

#[tokio::test]
async fn test_exclusion_overrides_required_edge() {
    let journal = Journal::new();
    let source = orders_and_users(&journal);
    let harness = Harness::new();

    harness
        .orchestrator(RunConfig::new(["orders"]).with_excluded(["users"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["orders"]));
    assert!(harness.output.contains("Skipping users: excluded"));
}

#[tokio::test]
async fn test_optional_edge_needs_activation() {
    let journal = Journal::new();
    let build = |journal: &Journal| {
        FakeSource::new()
            .with_importer(
                FakeImporter::new("posts", journal)
                    .with_dependency(DependencyEdge::optional_pre("media").with_description("attached files")),
            )
            .with_importer(FakeImporter::new("media", journal))
    };

    let source = build(&journal);
    Harness::new()
        .orchestrator(RunConfig::new(["posts"]))
        .migrate(&source)
        .await
        .unwrap();
    assert_eq!(journal.imports(), names(&["posts"]));

    let activated = Journal::new();
    let source = build(&activated);
    Harness::new()
        .orchestrator(RunConfig::new(["posts"]).with_optional(["media"]))
        .migrate(&source)
        .await
        .unwrap();
    assert_eq!(activated.imports(), names(&["media", "posts"]));
}

#[tokio::test]
async fn test_completed_entity_is_skipped_unless_forced() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("users", &journal).completed())
        .with_importer(FakeImporter::new("orders", &journal).with_dependency(DependencyEdge::required_pre("users")));
    let harness = Harness::new();

    harness
        .orchestrator(RunConfig::new(["orders"]))
        .migrate(&source)
        .await
        .unwrap();
    assert_eq!(journal.imports(), names(&["orders"]));
    assert!(harness.output.contains("Skipping users: already completed"));

    let forced = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("users", &forced).completed())
        .with_importer(FakeImporter::new("orders", &forced).with_dependency(DependencyEdge::required_pre("users")));
    Harness::new()
        .orchestrator(RunConfig::new(["orders"]).forced())
        .migrate(&source)
        .await
        .unwrap();
    assert_eq!(forced.imports(), names(&["users", "orders"]));
}

#[tokio::test]
async fn test_partial_runs_do_not_mark_completed() {
    for config in [
        RunConfig::new(["users"]).with_offset(0),
        RunConfig::new(["users"]).with_limit(1),
        RunConfig::new(["users"]).dry_run(),
    ] {
        let journal = Journal::new();
        let source = FakeSource::new().with_importer(FakeImporter::new("users", &journal));

        Harness::new().orchestrator(config).migrate(&source).await.unwrap();

        assert_eq!(journal.imports(), names(&["users"]));
        assert!(journal.completions().is_empty());
        assert!(!source.fake("users").unwrap().is_marked_completed());
    }
}

#[tokio::test]
async fn test_importer_receives_run_config() {
    let journal = Journal::new();
    let source = orders_and_users(&journal);

    Harness::new()
        .orchestrator(RunConfig::new(["orders"]).with_batch_size(25))
        .migrate(&source)
        .await
        .unwrap();

    let config = source.fake("users").unwrap().config().unwrap();
    assert_eq!(config.batch_size, 25);
    assert_eq!(config.entities, names(&["orders"]));
}

#[tokio::test]
async fn test_pre_cycle_migrates_each_entity_once() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("a", &journal).with_dependency(DependencyEdge::required_pre("b")))
        .with_importer(FakeImporter::new("b", &journal).with_dependency(DependencyEdge::required_pre("a")));

    Harness::new()
        .orchestrator(RunConfig::new(["a"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["b", "a"]));
}

#[tokio::test]
async fn test_pre_post_cycle_migrates_each_entity_once() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("a", &journal).with_dependency(DependencyEdge::required_post("b")))
        .with_importer(FakeImporter::new("b", &journal).with_dependency(DependencyEdge::required_pre("a")));

    Harness::new()
        .orchestrator(RunConfig::new(["a", "b"]))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(journal.imports(), names(&["a", "b"]));
}

#[tokio::test]
async fn test_import_failure_aborts_and_keeps_counts() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(FakeImporter::new("users", &journal).with_records(5))
        .with_importer(
            FakeImporter::new("orders", &journal)
                .with_dependency(DependencyEdge::required_pre("users"))
                .failing("legacy database went away"),
        )
        .with_importer(FakeImporter::new("invoices", &journal));
    let harness = Harness::new();

    let err = harness
        .orchestrator(RunConfig::new(["orders", "invoices"]))
        .migrate(&source)
        .await
        .unwrap_err();

    assert!(matches!(&err, MigrateError::Import { entity, .. } if entity == "orders"));
    assert!(err.to_string().contains("orders"));
    assert_eq!(journal.imports(), names(&["users", "orders"]));
    assert_eq!(journal.completions(), names(&["users"]));
}

#[tokio::test]
async fn test_unknown_dependency_only_fails_when_followed() {
    let journal = Journal::new();
    let source = FakeSource::new().with_importer(
        FakeImporter::new("posts", &journal).with_dependency(DependencyEdge::optional_pre("legacy_media")),
    );

    Harness::new()
        .orchestrator(RunConfig::new(["posts"]))
        .migrate(&source)
        .await
        .unwrap();
    assert_eq!(journal.imports(), names(&["posts"]));

    let err = Harness::new()
        .orchestrator(RunConfig::new(["posts"]).with_optional(["legacy_media"]))
        .migrate(&source)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnknownEntity(name) if name == "legacy_media"));
}

#[tokio::test]
async fn test_optional_dependencies_listing() {
    let journal = Journal::new();
    let source = FakeSource::new()
        .with_importer(
            FakeImporter::new("posts", &journal)
                .with_dependency(DependencyEdge::required_pre("users"))
                .with_dependency(DependencyEdge::optional_pre("media"))
                .with_dependency(DependencyEdge::optional_post("redirects")),
        )
        .with_importer(FakeImporter::new("pages", &journal).with_dependency(DependencyEdge::optional_pre("media")))
        .with_importer(FakeImporter::new("users", &journal));
    let harness = Harness::new();

    let all = harness
        .orchestrator(RunConfig::new(["posts"]))
        .optional_dependencies(&source, None)
        .unwrap();
    assert_eq!(all.keys().cloned().collect::<Vec<_>>(), names(&["media", "redirects"]));

    let filtered = harness
        .orchestrator(RunConfig::new(["posts"]).with_excluded(["media"]))
        .optional_dependencies(&source, Some("posts"))
        .unwrap();
    assert_eq!(filtered.keys().cloned().collect::<Vec<_>>(), names(&["redirects"]));

    let err = harness
        .orchestrator(RunConfig::new(["posts"]))
        .optional_dependencies(&source, Some("widgets"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnknownEntity(_)));
}

#[tokio::test]
async fn test_detail_records_land_in_shared_store() {
    let journal = Journal::new();
    let source = orders_and_users(&journal);
    let store: Arc<dyn RecordStore> = Arc::new(MokaRecordStore::new());

    let result = Harness::new()
        .orchestrator(RunConfig::new(["orders"]))
        .with_store(Arc::clone(&store))
        .migrate(&source)
        .await
        .unwrap();

    assert_eq!(result.records("users", Outcome::Migrated).await.unwrap().len(), 3);
    assert_eq!(result.totals().migrated, 6);

    result.cleanup().await.unwrap();
    assert!(result.records("users", Outcome::Migrated).await.unwrap().is_empty());
}

mod properties {
    use super::*;
    use ferry_core::DependencyPhase;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone)]
    struct Graph {
        size: usize,
        edges: Vec<(usize, usize, DependencyPhase, bool)>,
        excluded: Vec<usize>,
        requested: Vec<usize>,
    }

    fn entity(i: usize) -> String {
        format!("e{i}")
    }

    // Pre edges only point at lower indices, so they never form a cycle;
    // post edges may point anywhere.
    fn graph() -> impl Strategy<Value = Graph> {
        (2..8usize).prop_flat_map(|size| {
            (
                Just(size),
                prop::collection::vec((0..size, 0..size, any::<bool>(), any::<bool>()), 0..16),
                prop::collection::vec(0..size, 0..3),
                prop::collection::vec(0..size, 1..4),
            )
                .prop_map(|(size, raw, excluded, requested)| {
                    let edges = raw
                        .into_iter()
                        .filter_map(|(from, to, pre, required)| {
                            if from == to {
                                None
                            } else if pre {
                                Some((from.max(to), from.min(to), DependencyPhase::Pre, required))
                            } else {
                                Some((from, to, DependencyPhase::Post, required))
                            }
                        })
                        .collect();
                    Graph {
                        size,
                        edges,
                        excluded,
                        requested,
                    }
                })
        })
    }

    fn run(graph: &Graph) -> Vec<String> {
        let journal = Journal::new();
        let mut source = FakeSource::new();
        for i in 0..graph.size {
            let mut importer = FakeImporter::new(entity(i), &journal);
            for (from, to, phase, required) in &graph.edges {
                if *from == i {
                    importer = importer.with_dependency(DependencyEdge::new(entity(*to), *phase, *required));
                }
            }
            source = source.with_importer(importer);
        }
        let config = RunConfig::new(graph.requested.iter().map(|&i| entity(i)))
            .with_excluded(graph.excluded.iter().map(|&i| entity(i)));

        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                Harness::new()
                    .orchestrator(config)
                    .migrate(&source)
                    .await
                    .unwrap();
            });
        journal.imports()
    }

    proptest! {
        #[test]
        fn prop_imports_respect_graph(graph in graph()) {
            let imports = run(&graph);
            let excluded: HashSet<String> = graph.excluded.iter().map(|&i| entity(i)).collect();

            let unique: HashSet<&String> = imports.iter().collect();
            prop_assert_eq!(unique.len(), imports.len());

            for name in &imports {
                prop_assert!(!excluded.contains(name));
            }
            for &i in &graph.requested {
                let name = entity(i);
                prop_assert!(excluded.contains(&name) || imports.contains(&name));
            }

            let position = |name: &str| imports.iter().position(|n| n == name);
            for (from, to, phase, required) in &graph.edges {
                if *phase != DependencyPhase::Pre || !*required {
                    continue;
                }
                let (from, to) = (entity(*from), entity(*to));
                if let Some(at) = position(&from) {
                    if !excluded.contains(&to) {
                        let dep = position(&to);
                        prop_assert!(dep.is_some_and(|d| d < at), "{} must precede {}", to, from);
                    }
                }
            }
        }
    }
}
