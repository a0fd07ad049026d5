//! Error handling and edge case tests.

use replica::{
    Cache, ClassInfo, CoreConfig, CoreService, DocStorage, DomainRouter, Filter, FindOptions,
    Index, LiveQueryConfig, LogIndex, MemoryRemote, ModelDb, QueriableStorage, RemoteProtocol,
    ReplicaError, Tx, TxContext, TxLog, TxPipeline, UpdateOp, ViewIndex, CLASS_CLASS, CLASS_DOC,
    GENERIC_DOMAIN, MODEL_DOMAIN,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tempfile::TempDir;

const TASK: &str = "class:task.Task";
const NOTE: &str = "class:note.Note";

fn remote() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new(vec![
        ClassInfo::class(TASK).extending(CLASS_DOC).in_domain("tasks"),
        ClassInfo::class(NOTE).extending(CLASS_DOC),
    ]))
}

fn title(value: &str) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("title".into(), json!(value));
    attributes
}

/// A core whose pipeline is only [log, view].
struct LogViewCore {
    core: CoreService,
    log: Arc<TxLog>,
    cache: Arc<QueriableStorage>,
}

async fn log_view_core(remote: Arc<MemoryRemote>) -> LogViewCore {
    let model = Arc::new(ModelDb::new());
    model.load_model(remote.load_domain(MODEL_DOMAIN).await.unwrap());

    let store: Arc<dyn DocStorage> = Arc::new(Cache::new(remote.clone()));
    let cache = QueriableStorage::new(GENERIC_DOMAIN, model.clone(), store, LiveQueryConfig::default());
    let router = DomainRouter::new(model.clone(), cache.clone());

    let log = Arc::new(TxLog::new());
    let indices: Vec<Arc<dyn Index>> = vec![
        Arc::new(LogIndex::new(log.clone())),
        Arc::new(ViewIndex::new(model.clone(), cache.clone())),
    ];
    let core = CoreService::with_pipeline(
        CoreConfig::default(),
        remote,
        model,
        router,
        TxPipeline::new(indices),
    );
    LogViewCore { core, log, cache }
}

// --- Conflicts ---

#[tokio::test]
async fn test_duplicate_create_is_conflict() {
    let core = CoreService::start(CoreConfig::default(), remote()).await.unwrap();
    let tx = Tx::create("T1", TASK, title("first"));

    core.process(&TxContext::server(), &tx).await.unwrap();
    let again = Tx::create("T1", TASK, title("second"));
    let err = core.process(&TxContext::server(), &again).await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(err.failing_index(), Some("view"));

    let doc = core
        .find_one(&TASK.into(), &Filter::by_id(&"T1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.get_str("title"), Some("first"));
}

#[tokio::test]
async fn test_update_and_delete_missing_are_conflicts() {
    let core = CoreService::start(CoreConfig::default(), remote()).await.unwrap();

    let update = Tx::update("ghost", TASK, vec![UpdateOp::set("title", "x")]);
    let err = core.process(&TxContext::server(), &update).await.unwrap_err();
    assert!(err.is_conflict());

    let err = core
        .process(&TxContext::server(), &Tx::delete("ghost", TASK))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_remote_rejects_duplicate_send() {
    let remote = remote();
    let core = CoreService::start(CoreConfig::default(), remote.clone()).await.unwrap();

    core.tx(Tx::create("T1", TASK, title("a"))).await.unwrap();
    let err = core
        .tx(Tx::create("T1", TASK, title("b")))
        .await
        .unwrap_err();

    // Both halves failed: the server rejected it and so did the view.
    match &err {
        ReplicaError::TxFailed { transport, pipeline } => {
            assert!(transport.is_transport());
            assert!(pipeline.is_conflict());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_conflict());
}

// --- Partial Pipeline Failure ---

#[tokio::test]
async fn test_failing_view_keeps_log_entry() {
    let LogViewCore { core, log, cache } = log_view_core(remote()).await;

    core.process(&TxContext::server(), &Tx::create("T1", TASK, title("Write docs")))
        .await
        .unwrap();

    // Push onto a string field: the view rejects it.
    let crafted = Tx::update(
        "T1",
        TASK,
        vec![UpdateOp::Push {
            field: "title".into(),
            value: json!("x"),
        }],
    );
    let err = core.process(&TxContext::server(), &crafted).await.unwrap_err();

    assert_eq!(err.failing_index(), Some("view"));
    assert!(!err.is_conflict());
    match &err {
        ReplicaError::Pipeline { tx, source, .. } => {
            assert_eq!(tx, &crafted.id);
            assert!(matches!(**source, ReplicaError::InvalidUpdate(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Log index applied it, view store unchanged.
    let history = log.entries_for(&"T1".into());
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].tx, crafted);
    let doc = cache.store().get(&"T1".into()).unwrap();
    assert_eq!(doc.get_str("title"), Some("Write docs"));
}

#[tokio::test]
async fn test_pipeline_failure_surfaces_from_tx() {
    let remote = remote();
    let LogViewCore { core, .. } = log_view_core(remote.clone()).await;

    let err = core
        .tx(Tx::update("ghost", TASK, vec![UpdateOp::set("title", "x")]))
        .await
        .unwrap_err();

    // The remote rejected it too (no such document).
    assert!(matches!(err, ReplicaError::TxFailed { .. }));
    assert_eq!(remote.sent().len(), 1);
}

// --- Schema ---

#[tokio::test]
async fn test_cast_to_unrelated_class_fails() {
    let core = CoreService::start(CoreConfig::default(), remote()).await.unwrap();
    let doc = replica::Doc::new("T1", TASK);

    let err = core.get_model().cast(&doc, &NOTE.into()).unwrap_err();
    match err {
        ReplicaError::Cast { doc, expected, actual } => {
            assert_eq!(doc.as_str(), "T1");
            assert_eq!(expected.as_str(), NOTE);
            assert_eq!(actual.as_str(), TASK);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_domain_change_rejected() {
    let core = CoreService::start(CoreConfig::default(), remote()).await.unwrap();

    let move_tasks = Tx::update(TASK, CLASS_CLASS, vec![UpdateOp::set("domain", "elsewhere")]);
    let err = core
        .process(&TxContext::server(), &move_tasks)
        .await
        .unwrap_err();

    assert_eq!(err.failing_index(), Some("model"));
    assert_eq!(core.get_model().get_domain(&TASK.into()), "tasks");
}

// --- Live Queries ---

#[tokio::test]
async fn test_live_query_handle_outlives_storage() {
    let remote = remote();
    let query = {
        let core = CoreService::start(CoreConfig::default(), remote).await.unwrap();
        core.query(&TASK.into(), Filter::all(), FindOptions::default())
            .await
            .unwrap()
    };
    // Storage is gone; closing is a no-op and receiving reports disconnection.
    assert!(query.try_recv().is_err());
    query.close();
}

// --- Journal ---

#[tokio::test]
async fn test_journal_directory_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = CoreConfig {
        journal_path: Some(dir.path().to_path_buf()),
        ..CoreConfig::default()
    };

    let _first = CoreService::start(config.clone(), remote()).await.unwrap();
    let second = CoreService::start(config, remote()).await;
    assert!(matches!(second, Err(ReplicaError::Locked)));
}
