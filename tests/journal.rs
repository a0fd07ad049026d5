//! Durable journal tests.

use replica::{
    ClassInfo, CoreConfig, CoreService, JournalStatus, MemoryRemote, RemoteEvent, ReplicaError,
    Tx, TxJournal, TxOrigin, UpdateOp, CLASS_DOC,
};
use serde_json::Map;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::TempDir;

const TASK: &str = "class:task.Task";

fn remote() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new(vec![ClassInfo::class(TASK)
        .extending(CLASS_DOC)
        .in_domain("tasks")]))
}

fn config(dir: &TempDir) -> CoreConfig {
    CoreConfig {
        journal_path: Some(dir.path().join("journal")),
        ..CoreConfig::default()
    }
}

#[tokio::test]
async fn test_completed_transactions_are_committed() {
    let dir = TempDir::new().unwrap();
    let core = CoreService::start(config(&dir), remote()).await.unwrap();

    core.tx(Tx::create("T1", TASK, Map::new())).await.unwrap();
    core.tx(Tx::update("T1", TASK, vec![UpdateOp::set("title", "x")]))
        .await
        .unwrap();

    let journal = core.journal().unwrap();
    assert_eq!(journal.transactions().unwrap().len(), 2);
    assert!(core.incomplete_transactions().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_pipeline_leaves_pending_entry() {
    let dir = TempDir::new().unwrap();
    let core = CoreService::start(config(&dir), remote()).await.unwrap();

    let ghost = Tx::update("ghost", TASK, vec![UpdateOp::set("title", "x")]);
    assert!(core.tx(ghost.clone()).await.is_err());

    let pending = core.incomplete_transactions().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, JournalStatus::Pending);
    assert_eq!(pending[0].origin, Some(TxOrigin::Client));
    assert_eq!(pending[0].tx.as_ref(), Some(&ghost));
}

#[tokio::test]
async fn test_pending_entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let core = CoreService::start(config(&dir), remote()).await.unwrap();
        core.tx(Tx::create("T1", TASK, Map::new())).await.unwrap();
        let _ = core.tx(Tx::delete("ghost", TASK)).await;
    }

    let core = CoreService::start(config(&dir), remote()).await.unwrap();
    let pending = core.incomplete_transactions().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tx.as_ref().unwrap().object_id.as_str(), "ghost");
}

#[tokio::test]
async fn test_transient_transactions_not_journaled() {
    let dir = TempDir::new().unwrap();
    let core = CoreService::start(config(&dir), remote()).await.unwrap();

    core.dispatch(RemoteEvent::TransientTransactions(vec![Tx::create(
        "T1",
        TASK,
        Map::new(),
    )]))
    .await
    .unwrap();
    core.dispatch(RemoteEvent::Transaction(Tx::create("T2", TASK, Map::new())))
        .await
        .unwrap();

    let journaled = core.journal().unwrap().transactions().unwrap();
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].object_id.as_str(), "T2");
    assert_eq!(core.tx_log().unwrap().len(), 2);
}

#[test]
fn test_corrupted_frame_detected() {
    let dir = TempDir::new().unwrap();
    let path = {
        let journal = TxJournal::open(dir.path()).unwrap();
        journal
            .append(&Tx::create("T1", TASK, Map::new()), TxOrigin::Client)
            .unwrap();
        journal.path().to_path_buf()
    };

    // Flip a byte inside the first frame's payload (after header and length).
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(12)).unwrap();
    file.write_all(&[0xff]).unwrap();
    drop(file);

    assert!(matches!(
        TxJournal::open(dir.path()),
        Err(ReplicaError::Corruption(_))
    ));
}

#[test]
fn test_torn_tail_ignored() {
    let dir = TempDir::new().unwrap();
    let path = {
        let journal = TxJournal::open(dir.path()).unwrap();
        journal
            .append(&Tx::create("T1", TASK, Map::new()), TxOrigin::Client)
            .unwrap();
        journal
            .append(&Tx::create("T2", TASK, Map::new()), TxOrigin::Client)
            .unwrap();
        journal.path().to_path_buf()
    };

    let len = fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let journal = TxJournal::open(dir.path()).unwrap();
    let transactions = journal.transactions().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].object_id.as_str(), "T1");

    // New frames land after the last intact one.
    assert_eq!(
        journal
            .append(&Tx::create("T3", TASK, Map::new()), TxOrigin::Client)
            .unwrap(),
        2
    );
    let ids: Vec<String> = journal
        .transactions()
        .unwrap()
        .into_iter()
        .map(|tx| tx.object_id.to_string())
        .collect();
    assert_eq!(ids, vec!["T1", "T3"]);
}

#[test]
fn test_bad_magic_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("tx.journal"), b"NOPE\x01").unwrap();

    assert!(matches!(
        TxJournal::open(dir.path()),
        Err(ReplicaError::InvalidFormat(_))
    ));
}
