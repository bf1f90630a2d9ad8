use std::collections::HashSet;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio::sync::broadcast;

use super::store::StoreWriter;
use super::*;

fn record(name: &str) -> UploadRecord {
    let modified = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
    let file = FileHandle::from_bytes(name, modified, Bytes::from_static(b"pixels"));
    UploadRecord::new(file, modified)
}

#[test]
fn test_upload_status_transition() {
    use UploadStatus::*;

    // valid
    assert!(is_valid_transition(Pending, Uploading));
    assert!(is_valid_transition(Pending, Skipped));
    assert!(is_valid_transition(Uploading, Success));
    assert!(is_valid_transition(Uploading, Retrying));
    assert!(is_valid_transition(Retrying, Uploading));
    assert!(is_valid_transition(Error, Retrying));
    assert!(is_valid_transition(Error, Pending));
    assert!(is_valid_transition(Error, Cancelled));

    // invalid
    assert!(!is_valid_transition(Success, Uploading));
    assert!(!is_valid_transition(Skipped, Pending));
    assert!(!is_valid_transition(Cancelled, Pending));
    assert!(!is_valid_transition(Pending, Success));
    assert!(!is_valid_transition(Retrying, Success));
}

#[test]
fn test_upload_id_derivation() {
    let modified = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
    let a = UploadId::derive("IMG_0001.CR2", 25_000_000, modified);
    let b = UploadId::derive("IMG_0001.CR2", 25_000_000, modified);
    let c = UploadId::derive("IMG_0001.CR2", 25_000_001, modified);

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(UploadId::new(), UploadId::new());
}

#[test]
fn test_counts_partition_records() {
    let (events, _) = broadcast::channel(16);
    let writer = StoreWriter::new(events);
    let records: Vec<_> = ["a.jpg", "b.jpg", "c.jpg", "d.jpg"].into_iter().map(record).collect();
    let skipped: HashSet<_> = [records[3].id].into_iter().collect();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();

    let pending = writer.load(records, &skipped);
    assert_eq!(pending.len(), 3);

    writer.assign_destination(
        &ids[0],
        Destination {
            url: "https://s.test/a".into(),
            storage_key: "uploads/a.jpg".into(),
        },
    );
    assert!(writer.begin_transfer(&ids[0]).is_some());
    assert!(writer.begin_transfer(&ids[1]).is_none());
    assert!(writer.transition(&ids[0], UploadStatus::Success));

    let counts = writer.read().counts();
    assert_eq!(counts.success, 1);
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.skipped, 1);
    assert_eq!(counts.total(), 4);
}

#[tokio::test]
async fn test_writer_broadcasts_transitions() {
    let (events, mut rx) = broadcast::channel(16);
    let writer = StoreWriter::new(events);
    let r = record("a.jpg");
    let id = r.id;
    writer.load(vec![r], &HashSet::new());

    assert!(!writer.transition(&id, UploadStatus::Success));
    assert!(rx.try_recv().is_err());

    assert!(writer.transition(&id, UploadStatus::Cancelled));
    match rx.recv().await.unwrap() {
        UploadEvent::StateChanged {
            upload_id,
            old_status,
            new_status,
        } => {
            assert_eq!(upload_id, id);
            assert_eq!(old_status, UploadStatus::Pending);
            assert_eq!(new_status, UploadStatus::Cancelled);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_cancel_unfinished_keeps_terminal_records() {
    let (events, _) = broadcast::channel(16);
    let writer = StoreWriter::new(events);
    let records: Vec<_> = ["a.jpg", "b.jpg", "c.jpg"].into_iter().map(record).collect();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    writer.load(records, &HashSet::new());

    writer.assign_destination(
        &ids[0],
        Destination {
            url: "https://s.test/a".into(),
            storage_key: "uploads/a.jpg".into(),
        },
    );
    writer.begin_transfer(&ids[0]);
    writer.transition(&ids[0], UploadStatus::Success);

    assert_eq!(writer.cancel_unfinished(3, None), 2);
    let store = writer.read();
    assert_eq!(store.get(&ids[0]).unwrap().status, UploadStatus::Success);
    assert_eq!(store.get(&ids[1]).unwrap().status, UploadStatus::Cancelled);
    assert_eq!(store.get(&ids[2]).unwrap().status, UploadStatus::Cancelled);
}

#[test]
fn test_builder_requires_components() {
    let err = UploadOrchestrator::builder().build().err().unwrap();
    assert!(matches!(err, UploadError::MissingComponent(_)));

    let err = UploadOrchestrator::builder()
        .profile(UploadProfile::resilient().with_max_concurrent(0))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, UploadError::InvalidProfile(_)));
}
