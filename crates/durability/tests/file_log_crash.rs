//! Crash behaviour of the file-backed log: torn tails, corrupt frames, and
//! the semantic logs running on top of a reopened file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use tempfile::tempdir;
use txcoord_core::{RecoveryLog, TransactionState, Xid};
use txcoord_durability::{
    BranchEntry, FileLog, PartnerLog, ServerState, ServiceData, TransactionHeader,
    TransactionLog,
};
use uuid::Uuid;

fn service(appl_id: Uuid) -> ServiceData {
    ServiceData {
        server_name: "server1".to_string(),
        appl_id,
        epoch: 1,
    }
}

// ============================================================================
// Torn tails
// ============================================================================

#[test]
fn test_torn_tail_is_truncated() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tran.log");

    {
        let log = FileLog::open(&path, "tran").unwrap();
        let r = log.create_record().unwrap();
        log.write_section(r, 1, b"complete", true).unwrap();
        log.force().unwrap();
    }
    let good_len = fs::metadata(&path).unwrap().len();

    // Half a frame: a length prefix promising more bytes than exist
    {
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let log = FileLog::open(&path, "tran").unwrap();
    assert_eq!(log.records().unwrap().len(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

    // The log keeps working after truncation
    let r = log.create_record().unwrap();
    log.write_section(r, 1, b"after", true).unwrap();
    log.force().unwrap();
    drop(log);
    assert_eq!(FileLog::open(&path, "tran").unwrap().records().unwrap().len(), 2);
}

#[test]
fn test_corrupt_last_frame_is_dropped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tran.log");

    {
        let log = FileLog::open(&path, "tran").unwrap();
        let a = log.create_record().unwrap();
        log.write_section(a, 1, b"first", true).unwrap();
        log.force().unwrap();
        let b = log.create_record().unwrap();
        log.write_section(b, 1, b"second", true).unwrap();
        log.force().unwrap();
    }

    let mut bytes = fs::read(&path).unwrap();
    let n = bytes.len();
    bytes[n - 6] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let log = FileLog::open(&path, "tran").unwrap();
    let records = log.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].latest(1), Some(&b"first"[..]));
}

// ============================================================================
// Semantic logs over files
// ============================================================================

#[test]
fn test_transaction_log_over_reopened_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tran.log");
    let appl = Uuid::new_v4();
    let xid = Xid::global(appl, 1, 7);

    {
        let store: Arc<dyn RecoveryLog> = Arc::new(FileLog::open(&path, "tran").unwrap());
        let log = TransactionLog::new(store);
        log.write_service_data(&service(appl)).unwrap();
        let r = log
            .create_transaction(&TransactionHeader {
                xid: xid.clone(),
                subordinate: false,
                superior: None,
                owner: None,
            })
            .unwrap();
        log.add_branch(
            r,
            &BranchEntry {
                recovery_id: 1,
                xid: xid.branch(1, 1),
                priority: 0,
            },
        )
        .unwrap();
        log.set_state(r, TransactionState::Committing).unwrap();
    }

    let store: Arc<dyn RecoveryLog> = Arc::new(FileLog::open(&path, "tran").unwrap());
    let replay = TransactionLog::new(store).replay().unwrap();
    assert_eq!(replay.service.unwrap().appl_id, appl);
    assert_eq!(replay.transactions.len(), 1);
    assert_eq!(replay.transactions[0].header.xid, xid);
    assert_eq!(replay.transactions[0].branches[0].recovery_id, 1);
}

#[test]
fn test_partner_log_keypoint_over_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partner.log");
    let appl = Uuid::new_v4();

    let kept;
    {
        let store: Arc<dyn RecoveryLog> = Arc::new(FileLog::open(&path, "partner").unwrap());
        let log = PartnerLog::new(store);
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(
                log.log_partner(&txcoord_core::PartnerDescriptor::new(format!("rm{}", i), vec![]))
                    .unwrap(),
            );
        }
        kept = ids[9];
        for id in &ids[..9] {
            log.remove_partner(*id).unwrap();
        }
        log.write_service_data(&service(appl), ServerState::Recovered)
            .unwrap();
        log.keypoint().unwrap();
    }

    let store: Arc<dyn RecoveryLog> = Arc::new(FileLog::open(&path, "partner").unwrap());
    let replay = PartnerLog::new(store).replay().unwrap();
    assert_eq!(replay.partners.len(), 1);
    assert_eq!(replay.partners[0].recovery_id, kept);
    assert_eq!(replay.low_watermark, kept);
    assert_eq!(replay.state, Some(ServerState::Recovered));
}
