//! Log replay for one failure domain
//!
//! Reads back the transaction and partner logs, checks that their service
//! data agree and derives the identity (application id and epoch) the
//! current run will write back. Nothing is written here.

use tracing::{debug, warn};
use txcoord_core::{LogError, RecordId, TxError, TxResult};
use txcoord_durability::{
    LoggedTransaction, PartnerLog, PartnerRecord, ServerState, ServiceData, TransactionLog,
};
use uuid::Uuid;

/// Everything recovery needs from the two logs of a failure domain.
#[derive(Debug, Clone)]
pub struct ReplayedDomain {
    /// Service data for this run: logged identity with the next epoch, or
    /// a fresh identity when the logs were empty.
    pub service: ServiceData,
    /// Highest epoch found in either log (0 when fresh).
    pub recovered_epoch: u32,
    /// True when neither log carried service data.
    pub fresh: bool,
    /// Server state marker left by the previous run.
    pub previous_state: Option<ServerState>,
    /// Transactions to recover.
    pub transactions: Vec<LoggedTransaction>,
    /// Records of finished or undecided work.
    pub discarded: Vec<RecordId>,
    /// Live partners.
    pub partners: Vec<PartnerRecord>,
    /// Partner records below the low watermark.
    pub ignored_partners: usize,
}

/// Map a log-store failure during replay, naming the log for corruption.
pub(crate) fn replay_error(log: &str, e: LogError) -> TxError {
    match e {
        LogError::Corrupted(reason) => TxError::corrupted(log, reason),
        other => TxError::Log(other),
    }
}

/// Replay both logs of a domain.
///
/// # Errors
/// `Corrupted` when either log fails validation or the two logs disagree
/// about the server they belong to; `Log` for store failures.
pub fn replay_domain(
    server_name: &str,
    tran_log: &TransactionLog,
    partner_log: &PartnerLog,
) -> TxResult<ReplayedDomain> {
    let tran = tran_log
        .replay()
        .map_err(|e| replay_error(tran_log.name(), e))?;
    let partner = partner_log
        .replay()
        .map_err(|e| replay_error(partner_log.name(), e))?;

    let logged = check_service_data(
        tran_log.name(),
        tran.service.as_ref(),
        partner_log.name(),
        partner.service.as_ref(),
    )?;

    // xids carry the epoch of the run that began them
    let highest_xid_epoch = tran
        .transactions
        .iter()
        .filter_map(|t| t.header.xid.epoch())
        .max()
        .unwrap_or(0);

    let (service, recovered_epoch, fresh) = match logged {
        Some(data) => {
            if data.server_name != server_name {
                warn!(
                    target: "txcoord::recovery",
                    logged = %data.server_name,
                    configured = %server_name,
                    "Recovering logs written under another server name"
                );
            }
            let recovered_epoch = data.epoch.max(highest_xid_epoch);
            let epoch = next_epoch(tran_log.name(), recovered_epoch)?;
            let service = ServiceData {
                server_name: data.server_name,
                appl_id: data.appl_id,
                epoch,
            };
            (service, recovered_epoch, false)
        }
        None => {
            let service = ServiceData {
                server_name: server_name.to_string(),
                appl_id: Uuid::new_v4(),
                epoch: 1,
            };
            (service, 0, true)
        }
    };

    debug!(
        target: "txcoord::recovery",
        tran_log = %tran_log.name(),
        partner_log = %partner_log.name(),
        transactions = tran.transactions.len(),
        discarded = tran.discarded.len(),
        partners = partner.partners.len(),
        recovered_epoch,
        epoch = service.epoch,
        fresh,
        "Logs replayed"
    );

    Ok(ReplayedDomain {
        service,
        recovered_epoch,
        fresh,
        previous_state: partner.state,
        transactions: tran.transactions,
        discarded: tran.discarded,
        partners: partner.partners,
        ignored_partners: partner.ignored,
    })
}

/// Both logs must carry identical service data, or neither may.
pub(crate) fn check_service_data(
    tran_name: &str,
    tran: Option<&ServiceData>,
    partner_name: &str,
    partner: Option<&ServiceData>,
) -> TxResult<Option<ServiceData>> {
    match (tran, partner) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(TxError::corrupted(
            partner_name,
            format!("service data missing while {} has it", tran_name),
        )),
        (None, Some(_)) => Err(TxError::corrupted(
            tran_name,
            format!("service data missing while {} has it", partner_name),
        )),
        (Some(t), Some(p)) => {
            if t.server_name != p.server_name {
                return Err(TxError::corrupted(
                    partner_name,
                    format!(
                        "server name {} does not match {} in {}",
                        p.server_name, t.server_name, tran_name
                    ),
                ));
            }
            if t.appl_id != p.appl_id {
                return Err(TxError::corrupted(
                    partner_name,
                    format!(
                        "application id {} does not match {} in {}",
                        p.appl_id, t.appl_id, tran_name
                    ),
                ));
            }
            if t.epoch != p.epoch {
                return Err(TxError::corrupted(
                    partner_name,
                    format!(
                        "epoch {} does not match {} in {}",
                        p.epoch, t.epoch, tran_name
                    ),
                ));
            }
            Ok(Some(t.clone()))
        }
    }
}

fn next_epoch(log: &str, recovered: u32) -> TxResult<u32> {
    recovered
        .checked_add(1)
        .ok_or_else(|| TxError::corrupted(log, "epoch counter exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use txcoord_core::{PartnerDescriptor, Xid};
    use txcoord_durability::{MemoryLog, TransactionHeader};

    fn logs() -> (TransactionLog, PartnerLog) {
        (
            TransactionLog::new(Arc::new(MemoryLog::new("tranlog"))),
            PartnerLog::new(Arc::new(MemoryLog::new("partnerlog"))),
        )
    }

    fn data(epoch: u32, appl_id: Uuid) -> ServiceData {
        ServiceData {
            server_name: "server1".to_string(),
            appl_id,
            epoch,
        }
    }

    #[test]
    fn test_fresh_logs_get_new_identity() {
        let (tran, partner) = logs();

        let replayed = replay_domain("server1", &tran, &partner).unwrap();

        assert!(replayed.fresh);
        assert_eq!(replayed.recovered_epoch, 0);
        assert_eq!(replayed.service.epoch, 1);
        assert_eq!(replayed.service.server_name, "server1");
        assert!(replayed.transactions.is_empty());
        assert!(replayed.partners.is_empty());
    }

    #[test]
    fn test_epoch_is_one_past_logged() {
        let (tran, partner) = logs();
        let appl = Uuid::new_v4();
        tran.write_service_data(&data(4, appl)).unwrap();
        partner
            .write_service_data(&data(4, appl), ServerState::Stopped)
            .unwrap();

        let replayed = replay_domain("server1", &tran, &partner).unwrap();

        assert!(!replayed.fresh);
        assert_eq!(replayed.recovered_epoch, 4);
        assert_eq!(replayed.service.epoch, 5);
        assert_eq!(replayed.service.appl_id, appl);
        assert_eq!(replayed.previous_state, Some(ServerState::Stopped));
    }

    #[test]
    fn test_epoch_accounts_for_logged_xids() {
        let (tran, partner) = logs();
        let appl = Uuid::new_v4();
        tran.write_service_data(&data(2, appl)).unwrap();
        partner
            .write_service_data(&data(2, appl), ServerState::Starting)
            .unwrap();
        let id = partner
            .log_partner(&PartnerDescriptor::new("db", b"db".to_vec()))
            .unwrap();
        let xid = Xid::global(appl, 7, 1);
        let record = tran
            .create_transaction(&TransactionHeader {
                xid: xid.clone(),
                subordinate: false,
                superior: None,
                owner: None,
            })
            .unwrap();
        tran.add_branch(
            record,
            &txcoord_durability::BranchEntry {
                recovery_id: id,
                xid: xid.branch(id, 1),
                priority: 0,
            },
        )
        .unwrap();
        tran.set_state(record, txcoord_core::TransactionState::Committing)
            .unwrap();

        let replayed = replay_domain("server1", &tran, &partner).unwrap();

        assert_eq!(replayed.recovered_epoch, 7);
        assert_eq!(replayed.service.epoch, 8);
        assert_eq!(replayed.transactions.len(), 1);
        assert_eq!(replayed.partners.len(), 1);
    }

    #[test]
    fn test_mismatched_epochs_are_corruption() {
        let (tran, partner) = logs();
        let appl = Uuid::new_v4();
        tran.write_service_data(&data(3, appl)).unwrap();
        partner
            .write_service_data(&data(2, appl), ServerState::Starting)
            .unwrap();

        let err = replay_domain("server1", &tran, &partner).unwrap_err();
        assert!(matches!(err, TxError::Corrupted { log, .. } if log == "partnerlog"));
    }

    #[test]
    fn test_mismatched_application_ids_are_corruption() {
        let (tran, partner) = logs();
        tran.write_service_data(&data(1, Uuid::new_v4())).unwrap();
        partner
            .write_service_data(&data(1, Uuid::new_v4()), ServerState::Starting)
            .unwrap();

        assert!(matches!(
            replay_domain("server1", &tran, &partner),
            Err(TxError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_service_data_in_one_log_only_is_corruption() {
        let (tran, partner) = logs();
        tran.write_service_data(&data(1, Uuid::new_v4())).unwrap();

        let err = replay_domain("server1", &tran, &partner).unwrap_err();
        assert!(matches!(err, TxError::Corrupted { log, .. } if log == "partnerlog"));
    }

    #[test]
    fn test_corrupted_log_names_the_log() {
        let err = replay_error("tranlog", LogError::Corrupted("bad".to_string()));
        assert!(matches!(err, TxError::Corrupted { log, reason } if log == "tranlog" && reason == "bad"));
        assert!(matches!(replay_error("tranlog", LogError::Closed), TxError::Log(LogError::Closed)));
    }
}
