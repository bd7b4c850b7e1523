//! Partner log
//!
//! One record per resource manager that has been enlisted, holding the
//! descriptor needed to reconnect to it after a restart. Partners are logged
//! at enlistment and forced before the enlistment returns.
//!
//! Recovery ids are handed out from a block reserved in the service-data
//! record (`NEXT_ID`), so an id is never reused across restarts even after
//! the partner record holding it has been removed. Records whose id is below
//! the logged low watermark are stale and ignored on replay.

use crate::format::{decode, encode, kinds, PartnerRecord, ServerState, ServiceData};
use crate::service::{corrupt, read_service_data, split_service};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use txcoord_core::{LogError, PartnerDescriptor, RecordId, RecoveryLog};

/// Recovery ids reserved per `NEXT_ID` write.
const ID_BLOCK: u64 = 32;

/// Result of replaying the partner log.
#[derive(Debug, Clone, Default)]
pub struct PartnerLogReplay {
    /// Service data, absent on a fresh log.
    pub service: Option<ServiceData>,
    /// Last server state marker.
    pub state: Option<ServerState>,
    /// Logged low watermark.
    pub low_watermark: u64,
    /// First recovery id free for this run.
    pub next_id: u64,
    /// Live partners.
    pub partners: Vec<PartnerRecord>,
    /// Stale partner records below the low watermark.
    pub ignored: usize,
}

struct PartnerLogInner {
    service_record: Option<RecordId>,
    records: BTreeMap<u64, RecordId>,
    next_id: u64,
    reserved_to: u64,
}

/// Semantic layer over the partner [`RecoveryLog`].
pub struct PartnerLog {
    log: Arc<dyn RecoveryLog>,
    inner: Mutex<PartnerLogInner>,
}

impl PartnerLog {
    /// Wrap a log store.
    pub fn new(log: Arc<dyn RecoveryLog>) -> Self {
        PartnerLog {
            log,
            inner: Mutex::new(PartnerLogInner {
                service_record: None,
                records: BTreeMap::new(),
                next_id: 1,
                reserved_to: 1,
            }),
        }
    }

    /// Name of the underlying log.
    pub fn name(&self) -> &str {
        self.log.name()
    }

    fn service_record(&self, inner: &mut PartnerLogInner) -> Result<RecordId, LogError> {
        match inner.service_record {
            Some(r) => Ok(r),
            None => {
                let r = self.log.create_record()?;
                inner.service_record = Some(r);
                Ok(r)
            }
        }
    }

    /// Log a partner and force. Returns its recovery id.
    pub fn log_partner(&self, descriptor: &PartnerDescriptor) -> Result<u64, LogError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;

        if id + 1 > inner.reserved_to {
            let reserved_to = id + 1 + ID_BLOCK;
            let service = self.service_record(&mut inner)?;
            self.log
                .write_section(service, kinds::NEXT_ID, &encode(&reserved_to)?, true)?;
            inner.reserved_to = reserved_to;
        }

        let record = self.log.create_record()?;
        let entry = PartnerRecord {
            recovery_id: id,
            descriptor: descriptor.clone(),
        };
        self.log
            .write_section(record, kinds::PARTNER_DESCRIPTOR, &encode(&entry)?, true)?;
        self.log.force()?;

        inner.next_id = id + 1;
        inner.records.insert(id, record);
        debug!(target: "txcoord::log", recovery_id = id, partner = %descriptor.name, "Partner logged");
        Ok(id)
    }

    /// Remove a partner record. Takes effect durably with the next force.
    pub fn remove_partner(&self, recovery_id: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.remove(&recovery_id) {
            self.log.remove_record(record)?;
        }
        Ok(())
    }

    /// Recovery ids of live partner records.
    pub fn live_ids(&self) -> Vec<u64> {
        self.inner.lock().records.keys().copied().collect()
    }

    /// Write the service data with a server state marker and force.
    pub fn write_service_data(&self, data: &ServiceData, state: ServerState) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        let record = self.service_record(&mut inner)?;
        let low_watermark = inner
            .records
            .keys()
            .next()
            .copied()
            .unwrap_or(inner.next_id);
        if inner.reserved_to < inner.next_id {
            inner.reserved_to = inner.next_id;
        }

        self.log
            .write_section(record, kinds::SERVER_DATA, &encode(&data.server_name)?, true)?;
        self.log
            .write_section(record, kinds::APPLID_DATA, &encode(&data.appl_id)?, true)?;
        self.log
            .write_section(record, kinds::EPOCH_DATA, &encode(&data.epoch)?, true)?;
        self.log
            .write_section(record, kinds::SERVER_STATE, &encode(&state)?, true)?;
        self.log
            .write_section(record, kinds::LOW_WATERMARK, &encode(&low_watermark)?, true)?;
        self.log
            .write_section(record, kinds::NEXT_ID, &encode(&inner.reserved_to)?, true)?;
        self.log.force()?;

        debug!(
            target: "txcoord::log",
            log = %self.name(),
            epoch = data.epoch,
            ?state,
            low_watermark,
            "Partner service data written"
        );
        Ok(())
    }

    /// Compact the underlying store.
    pub fn keypoint(&self) -> Result<(), LogError> {
        self.log.keypoint()
    }

    /// Read back the service data and live partners.
    pub fn replay(&self) -> Result<PartnerLogReplay, LogError> {
        let name = self.name().to_string();
        let split = split_service(&name, self.log.records()?)?;
        let mut replay = PartnerLogReplay {
            next_id: 1,
            ..PartnerLogReplay::default()
        };

        let mut inner = self.inner.lock();
        inner.records.clear();

        if let Some((id, record)) = &split.service {
            inner.service_record = Some(*id);
            // NEXT_ID alone is written before any service data exists
            let has_identity = record.latest(kinds::SERVER_DATA).is_some()
                || record.latest(kinds::APPLID_DATA).is_some()
                || record.latest(kinds::EPOCH_DATA).is_some();
            if has_identity {
                replay.service = Some(read_service_data(&name, record)?);
            }
            if let Some(bytes) = record.latest(kinds::SERVER_STATE) {
                replay.state = Some(decode(bytes).map_err(|e| corrupt(&name, "server state", e))?);
            }
            if let Some(bytes) = record.latest(kinds::LOW_WATERMARK) {
                replay.low_watermark =
                    decode(bytes).map_err(|e| corrupt(&name, "low watermark", e))?;
            }
            if let Some(bytes) = record.latest(kinds::NEXT_ID) {
                replay.next_id = decode(bytes).map_err(|e| corrupt(&name, "next id", e))?;
            }
        }

        for record in split.others {
            let bytes = match record.latest(kinds::PARTNER_DESCRIPTOR) {
                Some(b) => b,
                None => {
                    return Err(LogError::Corrupted(format!(
                        "{}: record {} has no partner descriptor",
                        name, record.id
                    )))
                }
            };
            let partner: PartnerRecord =
                decode(bytes).map_err(|e| corrupt(&name, "partner descriptor", e))?;
            if partner.recovery_id < replay.low_watermark {
                warn!(
                    target: "txcoord::log",
                    recovery_id = partner.recovery_id,
                    low_watermark = replay.low_watermark,
                    "Ignoring partner record below low watermark"
                );
                replay.ignored += 1;
                continue;
            }
            if inner.records.insert(partner.recovery_id, record.id).is_some() {
                return Err(LogError::Corrupted(format!(
                    "{}: recovery id {} logged twice",
                    name, partner.recovery_id
                )));
            }
            replay.next_id = replay.next_id.max(partner.recovery_id + 1);
            replay.partners.push(partner);
        }

        inner.next_id = replay.next_id;
        inner.reserved_to = replay.next_id;
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use uuid::Uuid;

    fn service() -> ServiceData {
        ServiceData {
            server_name: "server1".to_string(),
            appl_id: Uuid::new_v4(),
            epoch: 1,
        }
    }

    #[test]
    fn test_partner_is_durable_at_once() {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = PartnerLog::new(store.clone());
        let id = log.log_partner(&PartnerDescriptor::new("db", b"url".to_vec())).unwrap();
        store.restart();

        let replay = PartnerLog::new(store).replay().unwrap();
        assert_eq!(replay.partners.len(), 1);
        assert_eq!(replay.partners[0].recovery_id, id);
        assert_eq!(replay.partners[0].descriptor.name, "db");
        assert!(replay.service.is_none());
    }

    #[test]
    fn test_recovery_ids_never_reused() {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = PartnerLog::new(store.clone());
        let a = log.log_partner(&PartnerDescriptor::new("a", vec![])).unwrap();
        let b = log.log_partner(&PartnerDescriptor::new("b", vec![])).unwrap();
        log.remove_partner(a).unwrap();
        log.remove_partner(b).unwrap();
        log.write_service_data(&service(), ServerState::Stopped).unwrap();
        store.restart();

        let log = PartnerLog::new(store);
        let replay = log.replay().unwrap();
        assert!(replay.partners.is_empty());
        assert_eq!(replay.state, Some(ServerState::Stopped));
        let c = log.log_partner(&PartnerDescriptor::new("c", vec![])).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_crash_keeps_reserved_block() {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = PartnerLog::new(store.clone());
        let a = log.log_partner(&PartnerDescriptor::new("a", vec![])).unwrap();
        log.remove_partner(a).unwrap();
        store.force().unwrap();
        store.restart();

        let log = PartnerLog::new(store);
        let replay = log.replay().unwrap();
        assert!(replay.next_id > a);
        let b = log.log_partner(&PartnerDescriptor::new("b", vec![])).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_low_watermark_and_state() {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = PartnerLog::new(store.clone());
        let a = log.log_partner(&PartnerDescriptor::new("a", vec![])).unwrap();
        let b = log.log_partner(&PartnerDescriptor::new("b", vec![])).unwrap();
        log.remove_partner(a).unwrap();
        log.write_service_data(&service(), ServerState::Recovered).unwrap();

        let replay = PartnerLog::new(store).replay().unwrap();
        assert_eq!(replay.low_watermark, b);
        assert_eq!(replay.state, Some(ServerState::Recovered));
        assert_eq!(replay.partners.len(), 1);
        assert!(replay.service.is_some());
    }

    #[test]
    fn test_live_ids() {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = PartnerLog::new(store);
        let a = log.log_partner(&PartnerDescriptor::new("a", vec![])).unwrap();
        let b = log.log_partner(&PartnerDescriptor::new("b", vec![])).unwrap();
        log.remove_partner(a).unwrap();
        assert_eq!(log.live_ids(), vec![b]);
    }
}
