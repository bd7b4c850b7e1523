//! Service-data record lookup shared by both logs.

use crate::format::{decode, kinds, ServiceData};
use txcoord_core::{LogError, LogRecord, RecordId};

/// The service-data record of a log, split from the other records.
pub(crate) struct ServiceSplit {
    /// Id and contents of the service-data record, if any.
    pub service: Option<(RecordId, LogRecord)>,
    /// Every other record.
    pub others: Vec<LogRecord>,
}

fn is_service_record(record: &LogRecord) -> bool {
    record
        .sections
        .iter()
        .any(|s| kinds::SERVICE_KINDS.contains(&s.kind))
}

/// Separate the service-data record from the rest, rejecting duplicates.
pub(crate) fn split_service(
    log: &str,
    records: Vec<LogRecord>,
) -> Result<ServiceSplit, LogError> {
    let mut service: Option<(RecordId, LogRecord)> = None;
    let mut others = Vec::new();

    for record in records {
        if !is_service_record(&record) {
            others.push(record);
            continue;
        }
        if service.is_some() {
            return Err(LogError::Corrupted(format!(
                "{}: duplicate service data in record {}",
                log, record.id
            )));
        }
        for section in &record.sections {
            if kinds::SERVICE_KINDS.contains(&section.kind) && section.data.len() > 1 {
                return Err(LogError::Corrupted(format!(
                    "{}: service section {} written {} times",
                    log,
                    section.kind,
                    section.data.len()
                )));
            }
        }
        service = Some((record.id, record));
    }

    Ok(ServiceSplit { service, others })
}

/// Read server name, application id and epoch. All three or none.
pub(crate) fn read_service_data(log: &str, record: &LogRecord) -> Result<ServiceData, LogError> {
    let server = record.latest(kinds::SERVER_DATA);
    let appl = record.latest(kinds::APPLID_DATA);
    let epoch = record.latest(kinds::EPOCH_DATA);

    match (server, appl, epoch) {
        (Some(server), Some(appl), Some(epoch)) => Ok(ServiceData {
            server_name: decode(server).map_err(|e| corrupt(log, "server name", e))?,
            appl_id: decode(appl).map_err(|e| corrupt(log, "application id", e))?,
            epoch: decode(epoch).map_err(|e| corrupt(log, "epoch", e))?,
        }),
        _ => Err(LogError::Corrupted(format!(
            "{}: partial service data in record {}",
            log, record.id
        ))),
    }
}

pub(crate) fn corrupt(log: &str, what: &str, e: LogError) -> LogError {
    LogError::Corrupted(format!("{}: undecodable {}: {}", log, what, e))
}
