//! Stable Result/Record names derived from run identity.
//!
//! Names never come from a random generator: a retried create path after a
//! crash between archive and annotate lands on the same record.

use crate::run::Identity;

pub const RESULTS_SEGMENT: &str = "results";
pub const RECORDS_SEGMENT: &str = "records";
/// Wildcard result id accepted by `list_records` parents.
pub const ANY_RESULT: &str = "-";

pub fn result_name(namespace: &str, result_uid: &str) -> String {
    format!("{}/{}/{}", namespace, RESULTS_SEGMENT, result_uid)
}

pub fn record_name(result: &str, record_uid: &str) -> String {
    format!("{}/{}/{}", result, RECORDS_SEGMENT, record_uid)
}

/// `(result, record)` names for a run. Both depend only on namespace and
/// UID, so they never move when owner references change.
pub fn names_for(id: &Identity) -> (String, String) {
    let result = result_name(&id.namespace, &id.uid);
    let record = record_name(&result, &id.uid);
    (result, record)
}

/// Split `<ns>/results/<result>/records/<record>` into its three ids.
pub fn parse_record_name(name: &str) -> Option<(&str, &str, &str)> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        [ns, RESULTS_SEGMENT, result, RECORDS_SEGMENT, record]
            if !ns.is_empty() && !result.is_empty() && !record.is_empty() =>
        {
            Some((*ns, *result, *record))
        }
        _ => None,
    }
}

/// Split `<ns>/results/<result>` (result may be `-`).
pub fn parse_result_name(name: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        [ns, RESULTS_SEGMENT, result] if !ns.is_empty() && !result.is_empty() => Some((*ns, *result)),
        _ => None,
    }
}

/// Whether `record` lives under `parent` (a result name, possibly `<ns>/results/-`).
pub fn record_in_parent(record: &str, parent: &str) -> bool {
    match (parse_record_name(record), parse_result_name(parent)) {
        (Some((ns, result, _)), Some((pns, presult))) => ns == pns && (presult == ANY_RESULT || presult == result),
        _ => false,
    }
}
