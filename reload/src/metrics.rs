//! Reload outcome counters.

use metrics::counter;

pub(crate) const RELOAD_SUCCESS_METRIC: &str =
    "apiserver_encryption_config_controller_automatic_reload_success_total";
pub(crate) const RELOAD_FAILURE_METRIC: &str =
    "apiserver_encryption_config_controller_automatic_reload_failure_total";

pub(crate) fn record_reload_success(apiserver_id: &str) {
    counter!(RELOAD_SUCCESS_METRIC, "apiserver_id" => apiserver_id.to_string()).increment(1);
}

pub(crate) fn record_reload_failure(apiserver_id: &str) {
    counter!(RELOAD_FAILURE_METRIC, "apiserver_id" => apiserver_id.to_string()).increment(1);
}
