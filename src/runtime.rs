use std::any::Any;
use std::fmt::Display;
use std::sync::LazyLock;

use prometheus::IntCounter;
use tracing::*;

pub(crate) static HANDLED_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synctarget_export_controller_handled_errors_total",
        "errors reported to the process-wide error sink",
    )
    .expect("valid metric definition")
});

/// Reports an error that cannot be returned to a caller, eg one raised while routing a watch event.
/// The error is logged and counted; processing continues.
pub fn handle_error(err: impl Display) {
    HANDLED_ERRORS.inc();
    error!("{err}");
}

/// Number of errors reported through [`handle_error`] since process start
pub fn handled_errors() -> u64 {
    HANDLED_ERRORS.get()
}

/// Extracts a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
