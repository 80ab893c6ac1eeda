// JSON line output
//
// One line per delivered event set, and a final line when the session ends.
// Output errors are logged, never propagated into the event pump.

use jdwp_engine::{DisconnectCause, EventListener, EventSet};
use serde_json::json;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tracing::{error, warn};

pub struct JsonLinePrinter<W: Write + Send> {
    out: Mutex<W>,
    hold: bool,
}

impl<W: Write + Send> JsonLinePrinter<W> {
    /// With `hold`, sets are left suspended for someone else to resume
    pub fn new(out: W, hold: bool) -> Self {
        Self {
            out: Mutex::new(out),
            hold,
        }
    }

    fn write_line(&self, value: &serde_json::Value) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", value).and_then(|_| out.flush()) {
            error!("Failed to write output: {}", e);
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventListener for JsonLinePrinter<W> {
    fn event_set_complete(&self, set: &EventSet) {
        match serde_json::to_value(set.summary()) {
            Ok(value) => self.write_line(&value),
            Err(e) => error!("Failed to serialize event set {}: {}", set.sequence(), e),
        }

        // a listener may already have resumed it
        if !self.hold && !set.is_resumed() {
            if let Err(e) = set.resume() {
                warn!("Could not resume event set {}: {}", set.sequence(), e);
            }
        }
    }

    fn disconnected(&self, cause: &DisconnectCause) {
        self.write_line(&json!({ "disconnected": cause, "message": cause.to_string() }));
    }
}
