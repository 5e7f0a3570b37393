//! Tracing Logger Adapter
//!
//! Forwards engine diagnostics to `tracing`.

use crate::ports::outbound::PortalLogger;
use std::fmt;
use tracing::{error, info, warn};

/// `PortalLogger` backed by the global tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl PortalLogger for TracingLogger {
    fn infof(&self, args: fmt::Arguments<'_>) {
        info!(target: "qc_15_portal", "{}", args);
    }

    fn warnf(&self, args: fmt::Arguments<'_>) {
        warn!(target: "qc_15_portal", "{}", args);
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        error!(target: "qc_15_portal", "{}", args);
    }
}
