//! Error reports: every failure turned into a diagnostic gets an id that is
//! both logged and handed to the other side.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReportId(String);

impl ReportId {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logs `error` under a fresh report id and returns the id.
pub fn report_error(error: &dyn std::error::Error) -> ReportId {
    let report = ReportId::generate();
    tracing::warn!(report = %report, error = %error, "capability failure");
    report
}
