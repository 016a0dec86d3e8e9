use std::path::PathBuf;

use thiserror::Error;

use crate::types::AddressFamily;

/// Failures that abort a whole run before any probing starts.
///
/// Per-port and per-candidate problems never surface here; they are folded into
/// `PortProbeOutcome` and the failure counter.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to load candidate list {}: {source}", .path.display())]
    PoolLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("candidate pool is empty; check that the address list files contain entries")]
    EmptyPool,

    #[error("no candidates match the selected address families ({}); enable another family", families_label(.0))]
    FilteredOut(Vec<AddressFamily>),

    #[error("no ports enabled; enable at least one plain or secure port")]
    NoPorts,

    #[error("a run is already in progress; cancel it or wait for it to finish")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn families_label(families: &[AddressFamily]) -> String {
    if families.is_empty() {
        return "none".to_string();
    }
    families
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_out_names_families() {
        let e = RunError::FilteredOut(vec![AddressFamily::V6]);
        assert!(e.to_string().contains("ipv6"));
        let e = RunError::FilteredOut(Vec::new());
        assert!(e.to_string().contains("none"));
    }
}
