//! Commands module
//!
//! Operations exposed to the dashboard: diagnostics reads and the manual
//! connection controls.

pub mod diagnostics;

pub use diagnostics::{DiagnosticsReporter, DiagnosticsSnapshot, HostDiagnostics};
