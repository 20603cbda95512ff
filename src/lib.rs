pub mod config;
pub mod error_classification;
pub mod governor;
pub mod logging;
pub mod panel;

pub use config::PanelOptions;
pub use error_classification::{classify_error, FailureKind};
pub use governor::CallGovernor;
pub use panel::{AnalysisRequest, CapturedImage, DashboardCapture, InsightPanel, PanelStatus, VisionModel};

/// Current wall-clock time in epoch milliseconds, the timestamp unit every
/// governor and panel operation takes.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
