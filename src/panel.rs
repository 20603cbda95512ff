//! Insight panel controller.
//!
//! Drives one "Analyze dashboard" click end to end:
//! governor check -> record -> capture -> model call -> status.
//!
//! Screenshot capture and the model API are host concerns. They reach this
//! module through the [`DashboardCapture`] and [`VisionModel`] traits, so the
//! controller owns only the decision logic and the UI state flags.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Instrument;

use crate::config::PanelOptions;
use crate::error_classification::{classify_error, FailureKind};
use crate::governor::CallGovernor;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// A screenshot of the dashboard, as produced by the host capture library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl CapturedImage {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            data,
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URL (canvas `toDataURL` output).
    pub fn from_data_url(url: &str) -> Result<Self, String> {
        let rest = url
            .strip_prefix("data:")
            .ok_or("Screenshot is not a data URL")?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or("Screenshot data URL has no payload")?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or("Screenshot data URL is not base64-encoded")?;
        if !mime_type.starts_with("image/") {
            return Err(format!("Screenshot has unsupported type \"{mime_type}\""));
        }
        let data = STANDARD
            .decode(payload.trim())
            .map_err(|e| format!("Screenshot payload is not valid base64: {e}"))?;
        if data.is_empty() {
            return Err("Screenshot is empty".into());
        }
        Ok(Self {
            mime_type: mime_type.to_string(),
            data,
        })
    }

    /// Bare base64 payload, the form multimodal APIs take for inline images.
    pub fn base64_payload(&self) -> String {
        STANDARD.encode(&self.data)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_payload())
    }
}

/// Everything the model client needs for one call.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub model: String,
    pub prompt: String,
    pub image: CapturedImage,
}

/// Captures the host dashboard.
pub trait DashboardCapture {
    fn capture(&self) -> impl Future<Output = Result<CapturedImage, String>> + Send;
}

/// Sends a screenshot and prompt to a multimodal model and returns its
/// markdown answer.
pub trait VisionModel {
    fn describe(
        &self,
        request: AnalysisRequest,
    ) -> impl Future<Output = Result<String, String>> + Send;
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// UI state of the panel, serialized for the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PanelStatus {
    Idle,
    /// An analysis is in flight; the button is disabled
    Busy,
    RateLimited { wait_ms: u64, message: String },
    /// Markdown returned by the model
    Ready { text: String },
    Failed { kind: FailureKind, message: String },
}

/// Human-readable wait estimate, rounded up to whole seconds.
pub fn rate_limit_message(wait_ms: u64) -> String {
    let secs = wait_ms.div_ceil(1000).max(1);
    let unit = if secs == 1 { "second" } else { "seconds" };
    format!("Rate limit reached. Try again in {secs} {unit}.")
}

const DISABLED_MESSAGE: &str = "Analysis is disabled: the call budget is 0 per minute.";

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct PanelInner {
    options: PanelOptions,
    governor: CallGovernor,
    status: PanelStatus,
}

/// One panel instance: its options, its governor and its status.
pub struct InsightPanel {
    inner: Mutex<PanelInner>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag on every exit path, including when the
/// `analyze` future is dropped mid-call.
struct InFlightGuard<'a> {
    panel: &'a InsightPanel,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(panel: &'a InsightPanel) -> Option<Self> {
        panel
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { panel })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut inner = self.panel.inner.lock();
            // Only reached with Busy when the call was cancelled
            if inner.status == PanelStatus::Busy {
                inner.status = PanelStatus::Idle;
            }
        }
        self.panel.in_flight.store(false, Ordering::Release);
    }
}

impl InsightPanel {
    /// Build a panel whose governor window starts at `now_ms`.
    pub fn new(options: PanelOptions, now_ms: i64) -> Result<Self, String> {
        options.validate()?;
        let governor = CallGovernor::new(options.max_calls_per_minute, options.min_interval_ms, now_ms);
        Ok(Self {
            inner: Mutex::new(PanelInner {
                options,
                governor,
                status: PanelStatus::Idle,
            }),
            in_flight: AtomicBool::new(false),
        })
    }

    /// Apply edited options.
    ///
    /// A change to either rate limit replaces the governor with a fresh one
    /// (new window, no history). Other edits keep the current governor.
    pub fn apply_options(&self, options: PanelOptions, now_ms: i64) -> Result<(), String> {
        options.validate()?;
        let mut inner = self.inner.lock();
        if !inner
            .governor
            .has_limits(options.max_calls_per_minute, options.min_interval_ms)
        {
            tracing::info!(
                max_calls_per_minute = options.max_calls_per_minute,
                min_interval_ms = options.min_interval_ms,
                "rate limits changed, replacing call governor"
            );
            inner.governor =
                CallGovernor::new(options.max_calls_per_minute, options.min_interval_ms, now_ms);
        }
        inner.options = options;
        Ok(())
    }

    pub fn options(&self) -> PanelOptions {
        self.inner.lock().options.clone()
    }

    pub fn status(&self) -> PanelStatus {
        self.inner.lock().status.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Copy of the governor state, for display and diagnostics.
    pub fn governor(&self) -> CallGovernor {
        self.inner.lock().governor.clone()
    }

    /// Whether the analyze button should be enabled at `now_ms`.
    /// May roll the governor window over.
    pub fn can_analyze(&self, now_ms: i64) -> bool {
        !self.is_in_flight() && self.inner.lock().governor.can_call(now_ms)
    }

    /// Wait estimate for the UI, `None` when a call would be admitted now.
    pub fn wait_hint(&self, now_ms: i64) -> Option<String> {
        let inner = self.inner.lock();
        if inner.governor.max_calls_per_window() == 0 {
            return Some(DISABLED_MESSAGE.to_string());
        }
        match inner.governor.time_until_next_call_ms(now_ms) {
            0 => None,
            wait_ms => Some(rate_limit_message(wait_ms)),
        }
    }

    /// Run one analysis. Returns the resulting status, which is also stored.
    ///
    /// A second click while a call is in flight returns `Busy` and does not
    /// touch the governor. Once admitted, the call counts against the limits
    /// whether it succeeds, fails, times out or is cancelled.
    pub async fn analyze<C, M>(&self, capture: &C, model: &M, now_ms: i64) -> PanelStatus
    where
        C: DashboardCapture + Sync,
        M: VisionModel + Sync,
    {
        let Some(_guard) = InFlightGuard::acquire(self) else {
            tracing::debug!("analysis already in flight");
            return PanelStatus::Busy;
        };

        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("analyze", %request_id);
        self.run_admitted(capture, model, now_ms).instrument(span).await
    }

    async fn run_admitted<C, M>(&self, capture: &C, model: &M, now_ms: i64) -> PanelStatus
    where
        C: DashboardCapture + Sync,
        M: VisionModel + Sync,
    {
        let (model_name, prompt, timeout_secs) = {
            let mut inner = self.inner.lock();
            if !inner.governor.can_call(now_ms) {
                let wait_ms = inner.governor.time_until_next_call_ms(now_ms);
                let message = if inner.governor.max_calls_per_window() == 0 {
                    DISABLED_MESSAGE.to_string()
                } else {
                    rate_limit_message(wait_ms)
                };
                tracing::info!(wait_ms, "analysis blocked by call governor");
                let status = PanelStatus::RateLimited { wait_ms, message };
                inner.status = status.clone();
                return status;
            }
            inner.governor.record_call(now_ms);
            inner.status = PanelStatus::Busy;
            (
                inner.options.model.clone(),
                inner.options.prompt.clone(),
                inner.options.request_timeout_secs,
            )
        };

        let outcome = match capture.capture().await {
            Ok(image) => {
                tracing::debug!(bytes = image.data.len(), mime = %image.mime_type, "dashboard captured");
                let request = AnalysisRequest {
                    model: model_name,
                    prompt,
                    image,
                };
                call_with_timeout(model.describe(request), timeout_secs).await
            }
            Err(e) => Err(format!("Dashboard capture failed: {e}")),
        };

        let status = match outcome {
            Ok(text) if text.trim().is_empty() => PanelStatus::Failed {
                kind: FailureKind::Unknown,
                message: "The model returned an empty response".to_string(),
            },
            Ok(text) => {
                tracing::info!(chars = text.len(), "analysis complete");
                PanelStatus::Ready { text }
            }
            Err(message) => {
                let kind = classify_error(&message);
                tracing::warn!(?kind, error = %message, "analysis failed");
                PanelStatus::Failed {
                    kind,
                    message: format!("{}: {message}", kind.label()),
                }
            }
        };

        self.inner.lock().status = status.clone();
        status
    }
}

async fn call_with_timeout<F>(call: F, timeout_secs: u64) -> Result<String, String>
where
    F: Future<Output = Result<String, String>>,
{
    if timeout_secs == 0 {
        return call.await;
    }
    match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
        Ok(result) => result,
        Err(_) => Err(format!("Model call timed out after {timeout_secs}s")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct OkCapture;

    impl DashboardCapture for OkCapture {
        fn capture(&self) -> impl Future<Output = Result<CapturedImage, String>> + Send {
            async { Ok(CapturedImage::png(vec![0x89, b'P', b'N', b'G'])) }
        }
    }

    struct FailingCapture;

    impl DashboardCapture for FailingCapture {
        fn capture(&self) -> impl Future<Output = Result<CapturedImage, String>> + Send {
            async { Err("canvas is tainted".to_string()) }
        }
    }

    /// Replies with a fixed result and counts calls.
    struct ScriptedModel {
        reply: Result<String, String>,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
    }

    impl ScriptedModel {
        fn ok(text: &str) -> Self {
            Self::with(Ok(text.to_string()))
        }

        fn err(message: &str) -> Self {
            Self::with(Err(message.to_string()))
        }

        fn with(reply: Result<String, String>) -> Self {
            Self {
                reply,
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            }
        }
    }

    impl VisionModel for ScriptedModel {
        fn describe(
            &self,
            request: AnalysisRequest,
        ) -> impl Future<Output = Result<String, String>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock() = Some(request.prompt.clone());
            let reply = self.reply.clone();
            async move { reply }
        }
    }

    /// Never answers until the gate is opened.
    struct GatedModel {
        gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    }

    impl VisionModel for GatedModel {
        fn describe(
            &self,
            _request: AnalysisRequest,
        ) -> impl Future<Output = Result<String, String>> + Send {
            let gate = self.gate.lock().take();
            async move {
                if let Some(rx) = gate {
                    let _ = rx.await;
                }
                Ok("## Summary\nAll green.".to_string())
            }
        }
    }

    struct SlowModel;

    impl VisionModel for SlowModel {
        fn describe(
            &self,
            _request: AnalysisRequest,
        ) -> impl Future<Output = Result<String, String>> + Send {
            async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok("too late".to_string())
            }
        }
    }

    fn panel(max: u32, interval_ms: u64) -> InsightPanel {
        let options = PanelOptions {
            max_calls_per_minute: max,
            min_interval_ms: interval_ms,
            ..PanelOptions::default()
        };
        InsightPanel::new(options, 0).unwrap()
    }

    #[tokio::test]
    async fn successful_analysis_renders_text() {
        let p = panel(10, 2_000);
        let model = ScriptedModel::ok("CPU is spiking on node-3.");
        let status = p.analyze(&OkCapture, &model, 0).await;

        assert_eq!(
            status,
            PanelStatus::Ready {
                text: "CPU is spiking on node-3.".into()
            }
        );
        assert_eq!(p.status(), status);
        assert_eq!(p.governor().window_count(), 1);
        assert!(!p.is_in_flight());
        assert_eq!(
            model.last_prompt.lock().as_deref(),
            Some(PanelOptions::default().prompt.as_str())
        );
    }

    #[tokio::test]
    async fn click_inside_spacing_is_rate_limited() {
        let p = panel(10, 2_000);
        let model = ScriptedModel::ok("ok");
        p.analyze(&OkCapture, &model, 0).await;

        let status = p.analyze(&OkCapture, &model, 1_000).await;
        assert_eq!(
            status,
            PanelStatus::RateLimited {
                wait_ms: 1_000,
                message: "Rate limit reached. Try again in 1 second.".into()
            }
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.governor().window_count(), 1);

        assert!(matches!(
            p.analyze(&OkCapture, &model, 2_000).await,
            PanelStatus::Ready { .. }
        ));
    }

    #[tokio::test]
    async fn failed_model_call_still_consumes_quota() {
        let p = panel(1, 0);
        let model = ScriptedModel::err("429 Too Many Requests");

        let status = p.analyze(&OkCapture, &model, 0).await;
        match status {
            PanelStatus::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::RateLimit);
                assert!(message.contains("429"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        assert!(matches!(
            p.analyze(&OkCapture, &model, 10).await,
            PanelStatus::RateLimited { .. }
        ));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capture_failure_skips_model_but_counts() {
        let p = panel(10, 0);
        let model = ScriptedModel::ok("unused");
        let status = p.analyze(&FailingCapture, &model, 0).await;

        match status {
            PanelStatus::Failed { message, .. } => assert!(message.contains("canvas is tainted")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(p.governor().window_count(), 1);
    }

    #[tokio::test]
    async fn empty_model_reply_is_a_failure() {
        let p = panel(10, 0);
        let status = p.analyze(&OkCapture, &ScriptedModel::ok("  \n"), 0).await;
        assert!(matches!(
            status,
            PanelStatus::Failed {
                kind: FailureKind::Unknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn second_click_while_in_flight_is_busy() {
        let p = Arc::new(panel(10, 0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let gated = GatedModel {
            gate: Mutex::new(Some(rx)),
        };

        let first = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.analyze(&OkCapture, &gated, 0).await })
        };
        while !p.is_in_flight() {
            tokio::task::yield_now().await;
        }

        assert_eq!(p.status(), PanelStatus::Busy);
        assert!(!p.can_analyze(5));
        let model = ScriptedModel::ok("second");
        assert_eq!(p.analyze(&OkCapture, &model, 5).await, PanelStatus::Busy);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(p.governor().window_count(), 1);

        tx.send(()).unwrap();
        let status = first.await.unwrap();
        assert!(matches!(status, PanelStatus::Ready { .. }));
        assert!(!p.is_in_flight());
        assert!(p.can_analyze(10));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out() {
        let options = PanelOptions {
            request_timeout_secs: 5,
            ..PanelOptions::default()
        };
        let p = InsightPanel::new(options, 0).unwrap();
        let status = p.analyze(&OkCapture, &SlowModel, 0).await;

        match status {
            PanelStatus::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Network);
                assert!(message.contains("timed out after 5s"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(p.governor().window_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_analysis_releases_guard_and_keeps_count() {
        let options = PanelOptions {
            request_timeout_secs: 0,
            ..PanelOptions::default()
        };
        let p = InsightPanel::new(options, 0).unwrap();

        let outer =
            tokio::time::timeout(Duration::from_millis(50), p.analyze(&OkCapture, &SlowModel, 0))
                .await;
        assert!(outer.is_err());

        assert!(!p.is_in_flight());
        assert_eq!(p.status(), PanelStatus::Idle);
        assert_eq!(p.governor().window_count(), 1);
    }

    #[tokio::test]
    async fn zero_budget_reports_disabled() {
        let p = panel(0, 0);
        let model = ScriptedModel::ok("unused");
        match p.analyze(&OkCapture, &model, 0).await {
            PanelStatus::RateLimited { message, .. } => assert_eq!(message, DISABLED_MESSAGE),
            other => panic!("expected rate limited, got {other:?}"),
        }
        assert_eq!(p.wait_hint(120_000).as_deref(), Some(DISABLED_MESSAGE));
        assert!(!p.can_analyze(120_000));
    }

    #[tokio::test]
    async fn changing_limits_replaces_governor() {
        let p = panel(1, 0);
        let model = ScriptedModel::ok("ok");
        p.analyze(&OkCapture, &model, 0).await;
        assert!(!p.can_analyze(100));

        let loosened = PanelOptions {
            max_calls_per_minute: 5,
            ..p.options()
        };
        p.apply_options(loosened, 200).unwrap();

        let g = p.governor();
        assert_eq!(g.window_count(), 0);
        assert_eq!(g.window_start_ms(), 200);
        assert_eq!(g.last_call_at_ms(), None);
        assert!(p.can_analyze(200));
    }

    #[tokio::test]
    async fn prompt_only_change_keeps_history() {
        let p = panel(1, 0);
        p.analyze(&OkCapture, &ScriptedModel::ok("ok"), 0).await;

        let reworded = PanelOptions {
            prompt: "List failing services only.".into(),
            ..p.options()
        };
        p.apply_options(reworded, 100).unwrap();

        assert_eq!(p.governor().window_count(), 1);
        assert!(!p.can_analyze(100));
        assert_eq!(p.options().prompt, "List failing services only.");
    }

    #[test]
    fn invalid_options_are_rejected() {
        let bad = PanelOptions {
            model: String::new(),
            ..PanelOptions::default()
        };
        assert!(InsightPanel::new(bad.clone(), 0).is_err());

        let p = panel(10, 0);
        assert!(p.apply_options(bad, 0).is_err());
        assert_eq!(p.options().model, PanelOptions::default().model);
    }

    #[test]
    fn wait_hint_rounds_up_to_seconds() {
        let p = panel(10, 2_500);
        {
            let mut inner = p.inner.lock();
            inner.governor.record_call(0);
        }
        assert_eq!(
            p.wait_hint(1),
            Some("Rate limit reached. Try again in 3 seconds.".into())
        );
        assert_eq!(
            p.wait_hint(2_000),
            Some("Rate limit reached. Try again in 1 second.".into())
        );
        assert_eq!(p.wait_hint(2_500), None);
    }

    #[test]
    fn rate_limit_message_never_says_zero() {
        assert_eq!(rate_limit_message(1), "Rate limit reached. Try again in 1 second.");
        assert_eq!(rate_limit_message(59_001), "Rate limit reached. Try again in 60 seconds.");
    }

    #[test]
    fn data_url_parses_and_renders() {
        let img = CapturedImage::from_data_url("data:image/jpeg;base64,/9j/4AAQ").unwrap();
        assert_eq!(img.mime_type, "image/jpeg");
        assert_eq!(img.data, vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10]);
        assert_eq!(img.base64_payload(), "/9j/4AAQ");
        assert_eq!(img.to_data_url(), "data:image/jpeg;base64,/9j/4AAQ");
    }

    #[test]
    fn data_url_rejects_bad_input() {
        assert!(CapturedImage::from_data_url("/9j/4AAQ").is_err());
        assert!(CapturedImage::from_data_url("data:image/png;base64").is_err());
        assert!(CapturedImage::from_data_url("data:image/png,abc").is_err());
        assert!(CapturedImage::from_data_url("data:text/plain;base64,aGk=").is_err());
        assert!(CapturedImage::from_data_url("data:image/png;base64,***").is_err());
        assert!(CapturedImage::from_data_url("data:image/png;base64,").is_err());
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_value(PanelStatus::RateLimited {
            wait_ms: 1_500,
            message: "wait".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "rate_limited");
        assert_eq!(json["waitMs"], 1_500);

        let json = serde_json::to_value(PanelStatus::Idle).unwrap();
        assert_eq!(json["state"], "idle");
    }
}
