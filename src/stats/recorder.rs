//! Per-target dispatch statistics.
//!
//! A recorder keeps lifetime totals plus a sliding window of recent
//! responses; snapshots derive window averages and rates at read time.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;

use crate::proxy::Hooks;

/// One observed dispatch
struct ResponseSample {
    latency: Duration,
    status: u16,
    at: Instant,
}

/// Point-in-time statistics for one target, as served over the API.
///
/// Durations are reported in milliseconds.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStats {
    /// Unix millis of the first recorded dispatch, 0 before any
    pub stat_start_ms: u64,
    pub total_request_count: u64,
    pub total_avg_response_time_ms: f64,
    pub window_duration_ms: u64,
    /// Average latency inside the window
    pub avg_response_time_ms: f64,
    /// Number of dispatches inside the window
    pub request_count: usize,
    /// Dispatches per second inside the window
    pub request_rate: f64,
    /// Fraction of window dispatches with status >= 400
    pub error_rate: f64,
}

struct RecorderInner {
    first_request: Option<SystemTime>,
    window: Vec<ResponseSample>,
    total_count: u64,
    /// Running average over all recorded dispatches
    total_avg: Duration,
    /// Dispatch start set by the pre-hook, consumed by the post-hook
    started: Option<Instant>,
}

/// Sliding-window statistics recorder for one target.
///
/// Doubles as the target's dispatch hooks: the pre-hook timestamps
/// dispatch start, the post-hook records latency and status. A transport
/// failure (post-hook sees no response) is recorded as a synthetic 502.
pub struct TargetRecorder {
    window_size: Duration,
    inner: Mutex<RecorderInner>,
}

impl TargetRecorder {
    pub fn new(window_size: Duration) -> Self {
        Self {
            window_size,
            inner: Mutex::new(RecorderInner {
                first_request: None,
                window: Vec::new(),
                total_count: 0,
                total_avg: Duration::ZERO,
                started: None,
            }),
        }
    }

    pub fn add_response(&self, latency: Duration, status: u16) {
        let mut inner = self.inner.lock();
        if inner.first_request.is_none() {
            inner.first_request = Some(SystemTime::now());
        }

        inner.total_count += 1;
        let count = inner.total_count as u32;
        inner.total_avg = (inner.total_avg * (count - 1) + latency) / count;

        let cutoff = self.window_size;
        inner.window.retain(|sample| sample.at.elapsed() < cutoff);
        inner.window.push(ResponseSample {
            latency,
            status,
            at: Instant::now(),
        });
    }

    pub fn snapshot(&self) -> TargetStats {
        let mut inner = self.inner.lock();
        let cutoff = self.window_size;
        inner.window.retain(|sample| sample.at.elapsed() < cutoff);

        let window = &inner.window;
        let avg = if window.is_empty() {
            Duration::ZERO
        } else {
            window.iter().map(|s| s.latency).sum::<Duration>() / window.len() as u32
        };
        let request_rate = match (window.first(), window.last()) {
            (Some(first), Some(last)) if last.at > first.at => {
                window.len() as f64 / (last.at - first.at).as_secs_f64()
            }
            _ => 0.0,
        };
        let error_rate = if window.is_empty() {
            0.0
        } else {
            window.iter().filter(|s| s.status >= 400).count() as f64 / window.len() as f64
        };

        TargetStats {
            stat_start_ms: inner
                .first_request
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            total_request_count: inner.total_count,
            total_avg_response_time_ms: inner.total_avg.as_secs_f64() * 1000.0,
            window_duration_ms: self.window_size.as_millis() as u64,
            avg_response_time_ms: avg.as_secs_f64() * 1000.0,
            request_count: window.len(),
            request_rate,
            error_rate,
        }
    }
}

impl Hooks for TargetRecorder {
    fn before_dispatch(&self, req: Request<Full<Bytes>>) -> Request<Full<Bytes>> {
        self.inner.lock().started = Some(Instant::now());
        req
    }

    fn after_dispatch(&self, res: Option<Response<Bytes>>) -> Option<Response<Bytes>> {
        let started = self.inner.lock().started.take();
        let latency = started.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
        let status = res
            .as_ref()
            .map(|r| r.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY.as_u16());
        self.add_response(latency, status);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_recorder_snapshot_is_zeroed() {
        let recorder = TargetRecorder::new(Duration::from_secs(60));
        let stats = recorder.snapshot();
        assert_eq!(stats.total_request_count, 0);
        assert_eq!(stats.request_count, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.request_rate, 0.0);
        assert_eq!(stats.stat_start_ms, 0);
    }

    #[test]
    fn test_window_counts_and_error_rate() {
        let recorder = TargetRecorder::new(Duration::from_secs(60));
        recorder.add_response(Duration::from_millis(100), 200);
        recorder.add_response(Duration::from_millis(300), 200);
        recorder.add_response(Duration::from_millis(200), 502);
        recorder.add_response(Duration::from_millis(200), 404);

        let stats = recorder.snapshot();
        assert_eq!(stats.total_request_count, 4);
        assert_eq!(stats.request_count, 4);
        assert_eq!(stats.error_rate, 0.5);
        assert_eq!(stats.avg_response_time_ms, 200.0);
        assert_eq!(stats.total_avg_response_time_ms, 200.0);
        assert!(stats.stat_start_ms > 0);
    }

    #[test]
    fn test_expired_samples_leave_the_window_but_not_the_totals() {
        let recorder = TargetRecorder::new(Duration::ZERO);
        recorder.add_response(Duration::from_millis(10), 200);
        std::thread::sleep(Duration::from_millis(5));

        let stats = recorder.snapshot();
        assert_eq!(stats.total_request_count, 1);
        assert_eq!(stats.request_count, 0);
    }

    #[test]
    fn test_transport_failure_records_synthetic_bad_gateway() {
        let recorder = TargetRecorder::new(Duration::from_secs(60));
        let req = Request::builder()
            .uri("https://example.com/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let req = recorder.before_dispatch(req);
        assert_eq!(req.uri(), "https://example.com/");
        assert!(recorder.after_dispatch(None).is_none());

        let stats = recorder.snapshot();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.error_rate, 1.0);
    }

    #[test]
    fn test_post_hook_returns_the_response_unchanged() {
        let recorder = TargetRecorder::new(Duration::from_secs(60));
        let res = Response::builder()
            .status(StatusCode::CREATED)
            .body(Bytes::from_static(b"made"))
            .unwrap();
        let returned = recorder.after_dispatch(Some(res)).unwrap();
        assert_eq!(returned.status(), StatusCode::CREATED);
        assert_eq!(returned.body().as_ref(), b"made");
        assert_eq!(recorder.snapshot().error_rate, 0.0);
    }
}
