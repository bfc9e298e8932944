use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Process-wide counters rendered by `GET /metrics`.
pub struct RealtimeMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_frame_errors_total: Mutex<HashMap<String, u64>>,
    snapshot_saves_total: Mutex<HashMap<String, u64>>,
    snapshot_loads_total: Mutex<HashMap<String, u64>>,
    connection_evictions_total: Mutex<HashMap<String, u64>>,
    rate_limited_upgrades_total: AtomicU64,
    active_rooms: AtomicI64,
    active_connections: AtomicI64,
}

const SAVE_OUTCOMES: [&str; 2] = ["ok", "failed"];
const LOAD_OUTCOMES: [&str; 4] = ["ok", "missing", "failed", "corrupt"];
static GLOBAL_METRICS: OnceLock<RealtimeMetrics> = OnceLock::new();

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_frames_total: Mutex::new(HashMap::new()),
            ws_frame_errors_total: Mutex::new(HashMap::new()),
            snapshot_saves_total: Mutex::new(zeroed(&SAVE_OUTCOMES)),
            snapshot_loads_total: Mutex::new(zeroed(&LOAD_OUTCOMES)),
            connection_evictions_total: Mutex::new(HashMap::new()),
            rate_limited_upgrades_total: AtomicU64::new(0),
            active_rooms: AtomicI64::new(0),
            active_connections: AtomicI64::new(0),
        }
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

pub fn global() -> &'static RealtimeMetrics {
    GLOBAL_METRICS.get_or_init(RealtimeMetrics::default)
}

/// `route` is the matched route template; `None` for requests no route matched.
pub fn record_http_request(method: &str, route: Option<&str>, status_code: u16, latency_ms: u64) {
    global().record_http_request(method, route, status_code, latency_ms);
}

pub fn record_ws_frame(kind: &str, is_error: bool) {
    global().record_ws_frame(kind, is_error);
}

pub fn record_snapshot_save(ok: bool) {
    global().record_snapshot_save(ok);
}

pub fn record_snapshot_load(outcome: &str) {
    global().record_snapshot_load(outcome);
}

pub fn record_connection_eviction(reason: &str) {
    global().record_connection_eviction(reason);
}

pub fn increment_rate_limited_upgrades() {
    global().rate_limited_upgrades_total.fetch_add(1, Ordering::SeqCst);
}

pub fn adjust_active_rooms(delta: i64) {
    global().active_rooms.fetch_add(delta, Ordering::SeqCst);
}

pub fn adjust_active_connections(delta: i64) {
    global().active_connections.fetch_add(delta, Ordering::SeqCst);
}

impl RealtimeMetrics {
    pub fn record_http_request(
        &self,
        method: &str,
        route: Option<&str>,
        status_code: u16,
        latency_ms: u64,
    ) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(route).to_string(),
            method: normalize_method(method).to_string(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_frame(&self, kind: &str, is_error: bool) {
        let label = normalize_label(kind);
        increment_label_counter(&self.ws_frames_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_frame_errors_total, &label, 1);
        }
    }

    pub fn record_snapshot_save(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        increment_label_counter(&self.snapshot_saves_total, outcome, 1);
    }

    pub fn record_snapshot_load(&self, outcome: &str) {
        let normalized = normalize_label(outcome);
        let label = if LOAD_OUTCOMES.contains(&normalized.as_str()) { normalized } else { "unknown".into() };
        increment_label_counter(&self.snapshot_loads_total, &label, 1);
    }

    pub fn record_connection_eviction(&self, reason: &str) {
        increment_label_counter(&self.connection_evictions_total, &normalize_label(reason), 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP realtime_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE realtime_request_rate_total counter\n");
        append_counter_lines(&mut output, "realtime_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP realtime_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE realtime_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP realtime_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE realtime_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP realtime_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE realtime_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "realtime_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP realtime_ws_frames_total Total inbound websocket frames by type.\n");
        output.push_str("# TYPE realtime_ws_frames_total counter\n");
        append_label_counter_lines(&mut output, "realtime_ws_frames_total", "type", &self.ws_frames_total);

        output.push_str(
            "# HELP realtime_ws_frame_errors_total Rejected inbound websocket frames by type.\n",
        );
        output.push_str("# TYPE realtime_ws_frame_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_ws_frame_errors_total",
            "type",
            &self.ws_frame_errors_total,
        );

        output.push_str("# HELP realtime_snapshot_saves_total Snapshot save attempts by outcome.\n");
        output.push_str("# TYPE realtime_snapshot_saves_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_snapshot_saves_total",
            "outcome",
            &self.snapshot_saves_total,
        );

        output.push_str("# HELP realtime_snapshot_loads_total Snapshot loads by outcome.\n");
        output.push_str("# TYPE realtime_snapshot_loads_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_snapshot_loads_total",
            "outcome",
            &self.snapshot_loads_total,
        );

        output.push_str(
            "# HELP realtime_connection_evictions_total Connections closed by the server by reason.\n",
        );
        output.push_str("# TYPE realtime_connection_evictions_total counter\n");
        append_label_counter_lines(
            &mut output,
            "realtime_connection_evictions_total",
            "reason",
            &self.connection_evictions_total,
        );

        output.push_str(
            "# HELP realtime_rate_limited_upgrades_total Upgrades rejected by the rate limiter.\n",
        );
        output.push_str("# TYPE realtime_rate_limited_upgrades_total counter\n");
        output.push_str(&format!(
            "realtime_rate_limited_upgrades_total {}\n",
            self.rate_limited_upgrades_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP realtime_active_rooms Rooms currently held in memory.\n");
        output.push_str("# TYPE realtime_active_rooms gauge\n");
        output.push_str(&format!(
            "realtime_active_rooms {}\n",
            self.active_rooms.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP realtime_active_connections Open websocket connections.\n");
        output.push_str("# TYPE realtime_active_connections gauge\n");
        output.push_str(&format!(
            "realtime_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst).max(0)
        ));

        output
    }
}

const KNOWN_METHODS: [&str; 7] = ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Labels come from the router's own templates, never from the raw path.
fn normalize_endpoint(route: Option<&str>) -> &str {
    match route {
        Some("/ws/{*path}") => "/ws/{site_id}/{version}",
        Some(template) => template,
        None => "unmatched",
    }
}

fn normalize_method(method: &str) -> &'static str {
    KNOWN_METHODS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(method))
        .copied()
        .unwrap_or("OTHER")
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
