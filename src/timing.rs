//! Page-timing recorder
//!
//! Tracks one state record per in-flight page visit. The marks form a
//! strict forward timeline (start -> first layout -> appear -> markers ->
//! end); anything arriving after the visit ended, or re-marking a
//! timestamp that is already set, is ignored. Durations are derived at
//! end time and never stored; the summary event is emitted on end and the
//! visit state discarded.

use crate::event_bus::TimingTap;
use crate::queue::EventEmitter;
use crate::types::{EventBody, PageTimingSummary, VisitMarker};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

struct VisitState {
    page_id: String,
    page_name: String,
    route: Option<String>,
    start_at: DateTime<Utc>,
    first_layout_at: Option<DateTime<Utc>>,
    appear_at: Option<DateTime<Utc>>,
    markers: Vec<VisitMarker>,
    is_cold_start: bool,
    is_push: Option<bool>,
    parent_page_id: Option<String>,
}

/// Records per-visit timing data and emits one summary event per
/// completed visit.
pub struct PageTimingRecorder {
    visits: Mutex<HashMap<String, VisitState>>,
    emitter: EventEmitter,
}

impl PageTimingRecorder {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            visits: Mutex::new(HashMap::new()),
            emitter,
        }
    }

    /// Number of visits currently open.
    pub fn open_visits(&self) -> usize {
        self.visits.lock().expect("visit lock").len()
    }

    fn duration_ms(from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> Option<i64> {
        to.map(|t| (t - from).num_milliseconds())
    }
}

#[allow(clippy::too_many_arguments)]
impl TimingTap for PageTimingRecorder {
    fn page_start(
        &self,
        visit_id: &str,
        page_id: &str,
        page_name: &str,
        route: Option<String>,
        is_cold_start: bool,
        is_push: Option<bool>,
        parent_page_id: Option<String>,
    ) {
        let mut visits = self.visits.lock().expect("visit lock");
        if visits.contains_key(visit_id) {
            warn!(visit_id, "Restarting an already-open visit");
        }
        visits.insert(
            visit_id.to_string(),
            VisitState {
                page_id: page_id.to_string(),
                page_name: page_name.to_string(),
                route,
                start_at: Utc::now(),
                first_layout_at: None,
                appear_at: None,
                markers: Vec::new(),
                is_cold_start,
                is_push,
                parent_page_id,
            },
        );
    }

    fn page_first_layout(&self, visit_id: &str) {
        let mut visits = self.visits.lock().expect("visit lock");
        if let Some(visit) = visits.get_mut(visit_id) {
            if visit.first_layout_at.is_none() {
                visit.first_layout_at = Some(Utc::now());
            }
        }
    }

    fn page_appear(&self, visit_id: &str) {
        let mut visits = self.visits.lock().expect("visit lock");
        if let Some(visit) = visits.get_mut(visit_id) {
            if visit.appear_at.is_none() {
                visit.appear_at = Some(Utc::now());
            }
        }
    }

    fn marker(&self, visit_id: &str, name: &str) {
        let mut visits = self.visits.lock().expect("visit lock");
        if let Some(visit) = visits.get_mut(visit_id) {
            visit.markers.push(VisitMarker {
                name: name.to_string(),
                at: Utc::now(),
            });
        }
    }

    fn page_end(&self, visit_id: &str) {
        let state = self.visits.lock().expect("visit lock").remove(visit_id);
        let Some(visit) = state else {
            // Closed already or never started; late calls are ignored
            debug!(visit_id, "page_end for unknown visit, ignoring");
            return;
        };

        let end_at = Utc::now();
        let summary = PageTimingSummary {
            visit_id: visit_id.to_string(),
            page_id: visit.page_id,
            page_name: visit.page_name,
            route: visit.route,
            start_at: visit.start_at,
            first_layout_at: visit.first_layout_at,
            appear_at: visit.appear_at,
            end_at: Some(end_at),
            markers: visit.markers,
            is_cold_start: visit.is_cold_start,
            is_push: visit.is_push,
            parent_page_id: visit.parent_page_id,
            load_duration_ms: Self::duration_ms(visit.start_at, visit.first_layout_at),
            appear_duration_ms: Self::duration_ms(visit.start_at, visit.appear_at),
            total_duration_ms: Self::duration_ms(visit.start_at, Some(end_at)),
        };
        self.emitter.emit(EventBody::PageTiming(summary));
    }
}
