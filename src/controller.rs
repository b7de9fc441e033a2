//! Owns the current selection and turns every change into a sequenced
//! recompute. Only the response to the most recently issued request is
//! ever applied.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::aggregate::AnalyticsEngine;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{
    AggregateSummary, CourseId, DailyView, EffectiveSelection, Granularity, Identity, MonthlyView,
    Scope, Selection, SelectionPatch, SessionTally, WeeklyView, YearMonth,
};
use crate::scope::ScopeResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub recompute_timeout: Duration,
    /// Abort the superseded task when a new request is issued.
    pub cancel_superseded: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recompute_timeout: Duration::from_secs(15),
            cancel_superseded: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", content = "rows", rename_all = "snake_case")]
pub enum Trend {
    Daily(DailyView),
    Sessions(Vec<SessionTally>),
    Weekly(WeeklyView),
    Monthly(MonthlyView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub selection: EffectiveSelection,
    pub summary: AggregateSummary,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Idle,
    Loading { seq: u64 },
    Ready { seq: u64, dashboard: Dashboard },
    Failed { seq: u64, error: AnalyticsError },
}

#[derive(Debug)]
pub struct Recompute {
    pub seq: u64,
    pub result: AnalyticsResult<Dashboard>,
}

pub struct SelectionController {
    identity: Identity,
    selection: Selection,
    resolver: Arc<ScopeResolver>,
    engine: Arc<AnalyticsEngine>,
    config: ControllerConfig,
    issued: u64,
    applied: u64,
    discarded: u64,
    state: ViewState,
    in_flight: Option<AbortHandle>,
    responses_tx: mpsc::UnboundedSender<Recompute>,
    responses_rx: mpsc::UnboundedReceiver<Recompute>,
}

impl SelectionController {
    pub fn new(
        identity: Identity,
        selection: Selection,
        resolver: Arc<ScopeResolver>,
        engine: Arc<AnalyticsEngine>,
        config: ControllerConfig,
    ) -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            selection,
            resolver,
            engine,
            config,
            issued: 0,
            applied: 0,
            discarded: 0,
            state: ViewState::Idle,
            in_flight: None,
            responses_tx,
            responses_rx,
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ViewState::Loading { .. })
    }

    pub fn latest_seq(&self) -> u64 {
        self.issued
    }

    /// Responses dropped because a newer request had been issued.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn set_courses<I>(&mut self, ids: I) -> u64
    where
        I: IntoIterator<Item = CourseId>,
    {
        self.set_selection(SelectionPatch {
            course_ids: Some(ids.into_iter().collect()),
            ..SelectionPatch::default()
        })
    }

    pub fn set_month(&mut self, month: YearMonth) -> u64 {
        self.set_selection(SelectionPatch {
            month: Some(month),
            ..SelectionPatch::default()
        })
    }

    pub fn set_granularity(&mut self, granularity: Granularity) -> u64 {
        self.set_selection(SelectionPatch {
            granularity: Some(granularity),
            ..SelectionPatch::default()
        })
    }

    pub fn set_selection(&mut self, patch: SelectionPatch) -> u64 {
        patch.apply_to(&mut self.selection);
        self.request()
    }

    /// Recompute the current selection unchanged, e.g. after a failure.
    pub fn refresh(&mut self) -> u64 {
        self.request()
    }

    fn request(&mut self) -> u64 {
        self.issued += 1;
        let seq = self.issued;

        if self.config.cancel_superseded {
            if let Some(previous) = self.in_flight.take() {
                previous.abort();
            }
        }

        let resolver = Arc::clone(&self.resolver);
        let engine = Arc::clone(&self.engine);
        let identity = self.identity.clone();
        let snapshot = self.selection.clone();
        let limit = self.config.recompute_timeout;
        let responses = self.responses_tx.clone();

        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(
                limit,
                recompute(&resolver, &engine, &identity, &snapshot),
            )
            .await
            .unwrap_or(Err(AnalyticsError::Timeout(limit)));
            let _ = responses.send(Recompute { seq, result });
        });

        self.in_flight = Some(task.abort_handle());
        self.state = ViewState::Loading { seq };
        debug!(seq, courses = self.selection.course_ids.len(), "issued recompute");
        seq
    }

    /// Apply `response` if it answers the latest request; returns whether it did.
    pub fn apply(&mut self, response: Recompute) -> bool {
        let seq = response.seq;
        if seq != self.issued || seq <= self.applied {
            self.discarded += 1;
            debug!(seq, latest = self.issued, "discarding stale recompute");
            return false;
        }

        self.applied = seq;
        self.in_flight = None;
        self.state = match response.result {
            Ok(dashboard) => ViewState::Ready { seq, dashboard },
            Err(error) => {
                warn!(seq, %error, recoverable = error.is_recoverable(), "recompute failed");
                ViewState::Failed { seq, error }
            }
        };
        true
    }

    /// Apply whatever responses have already arrived without waiting.
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(response) = self.responses_rx.try_recv() {
            if self.apply(response) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait until the latest request has been answered.
    pub async fn settle(&mut self) -> &ViewState {
        // The task enforces the timeout itself; this bound only matters if it died.
        let grace = self.config.recompute_timeout + Duration::from_secs(1);

        while let ViewState::Loading { seq } = self.state {
            match tokio::time::timeout(grace, self.responses_rx.recv()).await {
                Ok(Some(response)) => {
                    self.apply(response);
                }
                Ok(None) | Err(_) => {
                    warn!(seq, "recompute task vanished without answering");
                    if let Some(task) = self.in_flight.take() {
                        task.abort();
                    }
                    self.applied = seq;
                    self.state = ViewState::Failed {
                        seq,
                        error: AnalyticsError::Timeout(self.config.recompute_timeout),
                    };
                }
            }
        }
        &self.state
    }
}

impl Drop for SelectionController {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

async fn recompute(
    resolver: &ScopeResolver,
    engine: &AnalyticsEngine,
    identity: &Identity,
    selection: &Selection,
) -> AnalyticsResult<Dashboard> {
    let effective = resolver.resolve(identity, selection).await?;
    let summary = engine.compute_summary(&effective.scope).await?;

    let trend = match effective.granularity {
        Granularity::Daily => match &effective.scope {
            Scope::Student { student_id, .. } => Trend::Daily(
                engine
                    .compute_daily(student_id, Some(effective.month.date_range()))
                    .await?,
            ),
            Scope::Courses { .. } => Trend::Sessions(
                engine
                    .compute_session_tallies(&effective.scope, effective.month)
                    .await?,
            ),
        },
        Granularity::Weekly => Trend::Weekly(engine.compute_weekly(&effective.scope).await?),
        Granularity::Monthly => Trend::Monthly(
            engine
                .compute_monthly(&effective.scope, effective.month)
                .await?,
        ),
    };

    Ok(Dashboard {
        selection: effective,
        summary,
        trend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ids, MemoryStore};
    use crate::models::AttendanceStatus::{Absent, Present};
    use crate::models::Role;
    use crate::retry::RetryPolicy;
    use crate::store::Backend;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .course("c1", "Algebra")
            .course("c2", "Biology")
            .student("s1", "c1")
            .student("s2", "c2")
            .student("s3", "c2")
            .mark("s1", "c1", "2024-05-01", Present)
            .mark("s1", "c1", "2024-05-02", Absent)
            .mark("s2", "c2", "2024-05-01", Present)
            .mark("s3", "c2", "2024-05-01", Present)
            .mark("s2", "c2", "2024-05-08", Absent)
            .assign("t1", "c1")
    }

    fn controller(
        store: MemoryStore,
        identity: Identity,
        config: ControllerConfig,
    ) -> (SelectionController, Arc<AnalyticsEngine>) {
        let backend: Arc<dyn Backend> = Arc::new(store);
        let resolver = Arc::new(ScopeResolver::new(backend.clone(), RetryPolicy::default()));
        let engine = Arc::new(AnalyticsEngine::new(backend, RetryPolicy::default()));
        let selection = Selection::new("2024-05".parse().unwrap());
        let controller =
            SelectionController::new(identity, selection, resolver, engine.clone(), config);
        (controller, engine)
    }

    fn admin() -> Identity {
        Identity::new("a1", Role::Admin)
    }

    fn keep_superseded() -> ControllerConfig {
        ControllerConfig {
            cancel_superseded: false,
            ..ControllerConfig::default()
        }
    }

    fn ready(state: &ViewState) -> &Dashboard {
        match state {
            ViewState::Ready { dashboard, .. } => dashboard,
            other => panic!("expected ready state, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_superseded_response_is_discarded() {
        let store = store()
            .delay_queries(&["c1"], Duration::from_secs(5))
            .delay_queries(&["c2"], Duration::from_secs(1));
        let (mut controller, engine) = controller(store, admin(), keep_superseded());

        controller.set_courses(ids(&["c1"]));
        let latest = controller.set_courses(ids(&["c2"]));
        let applied = ready(controller.settle().await).clone();

        let expected = engine
            .compute_summary(&Scope::courses(ids(&["c2"])))
            .await
            .unwrap();
        assert_eq!(applied.summary, expected);
        assert_eq!(controller.state(), &ViewState::Ready { seq: latest, dashboard: applied.clone() });

        // Let the slow response for c1 arrive after the fact.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(controller.drain_pending(), 0);
        assert_eq!(controller.discarded(), 1);
        assert_eq!(ready(controller.state()).summary, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn early_stale_response_is_discarded() {
        let store = store().delay_queries(&["c2"], Duration::from_secs(3));
        let (mut controller, engine) = controller(store, admin(), keep_superseded());

        controller.set_courses(ids(&["c1"]));
        controller.set_courses(ids(&["c2"]));
        let applied = ready(controller.settle().await).summary.clone();

        let expected = engine
            .compute_summary(&Scope::courses(ids(&["c2"])))
            .await
            .unwrap();
        assert_eq!(applied, expected);
        assert_eq!(controller.discarded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_task_is_cancelled_when_enabled() {
        let store = store().delay_queries(&["c1"], Duration::from_secs(5));
        let (mut controller, _) = controller(store, admin(), ControllerConfig::default());

        controller.set_courses(ids(&["c1"]));
        controller.set_courses(ids(&["c2"]));
        controller.settle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(controller.drain_pending(), 0);
        assert_eq!(controller.discarded(), 0);
        assert_eq!(
            ready(controller.state()).selection.scope,
            Scope::courses(ids(&["c2"]))
        );
    }

    #[test]
    fn out_of_order_responses_follow_sequence_rule() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _entered = runtime.enter();
        let (mut controller, _) = controller(store(), admin(), keep_superseded());
        let first = controller.set_courses(ids(&["c1"]));
        let second = controller.set_courses(ids(&["c2"]));

        let failure = |seq| Recompute {
            seq,
            result: Err(AnalyticsError::TransientFetch("late".into())),
        };
        assert!(!controller.apply(failure(first)));
        assert!(controller.apply(failure(second)));
        assert!(!controller.apply(failure(second)));
        assert!(!controller.apply(failure(first)));
        assert_eq!(controller.discarded(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_recoverable_error_and_keeps_working() {
        let store = store().delay_queries(&["c1"], Duration::from_secs(20));
        let (mut controller, _) = controller(store, admin(), ControllerConfig::default());

        controller.set_courses(ids(&["c1"]));
        match controller.settle().await {
            ViewState::Failed { error, .. } => {
                assert_eq!(*error, AnalyticsError::Timeout(Duration::from_secs(15)));
                assert!(error.is_recoverable());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!controller.is_loading());

        controller.set_courses(ids(&["c2"]));
        assert_eq!(ready(controller.settle().await).summary.total_students, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_task_is_aborted_when_settle_gives_up() {
        let (mut controller, _) = controller(store(), admin(), ControllerConfig::default());
        let silent = tokio::spawn(std::future::pending::<()>());
        controller.issued = 1;
        controller.in_flight = Some(silent.abort_handle());
        controller.state = ViewState::Loading { seq: 1 };

        match controller.settle().await {
            ViewState::Failed { seq, error } => {
                assert_eq!(*seq, 1);
                assert_eq!(*error, AnalyticsError::Timeout(Duration::from_secs(15)));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(controller.in_flight.is_none());
        assert!(silent.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn unauthorized_teacher_selection_fails_terminally() {
        let (mut controller, _) =
            controller(store(), Identity::new("t1", Role::Teacher), ControllerConfig::default());

        controller.set_courses(ids(&["c2"]));
        match controller.settle().await {
            ViewState::Failed { error, .. } => {
                assert!(matches!(error, AnalyticsError::Authorization(_)));
                assert!(!error.is_recoverable());
            }
            other => panic!("expected authorization failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_selection_yields_empty_summary() {
        let (mut controller, _) = controller(store(), admin(), ControllerConfig::default());

        controller.set_courses(Vec::new());
        let dashboard = ready(controller.settle().await);

        assert_eq!(dashboard.summary, AggregateSummary::empty());
        assert_eq!(dashboard.trend, Trend::Sessions(Vec::new()));
    }

    #[tokio::test]
    async fn granularity_selects_the_trend_view() {
        let (mut controller, _) = controller(store(), admin(), ControllerConfig::default());

        controller.set_courses(ids(&["c2"]));
        controller.set_granularity(Granularity::Weekly);
        match &ready(controller.settle().await).trend {
            Trend::Weekly(weeks) => {
                let labels: Vec<&str> = weeks.iter().map(|w| w.week_label.as_str()).collect();
                assert_eq!(labels, vec!["2024-W18", "2024-W19"]);
                assert_eq!(weeks[0].percentage, 100.0);
                assert_eq!(weeks[1].percentage, 0.0);
            }
            other => panic!("expected weekly trend, got {other:?}"),
        }

        controller.set_granularity(Granularity::Monthly);
        assert_eq!(
            ready(controller.settle().await).trend,
            Trend::Monthly(MonthlyView { present: 2, absent: 1 })
        );
    }

    #[tokio::test]
    async fn student_daily_view_uses_own_log() {
        let (mut controller, _) =
            controller(store(), Identity::new("s1", Role::Student), ControllerConfig::default());

        controller.set_selection(SelectionPatch {
            course_ids: Some(ids(&["c2"])),
            granularity: Some(Granularity::Daily),
            ..SelectionPatch::default()
        });
        let dashboard = ready(controller.settle().await);

        match &dashboard.trend {
            Trend::Daily(rows) => assert_eq!(rows.len(), 2),
            other => panic!("expected daily log, got {other:?}"),
        }
        assert_eq!(dashboard.summary.total_students, 1);
        assert_eq!(dashboard.summary.per_course[0].attendance_percentage, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_then_refresh_recovers() {
        let (mut controller, _) =
            controller(store().fail_queries(3), admin(), ControllerConfig::default());

        controller.set_courses(ids(&["c1"]));
        match controller.settle().await {
            ViewState::Failed { error, .. } => assert!(error.is_retryable()),
            other => panic!("expected transient failure, got {other:?}"),
        }

        controller.refresh();
        assert_eq!(ready(controller.settle().await).summary.overall_percentage, 50.0);
    }
}
