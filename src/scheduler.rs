use crate::error::FetchError;
use crate::filter::{self, FilterCriteria};
use crate::model::{
    ErrorRecord, ErrorSource, MAX_REFRESH_INTERVAL_SECS, MIN_REFRESH_INTERVAL_SECS, Operation,
    RefreshState, Snapshot,
};
use crate::selection::{Reconciliation, SelectionLedger};
use crate::sort::SortIndex;
use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FetchReason {
    Timer,
    Manual,
    Queued,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FetchTicket {
    pub generation: u64,
    pub reason: FetchReason,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ManualRefresh {
    Started(FetchTicket),
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub published: bool,
    pub reconciliation: Option<Reconciliation>,
    pub follow_up: Option<FetchTicket>,
    pub error: Option<ErrorRecord>,
}

#[derive(Debug)]
pub struct RefreshScheduler {
    state: RefreshState,
    next_due: Instant,
    queued: bool,
    generation: u64,
    in_flight: Option<u64>,
    raw: Arc<Vec<Operation>>,
    snapshot: Arc<Snapshot>,
}

impl RefreshScheduler {
    pub fn new(interval_secs: u64, now: Instant) -> Self {
        Self {
            state: RefreshState::new(interval_secs),
            next_due: now,
            queued: false,
            generation: 0,
            in_flight: None,
            raw: Arc::new(Vec::new()),
            snapshot: Arc::new(Snapshot::default()),
        }
    }

    pub fn state(&self) -> &RefreshState {
        &self.state
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn has_queued_refresh(&self) -> bool {
        self.queued
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state.paused || self.in_flight.is_some() {
            None
        } else {
            Some(self.next_due)
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> Option<FetchTicket> {
        if self.state.paused || self.in_flight.is_some() || now < self.next_due {
            return None;
        }
        Some(self.start(FetchReason::Timer))
    }

    /// Manual refreshes run even while paused. While a fetch is in flight the first
    /// request becomes a single follow-up fetch and later ones are dropped.
    pub fn request_manual(&mut self) -> ManualRefresh {
        if self.in_flight.is_some() {
            if self.queued {
                debug!("manual refresh dropped, follow-up already queued");
                return ManualRefresh::Dropped;
            }
            self.queued = true;
            return ManualRefresh::Queued;
        }
        ManualRefresh::Started(self.start(FetchReason::Manual))
    }

    fn start(&mut self, reason: FetchReason) -> FetchTicket {
        self.generation += 1;
        self.in_flight = Some(self.generation);
        self.state.fetch_in_flight = true;
        FetchTicket {
            generation: self.generation,
            reason,
        }
    }

    pub fn complete(
        &mut self,
        ticket: FetchTicket,
        outcome: Result<Vec<Operation>, FetchError>,
        criteria: &FilterCriteria,
        sort: &SortIndex,
        ledger: &mut SelectionLedger,
        now: Instant,
    ) -> Completion {
        if self.in_flight != Some(ticket.generation) {
            debug!("ignoring stale fetch result #{}", ticket.generation);
            return Completion::default();
        }

        self.in_flight = None;
        self.state.fetch_in_flight = false;
        self.next_due = now + self.interval();

        let mut completion = Completion::default();
        match outcome {
            Ok(operations) => {
                self.raw = Arc::new(operations);
                completion.reconciliation = Some(self.publish(criteria, sort, ledger));
                completion.published = true;
                self.state.last_refreshed = Some(Local::now());
                self.state.consecutive_failures = 0;
            }
            Err(error) => {
                let source = if error.is_connectivity() {
                    ErrorSource::Connect
                } else {
                    ErrorSource::Fetch
                };
                self.state.consecutive_failures += 1;
                warn!(
                    "fetch #{} failed ({} in a row): {}",
                    ticket.generation, self.state.consecutive_failures, error
                );
                let record = ErrorRecord::now(source, error.to_string());
                self.record_error(record.clone());
                completion.error = Some(record);
            }
        }

        if self.queued {
            self.queued = false;
            completion.follow_up = Some(self.start(FetchReason::Queued));
        }
        completion
    }

    pub fn publish(
        &mut self,
        criteria: &FilterCriteria,
        sort: &SortIndex,
        ledger: &mut SelectionLedger,
    ) -> Reconciliation {
        let ordered = sort.sort(filter::apply(&self.raw, criteria));
        let next = Snapshot::new(ordered, Some(Local::now()), self.generation);
        debug!(
            "publishing snapshot #{} with {} of {} row(s)",
            next.generation(),
            next.len(),
            self.raw.len()
        );
        let reconciliation = ledger.reconcile(&next);
        self.snapshot = Arc::new(next);
        reconciliation
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.state.last_error = Some(record);
    }

    pub fn pause(&mut self) {
        if !self.state.paused {
            info!("auto refresh paused");
        }
        self.state.paused = true;
    }

    // Resuming waits a full interval; use a manual refresh for an immediate fetch.
    pub fn resume(&mut self, now: Instant) {
        if self.state.paused {
            info!("auto refresh resumed");
        }
        self.state.paused = false;
        self.next_due = now + self.interval();
    }

    pub fn toggle_pause(&mut self, now: Instant) -> bool {
        if self.state.paused {
            self.resume(now);
        } else {
            self.pause();
        }
        self.state.paused
    }

    // Applies at the next scheduled wait, never to the deadline already set.
    pub fn adjust_interval(&mut self, delta: i64) -> u64 {
        let current = self.state.interval_secs;
        let next = if delta.is_negative() {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta.unsigned_abs())
        }
        .clamp(MIN_REFRESH_INTERVAL_SECS, MAX_REFRESH_INTERVAL_SECS);

        if next != current {
            info!("refresh interval {}s -> {}s", current, next);
        }
        self.state.interval_secs = next;
        next
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.state.interval_secs)
    }

    pub fn shutdown(&mut self) {
        self.in_flight = None;
        self.queued = false;
        self.state.fetch_in_flight = false;
        self.state.paused = true;
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchReason, ManualRefresh, RefreshScheduler};
    use crate::error::{ConnectError, FetchError};
    use crate::filter::{FilterCriteria, FilterField};
    use crate::gateway::fake::FakeGateway;
    use crate::gateway::{OperationsGateway, ServerFilter};
    use crate::model::{ErrorSource, OpId, Operation, OperationType};
    use crate::selection::SelectionLedger;
    use crate::sort::SortIndex;
    use std::time::{Duration, Instant};

    fn ops(times: &[(&str, u64)]) -> Vec<Operation> {
        times
            .iter()
            .map(|(id, secs)| Operation::new(*id, OperationType::Query, *secs))
            .collect()
    }

    struct Harness {
        scheduler: RefreshScheduler,
        criteria: FilterCriteria,
        sort: SortIndex,
        ledger: SelectionLedger,
        now: Instant,
    }

    impl Harness {
        fn new(interval: u64) -> Self {
            let now = Instant::now();
            Self {
                scheduler: RefreshScheduler::new(interval, now),
                criteria: FilterCriteria::default(),
                sort: SortIndex::default(),
                ledger: SelectionLedger::default(),
                now,
            }
        }

        fn finish(
            &mut self,
            ticket: super::FetchTicket,
            outcome: Result<Vec<Operation>, FetchError>,
        ) -> super::Completion {
            self.scheduler.complete(
                ticket,
                outcome,
                &self.criteria,
                &self.sort,
                &mut self.ledger,
                self.now,
            )
        }
    }

    #[test]
    fn timer_starts_one_fetch_at_a_time() {
        let mut h = Harness::new(5);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        assert_eq!(ticket.reason, FetchReason::Timer);
        assert!(h.scheduler.state().is_fetch_in_flight());
        assert!(h.scheduler.on_timer(h.now + Duration::from_secs(60)).is_none());
        assert!(h.scheduler.next_deadline().is_none());

        h.finish(ticket, Ok(ops(&[("1", 3)])));
        assert_eq!(h.scheduler.next_deadline(), Some(h.now + Duration::from_secs(5)));
        assert!(h.scheduler.on_timer(h.now + Duration::from_secs(4)).is_none());
        assert!(h.scheduler.on_timer(h.now + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn repeated_manual_refreshes_queue_exactly_one_follow_up() {
        let mut h = Harness::new(5);
        let ticket = match h.scheduler.request_manual() {
            ManualRefresh::Started(ticket) => ticket,
            other => panic!("expected a started fetch, got {other:?}"),
        };

        assert_eq!(h.scheduler.request_manual(), ManualRefresh::Queued);
        for _ in 0..5 {
            assert_eq!(h.scheduler.request_manual(), ManualRefresh::Dropped);
        }

        let completion = h.finish(ticket, Ok(ops(&[("1", 1)])));
        let follow_up = completion.follow_up.unwrap();
        assert_eq!(follow_up.reason, FetchReason::Queued);
        assert!(h.scheduler.state().is_fetch_in_flight());

        let completion = h.finish(follow_up, Ok(ops(&[("1", 2)])));
        assert!(completion.follow_up.is_none());
        assert!(!h.scheduler.state().is_fetch_in_flight());
    }

    #[test]
    fn pause_lets_current_fetch_publish_but_stops_auto_refresh() {
        let mut h = Harness::new(2);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        h.scheduler.pause();

        let completion = h.finish(ticket, Ok(ops(&[("7", 9)])));
        assert!(completion.published);
        assert_eq!(h.scheduler.snapshot().len(), 1);
        assert!(h.scheduler.next_deadline().is_none());
        assert!(h.scheduler.on_timer(h.now + Duration::from_secs(600)).is_none());

        let later = h.now + Duration::from_secs(30);
        assert!(!h.scheduler.toggle_pause(later));
        assert_eq!(h.scheduler.next_deadline(), Some(later + Duration::from_secs(2)));
        assert!(h.scheduler.on_timer(later).is_none());
    }

    #[test]
    fn manual_refresh_runs_while_paused() {
        let mut h = Harness::new(5);
        h.scheduler.pause();
        assert!(matches!(
            h.scheduler.request_manual(),
            ManualRefresh::Started(_)
        ));
    }

    #[test]
    fn interval_saturates_at_bounds() {
        let mut h = Harness::new(1);
        assert_eq!(h.scheduler.adjust_interval(-1), 1);
        assert_eq!(h.scheduler.adjust_interval(-100), 1);
        assert_eq!(h.scheduler.adjust_interval(1), 2);

        let mut h = Harness::new(60);
        assert_eq!(h.scheduler.adjust_interval(5), 60);
        assert_eq!(h.scheduler.adjust_interval(-1), 59);
    }

    #[test]
    fn interval_change_does_not_move_current_deadline() {
        let mut h = Harness::new(10);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        h.finish(ticket, Ok(Vec::new()));
        let deadline = h.scheduler.next_deadline();

        h.scheduler.adjust_interval(20);
        assert_eq!(h.scheduler.next_deadline(), deadline);
    }

    #[test]
    fn failed_fetch_keeps_previous_snapshot() {
        let mut h = Harness::new(5);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        h.finish(ticket, Ok(ops(&[("1", 1), ("2", 2)])));
        let before = h.scheduler.snapshot();

        let ticket = h.scheduler.request_manual();
        let ManualRefresh::Started(ticket) = ticket else {
            panic!("fetch should start");
        };
        let completion = h.finish(ticket, Err(FetchError::Command("not authorized".to_string())));

        assert!(!completion.published);
        let error = completion.error.unwrap();
        assert_eq!(error.source, ErrorSource::Fetch);
        assert_eq!(h.scheduler.snapshot().generation(), before.generation());
        assert_eq!(h.scheduler.snapshot().len(), 2);
        assert_eq!(h.scheduler.state().consecutive_failures(), 1);
        assert!(h.scheduler.state().last_error().is_some());
    }

    #[test]
    fn connectivity_failures_are_recorded_as_connect_errors() {
        let mut h = Harness::new(5);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        let completion = h.finish(
            ticket,
            Err(ConnectError::Unreachable("refused".to_string()).into()),
        );
        assert_eq!(completion.error.unwrap().source, ErrorSource::Connect);
        assert!(h.scheduler.next_deadline().is_some());
    }

    #[test]
    fn stale_results_are_ignored_after_shutdown() {
        let mut h = Harness::new(5);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        h.scheduler.shutdown();
        let completion = h.finish(ticket, Ok(ops(&[("1", 1)])));
        assert!(!completion.published);
        assert!(h.scheduler.snapshot().is_empty());
    }

    #[test]
    fn publish_filters_sorts_and_reconciles() {
        let mut h = Harness::new(5);
        h.ledger.toggle(&OpId::new("gone"));
        h.ledger.toggle(&OpId::new("b"));

        let ticket = h.scheduler.on_timer(h.now).unwrap();
        let completion = h.finish(ticket, Ok(ops(&[("a", 1), ("b", 30), ("c", 12)])));
        let reconciliation = completion.reconciliation.unwrap();
        assert!(reconciliation.dropped.contains(&OpId::new("gone")));
        assert!(h.ledger.is_selected(&OpId::new("b")));

        let ids = h
            .scheduler
            .snapshot()
            .ids()
            .map(|id| id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "c", "a"]);

        h.criteria.set(FilterField::RunningTime, "20").unwrap();
        h.scheduler.publish(&h.criteria, &h.sort, &mut h.ledger);
        assert_eq!(h.scheduler.snapshot().len(), 1);
        assert!(h.ledger.is_selected(&OpId::new("b")));
    }

    #[tokio::test]
    async fn fetch_cycle_against_gateway_publishes_snapshot() {
        let mut system = Operation::new("sys", OperationType::Command, 100);
        system.is_system = true;
        let mut rows = ops(&[("1", 3), ("2", 8)]);
        rows.push(system);
        let gateway = FakeGateway::with_operations(rows);

        let mut h = Harness::new(5);
        let ticket = h.scheduler.on_timer(h.now).unwrap();
        let filter = ServerFilter::listing(None, &h.criteria);
        let outcome = gateway.fetch_operations(&filter).await;
        h.finish(ticket, outcome);

        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(0).map(|op| op.id.as_str()), Some("2"));
    }
}
