use crate::error::{ConnectError, FetchError};
use crate::filter::{FilterCriteria, FilterField};
use crate::gateway::ServerFilter;
use crate::input::Action;
use crate::model::{
    BatchKillResult, ConnectionStatus, ErrorRecord, ErrorSource, OpId, Operation, RefreshState,
    Snapshot, SortDirection,
};
use crate::scheduler::{FetchReason, FetchTicket, ManualRefresh, RefreshScheduler};
use crate::selection::SelectionLedger;
use crate::sort::SortIndex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Filter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    Fetch(FetchTicket),
    Kill(Vec<OpId>),
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    prompt: String,
    command: AppCommand,
}

pub struct App {
    running: bool,
    mode: InputMode,
    endpoint: String,
    namespace_scope: Option<String>,
    connection: ConnectionStatus,
    scheduler: RefreshScheduler,
    criteria: FilterCriteria,
    filter_backup: Option<FilterCriteria>,
    filter_field: FilterField,
    input: String,
    sort: SortIndex,
    ledger: SelectionLedger,
    cursor: usize,
    status: String,
    show_help: bool,
    show_filter_bar: bool,
    detail: Option<Operation>,
    detail_scroll: u16,
    detail_view_width: u16,
    detail_view_height: u16,
    pending_confirmation: Option<PendingConfirmation>,
    kill_in_flight: bool,
    table_page_size: usize,
}

impl App {
    pub fn new(
        endpoint: String,
        namespace_scope: Option<String>,
        interval_secs: u64,
        show_system_ops: bool,
        now: Instant,
    ) -> Self {
        Self {
            running: true,
            mode: InputMode::Normal,
            endpoint,
            namespace_scope,
            connection: ConnectionStatus::Connecting,
            scheduler: RefreshScheduler::new(interval_secs, now),
            criteria: FilterCriteria::with_system_ops(show_system_ops),
            filter_backup: None,
            filter_field: FilterField::OpId,
            input: String::new(),
            sort: SortIndex::new(SortDirection::Descending),
            ledger: SelectionLedger::default(),
            cursor: 0,
            status: "Connecting…".to_string(),
            show_help: false,
            show_filter_bar: false,
            detail: None,
            detail_scroll: 0,
            detail_view_width: 80,
            detail_view_height: 20,
            pending_confirmation: None,
            kill_in_flight: false,
            table_page_size: 20,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace_scope(&self) -> Option<&str> {
        self.namespace_scope.as_deref()
    }

    pub fn connection(&self) -> &ConnectionStatus {
        &self.connection
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.scheduler.snapshot()
    }

    pub fn refresh_state(&self) -> &RefreshState {
        self.scheduler.state()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn filter_field(&self) -> FilterField {
        self.filter_field
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn sort_direction(&self) -> SortDirection {
        self.sort.direction()
    }

    pub fn is_selected(&self, id: &OpId) -> bool {
        self.ledger.is_selected(id)
    }

    pub fn is_pending(&self, id: &OpId) -> bool {
        self.ledger.is_pending(id)
    }

    pub fn selected_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        (!self.scheduler.snapshot().is_empty()).then_some(self.cursor)
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn show_filter_bar(&self) -> bool {
        self.show_filter_bar || self.mode == InputMode::Filter
    }

    pub fn detail(&self) -> Option<&Operation> {
        self.detail.as_ref()
    }

    pub fn detail_scroll(&self) -> u16 {
        self.detail_scroll
    }

    pub fn pending_confirmation_prompt(&self) -> Option<&str> {
        self.pending_confirmation
            .as_ref()
            .map(|pending| pending.prompt.as_str())
    }

    pub fn kill_in_flight(&self) -> bool {
        self.kill_in_flight
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.pending_len()
    }

    pub fn refresh_queued(&self) -> bool {
        self.scheduler.has_queued_refresh()
    }

    pub fn server_filter(&self) -> ServerFilter {
        ServerFilter::listing(self.namespace_scope.as_deref(), &self.criteria)
    }

    pub fn set_table_page_size(&mut self, rows: usize) {
        self.table_page_size = rows.max(1);
    }

    pub fn set_detail_viewport(&mut self, width: u16, height: u16) {
        self.detail_view_width = width.max(1);
        self.detail_view_height = height.max(1);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
    }

    pub fn on_connect_result(&mut self, result: Result<(), ConnectError>) {
        match result {
            Ok(()) => {
                self.connection = ConnectionStatus::Connected;
                self.set_status(format!("Connected to {}", self.endpoint));
            }
            Err(error) => {
                let message = error.to_string();
                self.connection = ConnectionStatus::Disconnected(message.clone());
                self.scheduler
                    .record_error(ErrorRecord::now(ErrorSource::Connect, message.clone()));
                self.set_status(format!(
                    "Connection failed, retrying on next refresh: {}",
                    summarize_error_line(&message)
                ));
            }
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> AppCommand {
        match self.scheduler.on_timer(now) {
            Some(ticket) => AppCommand::Fetch(ticket),
            None => AppCommand::None,
        }
    }

    pub fn on_fetch_complete(
        &mut self,
        ticket: FetchTicket,
        outcome: Result<Vec<Operation>, FetchError>,
        now: Instant,
    ) -> AppCommand {
        let connection = match &outcome {
            Ok(_) => Some(ConnectionStatus::Connected),
            Err(FetchError::Connect(error)) => {
                Some(ConnectionStatus::Disconnected(error.to_string()))
            }
            Err(_) => None,
        };

        let previous = self.cursor_id();
        let completion = self.scheduler.complete(
            ticket,
            outcome,
            &self.criteria,
            &self.sort,
            &mut self.ledger,
            now,
        );

        if (completion.published || completion.error.is_some())
            && let Some(connection) = connection
        {
            self.connection = connection;
        }

        if completion.published {
            self.restore_cursor(previous);
            let count = self.scheduler.snapshot().len();
            match completion.reconciliation {
                Some(reconciliation) if !reconciliation.dropped.is_empty() => {
                    self.set_status(format!(
                        "{} selected operation(s) ended or were filtered out, {} still selected",
                        reconciliation.dropped.len(),
                        reconciliation.selected.len()
                    ));
                }
                _ if ticket.reason != FetchReason::Timer => {
                    self.set_status(format!("Refreshed: {count} operation(s)"));
                }
                _ if self.status.starts_with("Connect") => {
                    self.set_status(format!("Connected to {}", self.endpoint));
                }
                _ => {}
            }
        }

        if let Some(error) = completion.error {
            self.set_status(format!(
                "Refresh failed: {}",
                summarize_error_line(&error.message)
            ));
        }

        match completion.follow_up {
            Some(ticket) => AppCommand::Fetch(ticket),
            None => AppCommand::None,
        }
    }

    pub fn on_kill_complete(&mut self, result: BatchKillResult) -> AppCommand {
        self.kill_in_flight = false;
        self.ledger.settle(&result);
        for (id, reason) in result.failed() {
            self.scheduler.record_error(ErrorRecord::now(
                ErrorSource::Terminate,
                format!("{id}: {reason}"),
            ));
        }
        let summary = result.summary();
        info!("{}", summary);
        let command = self.request_refresh();
        self.set_status(summary);
        command
    }

    pub fn shutdown(&mut self) {
        self.running = false;
        self.scheduler.shutdown();
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if let Some(pending) = self.pending_confirmation.take() {
            match action {
                Action::ConfirmYes => {
                    self.set_status(format!("Confirmed: {}", pending.prompt));
                    return self.dispatch_confirmed(pending.command);
                }
                Action::ConfirmNo | Action::CancelInput | Action::CloseOverlay => {
                    self.set_status("Action cancelled");
                    return AppCommand::None;
                }
                Action::Quit => {}
                _ => {
                    self.pending_confirmation = Some(pending);
                    self.set_status("Pending confirmation: press y to confirm or n to cancel");
                    return AppCommand::None;
                }
            }
        }

        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
            if matches!(action, Action::CloseOverlay) {
                return AppCommand::None;
            }
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.set_status("Exit requested");
                AppCommand::None
            }
            Action::Down => {
                self.move_or_scroll(1);
                AppCommand::None
            }
            Action::Up => {
                self.move_or_scroll(-1);
                AppCommand::None
            }
            Action::PageDown => {
                self.move_or_scroll(self.page_step());
                AppCommand::None
            }
            Action::PageUp => {
                self.move_or_scroll(-self.page_step());
                AppCommand::None
            }
            Action::Top => {
                if self.detail.is_some() {
                    self.detail_scroll = 0;
                } else {
                    self.cursor = 0;
                }
                AppCommand::None
            }
            Action::Bottom => {
                if self.detail.is_some() {
                    self.detail_scroll = self.detail_max_scroll();
                } else {
                    self.cursor = self.scheduler.snapshot().len().saturating_sub(1);
                }
                AppCommand::None
            }
            Action::ToggleSelect => {
                let Some(id) = self.cursor_id() else {
                    self.set_status("No operation under the cursor");
                    return AppCommand::None;
                };
                let selected = self.ledger.toggle(&id);
                self.set_status(format!(
                    "{} {}  ({} selected)",
                    if selected { "Selected" } else { "Deselected" },
                    id,
                    self.ledger.len()
                ));
                AppCommand::None
            }
            Action::SelectAll => {
                let snapshot = self.scheduler.snapshot();
                let all_selected = !snapshot.is_empty()
                    && snapshot.ids().all(|id| self.ledger.is_selected(id));
                if all_selected {
                    let count = self.ledger.deselect_all();
                    self.set_status(format!("Deselected {count} operation(s)"));
                } else {
                    let count = self.ledger.select_all(&snapshot);
                    self.set_status(format!("Selected {count} operation(s)"));
                }
                AppCommand::None
            }
            Action::DeselectAll => {
                let count = self.ledger.deselect_all();
                self.set_status(format!("Deselected {count} operation(s)"));
                AppCommand::None
            }
            Action::KillSelected => self.prepare_kill_confirmation(),
            Action::Refresh => self.request_refresh(),
            Action::TogglePause => {
                let paused = self.scheduler.toggle_pause(Instant::now());
                self.set_status(if paused {
                    "Auto refresh paused"
                } else {
                    "Auto refresh resumed"
                });
                AppCommand::None
            }
            Action::IncreaseInterval => {
                let secs = self.scheduler.adjust_interval(1);
                self.set_status(format!("Refresh interval: {secs}s"));
                AppCommand::None
            }
            Action::DecreaseInterval => {
                let secs = self.scheduler.adjust_interval(-1);
                self.set_status(format!("Refresh interval: {secs}s"));
                AppCommand::None
            }
            Action::ToggleSort => {
                let direction = self.sort.toggle();
                self.republish();
                self.set_status(format!("Sorted by running time, {}", direction.label()));
                AppCommand::None
            }
            Action::ToggleSystemOps => {
                let show = !self.criteria.show_system_ops();
                self.criteria.set_show_system_ops(show);
                self.republish();
                let command = self.request_refresh();
                self.set_status(if show {
                    "Showing system operations"
                } else {
                    "Hiding system operations"
                });
                command
            }
            Action::StartFilter => {
                self.filter_backup = Some(self.criteria.clone());
                self.mode = InputMode::Filter;
                self.input = self.criteria.value(self.filter_field);
                self.detail = None;
                self.set_status("Filter: Tab next field, Enter apply, Esc cancel");
                AppCommand::None
            }
            Action::ToggleFilterBar => {
                self.show_filter_bar = !self.show_filter_bar;
                AppCommand::None
            }
            Action::ClearFilters => {
                self.criteria.clear();
                self.republish();
                let command = self.request_refresh();
                self.set_status("Filters cleared");
                command
            }
            Action::ShowDetails => {
                match self.cursor_operation() {
                    Some(operation) => {
                        self.detail = Some(operation);
                        self.detail_scroll = 0;
                    }
                    None => self.set_status("No operation under the cursor"),
                }
                AppCommand::None
            }
            Action::CloseOverlay => {
                if self.detail.take().is_none() {
                    self.set_status("Nothing to close");
                }
                self.detail_scroll = 0;
                AppCommand::None
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::ConfirmYes | Action::ConfirmNo => {
                self.set_status("No pending confirmation");
                AppCommand::None
            }
            Action::SubmitInput => self.submit_filter(),
            Action::CancelInput => {
                if let Some(backup) = self.filter_backup.take() {
                    self.criteria = backup;
                    self.republish();
                }
                self.mode = InputMode::Normal;
                self.input.clear();
                self.set_status("Filter edit cancelled");
                AppCommand::None
            }
            Action::NextField | Action::PrevField => {
                if self.apply_filter_input() {
                    self.filter_field = if action == Action::NextField {
                        self.filter_field.next()
                    } else {
                        self.filter_field.prev()
                    };
                    self.input = self.criteria.value(self.filter_field);
                }
                AppCommand::None
            }
            Action::Backspace => {
                self.input.pop();
                self.apply_filter_input();
                AppCommand::None
            }
            Action::ClearField => {
                self.input.clear();
                self.apply_filter_input();
                AppCommand::None
            }
            Action::InputChar(c) => {
                self.input.push(c);
                self.apply_filter_input();
                AppCommand::None
            }
        }
    }

    fn dispatch_confirmed(&mut self, command: AppCommand) -> AppCommand {
        if let AppCommand::Kill(ids) = &command {
            self.kill_in_flight = true;
            self.ledger.mark_pending(ids);
            self.set_status(format!("Killing {} operation(s)…", ids.len()));
        }
        command
    }

    fn prepare_kill_confirmation(&mut self) -> AppCommand {
        if self.kill_in_flight {
            self.set_status("A kill batch is already running");
            return AppCommand::None;
        }

        if self.ledger.is_empty() {
            self.set_status("No operations selected");
            return AppCommand::None;
        }
        debug!("kill requested for {:?}", self.ledger.selected());
        let ids = self.ledger.selected_in_order(&self.scheduler.snapshot());

        let preview = ids
            .iter()
            .take(5)
            .map(OpId::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let more = if ids.len() > 5 { ", …" } else { "" };
        self.pending_confirmation = Some(PendingConfirmation {
            prompt: format!("Kill {} operation(s) [{preview}{more}]", ids.len()),
            command: AppCommand::Kill(ids),
        });
        AppCommand::None
    }

    fn request_refresh(&mut self) -> AppCommand {
        match self.scheduler.request_manual() {
            ManualRefresh::Started(ticket) => {
                self.set_status("Refreshing…");
                AppCommand::Fetch(ticket)
            }
            ManualRefresh::Queued => {
                self.set_status("Refresh queued behind the running fetch");
                AppCommand::None
            }
            ManualRefresh::Dropped => {
                self.set_status("Refresh already queued");
                AppCommand::None
            }
        }
    }

    fn apply_filter_input(&mut self) -> bool {
        if self.mode != InputMode::Filter {
            return false;
        }
        match self.criteria.set(self.filter_field, &self.input) {
            Ok(()) => {
                self.republish();
                let visible = self.scheduler.snapshot().len();
                self.set_status(format!(
                    "Filter {}: {} match(es)",
                    self.filter_field.title(),
                    visible
                ));
                true
            }
            Err(error) => {
                warn!("rejected filter input: {}", error);
                self.scheduler.record_error(ErrorRecord::now(
                    ErrorSource::FilterConfig,
                    error.to_string(),
                ));
                self.set_status(format!("Invalid filter: {error}"));
                false
            }
        }
    }

    fn submit_filter(&mut self) -> AppCommand {
        if self.mode != InputMode::Filter || !self.apply_filter_input() {
            return AppCommand::None;
        }
        self.mode = InputMode::Normal;
        self.filter_backup = None;
        self.input.clear();
        let active = self.criteria.active_count();
        let command = self.request_refresh();
        self.set_status(format!("{active} filter(s) active"));
        command
    }

    fn republish(&mut self) {
        let previous = self.cursor_id();
        self.scheduler
            .publish(&self.criteria, &self.sort, &mut self.ledger);
        self.restore_cursor(previous);
    }

    fn cursor_id(&self) -> Option<OpId> {
        self.scheduler
            .snapshot()
            .get(self.cursor)
            .map(|operation| operation.id.clone())
    }

    fn cursor_operation(&self) -> Option<Operation> {
        self.scheduler.snapshot().get(self.cursor).cloned()
    }

    fn restore_cursor(&mut self, previous: Option<OpId>) {
        let snapshot = self.scheduler.snapshot();
        self.cursor = previous
            .and_then(|id| snapshot.position(&id))
            .unwrap_or_else(|| self.cursor.min(snapshot.len().saturating_sub(1)));
    }

    fn move_or_scroll(&mut self, delta: isize) {
        if self.detail.is_some() {
            let max = self.detail_max_scroll() as isize;
            self.detail_scroll = (self.detail_scroll as isize + delta).clamp(0, max) as u16;
            return;
        }

        let len = self.scheduler.snapshot().len();
        if len == 0 {
            self.cursor = 0;
            return;
        }
        let max_index = len.saturating_sub(1) as isize;
        let current = self.cursor.min(max_index as usize) as isize;
        self.cursor = (current + delta).clamp(0, max_index) as usize;
    }

    fn page_step(&self) -> isize {
        if self.detail.is_some() {
            self.detail_view_height.saturating_div(2).max(1) as isize
        } else {
            self.table_page_size.saturating_sub(1).max(1) as isize
        }
    }

    fn detail_max_scroll(&self) -> u16 {
        let Some(detail) = &self.detail else {
            return 0;
        };
        let visual_lines = visual_line_count(&detail.detail_text(), self.detail_view_width as usize);
        visual_lines.saturating_sub(self.detail_view_height as usize) as u16
    }
}

fn visual_line_count(text: &str, width: usize) -> usize {
    let width = width.max(1);
    text.lines()
        .map(|line| line.chars().count().div_ceil(width).max(1))
        .sum::<usize>()
        .max(1)
}

pub fn summarize_error_line(error: &str) -> String {
    error
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

fn normalize_status_text(status: String) -> String {
    const MAX_STATUS_LEN: usize = 180;
    if status.chars().count() <= MAX_STATUS_LEN {
        return status;
    }

    let mut shortened = status
        .chars()
        .take(MAX_STATUS_LEN.saturating_sub(1))
        .collect::<String>();
    shortened.push('…');
    shortened
}

#[cfg(test)]
mod tests {
    use super::{App, AppCommand, InputMode, normalize_status_text};
    use crate::error::{ConnectError, FetchError};
    use crate::filter::FilterField;
    use crate::input::Action;
    use crate::model::{
        BatchKillResult, ConnectionStatus, ErrorSource, KillOutcome, OpId, Operation,
        OperationType, SortDirection,
    };
    use std::time::Instant;

    fn op(id: &str, secs: u64, ns: &str) -> Operation {
        let mut operation = Operation::new(id, OperationType::Query, secs);
        operation.namespace = ns.to_string();
        operation
    }

    fn sample() -> Vec<Operation> {
        vec![
            op("1", 5, "shop.orders"),
            op("2", 40, "shop.carts"),
            op("3", 12, "crm.leads"),
        ]
    }

    fn loaded_app(operations: Vec<Operation>) -> App {
        let now = Instant::now();
        let mut app = App::new("localhost:27017".to_string(), None, 5, false, now);
        let AppCommand::Fetch(ticket) = app.on_timer(now) else {
            panic!("first timer check should fetch");
        };
        app.on_fetch_complete(ticket, Ok(operations), now);
        app
    }

    fn visible_ids(app: &App) -> Vec<String> {
        app.snapshot().ids().map(|id| id.to_string()).collect()
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.apply_action(Action::InputChar(c));
        }
    }

    #[test]
    fn first_fetch_publishes_sorted_snapshot() {
        let app = loaded_app(sample());
        assert_eq!(visible_ids(&app), vec!["2", "3", "1"]);
        assert_eq!(app.connection(), &ConnectionStatus::Connected);
        assert_eq!(app.cursor(), Some(0));
    }

    #[test]
    fn sort_toggle_reorders_locally() {
        let mut app = loaded_app(sample());
        let cmd = app.apply_action(Action::ToggleSort);
        assert_eq!(cmd, AppCommand::None);
        assert_eq!(app.sort_direction(), SortDirection::Ascending);
        assert_eq!(visible_ids(&app), vec!["1", "3", "2"]);
    }

    #[test]
    fn cursor_follows_operation_across_refresh() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::Down);
        assert_eq!(app.cursor(), Some(1));

        let now = Instant::now();
        let AppCommand::Fetch(ticket) = app.apply_action(Action::Refresh) else {
            panic!("manual refresh should fetch");
        };
        app.on_fetch_complete(
            ticket,
            Ok(vec![op("1", 6, "shop.orders"), op("3", 99, "crm.leads")]),
            now,
        );
        assert_eq!(visible_ids(&app), vec!["3", "1"]);
        assert_eq!(app.cursor(), Some(0));
    }

    #[test]
    fn live_filter_refilters_and_submit_requests_refresh() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::StartFilter);
        assert_eq!(app.mode(), InputMode::Filter);

        app.apply_action(Action::NextField);
        app.apply_action(Action::NextField);
        assert_eq!(app.filter_field(), FilterField::Namespace);
        type_text(&mut app, "shop");
        assert_eq!(visible_ids(&app), vec!["2", "1"]);

        let cmd = app.apply_action(Action::SubmitInput);
        assert!(matches!(cmd, AppCommand::Fetch(_)));
        assert_eq!(app.mode(), InputMode::Normal);
        assert_eq!(app.criteria().value(FilterField::Namespace), "shop");
    }

    #[test]
    fn invalid_running_time_keeps_previous_criteria() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::StartFilter);
        for _ in 0..3 {
            app.apply_action(Action::NextField);
        }
        assert_eq!(app.filter_field(), FilterField::RunningTime);
        type_text(&mut app, "10");
        assert_eq!(visible_ids(&app), vec!["2", "3"]);

        app.apply_action(Action::InputChar('x'));
        assert!(app.status().starts_with("Invalid filter"));
        assert_eq!(app.criteria().value(FilterField::RunningTime), "10");
        assert_eq!(
            app.refresh_state().last_error().map(|error| error.source),
            Some(ErrorSource::FilterConfig)
        );

        assert_eq!(app.apply_action(Action::SubmitInput), AppCommand::None);
        assert_eq!(app.mode(), InputMode::Filter);
    }

    #[test]
    fn cancel_filter_restores_previous_criteria() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::StartFilter);
        type_text(&mut app, "2");
        assert_eq!(visible_ids(&app), vec!["2"]);

        app.apply_action(Action::CancelInput);
        assert!(app.criteria().is_empty());
        assert_eq!(visible_ids(&app).len(), 3);
    }

    #[test]
    fn kill_requires_confirmation() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::ToggleSelect);
        assert_eq!(app.apply_action(Action::KillSelected), AppCommand::None);
        assert!(app.pending_confirmation_prompt().is_some());

        assert_eq!(app.apply_action(Action::Down), AppCommand::None);
        assert!(app.pending_confirmation_prompt().is_some());

        assert_eq!(app.apply_action(Action::ConfirmNo), AppCommand::None);
        assert!(app.pending_confirmation_prompt().is_none());
        assert!(!app.kill_in_flight());

        app.apply_action(Action::KillSelected);
        let cmd = app.apply_action(Action::ConfirmYes);
        assert_eq!(cmd, AppCommand::Kill(vec![OpId::new("2")]));
        assert!(app.kill_in_flight());
        assert!(app.is_pending(&OpId::new("2")));

        assert_eq!(app.apply_action(Action::KillSelected), AppCommand::None);
        assert_eq!(app.status(), "A kill batch is already running");
    }

    #[test]
    fn kill_without_selection_is_refused() {
        let mut app = loaded_app(sample());
        assert_eq!(app.apply_action(Action::KillSelected), AppCommand::None);
        assert!(app.pending_confirmation_prompt().is_none());
        assert_eq!(app.status(), "No operations selected");
    }

    #[test]
    fn kill_completion_settles_ledger_and_refreshes() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::SelectAll);
        app.apply_action(Action::KillSelected);
        app.apply_action(Action::ConfirmYes);

        let mut result = BatchKillResult::default();
        result.push(OpId::new("2"), KillOutcome::Terminated);
        result.push(OpId::new("3"), KillOutcome::Failed("not authorized".to_string()));
        result.push(OpId::new("1"), KillOutcome::NotFound);

        let cmd = app.on_kill_complete(result);
        assert!(matches!(cmd, AppCommand::Fetch(_)));
        assert!(!app.kill_in_flight());
        assert_eq!(app.selected_count(), 1);
        assert!(app.is_selected(&OpId::new("3")));
        assert!(!app.is_pending(&OpId::new("3")));
        assert!(app.status().contains("Failed to kill 1 operation: 3"));
        assert_eq!(
            app.refresh_state().last_error().map(|error| error.source),
            Some(ErrorSource::Terminate)
        );
    }

    #[test]
    fn select_all_toggles_when_everything_selected() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::SelectAll);
        assert_eq!(app.selected_count(), 3);
        app.apply_action(Action::SelectAll);
        assert_eq!(app.selected_count(), 0);
    }

    #[test]
    fn manual_refresh_while_fetching_is_queued_once() {
        let mut app = loaded_app(sample());
        let first = app.apply_action(Action::Refresh);
        assert!(matches!(first, AppCommand::Fetch(_)));
        assert_eq!(app.apply_action(Action::Refresh), AppCommand::None);
        assert_eq!(app.status(), "Refresh queued behind the running fetch");
        assert_eq!(app.apply_action(Action::Refresh), AppCommand::None);
        assert_eq!(app.status(), "Refresh already queued");
    }

    #[test]
    fn interval_keys_respect_bounds() {
        let now = Instant::now();
        let mut app = App::new("db:1".to_string(), None, 1, false, now);
        app.apply_action(Action::DecreaseInterval);
        assert_eq!(app.refresh_state().interval_secs(), 1);
        app.apply_action(Action::IncreaseInterval);
        assert_eq!(app.refresh_state().interval_secs(), 2);
        assert_eq!(app.status(), "Refresh interval: 2s");
    }

    #[test]
    fn pause_toggle_suppresses_timer() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::TogglePause);
        assert!(app.refresh_state().is_paused());
        assert!(app.next_deadline().is_none());
        app.apply_action(Action::TogglePause);
        assert!(!app.refresh_state().is_paused());
        assert!(app.next_deadline().is_some());
    }

    #[test]
    fn connect_failure_marks_disconnected_and_keeps_rows() {
        let mut app = loaded_app(sample());
        let AppCommand::Fetch(ticket) = app.apply_action(Action::Refresh) else {
            panic!("manual refresh should fetch");
        };
        app.on_fetch_complete(
            ticket,
            Err(FetchError::Connect(ConnectError::Unreachable(
                "connection refused".to_string(),
            ))),
            Instant::now(),
        );
        assert!(matches!(app.connection(), ConnectionStatus::Disconnected(_)));
        assert_eq!(visible_ids(&app).len(), 3);
        assert!(app.status().starts_with("Refresh failed"));
    }

    #[test]
    fn stale_result_after_shutdown_leaves_connection_alone() {
        let mut app = loaded_app(sample());
        let AppCommand::Fetch(ticket) = app.apply_action(Action::Refresh) else {
            panic!("manual refresh should fetch");
        };
        app.shutdown();
        app.on_fetch_complete(
            ticket,
            Err(FetchError::Connect(ConnectError::Unreachable(
                "connection refused".to_string(),
            ))),
            Instant::now(),
        );
        assert_eq!(app.connection(), &ConnectionStatus::Connected);
        assert_eq!(visible_ids(&app).len(), 3);
    }

    #[test]
    fn system_toggle_refilters_and_refreshes() {
        let mut system = op("9", 300, "admin.$cmd");
        system.is_system = true;
        let mut rows = sample();
        rows.push(system);
        let mut app = loaded_app(rows);
        assert_eq!(visible_ids(&app).len(), 3);

        let cmd = app.apply_action(Action::ToggleSystemOps);
        assert!(matches!(cmd, AppCommand::Fetch(_)));
        assert_eq!(visible_ids(&app).first().map(String::as_str), Some("9"));
        assert!(app.server_filter().include_system);
    }

    #[test]
    fn details_open_and_close() {
        let mut app = loaded_app(sample());
        app.apply_action(Action::ShowDetails);
        assert_eq!(app.detail().map(|op| op.id.as_str()), Some("2"));
        app.apply_action(Action::CloseOverlay);
        assert!(app.detail().is_none());
    }

    #[test]
    fn status_text_is_truncated() {
        let long = "x".repeat(400);
        let normalized = normalize_status_text(long);
        assert_eq!(normalized.chars().count(), 180);
        assert!(normalized.ends_with('…'));
    }
}
