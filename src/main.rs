mod app;
mod cli;
mod config;
mod error;
mod filter;
mod gateway;
mod input;
mod kill;
mod model;
mod mongo;
mod scheduler;
mod selection;
mod sort;
mod ui;

use anyhow::{Context, Result};
use app::{App, AppCommand};
use clap::Parser;
use cli::CliArgs;
use config::Settings;
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use error::{ConnectError, FetchError};
use futures::StreamExt;
use gateway::{OperationsGateway, SerializedGateway};
use kill::{KillCoordinator, KillPolicy};
use model::{BatchKillResult, Operation};
use mongo::MongoGateway;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use scheduler::FetchTicket;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

enum LoopEvent {
    Connected(Result<(), ConnectError>),
    Fetched {
        ticket: FetchTicket,
        outcome: Result<Vec<Operation>, FetchError>,
    },
    Killed(BatchKillResult),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let settings = Settings::load(&args)?;
    init_tracing(&settings)?;
    settings.log_startup();
    info!(
        "starting {} against {}",
        env!("CARGO_PKG_NAME"),
        settings.connection.endpoint()
    );

    let gateway: Arc<dyn OperationsGateway> = Arc::new(SerializedGateway::new(Arc::new(
        MongoGateway::new(settings.connection.clone()),
    )));
    let mut app = App::new(
        gateway.endpoint(),
        settings.namespace.clone(),
        settings.refresh_interval_secs,
        settings.show_system_ops,
        Instant::now(),
    );

    let result = run(&mut app, Arc::clone(&gateway)).await;
    gateway.close().await;
    info!("connection closed, exiting");
    result
}

fn init_tracing(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_new(&settings.log_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact();

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.log_file)
    {
        Ok(file) => {
            let _ = builder.with_writer(Mutex::new(file)).try_init();
        }
        Err(_) => {
            let _ = builder.with_writer(std::io::sink).try_init();
        }
    }

    Ok(())
}

async fn run(app: &mut App, gateway: Arc<dyn OperationsGateway>) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, gateway).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALL_KEYS_AS_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    gateway: Arc<dyn OperationsGateway>,
) -> Result<()> {
    let mut reader = EventStream::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LoopEvent>();
    let mut tasks = JoinSet::new();

    spawn_connect(&gateway, &event_tx, &mut tasks);

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        let deadline = app.next_deadline();
        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            dispatch(command, app, &gateway, &event_tx, &mut tasks);
                        }
                    }
                    Some(Ok(Event::Resize(_, _))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            _ = wait_for(deadline) => {
                let command = app.on_timer(Instant::now());
                dispatch(command, app, &gateway, &event_tx, &mut tasks);
            }
            Some(event) = event_rx.recv() => {
                let command = match event {
                    LoopEvent::Connected(result) => {
                        if let Err(error) = &result {
                            warn!("initial connection failed: {}", error);
                        }
                        app.on_connect_result(result);
                        AppCommand::None
                    }
                    LoopEvent::Fetched { ticket, outcome } => {
                        app.on_fetch_complete(ticket, outcome, Instant::now())
                    }
                    LoopEvent::Killed(result) => app.on_kill_complete(result),
                };
                dispatch(command, app, &gateway, &event_tx, &mut tasks);
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(join_error) = joined
                    && join_error.is_panic()
                {
                    error!("background task panicked: {}", join_error);
                }
            }
        }
    }

    app.shutdown();
    tasks.abort_all();
    Ok(())
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

fn spawn_connect(
    gateway: &Arc<dyn OperationsGateway>,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
    tasks: &mut JoinSet<()>,
) {
    let gateway = Arc::clone(gateway);
    let event_tx = event_tx.clone();
    tasks.spawn(async move {
        let result = gateway.connect().await;
        let _ = event_tx.send(LoopEvent::Connected(result));
    });
}

fn dispatch(
    command: AppCommand,
    app: &App,
    gateway: &Arc<dyn OperationsGateway>,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
    tasks: &mut JoinSet<()>,
) {
    match command {
        AppCommand::None => {}
        AppCommand::Fetch(ticket) => {
            let gateway = Arc::clone(gateway);
            let filter = app.server_filter();
            let event_tx = event_tx.clone();
            debug!("fetch #{} ({:?})", ticket.generation, ticket.reason);
            tasks.spawn(async move {
                let outcome = gateway.fetch_operations(&filter).await;
                let _ = event_tx.send(LoopEvent::Fetched { ticket, outcome });
            });
        }
        AppCommand::Kill(ids) => {
            let coordinator = KillCoordinator::new(Arc::clone(gateway), KillPolicy::default());
            let event_tx = event_tx.clone();
            tasks.spawn(async move {
                let result = coordinator.kill_selected(&ids).await;
                let _ = event_tx.send(LoopEvent::Killed(result));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LoopEvent, spawn_connect};
    use crate::gateway::OperationsGateway;
    use crate::gateway::fake::FakeGateway;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn startup_connect_reports_back_without_blocking_the_caller() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_connect_delay(Duration::from_millis(200));
        let gateway: Arc<dyn OperationsGateway> = fake.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LoopEvent>();
        let mut tasks = JoinSet::new();

        spawn_connect(&gateway, &event_tx, &mut tasks);
        assert!(event_rx.try_recv().is_err());

        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("connect result in time")
            .expect("channel open");
        assert!(matches!(event, LoopEvent::Connected(Ok(()))));
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), 1);
    }
}
