//! Interactive dashboard TUI.
//!
//! The terminal loop owns an `App` copy of the shared view and a
//! `RenderScheduler`. Reconciler notifications arrive over the
//! broadcast channel; the scheduler turns each into a plan, and the
//! loop applies plans by copying either the whole view (rebuild) or
//! one region of it (patch) out of the shared state. Scroll offsets
//! and any in-progress override input survive rebuilds via the
//! scheduler's capture/restore bookkeeping.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event as TermEvent, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::*;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use steward_core::types::{Stage, StageSource};

use crate::api::ApiClient;
use crate::display::{connection_indicator, stage_indicator, stage_lane};
use crate::reconciler::{DashboardView, EntityView, Feed, RefreshMode, SharedView, SyncInput};
use crate::render::{
    FocusSnapshot, Region, RegionDescriptor, RenderPlan, RenderRequest, RenderScheduler, Route,
};
use crate::sources::poller::PollerSet;
use crate::sources::stream::StreamSupervisor;

const OVERRIDE_INPUT_ID: &str = "override-input";

// ---------------------------------------------------------------------------
// Terminal cleanup guard
// ---------------------------------------------------------------------------

/// RAII guard that restores the terminal to its normal state when dropped.
/// This ensures cleanup happens even on panic or early `?` returns.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

/// Uncommitted override text being typed by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InputState {
    value: String,
    cursor: usize,
}

impl InputState {
    fn empty() -> Self {
        Self {
            value: String::new(),
            cursor: 0,
        }
    }

    fn insert(&mut self, c: char) {
        self.value.insert(self.cursor, c);
        self.cursor += c.len_utf8();
    }

    fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let prev = self.value[..self.cursor]
            .chars()
            .next_back()
            .map(char::len_utf8)
            .unwrap_or(1);
        self.cursor -= prev;
        self.value.remove(self.cursor);
    }

    fn left(&mut self) {
        let prev = self.value[..self.cursor]
            .chars()
            .next_back()
            .map(char::len_utf8)
            .unwrap_or(0);
        self.cursor -= prev;
    }

    fn right(&mut self) {
        let next = self.value[self.cursor..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(0);
        self.cursor += next;
    }
}

/// App state for the TUI.
struct App {
    view: DashboardView,
    route: Route,
    detail_entity: Option<String>,
    selected: usize,
    table_offset: u16,
    ticker_offset: u16,
    input: Option<InputState>,
    should_quit: bool,
}

impl App {
    fn new() -> Self {
        Self {
            view: DashboardView::default(),
            route: Route::Overview,
            detail_entity: None,
            selected: 0,
            table_offset: 0,
            ticker_offset: 0,
            input: None,
            should_quit: false,
        }
    }

    /// Move selection down (j / Down).
    fn next(&mut self) {
        if !self.view.entities.is_empty() {
            self.selected = (self.selected + 1).min(self.view.entities.len() - 1);
        }
    }

    /// Move selection up (k / Up).
    fn previous(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn selected_entity(&self) -> Option<&EntityView> {
        self.view.entities.get(self.selected)
    }

    fn clamp_selection(&mut self) {
        if self.view.entities.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.view.entities.len() {
            self.selected = self.view.entities.len() - 1;
        }
    }

    /// Replace the whole view. Selection is clamped; scroll and focus
    /// restoration is handled by the scheduler around this call.
    fn rebuild_from(&mut self, view: DashboardView) {
        self.view = view;
        self.clamp_selection();
    }

    /// Copy one region's slice of a fresh view, leaving everything
    /// else (selection, offsets, input) untouched.
    fn patch_from(&mut self, region: Region, fresh: &DashboardView) {
        match region {
            Region::Header => {
                self.view.connection = fresh.connection;
                self.view.overview_loaded = fresh.overview_loaded;
                self.view.overview_error = fresh.overview_error.clone();
                self.view.notice = fresh.notice.clone();
            }
            Region::StageCounters => {
                self.view.stage_counts = fresh.stage_counts;
            }
            Region::Ticker => {
                self.view.ticker = fresh.ticker.clone();
            }
            Region::EntityTable => {
                self.view.entities = fresh.entities.clone();
                self.clamp_selection();
            }
            Region::Detail => {
                self.view.entities = fresh.entities.clone();
                self.view.detail_errors = fresh.detail_errors.clone();
                self.clamp_selection();
            }
        }
    }
}

fn table_descriptor() -> RegionDescriptor {
    RegionDescriptor::explicit("entity-table")
}

fn ticker_descriptor() -> RegionDescriptor {
    RegionDescriptor::explicit("ticker")
}

/// Route change with scroll bookkeeping: park the current route's
/// offsets with the scheduler, then pick up whatever the target route
/// recorded last time it was on screen. Each route keeps its own
/// ticker and table positions.
fn switch_route(app: &mut App, scheduler: &mut RenderScheduler, route: Route) {
    scheduler.record_scroll(&table_descriptor(), app.table_offset);
    scheduler.record_scroll(&ticker_descriptor(), app.ticker_offset);
    scheduler.set_route(route);
    app.route = route;
    app.table_offset = scheduler
        .recorded_scroll(&table_descriptor())
        .unwrap_or(0);
    app.ticker_offset = scheduler
        .recorded_scroll(&ticker_descriptor())
        .unwrap_or(0);
}

fn read_view(shared: &SharedView) -> Option<DashboardView> {
    match shared.read() {
        Ok(guard) => Some(guard.clone()),
        Err(_) => {
            warn!("shared view lock poisoned");
            None
        }
    }
}

/// Apply one plan, plus everything that queued up behind a rebuild.
fn apply_plan(
    app: &mut App,
    scheduler: &mut RenderScheduler,
    shared: &SharedView,
    plan: RenderPlan,
) {
    let mut pending = vec![plan];
    while let Some(plan) = pending.pop() {
        match plan {
            RenderPlan::FullRebuild => {
                let focus = app.input.as_ref().map(|input| FocusSnapshot {
                    input_id: OVERRIDE_INPUT_ID.into(),
                    value: input.value.clone(),
                    cursor: input.cursor,
                });
                scheduler.begin_rebuild(
                    &[
                        (table_descriptor(), app.table_offset),
                        (ticker_descriptor(), app.ticker_offset),
                    ],
                    focus,
                );
                if let Some(view) = read_view(shared) {
                    app.rebuild_from(view);
                }
                let queued = scheduler.complete_rebuild();
                pending.extend(queued.into_iter().rev());

                if let Some(offset) = scheduler.restore_scroll(&table_descriptor()) {
                    app.table_offset = offset;
                }
                if let Some(offset) = scheduler.restore_scroll(&ticker_descriptor()) {
                    app.ticker_offset = offset;
                }
                if let Some(focus) = scheduler.take_focus() {
                    app.input = Some(InputState {
                        cursor: focus.cursor.min(focus.value.len()),
                        value: focus.value,
                    });
                }
            }
            RenderPlan::PatchRegion(region) => {
                if let Some(view) = read_view(shared) {
                    app.patch_from(region, &view);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Everything the TUI needs from the pipeline.
pub struct TuiHandles {
    pub shared: SharedView,
    pub notify_rx: broadcast::Receiver<RenderRequest>,
    pub input_tx: mpsc::Sender<SyncInput>,
    pub poller: PollerSet,
    pub stream: StreamSupervisor,
    pub api: Arc<ApiClient>,
}

/// Run the dashboard until the user presses `q` or Ctrl+C.
pub async fn run_tui(handles: TuiHandles) -> anyhow::Result<()> {
    let TuiHandles {
        shared,
        mut notify_rx,
        input_tx,
        mut poller,
        mut stream,
        api,
    } = handles;

    let mut scheduler = RenderScheduler::new(Route::Overview);
    for region in [
        Region::Header,
        Region::StageCounters,
        Region::Ticker,
        Region::EntityTable,
    ] {
        scheduler.register_patch_handler(Route::Overview, region);
    }
    for region in [Region::Header, Region::Ticker, Region::Detail] {
        scheduler.register_patch_handler(Route::Detail, region);
    }

    poller.start(Feed::Overview, RefreshMode::Normal).await;

    // Terminal setup; the TerminalGuard restores it on panic or early return.
    enable_raw_mode()?;
    let _guard = TerminalGuard;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new();
    if let Some(view) = read_view(&shared) {
        app.rebuild_from(view);
    }

    loop {
        terminal.draw(|frame| render(frame, &app))?;

        if app.should_quit {
            break;
        }

        tokio::select! {
            // Short timeout for crossterm event polling so we remain responsive.
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                while event::poll(Duration::from_millis(0))? {
                    if let TermEvent::Key(key) = event::read()? {
                        handle_key(
                            key.code,
                            key.modifiers,
                            &mut app,
                            &mut scheduler,
                            &shared,
                            &input_tx,
                            &mut poller,
                            &mut stream,
                            &api,
                        )
                        .await;
                    }
                }
            }
            request = notify_rx.recv() => {
                match request {
                    Ok(request) => {
                        if let Some(plan) = scheduler.plan(request) {
                            apply_plan(&mut app, &mut scheduler, &shared, plan);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed notifications; the shared view is
                        // still current, so rebuild once.
                        warn!(skipped, "render notifications lagged");
                        if let Some(plan) = scheduler.plan(RenderRequest::Rebuild) {
                            apply_plan(&mut app, &mut scheduler, &shared, plan);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        app.should_quit = true;
                    }
                }
            }
        }
    }

    terminal.show_cursor()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_key(
    code: KeyCode,
    modifiers: KeyModifiers,
    app: &mut App,
    scheduler: &mut RenderScheduler,
    shared: &SharedView,
    input_tx: &mpsc::Sender<SyncInput>,
    poller: &mut PollerSet,
    stream: &mut StreamSupervisor,
    api: &Arc<ApiClient>,
) {
    if let KeyCode::Char('c') = code {
        if modifiers.contains(KeyModifiers::CONTROL) {
            app.should_quit = true;
            return;
        }
    }

    // Override entry captures the keyboard until committed or
    // cancelled.
    if app.input.is_some() {
        handle_input_key(code, app, input_tx, api).await;
        return;
    }

    match code {
        KeyCode::Char('q') => app.should_quit = true,
        KeyCode::Char('j') | KeyCode::Down => app.next(),
        KeyCode::Char('k') | KeyCode::Up => app.previous(),
        KeyCode::Char('r') => {
            poller.refresh_once(Feed::Overview, RefreshMode::Normal);
            // A stream that spent its retry budget stays down until
            // the operator asks; manual refresh is that ask.
            if !stream.is_running() {
                stream.start();
            }
        }
        KeyCode::Char('n') => {
            let _ = input_tx.send(SyncInput::DismissNotice).await;
        }
        KeyCode::Char('o') => {
            if app.selected_entity().is_some() {
                app.input = Some(InputState::empty());
            }
        }
        KeyCode::Char('O') | KeyCode::Char('c') => {
            if let Some(entity) = app.selected_entity() {
                let _ = input_tx
                    .send(SyncInput::ClearOverride {
                        entity_id: entity.entity_id.clone(),
                    })
                    .await;
            }
        }
        KeyCode::Char('a') | KeyCode::Char('d') if app.route == Route::Detail => {
            if let Some(entity_id) = app.detail_entity.clone() {
                resolve_approval(api, input_tx, entity_id, code == KeyCode::Char('a'));
            }
        }
        KeyCode::Enter => {
            if app.route == Route::Overview {
                if let Some(entity) = app.selected_entity() {
                    let entity_id = entity.entity_id.clone();
                    app.detail_entity = Some(entity_id.clone());
                    switch_route(app, scheduler, Route::Detail);
                    poller
                        .start(Feed::Entity(entity_id), RefreshMode::Normal)
                        .await;
                }
            }
        }
        KeyCode::Esc => {
            if app.route == Route::Detail {
                if let Some(entity_id) = app.detail_entity.take() {
                    poller.stop(&Feed::Entity(entity_id)).await;
                }
                // Returning to a screen restores where the operator
                // left it.
                switch_route(app, scheduler, Route::Overview);
                if let Some(view) = read_view(shared) {
                    app.rebuild_from(view);
                }
            }
        }
        _ => {}
    }
}

async fn handle_input_key(
    code: KeyCode,
    app: &mut App,
    input_tx: &mpsc::Sender<SyncInput>,
    api: &Arc<ApiClient>,
) {
    let Some(input) = app.input.as_mut() else {
        return;
    };
    match code {
        KeyCode::Esc => {
            app.input = None;
        }
        KeyCode::Backspace => input.backspace(),
        KeyCode::Left => input.left(),
        KeyCode::Right => input.right(),
        KeyCode::Char(c) => input.insert(c),
        KeyCode::Enter => {
            let status = input.value.trim().to_string();
            app.input = None;
            let Some(entity) = app.selected_entity() else {
                return;
            };
            if status.is_empty() {
                return;
            }
            let entity_id = entity.entity_id.clone();
            // Optimistic: the override is visible immediately; a
            // server rejection rolls it back and raises a notice.
            let _ = input_tx
                .send(SyncInput::SetOverride {
                    entity_id: entity_id.clone(),
                    status: status.clone(),
                })
                .await;
            let api = Arc::clone(api);
            let tx = input_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = api.activate(&entity_id, &status).await {
                    warn!(entity_id, "activate rejected: {e}");
                    let _ = tx
                        .send(SyncInput::ClearOverride {
                            entity_id: entity_id.clone(),
                        })
                        .await;
                    let _ = tx
                        .send(SyncInput::Notice(format!(
                            "activate {entity_id} rejected: {e}"
                        )))
                        .await;
                }
            });
        }
        _ => {}
    }
}

fn resolve_approval(
    api: &Arc<ApiClient>,
    input_tx: &mpsc::Sender<SyncInput>,
    entity_id: String,
    approve: bool,
) {
    let api = Arc::clone(api);
    let tx = input_tx.clone();
    tokio::spawn(async move {
        let verb = if approve { "approve" } else { "deny" };
        if let Err(e) = api.resolve_approval(&entity_id, approve).await {
            warn!(entity_id, verb, "approval action rejected: {e}");
            let _ = tx
                .send(SyncInput::Notice(format!(
                    "{verb} {entity_id} rejected: {e}"
                )))
                .await;
        }
    });
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the full TUI frame for the active route.
fn render(frame: &mut Frame, app: &App) {
    match app.route {
        Route::Overview => render_overview(frame, app),
        Route::Detail => render_detail(frame, app),
    }
}

fn header_line(app: &App) -> String {
    let mut line = format!(
        " {} {}",
        connection_indicator(app.view.connection),
        app.view.connection.label(),
    );
    if let Some(error) = &app.view.overview_error {
        line.push_str(&format!("  ✖ overview: {error}"));
    }
    if let Some(notice) = &app.view.notice {
        line.push_str(&format!("  ! {notice} (n to dismiss)"));
    }
    line
}

fn counters_line(app: &App) -> String {
    Stage::ALL
        .iter()
        .map(|stage| {
            format!(
                "{}: {}",
                stage.label(),
                app.view.stage_counts[stage.index()]
            )
        })
        .collect::<Vec<_>>()
        .join("   ")
}

fn render_overview(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(3), // Stage counters
            Constraint::Min(5),    // Entity table
            Constraint::Length(8), // Event ticker
            Constraint::Length(3), // Help bar
        ])
        .split(frame.area());

    let header = Paragraph::new(header_line(app)).block(
        Block::default()
            .title(" STEWARD ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    frame.render_widget(header, chunks[0]);

    let counters = Paragraph::new(counters_line(app))
        .block(Block::default().borders(Borders::ALL).title(" Stages "));
    frame.render_widget(counters, chunks[1]);

    render_entity_table(frame, app, chunks[2]);
    render_ticker(frame, app, chunks[3]);

    let help = if app.input.is_some() {
        " type status | Enter: apply | Esc: cancel".to_string()
    } else {
        " j/k: navigate | Enter: detail | o: override | c: clear | r: refresh | q: quit".into()
    };
    let help = Paragraph::new(help).block(Block::default().borders(Borders::ALL));
    frame.render_widget(help, chunks[4]);
}

fn render_entity_table(frame: &mut Frame, app: &App, area: Rect) {
    if !app.view.overview_loaded && app.view.overview_error.is_some() {
        let placeholder = Paragraph::new("  overview unavailable")
            .block(Block::default().borders(Borders::ALL).title(" Entities "));
        frame.render_widget(placeholder, area);
        return;
    }

    let header = Row::new(vec!["Stages", "Entity", "Status", "Service", "Source"])
        .style(Style::default().bold());

    let rows: Vec<Row> = app
        .view
        .entities
        .iter()
        .enumerate()
        .map(|(i, entity)| {
            let mut style = if i == app.selected {
                Style::default().bg(Color::DarkGray)
            } else {
                Style::default()
            };
            if entity.timeline_stale {
                style = style.fg(Color::Yellow);
            }
            let status = match (&entity.effective_status, entity.override_status.is_some()) {
                (Some(s), true) => format!("{s}*"),
                (Some(s), false) => s.clone(),
                (None, _) => "—".into(),
            };
            Row::new(vec![
                stage_lane(&entity.stage_state),
                entity.entity_id.clone(),
                status,
                entity.service.clone().unwrap_or_else(|| "—".into()),
                match entity.stage_source {
                    StageSource::Authoritative => "server".into(),
                    StageSource::Projected => "projected".to_string(),
                },
            ])
            .style(style)
        })
        .collect();

    let mut title = " Entities ".to_string();
    if let Some(input) = &app.input {
        if let Some(entity) = app.selected_entity() {
            title = format!(" Entities — override {}: {}_ ", entity.entity_id, input.value);
        }
    }

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),  // stage lane
            Constraint::Length(16), // entity id
            Constraint::Length(14), // status
            Constraint::Length(16), // service
            Constraint::Length(10), // source
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(title));
    frame.render_widget(table, area);
}

fn render_ticker(frame: &mut Frame, app: &App, area: Rect) {
    let lines: Vec<Line> = app
        .view
        .ticker
        .iter()
        .map(|event| {
            let stage = event
                .stage
                .map(|s| format!(" [{}]", s.label()))
                .unwrap_or_default();
            let entity = event
                .entity_id
                .as_deref()
                .map(|id| format!(" {id}"))
                .unwrap_or_default();
            let message = event.message.as_deref().unwrap_or(event.topic.as_str());
            Line::from(format!(
                " {}{stage}{entity}  {message}",
                event.created_at.format("%H:%M:%S"),
            ))
        })
        .collect();

    let ticker = Paragraph::new(lines)
        .scroll((app.ticker_offset, 0))
        .block(Block::default().borders(Borders::ALL).title(" Events "));
    frame.render_widget(ticker, area);
}

fn render_detail(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(8),    // Timeline
            Constraint::Length(8), // Event ticker
            Constraint::Length(3), // Help bar
        ])
        .split(frame.area());

    let entity_id = app.detail_entity.as_deref().unwrap_or("—");
    let header = Paragraph::new(header_line(app)).block(
        Block::default()
            .title(format!(" STEWARD — {entity_id} "))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    frame.render_widget(header, chunks[0]);

    let entity = app
        .view
        .entities
        .iter()
        .find(|e| Some(e.entity_id.as_str()) == app.detail_entity.as_deref());

    let mut lines: Vec<Line> = Vec::new();
    if let Some(error) = app
        .detail_entity
        .as_deref()
        .and_then(|id| app.view.detail_errors.get(id))
    {
        lines.push(Line::from(format!(" ✖ timeline unavailable: {error}")));
    }
    if let Some(entity) = entity {
        let source = match entity.stage_source {
            StageSource::Authoritative => "server timeline",
            StageSource::Projected => "projected from events",
        };
        lines.push(Line::from(format!(" source: {source}")));
        if entity.timeline_stale {
            lines.push(Line::from(" ◌ timeline refresh in flight"));
        }
        for stage in Stage::ALL {
            let detail = entity.stage_state.detail(stage);
            let latest = detail
                .latest_event
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();
            lines.push(Line::from(format!(
                " {} {:<10} {:>3} event(s)  {}",
                stage_indicator(&entity.stage_state, stage),
                stage.label(),
                detail.event_count,
                latest,
            )));
        }
    } else {
        lines.push(Line::from(" no data yet"));
    }

    let timeline = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Timeline "));
    frame.render_widget(timeline, chunks[1]);

    render_ticker(frame, app, chunks[2]);

    let help = Paragraph::new(" a: approve | d: deny | Esc: back | q: quit")
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(help, chunks[3]);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
