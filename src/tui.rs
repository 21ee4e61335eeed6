use crate::client::RemoteStore;
use crate::error::{ErrorKind, Field, StoreError, ValidationErrors};
use crate::holding::{EnrichedHolding, HoldingDraft};
use crate::portfolio::{format_signed, MetricsSource};
use crate::sync::{Polling, RefreshPhase, Snapshot, Synchronizer};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{BarChart, Block, Borders, Cell, Clear, Paragraph, Row, Table, Tabs, Wrap},
    Frame, Terminal,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tui_big_text::{BigText, PixelSize};

fn format_with_commas(value: Decimal) -> String {
    let formatted = format!("{value:.2}");
    let (sign, digits) = match formatted.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", formatted.as_str()),
    };
    let mut parts = digits.split('.');
    let integer_part = parts.next().unwrap_or("0");
    let decimal_part = parts.next().unwrap_or("00");

    let formatted_integer = integer_part
        .chars()
        .rev()
        .collect::<Vec<_>>()
        .chunks(3)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(",")
        .chars()
        .rev()
        .collect::<String>();

    format!("{sign}{formatted_integer}.{decimal_part}")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tab {
    Overview,
    Holdings,
}

impl Tab {
    fn title(self) -> &'static str {
        match self {
            Tab::Overview => "Overview & Distribution",
            Tab::Holdings => "Holdings",
        }
    }

    fn all() -> &'static [Tab] {
        &[Tab::Overview, Tab::Holdings]
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "overview" => Some(Tab::Overview),
            "holdings" => Some(Tab::Holdings),
            _ => None,
        }
    }
}

/// Add/edit form state.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingForm {
    /// Ticker being edited, or `None` when adding.
    pub editing: Option<String>,
    pub draft: HoldingDraft,
    pub focus: Field,
    pub errors: ValidationErrors,
    /// Error reported by the service for the last submission.
    pub message: Option<String>,
}

const FIELDS: [Field; 4] = [
    Field::CompanyName,
    Field::TickerSymbol,
    Field::Price,
    Field::Quantity,
];

impl HoldingForm {
    pub fn add() -> Self {
        HoldingForm {
            editing: None,
            draft: HoldingDraft::default(),
            focus: Field::CompanyName,
            errors: ValidationErrors::default(),
            message: None,
        }
    }

    pub fn edit(holding: &EnrichedHolding) -> Self {
        HoldingForm {
            editing: Some(holding.ticker().to_string()),
            draft: HoldingDraft::from_holding(&holding.holding),
            ..HoldingForm::add()
        }
    }

    fn title(&self) -> &'static str {
        if self.editing.is_some() {
            " Edit Stock "
        } else {
            " Add New Stock "
        }
    }

    fn is_locked(&self, field: Field) -> bool {
        // the ticker addresses the holding being edited
        self.editing.is_some() && field == Field::TickerSymbol
    }

    fn value(&self, field: Field) -> &str {
        match field {
            Field::CompanyName => &self.draft.company_name,
            Field::TickerSymbol => &self.draft.ticker_symbol,
            Field::Price => &self.draft.price,
            Field::Quantity => &self.draft.quantity,
        }
    }

    fn value_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::CompanyName => &mut self.draft.company_name,
            Field::TickerSymbol => &mut self.draft.ticker_symbol,
            Field::Price => &mut self.draft.price,
            Field::Quantity => &mut self.draft.quantity,
        }
    }

    fn move_focus(&mut self, step: isize) {
        let current = FIELDS.iter().position(|f| *f == self.focus).unwrap_or(0) as isize;
        let len = FIELDS.len() as isize;
        let mut next = (current + step).rem_euclid(len);
        if self.is_locked(FIELDS[next as usize]) {
            next = (next + step).rem_euclid(len);
        }
        self.focus = FIELDS[next as usize];
    }

    fn push(&mut self, c: char) {
        if !self.is_locked(self.focus) {
            self.value_mut(self.focus).push(c);
        }
    }

    fn pop(&mut self) {
        if !self.is_locked(self.focus) {
            self.value_mut(self.focus).pop();
        }
    }
}

fn field_label(field: Field) -> &'static str {
    match field {
        Field::CompanyName => "Company Name",
        Field::TickerSymbol => "Ticker Symbol",
        Field::Price => "Price",
        Field::Quantity => "Quantity",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppMode {
    Normal,
    Form(HoldingForm),
    ConfirmDelete(String),
}

/// A user intent that needs the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(HoldingDraft),
    Update(String, HoldingDraft),
    Delete(String),
    UpdatePrice(String),
    Refresh,
}

impl Action {
    fn from_form(&self) -> bool {
        matches!(self, Action::Create(_) | Action::Update(..))
    }
}

/// A finished action and what the service answered.
pub type ActionResult = (Action, Result<String, StoreError>);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

pub struct App {
    pub current_tab: Tab,
    pub snapshot: Snapshot,
    pub loaded: bool,
    pub should_quit: bool,
    pub error_message: Option<String>,
    pub status_message: Option<String>,
    pub metrics_source: MetricsSource,
    pub previous_prices: HashMap<String, Decimal>,
    pub trends: HashMap<String, Trend>,
    pub flash_state: bool,
    pub mode: AppMode,
    pub selected: usize,
    /// Actions sent to the service that have not answered yet.
    pub pending: usize,
    pub phase: RefreshPhase,
    pub polling: bool,
}

impl App {
    pub fn new(metrics_source: MetricsSource) -> App {
        App {
            current_tab: Tab::Overview,
            snapshot: Snapshot::default(),
            loaded: false,
            should_quit: false,
            error_message: None,
            status_message: None,
            metrics_source,
            previous_prices: HashMap::new(),
            trends: HashMap::new(),
            flash_state: false,
            mode: AppMode::Normal,
            selected: 0,
            pending: 0,
            phase: RefreshPhase::Idle,
            polling: false,
        }
    }

    pub fn try_receive_snapshot(&mut self, receiver: &mut watch::Receiver<Snapshot>) -> bool {
        if let Ok(true) = receiver.has_changed() {
            let snapshot = receiver.borrow_and_update().clone();
            self.set_snapshot(snapshot);
            return true;
        }
        false
    }

    pub fn set_snapshot(&mut self, snapshot: Snapshot) {
        self.update_trends(&snapshot);
        self.loaded = snapshot.cycle > 0;
        self.snapshot = snapshot;
        self.selected = self
            .selected
            .min(self.snapshot.holdings.len().saturating_sub(1));
        self.mark_refreshed();
    }

    pub fn next_tab(&mut self) {
        let tabs = Tab::all();
        let current_index = tabs
            .iter()
            .position(|&t| t == self.current_tab)
            .unwrap_or(0);
        self.current_tab = tabs[(current_index + 1) % tabs.len()];
    }

    pub fn previous_tab(&mut self) {
        let tabs = Tab::all();
        let current_index = tabs
            .iter()
            .position(|&t| t == self.current_tab)
            .unwrap_or(0);
        self.current_tab = tabs[(current_index + tabs.len() - 1) % tabs.len()];
    }

    pub fn update_trends(&mut self, snapshot: &Snapshot) {
        for position in &snapshot.holdings {
            let ticker = position.ticker().to_string();
            let current = position.current_price;

            let trend = match self.previous_prices.get(&ticker) {
                Some(&previous) if current > previous => Trend::Up,
                Some(&previous) if current < previous => Trend::Down,
                // unchanged keeps the last direction
                Some(_) => self.trends.get(&ticker).copied().unwrap_or(Trend::Neutral),
                None => Trend::Neutral,
            };
            self.trends.insert(ticker.clone(), trend);
            self.previous_prices.insert(ticker, current);
        }
    }

    pub fn mark_refreshed(&mut self) {
        self.flash_state = !self.flash_state;
    }

    pub fn get_trend_color(&self, ticker: &str, base_color: Color) -> Color {
        match self.trends.get(ticker) {
            Some(Trend::Up) => {
                if self.flash_state {
                    Color::LightGreen
                } else {
                    Color::Green
                }
            }
            Some(Trend::Down) => {
                if self.flash_state {
                    Color::LightRed
                } else {
                    Color::Red
                }
            }
            _ => base_color,
        }
    }

    pub fn select_next(&mut self) {
        if self.selected < self.snapshot.holdings.len().saturating_sub(1) {
            self.selected += 1;
        }
    }

    pub fn select_previous(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn selected_holding(&self) -> Option<&EnrichedHolding> {
        self.snapshot.holdings.get(self.selected)
    }

    /// Apply a key press, returning the remote action it asks for, if any.
    pub fn handle_key(&mut self, key: KeyCode) -> Option<Action> {
        if self.error_message.is_some() {
            self.error_message = None;
            return None;
        }

        match std::mem::replace(&mut self.mode, AppMode::Normal) {
            AppMode::Normal => self.handle_normal_key(key),
            AppMode::Form(form) => self.handle_form_key(form, key),
            AppMode::ConfirmDelete(ticker) => match key {
                KeyCode::Char('y') | KeyCode::Enter => Some(Action::Delete(ticker)),
                _ => None,
            },
        }
    }

    fn handle_normal_key(&mut self, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('h') | KeyCode::Left | KeyCode::BackTab => self.previous_tab(),
            KeyCode::Char('l') | KeyCode::Right | KeyCode::Tab => self.next_tab(),
            KeyCode::Char('1') => self.current_tab = Tab::Overview,
            KeyCode::Char('2') => self.current_tab = Tab::Holdings,
            KeyCode::Char('j') | KeyCode::Down => self.select_next(),
            KeyCode::Char('k') | KeyCode::Up => self.select_previous(),
            KeyCode::Char('m') => {
                self.metrics_source = match self.metrics_source {
                    MetricsSource::Local => MetricsSource::Remote,
                    MetricsSource::Remote => MetricsSource::Local,
                };
            }
            KeyCode::Char('r') => return Some(Action::Refresh),
            KeyCode::Char('a') => self.mode = AppMode::Form(HoldingForm::add()),
            KeyCode::Char('e') if self.current_tab == Tab::Holdings => {
                if let Some(holding) = self.selected_holding() {
                    self.mode = AppMode::Form(HoldingForm::edit(holding));
                }
            }
            KeyCode::Char('d') if self.current_tab == Tab::Holdings => {
                if let Some(holding) = self.selected_holding() {
                    self.mode = AppMode::ConfirmDelete(holding.ticker().to_string());
                }
            }
            KeyCode::Char('u') if self.current_tab == Tab::Holdings => {
                if let Some(holding) = self.selected_holding() {
                    return Some(Action::UpdatePrice(holding.ticker().to_string()));
                }
            }
            _ => {}
        }
        None
    }

    fn handle_form_key(&mut self, mut form: HoldingForm, key: KeyCode) -> Option<Action> {
        match key {
            KeyCode::Esc => return None,
            KeyCode::Tab | KeyCode::Down => form.move_focus(1),
            KeyCode::BackTab | KeyCode::Up => form.move_focus(-1),
            KeyCode::Backspace => form.pop(),
            KeyCode::Char(c) => form.push(c),
            // one submission at a time
            KeyCode::Enter if self.pending > 0 => {}
            KeyCode::Enter => {
                form.message = None;
                form.errors = match form.draft.validate() {
                    Ok(_) => ValidationErrors::default(),
                    Err(errors) => errors,
                };
                if form.errors.is_empty() {
                    let action = match &form.editing {
                        Some(ticker) => Action::Update(ticker.clone(), form.draft.clone()),
                        None => Action::Create(form.draft.clone()),
                    };
                    // stays open until the service confirms
                    self.mode = AppMode::Form(form);
                    return Some(action);
                }
            }
            _ => {}
        }
        self.mode = AppMode::Form(form);
        None
    }

    /// Record the answer to an action returned by [`App::handle_key`].
    pub fn finish_action(&mut self, action: &Action, result: Result<String, StoreError>) {
        self.pending = self.pending.saturating_sub(1);
        let in_form = action.from_form() && matches!(self.mode, AppMode::Form(_));

        let e = match result {
            Ok(status) => {
                if in_form {
                    self.mode = AppMode::Normal;
                }
                self.status_message = Some(status);
                return;
            }
            Err(e) => e,
        };

        match e.kind() {
            // the edited holding is gone, so the form cannot be saved
            ErrorKind::NotFound if in_form => {
                self.mode = AppMode::Normal;
                self.error_message = Some(e.user_message());
            }
            _ if in_form => {
                if let AppMode::Form(form) = &mut self.mode {
                    match e {
                        StoreError::Validation(errors) => form.errors = errors,
                        other => form.message = Some(other.user_message()),
                    }
                }
            }
            _ => self.error_message = Some(e.user_message()),
        }
    }
}

async fn perform<S: RemoteStore + 'static>(
    sync: &Synchronizer<S>,
    action: Action,
) -> Result<String, StoreError> {
    match action {
        Action::Create(draft) => sync
            .create(&draft)
            .await
            .map(|h| format!("Added {}", h.ticker_symbol)),
        Action::Update(ticker, draft) => sync
            .update(&ticker, &draft)
            .await
            .map(|_| format!("Updated {ticker}")),
        Action::Delete(ticker) => sync
            .delete(&ticker)
            .await
            .map(|_| format!("Deleted {ticker}")),
        Action::UpdatePrice(ticker) => sync
            .update_price(&ticker)
            .await
            .map(|h| format!("Updated price of {ticker} to {:.2}", h.price)),
        Action::Refresh => sync.refresh().await.map(|_| "Refreshed".to_string()),
    }
}

/// Run `action` in the background and report its answer on `results`.
fn dispatch<S: RemoteStore + 'static>(
    sync: &Arc<Synchronizer<S>>,
    action: Action,
    results: &mpsc::UnboundedSender<ActionResult>,
) {
    let sync = Arc::clone(sync);
    let results = results.clone();
    tokio::spawn(async move {
        let result = perform(&sync, action.clone()).await;
        let _ = results.send((action, result));
    });
}

pub async fn run_tui<S: RemoteStore + 'static>(
    sync: Arc<Synchronizer<S>>,
    holdings_every: Duration,
    metrics_every: Duration,
    metrics_source: MetricsSource,
    tab: Option<Tab>,
) -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(metrics_source);
    if let Some(tab) = tab {
        app.current_tab = tab;
    }

    let mut receiver = sync.subscribe();
    let mut polling = sync.start_polling(holdings_every, metrics_every);

    let res = run_app(&mut terminal, &mut app, &sync, &polling, &mut receiver).await;
    polling.stop();

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

async fn run_app<S: RemoteStore + 'static>(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    sync: &Arc<Synchronizer<S>>,
    polling: &Polling,
    receiver: &mut watch::Receiver<Snapshot>,
) -> io::Result<()> {
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<ActionResult>();

    loop {
        app.try_receive_snapshot(receiver);
        app.phase = sync.phase();
        app.polling = polling.is_running();
        while let Ok((action, result)) = results_rx.try_recv() {
            app.finish_action(&action, result);
        }

        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(action) = app.handle_key(key.code) {
                        app.pending += 1;
                        dispatch(sync, action, &results_tx);
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(f.area());

    let tab_titles: Vec<Line> = Tab::all()
        .iter()
        .map(|t| {
            let style = if *t == app.current_tab {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::White)
            };
            Line::from(Span::styled(t.title(), style))
        })
        .collect();

    let tabs = Tabs::new(tab_titles)
        .block(Block::default().borders(Borders::ALL).title("Stockwatch"))
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Yellow))
        .select(
            Tab::all()
                .iter()
                .position(|&t| t == app.current_tab)
                .unwrap_or(0),
        );
    f.render_widget(tabs, chunks[0]);

    match app.current_tab {
        Tab::Overview => render_overview(f, chunks[1], app),
        Tab::Holdings => render_holdings(f, chunks[1], app),
    }

    render_status_line(f, chunks[2], app);

    match &app.mode {
        AppMode::Form(form) => render_form(f, form),
        AppMode::ConfirmDelete(ticker) => render_confirm_delete(f, ticker),
        AppMode::Normal => {}
    }

    if let Some(error) = &app.error_message {
        render_error_popup(f, error);
    }
}

fn render_status_line(f: &mut Frame, area: Rect, app: &App) {
    let updated = app
        .snapshot
        .updated_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let source = match app.metrics_source {
        MetricsSource::Local => "local",
        MetricsSource::Remote => "remote",
    };
    let mut text = format!(
        " updated {updated} | cycle #{} | metrics: {source}",
        app.snapshot.cycle
    );
    match app.phase {
        RefreshPhase::ListFetching => text.push_str(" | fetching holdings"),
        RefreshPhase::QuoteFetching(n) => text.push_str(&format!(" | fetching {n} quotes")),
        RefreshPhase::Idle | RefreshPhase::Merged => {}
    }
    if !app.polling {
        text.push_str(" | polling stopped");
    }
    if app.pending > 0 {
        text.push_str(" | working...");
    }
    if let Some(status) = &app.status_message {
        text.push_str(&format!(" | {status}"));
    }

    f.render_widget(
        Paragraph::new(text).style(Style::default().fg(Color::Gray)),
        area,
    );
}

fn render_distribution(f: &mut Frame, area: Rect, app: &App) {
    let metrics = app.snapshot.metrics_from(app.metrics_source);
    let data: Vec<(&str, u64)> = metrics
        .distribution
        .iter()
        .map(|(ticker, price)| (ticker.as_str(), price.round().to_u64().unwrap_or(0)))
        .collect();

    let barchart = BarChart::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Portfolio Distribution"),
        )
        .data(&data)
        .bar_width(7)
        .bar_style(Style::default().fg(Color::Magenta))
        .value_style(Style::default().fg(Color::Black).bg(Color::Magenta));

    f.render_widget(barchart, area);
}

fn render_overview(f: &mut Frame, area: Rect, app: &App) {
    if !app.loaded {
        render_loading(f, area);
        return;
    }

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(7),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(area);

    let metrics = app.snapshot.metrics_from(app.metrics_source);

    // Total portfolio value
    let big_text_value = format!("${}", format_with_commas(metrics.total_value));
    let big_text = BigText::builder()
        .pixel_size(PixelSize::Quadrant)
        .style(
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
        )
        .lines(vec![big_text_value.clone().into()])
        .build();

    let refresh_indicator = if app.flash_state { "*" } else { " " };
    let big_text_widget = Block::default()
        .borders(Borders::ALL)
        .title(format!("Total Portfolio Value {refresh_indicator}"))
        .title_alignment(Alignment::Center);
    f.render_widget(big_text_widget, main_chunks[0]);

    let inner = main_chunks[0].inner(ratatui::layout::Margin {
        horizontal: 1,
        vertical: 1,
    });
    let big_text_width = big_text_value.len() as u16 * 4; // approximate width per glyph
    let centered_area = if big_text_width < inner.width {
        let margin = (inner.width - big_text_width) / 2;
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length(margin),
                Constraint::Min(0),
                Constraint::Length(margin),
            ])
            .split(inner)[1]
    } else {
        inner
    };
    f.render_widget(big_text, centered_area);

    let top = metrics.top_holding_label();
    let top_paragraph = Paragraph::new(Line::from(vec![
        Span::styled("Top holding: ", Style::default().fg(Color::Gray)),
        Span::styled(
            top.to_string(),
            Style::default()
                .fg(app.get_trend_color(top, Color::Cyan))
                .add_modifier(Modifier::BOLD),
        ),
    ]))
    .block(Block::default().borders(Borders::ALL))
    .alignment(Alignment::Center);
    f.render_widget(top_paragraph, main_chunks[1]);

    render_distribution(f, main_chunks[2], app);

    let help_text = Paragraph::new(
        "h/l (tabs) | a (add) | r (refresh) | m (local/remote metrics) | 1-2 (direct) | q (quit)",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"))
    .style(Style::default().fg(Color::Gray))
    .alignment(Alignment::Center);
    f.render_widget(help_text, main_chunks[3]);
}

fn render_holdings(f: &mut Frame, area: Rect, app: &App) {
    if !app.loaded {
        render_loading(f, area);
        return;
    }

    let header_cells = [
        "Stock",
        "Ticker",
        "Quantity",
        "Buy Price",
        "Current Price",
        "Profit/Loss",
    ]
    .iter()
    .map(|h| {
        Cell::from(*h).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    });
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows = app
        .snapshot
        .holdings
        .iter()
        .enumerate()
        .map(|(i, position)| {
            let holding = &position.holding;
            let price_color = app.get_trend_color(position.ticker(), Color::White);
            let pnl_color = if position.profit_or_loss >= Decimal::ZERO {
                Color::Green
            } else {
                Color::Red
            };

            let row_style = if i == app.selected {
                Style::default().bg(Color::DarkGray)
            } else {
                Style::default()
            };

            Row::new(vec![
                Cell::from(holding.company_name.clone()),
                Cell::from(holding.ticker_symbol.clone()),
                Cell::from(holding.quantity.to_string()),
                Cell::from(format!("${:.2}", holding.price)),
                Cell::from(format!("${:.2}", position.current_price))
                    .style(Style::default().fg(price_color)),
                Cell::from(format_signed(position.profit_or_loss))
                    .style(Style::default().fg(pnl_color)),
            ])
            .height(1)
            .style(row_style)
        });

    let constraints = [
        Constraint::Percentage(30),
        Constraint::Percentage(12),
        Constraint::Percentage(12),
        Constraint::Percentage(15),
        Constraint::Percentage(16),
        Constraint::Percentage(15),
    ];

    let table_title = "Current Holdings - j/k (select) | a (add) | e (edit) | u (update price) | d (delete)";
    let table = Table::new(rows, constraints)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(table_title))
        .style(Style::default().fg(Color::White));

    f.render_widget(table, area);
}

fn render_loading(f: &mut Frame, area: Rect) {
    let loading_text = Paragraph::new("Loading portfolio data...")
        .block(Block::default().borders(Borders::ALL).title("Loading"))
        .style(Style::default().fg(Color::Yellow))
        .alignment(Alignment::Center);

    f.render_widget(loading_text, area);
}

fn render_form(f: &mut Frame, form: &HoldingForm) {
    let popup_area = centered_rect(60, 60, f.area());
    f.render_widget(Clear, popup_area);

    let main_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(form.title())
        .title_alignment(Alignment::Center)
        .style(Style::default().bg(Color::Black));
    f.render_widget(main_block, popup_area);

    let mut constraints = vec![Constraint::Length(1)];
    constraints.extend(FIELDS.iter().map(|_| Constraint::Length(4)));
    constraints.push(Constraint::Min(0));
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .margin(1)
        .split(popup_area);

    let message = Paragraph::new(form.message.clone().unwrap_or_default())
        .style(Style::default().fg(Color::Red))
        .alignment(Alignment::Center);
    f.render_widget(message, layout[0]);

    for (i, field) in FIELDS.iter().enumerate() {
        let focused = form.focus == *field;
        let error = form.errors.for_field(*field);
        let border_color = match (error, focused) {
            (Some(_), _) => Color::Red,
            (None, true) => Color::Yellow,
            (None, false) if form.is_locked(*field) => Color::DarkGray,
            (None, false) => Color::Gray,
        };
        let cursor = if focused { "_" } else { "" };

        let mut lines = vec![Line::from(format!("{}{cursor}", form.value(*field)))];
        if let Some(error) = error {
            lines.push(Line::from(Span::styled(
                error.to_string(),
                Style::default().fg(Color::Red),
            )));
        }

        let input = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border_color))
                .title(format!(" {} ", field_label(*field))),
        );
        f.render_widget(input, layout[i + 1]);
    }

    let instructions = Paragraph::new("Enter: Submit | Tab: Next field | Esc: Cancel")
        .style(Style::default().fg(Color::Cyan))
        .alignment(Alignment::Center);
    f.render_widget(instructions, layout[FIELDS.len() + 1]);
}

fn render_confirm_delete(f: &mut Frame, ticker: &str) {
    let popup_area = centered_rect(40, 20, f.area());
    f.render_widget(Clear, popup_area);

    let paragraph = Paragraph::new(format!("Delete {ticker}? (y/n)"))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Confirm")
                .style(Style::default().fg(Color::Yellow)),
        )
        .alignment(Alignment::Center);
    f.render_widget(paragraph, popup_area);
}

fn render_error_popup(f: &mut Frame, error: &str) {
    let popup_area = centered_rect(60, 20, f.area());
    f.render_widget(Clear, popup_area);

    let error_paragraph = Paragraph::new(error)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Error")
                .style(Style::default().fg(Color::Red)),
        )
        .style(Style::default().fg(Color::White))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });

    f.render_widget(error_paragraph, popup_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::holding::Holding;
    use crate::portfolio::{aggregate, PortfolioMetrics};
    use rust_decimal_macros::dec;

    fn snapshot(cycle: u64, prices: &[(&str, Decimal)]) -> Snapshot {
        let holdings: Vec<EnrichedHolding> = prices
            .iter()
            .map(|(ticker, current)| {
                EnrichedHolding::with_quote(Holding::new(ticker, ticker, dec!(100), 1), *current)
            })
            .collect();
        let mut snapshot = Snapshot::default();
        snapshot.cycle = cycle;
        snapshot.metrics = aggregate(&holdings);
        snapshot.holdings = holdings;
        snapshot
    }

    fn loaded_app() -> App {
        let mut app = App::new(MetricsSource::Local);
        app.set_snapshot(snapshot(1, &[("AAPL", dec!(100)), ("MSFT", dec!(100))]));
        app.current_tab = Tab::Holdings;
        app
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            assert_eq!(app.handle_key(KeyCode::Char(c)), None);
        }
    }

    #[test]
    fn test_tab_navigation() {
        let mut app = App::new(MetricsSource::Local);
        assert_eq!(app.current_tab, Tab::Overview);
        app.handle_key(KeyCode::Char('l'));
        assert_eq!(app.current_tab, Tab::Holdings);
        app.handle_key(KeyCode::Char('l'));
        assert_eq!(app.current_tab, Tab::Overview);
        app.handle_key(KeyCode::Char('h'));
        assert_eq!(app.current_tab, Tab::Holdings);
        app.handle_key(KeyCode::Char('1'));
        assert_eq!(app.current_tab, Tab::Overview);
        assert_eq!(Tab::from_str("HOLDINGS"), Some(Tab::Holdings));
        assert_eq!(Tab::from_str("balances"), None);
    }

    #[test]
    fn test_trends_follow_current_price() {
        let mut app = loaded_app();
        assert_eq!(app.trends["AAPL"], Trend::Neutral);

        app.set_snapshot(snapshot(2, &[("AAPL", dec!(110)), ("MSFT", dec!(90))]));
        assert_eq!(app.trends["AAPL"], Trend::Up);
        assert_eq!(app.trends["MSFT"], Trend::Down);

        app.set_snapshot(snapshot(3, &[("AAPL", dec!(110)), ("MSFT", dec!(90))]));
        assert_eq!(app.trends["AAPL"], Trend::Up);
        assert_eq!(app.trends["MSFT"], Trend::Down);
    }

    #[test]
    fn test_selection_is_clamped_when_holdings_shrink() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('j'));
        app.handle_key(KeyCode::Char('j'));
        assert_eq!(app.selected, 1);

        app.set_snapshot(snapshot(2, &[("AAPL", dec!(100))]));
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn test_form_reports_every_field_error_without_submitting() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('a'));
        assert_eq!(app.handle_key(KeyCode::Enter), None);

        let AppMode::Form(form) = &app.mode else {
            panic!("form should stay open");
        };
        assert_eq!(form.errors.iter().count(), 4);
        assert_eq!(
            form.errors.for_field(Field::TickerSymbol),
            Some(&ValidationError::TickerRequired)
        );
    }

    #[test]
    fn test_form_submits_create_action() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('a'));
        type_text(&mut app, "Tesla");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "TSLA");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "250.5");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "3");

        let action = app.handle_key(KeyCode::Enter).unwrap();
        assert_eq!(
            action,
            Action::Create(HoldingDraft::new("Tesla", "TSLA", "250.5", "3"))
        );

        app.finish_action(
            &action,
            Err(StoreError::Conflict("ticker_symbol".to_string())),
        );
        let AppMode::Form(form) = &app.mode else {
            panic!("form should stay open after a conflict");
        };
        assert_eq!(
            form.message.as_deref(),
            Some("A stock with this ticker symbol already exists.")
        );

        app.finish_action(&action, Ok("Added TSLA".to_string()));
        assert_eq!(app.mode, AppMode::Normal);
        assert_eq!(app.status_message.as_deref(), Some("Added TSLA"));
    }

    #[test]
    fn test_edit_locks_the_ticker() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('e'));
        // company name is focused; tab skips the locked ticker
        app.handle_key(KeyCode::Tab);
        let AppMode::Form(form) = &app.mode else {
            panic!("edit form should be open");
        };
        assert_eq!(form.focus, Field::Price);

        app.handle_key(KeyCode::Backspace);
        app.handle_key(KeyCode::Backspace);
        app.handle_key(KeyCode::Backspace);
        type_text(&mut app, "120");
        assert_eq!(
            app.handle_key(KeyCode::Enter),
            Some(Action::Update(
                "AAPL".to_string(),
                HoldingDraft::new("AAPL", "AAPL", "120", "1")
            ))
        );
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('j'));
        assert_eq!(app.handle_key(KeyCode::Char('d')), None);
        assert_eq!(app.mode, AppMode::ConfirmDelete("MSFT".to_string()));
        assert_eq!(app.handle_key(KeyCode::Char('n')), None);
        assert_eq!(app.mode, AppMode::Normal);

        app.handle_key(KeyCode::Char('d'));
        assert_eq!(
            app.handle_key(KeyCode::Char('y')),
            Some(Action::Delete("MSFT".to_string()))
        );
    }

    #[test]
    fn test_errors_outside_form_open_popup_until_key_press() {
        let mut app = loaded_app();
        let action = app.handle_key(KeyCode::Char('u')).unwrap();
        assert_eq!(action, Action::UpdatePrice("AAPL".to_string()));
        app.finish_action(&action, Err(StoreError::NotFound("AAPL".to_string())));
        assert_eq!(
            app.error_message.as_deref(),
            Some("No stock with ticker AAPL exists.")
        );

        assert_eq!(app.handle_key(KeyCode::Char('q')), None);
        assert!(app.error_message.is_none());
        assert!(!app.should_quit);
    }

    #[test]
    fn test_editing_a_deleted_holding_closes_the_form() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('e'));
        let action = app.handle_key(KeyCode::Enter).unwrap();
        app.finish_action(&action, Err(StoreError::NotFound("AAPL".to_string())));
        assert_eq!(app.mode, AppMode::Normal);
        assert_eq!(
            app.error_message.as_deref(),
            Some("No stock with ticker AAPL exists.")
        );
    }

    #[test]
    fn test_unrelated_answer_leaves_form_open() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('a'));
        app.finish_action(
            &Action::UpdatePrice("MSFT".to_string()),
            Ok("Updated price of MSFT to 310.00".to_string()),
        );
        assert!(matches!(app.mode, AppMode::Form(_)));
    }

    /// Holds every create until `release` is notified.
    #[derive(Default)]
    struct SlowStore {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for SlowStore {
        async fn list_holdings(&self) -> Result<Vec<Holding>, StoreError> {
            Ok(Vec::new())
        }

        async fn get_quote(&self, ticker: &str) -> Result<Decimal, StoreError> {
            Err(StoreError::QuoteUnavailable {
                ticker: ticker.to_string(),
                reason: "closed".to_string(),
            })
        }

        async fn create_holding(&self, holding: &Holding) -> Result<Holding, StoreError> {
            self.release.notified().await;
            Ok(holding.clone())
        }

        async fn update_holding(
            &self,
            ticker: &str,
            _holding: &Holding,
        ) -> Result<Holding, StoreError> {
            Err(StoreError::NotFound(ticker.to_string()))
        }

        async fn update_price(&self, ticker: &str) -> Result<Holding, StoreError> {
            Err(StoreError::NotFound(ticker.to_string()))
        }

        async fn delete_holding(&self, ticker: &str) -> Result<(), StoreError> {
            Err(StoreError::NotFound(ticker.to_string()))
        }

        async fn get_aggregate_metrics(&self) -> Result<PortfolioMetrics, StoreError> {
            Err(StoreError::network("closed"))
        }
    }

    #[tokio::test]
    async fn test_dispatched_action_runs_in_background() {
        let store = SlowStore::default();
        let release = Arc::clone(&store.release);
        let sync = Arc::new(Synchronizer::new(store));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('a'));
        type_text(&mut app, "Tesla");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "TSLA");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "250");
        app.handle_key(KeyCode::Tab);
        type_text(&mut app, "3");
        let action = app.handle_key(KeyCode::Enter).unwrap();
        app.pending += 1;
        dispatch(&sync, action, &results_tx);

        // keys keep working while the create is in flight
        tokio::task::yield_now().await;
        assert!(results_rx.try_recv().is_err());
        assert_eq!(app.handle_key(KeyCode::Enter), None);
        app.handle_key(KeyCode::Tab);
        assert!(matches!(&app.mode, AppMode::Form(f) if f.focus == Field::CompanyName));

        release.notify_one();
        let (action, result) = results_rx.recv().await.unwrap();
        app.finish_action(&action, result);
        assert_eq!(app.pending, 0);
        assert_eq!(app.mode, AppMode::Normal);
        assert_eq!(app.status_message.as_deref(), Some("Added TSLA"));
        assert_eq!(sync.snapshot().holdings.len(), 1);
    }

    #[test]
    fn test_metrics_source_toggle() {
        let mut app = loaded_app();
        app.handle_key(KeyCode::Char('m'));
        assert_eq!(app.metrics_source, MetricsSource::Remote);
        app.handle_key(KeyCode::Char('m'));
        assert_eq!(app.metrics_source, MetricsSource::Local);
    }

    #[test]
    fn test_format_with_commas() {
        assert_eq!(format_with_commas(dec!(1234567.891)), "1,234,567.89");
        assert_eq!(format_with_commas(dec!(2100)), "2,100.00");
        assert_eq!(format_with_commas(dec!(12.5)), "12.50");
        assert_eq!(format_with_commas(dec!(-1500)), "-1,500.00");
    }
}
