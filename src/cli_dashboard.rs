//! Overview (workers and pool metrics)
//! Queue (tasks waiting for an idle worker)
//! Tasks (most recent tasks and their outcome)

use std::{
  env,
  io,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tokio::runtime::Runtime;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};

use lmpool::models::{Metrics, Task, TaskStatus, Worker};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECENT_TASKS: usize = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Tasks,
}

#[derive(Default)]
struct Snapshot {
  workers: Vec<Worker>,
  metrics: Option<Metrics>,
  tasks: Vec<Task>,
  error: Option<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      snapshot: Snapshot::default(),
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Tasks,
      DashboardTab::Tasks => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Tasks,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Tasks => DashboardTab::Queue,
    }
  }

  fn queued(&self) -> impl Iterator<Item = &Task> {
    self.snapshot.tasks.iter().filter(|t| t.status == TaskStatus::Queued)
  }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: String) -> Result<T, reqwest::Error> {
  client.get(url).send().await?.error_for_status()?.json().await
}

async fn fetch_snapshot(client: &reqwest::Client, base: &str) -> Snapshot {
  let (workers, metrics, tasks) = futures::future::join3(
    fetch_json::<Vec<Worker>>(client, format!("{}/workers", base)),
    fetch_json::<Metrics>(client, format!("{}/health/metrics", base)),
    fetch_json::<Vec<Task>>(client, format!("{}/generate/tasks", base)),
  )
    .await;

  match (workers, metrics, tasks) {
    (Ok(workers), Ok(metrics), Ok(tasks)) => Snapshot { workers, metrics: Some(metrics), tasks, error: None },
    (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Snapshot { error: Some(e.to_string()), ..Snapshot::default() },
  }
}

fn main() -> anyhow::Result<()> {
  let base = env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into());
  let base = base.trim_end_matches('/').to_string();
  let rt = Runtime::new().context("starting the polling runtime")?;

  let (tx, rx) = mpsc::channel::<Snapshot>();
  thread::spawn(move || {
    let client = reqwest::Client::new();
    loop {
      let snapshot = rt.block_on(fetch_snapshot(&client, &base));
      if tx.send(snapshot).is_err() {
        break;
      }
      thread::sleep(POLL_INTERVAL);
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Overview", "Queue", "Tasks"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("lmpool"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Tasks => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Tasks => render_tasks(f, app, chunks[1]),
  }

  let footer_text = match &app.snapshot.error {
    Some(e) => format!("Coordinator unreachable: {} | q: Quit", e),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
    .split(area);

  let worker_items: Vec<ListItem> = app.snapshot.workers.iter().map(|w| {
    let ping = w.ping.map(|p| format!("{} ms", p)).unwrap_or_else(|| "n/a".into());
    let state = if w.busy { "busy" } else { "idle" };
    let lines = vec![
      Spans::from(Span::styled(format!("ID: {}", w.id), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(Span::raw(format!("{} ({})", w.address, w.model_name))),
      Spans::from(Span::raw(format!("State: {} | Ping: {}", state, ping))),
      Spans::from(Span::raw(format!("Last update: {}", w.last_update.format("%Y-%m-%d %H:%M:%S")))),
    ];
    ListItem::new(lines)
  }).collect();

  let workers_list = List::new(worker_items)
    .block(Block::default().borders(Borders::ALL).title("Workers"))
    .highlight_style(Style::default().bg(Color::Blue));
  f.render_widget(workers_list, chunks[0]);

  let metrics = match &app.snapshot.metrics {
    Some(m) => vec![
      ListItem::new(Span::raw(format!("Active workers: {}", m.active_workers))),
      ListItem::new(Span::raw(format!("Busy workers: {}", m.busy_workers))),
      ListItem::new(Span::raw(format!("Average ping: {:.1} ms", m.avg_ping))),
      ListItem::new(Span::raw(format!("Queued tasks: {}", app.queued().count()))),
    ],
    None => vec![ListItem::new(Span::raw("No metrics yet"))],
  };
  let metrics_list = List::new(metrics)
    .block(Block::default().borders(Borders::ALL).title("Pool"));
  f.render_widget(metrics_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.queued().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("caller {} | count {} | since {}", t.callback.caller_id, t.request.count, t.created_at.format("%H:%M:%S"))),
    ]))
  }).collect();
  let header = format!("Waiting for a worker ({})", task_items.len());
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn status_color(status: TaskStatus) -> Color {
  match status {
    TaskStatus::Queued => Color::Yellow,
    TaskStatus::Processing => Color::Cyan,
    TaskStatus::Done => Color::Green,
    TaskStatus::Failed => Color::Red,
  }
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.snapshot.tasks.iter().rev().take(RECENT_TASKS).map(|t| {
    let detail = match (&t.outcome, &t.error) {
      (_, Some(error)) => error.clone(),
      (Some(outcome), None) => format!("{:?}, {} items", outcome, t.result.as_ref().map_or(0, |r| r.len())),
      (None, None) => format!("round {}", t.validation_rounds),
    };
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:<10}", t.status.as_str()), Style::default().fg(status_color(t.status))),
      Span::raw(format!("{} - {}", t.id, detail)),
    ]))
  }).collect();
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title("Recent Tasks"));
  f.render_widget(tasks_list, area);
}
