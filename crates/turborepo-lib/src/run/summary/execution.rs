use chrono::{DateTime, Duration, Local};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::sync::mpsc;
use turbopath::AbsoluteSystemPathBuf;
use turborepo_ui::{color, cprintln, BOLD, BOLD_GREEN, BOLD_RED, MAGENTA, UI, YELLOW};

use crate::run::task_id::TaskId;

// Just used to make changing the type that gets passed to the state
// management task easy
type Message = Event;

/// Collects task terminal events over the run and reduces them to counts.
/// Trackers send events from their task's context; the single reducer task
/// is what makes each task count exactly once.
pub struct ExecutionTracker {
    state_thread: tokio::task::JoinHandle<SummaryState>,
    sender: mpsc::Sender<Message>,
}

/// The final states of all task executions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SummaryState {
    pub attempted: usize,
    pub failed: usize,
    pub cached: usize,
    pub success: usize,
}

impl SummaryState {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Building => self.attempted += 1,
            Event::BuildFailed => self.failed += 1,
            Event::Cached => self.cached += 1,
            Event::Built => self.success += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Building,
    BuildFailed,
    Cached,
    Built,
}

/// A tracker constructed for each task and used to communicate task events
/// back to the execution summary.
pub struct TaskTracker<T> {
    sender: mpsc::Sender<Message>,
    started_at: T,
    task_id: TaskId<'static>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Canceled,
    #[serde(rename_all = "camelCase")]
    Built { exit_code: i32 },
    Cached,
    #[serde(rename_all = "camelCase")]
    BuildFailed { exit_code: i32, err: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionSummary {
    started_at: DateTime<Local>,
    ended_at: DateTime<Local>,
    pub state: ExecutionState,
}

impl Serialize for TaskExecutionSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskExecutionSummary", 3)?;
        state.serialize_field("startedAt", &self.started_at.timestamp_millis())?;
        state.serialize_field("endedAt", &self.ended_at.timestamp_millis())?;
        state.serialize_field("state", &self.state)?;
        state.end()
    }
}

impl TaskExecutionSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::BuildFailed { exit_code, .. } | ExecutionState::Built { exit_code } => {
                Some(exit_code)
            }
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.state, ExecutionState::BuildFailed { .. })
    }

    pub fn duration(&self) -> Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration().num_milliseconds().max(0) as u64
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        // This buffer size is probably overkill, but since messages are only
        // a byte it's worth the extra memory to avoid the channel filling up.
        let (sender, mut receiver) = mpsc::channel(128);
        let state_thread = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(event) = receiver.recv().await {
                state.handle_event(event);
            }
            state
        });

        Self {
            state_thread,
            sender,
        }
    }

    // Produce a tracker for the task
    pub fn tracker(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        TaskTracker {
            sender: self.sender.clone(),
            task_id,
            started_at: (),
        }
    }

    pub async fn finish(self) -> Result<SummaryState, tokio::task::JoinError> {
        let Self {
            state_thread,
            sender,
            ..
        } = self;
        // Drop the sender so the channel closes once all trackers have
        // finished. We don't explicitly close as that would cause running
        // trackers to be unable to send their terminal event.
        drop(sender);

        state_thread.await
    }
}

impl TaskTracker<()> {
    // Start the tracker
    pub async fn start(self) -> TaskTracker<DateTime<Local>> {
        let TaskTracker {
            sender, task_id, ..
        } = self;
        let started_at = Local::now();
        sender
            .send(Event::Building)
            .await
            .expect("execution summary state thread finished");
        TaskTracker {
            sender,
            started_at,
            task_id,
        }
    }

    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }
}

impl TaskTracker<DateTime<Local>> {
    pub fn cancel(self) -> TaskExecutionSummary {
        let Self { started_at, .. } = self;
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Canceled,
        }
    }

    pub async fn cached(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Cached)
            .await
            .expect("summary state thread finished");

        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Cached,
        }
    }

    pub async fn build_succeeded(self, exit_code: i32) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Built)
            .await
            .expect("summary state thread finished");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Built { exit_code },
        }
    }

    pub async fn build_failed(
        self,
        exit_code: i32,
        error: impl std::fmt::Display,
    ) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::BuildFailed)
            .await
            .expect("summary state thread finished");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::BuildFailed {
                exit_code,
                err: error.to_string(),
            },
        }
    }
}

/// The serialized block of a persisted run summary, plus the end-of-run
/// status lines.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub command: String,
    pub success: usize,
    pub failed: usize,
    pub cached: usize,
    /// Nodes in the graph that never started: no-op barriers and dependents
    /// of failures.
    pub skipped: usize,
    pub attempted: usize,
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: i32,
}

impl ExecutionSummary {
    pub fn new(
        command: String,
        state: SummaryState,
        total_tasks: usize,
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
        exit_code: i32,
    ) -> Self {
        Self {
            command,
            success: state.success,
            failed: state.failed,
            cached: state.cached,
            skipped: total_tasks.saturating_sub(state.attempted),
            attempted: state.attempted,
            start_time: started_at.timestamp_millis(),
            end_time: ended_at.timestamp_millis(),
            exit_code,
        }
    }

    fn duration(&self) -> String {
        let duration = Duration::milliseconds(self.end_time - self.start_time);
        if duration.num_hours() > 0 {
            format!(
                "{}h{}m{}s",
                duration.num_hours(),
                duration.num_minutes() % 60,
                duration.num_seconds() % 60
            )
        } else if duration.num_minutes() > 0 {
            format!(
                "{}m{}s",
                duration.num_minutes(),
                duration.num_seconds() % 60
            )
        } else if duration.num_seconds() > 0 {
            format!("{}s", duration.num_seconds())
        } else {
            format!("{}ms", duration.num_milliseconds())
        }
    }

    /// The end-of-run status block: counts per terminal state, wall time,
    /// failed task list, and the full-cache banner when it's earned.
    pub fn print(&self, ui: UI, path: Option<AbsoluteSystemPathBuf>, failed_tasks: Vec<&TaskId>) {
        let maybe_full_turbo = if self.cached == self.attempted && self.attempted > 0 {
            color!(ui, MAGENTA, ">>> FULL TURBO")
        } else {
            String::new()
        };

        let mut line_data = vec![
            (
                "Tasks",
                format!(
                    "{}, {} total",
                    color!(ui, BOLD_GREEN, "{} successful", self.success),
                    self.attempted
                ),
            ),
            (
                "Cached",
                format!(
                    "{}, {} total",
                    color!(ui, BOLD, "{} cached", self.cached),
                    self.attempted
                ),
            ),
            (
                "Time",
                format!(
                    "{} {}",
                    color!(ui, BOLD, "{}", self.duration()),
                    maybe_full_turbo
                ),
            ),
        ];

        if self.failed > 0 || self.skipped > 0 {
            line_data.push((
                "Status",
                format!(
                    "{} failed, {} skipped",
                    color!(ui, BOLD_RED, "{}", self.failed),
                    self.skipped
                ),
            ));
        }

        if let Some(path) = path {
            line_data.push(("Summary", path.to_string()));
        }

        if !failed_tasks.is_empty() {
            let mut formatted: Vec<_> = failed_tasks
                .iter()
                .map(|task_id| color!(ui, BOLD_RED, "{task_id}"))
                .collect();
            formatted.sort();
            line_data.push(("Failed", formatted.join(", ")));
        }

        let max_length = line_data
            .iter()
            .map(|(header, _)| header.len())
            .max()
            .unwrap_or_default();

        if self.attempted == 0 {
            println!();
            cprintln!(ui, YELLOW, "No tasks were executed as part of this run.");
        }

        println!();
        for (header, trailer) in line_data {
            println!(
                "{}",
                color!(
                    ui,
                    BOLD,
                    "{}{}:    {}",
                    " ".repeat(max_length - header.len()),
                    header,
                    trailer
                )
            );
        }
        println!();
    }
}
