use crate::model::{ConsoleEvent, ConversionResult, TaskSnapshot, TaskStatus};
use ratatui::style::Color;
use std::time::Duration;
use time::macros::format_description;

pub const TAB_MIGRATION: usize = 0;
pub const TAB_CONVERSION: usize = 1;
pub const TAB_HELP: usize = 2;

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub base_url: String,
    pub poll_interval: Duration,

    pub task: TaskSnapshot,
    pub polling: bool,
    pub starting: bool,

    pub sql_input: String,
    pub editing: bool,
    pub converting: bool,
    pub conversion: Option<ConversionResult>,

    // (HH:MM:SS, message), newest last
    pub log: Vec<(String, String)>,
    // Set once the session expires; holds the login entry point.
    pub login_required: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: TAB_MIGRATION,
            info: String::new(),
            base_url: String::new(),
            poll_interval: Duration::from_secs(5),
            task: TaskSnapshot::default(),
            polling: false,
            starting: false,
            sql_input: String::new(),
            editing: false,
            converting: false,
            conversion: None,
            log: Vec::new(),
            login_required: None,
        }
    }
}

impl UiState {
    fn push_log(&mut self, msg: String) {
        const MAX: usize = 200;
        let fmt = format_description!("[hour]:[minute]:[second]");
        let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        let ts = now.format(fmt).unwrap_or_else(|_| "--:--:--".into());
        self.log.push((ts, msg));
        if self.log.len() > MAX {
            let extra = self.log.len() - MAX;
            self.log.drain(0..extra);
        }
    }

    pub fn apply_event(&mut self, ev: ConsoleEvent) {
        let msg = ev.to_message();
        match ev {
            ConsoleEvent::TaskStarted { .. } => {
                self.starting = false;
                self.polling = true;
                self.info = msg.clone();
                self.push_log(msg);
            }
            ConsoleEvent::TaskStartFailed { .. } => {
                self.starting = false;
                self.polling = false;
                self.info = msg.clone();
                self.push_log(msg);
            }
            ConsoleEvent::TaskUpdated { snapshot } => {
                // Only log status transitions; every poll would flood the log.
                if snapshot.status != self.task.status || snapshot.task_id != self.task.task_id {
                    self.push_log(msg);
                }
                self.task = snapshot;
            }
            ConsoleEvent::PollSkipped { .. } => self.push_log(msg),
            ConsoleEvent::PollingStopped { .. } => {
                self.polling = false;
                self.info = msg.clone();
                self.push_log(msg);
            }
            ConsoleEvent::ConversionFinished { result, .. } => {
                self.converting = false;
                self.conversion = Some(result);
                self.info = msg.clone();
                self.push_log(msg);
            }
            ConsoleEvent::SessionExpired { login_url } => {
                // The task view is discarded along with its controller.
                self.task = TaskSnapshot::default();
                self.polling = false;
                self.starting = false;
                self.converting = false;
                self.editing = false;
                self.login_required = Some(login_url);
                self.push_log(msg);
            }
            ConsoleEvent::Info(_) => {
                self.info = msg.clone();
                self.push_log(msg);
            }
        }
    }

    /// A new task may be requested unless one is being submitted or is running.
    pub fn can_start(&self) -> bool {
        !self.starting && self.task.status != TaskStatus::Running && self.login_required.is_none()
    }
}

pub fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Idle => Color::Gray,
        TaskStatus::Running => Color::Yellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Error => Color::Red,
        TaskStatus::Unknown => Color::Magenta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProgressSnapshot, TaskId};

    #[test]
    fn task_updates_replace_snapshot_and_log_transitions_only() {
        let mut state = UiState::default();
        let running = TaskSnapshot {
            task_id: Some(TaskId::new("T1")),
            status: TaskStatus::Running,
            progress: Some(ProgressSnapshot {
                tables: 1,
                rows: 2,
                sprocs: 0,
            }),
        };
        state.apply_event(ConsoleEvent::TaskUpdated {
            snapshot: running.clone(),
        });
        state.apply_event(ConsoleEvent::TaskUpdated {
            snapshot: running.clone(),
        });
        assert_eq!(state.task, running);
        assert_eq!(state.log.len(), 1);
        assert!(!state.can_start());
    }

    #[test]
    fn session_expiry_discards_task_view() {
        let mut state = UiState {
            polling: true,
            editing: true,
            ..Default::default()
        };
        state.task.status = TaskStatus::Running;
        state.apply_event(ConsoleEvent::SessionExpired {
            login_url: "/login".into(),
        });
        assert_eq!(state.task, TaskSnapshot::default());
        assert!(!state.polling);
        assert!(!state.editing);
        assert_eq!(state.login_required.as_deref(), Some("/login"));
        assert!(!state.can_start());
    }

    #[test]
    fn conversion_result_is_held() {
        let mut state = UiState {
            converting: true,
            ..Default::default()
        };
        state.apply_event(ConsoleEvent::ConversionFinished {
            result: ConversionResult::failed(),
            ok: false,
        });
        assert!(!state.converting);
        assert!(state.conversion.as_ref().unwrap().is_failure_marker());
        assert_eq!(state.info, "Conversion failed");
    }
}
