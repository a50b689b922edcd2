//! Console lifecycle controller.
//!
//! Owns the task controller and conversion helper, executes UI commands and
//! emits events for presentation layers.

use crate::api::MigrationService;
use crate::model::ConsoleEvent;
use crate::orchestrator::{ConversionHelper, PollSettings, TaskController};
use crate::session::{Session, SessionState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    StartMigration,
    Convert(String),
    ClearConversion,
    Quit,
}

/// Shared handles every console mode needs.
#[derive(Clone)]
pub(crate) struct ConsoleContext {
    pub session: Arc<Session>,
    pub service: Arc<dyn MigrationService>,
    pub settings: PollSettings,
}

/// Execute UI commands until `Quit` (or the command channel closes).
///
/// When the session expires the task view is torn down and presentation
/// layers are told to send the operator to the login entry point.
pub(crate) async fn run_controller(
    ctx: ConsoleContext,
    event_tx: UnboundedSender<ConsoleEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut tasks = TaskController::new(ctx.service.clone(), ctx.settings, Some(event_tx.clone()));
    let mut conversion = ConversionHelper::new(ctx.service.clone());
    let mut session_rx = ctx.session.subscribe();
    let mut expired = ctx.session.is_expired();

    if expired {
        let _ = event_tx.send(ConsoleEvent::SessionExpired {
            login_url: ctx.session.login_url().to_string(),
        });
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::StartMigration) => {
                        if tasks.is_polling() {
                            let _ = event_tx.send(ConsoleEvent::Info(
                                "Discarding current task view for a new migration".into(),
                            ));
                        }
                        // Outcome is reported through the task controller's events.
                        let _ = tasks.start().await;
                    }
                    Some(UiCommand::Convert(sql)) => {
                        let ok = conversion.convert(&sql).await.is_ok();
                        if let Some(result) = conversion.output() {
                            let _ = event_tx.send(ConsoleEvent::ConversionFinished {
                                result: result.clone(),
                                ok,
                            });
                        }
                    }
                    Some(UiCommand::ClearConversion) => conversion.clear(),
                    Some(UiCommand::Quit) | None => {
                        debug!("console controller quitting");
                        break;
                    }
                }
            }
            changed = session_rx.changed(), if !expired => {
                if changed.is_err() {
                    expired = true;
                    continue;
                }
                let state = session_rx.borrow_and_update().clone();
                if let SessionState::Expired { login_url } = state {
                    expired = true;
                    info!("session expired, discarding task view");
                    tasks.shutdown();
                    let _ = event_tx.send(ConsoleEvent::SessionExpired { login_url });
                }
            }
        }
    }

    tasks.shutdown();
    Ok(())
}
