//! `pixel-fleet watch`: live event feed plus a line-based command prompt.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use pixel_fleet_console::{CommandKind, Console, ConsoleEvent, Coordinator};
use pixel_fleet_core::client_state::ClientStateStore;
use pixel_fleet_core::config::Config;
use pixel_fleet_preview::Layer;

pub const HELP: &str = "commands: status | pause | resume | stop | batch | refresh | \
select <id>... | fav <id> | layer <name> on|off | guard <key>=<value> | quit";

pub async fn run(
    config: Arc<Config>,
    coordinator: Arc<dyn Coordinator>,
    store: ClientStateStore,
    json: bool,
) -> anyhow::Result<()> {
    let (console, handle) = Console::new(config, coordinator, store);
    let mut events = handle.subscribe();
    let task = tokio::spawn(console.run());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => print_event(&ev, json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(CommandKind::Shutdown)) => break,
                    Ok(Some(kind)) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            match handle.request(kind).await {
                                Ok(reply) => println!("{reply}"),
                                Err(e) => eprintln!("error: {e}"),
                            }
                        });
                    }
                    Err(msg) => eprintln!("{msg}"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let _ = handle.shutdown().await;
    let _ = task.await;
    Ok(())
}

fn print_event(ev: &ConsoleEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(ev)?);
    } else {
        println!("{}", describe(ev));
    }
    Ok(())
}

/// Parse one prompt line. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<CommandKind>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<String> = words.map(str::to_string).collect();

    let kind = match verb {
        "status" => CommandKind::Snapshot,
        "pause" => CommandKind::Pause,
        "resume" => CommandKind::Resume,
        "stop" => CommandKind::Stop,
        "batch" | "one-batch" => CommandKind::OneBatch,
        "refresh" => CommandKind::RefreshPreview,
        "select" => CommandKind::Select(rest),
        "fav" | "favorite" => match rest.as_slice() {
            [id] => CommandKind::Favorite(id.clone()),
            _ => return Err("usage: fav <agent-id>".into()),
        },
        "layer" => match rest.as_slice() {
            [name, state] => {
                let layer: Layer = name.parse()?;
                let on = match state.as_str() {
                    "on" => true,
                    "off" => false,
                    other => return Err(format!("expected on|off, got '{other}'")),
                };
                CommandKind::SetLayer(layer, on)
            }
            _ => return Err("usage: layer <name> on|off".into()),
        },
        "guard" => {
            let mut patch = Map::new();
            for pair in &rest {
                let (key, raw) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
                patch.insert(key.to_string(), parse_value(raw));
            }
            if patch.is_empty() {
                return Err("usage: guard <key>=<value>...".into());
            }
            CommandKind::EditGuardConfig(Value::Object(patch))
        }
        "quit" | "exit" => CommandKind::Shutdown,
        "help" => return Err(HELP.into()),
        other => return Err(format!("unknown command '{other}'; {HELP}")),
    };
    Ok(Some(kind))
}

/// JSON if it parses, otherwise a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn describe(ev: &ConsoleEvent) -> String {
    match ev {
        ConsoleEvent::LinkUp { conn_id } => format!("link up ({conn_id})"),
        ConsoleEvent::LinkDown { reason } => format!("link down: {reason}"),
        ConsoleEvent::Reconnecting { attempt, delay_ms } => {
            format!("reconnecting in {delay_ms} ms (attempt {attempt})")
        }
        ConsoleEvent::LinkLost { attempts } => {
            format!("coordinator unreachable after {attempts} attempts; restart to retry")
        }
        ConsoleEvent::Synced { agents, projects, session_id } => format!(
            "synced: {agents} agents, {projects} projects, session {}",
            session_id.as_deref().unwrap_or("-")
        ),
        ConsoleEvent::AgentsChanged(agg) => format!(
            "fleet: {} agents, charges {}/{}, repaired {}",
            agg.agents, agg.remaining_charges, agg.max_charges, agg.repaired
        ),
        ConsoleEvent::FavoriteChanged { agent_id } => format!("favorite: {agent_id}"),
        ConsoleEvent::SelectionChanged { agent_ids } => {
            format!("selected: {}", agent_ids.join(", "))
        }
        ConsoleEvent::PlanUpdated(plan) => format!(
            "plan: {} pixels across {} agents (cap {})",
            plan.total,
            plan.quotas.len(),
            plan.batch_cap
        ),
        ConsoleEvent::SessionChanged { session_id, status } => {
            format!("session {session_id}: {}", format!("{status:?}").to_lowercase())
        }
        ConsoleEvent::PreviewUpdated(s) => format!(
            "preview: {}/{} correct, {} incorrect, {} missing ({:.1}%)",
            s.correct,
            s.original,
            s.incorrect,
            s.missing,
            s.accuracy()
        ),
        ConsoleEvent::Repair { agent_id, stage, .. } => format!("[{agent_id}] repair {stage}"),
        ConsoleEvent::Paint { agent_id, ok, completed, total } => format!(
            "[{agent_id}] paint {} {completed}/{total}",
            if *ok { "ok" } else { "failed" }
        ),
        ConsoleEvent::GuardConfig { .. } => "guard config saved".into(),
        ConsoleEvent::GuardCleared { agent_ids } => {
            format!("guard data cleared on {} agents", agent_ids.len())
        }
        ConsoleEvent::UploadSent { agent_id, filename, pixels } => format!(
            "guard data sent to {}: {filename} ({pixels} pixels)",
            agent_id.as_deref().unwrap_or("?")
        ),
        ConsoleEvent::ProjectsChanged { count } => format!("{count} projects"),
        ConsoleEvent::Log { level, message, agent_id } => format!(
            "[{}] {level}: {message}",
            agent_id.as_deref().unwrap_or("coordinator")
        ),
        ConsoleEvent::RequestFailed { operation, error } => format!("{operation} failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_fleet_core::types::SessionStatus;
    use serde_json::json;

    #[test]
    fn test_parse_simple_verbs() {
        assert!(matches!(parse_line("pause"), Ok(Some(CommandKind::Pause))));
        assert!(matches!(parse_line("  batch "), Ok(Some(CommandKind::OneBatch))));
        assert!(matches!(parse_line("quit"), Ok(Some(CommandKind::Shutdown))));
        assert!(matches!(parse_line("   "), Ok(None)));
    }

    #[test]
    fn test_parse_select_and_favorite() {
        let Ok(Some(CommandKind::Select(ids))) = parse_line("select a b") else {
            panic!("expected select");
        };
        assert_eq!(ids, ["a", "b"]);
        assert!(matches!(parse_line("fav a"), Ok(Some(CommandKind::Favorite(ref id))) if id == "a"));
        assert!(parse_line("fav").is_err());
    }

    #[test]
    fn test_parse_guard_patch() {
        let Ok(Some(CommandKind::EditGuardConfig(patch))) =
            parse_line("guard pixelsPerBatch=4 protectionPattern=spiral spendAllPixelsOnStart=true")
        else {
            panic!("expected guard edit");
        };
        assert_eq!(
            patch,
            json!({"pixelsPerBatch": 4, "protectionPattern": "spiral", "spendAllPixelsOnStart": true})
        );
        assert!(parse_line("guard pixelsPerBatch").is_err());
    }

    #[test]
    fn test_parse_layer() {
        assert!(matches!(
            parse_line("layer missing off"),
            Ok(Some(CommandKind::SetLayer(Layer::Missing, false)))
        ));
        assert!(parse_line("layer missing maybe").is_err());
        assert!(parse_line("layer sky on").is_err());
    }

    #[test]
    fn test_unknown_verb() {
        let err = parse_line("dance").unwrap_err();
        assert!(err.contains("unknown command"));
    }

    #[test]
    fn test_describe() {
        let line = describe(&ConsoleEvent::SessionChanged {
            session_id: "s1".into(),
            status: SessionStatus::Paused,
        });
        assert_eq!(line, "session s1: paused");
        let line = describe(&ConsoleEvent::Synced {
            agents: 2,
            projects: 0,
            session_id: None,
        });
        assert_eq!(line, "synced: 2 agents, 0 projects, session -");
    }
}
