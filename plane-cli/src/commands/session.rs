//! Interactive session shared by `serve`, `join` and `auto`.
//!
//! Reads one command per line from stdin until `quit`, EOF or Ctrl-C, and
//! prints node events as they happen.

use anyhow::Result;
use plane_core::{Rect, ScreenRect, ViewportPatch};
use plane_link::{Node, NodeEvent, Orchestrator};
use plane_types::{DeviceId, Orientation};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "\
commands:
  add <id> <x> <y> <w> <h>     add an object (VU)
  move <id> <x> <y>            move an object (VU)
  drag <id> <dx> <dy>          drag an object by a local delta (dp)
  rm <id>                      remove an object
  rotate <device> <orient>     rotate a viewport (master only)
  show                         print the replica as JSON
  visible                      print objects on this screen as JSON
  quit";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Add { id: String, rect: Rect },
    Move { id: String, x: f64, y: f64 },
    Drag { id: String, dx: f64, dy: f64 },
    Remove { id: String },
    Rotate { device: DeviceId, orientation: Orientation },
    Show,
    Visible,
    Help,
    Quit,
}

#[derive(Debug, Serialize)]
struct VisibleObject {
    id: String,
    screen: ScreenRect,
}

/// Run the interactive loop, then shut everything down.
pub async fn run(node: Node, orchestrator: Option<Orchestrator>) -> Result<()> {
    let mut events = node.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => println!("{}", lagged(skipped)),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(&node, command).await {
                    println!("error: {e:#}");
                }
            }
            Err(e) => println!("error: {e}"),
        }
    }

    if let Some(orchestrator) = orchestrator {
        orchestrator.stop().await;
    }
    node.stop().await;
    printer.abort();
    Ok(())
}

async fn execute(node: &Node, command: Command) -> Result<()> {
    match command {
        Command::Add { id, rect } => node.add_object(&id, rect).await?,
        Command::Move { id, x, y } => {
            node.move_object(&id, x, y).await?;
        }
        Command::Drag { id, dx, dy } => {
            let object = node.drag(&id, dx, dy).await?;
            println!("{} at ({:.1}, {:.1})", object.id, object.x, object.y);
        }
        Command::Remove { id } => node.remove_object(&id).await?,
        Command::Rotate {
            device,
            orientation,
        } => {
            node.update_viewport(&device, &ViewportPatch::orientation(orientation))
                .await?;
        }
        Command::Show => println!("{}", serde_json::to_string_pretty(&node.snapshot())?),
        Command::Visible => {
            let visible: Vec<_> = node
                .visible_objects()?
                .into_iter()
                .map(|(object, screen)| VisibleObject {
                    id: object.id,
                    screen,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&visible)?);
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn parse(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let number = |i: usize| -> Result<f64, String> {
        let word = words.get(i).ok_or("missing argument")?;
        word.parse::<f64>()
            .map_err(|_| format!("not a number: {word}"))
    };
    let word = |i: usize| -> Result<String, String> {
        words
            .get(i)
            .map(|w| w.to_string())
            .ok_or_else(|| "missing argument".to_string())
    };

    let command = match words.first().copied() {
        Some("add") => Command::Add {
            id: word(1)?,
            rect: Rect::new(number(2)?, number(3)?, number(4)?, number(5)?),
        },
        Some("move") => Command::Move {
            id: word(1)?,
            x: number(2)?,
            y: number(3)?,
        },
        Some("drag") => Command::Drag {
            id: word(1)?,
            dx: number(2)?,
            dy: number(3)?,
        },
        Some("rm") => Command::Remove { id: word(1)? },
        Some("rotate") => Command::Rotate {
            device: DeviceId::new(word(1)?),
            orientation: word(2)?.parse()?,
        },
        Some("show") => Command::Show,
        Some("visible") => Command::Visible,
        Some("help") => Command::Help,
        Some("quit") | Some("exit") => Command::Quit,
        Some(other) => return Err(format!("unknown command: {other} (try 'help')")),
        None => return Err("empty command".to_string()),
    };
    Ok(command)
}

fn lagged(skipped: u64) -> String {
    tracing::warn!(skipped, "event printer lagged behind");
    format!("* {skipped} events skipped")
}

fn describe(event: &NodeEvent) -> Option<String> {
    let line = match event {
        NodeEvent::RoleChanged { role: Some(role) } => format!("* now {role}"),
        NodeEvent::RoleChanged { role: None } => "* offline".to_string(),
        NodeEvent::PeerJoined { peer, device_id } => format!("* {device_id} joined from {peer}"),
        NodeEvent::PeerLeft {
            peer,
            device_id,
            reason,
        } => match device_id {
            Some(device_id) => format!("* {device_id} left ({reason})"),
            None => format!("* {peer} left ({reason})"),
        },
        NodeEvent::UplinkLost { reason } => format!("* master lost: {reason}"),
        NodeEvent::ListenerFailed { error } => format!("* listener failed: {error}"),
        NodeEvent::Error { error } => format!("! {error}"),
        NodeEvent::ObjectChanged(_) | NodeEvent::ViewportsChanged => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add() {
        assert_eq!(
            parse("add card 1 2 3 4").unwrap(),
            Command::Add {
                id: "card".into(),
                rect: Rect::new(1.0, 2.0, 3.0, 4.0)
            }
        );
    }

    #[test]
    fn parses_negative_drag() {
        assert_eq!(
            parse("  drag card -12.5 3 ").unwrap(),
            Command::Drag {
                id: "card".into(),
                dx: -12.5,
                dy: 3.0
            }
        );
    }

    #[test]
    fn parses_rotate() {
        assert_eq!(
            parse("rotate tablet 90").unwrap(),
            Command::Rotate {
                device: DeviceId::new("tablet"),
                orientation: Orientation::Rotated90
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("add card 1 2 3").is_err());
        assert!(parse("move card x 2").is_err());
        assert!(parse("rotate tablet sideways").is_err());
        assert!(parse("fly").is_err());
    }

    #[tokio::test]
    async fn printer_keeps_going_after_lagging() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(2);
        for _ in 0..5 {
            tx.send(NodeEvent::ViewportsChanged).unwrap();
        }
        tx.send(NodeEvent::UplinkLost {
            reason: "gone".into(),
        })
        .unwrap();

        let mut lines = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => lines.extend(describe(&event)),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                    lines.push(lagged(skipped))
                }
                Err(_) => break,
            }
        }
        assert_eq!(lines, vec!["* 4 events skipped", "* master lost: gone"]);
    }

    #[test]
    fn quiet_events_are_skipped() {
        assert!(describe(&NodeEvent::ViewportsChanged).is_none());
        assert_eq!(
            describe(&NodeEvent::UplinkLost {
                reason: "end of stream".into()
            })
            .unwrap(),
            "* master lost: end of stream"
        );
    }
}
