//! `lanfwd console`: start/stop the forwarder at runtime.
//!
//! Reads one command per line from stdin and prints relay status events as
//! they arrive. Quitting (or EOF, or Ctrl+C) stops the relay first.

use crate::config::ConfigFile;
use anyhow::{Context, Result};
use lanfwd_core::{FwdError, RelayController, RelayEvent, RelayNotifier};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

const HELP: &str = "\
Commands:
  start [port]   start forwarding (default: configured port)
  stop           stop forwarding
  toggle [port]  start if stopped, stop if running
  status         print the relay status as JSON
  help           show this help
  quit           stop forwarding and exit";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start(Option<String>),
    Stop,
    Toggle(Option<String>),
    Status,
    Help,
    Quit,
}

/// Parse a console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next().map(str::to_string);
    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }

    let takes_no_arg = |cmd: ConsoleCommand| match &arg {
        Some(a) => Err(format!("'{verb}' takes no argument (got '{a}')")),
        None => Ok(Some(cmd)),
    };

    match verb.to_ascii_lowercase().as_str() {
        "start" => Ok(Some(ConsoleCommand::Start(arg.clone()))),
        "toggle" => Ok(Some(ConsoleCommand::Toggle(arg.clone()))),
        "stop" => takes_no_arg(ConsoleCommand::Stop),
        "status" => takes_no_arg(ConsoleCommand::Status),
        "help" | "?" => takes_no_arg(ConsoleCommand::Help),
        "quit" | "exit" => takes_no_arg(ConsoleCommand::Quit),
        other => Err(format!("unknown command '{other}', type 'help'")),
    }
}

/// Applies console commands to a controller.
pub struct Console {
    controller: RelayController,
    default_port: u16,
}

impl Console {
    pub fn new(controller: RelayController, default_port: u16) -> Self {
        Self {
            controller,
            default_port,
        }
    }

    /// Run one command. Returns text to print, if any; state changes are
    /// reported through the event channel instead.
    pub async fn execute(&self, command: ConsoleCommand) -> Option<String> {
        match command {
            ConsoleCommand::Start(port) => {
                let port = port.unwrap_or_else(|| self.default_port.to_string());
                self.controller.start(&port).await.err().map(describe)
            }
            ConsoleCommand::Toggle(port) => {
                let port = port.unwrap_or_else(|| self.default_port.to_string());
                self.controller.toggle(&port).await.err().map(describe)
            }
            ConsoleCommand::Stop => {
                self.controller.stop().await;
                None
            }
            ConsoleCommand::Status => {
                let status = self.controller.status().await;
                Some(serde_json::to_string_pretty(&status).unwrap_or_else(|e| format!("Error: {e}")))
            }
            ConsoleCommand::Help => Some(HELP.to_string()),
            ConsoleCommand::Quit => {
                self.controller.stop().await;
                None
            }
        }
    }
}

fn describe(err: FwdError) -> String {
    match err {
        FwdError::InvalidPort(_) => "Invalid port".to_string(),
        other => format!("Error: {other}"),
    }
}

pub async fn run(cfg: &ConfigFile) -> Result<()> {
    let (default_port, relay_config) = cfg.relay_config()?;
    let (notifier, mut events) = RelayNotifier::channel();
    let console = Console::new(RelayController::new(relay_config, notifier), default_port);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Idle (type 'help' for commands)");

    let shutdown = crate::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events.recv() => println!("{event}"),
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Some(output) = console.execute(command).await {
                            println!("{output}");
                        }
                    }
                    Err(message) => println!("{message}"),
                }
            }
            _ = &mut shutdown => break,
        }
    }

    console.execute(ConsoleCommand::Quit).await;
    print_pending(&mut events);
    Ok(())
}

fn print_pending(events: &mut UnboundedReceiver<RelayEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("{event}");
    }
}
