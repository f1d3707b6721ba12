use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xbgw::components::command::parse_bool_word;
use xbgw::components::reporter::StatsProbe;
use xbgw::components::xbee::{acknowledge, io_sample_frame, serial_frame, IoSample};
use xbgw::gateway::REPORTED_TOPICS;
use xbgw::prelude::*;
use xbgw::{NAME, VERSION as LIB_VERSION};

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Words the REPL understands as its first token.
const SHELL_COMMANDS: &[&str] = &[
    "inject", "cmd", "snoop", "unsnoop", "ack", "settings", "stats", "help", "exit",
];

/// Colours a REPL line: a known shell command in yellow, anything else in
/// red, and the keys of `key=value` arguments in cyan.
#[derive(Completer, Helper, Hinter, Validator)]
struct ReplHighlighter;

impl Highlighter for ReplHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let command = if SHELL_COMMANDS.contains(&command) {
            command.yellow().bold()
        } else {
            command.red()
        };
        let args = rest
            .split(' ')
            .map(|word| match word.split_once('=') {
                Some((key, value)) => format!("{}={}", key.cyan(), value),
                None => word.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        if line.contains(' ') {
            Cow::Owned(format!("{} {}", command, args))
        } else {
            Cow::Owned(command.to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var_os("XBGW_QUIET").is_some() {
        return;
    }
    const LOGO_TEXT: &str = include_str!("../logo.log");
    println!("{}", LOGO_TEXT.cyan());

    let rule = "-".repeat(79);
    println!("{}", rule.as_str().dimmed());
    println!(
        "    {} v{}  (xbgwsh v{})",
        NAME.bold(),
        LIB_VERSION,
        SHELL_VERSION
    );
    println!(
        "{}",
        "    Both radios are simulated in memory: use 'inject' to play a remote node\n    \
         and 'ack' to choose how transmissions are answered. Set XBGW_QUIET to\n    \
         skip this banner."
            .dimmed()
    );
    println!("{}", rule.as_str().dimmed());
}

fn to_json(payload: &Payload) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| format!("{:?}", payload))
}

/// Plays the radio network: prints what the gateway transmits and answers
/// with the status currently set by `ack`.
fn spawn_radio_peer(
    label: &'static str,
    peer: RadioPeer,
    ack_status: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            let Some(frame) = peer.recv_sent_timeout(Duration::from_millis(200)) else {
                continue;
            };
            println!("\n<-- [{}] transmitted {:?}", label, frame);
            if let Some(ack) = acknowledge(&frame, ack_status.load(Ordering::Relaxed)) {
                if peer.inject(ack).is_err() {
                    break;
                }
            }
        }
    })
}

/// Joins the radio peer threads, logging any that panicked. Returns how
/// many did.
fn join_radio_peers(peers: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for peer in peers {
        if peer.join().is_err() {
            error!("A simulated radio thread panicked");
            panicked += 1;
        }
    }
    panicked
}

/// Builds the frame for `inject analog|digital|serial <ADDR> ...`.
fn parse_inject(args: &[&str]) -> Result<Frame, String> {
    let (kind, addr) = match args {
        [kind, addr, ..] => (*kind, *addr),
        _ => return Err("Usage: inject analog|digital|serial <ADDR> ...".into()),
    };
    let node: XBeeAddress = addr
        .parse()
        .map_err(|e| format!("Bad address '{}': {}", addr, e))?;
    match (kind, &args[2..]) {
        ("analog", [channel, reading]) => {
            let channel = channel.parse::<u8>().map_err(|_| "Channel must be 0-7".to_string())?;
            let reading = reading
                .parse::<u16>()
                .map_err(|_| "Reading must be a number".to_string())?;
            Ok(io_sample_frame(
                node,
                &IoSample {
                    digital: vec![],
                    analog: vec![(channel, reading)],
                },
            ))
        }
        ("digital", [channel, state]) => {
            let channel = channel
                .parse::<u8>()
                .map_err(|_| "Channel must be 0-15".to_string())?;
            let state = parse_bool_word(state).ok_or_else(|| "State must be 0 or 1".to_string())?;
            Ok(io_sample_frame(
                node,
                &IoSample {
                    digital: vec![(channel, state)],
                    analog: vec![],
                },
            ))
        }
        ("serial", text) if !text.is_empty() => Ok(serial_frame(node, text.join(" "))),
        ("analog", _) => Err("Usage: inject analog <ADDR> <CHANNEL> <READING>".into()),
        ("digital", _) => Err("Usage: inject digital <ADDR> <CHANNEL> <0|1>".into()),
        ("serial", _) => Err("Usage: inject serial <ADDR> <TEXT>".into()),
        (other, _) => Err(format!("Unknown frame kind '{}'", other)),
    }
}

/// Turns `key=value` words into command arguments.
fn parse_arguments(words: &[&str]) -> Result<Payload, String> {
    words.iter().try_fold(Payload::new(), |payload, word| {
        word.split_once('=')
            .map(|(key, value)| payload.with(key, value))
            .ok_or_else(|| format!("Expected key=value, got '{}'", word))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let (radio, radio_peer) = channel_radio();
    let (ddo_radio, ddo_peer) = channel_radio();

    // The reporter is boxed inside the gateway; keep a probe for `stats`.
    let probe: Arc<OnceLock<StatsProbe>> = Arc::new(OnceLock::new());
    let gateway = Gateway::builder()
        .overrides(load_overrides(None)?)
        .with_xbee(Box::new(radio))
        .with_ddo(Box::new(ddo_radio))
        .with_debug_commands()
        .settings_group::<ReporterSettings>()
        .reporter(REPORTED_TOPICS, {
            let probe = probe.clone();
            move |registry| {
                let settings = ReporterSettings::from_registry(registry)?;
                let reporter = DataPointReporter::new(settings, Box::new(LogCollector::new()))?;
                if probe.set(reporter.stats_probe()).is_err() {
                    warn!("Reporter stats already bound, ignoring the second reporter");
                }
                Ok(Box::new(reporter))
            }
        })
        .build()?;

    let bus = gateway.bus().clone();
    let commands = gateway.commands();
    let settings = gateway.settings().clone();

    bus.subscribe("gateway.system", |message: &Message| {
        println!("\n<-- [SYSTEM EVENT] {} {}", message.topic(), to_json(message.payload()));
        Ok(())
    })?;
    let mut snoop = TopicSnoop::with_sink(|message: &Message| {
        println!("<-- [{}] {}", message.topic(), to_json(message.payload()));
    });

    let running = Arc::new(AtomicBool::new(true));
    let ack_status = Arc::new(AtomicU8::new(0));
    let peers = [
        spawn_radio_peer("XBEE", radio_peer.clone(), ack_status.clone(), running.clone()),
        spawn_radio_peer("DDO", ddo_peer, ack_status.clone(), running.clone()),
    ];

    info!("Spawning {} in the background...", NAME.cyan());
    let (stop, stopped) = oneshot::channel::<()>();
    let gateway_task = tokio::spawn(gateway.run_until(async {
        if stopped.await.is_err() {
            warn!("Shell dropped the stop channel, shutting the gateway down");
        }
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut rl = Editor::new()?;
    let helper = ReplHighlighter;
    rl.set_helper(Some(helper));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let readline = rl.readline(&prompt);
        match readline {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();

                if let Some(command) = args.first() {
                    match *command {
                        "inject" => match parse_inject(&args[1..]) {
                            Ok(frame) => match radio_peer.inject(frame) {
                                Ok(()) => println!("--> Frame injected."),
                                Err(e) => println!("Error: {}", e),
                            },
                            Err(usage) => println!("{}", usage),
                        },
                        "cmd" => {
                            let Some(name) = args.get(1) else {
                                println!("Declared commands:");
                                for spec in commands.specs() {
                                    println!("  {:<40} - {}", spec.usage(), spec.description);
                                }
                                continue;
                            };
                            let arguments = match parse_arguments(&args[2..]) {
                                Ok(arguments) => arguments,
                                Err(e) => {
                                    println!("Error: {}", e);
                                    continue;
                                }
                            };
                            let name = name.to_string();
                            let commands = commands.clone();
                            let outcome =
                                tokio::task::spawn_blocking(move || commands.invoke(&name, &arguments)).await?;
                            match outcome {
                                Ok(response) => {
                                    for reply in &response.replies {
                                        let text = serde_json::to_string_pretty(reply)?;
                                        if reply.is_error() {
                                            println!("{}", text.as_str().red());
                                        } else {
                                            println!("{}", text.as_str().green());
                                        }
                                    }
                                }
                                Err(e) => println!("Error: {}", e),
                            }
                        }
                        "snoop" => match args.get(1) {
                            Some(prefix) => match snoop.start_reporting(&bus, prefix) {
                                Ok(()) => println!("--> Snooping on '{}'.", prefix),
                                Err(e) => println!("Error: {}", e),
                            },
                            None => {
                                println!("Snooped prefixes:");
                                for topic in snoop.topics() {
                                    println!("  {}", topic);
                                }
                            }
                        },
                        "unsnoop" => match args.get(1) {
                            Some(prefix) if snoop.stop_reporting(&bus, prefix) => {
                                println!("--> Stopped snooping on '{}'.", prefix)
                            }
                            Some(prefix) => println!("Error: not snooping on '{}'.", prefix),
                            None => println!("Usage: unsnoop <PREFIX>"),
                        },
                        "ack" => match args.get(1).and_then(|s| {
                            s.strip_prefix("0x")
                                .map_or_else(|| s.parse::<u8>().ok(), |hex| u8::from_str_radix(hex, 16).ok())
                        }) {
                            Some(status) => {
                                ack_status.store(status, Ordering::Relaxed);
                                println!("--> Radio now answers with status {:#04x}.", status);
                            }
                            None => println!("Usage: ack <STATUS>  (0 is success)"),
                        },
                        "settings" => {
                            for group in settings.groups() {
                                println!("[{}]", group.cyan());
                                for view in settings.entries(group)? {
                                    let marker = if view.overridden { " *" } else { "" };
                                    println!("  {} = {}{}", view.key, view.value, marker);
                                }
                            }
                        }
                        "stats" => match probe.get() {
                            Some(probe) => {
                                let stats = probe.stats();
                                println!(
                                    "Queued: {}  Delivered: {}  Dropped: {}  Attempts: {}",
                                    stats.queued, stats.delivered, stats.dropped, stats.attempts
                                );
                            }
                            None => println!("No data-point reporter is running."),
                        },
                        "help" => {
                            println!("Available commands:");
                            println!("  inject analog <A> <CH> <N>  - Simulates an analog sample from node A.");
                            println!("  inject digital <A> <CH> <S> - Simulates a digital sample from node A.");
                            println!("  inject serial <A> <TEXT>    - Simulates serial data from node A.");
                            println!("  cmd                         - Lists the declared remote commands.");
                            println!("  cmd <NAME> [K=V]...         - Invokes a remote command.");
                            println!("  snoop [PREFIX]              - Prints messages under PREFIX.");
                            println!("  unsnoop <PREFIX>            - Stops printing messages under PREFIX.");
                            println!("  ack <STATUS>                - Sets the status the radio answers with.");
                            println!("  settings                    - Shows the effective settings.");
                            println!("  stats                       - Shows data-point reporter counters.");
                            println!("  exit                        - Shuts the gateway down and quits.");
                        }
                        "exit" => break,
                        _ => println!("Unknown command: '{}'. Type 'help'.", line),
                    }
                }
            }
            Err(_) => {
                println!("Exiting xbgwsh...");
                break;
            }
        }
    }

    if stop.send(()).is_err() {
        warn!("Gateway had already stopped before exit");
    }
    let summary = gateway_task.await??;
    running.store(false, Ordering::Relaxed);
    join_radio_peers(peers);
    for (name, report) in summary {
        println!(
            "{}: {} delivered, {} dropped{}",
            name,
            report.delivered,
            report.dropped,
            if report.detached { " (detached)" } else { "" }
        );
    }
    Ok(())
}
