// src/cli.rs
//
// `serialdeck` command line: list ports, run an interactive terminal session,
// and one-shot encode/decode helpers.
//
// In a session every stdin line is sent with the chosen encoding. Lines that
// start with ':' are terminal commands (see `:help`).

use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use crate::io::serial::simulated::{SimulatedPort, SimulatedTransport};
use crate::io::{
    decode, encode, Direction, Encoding, LineEnding, MessageRecord, PortDescriptor,
    ReadLineEnding, SerialTransport, SessionController, SessionEvent, SessionPhase,
};
use crate::logging;
use crate::message_log::MessageLog;
use crate::settings::{self, TerminalSettings};

#[derive(Parser, Debug)]
#[command(name = "serialdeck", version, about = "Serial terminal")]
struct Cli {
    /// Settings file (default: <config dir>/serialdeck/settings.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports with their ids
    List,
    /// Open a port and start an interactive session
    Connect {
        /// Port path (prompt if omitted)
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Encoding for typed input (hex|binary|ascii|decimal|utf8|base64)
        #[arg(short, long)]
        encoding: Option<Encoding>,
        /// Line ending appended to sends (none|cr|lf|crlf|custom)
        #[arg(long)]
        line_ending: Option<LineEnding>,
        #[arg(long)]
        custom_line_ending: Option<String>,
        /// Buffer received data until this line ending (cr|lf|crlf|custom)
        #[arg(long)]
        read_until: Option<ReadLineEnding>,
        /// Use an in-memory loopback port instead of real hardware
        #[arg(long)]
        loopback: bool,
        /// Print session events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Encode text and print the bytes as hex
    Encode { encoding: Encoding, text: String },
    /// Decode hex bytes and render them in an encoding
    Decode { encoding: Encoding, hex: String },
}

pub fn run() -> Result<(), String> {
    let cli = Cli::parse();

    let settings_path = match &cli.settings {
        Some(p) => p.clone(),
        None => settings::default_settings_path()?,
    };
    let mut settings = settings::load_settings(&settings_path)?;

    match cli.command {
        Command::List => list_ports(),
        Command::Encode { encoding, text } => {
            let payload = encode(&text, encoding).map_err(|e| e.to_string())?;
            println!("{}", decode(&payload.bytes, Encoding::Hex));
            Ok(())
        }
        Command::Decode { encoding, hex } => {
            let payload = encode(&hex, Encoding::Hex).map_err(|e| e.to_string())?;
            println!("{}", decode(&payload.bytes, encoding));
            Ok(())
        }
        Command::Connect {
            port,
            baud,
            encoding,
            line_ending,
            custom_line_ending,
            read_until,
            loopback,
            json,
        } => {
            if let Some(baud) = baud {
                settings.baud_rate = baud;
            }
            if let Some(encoding) = encoding {
                settings.encoding = encoding;
            }
            if let Some(line_ending) = line_ending {
                settings.line_ending = line_ending;
            }
            if custom_line_ending.is_some() {
                settings.custom_line_ending = custom_line_ending;
            }
            if let Some(read_until) = read_until {
                settings.read_until_line_ending = true;
                settings.read_line_ending = read_until;
            }

            if let Some(dir) = settings.log_dir() {
                logging::init_file_logging(&dir)?;
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("Failed to start runtime: {}", e))?;
            let result = runtime.block_on(run_session(settings, port, loopback, json));
            logging::stop_file_logging();
            result
        }
    }
}

// ============================================================================
// Port Listing
// ============================================================================

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn list_ports() -> Result<(), String> {
    use crate::io::serial::registry::port_id;

    let ports = crate::io::serial::native::list_serial_ports().map_err(|e| e.to_string())?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for p in ports {
        println!(
            "{:<24} {:<16} {:<10} {}",
            p.port_name,
            port_id(&p.identity()),
            p.port_type,
            p.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn list_ports() -> Result<(), String> {
    Err("Serial ports are not supported on this platform".to_string())
}

// ============================================================================
// Transport Selection
// ============================================================================

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
mod prompt {
    use crate::io::serial::native::{PortPrompt, SerialPortInfo};

    /// Numbered list on stdout, choice read from stdin
    pub struct StdinPrompt;

    impl PortPrompt for StdinPrompt {
        fn choose(&self, ports: &[SerialPortInfo]) -> Option<usize> {
            if ports.is_empty() {
                println!("No serial ports found.");
                return None;
            }
            println!("Available ports:");
            for (i, p) in ports.iter().enumerate() {
                println!(
                    "  [{}] {} {}",
                    i + 1,
                    p.port_name,
                    p.product.as_deref().unwrap_or("")
                );
            }
            print!("Select port (empty to cancel): ");
            let _ = std::io::Write::flush(&mut std::io::stdout());

            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok()?;
            let choice: usize = line.trim().parse().ok()?;
            choice.checked_sub(1).filter(|i| *i < ports.len())
        }
    }
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn native_transport(port: Option<&str>) -> Result<Option<Arc<dyn SerialTransport>>, String> {
    use crate::io::serial::native::NativeTransport;

    let transport = match NativeTransport::detect(Some(Arc::new(prompt::StdinPrompt))) {
        Some(t) => t,
        None => return Ok(None),
    };
    if let Some(port) = port {
        transport.authorize(port).map_err(|e| e.to_string())?;
    }
    Ok(Some(transport as Arc<dyn SerialTransport>))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn native_transport(_port: Option<&str>) -> Result<Option<Arc<dyn SerialTransport>>, String> {
    Ok(None)
}

// ============================================================================
// Interactive Session
// ============================================================================

async fn run_session(
    settings: TerminalSettings,
    port: Option<String>,
    loopback: bool,
    json: bool,
) -> Result<(), String> {
    let transport: Option<Arc<dyn SerialTransport>> = if loopback {
        Some(Arc::new(SimulatedTransport::with_ports(vec![
            SimulatedPort::loopback("loopback"),
        ])))
    } else {
        native_transport(port.as_deref())?
    };

    let config = settings.connection_config();
    let (controller, mut events) =
        SessionController::new(transport, config, settings.session_options());
    let log = Arc::new(MessageLog::new());

    let printer = {
        let log = log.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => eprintln!("Failed to serialize event: {}", e),
                    }
                } else {
                    print_event(&event);
                }
                if let SessionEvent::Message(record) = event {
                    log.append(record);
                }
            }
        })
    };

    let target = if loopback || port.is_some() {
        let ports = controller.list_ports().await.map_err(|e| e.to_string())?;
        pick_port(ports, port.as_deref())
    } else {
        None
    };

    let connected = controller
        .connect(settings.baud_rate, target)
        .await
        .map_err(|e| e.to_string())?;
    if connected.is_none() {
        println!("No port selected.");
        return Ok(());
    }
    println!(
        "Sending as {}, {} line ending. Type :help for commands.",
        settings.encoding,
        format!("{:?}", settings.line_ending).to_lowercase()
    );

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if controller.status().await.phase != SessionPhase::Connected {
            println!("Connection lost.");
            break;
        }
        match parse_command(&line) {
            Some(TerminalCommand::Quit) => break,
            Some(TerminalCommand::Help) => print_help(),
            Some(TerminalCommand::Clear) => log.clear(),
            Some(TerminalCommand::Stats) => {
                let stats = log.stats();
                println!(
                    "sent {} ({} bytes), received {} ({} bytes)",
                    stats.sent_count, stats.bytes_sent, stats.received_count, stats.bytes_received
                );
            }
            Some(TerminalCommand::Resend(index)) => match log.nth(index) {
                Some(record) if record.original_input.is_some() => {
                    // Errors already reach the printer as events
                    let _ = controller.resend(&record, &controller.config()).await;
                }
                _ => println!("#{} is not a sent message", index),
            },
            Some(TerminalCommand::Show(index, encoding)) => {
                match log.nth(index).and_then(|r| log.render_as(&r.id, encoding)) {
                    Some(text) => println!("#{} [{}] {}", index, encoding, text),
                    None => println!("No message #{}", index),
                }
            }
            Some(TerminalCommand::Invalid(message)) => println!("{}", message),
            None => {
                if let Err(e) = controller
                    .send(&line, settings.encoding, &controller.config())
                    .await
                {
                    if matches!(e.kind, crate::io::IoErrorKind::Codec(_)) {
                        println!("{}", e.to_string().red());
                    }
                }
            }
        }
    }

    if let Err(e) = controller.disconnect().await {
        eprintln!("{}", e);
    }
    drop(controller);
    let _ = printer.await;
    Ok(())
}

fn pick_port(ports: Vec<PortDescriptor>, wanted: Option<&str>) -> Option<PortDescriptor> {
    match wanted {
        Some(name) => ports.into_iter().find(|p| p.name.starts_with(name)),
        None => ports.into_iter().next(),
    }
}

// ============================================================================
// Terminal Commands
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum TerminalCommand {
    Quit,
    Help,
    Clear,
    Stats,
    Resend(usize),
    Show(usize, Encoding),
    Invalid(String),
}

/// None for lines that should be sent as-is
fn parse_command(line: &str) -> Option<TerminalCommand> {
    let rest = line.strip_prefix(':')?;
    let mut parts = rest.split_whitespace();
    let command = match parts.next() {
        Some(c) => c,
        None => return Some(TerminalCommand::Invalid("Empty command".to_string())),
    };

    let index = |arg: Option<&str>| -> Result<usize, String> {
        arg.ok_or_else(|| "Missing message number".to_string())?
            .parse::<usize>()
            .map_err(|_| "Message number must be a whole number".to_string())
    };

    let parsed = match command {
        "quit" | "q" => Ok(TerminalCommand::Quit),
        "help" | "h" => Ok(TerminalCommand::Help),
        "clear" => Ok(TerminalCommand::Clear),
        "stats" => Ok(TerminalCommand::Stats),
        "resend" => index(parts.next()).map(TerminalCommand::Resend),
        "show" => index(parts.next()).and_then(|i| {
            let encoding = parts
                .next()
                .ok_or_else(|| "Missing encoding".to_string())?
                .parse::<Encoding>()?;
            Ok(TerminalCommand::Show(i, encoding))
        }),
        other => Err(format!("Unknown command :{}", other)),
    };
    Some(parsed.unwrap_or_else(TerminalCommand::Invalid))
}

fn print_help() {
    println!(":resend N        send message #N again");
    println!(":show N <enc>    render message #N as hex|binary|ascii|decimal|utf8|base64");
    println!(":clear           clear the message log");
    println!(":stats           message and byte counts");
    println!(":quit            disconnect and exit");
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Message(record) => print_record(record),
        SessionEvent::ConnectionState { phase, port_name } => {
            let text = match (phase, port_name) {
                (SessionPhase::Connected, Some(name)) => format!("-- connected to {}", name),
                (phase, _) => format!("-- {:?}", phase).to_lowercase(),
            };
            println!("{}", text.dark_grey());
        }
        SessionEvent::Error { reason, message } => {
            println!("{}", format!("!! {:?}: {}", reason, message).red());
        }
    }
    let _ = std::io::stdout().flush();
}

fn print_record(record: &MessageRecord) {
    match record.direction {
        Direction::Sent => println!("{}", format!("> {}", record.rendered_text).green()),
        Direction::Received => {
            let text = decode(&record.raw_bytes, Encoding::Ascii);
            let marker = if record.incomplete == Some(true) { " …" } else { "" };
            println!(
                "{}",
                format!("< {}  [{}]{}", text.trim_end(), record.rendered_text, marker).cyan()
            );
        }
    }
}
