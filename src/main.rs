//! warden command line: `warden daemon` runs the runtime, the remaining
//! subcommands are one-shot clients of its control socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tabwriter::TabWriter;

use warden::api::{Request, Response};
use warden::config::{self, Config, DEFAULT_CONFIG_PATH};
use warden::daemon::Daemon;
use warden::logger;

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Container runtime daemon", version)]
struct Opts {
    /// Configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log file; defaults to stderr.
    #[arg(short, long)]
    log: Option<PathBuf>,
    /// Control socket path, overriding the configuration.
    #[arg(short, long)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the container runtime daemon.
    Daemon,
    /// Register a new container.
    Create { name: String },
    /// Stop and remove a container.
    Destroy { name: String },
    /// List containers with their state.
    List,
    /// Start a container.
    Start { name: String },
    /// Stop a container: SIGTERM, then SIGKILL.
    Stop { name: String },
    /// Freeze a running container.
    Pause { name: String },
    /// Thaw a paused container.
    Resume { name: String },
    /// Send a signal to a container's init process.
    Kill { name: String, signal: String },
    /// Read a container property.
    Get { name: String, property: String },
    /// Set a container property; only allowed while stopped.
    Set {
        name: String,
        property: String,
        value: String,
    },
    /// Read runtime data: state, pid, exit_status, memory_usage, cpu_usage.
    Data { name: String, key: String },
}

fn client_request(socket: &PathBuf, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .with_context(|| format!("connect to {}", socket.display()))?;
    let mut writer = stream.try_clone()?;
    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes())?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.trim().is_empty() {
        bail!("daemon closed the connection without a response");
    }
    Ok(serde_json::from_str(&line)?)
}

fn print_response(response: Response) {
    match response {
        Response::Ok => {}
        Response::Value(value) => println!("{}", value),
        Response::List(list) => {
            let mut tw = TabWriter::new(std::io::stdout());
            let _ = writeln!(&mut tw, "NAME\tSTATE\tPID");
            for c in list {
                let pid = if c.pid > 0 {
                    c.pid.to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(&mut tw, "{}\t{}\t{}", c.name, c.state, pid);
            }
            let _ = tw.flush();
        }
        Response::Error { code, message, .. } => {
            eprintln!("error: {}", message);
            exit(code as i32);
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let config_path = opts
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut cfg = if config_path.exists() {
        Config::load(&config_path).map_err(|e| anyhow::anyhow!("{}", e))?
    } else {
        Config::default()
    };
    if let Some(socket) = &opts.socket {
        cfg.daemon.socket_path = socket.clone();
    }
    config::init(cfg);

    let request = match &opts.command {
        Command::Daemon => {
            logger::init(opts.log.clone(), config::config().log.verbose)?;
            return Daemon::new().run().map_err(|e| anyhow::anyhow!("{}", e));
        }
        Command::Create { name } => Request::Create { name: name.clone() },
        Command::Destroy { name } => Request::Destroy { name: name.clone() },
        Command::List => Request::List,
        Command::Start { name } => Request::Start { name: name.clone() },
        Command::Stop { name } => Request::Stop { name: name.clone() },
        Command::Pause { name } => Request::Pause { name: name.clone() },
        Command::Resume { name } => Request::Resume { name: name.clone() },
        Command::Kill { name, signal } => Request::Kill {
            name: name.clone(),
            signal: signal.clone(),
        },
        Command::Get { name, property } => Request::GetProperty {
            name: name.clone(),
            property: property.clone(),
        },
        Command::Set {
            name,
            property,
            value,
        } => Request::SetProperty {
            name: name.clone(),
            property: property.clone(),
            value: value.clone(),
        },
        Command::Data { name, key } => Request::GetData {
            name: name.clone(),
            key: key.clone(),
        },
    };

    let socket = config::config().daemon.socket_path.clone();
    let response = client_request(&socket, &request)?;
    print_response(response);
    Ok(())
}
