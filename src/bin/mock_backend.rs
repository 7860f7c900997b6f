//! Mock backend binary for integration testing
//!
//! Behaves like the service the orchestrator drives: on its first start it
//! writes a default config file, generates an admin password and prints it
//! to stdout; it then serves `POST /login` on the given port.
//!
//! Flags:
//!   --port N          port to listen on (required)
//!   --config PATH     config file to create (default volatile/config/config.json)
//!   --no-marker       never print the admin password line
//!   --ignore-term     ignore SIGTERM so only SIGKILL stops it
//!   --spawn-child     start a long-lived `sleep` child in the same group

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MARKER: &str = "password for admin is:";

#[derive(Default)]
struct Options {
    port: u16,
    config: PathBuf,
    no_marker: bool,
    ignore_term: bool,
    spawn_child: bool,
}

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("mock_backend: {message}");
            std::process::exit(2);
        }
    };

    #[cfg(unix)]
    if options.ignore_term {
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    if options.spawn_child {
        match std::process::Command::new("sleep").arg("60").spawn() {
            Ok(child) => say(&format!("spawned child pid {}", child.id())),
            Err(e) => eprintln!("mock_backend: could not spawn child: {e}"),
        }
    }

    let password = match prepare(&options) {
        Ok(password) => password,
        Err(e) => {
            eprintln!("mock_backend: setup failed: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("127.0.0.1", options.port)) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("mock_backend: cannot bind port {}: {e}", options.port);
            std::process::exit(1);
        }
    };
    say(&format!("listening on 127.0.0.1:{}", options.port));

    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let password = password.clone();
        std::thread::spawn(move || {
            let _ = handle(stream, &password);
        });
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options {
        config: PathBuf::from("volatile/config/config.json"),
        ..Options::default()
    };
    let mut port = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args.next().ok_or("--port needs a value")?;
                port = Some(value.parse::<u16>().map_err(|e| format!("bad port: {e}"))?);
            }
            "--config" => {
                options.config = PathBuf::from(args.next().ok_or("--config needs a value")?);
            }
            "--no-marker" => options.no_marker = true,
            "--ignore-term" => options.ignore_term = true,
            "--spawn-child" => options.spawn_child = true,
            other => return Err(format!("unknown argument {other}")),
        }
    }
    options.port = port.ok_or("--port is required")?;
    Ok(options)
}

/// First start writes the config and the password; later starts reuse them
fn prepare(options: &Options) -> std::io::Result<String> {
    if let Some(dir) = options.config.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if !options.config.exists() {
        std::fs::write(&options.config, "{\n  \"services\": {}\n}\n")?;
    }

    let secret_file = secret_path(&options.config);
    if let Ok(existing) = std::fs::read_to_string(&secret_file) {
        return Ok(existing.trim().to_string());
    }

    let password = generate_password();
    std::fs::write(&secret_file, &password)?;
    if !options.no_marker {
        say(&format!("{MARKER} {password}"));
    }
    Ok(password)
}

fn secret_path(config: &Path) -> PathBuf {
    config.with_file_name("admin.secret")
}

fn generate_password() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:012x}", (nanos as u64) ^ ((std::process::id() as u64) << 20))
}

fn say(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn handle(stream: TcpStream, password: &str) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        // Readiness probes connect and hang up
        return Ok(());
    }

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let mut parts = request_line.split_whitespace();
    let (status, response) = match (parts.next(), parts.next()) {
        (Some("POST"), Some("/login")) => login(&body, password),
        _ => ("404 Not Found", json!({ "error": "not found" })),
    };
    respond(stream, status, &response)
}

fn login(body: &[u8], password: &str) -> (&'static str, Value) {
    let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    if request.get("password").and_then(Value::as_str) == Some(password) {
        ("200 OK", json!({ "proceed": true, "token": format!("tok-{password}") }))
    } else {
        ("401 Unauthorized", json!({ "error": "bad credentials" }))
    }
}

fn respond(mut stream: TcpStream, status: &str, body: &Value) -> std::io::Result<()> {
    let body = body.to_string();
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}
