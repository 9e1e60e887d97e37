//! Stand-in for the real proxy binary, for dry runs and tests.
//!
//! Reads a rendered config, listens on its SOCKS inbound and answers every
//! SOCKS5 CONNECT by serving the HTTP request itself. Behaviour is tuned by
//! an optional `stub` object in the template:
//!
//! ```json
//! "stub": {
//!     "delay_ms": 50,
//!     "status": 204,
//!     "refuse_hosts": ["bad.com"],
//!     "crash_hosts": ["crash.com"],
//!     "ignore_term": false,
//!     "pid_dir": "/tmp/pids"
//! }
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use frontprobe::template::DEFAULT_HOST_POINTER;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug)]
#[command(name = "probe-stub", about = "Fake proxy answering every request locally")]
struct Args {
    /// Accepted for command-line compatibility with `xray run -c`
    mode: Option<String>,

    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StubBehaviour {
    delay_ms: u64,
    status: Option<u16>,
    refuse_hosts: Vec<String>,
    crash_hosts: Vec<String>,
    ignore_term: bool,
    pid_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read {}", args.config.display()))?;
    let config: Value = serde_json::from_str(&raw)?;

    let behaviour: StubBehaviour = match config.get("stub") {
        Some(stub) => serde_json::from_value(stub.clone())?,
        None => StubBehaviour::default(),
    };

    #[cfg(unix)]
    let _term_guard = if behaviour.ignore_term {
        Some(tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )?)
    } else {
        None
    };

    let host = config
        .pointer(DEFAULT_HOST_POINTER)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if let Some(dir) = &behaviour.pid_dir {
        std::fs::write(dir.join(format!("{host}.pid")), std::process::id().to_string())?;
    }

    if behaviour.crash_hosts.contains(&host) {
        bail!("configured to crash for {host}");
    }

    if behaviour.refuse_hosts.contains(&host) {
        std::future::pending::<()>().await;
    }

    let port = socks_port(&config).context("config has no SOCKS inbound port")?;
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let status = behaviour.status.unwrap_or(204);

    loop {
        let (stream, _) = listener.accept().await?;
        let delay = Duration::from_millis(behaviour.delay_ms);
        tokio::spawn(async move {
            let _ = serve(stream, delay, status).await;
        });
    }
}

fn socks_port(config: &Value) -> Option<u16> {
    let inbounds = config.get("inbounds")?.as_array()?;
    let socks = inbounds
        .iter()
        .find(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some("socks"))
        .or_else(|| inbounds.first())?;

    socks.get("port")?.as_u64().and_then(|port| u16::try_from(port).ok())
}

async fn serve(mut stream: TcpStream, delay: Duration, status: u16) -> Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != 5 {
        bail!("not a SOCKS5 client");
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    match request[3] {
        1 => skip(&mut stream, 4).await?,
        3 => {
            let len = stream.read_u8().await?;
            skip(&mut stream, len as usize).await?;
        }
        4 => skip(&mut stream, 16).await?,
        other => bail!("unknown address type {other}"),
    }
    skip(&mut stream, 2).await?;
    stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..read]);
    }

    sleep(delay).await;
    let length = if status == 204 { "" } else { "content-length: 0\r\n" };
    let response = format!("HTTP/1.1 {status} Stub\r\n{length}connection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn skip(stream: &mut TcpStream, len: usize) -> Result<()> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(())
}
