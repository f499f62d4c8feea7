//! Command-line client

use anyhow::Context;
use clap::{Parser, Subcommand};
use kv2pc::common::{encode_command, parse_duration, DecodeError, Decoder, Reply};
use kv2pc::Command;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "kv2pc")]
#[command(about = "kv2pc key-value store CLI")]
#[command(version)]
struct Cli {
    /// Coordinator address
    #[arg(long, default_value = "127.0.0.1:8080")]
    coordinator: String,

    /// Give up after this long (e.g. 500ms, 5s)
    #[arg(long, default_value = "5s")]
    timeout: String,

    /// Print the raw wire reply instead of a readable one
    #[arg(long)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get {
        key: String,
    },

    /// Write a key (extra words are joined with spaces)
    Set {
        key: String,
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },

    /// Delete one or more keys
    Del {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let timeout = parse_duration(&cli.timeout)?;

    let cmd = match cli.command {
        Commands::Get { key } => Command::get(key),
        Commands::Set { key, value } => Command::set(key, value.join(" ")),
        Commands::Del { keys } => Command::del(keys),
    };

    let reply = tokio::time::timeout(timeout, request(&cli.coordinator, &cmd))
        .await
        .context("timed out waiting for the coordinator")??;

    if cli.raw {
        print!("{}", String::from_utf8_lossy(&reply.to_vec()));
    } else {
        println!("{}", render(&reply));
    }
    if reply.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

async fn request(addr: &str, cmd: &Command) -> anyhow::Result<Reply> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    stream.write_all(&encode_command(cmd)).await?;

    let mut buf = Vec::with_capacity(256);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            anyhow::bail!("coordinator closed the connection");
        }
        match Decoder::new(&buf).next_reply() {
            Ok(reply) => return Ok(reply),
            Err(DecodeError::Incomplete) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn render(reply: &Reply) -> String {
    match reply {
        Reply::Nil => "(nil)".to_string(),
        Reply::Integer(n) => format!("(integer) {}", n),
        Reply::Data(d) => String::from_utf8_lossy(d).into_owned(),
        Reply::Error(e) => format!("(error) {}", e),
        Reply::Status(s) => s.clone(),
        Reply::Array(items) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(" "),
    }
}
