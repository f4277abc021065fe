use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    envelope::ServerEnvelope,
    link::{self, Inbox, ServerLink},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut link, mut inbox) = link::connect(args.server, &args.username)
        .await
        .context("could not join the chat")?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_chat_loop(&mut link, &mut inbox, &mut stdin, &mut input).await?;
    if let Err(error) = link.disconnect().await {
        debug!(?error, "could not send the goodbye envelope");
    }

    Ok(())
}

async fn run_chat_loop(
    link: &mut ServerLink,
    inbox: &mut Inbox,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            envelope = inbox.recv() => {
                if !handle_inbox_envelope(envelope).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, link).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_inbox_envelope(envelope: Option<ServerEnvelope>) -> Result<bool> {
    match envelope {
        Some(envelope) => {
            render_envelope(envelope).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    link: &mut ServerLink,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving the chat").await?;
        return Ok(false);
    }

    link.send_chat(text).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_envelope(envelope: ServerEnvelope) -> io::Result<()> {
    match envelope {
        ServerEnvelope::LoginSuccess { message } => {
            write_stdout(&format!("*** {message}")).await
        }
        ServerEnvelope::UserList { users } => {
            write_stdout(&format!("*** currently online: {}", users.join(", "))).await
        }
        ServerEnvelope::UserJoined { message, .. } => {
            write_stdout(&format!("*** {message}")).await
        }
        ServerEnvelope::UserLeft { message, .. } => {
            write_stdout(&format!("*** {message}")).await
        }
        ServerEnvelope::Message {
            username,
            message,
            timestamp,
        } => write_stdout(&format!("[{timestamp}] {username}: {message}")).await,
        ServerEnvelope::Error { message } => write_stderr(&format!("!!! {message}")).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
