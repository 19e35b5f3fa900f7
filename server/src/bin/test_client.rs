use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use shared::{Command, ServerMessage};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Scripted lobby client: creates or joins a game, then leaves it.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server WebSocket URL
    #[clap(short, long, default_value = "ws://127.0.0.1:8080/")]
    url: String,
    /// Username to play as
    #[clap(short = 'n', long, default_value = "tester")]
    username: String,
    /// Join this game instead of creating one
    #[clap(short, long)]
    code: Option<String>,
    /// Seconds to stay in the game and print notices
    #[clap(short, long, default_value = "5")]
    linger: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.url);
    let (ws, _) = tokio_tungstenite::connect_async(args.url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    let first = match args.code {
        Some(code) => Command::JoinGame {
            username: args.username.clone(),
            code,
        },
        None => Command::CreateGame {
            username: args.username.clone(),
        },
    };

    for command in [first, Command::LeaveGame] {
        let frame = serde_json::to_string(&command.to_envelope())?;
        println!("-> {}", frame);
        write.send(Message::Text(frame)).await?;

        // Notices may arrive before the response to our command.
        let linger = match command {
            Command::LeaveGame => Duration::from_secs(2),
            _ => Duration::from_secs(args.linger),
        };
        let deadline = tokio::time::Instant::now() + linger;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = match timeout(remaining, read.next()).await {
                Ok(Some(frame)) => frame?,
                Ok(None) => {
                    println!("Server closed the connection");
                    return Ok(());
                }
                Err(_) => break,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(reason) => {
                    println!("Server closed the connection: {:?}", reason);
                    return Ok(());
                }
                _ => continue,
            };

            match ServerMessage::parse(&text)? {
                ServerMessage::Response(response) => match (&response.data, &response.error) {
                    (Some(view), _) => println!(
                        "<- {} ok: game {} as {} ({})",
                        response.kind, view.code, view.username, view.role
                    ),
                    (_, Some(error)) => {
                        println!("<- {} failed: {} {}", response.kind, error.code, error.description)
                    }
                    _ => println!("<- {}", text),
                },
                ServerMessage::Notice(notice) => println!("<- notice {:?}", notice),
            }
        }
    }

    write.close().await?;
    println!("Done");
    Ok(())
}
