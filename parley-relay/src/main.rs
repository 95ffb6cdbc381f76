use clap::{Args, Parser, Subcommand};
use log::info;
use parley_relay::{Modality, RelayClient, RelayError, RelayEvent, RelayServer, ServerConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "parley-relay", version, about = "Room-scoped real-time message relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Join a room and chat from the terminal
    Chat(ChatArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "PARLEY_BIND", default_value = "127.0.0.1:9090")]
    bind: String,
    /// Frames buffered per connection before broadcasts to it are dropped
    #[arg(long, env = "PARLEY_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,
    /// Largest accepted WebSocket message, in bytes
    #[arg(long, env = "PARLEY_MAX_FRAME_BYTES", default_value_t = 64 * 1024)]
    max_frame_bytes: usize,
}

#[derive(Args)]
struct ChatArgs {
    /// Relay base URL
    #[arg(long, default_value = "ws://127.0.0.1:9090")]
    url: String,
    #[arg(long, default_value = "public")]
    room: String,
    #[arg(long, default_value = "Guest")]
    user: String,
    /// Modality tag attached to every line sent
    #[arg(long, default_value = "text")]
    modality: Modality,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => chat(args).await,
    };
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> Result<(), RelayError> {
    let server = RelayServer::new(ServerConfig {
        bind_addr: args.bind,
        outbound_capacity: args.outbound_capacity,
        max_frame_bytes: args.max_frame_bytes,
    });

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down: {} connections served, {} chats relayed, {} rooms open",
                stats.total_connections, stats.chats_relayed, stats.active_rooms
            );
            Ok(())
        }
    }
}

async fn chat(args: ChatArgs) -> Result<(), RelayError> {
    let mut client = RelayClient::new(args.url, &args.room, &args.user);
    let mut events = client.take_event_rx().ok_or(RelayError::NotConnected)?;
    client.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    client.send_chat(text, args.modality).await?;
                }
                Some(_) => {}
                None => break,
            },
            event = events.recv() => match event {
                Some(RelayEvent::Hello { room, user }) => println!("* joined {room} as {user}"),
                Some(RelayEvent::Chat(message)) => {
                    println!("[{}] {}: {}", message.modality, message.user, message.text);
                }
                Some(RelayEvent::System(payload)) => println!("* {payload}"),
                Some(RelayEvent::Disconnected) | None => {
                    println!("* disconnected");
                    break;
                }
            },
        }
    }

    client.close().await;
    Ok(())
}
