use anyhow::Result;
use clap::Parser;
use client_core::{Identity, SyncClient, SyncConfig, SyncEvent};
use shared::domain::{BodyType, UserId};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    token: String,
    /// Optional counterpart to send one message to after startup.
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value = "hello from the console client")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let identity = Identity::new(UserId::new(args.user_id), args.token);
    let config = SyncConfig::with_server_url(args.server_url);
    let client = SyncClient::new(config, identity)?;
    let mut events = client.subscribe();

    client.start().await;
    println!("engine ready; {} conversation(s):", client.conversations().await.len());
    for summary in client.conversations().await {
        println!(
            "  {} [{} unread]{}",
            summary.display_name,
            summary.unread_count,
            if summary.is_online { " (online)" } else { "" }
        );
    }

    if let Some(to) = args.to {
        let receiver = UserId::new(to);
        client.set_active_conversation(Some(receiver.clone())).await;
        let temp_id = client
            .send_message(&receiver, &args.message, BodyType::Text)
            .await;
        println!("queued message {temp_id} to {receiver}");
    }

    println!("streaming events; ctrl-c to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(SyncEvent::MessagesUpdated { conversation_id }) => {
                        if let Some(last) = client.messages(&conversation_id).await.last() {
                            println!(
                                "[{}] {}: {} ({:?})",
                                conversation_id, last.sender_id, last.body, last.delivery_status
                            );
                        }
                    }
                    Ok(SyncEvent::ConnectionChanged(state)) => println!("connection: {state:?}"),
                    Ok(SyncEvent::TypingChanged { user_id, typing }) => {
                        println!("{user_id} {}", if typing { "is typing" } else { "stopped typing" });
                    }
                    Ok(SyncEvent::Error(message)) => eprintln!("error: {message}"),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
