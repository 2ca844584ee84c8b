use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use route_machine::bus::{BusConnection, ListReply, ServerOp, Subjects, LIST_REPLY_WINDOW};
use route_machine::registry::BackendDescriptor;

#[derive(Parser)]
#[command(name = "route-ctl")]
#[command(about = "Control bus client for route-machine", long_about = None)]
struct Cli {
    /// NATS server address
    #[arg(short, long, default_value = "127.0.0.1:4222")]
    bus: String,

    /// Subject prefix the routers subscribe to
    #[arg(short, long, default_value = "router")]
    prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// Virtual host served by the backend (repeatable)
    #[arg(short, long = "uri", required = true)]
    uris: Vec<String>,

    #[arg(long)]
    host: String,

    #[arg(long)]
    port: u16,

    #[arg(long, default_value = "")]
    instance_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a backend to the listed virtual hosts
    Register(BackendArgs),
    /// Remove a backend from the listed virtual hosts
    Unregister(BackendArgs),
    /// Print every worker's registry
    List {
        /// How long to collect replies, in milliseconds
        #[arg(long, default_value_t = LIST_REPLY_WINDOW.as_millis() as u64)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let subjects = Subjects::new(&cli.prefix);
    let mut conn = BusConnection::connect(&cli.bus, "route-ctl").await?;

    match cli.command {
        Commands::Register(args) => {
            let payload = serde_json::to_vec(&descriptor(args))?;
            conn.publish(&subjects.register, None, payload).await?;
            conn.flush().await?;
        }
        Commands::Unregister(args) => {
            let payload = serde_json::to_vec(&descriptor(args))?;
            conn.publish(&subjects.unregister, None, payload).await?;
            conn.flush().await?;
        }
        Commands::List { wait_ms } => {
            let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
            conn.subscribe(&inbox, 1).await?;
            conn.publish(&subjects.list, Some(&inbox), b"{}".to_vec()).await?;

            let window = tokio::time::sleep(Duration::from_millis(wait_ms));
            tokio::pin!(window);
            loop {
                tokio::select! {
                    op = conn.next() => match op? {
                        Some(ServerOp::Msg { subject, payload, .. }) if subject == inbox => {
                            print_reply(serde_json::from_slice(&payload)?);
                        }
                        Some(ServerOp::Err(reason)) => return Err(reason.into()),
                        Some(_) => {}
                        None => break,
                    },
                    _ = &mut window => break,
                }
            }
        }
    }

    Ok(())
}

fn descriptor(args: BackendArgs) -> BackendDescriptor {
    BackendDescriptor {
        hostname: args.host,
        port: args.port,
        instance_id: args.instance_id,
        uris: args.uris,
        ..Default::default()
    }
}

fn print_reply(reply: ListReply) {
    println!("worker {}", reply.uid);
    for (vhost, backends) in reply.hosts {
        println!("  {vhost}");
        for b in backends {
            let state = if b.demoted { " (demoted)" } else { "" };
            println!("    {}:{} {}{}", b.hostname, b.port, b.instance_id, state);
        }
    }
}
