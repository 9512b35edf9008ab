use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use chorus::config::NodeConfig;
use chorus::media::{Catalog, MpdCatalog, StaticCatalog};
use chorus::message::NodeAddress;
use chorus::overlay::{Command, Overlay, OverlayHandle};

#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Shared listening over a peer-to-peer overlay")]
struct Args {
    /// Address to listen on for overlay traffic (port 0 picks one).
    #[arg(long, default_value = "127.0.0.1:0", env = "CHORUS_LISTEN")]
    listen: NodeAddress,

    /// Port for the group sub-protocol servers (0 picks one).
    #[arg(long, default_value_t = 0, env = "CHORUS_GROUP_PORT")]
    group_port: u16,

    /// Control socket of the music player daemon fronting the local
    /// catalog. Without it the node runs with an empty catalog.
    #[arg(long, env = "CHORUS_MPD_SOCKET")]
    mpd_socket: Option<PathBuf>,

    /// Entry peers to join through at startup.
    #[arg(short, long = "connect", value_name = "HOST:PORT")]
    connect: Vec<NodeAddress>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let catalog: Arc<dyn Catalog> = match &args.mpd_socket {
        Some(socket) => Arc::new(MpdCatalog::new(socket)),
        None => {
            tracing::warn!("no catalog daemon configured, running with an empty catalog");
            Arc::new(StaticCatalog::empty())
        }
    };

    let config = NodeConfig {
        host: args.listen.host().to_owned(),
        listen_port: args.listen.port(),
        group_port: args.group_port,
        bootstrap: args.connect.clone(),
    };
    let (overlay, handle) = Overlay::bind(config, catalog)
        .await
        .context("cannot start the overlay")?;
    tracing::info!(address = %overlay.local_addr(), "node is up");
    tokio::spawn(overlay.run());

    shell(handle).await
}

/// Reads commands from stdin until end-of-file or an exit command.
async fn shell(handle: OverlayHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "x" | "exit" | "q" | "quit") {
            break;
        }
        dispatch(&handle, line).await;
    }
    Ok(())
}

async fn dispatch(handle: &OverlayHandle, line: &str) {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return;
    };
    match head {
        "join" => {
            let mut candidates = Vec::new();
            for word in words {
                match word.parse::<NodeAddress>() {
                    Ok(address) => candidates.push(address),
                    Err(error) => {
                        eprintln!("{error}");
                        return;
                    }
                }
            }
            if candidates.is_empty() {
                eprintln!("usage: join <host:port> [<host:port>...]");
                return;
            }
            handle.command(Command::Join(candidates));
        }
        "s" | "status" => match handle.status().await {
            Some(report) => print!("{report}"),
            None => eprintln!("the overlay engine is gone"),
        },
        "sample" => handle.command(Command::Sample),
        "g" | "group" => group_dispatch(handle, words.collect::<Vec<_>>()).await,
        _ => help(),
    }
}

async fn group_dispatch(handle: &OverlayHandle, args: Vec<&str>) {
    match args.as_slice() {
        ["new"] => handle.command(Command::GroupNew),
        ["find"] => handle.command(Command::GroupFind),
        ["join"] => handle.command(Command::GroupJoin { leader: None }),
        ["join", address] => match address.parse::<NodeAddress>() {
            Ok(leader) => handle.command(Command::GroupJoin {
                leader: Some(leader),
            }),
            Err(error) => eprintln!("{error}"),
        },
        ["leave"] => handle.command(Command::GroupLeave),
        ["music"] => match handle.group_music().await {
            Some(listing) if !listing.is_empty() => {
                for (index, (hash, track)) in listing.iter().enumerate() {
                    match track {
                        Some(track) => println!("{index}: {track}"),
                        None => println!("{index}: {hash}"),
                    }
                }
            }
            _ => println!("*no group music*"),
        },
        ["play"] => handle.command(Command::GroupPlay { index: 0 }),
        ["play", index] => match index.parse() {
            Ok(index) => handle.command(Command::GroupPlay { index }),
            Err(_) => eprintln!("invalid playlist index: {index}"),
        },
        ["add", index] => match index.parse() {
            Ok(index) => handle.command(Command::GroupAdd { index }),
            Err(_) => eprintln!("invalid song index: {index}"),
        },
        _ => help(),
    }
}

fn help() {
    println!("[Commands]");
    println!("  join <peer>... -- join the overlay");
    println!("  s[tatus] -- print status information");
    println!("  sample -- offer a catalog sample to the neighbours");
    println!("  q[uit]");
    println!("[Group commands]");
    println!("  g new -- create a new group");
    println!("  g find -- find available groups");
    println!("  g join [leader] -- join the best known (or given) group");
    println!("  g music -- list group music");
    println!("  g add <song_no> -- add a group song to the playlist");
    println!("  g play [number] -- play from the shared playlist");
    println!("  g leave -- leave the group");
}
