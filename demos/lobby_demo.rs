use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use lobbylink::session::driver::run_session;
use lobbylink::session::launch_args::connect_lobby_arg;
use lobbylink::session::session_config::SessionConfig;
use lobbylink::session::{LobbyState, Session};
use lobbylink::substrate::memory::MemoryNetwork;
use lobbylink::substrate::peer_identity::PeerIdentity;
use lobbylink::transport::message_handler::MessageContext;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{info, Level};

const CHAT: i16 = 100;
const POSITION: i16 = 101;

const CHAT_CHANNEL: u8 = 0;
const POSITION_CHANNEL: u8 = 1;

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 3)]
    num_joiners: u64,

    #[clap(long, default_value_t = 5)]
    num_positions: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn new_session(network: &MemoryNetwork, identity: PeerIdentity, config: SessionConfig) -> anyhow::Result<Session> {
    let endpoint = network.endpoint(identity);
    Session::new(Arc::new(config), endpoint.clone(), endpoint)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let network = MemoryNetwork::new();

    // the first joiner is invited directly, all others join through their launch arguments
    let mut host_config = SessionConfig::new();
    host_config.max_members = args.num_joiners as usize + 1;
    host_config.auto_invite = Some(PeerIdentity(1));
    let mut host = new_session(&network, PeerIdentity(0), host_config)?;

    let num_received = Arc::new(AtomicUsize::new(0));
    let counter = num_received.clone();
    host.register_handler(CHAT, Arc::new(move |ctx: &MessageContext, payload: &[u8]| {
        counter.fetch_add(1, Ordering::AcqRel);
        info!("chat from {}: {}", ctx.from, String::from_utf8_lossy(payload));
    }))?;
    let counter = num_received.clone();
    host.register_handler(POSITION, Arc::new(move |ctx: &MessageContext, payload: &[u8]| {
        counter.fetch_add(1, Ordering::AcqRel);
        info!("position of {}: {}", ctx.from, String::from_utf8_lossy(payload));
    }))?;

    host.invite_friends()?;
    let group = host.group().ok_or_else(|| anyhow::anyhow!("no group after inviting"))?;
    info!("hosting {}", group);

    let (shutdown_send, shutdown_recv) = oneshot::channel();
    let host_task = tokio::spawn(async move {
        run_session(&mut host, shutdown_recv).await
    });

    let mut joiners = Vec::new();
    for n in 1..=args.num_joiners {
        let mut joiner = new_session(&network, PeerIdentity(n), SessionConfig::new())?;
        if n > 1 {
            let launch_args = format!("lobby_demo {}", connect_lobby_arg(group));
            let launch_args = launch_args.split_whitespace().collect::<Vec<_>>();
            joiner.handle_launch_args(&launch_args)?;
        }
        joiners.push(joiner);
    }

    let mut ticks = interval(Duration::from_millis(16));
    let mut invite_accepted = false;
    let mut num_sent = 0;
    let mut positions_sent = vec![0; joiners.len()];

    while positions_sent.iter().any(|&n| n < args.num_positions) {
        ticks.tick().await;

        if !invite_accepted && !network.pending_invites(PeerIdentity(1)).is_empty() {
            network.accept_invite(PeerIdentity(1), group);
            invite_accepted = true;
        }

        for (joiner, sent) in joiners.iter_mut().zip(positions_sent.iter_mut()) {
            joiner.tick();
            if joiner.lobby_state() == LobbyState::Failed {
                return Err(anyhow::anyhow!("{:?} failed: {:?}", joiner, joiner.last_failure()));
            }
            if !joiner.is_connected_to_server() || *sent >= args.num_positions {
                continue;
            }

            if *sent == 0 {
                joiner.send_to_host(CHAT, format!("hello from {}", joiner.myself()).as_bytes(), CHAT_CHANNEL)?;
                num_sent += 1;
            }
            let position = format!("{},{}", *sent, joiner.myself().0 * 10);
            joiner.queue_message(PeerIdentity(0), POSITION, position.as_bytes(), POSITION_CHANNEL)?;
            *sent += 1;
            num_sent += 1;
        }
    }

    for joiner in joiners.iter_mut() {
        joiner.flush();
    }
    // give the host a moment to receive the last batch
    tokio::time::sleep(Duration::from_millis(100)).await;

    for joiner in joiners.iter_mut() {
        joiner.disconnect();
    }
    shutdown_send.send(()).ok();
    host_task.await??;

    info!("sent {} messages, host received {}", num_sent, num_received.load(Ordering::Acquire));
    Ok(())
}
