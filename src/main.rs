use anyhow::{Context, bail};
use callcore::{UserId, format_duration};
use chrono::Local;
use clap::{Parser, ValueEnum};
use futures_util::future;
use log::{info, warn};
use p2p_calls::calls::peer::PeerConnectionFactory;
use p2p_calls::calls::{
    CallSessionController, CallState, IncomingCallWatcher, LoopbackNetwork, SyntheticDevices,
    WebRtcPeerFactory,
};
use p2p_calls::config::CallConfig;
use p2p_calls::signaling::MemorySignalHub;
use p2p_calls::store::{CallRecordStore, CallerProfile, MemoryCallStore, MemoryDirectory};
use p2p_calls::types::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// Plays one call between two in-process users, "alice" (caller) and "bob"
// (receiver), sharing a record store and a signal hub.
//
// Usage:
//   cargo run                                  # audio call, answered after 2s
//   cargo run -- --video --hangup-after 5      # video call, 5s long
//   cargo run -- --decline                     # bob declines
//   cargo run -- --no-answer --ring-timeout 3  # nobody picks up
//   cargo run -- --backend webrtc              # real peer connections

#[derive(Parser)]
#[command(name = "p2p-calls")]
#[command(about = "Peer-to-peer call signaling demo")]
struct Cli {
    /// Place a video call instead of an audio call.
    #[arg(long)]
    video: bool,

    /// Seconds bob lets the call ring before answering.
    #[arg(long, default_value_t = 2)]
    answer_after: u64,

    /// Bob declines instead of answering.
    #[arg(long, conflicts_with = "no_answer")]
    decline: bool,

    /// Bob never reacts; the call runs into the ring timeout.
    #[arg(long)]
    no_answer: bool,

    /// Seconds the connected call lasts before alice hangs up.
    #[arg(long, default_value_t = 3)]
    hangup_after: u64,

    /// Seconds an outgoing call rings before it is marked missed.
    #[arg(long, default_value_t = 30)]
    ring_timeout: u64,

    #[arg(long, value_enum, default_value_t = Backend::Loopback)]
    backend: Backend,

    /// Print the final call records as JSON.
    #[arg(short, long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Loopback,
    Webrtc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let alice_id = UserId::new("alice");
    let bob_id = UserId::new("bob");

    let store = MemoryCallStore::new();
    let hub = MemorySignalHub::new();
    let directory = MemoryDirectory::new();
    directory
        .insert(CallerProfile::new(alice_id.clone()).with_display_name("Alice"))
        .await;
    directory
        .insert(CallerProfile::new(bob_id.clone()).with_display_name("Bob"))
        .await;

    let factory: Arc<dyn PeerConnectionFactory> = match cli.backend {
        Backend::Loopback => Arc::new(LoopbackNetwork::new()),
        Backend::Webrtc => Arc::new(WebRtcPeerFactory::new()),
    };
    let config = CallConfig::default().with_ring_timeout(Duration::from_secs(cli.ring_timeout));

    let build = |user: &UserId, events: Arc<EventBus>| {
        CallSessionController::builder(user.clone())
            .with_store(Arc::new(store.clone()))
            .with_transport(Arc::new(hub.clone()))
            .with_capture_devices(Arc::new(SyntheticDevices::new()))
            .with_peer_factory(Arc::clone(&factory))
            .with_config(config.clone())
            .with_event_bus(events)
            .build()
    };
    let alice = build(&alice_id, Arc::new(EventBus::new())).await?;
    let bob_events = Arc::new(EventBus::new());
    let bob = build(&bob_id, Arc::clone(&bob_events)).await?;
    let watcher = IncomingCallWatcher::start(
        bob_id.clone(),
        Arc::new(store.clone()),
        Arc::new(directory),
        bob_events,
    )
    .await?;

    let mut notices = alice.events().notice.subscribe();
    let notice_log = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!("alice: {}: {}", notice.title, notice.message);
        }
    });

    let mut incoming = watcher.subscribe();
    let record = alice.start_call(&bob_id, cli.video).await?;
    info!("alice is calling bob ({})", record.id);

    let call = tokio::time::timeout(Duration::from_secs(5), incoming.wait_for(Option::is_some))
        .await
        .context("bob never saw the call")??
        .clone()
        .context("incoming call vanished")?;
    info!(
        "bob: {}: {}",
        call.notification_title(),
        call.notification_body()
    );

    let mut alice_state = alice.subscribe_state();
    if cli.no_answer {
        info!("bob does not pick up");
    } else if cli.decline {
        tokio::time::sleep(Duration::from_secs(cli.answer_after)).await;
        bob.decline_call(&call.call.id).await?;
    } else {
        tokio::time::sleep(Duration::from_secs(cli.answer_after)).await;
        watcher.clear();
        bob.answer_call(&call.call).await?;

        wait_for_state(&mut alice_state, CallState::Connected, Duration::from_secs(30)).await?;
        info!("Connected, hanging up in {}s", cli.hangup_after);
        tokio::time::sleep(Duration::from_secs(cli.hangup_after)).await;
        info!("Call duration {}", format_duration(alice.call_duration()));
        alice.end_call().await;
    }

    let idle_within = Duration::from_secs(cli.ring_timeout + 5);
    wait_for_state(&mut alice_state, CallState::Idle, idle_within).await?;
    wait_for_state(&mut bob.subscribe_state(), CallState::Idle, idle_within).await?;

    future::join(alice.shutdown(), bob.shutdown()).await;
    notice_log.abort();

    let final_record = store
        .get(&record.id)
        .await?
        .context("call record disappeared")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&final_record)?);
    } else {
        info!(
            "Call {} finished as {} (started {:?}, ended {:?})",
            final_record.id, final_record.status, final_record.started_at, final_record.ended_at
        );
    }
    Ok(())
}

async fn wait_for_state(
    rx: &mut watch::Receiver<CallState>,
    target: CallState,
    limit: Duration,
) -> anyhow::Result<()> {
    let waited = tokio::time::timeout(limit, rx.wait_for(|state| *state == target))
        .await
        .map(|r| r.map(|_| ()));
    match waited {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => bail!("controller went away while waiting for {}", target),
        Err(_) => {
            warn!("Still {} after {:?}", *rx.borrow(), limit);
            bail!("timed out waiting for {}", target)
        }
    }
}
