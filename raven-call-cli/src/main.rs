//! Raven Call CLI
//!
//! Runs call scenarios against in-memory collaborators and prints the UI
//! events and backend requests they produce.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raven_call_core::loopback::{LoopbackRealtime, LoopbackWorld};
use raven_call_core::prelude::*;
use raven_call_core::signaling::{CallStatusUpdate, IncomingCallNotice};
use raven_call_core::OngoingCall;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local user id
    #[arg(short, long, env = "RAVEN_CALL_USER", default_value = "alice")]
    user: String,

    /// JSON configuration file
    #[arg(short, long, env = "RAVEN_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call
    Dial {
        /// User to call
        peer: String,

        /// Video call
        #[arg(long)]
        video: bool,

        /// The callee is already in another call
        #[arg(long)]
        peer_busy: bool,

        /// No microphone is plugged in
        #[arg(long)]
        no_microphone: bool,

        /// Delay before the callee answers
        #[arg(long, default_value = "1500")]
        answer_after_ms: u64,

        /// How long the call lasts once connected
        #[arg(long, default_value = "3000")]
        talk_ms: u64,

        /// The callee never answers
        #[arg(long)]
        never_answer: bool,
    },

    /// Receive a call
    Incoming {
        /// Calling user
        caller: String,

        /// Video call
        #[arg(long)]
        video: bool,

        /// Arrive while another call is active
        #[arg(long)]
        while_busy: bool,

        /// How long the call lasts once answered
        #[arg(long, default_value = "3000")]
        talk_ms: u64,
    },

    /// Rejoin a call abandoned by a previous session
    Rejoin {
        /// How long the call lasts once reconnected
        #[arg(long, default_value = "3000")]
        talk_ms: u64,
    },

    /// Print the effective configuration
    Config,

    /// Show the service status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("raven_call=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    match cli.command {
        Commands::Dial {
            peer,
            video,
            peer_busy,
            no_microphone,
            answer_after_ms,
            talk_ms,
            never_answer,
        } => {
            let options = DialOptions {
                kind: CallKind::from_video_flag(video),
                peer_busy,
                no_microphone,
                answer_after: (!never_answer).then(|| Duration::from_millis(answer_after_ms)),
                talk: Duration::from_millis(talk_ms),
            };
            handle_dial(&cli.user, &peer, options, config).await?;
        }
        Commands::Incoming {
            caller,
            video,
            while_busy,
            talk_ms,
        } => {
            handle_incoming(
                &cli.user,
                &caller,
                video,
                while_busy,
                Duration::from_millis(talk_ms),
                config,
            )
            .await?;
        }
        Commands::Rejoin { talk_ms } => {
            handle_rejoin(&cli.user, Duration::from_millis(talk_ms), config).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Status => {
            handle_status(&cli.user, config).await?;
        }
    }

    Ok(())
}

struct DialOptions {
    kind: CallKind,
    peer_busy: bool,
    no_microphone: bool,
    answer_after: Option<Duration>,
    talk: Duration,
}

/// A started service over a loopback world, with its events printed
struct Simulation {
    world: LoopbackWorld,
    service: CallService<LoopbackRealtime>,
    printer: JoinHandle<()>,
}

impl Simulation {
    async fn start(user: &str, config: ServiceConfig) -> Result<(Self, Option<OngoingCall>)> {
        Self::start_with(LoopbackWorld::new(user), config).await
    }

    async fn start_with(
        world: LoopbackWorld,
        config: ServiceConfig,
    ) -> Result<(Self, Option<OngoingCall>)> {
        let signaling = Arc::new(SignalingHandler::new(world.realtime.clone()));
        let service = CallService::builder(signaling, world.collaborators())
            .with_config(config)
            .build()
            .await?;

        let mut events = service.subscribe_events();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => println!("📣 {json}"),
                    Err(e) => tracing::warn!(error = %e, "Event not printable"),
                }
            }
        });

        let ongoing = service.start().await?;
        println!("✅ Call service started for {}", service.credentials().user.user_id);
        Ok((
            Self {
                world,
                service,
                printer,
            },
            ongoing,
        ))
    }

    fn controller(&self) -> &CallSessionController {
        self.service.controller()
    }

    /// Remote side of the backend reporting a status for the current session
    fn remote_status(&self, status: &str) {
        if let Some(session_id) = self.controller().session_id() {
            self.world
                .realtime
                .publish(RealtimeEvent::CallStatusUpdate(CallStatusUpdate {
                    session_id,
                    status: status.to_string(),
                    answered_at: None,
                    end_time: None,
                }));
        }
    }

    async fn finish(self) {
        settle().await;
        self.service.stop();
        self.printer.abort();

        println!();
        println!("🧾 Backend requests:");
        for request in self.world.backend.requests() {
            println!("   {request:?}");
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn handle_dial(user: &str, peer: &str, options: DialOptions, config: ServiceConfig) -> Result<()> {
    let peer = UserId::new(peer);
    let answer_timeout = config.call.answer_timeout() + config.call.media_sweep_delay();
    let world = LoopbackWorld::new(user);
    world.backend.set_busy(&peer, options.peer_busy);
    world.devices.set_has_microphone(!options.no_microphone);
    let (sim, _) = Simulation::start_with(world, config).await?;

    println!("📞 Calling {peer} ({})...", options.kind.as_str());
    match sim.controller().dial(&peer, None, options.kind).await {
        Ok(session_id) => println!("📞 Ringing, session {session_id}"),
        Err(e) => {
            println!("❌ Call not placed: {e}");
            sim.finish().await;
            return Ok(());
        }
    }

    let Some(answer_after) = options.answer_after else {
        println!("⏳ Waiting for the answer timeout...");
        tokio::time::sleep(answer_timeout).await;
        sim.finish().await;
        return Ok(());
    };

    tokio::time::sleep(answer_after).await;
    if let Some(call) = sim.world.client.last_call() {
        sim.remote_status("connected");
        call.signal(3, "Answered");
        call.deliver_remote(true, options.kind.is_video());
    }
    settle().await;
    println!("🟢 Connected");

    tokio::time::sleep(options.talk).await;
    sim.controller().hangup().await?;
    println!("📴 Hung up");
    sim.controller().dismiss().await.ok();
    sim.finish().await;
    Ok(())
}

async fn handle_incoming(
    user: &str,
    caller: &str,
    video: bool,
    while_busy: bool,
    talk: Duration,
    config: ServiceConfig,
) -> Result<()> {
    let (sim, _) = Simulation::start(user, config).await?;
    let kind = CallKind::from_video_flag(video);

    if while_busy {
        let other = UserId::new("carol");
        println!("📞 Calling {other} first...");
        sim.controller().dial(&other, None, CallKind::Audio).await?;
        sim.remote_status("connected");
        settle().await;
    }

    sim.world
        .realtime
        .publish(RealtimeEvent::IncomingCall(IncomingCallNotice {
            callee_id: UserId::new(user),
            call_type: kind,
            session_id: SessionId::new(format!("call_from_{caller}")),
            caller_name: None,
            caller_id: Some(UserId::new(caller)),
        }));
    settle().await;
    let call = sim.world.client.ring(caller, video);
    settle().await;

    if while_busy {
        println!("🚫 Auto-rejected: {:?}", call.actions());
        sim.controller().hangup().await?;
        sim.controller().dismiss().await.ok();
        sim.finish().await;
        return Ok(());
    }

    println!("🔔 {caller} is calling ({})", kind.as_str());
    sim.controller().answer().await?;
    call.deliver_remote(true, video);
    println!("🟢 Answered");

    tokio::time::sleep(talk).await;
    sim.remote_status("ended");
    settle().await;
    println!("📴 {caller} hung up");
    sim.controller().dismiss().await.ok();
    sim.finish().await;
    Ok(())
}

async fn handle_rejoin(user: &str, talk: Duration, config: ServiceConfig) -> Result<()> {
    let world = LoopbackWorld::new(user);
    world.backend.set_ongoing(Some(OngoingCall {
        session_id: SessionId::new("call_abandoned"),
        peer: UserId::new("bob"),
        peer_name: Some("Bob".to_string()),
        kind: CallKind::Audio,
    }));
    let (sim, ongoing) = Simulation::start_with(world, config).await?;

    let Some(ongoing) = ongoing else {
        println!("ℹ️  Nothing to rejoin");
        sim.finish().await;
        return Ok(());
    };
    println!("🔁 Rejoining call {} with {}", ongoing.session_id, ongoing.peer);
    sim.controller().rejoin().await?;
    sim.remote_status("connected");
    settle().await;

    tokio::time::sleep(talk).await;
    sim.controller().hangup().await?;
    sim.controller().dismiss().await.ok();
    sim.finish().await;
    Ok(())
}

async fn handle_status(user: &str, config: ServiceConfig) -> Result<()> {
    let (sim, ongoing) = Simulation::start(user, config).await?;
    let controller = sim.controller();

    println!("📊 Raven Call Status");
    println!("====================");
    println!("User:          {}", controller.local_user().display_name());
    println!("Service:       {}", if sim.service.is_running() { "running" } else { "stopped" });
    println!("Calling SDK:   {}", if sim.world.client.is_connected() { "connected" } else { "offline" });
    println!("In call:       {}", controller.presence().is_in_call());
    println!(
        "Rejoin offer:  {}",
        ongoing.map_or_else(|| "none".to_string(), |c| c.session_id.to_string())
    );
    println!();
    println!("Available commands:");
    println!("  raven-call dial <peer> [options]      - Place a call");
    println!("  raven-call incoming <caller> [options] - Receive a call");
    println!("  raven-call rejoin                      - Rejoin an abandoned call");
    println!("  raven-call config                      - Print the configuration");
    println!();
    println!("Use 'raven-call --help' for detailed options");

    sim.finish().await;
    Ok(())
}
