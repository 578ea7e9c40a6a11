//! Bingo Duel
//!
//! `relay` runs the WebSocket broadcast relay. `demo` plays a seeded game
//! between two in-process clients over a shared in-memory store, using the
//! in-process hub or a running relay.

#![warn(missing_docs)]

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bingo_duel::{
    core::digest::short_hex,
    game::{board::random_board, turn::CallOutcome, turn::TurnError, GameStatus},
    network::{Broadcaster, IdentityConfig, LocalHub, RelayConfig, RelayServer, SeatTokenIssuer, WsBroadcaster},
    profile::LocalProfile,
    store::{GameStore, MemoryStore},
    sync::{Lobby, SessionHandle, SyncConfig, SyncEngine, SyncError},
    DeterministicRng, MAX_NUMBER, VERSION,
};
use cli::{Cli, Command};

/// Polls while waiting for the other client to see a call.
const CATCH_UP_ATTEMPTS: usize = 50;
const CATCH_UP_DELAY: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Bingo Duel v{}", VERSION);

    match cli.command {
        Command::Relay { bind, max_connections, require_tokens } => {
            run_relay(bind, max_connections, require_tokens).await
        }
        Command::Demo {
            relay_url,
            seed,
            host_name,
            guest_name,
            show_opponent,
            profile,
        } => {
            let profile_path = profile.unwrap_or_else(LocalProfile::path_from_env);
            run_demo(relay_url, seed, host_name, guest_name, show_opponent, profile_path).await
        }
    }
}

/// Run the relay until Ctrl-C.
async fn run_relay(
    bind: Option<std::net::SocketAddr>,
    max_connections: Option<usize>,
    require_tokens: bool,
) -> Result<()> {
    let mut config = RelayConfig::from_env();
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(max) = max_connections {
        config.max_connections = max;
    }
    config.require_tokens |= require_tokens;

    let server = RelayServer::new(config).context("relay configuration")?;
    tokio::select! {
        result = server.run() => result.context("relay stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay");
            server.shutdown();
        }
    }
    Ok(())
}

async fn connect_broadcaster(
    hub: &LocalHub,
    relay_url: Option<&str>,
    token: Option<String>,
) -> Result<Arc<dyn Broadcaster>> {
    let broadcaster: Arc<dyn Broadcaster> = match relay_url {
        Some(url) => Arc::new(WsBroadcaster::connect(url, token).await?),
        None => Arc::new(hub.client()),
    };
    Ok(broadcaster)
}

/// Two clients play one game to a win.
async fn run_demo(
    relay_url: Option<String>,
    seed: u64,
    host_name: Option<String>,
    guest_name: String,
    show_opponent: bool,
    profile_path: std::path::PathBuf,
) -> Result<()> {
    let mut profile = LocalProfile::load(&profile_path).await?;
    let host_name = host_name
        .or_else(|| profile.last_player_name.clone())
        .unwrap_or_else(|| "Host".to_string());

    let store: Arc<dyn GameStore> = Arc::new(MemoryStore::new());
    let identity = IdentityConfig::from_env();
    let mut lobby = Lobby::new(store.clone());
    if identity.is_configured() {
        lobby = lobby.with_issuer(SeatTokenIssuer::new(identity)?);
    }
    let hub = LocalHub::new();
    let config = SyncConfig::from_env();

    let host = lobby.create_game(&host_name, show_opponent).await?;
    info!(game_id = %host.game.id, pin = %host.game.pin(), "Host created game");
    let host_broadcaster = connect_broadcaster(&hub, relay_url.as_deref(), host.token.clone()).await?;
    let host_engine = SyncEngine::connect(host.seat.clone(), store.clone(), host_broadcaster, config.clone()).await?;

    let guest = lobby.join_game(&host.game.pin(), &guest_name).await?;
    let guest_broadcaster = connect_broadcaster(&hub, relay_url.as_deref(), guest.token.clone()).await?;
    let guest_engine = SyncEngine::connect(guest.seat.clone(), store.clone(), guest_broadcaster, config).await?;

    let (host_handle, host_task) = host_engine.spawn();
    let (guest_handle, guest_task) = guest_engine.spawn();
    guest_handle.announce_join().await?;

    let mut rng = DeterministicRng::new(seed);
    host_handle.submit_board(random_board(&mut rng)).await?;
    guest_handle.submit_board(random_board(&mut rng)).await?;

    host_handle.reconcile().await?;
    if host_handle.snapshot().await?.game().status != GameStatus::Playing {
        bail!("game did not start after both boards were submitted");
    }

    let handles = [&host_handle, &guest_handle];
    let mut calls = 0usize;
    let winner = loop {
        let view = host_handle.snapshot().await?;
        let seat = view.turn();
        let caller = handles
            .iter()
            .find(|h| h.seat().player_number == seat)
            .context("no client holds the turn")?;

        let open: Vec<u8> = (1..=MAX_NUMBER).filter(|n| !view.is_called(*n)).collect();
        let number = *rng.choose(&open).context("every number called without a winner")?;

        match call_when_ready(caller, number).await? {
            CallOutcome::Win { winner, report } => {
                info!(winner = %winner, lines = report.completed_line_count, "Winner after {} calls", calls + 1);
                break winner;
            }
            CallOutcome::NextTurn { report, .. } => {
                calls += 1;
                info!(seat = %seat, number, lines = report.completed_line_count, "Called");
                wait_for_moves(&host_handle, calls).await?;
                wait_for_moves(&guest_handle, calls).await?;
            }
        }
    };

    tokio::time::sleep(CATCH_UP_DELAY).await;
    host_handle.reconcile().await?;
    guest_handle.reconcile().await?;
    host_handle.shutdown().await?;
    guest_handle.shutdown().await?;
    let host_state = host_task.await?;
    let guest_state = guest_task.await?;

    let (a, b) = (host_state.digest(), guest_state.digest());
    info!(host = %short_hex(&a), guest = %short_hex(&b), "Final digests");
    if a != b {
        bail!("clients diverged");
    }
    info!(winner = %winner, "Clients converged");

    profile.remember_seat(&host.seat, host.token);
    profile.save(&profile_path).await?;
    Ok(())
}

/// Call, retrying while this client has not yet seen the turn pass to it.
async fn call_when_ready(handle: &SessionHandle, number: u8) -> Result<CallOutcome> {
    for _ in 0..CATCH_UP_ATTEMPTS {
        match handle.call_number(number).await {
            Ok(outcome) => return Ok(outcome),
            Err(SyncError::Turn(TurnError::NotYourTurn { .. })) => {
                tokio::time::sleep(CATCH_UP_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    warn!("Turn never arrived, reconciling");
    handle.reconcile().await?;
    Ok(handle.call_number(number).await?)
}

/// Wait until a client has folded `count` calls, reconciling as a last resort.
async fn wait_for_moves(handle: &SessionHandle, count: usize) -> Result<()> {
    for _ in 0..CATCH_UP_ATTEMPTS {
        if handle.snapshot().await?.moves().len() >= count {
            return Ok(());
        }
        tokio::time::sleep(CATCH_UP_DELAY).await;
    }
    warn!(seat = %handle.seat().player_number, "Broadcast missing, reconciling");
    handle.reconcile().await?;
    Ok(())
}
