use anyhow::anyhow;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::session::{LobbyState, Session};

/// Ticks a session on its configured cadence until it ends.
///
/// Returns `Ok(())` when the shutdown signal fires (the session is disconnected then), or when
///  the session is disconnected or cancelled. A failed session is returned as an error.
pub async fn run_session(session: &mut Session, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
    let mut ticks = interval(session.config().tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("running {:?}", session);

    loop {
        select! {
            _ = &mut shutdown => {
                info!("shutting down {:?}", session);
                session.disconnect();
                return Ok(());
            }
            _ = ticks.tick() => {
                session.tick();

                match session.lobby_state() {
                    LobbyState::Failed => {
                        let reason = session.last_failure()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown reason".to_string());
                        error!("session failed: {}", reason);
                        return Err(anyhow!("session failed: {}", reason));
                    }
                    LobbyState::Disconnected | LobbyState::Cancelled => {
                        info!("session ended: {:?}", session.lobby_state());
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use super::*;
    use crate::session::session_config::SessionConfig;
    use crate::substrate::memory::MemoryNetwork;
    use crate::test_util::identity::test_identity;
    use crate::test_util::session::session;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, test_identity(1), SessionConfig::new());
        let group = host.create_group().unwrap();

        let (send, recv) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = run_session(&mut host, recv).await;
            (host, result)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(network.group_members(group), vec![test_identity(1)]);

        send.send(()).unwrap();
        let (host, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(host.lobby_state(), LobbyState::Disconnected);
        assert!(network.group_members(group).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ends_driver() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, test_identity(1), SessionConfig::new());
        let group = host.create_group().unwrap();

        let mut config = SessionConfig::new();
        config.ack_timeout = Duration::from_secs(1);
        let mut joiner = session(&network, test_identity(2), config);
        joiner.join_group(group).unwrap();

        // the host is never ticked, so the joiner's request is never acknowledged
        let (_send, recv) = oneshot::channel();
        let result = run_session(&mut joiner, recv).await;
        assert!(result.is_err());
        assert_eq!(joiner.lobby_state(), LobbyState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_departure_ends_driver() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, test_identity(1), SessionConfig::new());
        let group = host.create_group().unwrap();
        let mut joiner = session(&network, test_identity(2), SessionConfig::new());
        joiner.join_group(group).unwrap();
        for _ in 0..4 {
            host.tick();
            joiner.tick();
        }
        assert!(joiner.is_connected_to_server());

        host.disconnect();
        let (_send, recv) = oneshot::channel();
        assert!(run_session(&mut joiner, recv).await.is_ok());
        assert_eq!(joiner.lobby_state(), LobbyState::Disconnected);
    }
}
