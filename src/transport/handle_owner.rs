//! Handle owner task
//!
//! Single-owner pattern for the russh `Handle`: exactly one task owns it,
//! everyone else sends commands through a [`HandleController`]. This avoids
//! `Arc<Mutex<Handle>>` lock contention, deadlocks from holding locks across
//! `.await`, and protocol violations from concurrent Handle access.

use russh::client::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::russh_client::HostVerifyHandler;
use super::SessionOperations;
use crate::error::TransportError;

/// Ping 结果类型，区分不同的失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// 连接正常
    Ok,
    /// 超时（可能是网络延迟，可重试）
    Timeout,
    /// IO 错误（物理连接断开，应立即重连）
    IoError,
}

/// Commands sent to the handle owner task
pub(crate) enum HandleCommand {
    /// Ping the connection (keepalive check)
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect {
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
}

/// Controller for the handle owner task.
///
/// Cloneable; any holder has full control of the session. Only in-process
/// code can obtain one, so permission decisions belong to the layers above.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Broadcast for disconnect notification. Subscribers learn when the
    /// owner task ends, whatever the cause.
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Build a controller over an existing command channel (tests drive the
    /// receiving side directly). Production uses `spawn_handle_owner_task`.
    #[cfg(test)]
    pub(crate) fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to disconnect notifications, for `tokio::select!` against
    /// long-running work tied to this session
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }
}

#[async_trait::async_trait]
impl SessionOperations for HandleController {
    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect { reply_tx })
            .await
            .is_err()
        {
            // Owner task already gone, nothing left to close
            return Ok(());
        }
        match reply_rx.await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Ok(()),
        }
    }
}

/// Spawn the handle owner task.
///
/// Consumes the Handle; the returned controller is the only way to reach it.
pub(crate) fn spawn_handle_owner_task(
    handle: Handle<HostVerifyHandler>,
    session_label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = handle; // Move into task, becomes sole owner
        let mut disconnect_reply: Option<oneshot::Sender<Result<(), russh::Error>>> = None;

        info!("Handle owner task started for {}", session_label);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::Ping { reply_tx }) => {
                    // send_keepalive(true) sends SSH_MSG_GLOBAL_REQUEST
                    // "keepalive@openssh.com" with want_reply=true, the
                    // proper SSH heartbeat.
                    debug!("Keepalive probe for {}", session_label);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            debug!("Keepalive OK for {}", session_label);
                            PingResult::Ok
                        }
                        Ok(Err(e)) => {
                            let error_str = format!("{:?}", e);
                            if error_str.contains("Disconnect") || error_str.contains("disconnect")
                            {
                                warn!("Keepalive disconnect for {}: {:?}", session_label, e);
                                PingResult::IoError
                            } else {
                                warn!(
                                    "Keepalive error for {} (treating as soft failure): {:?}",
                                    session_label, e
                                );
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} (5s)", session_label);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect { reply_tx }) => {
                    info!("Disconnect requested for {}", session_label);
                    disconnect_reply = Some(reply_tx);
                    break;
                }

                None => {
                    // All controllers dropped
                    info!("All controllers dropped for {}", session_label);
                    break;
                }
            }
        }

        // === Cleanup phase ===
        // Notify disconnect subscribers first; send() fails when nobody
        // listens, which is fine
        let _ = disconnect_tx_clone.send(());

        // Drain queued commands, answering each as disconnected
        drain_pending_commands(&mut cmd_rx);

        // Disconnect SSH properly with reason
        let result = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(result);
        }
        info!("Handle owner task terminated for {}", session_label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain queued commands so no caller waits on a dead task
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close the receiver first, preventing new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect { reply_tx } => {
                // Already disconnecting
                let _ = reply_tx.send(Ok(()));
            }
        }
    }
}
