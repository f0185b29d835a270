//! OS signal bridge into the lifecycle event channel.

use hearth_lifecycle::LifecycleEvent;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lifecycle meaning of a signal number, if it has one.
pub fn classify(signo: libc::c_int) -> Option<LifecycleEvent> {
    match signo {
        libc::SIGPWR => Some(LifecycleEvent::HostShutdown),
        libc::SIGINT | libc::SIGQUIT | libc::SIGTERM => Some(LifecycleEvent::Quiesce),
        libc::SIGUSR1 => Some(LifecycleEvent::Diagnostic),
        _ => None,
    }
}

/// Install handlers and forward every signal as a lifecycle event.
///
/// The task ends once the receiving side is gone.
pub fn spawn_bridge(tx: mpsc::Sender<LifecycleEvent>) -> std::io::Result<JoinHandle<()>> {
    let mut power = signal(SignalKind::from_raw(libc::SIGPWR))?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            let signo = tokio::select! {
                Some(()) = power.recv() => libc::SIGPWR,
                Some(()) = interrupt.recv() => libc::SIGINT,
                Some(()) = quit.recv() => libc::SIGQUIT,
                Some(()) = terminate.recv() => libc::SIGTERM,
                Some(()) = user1.recv() => libc::SIGUSR1,
                else => break,
            };
            let Some(event) = classify(signo) else {
                continue;
            };
            info!(signo, ?event, "signal received");
            if tx.send(event).await.is_err() {
                debug!("lifecycle controller gone, signal bridge stopping");
                break;
            }
        }
    }))
}

/// Resolve on a quiesce request that arrives while boot is still running.
///
/// A host shutdown is parked in `deferred` for the controller and wins
/// over a later quiesce; diagnostic requests are dropped. Never resolves
/// once the channel is closed.
pub async fn quiesce_during_boot(
    rx: &mut mpsc::Receiver<LifecycleEvent>,
    deferred: &mut Option<LifecycleEvent>,
) {
    loop {
        match rx.recv().await {
            Some(LifecycleEvent::Quiesce) if deferred.is_none() => return,
            Some(LifecycleEvent::HostShutdown) => {
                info!("host shutdown requested during boot, drain follows boot");
                *deferred = Some(LifecycleEvent::HostShutdown);
            }
            Some(event) => debug!(?event, "signal ignored during boot"),
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_classes() {
        assert_eq!(classify(libc::SIGPWR), Some(LifecycleEvent::HostShutdown));
        for signo in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            assert_eq!(classify(signo), Some(LifecycleEvent::Quiesce));
        }
        assert_eq!(classify(libc::SIGUSR1), Some(LifecycleEvent::Diagnostic));
        assert_eq!(classify(libc::SIGHUP), None);
    }

    #[tokio::test]
    async fn raised_signal_reaches_the_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = spawn_bridge(tx).unwrap();
        // SAFETY: raising a signal we have just installed a handler for.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(rx.recv().await, Some(LifecycleEvent::Diagnostic));
        drop(rx);
        bridge.abort();
    }

    #[tokio::test]
    async fn quiesce_interrupts_boot() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(LifecycleEvent::Diagnostic).await.unwrap();
        tx.send(LifecycleEvent::Quiesce).await.unwrap();
        let mut deferred = None;
        quiesce_during_boot(&mut rx, &mut deferred).await;
        assert_eq!(deferred, None);
    }

    #[tokio::test(start_paused = true)]
    async fn host_shutdown_during_boot_is_deferred() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(LifecycleEvent::HostShutdown).await.unwrap();
        tx.send(LifecycleEvent::Quiesce).await.unwrap();
        drop(tx);
        let mut deferred = None;
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            quiesce_during_boot(&mut rx, &mut deferred),
        )
        .await;
        assert!(waited.is_err(), "boot must not be cut short");
        assert_eq!(deferred, Some(LifecycleEvent::HostShutdown));
    }
}
