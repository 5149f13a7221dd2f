use flume::{Receiver, Sender};
use tracing::debug;

use crate::encryption::KeyPairSummary;
use crate::types::{ConnectPhase, ConnectStatus, ErrorCode, ProbeReport};

/// Everything pushed to the UI surface
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Connect(ConnectStatus),
    Probe(ProbeReport),
    KeyPair(Option<KeyPairSummary>),
}

/// Fire-and-forget sink for status updates
pub trait StatusNotifier: Send + Sync {
    fn notify(&self, update: StatusUpdate);
}

/// Notifier backed by an unbounded flume channel
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: Sender<StatusUpdate>,
}

impl ChannelNotifier {
    /// Notifier plus the receiving end handed to the UI surface
    pub fn channel() -> (Self, Receiver<StatusUpdate>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl StatusNotifier for ChannelNotifier {
    fn notify(&self, update: StatusUpdate) {
        // Nobody listening is fine
        let _ = self.tx.send(update);
    }
}

pub fn emit_connect(
    notifier: &dyn StatusNotifier,
    account_uuid: Option<&str>,
    phase: ConnectPhase,
    verified_keypair: bool,
    error: Option<ErrorCode>,
) {
    debug!(uuid = ?account_uuid, phase = phase.code(), error = ?error, "Connect status");
    notifier.notify(StatusUpdate::Connect(ConnectStatus {
        account_uuid: account_uuid.map(str::to_string),
        phase,
        verified_keypair,
        error,
    }));
}

pub fn emit_probe(notifier: &dyn StatusNotifier, report: ProbeReport) {
    debug!(uuid = %report.uuid, imap = ?report.imap, smtp = ?report.smtp, "Probe finished");
    notifier.notify(StatusUpdate::Probe(report));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_delivers_in_order() {
        let (notifier, rx) = ChannelNotifier::channel();
        emit_connect(&notifier, Some("u1"), ConnectPhase::Connecting, false, None);
        emit_connect(&notifier, Some("u1"), ConnectPhase::Failed, false, Some(ErrorCode::Timeout));

        let phases: Vec<_> = rx
            .drain()
            .map(|u| match u {
                StatusUpdate::Connect(s) => (s.phase, s.error),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                (ConnectPhase::Connecting, None),
                (ConnectPhase::Failed, Some(ErrorCode::Timeout))
            ]
        );
    }

    #[test]
    fn test_notify_without_listener() {
        let (notifier, rx) = ChannelNotifier::channel();
        drop(rx);
        emit_connect(&notifier, None, ConnectPhase::AwaitingConfirmation, false, None);
    }
}
