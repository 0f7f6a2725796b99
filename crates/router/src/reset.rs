//! Mapping from upstream failures to downstream actions

use crate::host::Host;
use crate::outlier::OutlierResult;
use crate::pool::PoolFailureReason;

/// How far the upstream response got before the failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseProgress {
    pub started: bool,
    pub complete: bool,
    pub draining: bool,
    pub underflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamAction {
    /// Reply with an internal error app exception
    LocalReply { close_downstream: bool },
    /// Part of a response already went out; tear the downstream connection down
    ResetDownstream,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetDecision {
    pub action: DownstreamAction,
    /// Result to report for the selected host
    pub outlier_result: Option<OutlierResult>,
    /// False when the downstream may keep going, e.g. to resume decoding
    pub close_downstream: bool,
}

pub fn outlier_result(reason: PoolFailureReason) -> OutlierResult {
    match reason {
        PoolFailureReason::Overflow
        | PoolFailureReason::LocalConnectionFailure
        | PoolFailureReason::RemoteConnectionFailure => OutlierResult::LocalOriginConnectFailed,
        PoolFailureReason::Timeout => OutlierResult::LocalOriginTimeout,
    }
}

pub fn decide(
    reason: PoolFailureReason,
    progress: ResponseProgress,
    close_downstream_on_error: bool,
) -> ResetDecision {
    if reason == PoolFailureReason::Overflow {
        return ResetDecision {
            action: DownstreamAction::LocalReply {
                close_downstream: false,
            },
            outlier_result: None,
            close_downstream: false,
        };
    }

    let outlier_result = Some(outlier_result(reason));

    if progress.underflow || (progress.started && !progress.draining && !progress.complete) {
        ResetDecision {
            action: DownstreamAction::ResetDownstream,
            outlier_result,
            close_downstream: true,
        }
    } else if !progress.draining && !progress.complete {
        ResetDecision {
            action: DownstreamAction::LocalReply {
                close_downstream: close_downstream_on_error,
            },
            outlier_result,
            close_downstream: close_downstream_on_error,
        }
    } else {
        ResetDecision {
            action: DownstreamAction::Nothing,
            outlier_result,
            close_downstream: true,
        }
    }
}

/// Message of the local error reply for `reason`
pub fn local_reply_message(reason: PoolFailureReason, host: Option<&Host>) -> String {
    match reason {
        PoolFailureReason::Overflow => "upstream request: too many connections".to_string(),
        _ => format!(
            "connection failure: {} '{}'",
            reason,
            host.map(|h| h.address()).unwrap_or("to upstream")
        ),
    }
}
