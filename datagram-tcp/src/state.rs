//! Connection finite-state machine (FSM).
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy, the protocol events that move it between states, and the single
//! [`transition`] function that enumerates every legal move.  The connection
//! never assigns its state directly; it feeds an [`Event`] through
//! [`transition`] and performs the returned [`Effect`].
//!
//! ```text
//!                 connect / SYN                     SYN_ACK / ACK
//!   CLOSED ─────────────────────▶ SYN_SENT ───────────────────────▶ ESTABLISHED
//!     ▲                              │ timeout                       │   │
//!     │◀─────────────────────────────┘                          FIN  │   │ close / FIN
//!     │                                                              ▼   ▼
//!     │◀──── close, FIN acked ──── CLOSE_WAIT         FIN_WAIT_1 ─ACK─▶ FIN_WAIT_2
//!     │                                                                  │
//!     └───────────────────────────── FIN / ACK ──────────────────────────┘
//!
//!   LISTEN ──SYN──▶ SYN_RCVD ──spawned──▶ LISTEN        (listening side)
//!                   SYN_RCVD ──ACK──▶ ESTABLISHED       (spawned side)
//! ```

use std::fmt;

use thiserror::Error;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection exists.  Initial state of an active opener and terminal
    /// state of every connection.
    #[default]
    Closed,
    /// Passive opener waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received; SYN-ACK sent (by the spawned connection); waiting for ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Peer's FIN received; local close pending.
    CloseWait,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
        };
        f.write_str(name)
    }
}

/// Something that happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Application called `connect`.
    Connect,
    /// A SYN arrived on a listening connection.
    SynReceived,
    /// The listener handed the peer over to a spawned connection.
    Spawned,
    /// A SYN_ACK arrived while waiting in `SynSent`.
    SynAckReceived,
    /// The ACK we were waiting for arrived.
    AckReceived,
    /// The peer's FIN arrived.
    FinReceived,
    /// Application called `close`.
    Close,
    /// A bounded wait expired without a qualifying datagram.
    Timeout,
    /// Retry budget exhausted; the connection is unusable.
    Abort,
}

/// Control datagram the connection must emit as part of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Nothing,
    SendSyn,
    SendAck,
    SendFin,
}

/// An event that is not legal in the current state.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("event {event:?} is not legal in state {state}")]
pub struct IllegalTransition {
    pub state: ConnectionState,
    pub event: Event,
}

/// Compute the next state for `event` arriving in `state`.
///
/// Every legal transition appears in this match; anything else is rejected
/// with [`IllegalTransition`].
pub fn transition(
    state: ConnectionState,
    event: Event,
) -> Result<(ConnectionState, Effect), IllegalTransition> {
    use ConnectionState::*;

    let next = match (state, event) {
        (Closed, Event::Connect) => (SynSent, Effect::SendSyn),
        (SynSent, Event::SynAckReceived) => (Established, Effect::SendAck),
        (SynSent, Event::Timeout) => (Closed, Effect::Nothing),

        (Listen, Event::SynReceived) => (SynReceived, Effect::Nothing),
        (SynReceived, Event::Spawned) => (Listen, Effect::Nothing),
        (SynReceived, Event::AckReceived) => (Established, Effect::Nothing),
        (SynReceived, Event::Timeout) => (Closed, Effect::Nothing),

        (Established, Event::FinReceived) => (CloseWait, Effect::Nothing),
        (Established, Event::Close) => (FinWait1, Effect::SendFin),

        // Passive close: the FIN goes out from CLOSE_WAIT, and the connection
        // is finished whether or not its ACK shows up.
        (CloseWait, Event::Close) => (CloseWait, Effect::SendFin),
        (CloseWait, Event::AckReceived | Event::Timeout) => (Closed, Effect::Nothing),

        (FinWait1, Event::AckReceived) => (FinWait2, Effect::Nothing),
        (FinWait1, Event::FinReceived) => (Closed, Effect::SendAck),
        (FinWait1, Event::Timeout) => (Established, Effect::Nothing),
        (FinWait2, Event::FinReceived) => (Closed, Effect::SendAck),
        (FinWait2, Event::Timeout) => (Closed, Effect::Nothing),

        (_, Event::Abort) if state != Listen => (Closed, Effect::Nothing),

        _ => return Err(IllegalTransition { state, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL_STATES: [ConnectionState; 8] = [
        Closed,
        Listen,
        SynSent,
        SynReceived,
        Established,
        CloseWait,
        FinWait1,
        FinWait2,
    ];

    #[test]
    fn default_is_closed() {
        assert_eq!(ConnectionState::default(), Closed);
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(SynReceived.to_string(), "SYN_RCVD");
        assert_eq!(FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(CloseWait.to_string(), "CLOSE_WAIT");
    }

    #[test]
    fn active_open_path() {
        assert_eq!(transition(Closed, Event::Connect), Ok((SynSent, Effect::SendSyn)));
        assert_eq!(
            transition(SynSent, Event::SynAckReceived),
            Ok((Established, Effect::SendAck))
        );
        assert_eq!(transition(SynSent, Event::Timeout), Ok((Closed, Effect::Nothing)));
    }

    #[test]
    fn passive_open_path() {
        assert_eq!(transition(Listen, Event::SynReceived), Ok((SynReceived, Effect::Nothing)));
        assert_eq!(transition(SynReceived, Event::Spawned), Ok((Listen, Effect::Nothing)));
        assert_eq!(
            transition(SynReceived, Event::AckReceived),
            Ok((Established, Effect::Nothing))
        );
    }

    #[test]
    fn active_close_path() {
        assert_eq!(transition(Established, Event::Close), Ok((FinWait1, Effect::SendFin)));
        assert_eq!(transition(FinWait1, Event::AckReceived), Ok((FinWait2, Effect::Nothing)));
        assert_eq!(transition(FinWait1, Event::Timeout), Ok((Established, Effect::Nothing)));
        assert_eq!(transition(FinWait2, Event::FinReceived), Ok((Closed, Effect::SendAck)));
        assert_eq!(transition(FinWait2, Event::Timeout), Ok((Closed, Effect::Nothing)));
    }

    #[test]
    fn passive_close_path() {
        assert_eq!(transition(Established, Event::FinReceived), Ok((CloseWait, Effect::Nothing)));
        assert_eq!(transition(CloseWait, Event::Close), Ok((CloseWait, Effect::SendFin)));
        assert_eq!(transition(CloseWait, Event::AckReceived), Ok((Closed, Effect::Nothing)));
        assert_eq!(transition(CloseWait, Event::Timeout), Ok((Closed, Effect::Nothing)));
    }

    #[test]
    fn connect_only_from_closed() {
        for state in ALL_STATES.into_iter().filter(|s| *s != Closed) {
            assert_eq!(
                transition(state, Event::Connect),
                Err(IllegalTransition { state, event: Event::Connect })
            );
        }
    }

    #[test]
    fn close_rejected_outside_established_and_close_wait() {
        for state in [Closed, Listen, SynSent, SynReceived, FinWait1, FinWait2] {
            assert!(transition(state, Event::Close).is_err(), "close allowed in {state}");
        }
    }

    #[test]
    fn abort_closes_everything_but_a_listener() {
        for state in ALL_STATES {
            let result = transition(state, Event::Abort);
            if state == Listen {
                assert!(result.is_err());
            } else {
                assert_eq!(result, Ok((Closed, Effect::Nothing)));
            }
        }
    }
}
