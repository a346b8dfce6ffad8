//! Negotiation channel tracking for a room.
//!
//! A consultation carries up to two independent peer connection setups:
//! the primary camera/microphone connection and an optional screen-share
//! connection. Both are represented by the same [`NegotiationChannel`]
//! record, distinguished by [`ChannelKind`], so open/close/teardown logic
//! is written once.
//!
//! State machine per channel:
//!
//! ```text
//! Closed -> (open request / first offer) -> Negotiating
//! Negotiating -> (answer received)       -> Established
//! any    -> (peer left, explicit stop,
//!            room teardown)              -> Closed (record dropped)
//! ```
//!
//! Several distinct triggers converge on the same close transition: an
//! explicit `stop-screen-share`, a restart of an active share (implicit
//! stop-then-start), a participant leaving, and room teardown.

use common::types::UserId;
use signal_protocol::ChannelKind;
use std::collections::HashMap;

/// Negotiation progress of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Offer sent or expected, awaiting answer.
    Negotiating,
    /// Answer received; the peers are connecting directly.
    Established,
}

/// One live negotiation channel between the two occupants.
///
/// Only one channel of a given kind may be open at a time, so the
/// coordinator keys records by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationChannel {
    /// Which connection this channel sets up.
    pub kind: ChannelKind,
    /// The participant that opened the channel.
    pub originator: UserId,
    /// Current negotiation progress.
    pub state: ChannelState,
}

/// Result of a `start-screen-share` request.
#[derive(Debug)]
pub struct StartShareOutcome {
    /// The share that was implicitly closed first, if one was open.
    pub replaced: Option<NegotiationChannel>,
}

/// Tracks which negotiation channels are open in one room.
///
/// Purely synchronous state; the owning room actor serializes access.
#[derive(Debug, Default)]
pub struct NegotiationCoordinator {
    channels: HashMap<ChannelKind, NegotiationChannel>,
}

impl NegotiationCoordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The open channel of the given kind, if any.
    #[must_use]
    pub fn channel(&self, kind: ChannelKind) -> Option<&NegotiationChannel> {
        self.channels.get(&kind)
    }

    /// All currently open channels (snapshot order is unspecified).
    #[must_use]
    pub fn open_channels(&self) -> Vec<NegotiationChannel> {
        self.channels.values().cloned().collect()
    }

    /// Whether a channel of the given kind is currently established.
    #[must_use]
    pub fn is_established(&self, kind: ChannelKind) -> bool {
        self.channels
            .get(&kind)
            .is_some_and(|c| c.state == ChannelState::Established)
    }

    /// An offer for `kind` arrived from `from`.
    ///
    /// Opens the channel if it was closed (the offer is the open request),
    /// or restarts negotiation on an existing channel (renegotiation).
    pub fn offer(&mut self, kind: ChannelKind, from: &UserId) {
        match self.channels.get_mut(&kind) {
            Some(channel) => {
                channel.originator = from.clone();
                channel.state = ChannelState::Negotiating;
            }
            None => {
                self.channels.insert(
                    kind,
                    NegotiationChannel {
                        kind,
                        originator: from.clone(),
                        state: ChannelState::Negotiating,
                    },
                );
            }
        }
    }

    /// An answer for `kind` arrived from `from`.
    ///
    /// Completes a pending negotiation. Answers that do not match a
    /// negotiating channel, or that come from the channel's own
    /// originator, are stale and ignored.
    pub fn answer(&mut self, kind: ChannelKind, from: &UserId) {
        if let Some(channel) = self.channels.get_mut(&kind) {
            if channel.state == ChannelState::Negotiating && channel.originator != *from {
                channel.state = ChannelState::Established;
            }
        }
    }

    /// `originator` requested to start (or restart) a screen-share.
    ///
    /// If a share channel is already open it is closed first (the
    /// implicit stop-then-start that keeps a restarting client from
    /// getting stuck) and returned so the caller can broadcast the stop.
    pub fn start_screen_share(&mut self, originator: &UserId) -> StartShareOutcome {
        let replaced = self.channels.remove(&ChannelKind::ScreenShare);
        self.channels.insert(
            ChannelKind::ScreenShare,
            NegotiationChannel {
                kind: ChannelKind::ScreenShare,
                originator: originator.clone(),
                state: ChannelState::Negotiating,
            },
        );
        StartShareOutcome { replaced }
    }

    /// `originator` stopped their screen-share.
    ///
    /// Idempotent: returns the closed channel if one was open for this
    /// originator, `None` otherwise (already stopped, or the share
    /// belongs to the other side).
    pub fn stop_screen_share(&mut self, originator: &UserId) -> Option<NegotiationChannel> {
        match self.channels.get(&ChannelKind::ScreenShare) {
            Some(channel) if channel.originator == *originator => {
                self.channels.remove(&ChannelKind::ScreenShare)
            }
            _ => None,
        }
    }

    /// A participant's transport is gone (leave, disconnect, eviction).
    ///
    /// Every channel involves both occupants, so all of them close.
    /// Returns the closed channels so the caller can notify the survivor.
    pub fn participant_left(&mut self) -> Vec<NegotiationChannel> {
        self.close_all()
    }

    /// Close every channel (room teardown). Returns the closed channels.
    pub fn close_all(&mut self) -> Vec<NegotiationChannel> {
        self.channels.drain().map(|(_, channel)| channel).collect()
    }
}
