/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Connection lifecycle states.

use serde::Serialize;
use std::fmt;

/// Lifecycle of one language server connection.
///
/// ```text
/// Disconnected -> Starting -> Initializing -> Connected
///                    |             |             |
///                    +-----> Error <-------------+
/// ```
///
/// Any state may return to `Disconnected` through an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No process. Initial state, and the state after every stop.
    #[default]
    Disconnected,
    /// Process is being spawned.
    Starting,
    /// `initialize` sent, waiting for the response.
    Initializing,
    /// Handshake complete. Requests and document sync are allowed.
    Connected,
    /// Transport failure or handshake timeout. Requires a restart.
    Error,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is an edge of the lifecycle
    /// graph. Self-loops are not edges.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Disconnected, Error, Initializing, Starting};
        matches!(
            (self, next),
            (Disconnected, Starting)
                | (Starting, Initializing)
                | (Initializing, Connected)
                | (Starting | Initializing | Connected, Error)
                | (Starting | Initializing | Connected | Error, Disconnected)
        )
    }

    /// Whether a server process may be alive in this state.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Connected)
    }

    /// Lowercase name, as used in logs and serialized status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{self, Connected, Disconnected, Error, Initializing, Starting};

    const ALL: [ConnectionState; 5] = [Disconnected, Starting, Initializing, Connected, Error];

    #[test]
    fn test_connected_only_through_initializing() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Connected), from == Initializing, "{from}");
        }
    }

    #[test]
    fn test_error_reachable_from_running_states() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Error), from.is_running(), "{from}");
        }
    }

    #[test]
    fn test_stop_reaches_disconnected_from_anywhere() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(Disconnected),
                from != Disconnected,
                "{from}"
            );
        }
    }

    #[test]
    fn test_start_only_from_disconnected() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Starting), from == Disconnected, "{from}");
        }
    }

    #[test]
    fn test_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Initializing)?, "\"initializing\"");
        assert_eq!(Connected.to_string(), "connected");
        Ok(())
    }
}
