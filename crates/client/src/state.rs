use std::fmt;

/// Connection lifecycle of a [`crate::SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts are exhausted. Only an explicit connect leaves it.
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Caller asked for a connection.
    Connect,
    /// The socket opened.
    Opened,
    /// A dial attempt failed.
    DialFailed,
    /// An open socket closed without being asked to.
    Lost,
    /// The reconnect delay elapsed.
    RetryElapsed,
    /// Caller asked to disconnect.
    Disconnect,
}

/// What the driver task must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dial,
    /// Re-issue topic subscriptions on the fresh socket and start reading.
    Resubscribe,
    /// Sleep the reconnect delay before dialling attempt `attempt`.
    Wait { attempt: u32 },
    /// Stop and surface `MaxRetriesExceeded` to error subscribers.
    GiveUp { attempts: u32 },
    Close,
    None,
}

/// Reconnect state machine. Pure: timers and sockets live in the driver.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ClientState,
    retries: u32,
    max_retries: u32,
}

impl StateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ClientState::Disconnected,
            retries: 0,
            max_retries,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn on(&mut self, event: Event) -> Action {
        use ClientState::*;

        let (next, action) = match (self.state, event) {
            (_, Event::Disconnect) => {
                self.retries = 0;
                (Disconnected, Action::Close)
            }
            (Disconnected | Failed, Event::Connect) => {
                self.retries = 0;
                (Connecting, Action::Dial)
            }
            (Connecting, Event::Opened) => {
                self.retries = 0;
                (Connected, Action::Resubscribe)
            }
            (Connecting, Event::DialFailed) | (Connected, Event::Lost) => {
                if self.retries >= self.max_retries {
                    (
                        Failed,
                        Action::GiveUp {
                            attempts: self.retries,
                        },
                    )
                } else {
                    self.retries += 1;
                    (
                        Disconnected,
                        Action::Wait {
                            attempt: self.retries,
                        },
                    )
                }
            }
            (Disconnected, Event::RetryElapsed) if self.retries > 0 => (Connecting, Action::Dial),
            (state, _) => (state, Action::None),
        };

        self.state = next;
        action
    }
}
