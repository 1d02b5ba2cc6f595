use std::fmt;
use std::time::Duration;

/// Broker session state as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the reconnection budget is spent.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {:?})", attempt, delay)
            }
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// Transport notifications, applied in the order the transport reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    /// The broker acknowledged the session.
    Connected,
    /// A connect attempt failed or an established session dropped.
    Down { reason: String },
    BackoffElapsed,
    /// The session was closed locally; no reconnect follows.
    Closed,
}

/// What the transport driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Attempt a connection (poll the transport).
    Connect,
    /// Issue every subscription again.
    Subscribe,
    /// Sleep, then report `BackoffElapsed`.
    Wait(Duration),
    /// Stop; no further attempts are allowed.
    Halt,
    Idle,
}

/// Pure exponential backoff: `base * 2^(attempt - 1)`, no jitter and no cap
/// other than the attempt ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor)
    }

    /// Records a failure and returns the delay before the next attempt, or
    /// `None` once `max_attempts` retries have already been spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Connection lifecycle state machine.
///
/// `Disconnected -> Connecting -> Connected -> Disconnected -> Reconnecting ->
/// Connecting ...` with `Failed` as the absorbing state. The driver feeds it
/// `LinkEvent`s and executes the returned `Directive`.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    state: ConnectionState,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(base_delay, max_attempts),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn handle(&mut self, event: LinkEvent) -> Directive {
        if self.state == ConnectionState::Failed {
            return Directive::Halt;
        }

        match (self.state, event) {
            (ConnectionState::Disconnected, LinkEvent::Start) => {
                self.state = ConnectionState::Connecting;
                Directive::Connect
            }
            (_, LinkEvent::Connected) => {
                self.state = ConnectionState::Connected;
                self.backoff.reset();
                Directive::Subscribe
            }
            (
                ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnected,
                LinkEvent::Down { .. },
            ) => {
                self.state = ConnectionState::Disconnected;
                match self.backoff.next_delay() {
                    Some(delay) => {
                        self.state = ConnectionState::Reconnecting {
                            attempt: self.backoff.attempts(),
                            delay,
                        };
                        Directive::Wait(delay)
                    }
                    None => {
                        self.state = ConnectionState::Failed;
                        Directive::Halt
                    }
                }
            }
            (ConnectionState::Reconnecting { .. }, LinkEvent::BackoffElapsed) => {
                self.state = ConnectionState::Connecting;
                Directive::Connect
            }
            (_, LinkEvent::Closed) => {
                self.state = ConnectionState::Disconnected;
                Directive::Idle
            }
            _ => Directive::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);

    fn down() -> LinkEvent {
        LinkEvent::Down {
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_connect_then_subscribe() {
        let mut manager = ConnectionManager::new(BASE, 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.handle(LinkEvent::Start), Directive::Connect);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.handle(LinkEvent::Connected), Directive::Subscribe);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_backoff_delays_double() {
        let max = 10;
        let mut manager = ConnectionManager::new(BASE, max);
        manager.handle(LinkEvent::Start);

        for n in 1..max {
            let directive = manager.handle(down());
            let expected = BASE * 2_u32.pow(n - 1);
            assert_eq!(directive, Directive::Wait(expected), "after {} failures", n);
            assert_eq!(
                manager.state(),
                ConnectionState::Reconnecting {
                    attempt: n,
                    delay: expected
                }
            );
            assert_eq!(manager.handle(LinkEvent::BackoffElapsed), Directive::Connect);
        }
    }

    #[test]
    fn test_exhausted_budget_is_terminal() {
        let max = 3;
        let mut manager = ConnectionManager::new(BASE, max);
        manager.handle(LinkEvent::Start);

        for _ in 0..max {
            assert!(matches!(manager.handle(down()), Directive::Wait(_)));
            manager.handle(LinkEvent::BackoffElapsed);
        }

        assert_eq!(manager.handle(down()), Directive::Halt);
        assert_eq!(manager.state(), ConnectionState::Failed);

        // Nothing revives a failed manager.
        assert_eq!(manager.handle(LinkEvent::BackoffElapsed), Directive::Halt);
        assert_eq!(manager.handle(LinkEvent::Start), Directive::Halt);
        assert_eq!(manager.handle(LinkEvent::Connected), Directive::Halt);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut manager = ConnectionManager::new(BASE, 5);
        manager.handle(LinkEvent::Start);
        manager.handle(down());
        manager.handle(LinkEvent::BackoffElapsed);
        manager.handle(down());
        assert_eq!(manager.attempts(), 2);

        manager.handle(LinkEvent::BackoffElapsed);
        assert_eq!(manager.handle(LinkEvent::Connected), Directive::Subscribe);
        assert_eq!(manager.attempts(), 0);

        // A drop after a good session starts over at the base delay.
        assert_eq!(manager.handle(down()), Directive::Wait(BASE));
    }

    #[test]
    fn test_local_close_does_not_reconnect() {
        let mut manager = ConnectionManager::new(BASE, 5);
        manager.handle(LinkEvent::Start);
        manager.handle(LinkEvent::Connected);
        assert_eq!(manager.handle(LinkEvent::Closed), Directive::Idle);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.attempts(), 0);
    }

    #[test]
    fn test_stray_backoff_elapsed_is_ignored() {
        let mut manager = ConnectionManager::new(BASE, 5);
        manager.handle(LinkEvent::Start);
        manager.handle(LinkEvent::Connected);
        assert_eq!(manager.handle(LinkEvent::BackoffElapsed), Directive::Idle);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(5), u32::MAX);
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(64), Duration::from_secs(5).saturating_mul(u32::MAX));
    }
}
