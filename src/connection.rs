//! Connection state for the dual-mode transport.
//!
//! [`ConnectionState::transition`] is a pure function from
//! `(state, event)` to `(state, effects)`. The transport driver owns the real
//! sockets and timers and executes the returned [`Effect`]s; everything about
//! *when* to reconnect, fall back, or upgrade lives here and is tested without
//! a clock.
//!
//! ```text
//!  Attach ──► Connecting(Initial) ──open──► Open (mode=channel)
//!                 │ timeout                   │ unexpected close
//!                 ▼                           ▼
//!          Closed (mode=polling)   ┌─── Backoff (mode=polling) ◄──┐
//!            ▲      │ upgrade tick │        │ reconnect due       │ close,
//!            │      ▼              │        ▼                     │ attempts left
//!            └─ Connecting(Upgrade)│   Connecting(Reconnect) ─────┘
//!                                  │        │ close, budget spent
//!                                  └───────►Closed (polling for good,
//!                                            upgrade ticks continue)
//! ```

use std::time::Duration;

use crate::config::TransportConfig;

/// Which transport is currently carrying session traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Channel,
    Polling,
    Disconnected,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Polling => "polling",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel open is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPurpose {
    /// First attempt after attach; a timeout falls back to polling.
    Initial,
    /// Backoff reconnect after an unexpected close; a timeout counts as a close.
    Reconnect,
    /// Long-interval attempt made while polling; failure is silent.
    Upgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Detached,
    /// No channel and no reconnect pending.
    Closed,
    Connecting(OpenPurpose),
    Open,
    /// Waiting for the reconnect timer.
    Backoff,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Attach,
    ChannelOpened,
    /// Close or error; errors are always routed here.
    ChannelClosed,
    OpenTimedOut,
    ReconnectDue,
    UpgradeDue,
    HeartbeatDue,
    PongReceived,
    Detach,
}

/// Side effects for the driver to execute, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenChannel,
    /// Drop an open attempt that is still in flight.
    AbandonChannel,
    CloseChannel,
    ArmOpenTimer(Duration),
    DisarmOpenTimer,
    /// Start the poll interval; the first poll fires immediately.
    StartPolling,
    StopPolling,
    ScheduleReconnect(Duration),
    StartUpgradeTimer,
    StopUpgradeTimer,
    StartHeartbeat,
    StopHeartbeat,
    Subscribe,
    SendPing,
    CancelAllTimers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub mode: ConnectionMode,
    pub phase: ChannelPhase,
    /// Consecutive unexpected closes since the channel was last open.
    pub reconnect_attempt: u32,
    /// Reconnect budget spent; only upgrade ticks can restore the channel.
    pub budget_exhausted: bool,
    /// Consecutive heartbeats that went unanswered.
    pub missed_pongs: u32,
    awaiting_pong: bool,
    polling: bool,
    upgrade_timer: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            mode: ConnectionMode::Disconnected,
            phase: ChannelPhase::Detached,
            reconnect_attempt: 0,
            budget_exhausted: false,
            missed_pongs: 0,
            awaiting_pong: false,
            polling: false,
            upgrade_timer: false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn transition(
        mut self,
        event: ConnectionEvent,
        config: &TransportConfig,
    ) -> (Self, Vec<Effect>) {
        let mut fx = Vec::new();

        if self.phase == ChannelPhase::Detached && event != ConnectionEvent::Attach {
            return (self, fx);
        }

        match event {
            ConnectionEvent::Attach => {
                if self.phase != ChannelPhase::Detached {
                    fx.push(Effect::CancelAllTimers);
                    fx.push(Effect::CloseChannel);
                }
                self = Self::new();
                self.phase = ChannelPhase::Connecting(OpenPurpose::Initial);
                fx.push(Effect::OpenChannel);
                fx.push(Effect::ArmOpenTimer(config.connect_timeout()));
            }
            ConnectionEvent::ChannelOpened => {
                if let ChannelPhase::Connecting(_) = self.phase {
                    self.phase = ChannelPhase::Open;
                    self.mode = ConnectionMode::Channel;
                    self.reconnect_attempt = 0;
                    self.budget_exhausted = false;
                    self.awaiting_pong = false;
                    self.missed_pongs = 0;
                    fx.push(Effect::DisarmOpenTimer);
                    if self.polling {
                        self.polling = false;
                        fx.push(Effect::StopPolling);
                    }
                    if self.upgrade_timer {
                        self.upgrade_timer = false;
                        fx.push(Effect::StopUpgradeTimer);
                    }
                    fx.push(Effect::Subscribe);
                    fx.push(Effect::StartHeartbeat);
                }
            }
            ConnectionEvent::OpenTimedOut => match self.phase {
                ChannelPhase::Connecting(OpenPurpose::Initial | OpenPurpose::Upgrade) => {
                    fx.push(Effect::AbandonChannel);
                    self.phase = ChannelPhase::Closed;
                    self.enter_polling(&mut fx);
                    self.ensure_upgrade_timer(&mut fx);
                }
                ChannelPhase::Connecting(OpenPurpose::Reconnect) => {
                    fx.push(Effect::AbandonChannel);
                    self.channel_lost(config, &mut fx);
                }
                _ => {}
            },
            ConnectionEvent::ChannelClosed => match self.phase {
                ChannelPhase::Open => {
                    fx.push(Effect::StopHeartbeat);
                    self.awaiting_pong = false;
                    self.channel_lost(config, &mut fx);
                }
                ChannelPhase::Connecting(OpenPurpose::Initial | OpenPurpose::Reconnect) => {
                    fx.push(Effect::DisarmOpenTimer);
                    self.channel_lost(config, &mut fx);
                }
                ChannelPhase::Connecting(OpenPurpose::Upgrade) => {
                    fx.push(Effect::DisarmOpenTimer);
                    self.phase = ChannelPhase::Closed;
                }
                _ => {}
            },
            ConnectionEvent::ReconnectDue => {
                if self.phase == ChannelPhase::Backoff {
                    self.phase = ChannelPhase::Connecting(OpenPurpose::Reconnect);
                    fx.push(Effect::OpenChannel);
                    fx.push(Effect::ArmOpenTimer(config.connect_timeout()));
                }
            }
            ConnectionEvent::UpgradeDue => {
                if self.phase == ChannelPhase::Closed && self.upgrade_timer {
                    self.phase = ChannelPhase::Connecting(OpenPurpose::Upgrade);
                    fx.push(Effect::OpenChannel);
                    fx.push(Effect::ArmOpenTimer(config.connect_timeout()));
                }
            }
            ConnectionEvent::HeartbeatDue => {
                if self.phase == ChannelPhase::Open {
                    if self.awaiting_pong {
                        self.missed_pongs += 1;
                    }
                    self.awaiting_pong = true;
                    fx.push(Effect::SendPing);
                }
            }
            ConnectionEvent::PongReceived => {
                self.awaiting_pong = false;
                self.missed_pongs = 0;
            }
            ConnectionEvent::Detach => {
                fx.push(Effect::CancelAllTimers);
                fx.push(Effect::CloseChannel);
                self = Self::new();
            }
        }

        (self, fx)
    }

    fn channel_lost(&mut self, config: &TransportConfig, fx: &mut Vec<Effect>) {
        if self.reconnect_attempt < config.reconnect_max_attempts {
            self.reconnect_attempt += 1;
            self.phase = ChannelPhase::Backoff;
            fx.push(Effect::ScheduleReconnect(
                config.reconnect_delay(self.reconnect_attempt),
            ));
            self.enter_polling(fx);
        } else {
            self.budget_exhausted = true;
            self.phase = ChannelPhase::Closed;
            self.enter_polling(fx);
            self.ensure_upgrade_timer(fx);
        }
    }

    fn enter_polling(&mut self, fx: &mut Vec<Effect>) {
        self.mode = ConnectionMode::Polling;
        if !self.polling {
            self.polling = true;
            fx.push(Effect::StartPolling);
        }
    }

    fn ensure_upgrade_timer(&mut self, fx: &mut Vec<Effect>) {
        if !self.upgrade_timer {
            self.upgrade_timer = true;
            fx.push(Effect::StartUpgradeTimer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TransportConfig {
        TransportConfig::default()
    }

    fn run(state: ConnectionState, events: &[ConnectionEvent]) -> (ConnectionState, Vec<Effect>) {
        let config = cfg();
        let mut all = Vec::new();
        let mut state = state;
        for ev in events {
            let (next, fx) = state.transition(*ev, &config);
            state = next;
            all.extend(fx);
        }
        (state, all)
    }

    #[test]
    fn attach_opens_channel_with_short_timer() {
        let (s, fx) = ConnectionState::new().transition(ConnectionEvent::Attach, &cfg());
        assert_eq!(s.mode, ConnectionMode::Disconnected);
        assert_eq!(s.phase, ChannelPhase::Connecting(OpenPurpose::Initial));
        assert_eq!(
            fx,
            vec![
                Effect::OpenChannel,
                Effect::ArmOpenTimer(Duration::from_secs(2))
            ]
        );
    }

    #[test]
    fn open_timeout_falls_back_to_polling_with_immediate_poll() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[ConnectionEvent::Attach, ConnectionEvent::OpenTimedOut],
        );
        assert_eq!(s.mode, ConnectionMode::Polling);
        assert_eq!(s.phase, ChannelPhase::Closed);
        assert!(s.is_polling());
        assert!(fx.contains(&Effect::AbandonChannel));
        assert!(fx.contains(&Effect::StartPolling));
        assert!(fx.contains(&Effect::StartUpgradeTimer));
    }

    #[test]
    fn upgrade_from_polling_restores_channel_and_stops_polling() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::OpenTimedOut,
                ConnectionEvent::UpgradeDue,
                ConnectionEvent::ChannelOpened,
            ],
        );
        assert_eq!(s.mode, ConnectionMode::Channel);
        assert!(!s.is_polling());
        assert!(fx.contains(&Effect::StopPolling));
        assert!(fx.contains(&Effect::StopUpgradeTimer));
        assert!(fx.ends_with(&[Effect::Subscribe, Effect::StartHeartbeat]));
    }

    #[test]
    fn failed_upgrade_stays_polling_silently() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::OpenTimedOut,
                ConnectionEvent::UpgradeDue,
                ConnectionEvent::ChannelClosed,
            ],
        );
        assert_eq!(s.mode, ConnectionMode::Polling);
        assert_eq!(s.phase, ChannelPhase::Closed);
        assert_eq!(s.reconnect_attempt, 0);
        assert!(!fx
            .iter()
            .any(|e| matches!(e, Effect::ScheduleReconnect(_))));
    }

    #[test]
    fn unexpected_close_backs_off_exponentially() {
        let config = cfg();
        let (mut s, _) = run(
            ConnectionState::new(),
            &[ConnectionEvent::Attach, ConnectionEvent::ChannelOpened],
        );
        let mut delays = Vec::new();
        for _ in 0..3 {
            let (next, fx) = s.transition(ConnectionEvent::ChannelClosed, &config);
            s = next;
            for e in fx {
                if let Effect::ScheduleReconnect(d) = e {
                    delays.push(d);
                }
            }
            let (next, _) = s.transition(ConnectionEvent::ReconnectDue, &config);
            s = next;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(s.reconnect_attempt, 3);
    }

    #[test]
    fn polls_while_backing_off() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::ChannelOpened,
                ConnectionEvent::ChannelClosed,
            ],
        );
        assert_eq!(s.phase, ChannelPhase::Backoff);
        assert_eq!(s.mode, ConnectionMode::Polling);
        assert!(fx.contains(&Effect::StopHeartbeat));
        assert!(fx.contains(&Effect::StartPolling));
        assert!(!fx.contains(&Effect::StartUpgradeTimer));
    }

    #[test]
    fn six_unexpected_closes_settle_into_polling() {
        let config = cfg();
        let (mut s, _) = run(
            ConnectionState::new(),
            &[ConnectionEvent::Attach, ConnectionEvent::ChannelOpened],
        );
        for i in 0..6 {
            let (next, _) = s.transition(ConnectionEvent::ChannelClosed, &config);
            s = next;
            if i < 5 {
                assert_eq!(s.phase, ChannelPhase::Backoff);
                let (next, fx) = s.transition(ConnectionEvent::ReconnectDue, &config);
                s = next;
                assert!(fx.contains(&Effect::OpenChannel));
            }
        }
        assert!(s.budget_exhausted);
        assert_eq!(s.mode, ConnectionMode::Polling);
        assert_eq!(s.phase, ChannelPhase::Closed);

        // No more backoff reconnects; only long-interval upgrades remain.
        let (s, fx) = s.transition(ConnectionEvent::ReconnectDue, &config);
        assert!(fx.is_empty());
        assert_eq!(s.mode, ConnectionMode::Polling);
    }

    #[test]
    fn reopen_resets_attempt_counter() {
        let (s, _) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::ChannelOpened,
                ConnectionEvent::ChannelClosed,
                ConnectionEvent::ReconnectDue,
                ConnectionEvent::ChannelOpened,
            ],
        );
        assert_eq!(s.reconnect_attempt, 0);
        assert_eq!(s.mode, ConnectionMode::Channel);
    }

    #[test]
    fn reconnect_timeout_counts_as_close() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::ChannelOpened,
                ConnectionEvent::ChannelClosed,
                ConnectionEvent::ReconnectDue,
                ConnectionEvent::OpenTimedOut,
            ],
        );
        assert_eq!(s.reconnect_attempt, 2);
        assert_eq!(s.phase, ChannelPhase::Backoff);
        assert!(fx.contains(&Effect::ScheduleReconnect(Duration::from_secs(2))));
    }

    #[test]
    fn heartbeat_counts_missed_pongs() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::ChannelOpened,
                ConnectionEvent::HeartbeatDue,
                ConnectionEvent::HeartbeatDue,
                ConnectionEvent::HeartbeatDue,
            ],
        );
        assert_eq!(s.missed_pongs, 2);
        assert_eq!(fx.iter().filter(|e| **e == Effect::SendPing).count(), 3);
        // A missing pong alone never closes the channel.
        assert_eq!(s.mode, ConnectionMode::Channel);

        let (s, _) = s.transition(ConnectionEvent::PongReceived, &cfg());
        assert_eq!(s.missed_pongs, 0);
    }

    #[test]
    fn detach_cancels_everything_and_ignores_late_events() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[
                ConnectionEvent::Attach,
                ConnectionEvent::ChannelOpened,
                ConnectionEvent::Detach,
            ],
        );
        assert_eq!(s.mode, ConnectionMode::Disconnected);
        assert!(fx.ends_with(&[Effect::CancelAllTimers, Effect::CloseChannel]));

        for ev in [
            ConnectionEvent::ChannelClosed,
            ConnectionEvent::ReconnectDue,
            ConnectionEvent::UpgradeDue,
            ConnectionEvent::OpenTimedOut,
        ] {
            let (next, fx) = s.clone().transition(ev, &cfg());
            assert!(fx.is_empty(), "{ev:?} produced effects after detach");
            assert_eq!(next.phase, ChannelPhase::Detached);
        }
    }

    #[test]
    fn initial_connect_refused_enters_backoff() {
        let (s, fx) = run(
            ConnectionState::new(),
            &[ConnectionEvent::Attach, ConnectionEvent::ChannelClosed],
        );
        assert_eq!(s.phase, ChannelPhase::Backoff);
        assert_eq!(s.mode, ConnectionMode::Polling);
        assert!(fx.contains(&Effect::DisarmOpenTimer));
    }
}
