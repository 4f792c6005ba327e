//! Idle-timeout state machine of a connection
//!
//! ```text
//!              on_active                 on_request_complete
//! NoTimeout ──────────────> ReadArmed ────────────────────────> NoTimeout
//!     ^                         ^                                   |
//!     |                         | on_bytes_received                 | on_response_written
//!     |                         |                                   v
//!     └──── timer fired ─────── PersistArmed <──────────────────────┘
//! ```
//!
//! At most one timer is installed at any time: arming always disarms
//! first, disarming an absent timer does nothing.

use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tokio::time::{self, Instant};

/// What an expired timer was guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Read,
    Write,
    Persist,
    /// Fallback for a timer shape no phase uses.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutState {
    NoTimeout,
    ReadArmed,
    PersistArmed,
}

/// Direction whose inactivity a timer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    Reader,
    Writer,
    All,
}

/// One installed idle detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimer {
    state: IdleState,
    kind: TimeoutKind,
    duration: Duration,
    deadline: Instant,
}

impl IdleTimer {
    /// Detector watching the read side. `Persist` and `Read` are the only
    /// kinds a reader timer reports, anything else reports `Unknown`.
    #[inline]
    pub fn reader(kind: TimeoutKind, duration: Duration) -> Self {
        let kind = match kind {
            TimeoutKind::Read | TimeoutKind::Persist => kind,
            _ => TimeoutKind::Unknown,
        };
        Self::with_state(IdleState::Reader, kind, duration)
    }

    #[inline]
    pub fn writer(duration: Duration) -> Self {
        Self::with_state(IdleState::Writer, TimeoutKind::Write, duration)
    }

    /// Detector watching both directions. No phase installs one, it fires
    /// as `Unknown`.
    #[inline]
    pub fn all(duration: Duration) -> Self {
        Self::with_state(IdleState::All, TimeoutKind::Unknown, duration)
    }

    #[inline]
    fn with_state(state: IdleState, kind: TimeoutKind, duration: Duration) -> Self {
        Self {
            state,
            kind,
            duration,
            deadline: Instant::now() + duration,
        }
    }

    #[inline(always)]
    pub const fn state(&self) -> IdleState {
        self.state
    }

    #[inline(always)]
    pub const fn kind(&self) -> TimeoutKind {
        self.kind
    }

    #[inline(always)]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[inline(always)]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    #[inline]
    fn fire(self) -> TimeoutEvent {
        TimeoutEvent {
            state: self.state,
            kind: self.kind,
            duration: self.duration,
        }
    }
}

/// Durations of the three timer shapes, [`Duration::ZERO`] disables one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeoutConfig {
    pub read_timeout: Duration,
    pub persist_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&crate::limits::ConnLimits> for IdleTimeoutConfig {
    #[inline]
    fn from(limits: &crate::limits::ConnLimits) -> Self {
        Self {
            read_timeout: limits.read_timeout,
            persist_timeout: limits.persist_timeout,
            write_timeout: limits.write_timeout,
        }
    }
}

/// Raised by an expired timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub state: IdleState,
    pub kind: TimeoutKind,
    pub duration: Duration,
}

impl TimeoutEvent {
    #[inline]
    pub fn into_error(self) -> TimeoutError {
        match (self.state, self.kind) {
            (IdleState::Reader, TimeoutKind::Read) => TimeoutError::Read(self.duration),
            (IdleState::Reader, TimeoutKind::Persist) => TimeoutError::Persist(self.duration),
            (IdleState::Writer, _) => TimeoutError::Write(self.duration),
            _ => TimeoutError::Unknown(self.duration),
        }
    }
}

/// Connection-fatal timeout, typed by the phase it interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("read timeout of {} expired", Span(.0))]
    Read(Duration),
    #[error("write timeout of {} expired", Span(.0))]
    Write(Duration),
    #[error("persist timeout of {} expired", Span(.0))]
    Persist(Duration),
    #[error("timeout of {} expired", Span(.0))]
    Unknown(Duration),
}

impl TimeoutError {
    #[inline]
    pub const fn kind(&self) -> TimeoutKind {
        match self {
            Self::Read(_) => TimeoutKind::Read,
            Self::Write(_) => TimeoutKind::Write,
            Self::Persist(_) => TimeoutKind::Persist,
            Self::Unknown(_) => TimeoutKind::Unknown,
        }
    }
}

struct Span<'a>(&'a Duration);

impl fmt::Display for Span<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.subsec_nanos() {
            0 if self.0.as_secs() == 1 => write!(f, "1 second"),
            0 => write!(f, "{} seconds", self.0.as_secs()),
            _ => write!(f, "{} milliseconds", self.0.as_millis()),
        }
    }
}

//

/// Read and persist timers of one connection.
///
/// The machine is owned by the connection task, so every transition is
/// serialized with the connection's I/O. [`expired`](Self::expired) is
/// cancel-safe and meant for a `select!` next to the socket read.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use tollgate::{IdleTimeoutConfig, TimeoutState, TimeoutStateMachine};
///
/// let mut timeouts = TimeoutStateMachine::new(IdleTimeoutConfig {
///     read_timeout: Duration::from_secs(60),
///     persist_timeout: Duration::ZERO,
///     write_timeout: Duration::from_secs(60),
/// });
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// timeouts.on_active();
/// assert_eq!(timeouts.state(), TimeoutState::ReadArmed);
///
/// timeouts.on_request_complete();
/// timeouts.on_response_written();
/// assert_eq!(timeouts.state(), TimeoutState::NoTimeout); // persist disabled
/// # });
/// ```
#[derive(Debug)]
pub struct TimeoutStateMachine {
    config: IdleTimeoutConfig,
    timer: Option<IdleTimer>,
    state: TimeoutState,
}

impl TimeoutStateMachine {
    #[inline]
    pub const fn new(config: IdleTimeoutConfig) -> Self {
        Self {
            config,
            timer: None,
            state: TimeoutState::NoTimeout,
        }
    }

    #[inline(always)]
    pub const fn config(&self) -> &IdleTimeoutConfig {
        &self.config
    }

    #[inline(always)]
    pub const fn state(&self) -> TimeoutState {
        self.state
    }

    #[inline(always)]
    pub const fn timer(&self) -> Option<&IdleTimer> {
        self.timer.as_ref()
    }

    /// Connection accepted: wait for the first request.
    #[inline]
    pub fn on_active(&mut self) {
        self.arm(TimeoutState::ReadArmed);
    }

    /// A complete request arrived: nothing is armed while it is handled.
    #[inline]
    pub fn on_request_complete(&mut self) {
        self.disarm();
    }

    /// The transport acknowledged a response: wait for the next request.
    #[inline]
    pub fn on_response_written(&mut self) {
        self.arm(TimeoutState::PersistArmed);
    }

    /// Bytes of a new request arrived during the keep-alive window: the
    /// rest of that request is bounded by the read timeout.
    #[inline]
    pub fn on_bytes_received(&mut self) {
        if self.state == TimeoutState::PersistArmed {
            self.arm(TimeoutState::ReadArmed);
        }
    }

    /// Installs the timer for `state`, replacing whatever was armed.
    ///
    /// A zero duration leaves nothing armed.
    pub fn arm(&mut self, state: TimeoutState) {
        self.disarm();

        let timer = match state {
            TimeoutState::NoTimeout => return,
            TimeoutState::ReadArmed if !self.config.read_timeout.is_zero() => {
                IdleTimer::reader(TimeoutKind::Read, self.config.read_timeout)
            }
            TimeoutState::PersistArmed if !self.config.persist_timeout.is_zero() => {
                IdleTimer::reader(TimeoutKind::Persist, self.config.persist_timeout)
            }
            _ => return,
        };

        tracing::trace!(?state, duration = ?timer.duration, "timeout armed");
        self.timer = Some(timer);
        self.state = state;
    }

    /// Removes the installed timer. Returns `false` if there was none.
    #[inline]
    pub fn disarm(&mut self) -> bool {
        self.state = TimeoutState::NoTimeout;

        match self.timer.take() {
            Some(timer) => {
                tracing::trace!(kind = ?timer.kind, "timeout disarmed");
                true
            }
            None => false,
        }
    }

    /// Resolves when the armed timer expires, never if nothing is armed.
    ///
    /// The timer is removed before the event is returned, so one arming
    /// produces at most one event.
    pub async fn expired(&mut self) -> TimeoutEvent {
        let Some(deadline) = self.timer.map(|timer| timer.deadline) else {
            return std::future::pending().await;
        };

        time::sleep_until(deadline).await;

        self.state = TimeoutState::NoTimeout;
        match self.timer.take() {
            Some(timer) => timer.fire(),
            None => std::future::pending().await,
        }
    }

    /// Bounds one write with the write timeout, if enabled.
    pub async fn guard_write<F: Future>(&self, write: F) -> Result<F::Output, TimeoutError> {
        let duration = self.config.write_timeout;
        if duration.is_zero() {
            return Ok(write.await);
        }

        let timer = IdleTimer::writer(duration);
        time::timeout_at(timer.deadline, write)
            .await
            .map_err(|_| timer.fire().into_error())
    }
}
