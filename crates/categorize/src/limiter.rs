use governor::clock::{Clock, DefaultClock, Reference};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Grant times inside the trailing window of one ceiling.
struct Window<I> {
    limit: u32,
    span: Duration,
    grants: VecDeque<I>,
}

impl<I: Reference> Window<I> {
    fn new(limit: u32, span: Duration) -> Self {
        Self { limit, span, grants: VecDeque::new() }
    }

    fn has_room(&mut self, now: I) -> bool {
        while let Some(&oldest) = self.grants.front() {
            if Duration::from(now.duration_since(oldest)) < self.span {
                break;
            }
            self.grants.pop_front();
        }
        self.grants.len() < self.limit as usize
    }
}

struct Windows<I> {
    minute: Window<I>,
    day: Window<I>,
}

/// Two independent ceilings on outbound AI requests, each a sliding window:
/// no span of one minute (or one day) ever holds more grants than its limit.
/// Never blocks: a request over either ceiling is refused immediately and
/// spends nothing. A ceiling of zero refuses all.
pub struct AiRateLimiter<C: Clock = DefaultClock> {
    per_minute: u32,
    per_day: u32,
    clock: C,
    windows: Mutex<Windows<C::Instant>>,
}

impl AiRateLimiter<DefaultClock> {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self::with_clock(per_minute, per_day, DefaultClock::default())
    }
}

impl<C: Clock> AiRateLimiter<C> {
    pub fn with_clock(per_minute: u32, per_day: u32, clock: C) -> Self {
        let windows = Mutex::new(Self::fresh(per_minute, per_day));
        Self { per_minute, per_day, clock, windows }
    }

    fn fresh(per_minute: u32, per_day: u32) -> Windows<C::Instant> {
        Windows { minute: Window::new(per_minute, MINUTE), day: Window::new(per_day, DAY) }
    }

    /// Grants one request if both ceilings have room, recording it in both.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let minute_ok = windows.minute.has_room(now);
        let day_ok = windows.day.has_room(now);
        if !(minute_ok && day_ok) {
            return false;
        }
        windows.minute.grants.push_back(now);
        windows.day.grants.push_back(now);
        true
    }

    /// Forgets every grant, refilling both ceilings.
    pub fn reset(&self) {
        let fresh = Self::fresh(self.per_minute, self.per_day);
        *self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    pub fn per_day(&self) -> u32 {
        self.per_day
    }
}

impl<C: Clock> std::fmt::Debug for AiRateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiRateLimiter")
            .field("per_minute", &self.per_minute)
            .field("per_day", &self.per_day)
            .finish()
    }
}
