use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Handle of a scheduled expiry check. A flow only honors the timer it was last armed with.
pub(crate) type TimerId = u64;

/// Tracks inactive flow expiration.
///
/// Flows are bucketed by the time their inactivity window would end. A sweep only visits the
/// buckets that came due since the previous sweep; a flow found still active is moved to the
/// bucket of its new deadline.
pub(super) struct TimerWheel<K> {
    /// Width of one bucket.
    period: Duration,
    /// Time of bucket 0, fixed by the first timestamp seen.
    start_ts: Option<Instant>,
    /// Index of the next bucket to expire.
    next_bucket: u64,
    /// Next timer handle.
    next_timer: TimerId,
    /// List of timers.
    timers: Vec<VecDeque<(K, TimerId)>>,
}

impl<K> TimerWheel<K> {
    /// Creates a new `TimerWheel` covering deadlines up to `max_timeout` ahead with a bucket
    /// width of `timeout_resolution`.
    pub(super) fn new(max_timeout: Duration, timeout_resolution: Duration) -> Self {
        let period = timeout_resolution.max(Duration::from_millis(1));
        let nb_buckets = (max_timeout.as_millis() / period.as_millis()) as usize + 2;
        TimerWheel {
            period,
            start_ts: None,
            next_bucket: 0,
            next_timer: 0,
            timers: (0..nb_buckets).map(|_| VecDeque::new()).collect(),
        }
    }

    #[inline]
    fn bucket_of(&mut self, ts: Instant) -> u64 {
        let start_ts = *self.start_ts.get_or_insert(ts);
        (ts.saturating_duration_since(start_ts).as_millis() / self.period.as_millis()) as u64
    }

    #[inline]
    fn push(&mut self, key: K, timer: TimerId, deadline: Instant) {
        let bucket = self.bucket_of(deadline).max(self.next_bucket);
        let index = (bucket % self.timers.len() as u64) as usize;
        self.timers[index].push_back((key, timer));
    }

    /// Schedules a check of `key` once `deadline` has passed. Returns the new timer.
    pub(super) fn insert(&mut self, key: K, deadline: Instant) -> TimerId {
        let timer = self.next_timer;
        self.next_timer += 1;
        self.push(key, timer, deadline);
        timer
    }

    /// Visits every timer due at `now`.
    ///
    /// `check` is called with each due key and timer. It returns `None` once the flow expired,
    /// is gone, or was re-armed with another timer, and the flow's next deadline otherwise.
    pub(super) fn expire<F>(&mut self, now: Instant, mut check: F)
    where
        F: FnMut(&K, TimerId) -> Option<Instant>,
    {
        let nb_buckets = self.timers.len() as u64;
        let last_expire_bucket = self.bucket_of(now);
        if last_expire_bucket < self.next_bucket {
            return;
        }
        // every slot is visited at most once per sweep
        let first_bucket = self
            .next_bucket
            .max(last_expire_bucket.saturating_sub(nb_buckets - 1));
        log::debug!(
            "check buckets {}..={} of {}",
            first_bucket,
            last_expire_bucket,
            nb_buckets
        );

        let mut not_expired = vec![];
        for expire_bucket in first_bucket..=last_expire_bucket {
            let list = &mut self.timers[(expire_bucket % nb_buckets) as usize];
            for (key, timer) in list.drain(..) {
                if let Some(deadline) = check(&key, timer) {
                    not_expired.push((key, timer, deadline));
                }
            }
        }
        // the last bucket is only partly elapsed and is visited again by the next sweep
        self.next_bucket = last_expire_bucket;
        for (key, timer, deadline) in not_expired {
            self.push(key, timer, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(wheel: &mut TimerWheel<u32>, now: Instant, deadlines: &[Instant]) -> Vec<u32> {
        let mut due = vec![];
        wheel.expire(now, |key, _| {
            let deadline = deadlines[*key as usize];
            if now > deadline {
                due.push(*key);
                None
            } else {
                Some(deadline)
            }
        });
        due.sort_unstable();
        due
    }

    #[test]
    fn core_timerwheel_expires_at_deadline() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_secs(10), Duration::from_millis(100));
        let deadlines = [
            start + Duration::from_millis(250),
            start + Duration::from_millis(5_000),
        ];
        wheel.insert(0, deadlines[0]);
        wheel.insert(1, deadlines[1]);

        assert!(collect(&mut wheel, start + Duration::from_millis(250), &deadlines).is_empty());
        assert_eq!(
            collect(&mut wheel, start + Duration::from_millis(251), &deadlines),
            vec![0]
        );
        assert!(collect(&mut wheel, start + Duration::from_millis(4_000), &deadlines).is_empty());
        assert_eq!(
            collect(&mut wheel, start + Duration::from_secs(60), &deadlines),
            vec![1]
        );
        assert!(collect(&mut wheel, start + Duration::from_secs(120), &deadlines).is_empty());
    }

    #[test]
    fn core_timerwheel_reschedules_later_deadline() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_secs(1), Duration::from_millis(100));
        let mut deadlines = vec![start + Duration::from_millis(500)];
        wheel.insert(0, deadlines[0]);
        // activity pushed the deadline back after the timer was armed
        deadlines[0] = start + Duration::from_millis(1_400);
        assert!(collect(&mut wheel, start + Duration::from_millis(900), &deadlines).is_empty());
        assert!(collect(&mut wheel, start + Duration::from_millis(1_400), &deadlines).is_empty());
        assert_eq!(
            collect(&mut wheel, start + Duration::from_millis(1_401), &deadlines),
            vec![0]
        );
    }
}
