// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hashed timing wheel for idle-connection eviction
//!
//! A rotating array of buckets at one-second resolution. `add` is O(1),
//! `tick` detaches one bucket and either fires or reinserts each entry, so
//! an idle connection is closed within one wheel rotation of its deadline.

use slab::Slab;

/// Opaque handle for a scheduled entry, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(usize);

#[derive(Debug)]
struct Entry {
    deadline: u64,
    conn: usize,
    active: bool,
}

/// The wheel. `now` is a monotonic seconds counter supplied by the caller
/// (the worker derives it from its loop clock once per iteration).
#[derive(Debug)]
pub struct TimeoutWheel {
    buckets: Vec<Vec<usize>>,
    entries: Slab<Entry>,
    cursor: usize,
}

impl TimeoutWheel {
    /// Creates a wheel with `nbuckets` one-second slots.
    pub fn new(nbuckets: usize) -> Self {
        TimeoutWheel {
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
            entries: Slab::new(),
            cursor: 0,
        }
    }

    /// Schedules connection `conn` to expire `seconds` from `now`.
    pub fn add(&mut self, now: u64, seconds: u64, conn: usize) -> TimeoutHandle {
        let key = self.entries.insert(Entry {
            deadline: now + seconds,
            conn,
            active: true,
        });
        let slot = (self.cursor + seconds as usize) % self.buckets.len();
        self.buckets[slot].push(key);
        TimeoutHandle(key)
    }

    /// Cancels an entry. The slot link is left behind and reclaimed lazily
    /// when its bucket next comes around.
    pub fn remove(&mut self, handle: TimeoutHandle) {
        if let Some(entry) = self.entries.get_mut(handle.0) {
            entry.active = false;
        }
    }

    /// Advances the cursor one slot and collects the connections whose
    /// deadline has passed into `expired`. Entries scheduled further out
    /// (more than one rotation) are reinserted into the next slot.
    pub fn tick(&mut self, now: u64, expired: &mut Vec<usize>) {
        self.cursor = (self.cursor + 1) % self.buckets.len();
        let keys = std::mem::take(&mut self.buckets[self.cursor]);

        for key in keys {
            let (fire, conn) = match self.entries.get(key) {
                Some(e) if e.active && e.deadline <= now => (true, e.conn),
                Some(e) if e.active => {
                    let next = (self.cursor + 1) % self.buckets.len();
                    self.buckets[next].push(key);
                    continue;
                }
                _ => (false, 0),
            };

            let _ = self.entries.try_remove(key);
            if fire {
                expired.push(conn);
            }
        }
    }

    /// Number of live (not cancelled) entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.active).count()
    }

    /// True when no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::TimeoutWheel;

    #[test]
    fn entry_fires_when_deadline_reached() {
        let mut wheel = TimeoutWheel::new(8);
        wheel.add(0, 2, 7);

        let mut expired = Vec::new();
        wheel.tick(1, &mut expired);
        assert!(expired.is_empty());
        wheel.tick(2, &mut expired);
        assert_eq!(vec![7], expired);
        assert!(wheel.is_empty());
    }

    #[test]
    fn removed_entry_never_fires() {
        let mut wheel = TimeoutWheel::new(8);
        let handle = wheel.add(0, 1, 3);
        wheel.remove(handle);

        let mut expired = Vec::new();
        for now in 1..=9 {
            wheel.tick(now, &mut expired);
        }
        assert!(expired.is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn long_deadline_survives_a_full_rotation() {
        let mut wheel = TimeoutWheel::new(4);
        // lands in slot (0 + 6) % 4 = 2 but deadline is t=6, past one rotation
        wheel.add(0, 6, 1);

        let mut expired = Vec::new();
        for now in 1..=5 {
            wheel.tick(now, &mut expired);
            assert!(expired.is_empty(), "fired early at t={now}");
        }
        wheel.tick(6, &mut expired);
        assert_eq!(vec![1], expired);
    }

    #[test]
    fn one_entry_per_connection_is_replaceable() {
        let mut wheel = TimeoutWheel::new(8);
        let first = wheel.add(0, 5, 9);
        wheel.remove(first);
        wheel.add(0, 2, 9);
        assert_eq!(1, wheel.len());

        let mut expired = Vec::new();
        wheel.tick(1, &mut expired);
        wheel.tick(2, &mut expired);
        assert_eq!(vec![9], expired);
    }
}
