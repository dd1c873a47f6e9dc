use std::fmt;
use std::time::{Duration, Instant};

use log::warn;

const NIL: u32 = u32::MAX;

/// A caller-defined element state.
///
/// States are dense indices `0..COUNT`; newly constructed pools place every
/// element in state `from_index(0)`.
pub trait PoolState: Copy + Eq + fmt::Debug + 'static {
    /// Number of states, including the initial one.
    const COUNT: usize;

    /// Maps a dense index back to a state. Only called with `index < COUNT`.
    fn from_index(index: usize) -> Self;

    /// Maps the state to its dense index, which must be `< COUNT`.
    fn into_index(self) -> usize;
}

#[derive(Clone)]
struct Node<S> {
    state: S,
    prev: u32,
    next: u32,
    touched: Instant,
    stamp: u64,
}

#[derive(Clone)]
struct StateList {
    head: u32,
    tail: u32,
    count: usize,
    timeout: Option<Duration>,
}

/// A fixed-size pool of `T` whose elements each occupy exactly one state.
///
/// Every state is an LRU list: the head is the element touched least
/// recently, the tail the one touched most recently. Moving an element
/// between states, touching it, and popping the oldest element of a state
/// are all constant time.
#[derive(Clone)]
pub struct Pool<T, S: PoolState> {
    name: String,
    nodes: Vec<Node<S>>,
    lists: Vec<StateList>,
    elems: Vec<T>,
    next_stamp: u64,
}

impl<T, S: PoolState> Pool<T, S> {
    /// Constructs a pool over `elems`, all starting in state `from_index(0)`
    /// with no state timeouts.
    pub fn new(name: impl Into<String>, elems: Vec<T>) -> Self {
        Self::with_timeouts(name, elems, vec![None; S::COUNT])
    }

    /// Constructs a pool with a per-state timeout table. `timeouts` must
    /// have one entry per state; `None` marks a state as untimed.
    pub fn with_timeouts(
        name: impl Into<String>,
        elems: Vec<T>,
        timeouts: Vec<Option<Duration>>,
    ) -> Self {
        assert_eq!(
            timeouts.len(),
            S::COUNT,
            "one timeout entry is required per state"
        );
        assert!(elems.len() < NIL as usize, "pool too large");
        let now = Instant::now();
        let mut pool = Pool {
            name: name.into(),
            nodes: Vec::with_capacity(elems.len()),
            lists: timeouts
                .into_iter()
                .map(|timeout| StateList {
                    head: NIL,
                    tail: NIL,
                    count: 0,
                    timeout,
                })
                .collect(),
            elems,
            next_stamp: 1,
        };

        for id in 0..pool.elems.len() {
            pool.nodes.push(Node {
                state: S::from_index(0),
                prev: NIL,
                next: NIL,
                touched: now,
                stamp: 0,
            });
            pool.push_tail(id, 0, now);
        }

        pool
    }

    /// Constructs a pool of `count` default elements.
    pub fn with_capacity(name: impl Into<String>, count: usize) -> Self
    where
        T: Default,
    {
        Self::new(name, (0..count).map(|_| T::default()).collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, id: usize) -> &T {
        &self.elems[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut T {
        &mut self.elems[id]
    }

    /// The state the element with this index is currently in.
    pub fn state_of(&self, id: usize) -> S {
        self.nodes[id].state
    }

    /// Number of elements currently in `state`.
    pub fn count(&self, state: S) -> usize {
        self.lists[state.into_index()].count
    }

    /// The timeout configured for `state`, if any.
    pub fn timeout(&self, state: S) -> Option<Duration> {
        self.lists[state.into_index()].timeout
    }

    /// When the element was last touched.
    pub fn touched(&self, id: usize) -> Instant {
        self.nodes[id].touched
    }

    /// Index of the least recently touched element in `state`.
    pub fn oldest_index(&self, state: S) -> Option<usize> {
        match self.lists[state.into_index()].head {
            NIL => None,
            head => Some(head as usize),
        }
    }

    /// Touch time of the least recently touched element in `state`.
    pub fn oldest_touched(&self, state: S) -> Option<Instant> {
        self.oldest_index(state).map(|id| self.nodes[id].touched)
    }

    /// Moves an element from `old` to the tail of `new`, updating its touch
    /// time.
    ///
    /// # Panics
    ///
    /// Panics if the element is not in state `old`; transitioning from the
    /// wrong state is a caller bug.
    pub fn set_state(&mut self, id: usize, old: S, new: S) {
        self.set_state_at(id, old, new, Instant::now())
    }

    /// [`Pool::set_state`] with an explicit clock reading.
    pub fn set_state_at(&mut self, id: usize, old: S, new: S, now: Instant) {
        assert_eq!(
            self.nodes[id].state, old,
            "pool {}: element {} is not in state {:?}",
            self.name, id, old
        );
        self.unlink(id);
        self.push_tail(id, new.into_index(), now);
    }

    /// Moves an element to the tail of `new` if its current state is not
    /// already `new`, returning the previous state, or `Err` with the actual
    /// state when the element is already there.
    pub fn try_set_state(&mut self, id: usize, new: S) -> Result<S, S> {
        let old = self.nodes[id].state;

        if old == new {
            return Err(old);
        }

        self.unlink(id);
        self.push_tail(id, new.into_index(), Instant::now());
        Ok(old)
    }

    /// Pops the least recently touched element of `from` and moves it to the
    /// tail of `to`, returning its index, or `None` if `from` is empty.
    pub fn set_oldest_state(&mut self, from: S, to: S) -> Option<usize> {
        self.set_oldest_state_at(from, to, Instant::now())
    }

    /// [`Pool::set_oldest_state`] with an explicit clock reading.
    pub fn set_oldest_state_at(&mut self, from: S, to: S, now: Instant) -> Option<usize> {
        let id = self.oldest_index(from)?;
        self.unlink(id);
        self.push_tail(id, to.into_index(), now);
        Some(id)
    }

    /// Moves an element to the tail of its current state and updates its
    /// touch time.
    pub fn touch(&mut self, id: usize) {
        self.touch_at(id, Instant::now())
    }

    /// [`Pool::touch`] with an explicit clock reading.
    pub fn touch_at(&mut self, id: usize, now: Instant) {
        let state = self.nodes[id].state;
        self.unlink(id);
        self.push_tail(id, state.into_index(), now);
    }

    /// Hands every element that has overstayed its state's timeout to `cb`,
    /// oldest first.
    ///
    /// The callback must move the element out of the timed-out state;
    /// otherwise the scan cannot progress, and the offending state is
    /// abandoned for this pass with a warning (a debug build panics).
    pub fn check_timeouts<F>(&mut self, cb: F)
    where
        F: FnMut(&mut Self, usize, S),
    {
        self.check_timeouts_at(Instant::now(), cb)
    }

    /// [`Pool::check_timeouts`] with an explicit clock reading.
    pub fn check_timeouts_at<F>(&mut self, now: Instant, mut cb: F)
    where
        F: FnMut(&mut Self, usize, S),
    {
        for index in 0..S::COUNT {
            let state = S::from_index(index);

            let timeout = match self.lists[index].timeout {
                Some(timeout) => timeout,
                None => continue,
            };

            loop {
                let id = match self.lists[index].head {
                    NIL => break,
                    head => head as usize,
                };

                if now.duration_since(self.nodes[id].touched) < timeout {
                    break;
                }

                let stamp = self.nodes[id].stamp;
                cb(self, id, state);

                if self.lists[index].head == id as u32 && self.nodes[id].stamp == stamp {
                    debug_assert!(
                        false,
                        "pool {}: timeout callback left element {} in state {:?}",
                        self.name, id, state
                    );
                    warn!(
                        "pool {}: timeout callback left element {} in state {:?}; abandoning scan",
                        self.name, id, state
                    );
                    break;
                }
            }
        }
    }

    /// Index of the element that timed out at the head of `state`, if the
    /// state is timed and its head has overstayed.
    pub fn expired_head(&self, state: S, now: Instant) -> Option<usize> {
        let timeout = self.timeout(state)?;
        let id = self.oldest_index(state)?;

        if now.duration_since(self.nodes[id].touched) >= timeout {
            Some(id)
        } else {
            None
        }
    }

    fn unlink(&mut self, id: usize) {
        let (prev, next, index) = {
            let node = &self.nodes[id];
            (node.prev, node.next, node.state.into_index())
        };

        match prev {
            NIL => self.lists[index].head = next,
            prev => self.nodes[prev as usize].next = next,
        }

        match next {
            NIL => self.lists[index].tail = prev,
            next => self.nodes[next as usize].prev = prev,
        }

        self.lists[index].count -= 1;
    }

    fn push_tail(&mut self, id: usize, index: usize, now: Instant) {
        let tail = self.lists[index].tail;
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        {
            let node = &mut self.nodes[id];
            node.state = S::from_index(index);
            node.prev = tail;
            node.next = NIL;
            node.touched = now;
            node.stamp = stamp;
        }

        match tail {
            NIL => self.lists[index].head = id as u32,
            tail => self.nodes[tail as usize].next = id as u32,
        }

        self.lists[index].tail = id as u32;
        self.lists[index].count += 1;
    }
}

/// Iterates one state's list in LRU order.
///
/// The walker holds no borrow on the pool, so the element it last returned
/// may be re-stated or touched between steps; when that happens the walk
/// re-anchors to the next element that entered the list after it.
pub struct Walker<S: PoolState> {
    state: S,
    current: u32,
    last_stamp: u64,
    started: bool,
}

impl<S: PoolState> Walker<S> {
    pub fn new(state: S) -> Self {
        Walker {
            state,
            current: NIL,
            last_stamp: 0,
            started: false,
        }
    }

    /// Advances to the next element of the state, or `None` at the end.
    pub fn step<T>(&mut self, pool: &Pool<T, S>) -> Option<usize> {
        let index = self.state.into_index();

        let next = if !self.started {
            pool.lists[index].head
        } else if self.current != NIL
            && pool.nodes[self.current as usize].state == self.state
            && pool.nodes[self.current as usize].stamp == self.last_stamp
        {
            pool.nodes[self.current as usize].next
        } else {
            // The element under the walker moved; list order is ascending by
            // stamp, so resume at the first element stamped after it.
            let mut at = pool.lists[index].head;

            while at != NIL && pool.nodes[at as usize].stamp <= self.last_stamp {
                at = pool.nodes[at as usize].next;
            }

            at
        };

        self.started = true;
        self.current = next;

        if next == NIL {
            None
        } else {
            self.last_stamp = pool.nodes[next as usize].stamp;
            Some(next as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum TestState {
        Free,
        Used,
        Abused,
    }

    impl PoolState for TestState {
        const COUNT: usize = 3;

        fn from_index(index: usize) -> Self {
            match index {
                0 => TestState::Free,
                1 => TestState::Used,
                2 => TestState::Abused,
                _ => unreachable!("no such state"),
            }
        }

        fn into_index(self) -> usize {
            self as usize
        }
    }

    fn pool_of(count: usize) -> Pool<u32, TestState> {
        Pool::with_capacity("cesspool", count)
    }

    fn total(pool: &Pool<u32, TestState>) -> usize {
        pool.count(TestState::Free) + pool.count(TestState::Used) + pool.count(TestState::Abused)
    }

    #[test]
    fn elements_start_free_in_index_order() {
        let pool = pool_of(4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.count(TestState::Free), 4);
        assert_eq!(pool.oldest_index(TestState::Free), Some(0));
        assert_eq!(pool.oldest_index(TestState::Used), None);
        assert_eq!(pool.oldest_touched(TestState::Used), None);
    }

    #[test]
    fn state_counts_always_sum_to_pool_size() {
        let mut pool = pool_of(4);

        for _ in 0..3 {
            pool.set_oldest_state(TestState::Free, TestState::Used);
            assert_eq!(total(&pool), 4);
        }

        pool.set_oldest_state(TestState::Used, TestState::Abused);
        pool.set_state(1, TestState::Used, TestState::Free);
        assert_eq!(total(&pool), 4);
        assert_eq!(pool.count(TestState::Used), 1);
        assert_eq!(pool.count(TestState::Abused), 1);
    }

    #[test]
    fn set_oldest_state_pops_lru_and_appends_mru() {
        let mut pool = pool_of(3);

        assert_eq!(pool.set_oldest_state(TestState::Free, TestState::Used), Some(0));
        assert_eq!(pool.set_oldest_state(TestState::Free, TestState::Used), Some(1));
        assert_eq!(pool.oldest_index(TestState::Used), Some(0));

        // 0 becomes the most recently used, so 1 is now the oldest.
        pool.touch(0);
        assert_eq!(pool.oldest_index(TestState::Used), Some(1));
        assert_eq!(pool.set_oldest_state(TestState::Used, TestState::Free), Some(1));
        assert_eq!(pool.set_oldest_state(TestState::Used, TestState::Free), Some(0));
        assert_eq!(pool.set_oldest_state(TestState::Used, TestState::Free), None);
    }

    #[test]
    fn touch_preserves_relative_order_of_others() {
        let mut pool = pool_of(4);

        for expected in 0..4 {
            let id = pool.set_oldest_state(TestState::Free, TestState::Used);
            assert_eq!(id, Some(expected));
        }

        pool.touch(1);

        let mut walker = Walker::new(TestState::Used);
        let mut order = Vec::new();

        while let Some(id) = walker.step(&pool) {
            order.push(id);
        }

        assert_eq!(order, vec![0, 2, 3, 1]);
    }

    #[test]
    fn try_set_state_reports_the_actual_state() {
        let mut pool = pool_of(2);

        assert_eq!(pool.try_set_state(0, TestState::Used), Ok(TestState::Free));
        assert_eq!(pool.try_set_state(0, TestState::Used), Err(TestState::Used));
        assert_eq!(pool.state_of(0), TestState::Used);
    }

    #[test]
    #[should_panic(expected = "is not in state")]
    fn set_state_panics_on_wrong_old_state() {
        let mut pool = pool_of(1);
        pool.set_state(0, TestState::Used, TestState::Abused);
    }

    #[test]
    fn walker_tolerates_restate_of_current_element() {
        let mut pool = pool_of(4);

        for _ in 0..4 {
            pool.set_oldest_state(TestState::Free, TestState::Used);
        }

        let mut walker = Walker::new(TestState::Used);
        assert_eq!(walker.step(&pool), Some(0));
        assert_eq!(walker.step(&pool), Some(1));

        // Pull the walker's current element out from under it.
        pool.set_state(1, TestState::Used, TestState::Abused);
        assert_eq!(walker.step(&pool), Some(2));
        assert_eq!(walker.step(&pool), Some(3));
        assert_eq!(walker.step(&pool), None);
    }

    #[test]
    fn timeouts_fire_oldest_first_per_state() {
        let start = Instant::now();
        let mut pool: Pool<u32, TestState> = Pool::with_timeouts(
            "timed",
            vec![0; 4],
            vec![None, Some(Duration::from_secs(4)), Some(Duration::from_secs(3))],
        );

        pool.set_oldest_state_at(TestState::Free, TestState::Used, start);
        pool.set_oldest_state_at(TestState::Free, TestState::Abused, start);

        let mut fired: Vec<(usize, TestState)> = Vec::new();

        // After three seconds only the Abused element has overstayed.
        pool.check_timeouts_at(start + Duration::from_secs(3), |pool, id, state| {
            fired.push((id, state));
            pool.set_state(id, state, TestState::Free);
        });
        assert_eq!(fired, vec![(1, TestState::Abused)]);

        // One more second and the Used element follows, exactly once.
        pool.check_timeouts_at(start + Duration::from_secs(4), |pool, id, state| {
            fired.push((id, state));
            pool.set_state(id, state, TestState::Free);
        });
        assert_eq!(
            fired,
            vec![(1, TestState::Abused), (0, TestState::Used)]
        );

        pool.check_timeouts_at(start + Duration::from_secs(5), |_, _, _| {
            panic!("nothing left to time out");
        });
    }

    #[test]
    fn expired_head_respects_the_state_timeout() {
        let start = Instant::now();
        let mut pool: Pool<u32, TestState> = Pool::with_timeouts(
            "timed",
            vec![0; 2],
            vec![None, Some(Duration::from_secs(2)), None],
        );

        pool.set_oldest_state_at(TestState::Free, TestState::Used, start);
        assert_eq!(pool.expired_head(TestState::Used, start), None);
        assert_eq!(
            pool.expired_head(TestState::Used, start + Duration::from_secs(2)),
            Some(0)
        );
        assert_eq!(pool.expired_head(TestState::Free, start + Duration::from_secs(9)), None);
    }

    #[test]
    fn clone_preserves_lists_and_states() {
        let mut pool = pool_of(3);
        pool.set_oldest_state(TestState::Free, TestState::Used);
        *pool.get_mut(0) = 7;

        let clone = pool.clone();
        assert_eq!(clone.count(TestState::Used), 1);
        assert_eq!(clone.state_of(0), TestState::Used);
        assert_eq!(*clone.get(0), 7);
        assert_eq!(clone.oldest_index(TestState::Free), Some(1));
    }
}
