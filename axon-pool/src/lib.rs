//! State-timed object pools.
//!
//! A [`Pool`] owns a fixed array of elements and tracks every element in
//! exactly one of N caller-defined states. Each state keeps its members in a
//! doubly-linked LRU list, so "give me the least recently used element in
//! state X" and "move this element to the back of state Y" are O(1). States
//! may carry a timeout; [`Pool::check_timeouts`] hands elements that have sat
//! in a timed state for too long to a caller-supplied callback.
//!
//! Links are element indices into the pool rather than references, so a pool
//! can be cloned or moved freely and an element is identified by a plain
//! `usize` for its whole life.
//!
//! ```
//! use axon_pool::{Pool, PoolState};
//!
//! #[derive(Clone, Copy, PartialEq, Eq, Debug)]
//! enum State {
//!     Free,
//!     Used,
//! }
//!
//! impl PoolState for State {
//!     const COUNT: usize = 2;
//!
//!     fn from_index(index: usize) -> Self {
//!         match index {
//!             0 => State::Free,
//!             _ => State::Used,
//!         }
//!     }
//!
//!     fn into_index(self) -> usize {
//!         self as usize
//!     }
//! }
//!
//! let mut pool: Pool<u32, State> = Pool::with_capacity("things", 4);
//! let id = pool.set_oldest_state(State::Free, State::Used).unwrap();
//! *pool.get_mut(id) = 42;
//! assert_eq!(pool.count(State::Used), 1);
//! ```

mod pool;
mod shared;

pub use crate::pool::{Pool, PoolState, Walker};
pub use crate::shared::SharedPool;
