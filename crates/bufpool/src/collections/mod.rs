mod deque;
mod multi_clock;

pub use deque::DirectAccessQueue;
pub use multi_clock::{ClockId, MultiClock};
