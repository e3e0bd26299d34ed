mod time;

#[cfg(test)]
mod test_utils;

pub(crate) use time::Clock;
pub(crate) use time::RealClock;

#[cfg(test)]
pub(crate) use test_utils::TestUtilActor;
#[cfg(test)]
pub(crate) use time::{mocked_clock, MockClock, MockClockController};
