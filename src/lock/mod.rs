mod acquirer;

pub(crate) use acquirer::AcquireOutcome;
pub(crate) use acquirer::AcquireReport;
pub(crate) use acquirer::LockAcquirer;
