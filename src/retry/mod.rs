mod scheduler;

pub(crate) use scheduler::RetryError;
pub(crate) use scheduler::RetryPolicy;
pub(crate) use scheduler::RetryScheduler;

#[cfg(test)]
pub(crate) use scheduler::test_policy;
