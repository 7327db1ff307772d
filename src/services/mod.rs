pub mod clock;
pub mod contract_locks;
pub mod contract_payments;
pub mod payment_schedule;
pub mod scheduler;
