pub mod payment_ledger;
pub mod table_service;

#[cfg(test)]
pub mod memory_ledger;
