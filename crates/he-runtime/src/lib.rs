//! Backend facade: tensor creation, compilation and execution over one
//! encoding capability and one configuration registry.

#![forbid(unsafe_code)]

pub mod backend;
pub mod cpu;
pub mod ledger;

pub use backend::{Backend, BackendError, Executable};
pub use cpu::CpuBackend;
pub use ledger::{ExecutionLedger, LedgerEntry};
