pub mod approval;
pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod gate;
pub mod hashing;
pub mod io;
pub mod ledger;
pub mod pack;
pub mod paths;
pub mod types;

pub use error::{AttestError, FailureClass, Result};
