pub mod config;
pub mod gate;
pub mod init;
pub mod ledger;
pub mod pack;
pub mod proposal;
pub mod run;
pub mod signal;
