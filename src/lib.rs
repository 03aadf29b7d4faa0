pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod executor;
pub mod git;
pub mod gitd;
pub mod logbuf;
pub mod pool;
pub mod process;
pub mod proto;
pub mod registry;
pub mod result;
pub mod util;
pub mod worker;
