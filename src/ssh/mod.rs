pub mod pool;
pub mod runner;

pub use pool::{Credentials, Dial, SessionKey, SshPool};
pub use runner::{CommandOutput, RetryPolicy, RunOptions};
