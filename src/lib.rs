//! Local TCP port forwarding over an external `ssh` client.
//!
//! ```no_run
//! # async fn demo() -> Result<(), sshfwd::ForwardError> {
//! let mut tunnel = sshfwd::forward_remote("alice@db.example:5432", |config| {
//!     config.timeout = std::time::Duration::from_secs(30);
//! })
//! .await?;
//! println!("connect to {}", tunnel.local_addr());
//! tunnel.release().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod port;
pub mod ssh;

pub use config::ForwardConfig;
pub use error::{ConfigError, ForwardError};
pub use handle::ForwardHandle;
pub use port::allocate_free_local_port;
pub use ssh::{Forwarder, forward, forward_remote, ssh_args};
