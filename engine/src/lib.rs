//! # BackUP Engine - Backup Pipeline Library
//!
//! A headless engine that turns a directory tree into a single backup
//! artifact and back. Designed as the foundation for the CLI and any other
//! front end.
//!
//! ## Overview
//!
//! A backup runs a fixed sequence of reversible stages:
//! - Pack the filtered tree into a tar archive (`.tar`)
//! - Optionally compress it with zstd (`.zst`)
//! - Optionally encrypt it with a password-derived key (`.ept`)
//! - Append a checksummed header describing which stages ran
//!
//! A restore reads that header and undoes the stages in reverse order. Wrong
//! passwords, corrupted ciphertext and invalid headers are reported as
//! distinct errors.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{Filter, Mode, Task, TaskConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut task = Task::new("/home/me/docs", "/backups/docs", TaskConfig::default())?;
//! task.set_mode(Mode::ALL);
//! task.set_filter(Filter::new().with_name_pattern(r".*\.txt")?);
//! let report = task.backup(Some("secret1"), None)?;
//! println!("wrote {}", report.artifact.display());
//!
//! let mut restore = Task::new("/tmp/restored", &report.artifact, TaskConfig::default())?;
//! restore.restore(Some("secret1"), None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Mode, Stage, Action, TaskConfig and reports
//! - **error**: Error types and handling
//! - **filter**: Entry selection predicates
//! - **header**: The fixed-size BackupInfo record
//! - **archive**: Tar pack/unpack
//! - **compress**: zstd stage
//! - **crypto**: Password-based encryption
//! - **fs_ops**: Suffix chain and low-level file handling
//! - **task**: Pipeline orchestration (backup, restore, inspect)
//! - **progress**: Progress callback trait

pub mod archive;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod fs_ops;
pub mod header;
pub mod model;
pub mod progress;
pub mod task;

// Re-export main types and functions
pub use crypto::{DecryptStatus, Encryptor, MIN_PASSWORD_LEN};
pub use error::EngineError;
pub use filter::{EntryInfo, FileType, FileTypeMask, Filter, TimeRange};
pub use header::{BackupInfo, HEADER_LEN};
pub use model::{Action, BackupReport, Mode, RestoreReport, Stage, TaskConfig};
pub use progress::ProgressCallback;
pub use task::{inspect, Task};
