pub mod ops;
pub mod outcome;
pub mod status;
pub mod traits;

pub use ops::CliGit;
pub use outcome::{PullOutcome, Reachability, RemoteError, RemoteHead};
pub use traits::{GitBackend, HeadInfo, ReferenceInfo};
