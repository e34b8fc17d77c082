mod extract;
mod fetcher;
mod index;
mod installer;
mod layout;
mod lock;
mod progress;

pub use fetcher::ArtifactFetcher;
pub use index::ModelIndex;
pub use installer::{InstallKey, InstallTicket, Installer, InstallerConfig};
pub use layout::CacheLayout;
pub use lock::VersionLock;
pub use progress::ProgressSender;
