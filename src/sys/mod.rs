// 🛡️ Zero-Trust Architecture: each capability sits behind a trait in `traits`.

pub mod traits;      // Global contracts and run-scoped types
pub mod secrets;     // Memory hygiene (ProviderCredential) + secret resolution
pub mod identity;    // User/host validation and shell quoting
pub mod fs;          // Fail-closed file and directory creation
pub mod credentials; // Private key provisioning
pub mod process;     // Subprocess execution with live output
pub mod output;      // Output forwarding to the caller's streams
pub mod invoker;     // Remote run script + execution
