pub mod cancel;
pub mod compose;
pub mod orchestrator;
pub mod process;

pub use cancel::{cancel_pair, CancelToken, Canceller};
pub use compose::{dockerfile, starter_dockerfile, write_starter_dockerfile, ComposeFile};
pub use orchestrator::{shell_quote, DockerOrchestrator};
pub use process::{CommandExecutor, ProcessConfig, ProcessRunner, Shell};
