//! Worker restart policy.

use tracing::info;

use crate::supervision::worker::WorkerOutcome;

/// Decides whether a dead worker is replaced.
pub trait RestartPolicy: Send + Sync {
    fn should_restart(&self, outcome: &WorkerOutcome) -> bool;
}

/// Default policy: restart only recoverable failures. Graceful exits were
/// asked for, fatal exits would fail again immediately, and process-fatal
/// exits are already tearing the supervisor down.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRestartPolicy;

impl RestartPolicy for DefaultRestartPolicy {
    fn should_restart(&self, outcome: &WorkerOutcome) -> bool {
        match outcome {
            WorkerOutcome::Recoverable => {
                info!("Unexpected worker failure - will restart");
                true
            }
            WorkerOutcome::Graceful => {
                info!("Graceful worker exit - will not restart");
                false
            }
            WorkerOutcome::Fatal
            | WorkerOutcome::FatalProcess
            | WorkerOutcome::FatalSystem => {
                info!("Fatal worker exit - will not restart");
                false
            }
        }
    }
}
