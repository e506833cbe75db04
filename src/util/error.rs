/// Errors that prevent a runtime from being set up.
///
/// Everything that goes wrong after setup is either recovered internally (by collecting and
/// retrying) or is a broken invariant, which panics.
#[derive(Debug)]
pub enum RuntimeError {
    /// Options that are individually valid but do not work together.
    InvalidOptions(String),
    /// The heap region could not be mapped.
    HeapReservation(std::io::Error),
    /// The address range for pooled thread stacks could not be mapped or protected.
    StackReservation(std::io::Error),
    /// The suspension signal handler could not be installed.
    SignalInstallation(std::io::Error),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::InvalidOptions(msg) => write!(f, "invalid options: {}", msg),
            RuntimeError::HeapReservation(e) => write!(f, "cannot reserve the heap: {}", e),
            RuntimeError::StackReservation(e) => {
                write!(f, "cannot reserve thread stacks: {}", e)
            }
            RuntimeError::SignalInstallation(e) => {
                write!(f, "cannot install the suspension signal handler: {}", e)
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::InvalidOptions(_) => None,
            RuntimeError::HeapReservation(e)
            | RuntimeError::StackReservation(e)
            | RuntimeError::SignalInstallation(e) => Some(e),
        }
    }
}
