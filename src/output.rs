/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so tests
/// and the daemon can swap in their own sink.
pub trait UserOutput: Send + Sync {
    /// Informational line (tables, JSON, progress notes).
    fn status(&self, message: &str);

    /// Success message (e.g., "Service 'agent' started")
    fn success(&self, message: &str);

    /// Warning message (e.g., "Container runtime unavailable")
    fn warning(&self, message: &str);

    /// Error message (e.g., "Service 'agent' failed to start")
    fn error(&self, message: &str);
}

/// Standard CLI output: stdout for results, stderr for problems.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }
}
