/// Verbosity and nesting depth, passed down explicitly instead of living in
/// process-wide state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    pub verbose: Option<u8>,
    pub indent: usize,
}

impl LogContext {
    pub fn new(verbose: Option<u8>, indent: usize) -> Self {
        LogContext { verbose, indent }
    }

    pub fn child(self) -> Self {
        LogContext {
            indent: self.indent + 1,
            ..self
        }
    }

    /// `>>>`-style marker for the current depth.
    pub fn prefix(&self) -> String {
        ">".repeat(self.indent.max(1))
    }

    /// Default `tracing` filter directive for this verbosity.
    pub fn filter_directive(&self) -> &'static str {
        match self.verbose {
            None => "warn",
            Some(0) => "info",
            Some(1..=3) => "debug",
            Some(_) => "trace",
        }
    }
}
