pub mod app;

/// Runs the command-line runner and returns its exit code.
pub fn run() -> i32 {
    app::cli::run()
}
