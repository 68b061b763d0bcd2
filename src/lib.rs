use clap::Parser;
use env::Env;

pub use self::args::Args;

pub mod args;
pub mod commands;
pub mod denial;
pub mod env;
pub mod error;
pub mod hsm;
pub mod parse;
pub mod records;
pub mod sign;
pub mod verify;

use error::Error;

/// Parse the command line arguments taken from the given environment.
pub fn parse_args(env: impl Env) -> Result<Args, Error> {
    Ok(Args::try_parse_from(env.args_os())?)
}

/// Run the program and return the process exit code.
pub fn run(env: impl Env) -> u8 {
    init_logging(&env);

    let args = match parse_args(&env) {
        Ok(args) => args,
        Err(err) => {
            err.pretty_print(&env);
            return err.exit_code();
        }
    };

    match args.execute(&env) {
        Ok(()) => 0,
        Err(err) => {
            err.pretty_print(&env);
            err.exit_code()
        }
    }
}

/// Set up the global tracing subscriber, writing to the environment's
/// stderr.
///
/// Initialization is attempted at most once per process; repeated calls
/// (e.g. from tests driving multiple fake commands) are no-ops.
fn init_logging(env: &impl Env) {
    let stderr = env.stderr();
    let ansi = stderr.is_terminal();
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(ansi)
        .without_time()
        .with_target(false)
        .with_writer(stderr)
        .try_init();
}
