use std::process::ExitCode;

fn main() -> ExitCode {
    let env = dnshsm::env::RealEnv;
    ExitCode::from(dnshsm::run(env))
}
