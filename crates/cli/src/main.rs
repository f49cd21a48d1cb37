use std::process::ExitCode;

fn main() -> ExitCode {
    funnel_cli::run()
}
