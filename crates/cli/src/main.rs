use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    tierflow_cli::run()
}
