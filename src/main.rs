use std::process::ExitCode;

fn main() -> ExitCode {
    tubegrab_lib::run()
}
