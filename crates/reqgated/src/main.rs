use std::process::ExitCode;

fn main() -> ExitCode {
    match reqgated::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("reqgated: {error}");
            ExitCode::FAILURE
        }
    }
}
