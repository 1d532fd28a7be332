use std::process::ExitCode;

use amber::config::EngineConfig;
use amber::run::node_main;

#[tokio::main]
async fn main() -> ExitCode {
    let result = match EngineConfig::from_env() {
        Ok(config) => node_main(config).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
