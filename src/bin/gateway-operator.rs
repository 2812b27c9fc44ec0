use gateway_operator::prelude::*;

use anyhow::Context;

fn load_config() -> anyhow::Result<(OperatorConfig, ClientConfig)> {
    let operator_config = OperatorConfig::from_env().context("invalid operator configuration")?;
    let client_config = ClientConfig::load(operator_config.operator_name.as_str())
        .context("failed to load the api server connection from a service account or kubeconfig")?;
    Ok((operator_config, client_config))
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "gateway_operator=info,warn");
    }
    env_logger::init();

    let (operator_config, client_config) = match load_config() {
        Ok(configs) => configs,
        Err(err) => {
            log::error!("Failed to start operator: {:#}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_operator(operator_config, client_config) {
        log::error!("Error running operator: {}", err);
        std::process::exit(1);
    }
}
