use std::net::SocketAddr;

use computed_service::config::Config;

pub fn healthcheck(config: Config, addr: Option<SocketAddr>, timeout: u64) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout))
        .build()?;

    let addr = match addr {
        Some(addr) => addr,
        None => config.bind.parse()?,
    };

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    match client.get(url).send() {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Computed ({addr}) is unhealthy. Status: {}",
                response.status()
            ))
        }
        Err(error) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Failed to check Computed ({addr}) health: {error}"
            ))
        }
    }
}
