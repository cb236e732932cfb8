// Command handlers for the gatekeeper relay CLI

use crate::relay::cli::{ClientArgs, RelayCli, RelayCommand};
use crate::relay::config::{BrokerConfig, RelayClientConfig};
use crate::relay::crypto::{parse_public_key, public_key_fingerprint, RelayKeyPair};
use crate::relay::error::RemoteErrorKind;
use crate::relay::matchmaking::{select_relay, RelaySelectionStrategy};
use crate::relay::message::{
    AccessTypeResponse, MessageType, RequestPayload, ResponsePayload, SystemAddressListResponse,
};
use crate::relay::protocol::{GatekeeperRelayClient, GatekeeperRelayRequest};
use crate::relay::server::BrokerInstance;
use crate::relay::session::RelaySessionDirectory;
use crate::relay::transport::RelayConnector;
use crate::relay::types::{MatchmakingParameters, Relay};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Execute a relay command
pub async fn execute_command(command: RelayCommand) -> Result<()> {
    match command {
        RelayCommand::Keygen { name, out, force } => handle_keygen(name, out, force),
        RelayCommand::Broker { config, bind, ttl } => handle_broker(config, bind, ttl).await,
        RelayCommand::Listen { client, count } => handle_listen(client, count).await,
        RelayCommand::Advertise {
            client,
            peer,
            peer_key,
            kind,
            payload,
        } => handle_advertise(client, peer, peer_key, kind, payload).await,
        RelayCommand::SelectRelay {
            params,
            public,
            strategy,
        } => handle_select_relay(params, public, strategy),
    }
}

fn handle_keygen(name: String, out: Option<PathBuf>, force: bool) -> Result<()> {
    let path = out.unwrap_or_else(|| RelayCli::key_path(&name));

    if path.exists() && !force {
        anyhow::bail!("Key {:?} already exists (use --force to overwrite)", path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create key directory")?;
    }

    let keys = RelayKeyPair::generate();
    keys.save(&path).context("Failed to write private key")?;

    println!("✓ Key pair generated for '{}'", name);
    println!("  Private key: {:?}", path);
    println!("  Fingerprint: {}", public_key_fingerprint(keys.public_key()));
    println!("  Public key:  {}", keys.public_key_base64()?);

    Ok(())
}

async fn handle_broker(config: Option<PathBuf>, bind: Option<String>, ttl: Option<u64>) -> Result<()> {
    let mut broker_config = match config {
        Some(path) => BrokerConfig::from_file(&path)?,
        None => BrokerConfig::default(),
    };
    if let Some(bind) = bind {
        broker_config.bind_address = bind;
    }
    if let Some(ttl) = ttl {
        broker_config.message_ttl_secs = ttl;
    }

    let instance = BrokerInstance::start(broker_config)
        .await
        .context("Failed to start relay broker")?;

    println!("✓ Relay broker running");
    println!("  Address: {}", instance.local_addr());
    println!("  TLS: {}", if instance.is_secure() { "enabled" } else { "disabled" });

    println!("\nPress Ctrl+C to stop the broker");
    tokio::signal::ctrl_c().await?;

    println!("\nStopping broker...");
    instance.shutdown()?;

    Ok(())
}

async fn handle_listen(args: ClientArgs, count: Option<usize>) -> Result<()> {
    let (client, connector) = build_client(&args)?;
    let (host, port) = split_endpoint(&args.relay)?;
    let directory = RelaySessionDirectory::new(connector);

    let session = directory.get_or_create(&host, port, args.secure).await?;
    let mut listener = client.subscribe_advertisement_topic(&session).await?;

    println!("👂 {} listening on {}", client.common_name(), session.endpoint());
    println!("  (Press Ctrl+C to stop)");

    let mut answered = 0usize;
    loop {
        let next = tokio::select! {
            next = client.await_request(&session, &mut listener) => next,
            _ = tokio::signal::ctrl_c() => break,
        };

        match next {
            Ok(Some(request)) => {
                println!("📥 {} request from {}", request.message_type(), request.peer_cn());
                answer(&client, request)?;
                answered += 1;
                if count.is_some_and(|limit| answered >= limit) {
                    break;
                }
            }
            Ok(None) => continue,
            Err(e) if e.is_retryable() => {
                directory.release(&session).await;
                return Err(e).context("Relay connection lost");
            }
            Err(e) => tracing::warn!("Request rejected: {}", e),
        }
    }

    listener.close();
    directory.close_all().await;
    println!("\n✓ Stopped listening ({} requests answered)", answered);

    Ok(())
}

/// Built-in answers of the command line listener
fn answer(client: &GatekeeperRelayClient, request: GatekeeperRelayRequest) -> Result<()> {
    match request.payload().clone() {
        RequestPayload::AccessType => client.respond(
            request,
            ResponsePayload::AccessType(AccessTypeResponse { direct_access: false }),
        )?,
        RequestPayload::SystemAddressList => client.respond(
            request,
            ResponsePayload::SystemAddressList(SystemAddressListResponse { addresses: Vec::new() }),
        )?,
        RequestPayload::QosRelayTest(body) => {
            client.respond(request, ResponsePayload::QosRelayTest(body))?
        }
        other => {
            let message = format!("{} is not handled by this listener", other.message_type());
            client.respond_with_error(request, RemoteErrorKind::Generic, 501, message)?
        }
    }
    Ok(())
}

async fn handle_advertise(
    args: ClientArgs,
    peer: String,
    peer_key: String,
    kind: String,
    payload: String,
) -> Result<()> {
    let (client, connector) = build_client(&args)?;
    let (host, port) = split_endpoint(&args.relay)?;

    let peer_public_key = parse_public_key(&read_key_argument(&peer_key)?)
        .context("Invalid peer public key")?;
    let message_type: MessageType = kind.parse()?;
    let request = RequestPayload::from_json(message_type, &payload)?;

    let directory = RelaySessionDirectory::new(connector);
    let session = directory.get_or_create(&host, port, args.secure).await?;

    println!("📤 Advertising to {} via {}", peer, session.endpoint());
    let Some(advertisement) = client
        .advertise_and_wait(&session, &peer, &peer_public_key)
        .await?
    else {
        directory.close_all().await;
        anyhow::bail!("{} did not acknowledge within {:?}", peer, client.timeout());
    };

    println!("✓ Session {} acknowledged", advertisement.session_id());

    let response = client
        .send_request_and_wait(&session, advertisement, request)
        .await;
    directory.close_all().await;

    match response? {
        Some(response) => {
            println!("📥 {} response:", response.message_type());
            println!("{}", serde_json::to_string_pretty(&response.payload().to_json()?)?);
            Ok(())
        }
        None => anyhow::bail!("{} did not answer within {:?}", peer, client.timeout()),
    }
}

fn handle_select_relay(params: PathBuf, public: Option<PathBuf>, strategy: String) -> Result<()> {
    let strategy: RelaySelectionStrategy = strategy.parse().map_err(anyhow::Error::msg)?;

    let params: MatchmakingParameters = read_json(&params)?;
    let public: Vec<Relay> = match public {
        Some(path) => read_json(&path)?,
        None => Vec::new(),
    };

    match select_relay(strategy, &params, &public) {
        Some(relay) => println!("{}", serde_json::to_string_pretty(&relay)?),
        None => println!("No relay available for cloud '{}'", params.cloud.name),
    }

    Ok(())
}

fn build_client(args: &ClientArgs) -> Result<(GatekeeperRelayClient, RelayConnector)> {
    let config = match &args.config {
        Some(path) => RelayClientConfig::from_file(path)?,
        None => {
            let name = args
                .name
                .clone()
                .context("Either --config or --name is required")?;
            let key = args.key.clone().unwrap_or_else(|| RelayCli::key_path(&name));
            let mut config = RelayClientConfig::new(name, key);
            config.timeout_ms = args.timeout;
            config.validate()?;
            config
        }
    };

    let keys = RelayKeyPair::load(&config.key_path)
        .with_context(|| format!("Failed to load key {:?}", config.key_path))?;
    let client = GatekeeperRelayClient::new(config.common_name.clone(), Arc::new(keys), config.timeout())?;
    let connector = RelayConnector::from_config(&config)?;

    Ok((client, connector))
}

fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("Relay must be host:port, got '{}'", endpoint))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid relay port '{}'", port))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

fn read_key_argument(value: &str) -> Result<String> {
    let path = Path::new(value);
    if path.is_file() {
        return std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path));
    }
    Ok(value.to_string())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("relay.example.com:61616").unwrap(), ("relay.example.com".to_string(), 61616));
        assert_eq!(split_endpoint("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(split_endpoint("relay").is_err());
        assert!(split_endpoint("relay:http").is_err());
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cloud-a.pem");

        handle_keygen("cloud-a".to_string(), Some(path.clone()), false).unwrap();
        let first = RelayKeyPair::load(&path).unwrap();

        assert!(handle_keygen("cloud-a".to_string(), Some(path.clone()), false).is_err());
        handle_keygen("cloud-a".to_string(), Some(path.clone()), true).unwrap();
        let second = RelayKeyPair::load(&path).unwrap();
        assert_ne!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_select_relay_command() {
        let dir = tempdir().unwrap();
        let params = dir.path().join("params.json");
        std::fs::write(
            &params,
            r#"{"cloud":{"operator":"op","name":"a"},"randomSeed":1}"#,
        )
        .unwrap();

        assert!(handle_select_relay(params.clone(), None, "first-available".to_string()).is_ok());
        assert!(handle_select_relay(params, None, "fastest".to_string()).is_err());
    }
}
