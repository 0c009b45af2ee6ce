use crate::agent::{check_clock_skew, load_sensors};
use crate::certs::{csr_fingerprint, CertificateStore, CSR_FILE, KEY_FILE};
use crate::channel::{HttpEnrollmentApi, SecureChannel};
use crate::cli::Args;
use crate::config::Config;
use crate::enrollment::EnrollmentApi;
use crate::error::EnrollmentError;
use crate::registry::SensorRegistry;
use anyhow::{anyhow, bail, Context, Result};
use tokio::time::Instant;

/// Runs the one-shot action selected on the command line.
pub async fn dispatch(args: &Args, config: &Config) -> Result<()> {
    if args.initialize {
        initialize(config)?;
    }
    if args.request_certificate_sign {
        request_certificate_sign(config).await?;
    }
    if args.fetch_certificate {
        fetch_certificate(config).await?;
    }
    if args.check_connection {
        check_connection(config).await?;
    }
    if let Some(name) = &args.test_sensor {
        test_sensor(config, name).await?;
    }
    Ok(())
}

/// Loads and reports the configuration without starting anything.
pub fn validate(config: &Config) -> Result<()> {
    let loaded = load_sensors(config, &SensorRegistry::with_builtins())?;
    println!("agent_id: {}", config.agent_id);
    println!("collector: {}", config.webapi_url);
    println!("sensors: {} active, {} disabled", loaded.active.len(), loaded.disabled.len());
    for disabled in &loaded.disabled {
        println!("  disabled {} ({}): {}", disabled.name, disabled.kind, disabled.reason);
    }
    println!("configuration valid; pass --run to start the agent");
    Ok(())
}

fn initialize(config: &Config) -> Result<()> {
    let store = CertificateStore::new(&config.certs_dir);
    let csr = store.generate_identity(&config.agent_id)?;
    println!("generated {}", store.path(KEY_FILE).display());
    println!("generated {}", store.path(CSR_FILE).display());
    println!("request id: {}", csr_fingerprint(&csr));
    Ok(())
}

fn enrollment_api(config: &Config) -> Result<(CertificateStore, HttpEnrollmentApi)> {
    let store = CertificateStore::new(&config.certs_dir);
    let ca_pem = store.read_ca()?;
    let channel = SecureChannel::anonymous(&config.webapi_url, ca_pem.as_bytes(), config.request_timeout)?;
    let api = HttpEnrollmentApi::new(channel, &config.agent_id);
    Ok((store, api))
}

async fn request_certificate_sign(config: &Config) -> Result<()> {
    let (store, api) = enrollment_api(config)?;
    let csr = store
        .load()?
        .csr_pem
        .ok_or_else(|| anyhow!("no signing request in {}; run --initialize first", store.dir().display()))?;
    api.submit_csr(&csr).await.context("submit signing request")?;
    println!("signing request {} submitted", csr_fingerprint(&csr));
    Ok(())
}

async fn fetch_certificate(config: &Config) -> Result<()> {
    let (store, api) = enrollment_api(config)?;
    match api.fetch_certificate().await {
        Ok(pem) => {
            let validity = store.install_certificate(&pem)?;
            println!("certificate installed, valid until {}", validity.not_after);
            Ok(())
        }
        Err(EnrollmentError::Pending) => {
            println!("certificate not signed yet");
            Ok(())
        }
        Err(err) => Err(err).context("fetch certificate"),
    }
}

async fn check_connection(config: &Config) -> Result<()> {
    let (store, api) = enrollment_api(config)?;
    let skew = check_clock_skew(&api, config.max_clock_skew)
        .await
        .with_context(|| format!("collector {} unreachable", config.webapi_url))?;
    println!("collector reachable, clock skew {} ms", skew.as_millis());
    if skew > config.max_clock_skew {
        println!("warning: skew exceeds {} s", config.max_clock_skew.as_secs());
    }

    let state = store.load()?;
    match state.validity {
        Some(validity) => {
            let identity = store.identity_pem()?;
            let ca_pem = store.read_ca()?;
            let channel = SecureChannel::authenticated(
                &config.webapi_url,
                ca_pem.as_bytes(),
                &identity,
                config.request_timeout,
            )?;
            let authed = HttpEnrollmentApi::new(channel, &config.agent_id);
            authed
                .server_time()
                .await
                .context("request with client certificate failed")?;
            println!("client certificate accepted, valid until {}", validity.not_after);
        }
        None => println!("no usable client certificate installed"),
    }
    Ok(())
}

async fn test_sensor(config: &Config, name: &str) -> Result<()> {
    let loaded = load_sensors(config, &SensorRegistry::with_builtins())?;
    if let Some(disabled) = loaded.disabled.iter().find(|d| d.name == name) {
        bail!("sensor `{name}` is disabled: {}", disabled.reason);
    }
    let configured = loaded
        .active
        .iter()
        .find(|s| s.descriptor.name == name)
        .ok_or_else(|| anyhow!("no sensor named `{name}` in the sensors file"))?;

    let deadline = Instant::now() + configured.descriptor.timeout;
    let sample = match tokio::time::timeout_at(deadline, configured.sensor.collect(deadline)).await {
        Ok(result) => result?,
        Err(_) => bail!("sensor `{name}` timed out after {:?}", configured.descriptor.timeout),
    };
    println!("{}", serde_json::to_string_pretty(&sample)?);
    Ok(())
}
