use async_trait::async_trait;
use probe_agent::agent::{run_pipeline, SensorSetup};
use probe_agent::certs::{CA_FILE, KEY_FILE};
use probe_agent::config::{Config, FileConfig};
use probe_agent::descriptor::{parse_sensors, SensorParams};
use probe_agent::enrollment::EnrollmentApi;
use probe_agent::error::{ConfigError, EnrollmentError, SensorError, TransportError};
use probe_agent::packager::{Batch, OutboundBatch};
use probe_agent::registry::{LoadedSensors, SensorRegistry};
use probe_agent::sample::{Sample, SampleValue};
use probe_agent::sender::BatchTransport;
use probe_agent::sensor::Sensor;
use probe_agent::spool::Spool;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct CounterSensor {
    name: String,
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Sensor for CounterSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &SensorParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn collect(&self, _deadline: Instant) -> Result<Sample, SensorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Sample::new(&self.name, SampleValue::Integer(n as i64)))
    }
}

struct SigningServer {
    ca_cert: Certificate,
    ca_key: KeyPair,
    certs_dir: PathBuf,
}

impl SigningServer {
    fn provision(certs_dir: &Path) -> Arc<Self> {
        std::fs::create_dir_all(certs_dir).unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "pipeline test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        std::fs::write(certs_dir.join(CA_FILE), ca_cert.pem()).unwrap();
        Arc::new(Self {
            ca_cert,
            ca_key,
            certs_dir: certs_dir.to_path_buf(),
        })
    }
}

struct SigningApi(Arc<SigningServer>);

#[async_trait]
impl EnrollmentApi for SigningApi {
    async fn submit_csr(&self, _csr_pem: &str) -> Result<(), EnrollmentError> {
        Ok(())
    }

    async fn fetch_certificate(&self) -> Result<String, EnrollmentError> {
        let server = &self.0;
        let key_pem = std::fs::read_to_string(server.certs_dir.join(KEY_FILE)).unwrap();
        let subject = KeyPair::from_pem(&key_pem).unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "pipeline-agent");
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2120, 1, 1);
        Ok(params
            .signed_by(&subject, &server.ca_cert, &server.ca_key)
            .unwrap()
            .pem())
    }
}

struct Collector {
    accept: bool,
    attempts: AtomicU64,
    received: Mutex<Vec<Batch>>,
}

impl Collector {
    fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            accept,
            attempts: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<Batch> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchTransport for Collector {
    async fn send(&self, batch: &OutboundBatch) -> Result<u64, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.accept {
            return Err(TransportError::Server(503));
        }
        let decoded =
            Batch::decode(&batch.payload).map_err(|err| TransportError::Protocol(err.to_string()))?;
        assert_eq!(decoded.seq, batch.seq);
        self.received.lock().unwrap().push(decoded);
        Ok(batch.seq)
    }
}

fn config(root: &Path) -> Config {
    let file = FileConfig {
        webapi_url: Some("https://collector.test".to_string()),
        agent_id: Some("pipeline-agent".to_string()),
        certs_dir: Some(root.join("certs")),
        state_dir: Some(root.join("state")),
        spool_dir: Some(root.join("spool")),
        max_batch_size: Some(4),
        flush_interval_ms: Some(300),
        initial_retry_ms: Some(100),
        max_retry_interval_ms: Some(1_000),
        shutdown_grace_ms: Some(200),
        ..FileConfig::default()
    };
    Config::resolve(file, root).unwrap()
}

fn counter_sensors(calls: Arc<AtomicU64>) -> SensorSetup {
    let mut registry = SensorRegistry::new();
    registry.register("counter", move |name| {
        Box::new(CounterSensor {
            name: name.to_string(),
            calls: calls.clone(),
        })
    });
    let raw = parse_sensors(
        r#"
        [[sensor]]
        name = "counter"
        type = "counter"
        interval = "100ms"
        timeout = "50ms"
        "#,
    )
    .unwrap();
    let loaded = registry.load(&raw).unwrap();
    SensorSetup::new(registry, loaded)
}

/// Counter readings only; the agent's own streams are skipped.
fn values(samples: impl IntoIterator<Item = Sample>) -> Vec<i64> {
    samples
        .into_iter()
        .filter(|sample| sample.sensor == "counter")
        .map(|sample| match sample.value {
            SampleValue::Integer(n) => n,
            other => panic!("unexpected value {other:?}"),
        })
        .collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(300), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn run_for(
    config: Config,
    sensors: SensorSetup,
    server: Arc<SigningServer>,
    collector: Arc<Collector>,
    until: impl FnMut() -> bool,
) {
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_pipeline(&config, sensors, SigningApi(server), collector, cancel).await }
    });
    wait_until(until).await;
    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn samples_reach_collector_in_order_and_nothing_is_lost() {
    let root = TempDir::new().unwrap();
    let config = config(root.path());
    let server = SigningServer::provision(&root.path().join("certs"));
    let calls = Arc::new(AtomicU64::new(0));
    let collector = Collector::new(true);

    let observed = collector.clone();
    run_for(
        config.clone(),
        counter_sensors(calls.clone()),
        server,
        collector.clone(),
        move || observed.received().len() >= 3,
    )
    .await;

    let batches = collector.received();
    let seqs: Vec<u64> = batches.iter().map(|b| b.seq).collect();
    assert_eq!(seqs[0], 1);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    assert!(batches.iter().all(|b| b.agent_id == "pipeline-agent"));

    // Everything collected is either delivered, still spooled, or saved as pending.
    let spool = Spool::open(config.spool_dir.as_deref().unwrap(), u64::MAX).unwrap();
    let mut all = values(batches.into_iter().flat_map(|b| b.samples));
    for outbound in spool.load().unwrap() {
        all.extend(values(Batch::decode(&outbound.payload).unwrap().samples));
    }
    all.extend(values(spool.take_pending().unwrap()));
    let produced = calls.load(Ordering::SeqCst) as i64;
    assert_eq!(all, (0..produced).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn spooled_batches_are_resent_after_restart() {
    let root = TempDir::new().unwrap();
    let config = config(root.path());
    let server = SigningServer::provision(&root.path().join("certs"));
    let calls = Arc::new(AtomicU64::new(0));

    // Collector down: batches pile up in the spool.
    let refusing = Collector::new(false);
    let observed = refusing.clone();
    run_for(
        config.clone(),
        counter_sensors(calls.clone()),
        server.clone(),
        refusing.clone(),
        move || observed.attempts.load(Ordering::SeqCst) >= 4,
    )
    .await;
    assert!(refusing.received().is_empty());
    let produced = calls.load(Ordering::SeqCst) as i64;
    assert!(produced > 0);

    // Restart without sensors against a working collector.
    let accepting = Collector::new(true);
    let observed = accepting.clone();
    run_for(
        config.clone(),
        SensorSetup::new(SensorRegistry::new(), LoadedSensors::default()),
        server,
        accepting.clone(),
        move || {
            let delivered = observed.received().into_iter().flat_map(|b| b.samples);
            values(delivered).len() as i64 >= produced
        },
    )
    .await;

    let batches = accepting.received();
    let seqs: Vec<u64> = batches.iter().map(|b| b.seq).collect();
    assert_eq!(seqs[0], 1);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    assert_eq!(
        values(batches.into_iter().flat_map(|b| b.samples)),
        (0..produced).collect::<Vec<i64>>()
    );
}
