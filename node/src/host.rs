use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use reqwest::{blocking::Client, header::CONTENT_TYPE};
use tracing::{debug, info, warn};

use climate_common::{
    actuator::relay_level, network, Actuator, Clock, ConnectionFailure, ControlLoop, HttpResponse,
    HttpTransport, LinkInfo, MonotonicClock, NetworkConfig, NetworkLink, Reading, RuntimeConfig,
    Sensor, SensorError, ThingSpeakClient, Ticks, TransportError,
};

const CONFIG_FILE: &str = "runtime.json";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime)?;
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime configuration is incomplete")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let node_shutdown = shutdown.clone();
    let mut node = tokio::task::spawn_blocking(move || run_node(runtime, node_shutdown));

    tokio::select! {
        result = &mut node => result.context("control loop task panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutdown requested; finishing current iteration");
            shutdown.store(true, Ordering::Relaxed);
            node.await.context("control loop task panicked")?
        }
    }
}

fn run_node(runtime: RuntimeConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut link = HostLink::new(&runtime.telemetry.base_url);
    let transport = ReqwestTransport::new()?;
    let mut control = start_node(&runtime, &mut link, transport, MonotonicClock::new())?;

    info!(
        variant = runtime.control.variant.as_str(),
        channel = runtime.telemetry.channel_id,
        "climate node running"
    );

    control.run_while(|report| {
        debug!(
            clim = report.actuator.as_str(),
            errors = report.errors.len(),
            "iteration done"
        );
        !shutdown.load(Ordering::Relaxed)
    });

    info!("climate node stopped");
    Ok(())
}

fn start_node<L, H, C>(
    runtime: &RuntimeConfig,
    link: &mut L,
    transport: H,
    clock: C,
) -> anyhow::Result<ControlLoop<SimulatedDht11, SimulatedRelay, ThingSpeakClient<H>, C>>
where
    L: NetworkLink,
    H: HttpTransport,
    C: Clock,
{
    let link_info =
        network::connect(link, &runtime.network, &clock).context("network startup failed")?;
    info!("network ready: {link_info}");

    let telemetry = ThingSpeakClient::new(&runtime.telemetry, transport);
    let relay = SimulatedRelay::new(runtime.hardware.relay_active_low);

    Ok(ControlLoop::new(
        runtime.control.clone(),
        SimulatedDht11::default(),
        relay,
        telemetry,
        clock,
    ))
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_NODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate-node"));

        Self {
            runtime_path: data_dir.join(CONFIG_FILE),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "no config at {}; using defaults",
                    self.runtime_path.display()
                );
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) -> anyhow::Result<()> {
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        runtime.network.wifi_ssid = ssid;
    }
    if let Ok(pass) = std::env::var("WIFI_PASS") {
        runtime.network.wifi_pass = pass;
    }
    if let Ok(url) = std::env::var("THINGSPEAK_BASE_URL") {
        runtime.telemetry.base_url = url;
    }
    if let Ok(key) = std::env::var("THINGSPEAK_WRITE_API_KEY") {
        runtime.telemetry.write_api_key = key;
    }
    if let Ok(key) = std::env::var("THINGSPEAK_READ_API_KEY") {
        runtime.telemetry.read_api_key = key;
    }
    if let Ok(channel) = std::env::var("THINGSPEAK_CHANNEL_ID") {
        runtime.telemetry.channel_id = channel
            .trim()
            .parse()
            .with_context(|| format!("THINGSPEAK_CHANNEL_ID `{channel}` is not a number"))?;
    }
    if let Ok(variant) = std::env::var("CLIMATE_LOOP_VARIANT") {
        runtime.control.variant = variant.parse().map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("climate-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(
        &mut self,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(transport_error)?;
        read_response(response)
    }

    fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(transport_error)?;
        read_response(response)
    }
}

fn read_response(response: reqwest::blocking::Response) -> Result<HttpResponse, TransportError> {
    let status = response.status().as_u16();
    let body = response.bytes().map_err(transport_error)?.to_vec();
    Ok(HttpResponse { status, body })
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

/// Host stand-in for the station interface: the link counts as up once the OS
/// can route to the telemetry host.
struct HostLink {
    probe_target: String,
    local_ip: Option<Ipv4Addr>,
}

impl HostLink {
    fn new(base_url: &str) -> Self {
        Self {
            probe_target: probe_target(base_url),
            local_ip: None,
        }
    }
}

impl NetworkLink for HostLink {
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), ConnectionFailure> {
        if !network.wifi_ssid.is_empty() {
            debug!("host build ignores wifi `{}`", network.wifi_ssid);
        }
        info!("probing route to {}", self.probe_target);
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.local_ip = local_ipv4_towards(&self.probe_target);
        self.local_ip.is_some()
    }

    fn link_info(&mut self) -> Option<LinkInfo> {
        self.local_ip.map(LinkInfo::with_ip)
    }
}

fn probe_target(base_url: &str) -> String {
    let (default_port, rest) = match base_url.split_once("://") {
        Some(("https", rest)) => (443, rest),
        Some((_, rest)) => (80, rest),
        None => (80, base_url),
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:{default_port}")
    }
}

// UDP connect only selects a route; nothing is sent.
fn local_ipv4_towards(target: &str) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(target).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Deterministic DHT11 stand-in. Sweeps 20..37 °C so the clamp range is
/// crossed, and fails a checksum every 13th read like a noisy line.
#[derive(Default)]
struct SimulatedDht11 {
    reads: u32,
}

impl Sensor for SimulatedDht11 {
    fn measure(&mut self, now: Ticks) -> Result<Reading, SensorError> {
        self.reads = self.reads.wrapping_add(1);
        if self.reads % 13 == 0 {
            return Err(SensorError::Checksum);
        }

        Ok(Reading {
            temperature_c: 20.0 + (self.reads % 18) as f32,
            humidity_pct: 40.0 + (self.reads % 6) as f32 * 2.0,
            taken_at: now,
        })
    }
}

struct SimulatedRelay {
    level: bool,
    active_low: bool,
}

impl SimulatedRelay {
    fn new(active_low: bool) -> Self {
        Self {
            level: relay_level(false, active_low),
            active_low,
        }
    }
}

impl Actuator for SimulatedRelay {
    fn set(&mut self, on: bool) {
        let level = relay_level(on, self.active_low);
        if level != self.level {
            let pin = if level { "high" } else { "low" };
            info!(pin, "relay switched {}", if on { "on" } else { "off" });
        }
        self.level = level;
    }

    fn get(&self) -> bool {
        self.level != self.active_low
    }
}
