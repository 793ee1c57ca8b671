use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, DhtError};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};

use climate_common::{
    actuator::relay_level, network, Actuator, ConnectionFailure, ControlLoop, HttpResponse,
    HttpTransport, LinkInfo, MonotonicClock, NetworkConfig, NetworkLink, Reading, RuntimeConfig,
    Sensor, SensorError, ThingSpeakClient, Ticks, TransportError, ITERATION_BUDGET_MS,
};

const NVS_NAMESPACE: &str = "climate";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const _: () = assert!(ITERATION_BUDGET_MS < WATCHDOG_TIMEOUT_SEC as u64 * 1000);
const WIFI_RESTART_GRACE_MS: u64 = 300_000;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

struct EspLink {
    wifi: EspWifi<'static>,
}

struct Dht11Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    pin_number: i32,
    delay: Ets,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_low: bool,
}

struct EspTransport;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_build_defaults(&mut runtime)?;
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime configuration is incomplete")?;

    let Peripherals { modem, .. } = Peripherals::take()?;

    let sensor =
        Dht11Sensor::new(runtime.hardware.dht_pin).context("failed to initialize DHT11")?;
    let relay = Relay::new(runtime.hardware.relay_pin, runtime.hardware.relay_active_low)
        .context("failed to initialize relay")?;

    let clock = MonotonicClock::new();
    let mut link = EspLink::new(modem, sys_loop, nvs_partition)?;
    let link_info = network::connect(&mut link, &runtime.network, &clock)
        .context("wifi startup failed")?;
    info!("wifi connected: {link_info}");
    disable_wifi_power_save();

    info!(
        "slowest iteration {} ms, watchdog {} s",
        runtime.worst_case_iteration_ms(),
        WATCHDOG_TIMEOUT_SEC
    );
    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let telemetry = ThingSpeakClient::new(&runtime.telemetry, EspTransport);
    let mut control = ControlLoop::new(runtime.control.clone(), sensor, relay, telemetry, clock);
    info!(
        "climate node running ({} mode, channel {})",
        runtime.control.variant.as_str(),
        runtime.telemetry.channel_id
    );

    let mut wifi_disconnected_since: Option<Instant> = None;
    control.run_while(|_report| {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);
        true
    });

    drop(link);
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Values missing from NVS fall back to what the build environment provided.
fn ensure_build_defaults(runtime: &mut RuntimeConfig) -> anyhow::Result<()> {
    fill_if_empty(&mut runtime.network.wifi_ssid, option_env!("WIFI_SSID"));
    fill_if_empty(&mut runtime.network.wifi_pass, option_env!("WIFI_PASS"));
    fill_if_empty(
        &mut runtime.telemetry.write_api_key,
        option_env!("THINGSPEAK_WRITE_API_KEY"),
    );
    fill_if_empty(
        &mut runtime.telemetry.read_api_key,
        option_env!("THINGSPEAK_READ_API_KEY"),
    );

    if runtime.telemetry.channel_id == 0 {
        if let Some(channel) = option_env!("THINGSPEAK_CHANNEL_ID") {
            runtime.telemetry.channel_id = channel
                .trim()
                .parse()
                .map_err(|_| anyhow!("THINGSPEAK_CHANNEL_ID `{channel}` is not a number"))?;
        }
    }
    Ok(())
}

fn fill_if_empty(slot: &mut String, fallback: Option<&str>) {
    if slot.is_empty() {
        if let Some(value) = fallback {
            *slot = value.to_string();
        }
    }
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        Ok(Self { wifi })
    }
}

impl NetworkLink for EspLink {
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), ConnectionFailure> {
        let ssid = network.wifi_ssid.trim();
        if ssid.is_empty() || ssid == "CHANGE_ME" {
            return Err(ConnectionFailure::MissingCredentials);
        }

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| ConnectionFailure::Link("wifi ssid too long".to_string()))?,
                password: network
                    .wifi_pass
                    .as_str()
                    .try_into()
                    .map_err(|_| ConnectionFailure::Link("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(link_error)?;

        self.wifi.start().map_err(link_error)?;
        self.wifi.connect().map_err(link_error)?;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn link_info(&mut self) -> Option<LinkInfo> {
        let ip_info = self.wifi.sta_netif().get_ip_info().ok()?;
        if ip_info.ip.is_unspecified() {
            return None;
        }

        Some(LinkInfo {
            ip: ip_info.ip,
            gateway: Some(ip_info.subnet.gateway),
            netmask: Some(prefix_to_netmask(ip_info.subnet.mask.0)),
            dns: ip_info.dns,
        })
    }
}

fn link_error(err: EspError) -> ConnectionFailure {
    ConnectionFailure::Link(format!("{err:?}"))
}

fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

impl Dht11Sensor {
    fn new(pin_number: i32) -> anyhow::Result<Self> {
        if pin_number < 0 {
            return Err(anyhow!("invalid DHT11 pin: {pin_number}"));
        }

        let mut pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(pin_number) })?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        info!("DHT11 on GPIO{pin_number}");
        Ok(Self {
            pin,
            pin_number,
            delay: Ets,
        })
    }
}

impl Sensor for Dht11Sensor {
    fn measure(&mut self, now: Ticks) -> Result<Reading, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Read(format!("failed to release DHT11 line: {err:?}")))?;

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => Ok(Reading {
                temperature_c: f32::from(reading.temperature),
                humidity_pct: f32::from(reading.relative_humidity),
                taken_at: now,
            }),
            Err(DhtError::ChecksumMismatch) => Err(SensorError::Checksum),
            Err(DhtError::Timeout) => Err(SensorError::Timeout),
            Err(err) => Err(SensorError::Read(format!(
                "DHT11 on GPIO{}: {err:?}",
                self.pin_number
            ))),
        }
    }
}

impl Relay {
    fn new(pin_number: i32, active_low: bool) -> anyhow::Result<Self> {
        if pin_number < 0 {
            return Err(anyhow!("invalid relay pin: {pin_number}"));
        }

        let pin = PinDriver::output(unsafe { AnyOutputPin::new(pin_number) })?;
        info!(
            "relay on GPIO{pin_number} ({})",
            if active_low { "active low" } else { "active high" }
        );
        Ok(Self { pin, active_low })
    }
}

impl Actuator for Relay {
    fn set(&mut self, on: bool) {
        let result = if relay_level(on, self.active_low) {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay {}: {err:?}", if on { "on" } else { "off" });
        }
    }

    fn get(&self) -> bool {
        self.pin.is_set_high() != self.active_low
    }
}

impl EspTransport {
    fn exchange(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf).map_err(|err| transport_error(err.into()))?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.map(|body| body.len().to_string());
        let mut headers = Vec::with_capacity(2);
        if let Some(length) = content_length.as_deref() {
            headers.push(("content-type", "application/json"));
            headers.push(("content-length", length));
        }

        let mut request = client
            .request(method, url, &headers)
            .map_err(transport_error)?;
        if let Some(body) = body {
            request.write_all(body).map_err(transport_error)?;
            request.flush().map_err(transport_error)?;
        }

        let mut response = request.submit().map_err(transport_error)?;
        let status = response.status();

        let mut received = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 {
                break;
            }
            if received.len() + read > MAX_HTTP_BODY {
                return Err(TransportError::Io(format!(
                    "response body exceeds {MAX_HTTP_BODY} bytes"
                )));
            }
            received.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse {
            status,
            body: received,
        })
    }
}

impl HttpTransport for EspTransport {
    fn post_json(
        &mut self,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.exchange(Method::Post, url, Some(body), timeout)
    }

    fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        self.exchange(Method::Get, url, None, timeout)
    }
}

fn transport_error(err: EspIOError) -> TransportError {
    let code = err.0.code();
    if code == esp_idf_svc::sys::ESP_ERR_TIMEOUT as i32
        || code == esp_idf_svc::sys::ESP_ERR_HTTP_EAGAIN as i32
    {
        TransportError::Timeout
    } else {
        TransportError::Io(format!("{err:?}"))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// Remote calls fail on their own while the link is down; a link that stays
/// down past the grace period gets the device restarted.
fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        if wifi_disconnected_since.take().is_some() {
            info!("wifi link restored");
        }
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => {
            warn!("wifi link lost");
            *wifi_disconnected_since = Some(Instant::now());
        }
    }
}
