use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    actuator::Actuator,
    climate::fake_clim_temperature,
    config::ControlConfig,
    error::{FetchError, NodeError},
    fields::{
        FIELD_CLIM_STATUS, FIELD_FAKE_CLIM_TEMPERATURE, FIELD_HEARTBEAT_STATUS, FIELD_HUMIDITY,
        FIELD_TARGET_TEMPERATURE, FIELD_TEMPERATURE,
    },
    sensor::Sensor,
    telemetry::Telemetry,
    ticks::{Cadence, Clock},
    types::{Ack, ActuatorState, ChannelUpdate, LoopVariant, Reading},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub actuator: ActuatorState,
    /// Re-armed after each successful sensor poll.
    pub publish_cadence: Cadence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub target_temperature_c: Option<f32>,
    pub command: Option<ActuatorState>,
    pub reading: Option<Reading>,
    pub published: Option<ChannelUpdate>,
    pub ack: Option<Ack>,
    pub actuator: ActuatorState,
    pub errors: Vec<NodeError>,
    pub next_delay: Duration,
}

impl CycleReport {
    fn new(actuator: ActuatorState) -> Self {
        Self {
            target_temperature_c: None,
            command: None,
            reading: None,
            published: None,
            ack: None,
            actuator,
            errors: Vec::new(),
            next_delay: Duration::ZERO,
        }
    }
}

pub fn sensor_payload(config: &ControlConfig, reading: &Reading) -> ChannelUpdate {
    let mut update = ChannelUpdate::new()
        .with(FIELD_TEMPERATURE, reading.temperature_c)
        .with(FIELD_HUMIDITY, reading.humidity_pct);

    if config.variant == LoopVariant::Heartbeat {
        update.set(
            FIELD_FAKE_CLIM_TEMPERATURE,
            fake_clim_temperature(reading.temperature_c, config.fake_temp_range),
        );
    }
    update
}

pub struct ControlLoop<S, A, T, C> {
    config: ControlConfig,
    sensor: S,
    actuator: A,
    telemetry: T,
    clock: C,
    state: LoopState,
}

impl<S, A, T, C> ControlLoop<S, A, T, C>
where
    S: Sensor,
    A: Actuator,
    T: Telemetry,
    C: Clock,
{
    /// Forces the relay off; the first sensor poll is due one interval from now.
    pub fn new(config: ControlConfig, sensor: S, mut actuator: A, telemetry: T, clock: C) -> Self {
        actuator.set(false);
        let state = LoopState {
            actuator: ActuatorState::OFF,
            publish_cadence: Cadence::new(config.update_interval_ms, clock.now()),
        };

        Self {
            config,
            sensor,
            actuator,
            telemetry,
            clock,
            state,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn step(&mut self) -> CycleReport {
        let mut report = CycleReport::new(self.state.actuator);

        if self.config.variant == LoopVariant::RemoteCommand {
            self.follow_remote_command(&mut report);
        }

        let now = self.clock.now();
        if self.state.publish_cadence.is_due(now) {
            self.sample_and_publish(&mut report);
        }

        if self.config.variant == LoopVariant::Heartbeat {
            self.toggle_heartbeat(&mut report);
        }

        report.actuator = self.state.actuator;
        report.next_delay = if report.errors.is_empty() {
            Duration::from_millis(u64::from(self.config.poll_interval_ms))
        } else {
            Duration::from_millis(u64::from(self.config.error_delay_ms))
        };
        report
    }

    pub fn run_while<F>(&mut self, mut keep_running: F)
    where
        F: FnMut(&CycleReport) -> bool,
    {
        loop {
            let report = self.step();
            if !keep_running(&report) {
                return;
            }
            self.clock.sleep(report.next_delay);
        }
    }

    fn follow_remote_command(&mut self, report: &mut CycleReport) {
        match self.telemetry.fetch(FIELD_TARGET_TEMPERATURE) {
            Ok(Some(target)) => {
                info!("target temperature: {:.1}°C", target.value);
                report.target_temperature_c = Some(target.value);
            }
            Ok(None) => debug!("no target temperature on channel"),
            Err(err) => {
                warn!("failed to read target temperature: {err}");
                report.errors.push(err.into());
            }
        }

        match self.telemetry.fetch(FIELD_CLIM_STATUS) {
            Ok(Some(status)) => match ActuatorState::from_command(status.value) {
                Some(command) => {
                    self.apply(command);
                    report.command = Some(command);
                }
                None => {
                    let err = FetchError::Malformed(format!(
                        "clim status `{}` is not a whole number",
                        status.value
                    ));
                    warn!("{err}; keeping {}", self.state.actuator.as_str());
                    report.errors.push(err.into());
                }
            },
            Ok(None) => debug!("no clim status on channel; keeping {}", self.state.actuator.as_str()),
            Err(err) => {
                warn!(
                    "failed to read clim status: {err}; keeping {}",
                    self.state.actuator.as_str()
                );
                report.errors.push(err.into());
            }
        }
    }

    fn apply(&mut self, command: ActuatorState) {
        self.actuator.set(command.on);
        if self.state.actuator != command {
            info!("clim: {}", command.as_str());
        }
        self.state.actuator = command;
    }

    fn sample_and_publish(&mut self, report: &mut CycleReport) {
        let now = self.clock.now();
        let reading = match self.sensor.measure(now) {
            Ok(reading) => reading,
            Err(err) => {
                // Cadence stays armed so the poll is retried next iteration.
                warn!("sensor read failed: {err}");
                report.errors.push(err.into());
                return;
            }
        };
        self.state.publish_cadence.rearm(now);

        let update = sensor_payload(&self.config, &reading);
        match update.get(FIELD_FAKE_CLIM_TEMPERATURE) {
            Some(fake) if self.config.variant == LoopVariant::Heartbeat => info!(
                "temperature: {:.1}°C, humidity: {:.0}%, fake clim temperature: {:.1}°C",
                reading.temperature_c, reading.humidity_pct, fake
            ),
            _ => info!(
                "temperature: {:.1}°C, humidity: {:.0}%",
                reading.temperature_c, reading.humidity_pct
            ),
        }

        match self.telemetry.publish(&update) {
            Ok(ack) => {
                info!("readings stored as entry {}", ack.entry_id);
                report.ack = Some(ack);
            }
            Err(err) => {
                warn!("failed to publish readings: {err}");
                report.errors.push(err.into());
            }
        }

        report.reading = Some(reading);
        report.published = Some(update);
    }

    /// Flips the relay regardless of any remote command and mirrors the new
    /// state to the channel.
    fn toggle_heartbeat(&mut self, report: &mut CycleReport) {
        let next = ActuatorState {
            on: !self.actuator.get(),
        };
        self.actuator.set(next.on);
        self.state.actuator = next;
        debug!("heartbeat: clim {}", next.as_str());

        let update = ChannelUpdate::new().with(FIELD_HEARTBEAT_STATUS, next.as_field_value());
        if let Err(err) = self.telemetry.publish(&update) {
            warn!("failed to publish clim status {}: {err}", next.as_str());
            report.errors.push(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::{PublishError, SensorError},
        telemetry::{testing::FakeTransport, ThingSpeakClient},
        ticks::{testing::ManualClock, Ticks},
        types::{Field, FieldValue},
        TelemetryConfig,
    };

    #[derive(Default)]
    struct FakeSensor {
        script: VecDeque<Result<(f32, f32), SensorError>>,
        polls: u32,
    }

    impl FakeSensor {
        fn returning(values: &[Result<(f32, f32), SensorError>]) -> Self {
            Self {
                script: values.iter().cloned().collect(),
                polls: 0,
            }
        }
    }

    impl Sensor for FakeSensor {
        fn measure(&mut self, now: Ticks) -> Result<Reading, SensorError> {
            self.polls += 1;
            let (temperature_c, humidity_pct) =
                self.script.pop_front().unwrap_or(Ok((21.0, 45.0)))?;
            Ok(Reading {
                temperature_c,
                humidity_pct,
                taken_at: now,
            })
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        on: bool,
        writes: Vec<bool>,
    }

    impl Actuator for FakeRelay {
        fn set(&mut self, on: bool) {
            self.on = on;
            self.writes.push(on);
        }

        fn get(&self) -> bool {
            self.on
        }
    }

    #[derive(Default)]
    struct FakeTelemetry {
        fetches: HashMap<Field, VecDeque<Result<Option<FieldValue>, FetchError>>>,
        publish_results: VecDeque<Result<Ack, PublishError>>,
        published: Vec<ChannelUpdate>,
    }

    impl FakeTelemetry {
        fn on_fetch(mut self, field: Field, result: Result<Option<FieldValue>, FetchError>) -> Self {
            self.fetches.entry(field).or_default().push_back(result);
            self
        }

        fn on_publish(mut self, result: Result<Ack, PublishError>) -> Self {
            self.publish_results.push_back(result);
            self
        }
    }

    impl Telemetry for FakeTelemetry {
        fn publish(&mut self, update: &ChannelUpdate) -> Result<Ack, PublishError> {
            self.published.push(update.clone());
            self.publish_results
                .pop_front()
                .unwrap_or(Ok(Ack { entry_id: 1 }))
        }

        fn fetch(&mut self, field: Field) -> Result<Option<FieldValue>, FetchError> {
            self.fetches
                .get_mut(&field)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(None))
        }
    }

    fn config(variant: LoopVariant) -> ControlConfig {
        ControlConfig {
            variant,
            ..ControlConfig::default()
        }
    }

    fn status(value: f32) -> Result<Option<FieldValue>, FetchError> {
        Ok(Some(FieldValue::new(value)))
    }

    #[test]
    fn starts_with_relay_off() {
        let clock = ManualClock::starting_at(0);
        let relay = FakeRelay {
            on: true,
            writes: Vec::new(),
        };
        let control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            relay,
            FakeTelemetry::default(),
            &clock,
        );

        assert_eq!(control.actuator().writes, vec![false]);
        assert_eq!(control.state().actuator, ActuatorState::OFF);
    }

    #[test]
    fn heartbeat_publishes_readings_and_clamped_temperature() {
        let clock = ManualClock::starting_at(0);
        let mut control = ControlLoop::new(
            config(LoopVariant::Heartbeat),
            FakeSensor::returning(&[Ok((22.5, 48.0)), Ok((35.0, 40.0))]),
            FakeRelay::default(),
            FakeTelemetry::default(),
            &clock,
        );

        clock.advance(5_000);
        let first = control.step();
        clock.advance(5_000);
        let second = control.step();

        assert_eq!(
            first.published,
            Some(
                ChannelUpdate::new()
                    .with(Field::new(1), 22.5)
                    .with(Field::new(2), 48.0)
                    .with(Field::new(3), 22.5)
            )
        );
        assert_eq!(
            second.published,
            Some(
                ChannelUpdate::new()
                    .with(Field::new(1), 35.0)
                    .with(Field::new(2), 40.0)
                    .with(Field::new(3), 30.0)
            )
        );
    }

    #[test]
    fn remote_command_publishes_unmodified_readings() {
        let clock = ManualClock::starting_at(0);
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::returning(&[Ok((35.0, 40.0))]),
            FakeRelay::default(),
            FakeTelemetry::default(),
            &clock,
        );

        clock.advance(5_000);
        let report = control.step();

        assert_eq!(
            report.published,
            Some(
                ChannelUpdate::new()
                    .with(FIELD_TEMPERATURE, 35.0)
                    .with(FIELD_HUMIDITY, 40.0)
            )
        );
        assert_eq!(report.ack, Some(Ack { entry_id: 1 }));
    }

    #[test]
    fn polls_sensor_once_per_interval() {
        let clock = ManualClock::starting_at(u32::MAX - 3_000);
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            FakeRelay::default(),
            FakeTelemetry::default(),
            &clock,
        );

        let mut publishes = 0;
        for _ in 0..16 {
            let report = control.step();
            if report.published.is_some() {
                publishes += 1;
            }
            clock.advance(1_000);
        }

        // Steps run at +0s..+15s, readings go out at +5s, +10s and +15s.
        assert_eq!(publishes, 3);
        assert_eq!(control.telemetry().published.len(), 3);
    }

    #[test]
    fn applies_remote_command() {
        let clock = ManualClock::starting_at(0);
        let telemetry = FakeTelemetry::default()
            .on_fetch(FIELD_TARGET_TEMPERATURE, status(24.0))
            .on_fetch(FIELD_CLIM_STATUS, status(1.0))
            .on_fetch(FIELD_CLIM_STATUS, status(0.0));
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            FakeRelay::default(),
            telemetry,
            &clock,
        );

        let first = control.step();
        assert_eq!(first.target_temperature_c, Some(24.0));
        assert_eq!(first.command, Some(ActuatorState::ON));
        assert!(control.actuator().on);

        let second = control.step();
        assert_eq!(second.actuator, ActuatorState::OFF);
        assert!(!control.actuator().on);
    }

    #[test]
    fn failed_fetch_keeps_actuator_state() {
        let clock = ManualClock::starting_at(0);
        let telemetry = FakeTelemetry::default()
            .on_fetch(FIELD_CLIM_STATUS, status(1.0))
            .on_fetch(FIELD_CLIM_STATUS, Err(FetchError::Timeout))
            .on_fetch(FIELD_CLIM_STATUS, Ok(None));
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            FakeRelay::default(),
            telemetry,
            &clock,
        );

        control.step();
        let failed = control.step();
        let empty = control.step();

        assert_eq!(failed.errors, vec![NodeError::Fetch(FetchError::Timeout)]);
        assert_eq!(failed.actuator, ActuatorState::ON);
        assert_eq!(empty.actuator, ActuatorState::ON);
        assert!(empty.errors.is_empty());
        assert!(control.actuator().on);
        assert_eq!(control.actuator().writes, vec![false, true]);
    }

    #[test]
    fn non_integer_status_keeps_actuator_state() {
        let clock = ManualClock::starting_at(0);
        let telemetry = FakeTelemetry::default()
            .on_fetch(FIELD_CLIM_STATUS, status(1.0))
            .on_fetch(FIELD_CLIM_STATUS, status(0.5))
            .on_fetch(FIELD_CLIM_STATUS, status(2.0));
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            FakeRelay::default(),
            telemetry,
            &clock,
        );

        control.step();
        let fractional = control.step();
        assert_eq!(fractional.command, None);
        assert_eq!(fractional.actuator, ActuatorState::ON);
        assert!(matches!(
            fractional.errors.as_slice(),
            [NodeError::Fetch(FetchError::Malformed(_))]
        ));
        assert_eq!(fractional.next_delay, Duration::from_millis(1_000));

        let two = control.step();
        assert_eq!(two.command, Some(ActuatorState::OFF));
        assert!(!control.actuator().on);
    }

    #[test]
    fn malformed_target_leaves_relay_and_loop_running() {
        let clock = ManualClock::starting_at(0);
        let transport = FakeTransport::default()
            .reply(200, r#"{"entry_id":7,"field4":"1"}"#)
            .reply(200, r#"{"entry_id":7,"field3":"1"}"#)
            .reply(200, "{\"field4\": oops")
            .reply(200, r#"{"entry_id":8,"field3":"1"}"#);
        let telemetry = ThingSpeakClient::new(
            &TelemetryConfig {
                channel_id: 2_791_799,
                write_api_key: "W".to_string(),
                read_api_key: "R".to_string(),
                ..TelemetryConfig::default()
            },
            transport,
        );
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::default(),
            FakeRelay::default(),
            telemetry,
            &clock,
        );

        let first = control.step();
        let second = control.step();

        assert_eq!(first.actuator, ActuatorState::ON);
        assert!(matches!(
            second.errors.as_slice(),
            [NodeError::Fetch(FetchError::Malformed(_))]
        ));
        assert_eq!(second.target_temperature_c, None);
        assert_eq!(second.actuator, ActuatorState::ON);
        assert_eq!(second.next_delay, Duration::from_millis(1_000));
        assert!(control.actuator().on);
    }

    #[test]
    fn publish_failure_does_not_stop_loop() {
        let clock = ManualClock::starting_at(0);
        let telemetry = FakeTelemetry::default()
            .on_publish(Err(PublishError::Rejected))
            .on_publish(Ok(Ack { entry_id: 9 }));
        let mut control_config = config(LoopVariant::RemoteCommand);
        control_config.error_delay_ms = 2_500;
        let mut control = ControlLoop::new(
            control_config,
            FakeSensor::default(),
            FakeRelay::default(),
            telemetry,
            &clock,
        );

        let mut reports = Vec::new();
        control.run_while(|report| {
            reports.push(report.clone());
            reports.len() < 12
        });

        let failed = reports
            .iter()
            .find(|report| !report.errors.is_empty())
            .unwrap();
        assert_eq!(
            failed.errors,
            vec![NodeError::Publish(PublishError::Rejected)]
        );
        assert_eq!(failed.next_delay, Duration::from_millis(2_500));
        assert!(reports
            .iter()
            .any(|report| report.ack == Some(Ack { entry_id: 9 })));
    }

    #[test]
    fn sensor_error_retries_next_iteration() {
        let clock = ManualClock::starting_at(0);
        let mut control = ControlLoop::new(
            config(LoopVariant::RemoteCommand),
            FakeSensor::returning(&[Err(SensorError::Checksum), Ok((23.0, 50.0))]),
            FakeRelay::default(),
            FakeTelemetry::default(),
            &clock,
        );

        clock.advance(5_000);
        let failed = control.step();
        clock.advance(1_000);
        let retried = control.step();

        assert_eq!(failed.errors, vec![NodeError::Sensor(SensorError::Checksum)]);
        assert_eq!(failed.published, None);
        assert_eq!(retried.published.and_then(|u| u.get(FIELD_TEMPERATURE)), Some(23.0));
        assert_eq!(control.state().publish_cadence.last(), Ticks::from_millis(6_000));
        assert!(control.telemetry().published.len() == 1);
    }

    #[test]
    fn heartbeat_flips_relay_every_iteration() {
        let clock = ManualClock::starting_at(0);
        let mut control = ControlLoop::new(
            config(LoopVariant::Heartbeat),
            FakeSensor::default(),
            FakeRelay::default(),
            FakeTelemetry::default().on_fetch(FIELD_CLIM_STATUS, status(0.0)),
            &clock,
        );

        let states: Vec<bool> = (0..4).map(|_| control.step().actuator.on).collect();

        assert_eq!(states, vec![true, false, true, false]);
        let mirrored: Vec<Option<f32>> = control
            .telemetry()
            .published
            .iter()
            .map(|update| update.get(FIELD_HEARTBEAT_STATUS))
            .collect();
        assert_eq!(mirrored, vec![Some(1.0), Some(0.0), Some(1.0), Some(0.0)]);
    }
}
